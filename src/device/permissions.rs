//! Input device access check
//!
//! Reading `/dev/input` requires membership in the `input` group. Without it
//! the daemon cannot do anything useful, so the check is fatal at startup.

use std::io;

use nix::unistd::{getegid, geteuid, getgroups, Gid, Group};

use super::manager::DeviceError;

/// Group that owns the evdev device nodes
pub const INPUT_GROUP: &str = "input";

/// True if `group` is among the process's group ids
pub fn can_listen(groups: &[Gid], group: Gid) -> bool {
    groups.contains(&group)
}

/// Look up a group id by name
fn group_id(name: &str) -> io::Result<Gid> {
    match Group::from_name(name)? {
        Some(group) => Ok(group.gid),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("group {name} does not exist"),
        )),
    }
}

/// Effective gid plus supplementary groups of this process
fn process_groups() -> io::Result<Vec<Gid>> {
    let mut groups = getgroups()?;
    groups.push(getegid());
    Ok(groups)
}

/// Fail unless this process may read keyboard devices.
/// Root is always allowed.
pub fn ensure_input_access() -> Result<(), DeviceError> {
    if geteuid().is_root() {
        return Ok(());
    }

    let gid = group_id(INPUT_GROUP).map_err(DeviceError::PermissionCheck)?;
    let groups = process_groups().map_err(DeviceError::PermissionCheck)?;

    if can_listen(&groups, gid) {
        Ok(())
    } else {
        Err(DeviceError::NotInInputGroup)
    }
}
