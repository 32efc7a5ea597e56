//! Keyboard capture via evdev
//!
//! Readers open keyboards from `/dev/input/by-id`, optionally grab the
//! designated one, and publish key releases onto a single channel for the
//! dispatcher.
//!
//! # Requirements
//! - User must be in the `input` group: `sudo usermod -aG input $USER`
//! - Log out and back in after adding to group

pub mod manager;
pub mod permissions;

use std::path::{Path, PathBuf};

pub use manager::{list_devices, EvdevBackend, InputBackend, ListenerManager};

/// A key release read from one device.
/// Press-then-release is treated as one activation, so presses and auto-repeat are never published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRelease {
    /// Raw evdev code name, e.g. `KEY_A`
    pub code: String,
    /// Device the event came from
    pub device: PathBuf,
}

impl KeyRelease {
    pub fn new(code: impl Into<String>, device: impl Into<PathBuf>) -> Self {
        Self {
            code: code.into(),
            device: device.into(),
        }
    }
}

/// Code name for an evdev key, e.g. `KEY_A`.
///
/// Some keys report a compound name like `KEY_MUTE/KEY_MIN_INTERESTING`; only the first part is kept.
pub fn code_name(key: evdev::Key) -> String {
    let name = format!("{:?}", key);
    match name.split_once('/') {
        Some((first, _)) => first.to_string(),
        None => name,
    }
}

/// Short display name for a device path
pub fn device_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
