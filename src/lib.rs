pub mod chord;
pub mod device;
pub mod dispatcher;
pub mod executor;
pub mod key;
pub mod keymap;

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use device::manager::DeviceError;
use device::{permissions, EvdevBackend, ListenerManager};
use dispatcher::{Dispatcher, DispatcherHandle, Mode, Report};
use executor::ShellRunner;
use keymap::{Keymap, KeymapError};

/// Default keymap file name inside the config directory
pub const CONFIG_FILE: &str = "keys.json";

/// Capacity of the key release channel shared by all readers
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Keymap(#[from] KeymapError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("no keyboards found in {}", device::manager::DEVICE_DIR)]
    NoKeyboards,
    #[error("invalid selection: {0}")]
    InvalidSelection(String),
    #[error("terminal I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// `<config dir>/keys/keys.json`, or `keys.json` in the working directory
/// when the platform has no config directory
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("keys").join(CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
}

/// Run the daemon until `cancel` fires.
///
/// Checks device permissions, loads the keymap, then starts the listener
/// manager and the dispatcher. SIGHUP reloads the keymap.
pub async fn run(config: &Path, mode: Mode, cancel: CancellationToken) -> Result<(), Error> {
    permissions::ensure_input_access()?;

    let keymap = Keymap::load(config)?;
    log::info!(
        "Loaded {} keys from {}",
        keymap.keys().count(),
        config.display()
    );

    let (reports_tx, reports_rx) = mpsc::unbounded_channel();
    let (dispatcher, handle) = Dispatcher::new(keymap, Arc::new(ShellRunner), reports_tx);
    let dispatcher = dispatcher.with_mode(mode);

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let manager = ListenerManager::new(
        EvdevBackend,
        dispatcher.subscribe_keyboard(),
        tx,
        cancel.child_token(),
    );

    tokio::spawn(manager.run());
    tokio::spawn(print_reports(reports_rx));
    tokio::spawn(reload_on_hangup(handle, cancel.child_token()));

    dispatcher.run(rx, cancel).await;
    Ok(())
}

/// Print dispatcher reports for the operator
async fn print_reports(mut reports: mpsc::UnboundedReceiver<Report>) {
    while let Some(report) = reports.recv().await {
        match report {
            Report::Echo(text) => println!("{}", text),
            Report::Dispatched { chord, result } => match result {
                Ok(response) => {
                    log::info!("{} ran {} ({:?})", chord, response.key, response.outcome);
                    if response.show_output && !response.body.is_empty() {
                        print!("{}", response.body);
                    }
                }
                Err(e) => log::warn!("{} failed: {}", chord, e),
            },
            Report::Discarded { code } => log::debug!("Discarded {}", code),
        }
    }
}

/// Reload the keymap whenever the process gets SIGHUP
async fn reload_on_hangup(handle: DispatcherHandle, cancel: CancellationToken) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            log::warn!("Cannot listen for SIGHUP, reload disabled: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
                log::info!("SIGHUP received, reloading keymap");
                if let Err(e) = handle.reload().await {
                    log::error!("Reload failed: {}", e);
                }
            }
        }
    }
}

/// Persist the designated keyboard.
///
/// With `device` given it is stored as is. Otherwise the candidates are listed
/// on `out` and one is read from `input`; a single candidate is taken without
/// asking.
pub fn select_keyboard(
    config: &Path,
    device: Option<PathBuf>,
    candidates: &[PathBuf],
    input: &mut impl BufRead,
    out: &mut impl Write,
) -> Result<PathBuf, Error> {
    let chosen = match device {
        Some(path) => path,
        None => prompt_for_keyboard(candidates, input, out)?,
    };

    let mut keymap = Keymap::load(config)?;
    keymap.store_keyboard(&chosen.to_string_lossy())?;
    writeln!(out, "Using {} as the keys keyboard", chosen.display())?;
    Ok(chosen)
}

fn prompt_for_keyboard(
    candidates: &[PathBuf],
    input: &mut impl BufRead,
    out: &mut impl Write,
) -> Result<PathBuf, Error> {
    match candidates {
        [] => return Err(Error::NoKeyboards),
        [only] => return Ok(only.clone()),
        _ => {}
    }

    for (i, path) in candidates.iter().enumerate() {
        writeln!(out, "{}) {}", i + 1, device::device_name(path))?;
    }
    write!(out, "Select keyboard [1-{}]: ", candidates.len())?;
    out.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    let answer = line.trim();

    answer
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| candidates.get(i))
        .cloned()
        .ok_or_else(|| Error::InvalidSelection(answer.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keymap::file::KeymapFile;
    use std::io::Cursor;

    fn candidates() -> Vec<PathBuf> {
        vec![
            PathBuf::from("/dev/input/by-id/usb-A-event-kbd"),
            PathBuf::from("/dev/input/by-id/usb-B-event-kbd"),
        ]
    }

    #[test]
    fn test_select_keyboard_prompts() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join(CONFIG_FILE);
        let mut out = Vec::new();

        let chosen = select_keyboard(
            &config,
            None,
            &candidates(),
            &mut Cursor::new("2\n"),
            &mut out,
        )
        .unwrap();

        assert_eq!(chosen, candidates()[1]);
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("1) usb-A-event-kbd"));
        assert!(printed.contains("2) usb-B-event-kbd"));
        assert_eq!(
            KeymapFile::load(&config).unwrap().keyboard,
            "/dev/input/by-id/usb-B-event-kbd"
        );
    }

    #[test]
    fn test_select_keyboard_rejects_bad_answer() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join(CONFIG_FILE);

        for answer in ["0\n", "3\n", "two\n", "\n"] {
            let result = select_keyboard(
                &config,
                None,
                &candidates(),
                &mut Cursor::new(answer),
                &mut Vec::new(),
            );
            assert!(matches!(result, Err(Error::InvalidSelection(_))), "{answer:?}");
        }
        assert!(!config.exists());
    }

    #[test]
    fn test_select_keyboard_single_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join(CONFIG_FILE);
        let only = vec![PathBuf::from("/dev/input/by-id/only-event-kbd")];

        let chosen =
            select_keyboard(&config, None, &only, &mut Cursor::new(""), &mut Vec::new()).unwrap();
        assert_eq!(chosen, only[0]);
    }

    #[test]
    fn test_select_keyboard_explicit_path_keeps_sections() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join(CONFIG_FILE);
        std::fs::write(&config, r#"{"sections": [{"name": "a", "command": ["echo a"]}]}"#).unwrap();

        select_keyboard(
            &config,
            Some(PathBuf::from("/dev/custom")),
            &[],
            &mut Cursor::new(""),
            &mut Vec::new(),
        )
        .unwrap();

        let file = KeymapFile::load(&config).unwrap();
        assert_eq!(file.keyboard, "/dev/custom");
        assert_eq!(file.sections.len(), 1);
    }

    #[test]
    fn test_no_keyboards() {
        let dir = tempfile::tempdir().unwrap();
        let result = select_keyboard(
            &dir.path().join(CONFIG_FILE),
            None,
            &[],
            &mut Cursor::new("1\n"),
            &mut Vec::new(),
        );
        assert!(matches!(result, Err(Error::NoKeyboards)));
    }
}
