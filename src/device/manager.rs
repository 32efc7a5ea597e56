//! Listener manager - discovers keyboards, runs one reader per device, and
//! restarts the whole cycle when a reader fails

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use evdev::{Device, InputEventKind};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{code_name, device_name, KeyRelease};

/// Stable-by-id device namespace
pub const DEVICE_DIR: &str = "/dev/input/by-id";

/// Keyboards in [`DEVICE_DIR`] end with this suffix
pub const DEVICE_SUFFIX: &str = "-event-kbd";

/// Back-off before rediscovering after no keyboard or a reader failure
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// evdev value for a key release (1 = press, 2 = repeat)
const KEY_RELEASED: i32 = 0;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(
        "current user doesn't belong to the input group; \
         run `sudo usermod -aG input $USER` and log back in"
    )]
    NotInInputGroup,
    #[error("failed to check input group membership: {0}")]
    PermissionCheck(#[source] io::Error),
    #[error("failed to list keyboards in {dir:?}: {source}")]
    List {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open device {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to grab device {path:?}: {source}")]
    Grab {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("device read error for {path:?} (disconnected?): {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("reader for a device stopped unexpectedly: {0}")]
    ReaderPanicked(String),
}

/// Find candidate keyboards in the by-id namespace
pub fn list_devices() -> Result<Vec<PathBuf>, DeviceError> {
    list_devices_in(Path::new(DEVICE_DIR))
}

/// Entries of `dir` matching `*-event-kbd`, sorted. A missing directory means no keyboards.
pub fn list_devices_in(dir: &Path) -> Result<Vec<PathBuf>, DeviceError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(DeviceError::List {
                dir: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut devices: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(DEVICE_SUFFIX))
        })
        .collect();
    devices.sort();
    Ok(devices)
}

/// Source of keyboard events. The evdev implementation is used in production;
/// tests substitute fakes.
#[async_trait]
pub trait InputBackend: Send + Sync + 'static {
    /// Candidate device paths for this discovery cycle
    fn candidates(&self) -> Result<Vec<PathBuf>, DeviceError>;

    /// Publish key releases from `path` until cancelled or the channel closes.
    ///
    /// Returns `Ok` on cancellation or a closed channel, `Err` when the device fails.
    /// With `grab`, no other process receives this device's events while listening.
    async fn listen(
        &self,
        path: PathBuf,
        grab: bool,
        tx: mpsc::Sender<KeyRelease>,
        cancel: CancellationToken,
    ) -> Result<(), DeviceError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EvdevBackend;

#[async_trait]
impl InputBackend for EvdevBackend {
    fn candidates(&self) -> Result<Vec<PathBuf>, DeviceError> {
        list_devices()
    }

    async fn listen(
        &self,
        path: PathBuf,
        grab: bool,
        tx: mpsc::Sender<KeyRelease>,
        cancel: CancellationToken,
    ) -> Result<(), DeviceError> {
        let name = device_name(&path);

        let mut device = Device::open(&path).map_err(|source| DeviceError::Open {
            path: path.clone(),
            source,
        })?;

        if grab {
            device.grab().map_err(|source| DeviceError::Grab {
                path: path.clone(),
                source,
            })?;
            log::info!("Grabbed {} for exclusive access", name);
        } else {
            log::info!("Listening for keyboard events on {}", name);
        }

        // The stream owns the device fd; closing it on any return releases the grab
        let mut stream = device
            .into_event_stream()
            .map_err(|source| DeviceError::Open {
                path: path.clone(),
                source,
            })?;

        let result = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    log::debug!("Listener cancelled for {}", name);
                    break Ok(());
                }

                event = stream.next_event() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(source) => break Err(DeviceError::Read { path: path.clone(), source }),
                    };

                    let InputEventKind::Key(key) = event.kind() else {
                        continue;
                    };
                    if event.value() != KEY_RELEASED {
                        continue;
                    }

                    let release = KeyRelease::new(code_name(key), path.clone());
                    log::trace!("Key released on {}: {}", name, release.code);
                    if tx.send(release).await.is_err() {
                        log::debug!("Event channel closed, stopping listener for {}", name);
                        break Ok(());
                    }
                }
            }
        };

        drop(stream);
        if grab {
            log::info!("Released {}", name);
        }
        log::info!("Stopped listening on {}", name);
        result
    }
}

/// How one discovery-and-listen cycle ended
#[derive(Debug)]
enum Cycle {
    NoKeyboard,
    Failed(DeviceError),
    Closed,
    Cancelled,
}

/// Supervises keyboard readers.
///
/// Each cycle discovers devices, filters them against the designated keyboard,
/// and spawns one reader per match. When no device matches or any reader fails,
/// the cycle is torn down and retried after [`RETRY_INTERVAL`], forever.
pub struct ListenerManager<B: InputBackend> {
    backend: Arc<B>,
    keyboard: watch::Receiver<String>,
    tx: mpsc::Sender<KeyRelease>,
    retry: Duration,
    cancel: CancellationToken,
}

impl<B: InputBackend> ListenerManager<B> {
    /// `keyboard` carries the designated device path; empty means every keyboard.
    pub fn new(
        backend: B,
        keyboard: watch::Receiver<String>,
        tx: mpsc::Sender<KeyRelease>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend: Arc::new(backend),
            keyboard,
            tx,
            retry: RETRY_INTERVAL,
            cancel,
        }
    }

    pub fn with_retry_interval(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    /// Run until cancelled or until the dispatcher goes away
    pub async fn run(self) {
        loop {
            match self.cycle().await {
                Cycle::Cancelled => {
                    log::info!("Listener manager cancelled");
                    return;
                }
                Cycle::Closed => {
                    log::info!("Event channel closed, listener manager stopping");
                    return;
                }
                Cycle::NoKeyboard => {
                    log::info!(
                        "Keyboard not found. Will check again in {} seconds.",
                        self.retry.as_secs()
                    );
                }
                Cycle::Failed(e) => {
                    log::warn!(
                        "{}; restarting listeners in {} seconds",
                        e,
                        self.retry.as_secs()
                    );
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    log::info!("Listener manager cancelled");
                    return;
                }
                _ = tokio::time::sleep(self.retry) => {}
            }
        }
    }

    async fn cycle(&self) -> Cycle {
        let designated = self.keyboard.borrow().clone();

        let candidates = match self.backend.candidates() {
            Ok(candidates) => candidates,
            Err(e) => {
                log::warn!("{}", e);
                return Cycle::NoKeyboard;
            }
        };

        let cycle_cancel = self.cancel.child_token();
        let mut readers = JoinSet::new();

        for path in candidates {
            let is_designated = !designated.is_empty() && path == Path::new(&designated);
            if !designated.is_empty() && !is_designated {
                log::info!("Skipping {}", device_name(&path));
                continue;
            }

            let backend = Arc::clone(&self.backend);
            let tx = self.tx.clone();
            let cancel = cycle_cancel.clone();
            readers.spawn(async move { backend.listen(path, is_designated, tx, cancel).await });
        }

        if readers.is_empty() {
            return Cycle::NoKeyboard;
        }
        log::info!("Listening on {} keyboard(s)", readers.len());

        let outcome = match readers.join_next().await {
            Some(Ok(Ok(()))) if self.cancel.is_cancelled() => Cycle::Cancelled,
            Some(Ok(Ok(()))) | None => Cycle::Closed,
            Some(Ok(Err(e))) => Cycle::Failed(e),
            Some(Err(e)) => Cycle::Failed(DeviceError::ReaderPanicked(e.to_string())),
        };

        // Stop the siblings before backing off
        cycle_cancel.cancel();
        while readers.join_next().await.is_some() {}

        outcome
    }
}
