//! Dispatcher - the single task that turns key releases into commands
//!
//! Owns the keymap, the chord buffer, and the global lock. Key releases from
//! every reader arrive on one channel; triggers and reloads from the HTTP layer
//! arrive through a [`DispatcherHandle`]. Everything runs serially on this task,
//! including command execution, so only one chord is ever in flight.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::chord::{self, ChordState, Effect};
use crate::device::KeyRelease;
use crate::executor::{CommandError, CommandRunner};
use crate::key::{CommandKind, KeyModel};
use crate::keymap::{normalize, Keymap, KeymapError};

/// How long a partial chord waits for another key
pub const DEBOUNCE: Duration = Duration::from_millis(500);

const LOCKED_HEADER: &str = "X-Keys-Locked";
const STATE_HEADER: &str = "X-Keys-State";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Run commands for resolved chords
    #[default]
    Normal,
    /// Describe each key release instead of running anything
    Diagnostic,
}

/// What dispatching a chord did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ran,
    Locked,
    Unlocked,
    /// Dropped because the keyboard is locked
    Suppressed,
}

/// Hint for the sound layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundCue {
    Confirmation,
    Toggle,
    Lock,
    Unlock,
    Error,
}

/// Result of a dispatched chord, shaped for the HTTP trigger endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerResponse {
    /// Name of the key that handled the chord
    pub key: String,
    pub outcome: Outcome,
    pub body: String,
    /// Lock state, set only when the dispatch changed or was blocked by it
    pub locked: Option<bool>,
    /// Toggle label after the dispatch, for keys that toggle
    pub state: Option<String>,
    pub show_output: bool,
    pub cue: Option<SoundCue>,
}

impl TriggerResponse {
    pub fn content_type(&self) -> &'static str {
        if self.body.contains('<') && self.body.contains('>') {
            "text/html"
        } else {
            "text/plain"
        }
    }

    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let Some(locked) = self.locked {
            headers.push((LOCKED_HEADER, if locked { "1" } else { "0" }.to_string()));
        }
        if let Some(state) = &self.state {
            headers.push((STATE_HEADER, state.clone()));
        }
        headers
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid key: {0}")]
    UnknownKey(String),
    #[error("{source}")]
    Command {
        #[source]
        source: CommandError,
        cue: Option<SoundCue>,
    },
    #[error(transparent)]
    Keymap(#[from] KeymapError),
    #[error("dispatcher is not running")]
    Unavailable,
}

/// Everything the dispatcher produced, for whoever displays or relays it
#[derive(Debug)]
pub enum Report {
    /// Diagnostic description of a key release
    Echo(String),
    Dispatched {
        chord: String,
        result: Result<TriggerResponse, DispatchError>,
    },
    /// Key release dropped while locked
    Discarded { code: String },
}

enum Request {
    Trigger {
        chord: String,
        reply: oneshot::Sender<Result<TriggerResponse, DispatchError>>,
    },
    Reload {
        reply: oneshot::Sender<Result<(), DispatchError>>,
    },
    Keys {
        reply: oneshot::Sender<Vec<KeyModel>>,
    },
}

/// Cloneable handle for the server side: trigger chords, reload, list keys
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Request>,
}

impl DispatcherHandle {
    /// Dispatch a chord by section name or raw code names, as the trigger endpoint does
    pub async fn trigger(&self, chord: &str) -> Result<TriggerResponse, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Trigger {
                chord: chord.to_string(),
                reply,
            })
            .await
            .map_err(|_| DispatchError::Unavailable)?;
        rx.await.map_err(|_| DispatchError::Unavailable)?
    }

    /// Re-read the keymap file on the dispatcher task
    pub async fn reload(&self) -> Result<(), DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Reload { reply })
            .await
            .map_err(|_| DispatchError::Unavailable)?;
        rx.await.map_err(|_| DispatchError::Unavailable)?
    }

    /// Snapshot of the configured keys, with rows and current toggle positions
    pub async fn keys(&self) -> Result<Vec<KeyModel>, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Keys { reply })
            .await
            .map_err(|_| DispatchError::Unavailable)?;
        rx.await.map_err(|_| DispatchError::Unavailable)
    }
}

pub struct Dispatcher {
    keymap: Keymap,
    runner: Arc<dyn CommandRunner>,
    mode: Mode,
    debounce: Duration,
    chord: ChordState,
    keyboard: watch::Sender<String>,
    reports: mpsc::UnboundedSender<Report>,
    requests: mpsc::Receiver<Request>,
}

impl Dispatcher {
    pub fn new(
        keymap: Keymap,
        runner: Arc<dyn CommandRunner>,
        reports: mpsc::UnboundedSender<Report>,
    ) -> (Self, DispatcherHandle) {
        let (tx, requests) = mpsc::channel(16);
        let (keyboard, _) = watch::channel(keymap.designated_keyboard().to_string());

        let dispatcher = Self {
            keymap,
            runner,
            mode: Mode::default(),
            debounce: DEBOUNCE,
            chord: ChordState::default(),
            keyboard,
            reports,
            requests,
        };
        (dispatcher, DispatcherHandle { tx })
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Designated keyboard path, updated on every reload
    pub fn subscribe_keyboard(&self) -> watch::Receiver<String> {
        self.keyboard.subscribe()
    }

    pub fn keymap_mut(&mut self) -> &mut Keymap {
        &mut self.keymap
    }

    pub fn is_locked(&self) -> bool {
        self.chord.locked
    }

    /// Main loop. Runs until cancelled or until every reader is gone.
    pub async fn run(mut self, mut events: mpsc::Receiver<KeyRelease>, cancel: CancellationToken) {
        log::info!("Dispatcher started ({:?} mode)", self.mode);

        let mut deadline: Option<Instant> = None;
        let mut requests_open = true;

        loop {
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                request = self.requests.recv(), if requests_open => match request {
                    Some(request) => self.handle_request(request).await,
                    None => requests_open = false,
                },

                event = events.recv() => match event {
                    Some(release) => self.handle_release(release, &mut deadline).await,
                    None => {
                        log::info!("Event channel closed");
                        break;
                    }
                },

                _ = timer => {
                    deadline = None;
                    self.apply(chord::Event::DebounceElapsed, &mut deadline).await;
                }
            }
        }

        log::info!("Dispatcher stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Trigger { chord, reply } => {
                log::info!("Trigger requested for {}", chord);
                let result = self.dispatch(&chord).await;
                let _ = reply.send(result);
            }
            Request::Reload { reply } => {
                let _ = reply.send(self.reload());
            }
            Request::Keys { reply } => {
                let _ = reply.send(self.keymap.keys().cloned().collect());
            }
        }
    }

    fn reload(&mut self) -> Result<(), DispatchError> {
        if let Err(e) = self.keymap.reload() {
            log::error!("Error during reload: {}", e);
            return Err(e.into());
        }
        self.keyboard
            .send_replace(self.keymap.designated_keyboard().to_string());
        log::debug!("Keymap generation {} is live", self.keymap.generation());
        Ok(())
    }

    async fn handle_release(&mut self, release: KeyRelease, deadline: &mut Option<Instant>) {
        if self.mode == Mode::Diagnostic {
            let text = self.echo(&release);
            self.report(Report::Echo(text));
            return;
        }

        let code = normalize(&release.code);
        self.apply(chord::Event::KeyReleased { code }, deadline).await;
    }

    /// Feed the chord reducer and carry out its effects
    async fn apply(&mut self, event: chord::Event, deadline: &mut Option<Instant>) {
        let keymap = &self.keymap;
        let (next, effects) =
            chord::reduce(&self.chord, event, &|c: &str| keymap.is_physical_key_prefix(c));
        self.chord = next;

        for effect in effects {
            match effect {
                Effect::CancelTimer => *deadline = None,
                Effect::ArmTimer => *deadline = Some(Instant::now() + self.debounce),
                Effect::Discard { code } => {
                    log::info!("Ignoring keypress of {} because keyboard is locked", code);
                    self.report(Report::Discarded { code });
                }
                Effect::Dispatch { chord } => {
                    let result = self.dispatch(&chord).await;
                    if matches!(result, Err(DispatchError::UnknownKey(_))) {
                        log::debug!("No key mapped to {}", chord);
                        continue;
                    }
                    self.report(Report::Dispatched { chord, result });
                }
            }
        }
    }

    /// Dispatch step: resolve the chord, then lock, unlock, or run its key.
    ///
    /// The key toggles only after its command succeeds. While locked, only lock
    /// and unlock keys get through.
    pub async fn dispatch(&mut self, chord: &str) -> Result<TriggerResponse, DispatchError> {
        let sound = self.keymap.sound_allowed();
        let locked = self.chord.locked;
        let runner = Arc::clone(&self.runner);

        let Some(key) = self.keymap.find_key(chord) else {
            return Err(DispatchError::UnknownKey(chord.to_string()));
        };

        let cue = |cue: SoundCue| sound.then_some(cue);

        match key.command_kind() {
            kind @ (CommandKind::Lock | CommandKind::Unlock) => {
                let lock = kind == CommandKind::Lock;
                key.toggle();
                let response = TriggerResponse {
                    key: key.name.clone(),
                    outcome: if lock { Outcome::Locked } else { Outcome::Unlocked },
                    body: if lock { "Keyboard locked" } else { "Keyboard unlocked" }.to_string(),
                    locked: Some(lock),
                    state: toggle_state(key),
                    show_output: key.show_output,
                    cue: cue(if lock { SoundCue::Lock } else { SoundCue::Unlock }),
                };

                self.set_locked(lock);
                log::info!("Keyboard {}", if lock { "locked" } else { "unlocked" });
                Ok(response)
            }

            CommandKind::Normal if locked => {
                log::info!("Ignoring {} because keyboard is locked", key.name);
                Ok(TriggerResponse {
                    key: key.name.clone(),
                    outcome: Outcome::Suppressed,
                    body: String::new(),
                    locked: Some(true),
                    state: None,
                    show_output: false,
                    cue: None,
                })
            }

            CommandKind::Normal => match key.run_command(runner.as_ref()).await {
                Ok(stdout) => {
                    key.toggle();
                    let toggles = key.can_toggle();
                    Ok(TriggerResponse {
                        key: key.name.clone(),
                        outcome: Outcome::Ran,
                        body: stdout,
                        locked: None,
                        state: toggle_state(key),
                        show_output: key.show_output,
                        cue: if toggles {
                            cue(SoundCue::Toggle)
                        } else if key.confirmation {
                            cue(SoundCue::Confirmation)
                        } else {
                            None
                        },
                    })
                }
                Err(source) => {
                    log::warn!("Command for {} failed: {}", key.name, source);
                    Err(DispatchError::Command {
                        source,
                        cue: cue(SoundCue::Error),
                    })
                }
            },
        }
    }

    fn set_locked(&mut self, locked: bool) {
        let (next, _) = chord::reduce(
            &self.chord,
            chord::Event::LockChanged { locked },
            &|_: &str| false,
        );
        self.chord = next;
    }

    /// Diagnostic description of a key release
    fn echo(&mut self, release: &KeyRelease) -> String {
        let mapped = self
            .keymap
            .find_key(&release.code)
            .map(|k| k.name.clone())
            .unwrap_or_else(|| "none".to_string());

        format!(
            "\nCode: {}\nFrom: {}\nTranslated to: {}\nMapped to: {}\n",
            release.code,
            release.device.display(),
            normalize(&release.code),
            mapped
        )
    }

    fn report(&self, report: Report) {
        // Nobody listening is fine; reports are informational
        let _ = self.reports.send(report);
    }
}

fn toggle_state(key: &KeyModel) -> Option<String> {
    key.can_toggle().then(|| key.current_state().to_string())
}
