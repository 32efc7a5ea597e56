//! Key model: one configured macro
//!
//! A key binds a chord to one or more shell commands. Keys with more than one
//! command "roll": every successful run advances to the next command, wrapping
//! back to the first. Each rolling command carries a state label so the UI can
//! show which side of the toggle the key is on.

use std::time::Duration;

use thiserror::Error;

use crate::executor::{CommandError, CommandRunner};
use crate::keymap::file::Section;

/// Reserved command that locks the keyboard instead of running anything
pub const LOCK_COMMAND: &str = "lock";

/// Reserved command that unlocks the keyboard instead of running anything
pub const UNLOCK_COMMAND: &str = "unlock";

/// Default wall-clock limit for a command, in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// What a command string means to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// A shell command to run
    Normal,
    /// Reserved `lock` token
    Lock,
    /// Reserved `unlock` token
    Unlock,
}

/// Classify a command string. Only the exact literals `lock` and `unlock` are reserved.
pub fn classify_command(command: &str) -> CommandKind {
    match command {
        LOCK_COMMAND => CommandKind::Lock,
        UNLOCK_COMMAND => CommandKind::Unlock,
        _ => CommandKind::Normal,
    }
}

/// Reasons a configuration section cannot become a key
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("section has no name")]
    MissingName,
    #[error("key {0} has no command")]
    MissingCommand(String),
    #[error("key {0} has a blank command entry")]
    BlankCommand(String),
    #[error("key {name} has {commands} commands but {states} states")]
    StateMismatch {
        name: String,
        commands: usize,
        states: usize,
    },
    #[error("key {name} has {commands} commands, more than a toggle can address")]
    TooManyCommands { name: String, commands: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyModel {
    pub name: String,
    pub label: String,
    pub physical_key: Option<String>,
    commands: Vec<String>,
    states: Vec<String>,
    command_index: u8,
    pub timeout: Duration,
    pub show_output: bool,
    pub confirmation: bool,
    /// Presentation grouping, assigned while iterating the keymap
    pub row: Option<String>,
}

impl KeyModel {
    /// Build a key from its name and command list.
    ///
    /// Fails when there is no usable command, or when a rolling key does not have
    /// exactly one state label per command.
    pub fn new(
        name: impl Into<String>,
        commands: Vec<String>,
        states: Vec<String>,
    ) -> Result<Self, KeyError> {
        let name = name.into();
        if name.is_empty() {
            return Err(KeyError::MissingName);
        }
        if commands.is_empty() {
            return Err(KeyError::MissingCommand(name));
        }
        if commands.iter().any(|c| c.trim().is_empty()) {
            return Err(KeyError::BlankCommand(name));
        }
        if commands.len() > 1 {
            if states.len() != commands.len() {
                return Err(KeyError::StateMismatch {
                    name,
                    commands: commands.len(),
                    states: states.len(),
                });
            }
            if u8::try_from(commands.len() - 1).is_err() {
                return Err(KeyError::TooManyCommands {
                    name,
                    commands: commands.len(),
                });
            }
        }

        Ok(Self {
            label: name.clone(),
            name,
            physical_key: None,
            commands,
            states,
            command_index: 0,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            show_output: true,
            confirmation: false,
            row: None,
        })
    }

    pub fn with_physical_key(mut self, physical_key: impl Into<String>) -> Self {
        self.physical_key = Some(physical_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command_index(&self) -> usize {
        usize::from(self.command_index)
    }

    /// Command at the current index. Empty means "not runnable".
    pub fn current_command(&self) -> &str {
        self.commands
            .get(self.command_index())
            .map(String::as_str)
            .unwrap_or("")
    }

    /// State label at the current index, or empty for keys that don't toggle
    pub fn current_state(&self) -> &str {
        if !self.can_toggle() {
            return "";
        }
        self.states
            .get(self.command_index())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn can_toggle(&self) -> bool {
        self.commands.len() > 1 && u8::try_from(self.commands.len() - 1).is_ok()
    }

    pub fn command_kind(&self) -> CommandKind {
        classify_command(self.current_command())
    }

    /// True when the current command is one of the reserved lock tokens
    pub fn can_lock(&self) -> bool {
        self.command_kind() != CommandKind::Normal
    }

    /// Advance to the next command, wrapping after the last one
    pub fn toggle(&mut self) {
        if !self.can_toggle() {
            return;
        }
        let next = (self.command_index() + 1) % self.commands.len();
        // can_toggle guarantees the length fits in u8
        self.command_index = next as u8;
    }

    /// Run the current command with this key's timeout.
    ///
    /// The index is left alone; callers toggle after a successful run.
    pub async fn run_command(&self, runner: &dyn CommandRunner) -> Result<String, CommandError> {
        let command = self.current_command();
        if command.is_empty() {
            return Err(CommandError::Empty);
        }

        log::info!("Running command for {}: {}", self.name, command);
        runner.run(command, self.timeout).await
    }

    pub fn matches_name(&self, needle: &str) -> bool {
        self.name.contains(needle)
    }

    pub fn matches_command(&self, needle: &str) -> bool {
        self.commands.iter().any(|c| c.contains(needle))
    }

    pub fn matches_physical_key(&self, needle: &str) -> bool {
        self.physical_key
            .as_deref()
            .map_or(false, |k| k.contains(needle))
    }
}

impl TryFrom<&Section> for KeyModel {
    type Error = KeyError;

    fn try_from(section: &Section) -> Result<Self, Self::Error> {
        let mut key = KeyModel::new(
            section.name.clone(),
            section.command.clone(),
            section.state.clone(),
        )?;

        if let Some(label) = section.label.as_deref().filter(|l| !l.is_empty()) {
            key.label = label.to_string();
        }
        key.physical_key = section
            .physical_key
            .clone()
            .filter(|k| !k.trim().is_empty());
        key.timeout = Duration::from_secs(section.timeout);
        key.show_output = section.output;
        key.confirmation = section.confirmation;

        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ShellRunner;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn roll_key() -> KeyModel {
        KeyModel::new(
            "test",
            strings(&["echo hello", "echo hello 2", "echo hello 3"]),
            strings(&["state1", "state2", "state3"]),
        )
        .unwrap()
    }

    #[test]
    fn test_single_command_key_does_not_toggle() {
        let mut key = KeyModel::new("test", strings(&["echo hello"]), vec![]).unwrap();

        assert!(!key.can_toggle());
        assert!(!key.can_lock());
        assert_eq!(key.current_state(), "");

        key.toggle();
        assert_eq!(key.command_index(), 0);
        assert_eq!(key.current_state(), "");
    }

    #[test]
    fn test_command_is_required() {
        assert_eq!(
            KeyModel::new("test", vec![], vec![]),
            Err(KeyError::MissingCommand("test".into()))
        );
        assert_eq!(
            KeyModel::new("test", strings(&["echo a", "  "]), strings(&["a", "b"])),
            Err(KeyError::BlankCommand("test".into()))
        );
    }

    #[test]
    fn test_name_is_required() {
        assert_eq!(
            KeyModel::new("", strings(&["echo a"]), vec![]),
            Err(KeyError::MissingName)
        );
    }

    #[test]
    fn test_roll_cycles_through_commands_and_states() {
        let mut key = roll_key();

        assert_eq!(key.command_index(), 0);
        assert!(key.can_toggle());
        assert!(!key.can_lock());
        assert_eq!(key.current_command(), "echo hello");
        assert_eq!(key.current_state(), "state1");

        key.toggle();
        assert_eq!(key.current_command(), "echo hello 2");
        assert_eq!(key.current_state(), "state2");

        key.toggle();
        assert_eq!(key.current_command(), "echo hello 3");
        assert_eq!(key.current_state(), "state3");

        key.toggle();
        assert_eq!(key.current_command(), "echo hello");
        assert_eq!(key.current_state(), "state1");
    }

    #[test]
    fn test_roll_with_mismatched_states_is_rejected() {
        let result = KeyModel::new(
            "test",
            strings(&["echo a", "echo b"]),
            strings(&["only one"]),
        );
        assert!(matches!(result, Err(KeyError::StateMismatch { .. })));
    }

    #[test]
    fn test_roll_beyond_index_range_is_rejected() {
        let commands: Vec<String> = (0..300).map(|i| format!("echo {i}")).collect();
        let states = commands.clone();
        let result = KeyModel::new("big", commands, states);
        assert!(matches!(result, Err(KeyError::TooManyCommands { .. })));
    }

    #[test]
    fn test_lock_tokens_are_classified() {
        assert_eq!(classify_command("lock"), CommandKind::Lock);
        assert_eq!(classify_command("unlock"), CommandKind::Unlock);
        assert_eq!(classify_command("lock "), CommandKind::Normal);
        assert_eq!(classify_command("echo lock"), CommandKind::Normal);

        let single = KeyModel::new("l", strings(&["lock"]), vec![]).unwrap();
        assert!(single.can_lock());
        let single = KeyModel::new("u", strings(&["unlock"]), vec![]).unwrap();
        assert!(single.can_lock());

        let mut roll = KeyModel::new(
            "lk",
            strings(&["lock", "unlock"]),
            strings(&["locked", "unlocked"]),
        )
        .unwrap();
        assert_eq!(roll.command_kind(), CommandKind::Lock);
        roll.toggle();
        assert_eq!(roll.command_kind(), CommandKind::Unlock);
    }

    #[test]
    fn test_search_helpers_match_substrings() {
        let key = roll_key().with_physical_key("hi");

        assert!(key.matches_command("hello"));
        assert!(key.matches_command("hello 3"));
        assert!(!key.matches_command("x"));

        assert!(key.matches_physical_key("i"));
        assert!(key.matches_physical_key("hi"));
        assert!(!key.matches_physical_key("x"));

        assert!(key.matches_name("est"));
        assert!(key.matches_name("test"));
        assert!(!key.matches_name("x"));
    }

    #[test]
    fn test_section_fields_carry_over() {
        let section = Section {
            name: "mic".into(),
            label: Some("Microphone".into()),
            physical_key: Some("m".into()),
            command: strings(&["echo off"]),
            state: vec![],
            timeout: 3,
            output: false,
            confirmation: true,
        };

        let key = KeyModel::try_from(&section).unwrap();
        assert_eq!(key.label, "Microphone");
        assert_eq!(key.physical_key.as_deref(), Some("m"));
        assert_eq!(key.timeout, Duration::from_secs(3));
        assert!(!key.show_output);
        assert!(key.confirmation);
    }

    #[tokio::test]
    async fn test_run_command_does_not_advance_index() {
        let key = roll_key();

        let stdout = key.run_command(&ShellRunner).await.unwrap();

        assert_eq!(stdout, "hello\n");
        assert_eq!(key.command_index(), 0);
    }

    #[tokio::test]
    async fn test_run_command_times_out() {
        let key = KeyModel::new("slow", strings(&["sleep 5"]), vec![])
            .unwrap()
            .with_timeout(Duration::from_millis(200));

        let result = key.run_command(&ShellRunner).await;

        assert!(matches!(result, Err(CommandError::Timeout { .. })));
        assert_eq!(key.command_index(), 0);
    }
}
