//! Keymap file persistence
//!
//! The keymap is a JSON document with a couple of global settings and an
//! ordered list of sections. Parsing is lenient where the desktop UI is
//! lenient: unknown fields are ignored and a malformed `sound` value means
//! "sound allowed".

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::KeymapError;
use crate::key::DEFAULT_TIMEOUT_SECS;

/// Sections whose name starts with this marker are row separators
pub const ROW_MARKER: &str = "--";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeymapFile {
    /// Device path of the keyboard to grab. Empty means listen to every keyboard.
    pub keyboard: String,

    /// Kept as a raw value so that anything but `false` allows sound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<serde_json::Value>,

    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_key: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state: Vec<String>,

    /// Seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_true")]
    pub output: bool,

    #[serde(default)]
    pub confirmation: bool,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

impl Section {
    /// Row label if this section is a row separator
    pub fn row_label(&self) -> Option<&str> {
        if self.name.starts_with(ROW_MARKER) {
            Some(self.name.trim_matches('-'))
        } else {
            None
        }
    }
}

impl KeymapFile {
    pub fn sound_allowed(&self) -> bool {
        !matches!(self.sound, Some(serde_json::Value::Bool(false)))
    }

    pub fn parse(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(contents)
    }

    /// Load from disk. A missing file is an empty keymap, not an error.
    pub fn load(path: &Path) -> Result<Self, KeymapError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).map_err(|source| KeymapError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("Keymap {:?} does not exist yet, starting empty", path);
                Ok(Self::default())
            }
            Err(source) => Err(KeymapError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Write atomically: temp file in the same directory, then rename over the target.
    pub fn save(&self, path: &Path) -> Result<(), KeymapError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| KeymapError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let contents = serde_json::to_string_pretty(self).map_err(KeymapError::Serialize)?;

        let tmp_path = temp_path(path);
        std::fs::write(&tmp_path, contents).map_err(|source| KeymapError::Write {
            path: tmp_path.clone(),
            source,
        })?;

        if let Err(source) = std::fs::rename(&tmp_path, path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(KeymapError::Write {
                path: path.to_path_buf(),
                source,
            });
        }
        Ok(())
    }

    /// Record a designated keyboard and persist the file
    pub fn set_keyboard(&mut self, device: &str, path: &Path) -> Result<(), KeymapError> {
        self.keyboard = device.to_string();
        self.save(path)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_defaults() {
        let file = KeymapFile::parse(r#"{"sections": [{"name": "a", "command": ["echo a"]}]}"#)
            .unwrap();
        let section = &file.sections[0];

        assert_eq!(section.timeout, 10);
        assert!(section.output);
        assert!(!section.confirmation);
        assert!(section.state.is_empty());
        assert_eq!(file.keyboard, "");
    }

    #[test]
    fn test_sound_setting_is_lenient() {
        let cases = [
            (r#"{"sound": false}"#, false),
            (r#"{"sound": true}"#, true),
            (r#"{"sound": "nope"}"#, true),
            (r#"{}"#, true),
        ];

        for (json, want) in cases {
            let file = KeymapFile::parse(json).unwrap();
            assert_eq!(file.sound_allowed(), want, "sound for {json}");
        }
    }

    #[test]
    fn test_row_separators() {
        let file = KeymapFile::parse(r#"{"sections": [{"name": "--Media--"}, {"name": "x"}]}"#)
            .unwrap();
        assert_eq!(file.sections[0].row_label(), Some("Media"));
        assert_eq!(file.sections[1].row_label(), None);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = KeymapFile::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(file, KeymapFile::default());
    }

    #[test]
    fn test_malformed_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            KeymapFile::load(&path),
            Err(KeymapError::Parse { .. })
        ));
    }

    #[test]
    fn test_set_keyboard_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        let mut file = KeymapFile::parse(r#"{"sections": [{"name": "a", "command": ["echo a"]}]}"#)
            .unwrap();
        file.set_keyboard("/keyboard-here", &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("/keyboard-here"));
        assert!(!dir.path().join("keys.json.tmp").exists());

        let reloaded = KeymapFile::load(&path).unwrap();
        assert_eq!(reloaded, file);
    }
}
