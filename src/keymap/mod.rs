//! Keymap resolver
//!
//! Owns every valid [`KeyModel`] built from the keymap file and turns raw
//! evdev code names (or section names coming from the HTTP layer) into keys.
//!
//! Raw names like `KEY_H,KEY_I` and configured aliases like `hi` are compared
//! after [`normalize`], so resolution and the prefix test always agree.

pub mod file;

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::key::KeyModel;
use file::KeymapFile;

/// Vendor prefix on evdev key code names
const CODE_PREFIX: &str = "KEY_";

#[derive(Debug, Error)]
pub enum KeymapError {
    #[error("failed to read keymap {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse keymap {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize keymap: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write keymap {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Turn a raw code name or chord into its physical-key alias.
///
/// Strips the `KEY_` prefix and comma separators, then lower-cases. Total and
/// idempotent: the output never contains `KEY_` or commas.
pub fn normalize(name: &str) -> String {
    name.replace(CODE_PREFIX, "").replace(',', "").to_lowercase()
}

/// Uncached resolution: exact name first, then normalized physical key
pub fn resolve(keys: &[KeyModel], target: &str) -> Option<usize> {
    if let Some(index) = keys.iter().position(|k| k.name == target) {
        return Some(index);
    }

    let alias = normalize(target);
    keys.iter().position(|k| {
        k.physical_key
            .as_deref()
            .map_or(false, |physical| normalize(physical) == alias)
    })
}

/// Build keys from the file's sections, dropping invalid ones and tagging rows
fn build_keys(file: &KeymapFile) -> Vec<KeyModel> {
    let mut keys = Vec::with_capacity(file.sections.len());
    let mut row: Option<String> = None;

    for section in &file.sections {
        if let Some(label) = section.row_label() {
            row = Some(label.to_string());
            continue;
        }

        match KeyModel::try_from(section) {
            Ok(mut key) => {
                key.row = row.clone();
                keys.push(key);
            }
            Err(e) => log::debug!("Skipping keymap section: {}", e),
        }
    }

    keys
}

#[derive(Debug)]
pub struct Keymap {
    path: PathBuf,
    file: KeymapFile,
    keys: Vec<KeyModel>,
    /// Lookup results by the original target string, misses included
    cache: HashMap<String, Option<usize>>,
    /// Bumped on every reload so stale key references can be detected
    generation: u64,
}

impl Keymap {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, KeymapError> {
        let path = path.into();
        let file = KeymapFile::load(&path)?;
        Ok(Self::from_file(path, file))
    }

    pub fn from_file(path: impl Into<PathBuf>, file: KeymapFile) -> Self {
        let keys = build_keys(&file);
        log::debug!("Keymap has {} usable keys", keys.len());
        Self {
            path: path.into(),
            file,
            keys,
            cache: HashMap::new(),
            generation: 0,
        }
    }

    /// Re-read the file and rebuild every key. On error the current keymap stays live.
    pub fn reload(&mut self) -> Result<(), KeymapError> {
        let file = KeymapFile::load(&self.path)?;
        self.replace(file);
        log::info!("Reloaded keymap {:?} ({} keys)", self.path, self.keys.len());
        Ok(())
    }

    /// Swap in new contents. Every existing key and cached lookup is discarded.
    pub fn replace(&mut self, file: KeymapFile) {
        self.keys = build_keys(&file);
        self.file = file;
        self.cache.clear();
        self.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn designated_keyboard(&self) -> &str {
        &self.file.keyboard
    }

    pub fn sound_allowed(&self) -> bool {
        self.file.sound_allowed()
    }

    /// Valid keys in file order, with rows assigned
    pub fn keys(&self) -> impl Iterator<Item = &KeyModel> {
        self.keys.iter()
    }

    /// Cached lookup of a key by section name or raw code name
    pub fn find_key(&mut self, target: &str) -> Option<&mut KeyModel> {
        let index = match self.cache.get(target) {
            Some(hit) => *hit,
            None => {
                let found = resolve(&self.keys, target);
                self.cache.insert(target.to_string(), found);
                found
            }
        };
        index.and_then(|i| self.keys.get_mut(i))
    }

    /// Number of lookups currently cached
    pub fn cached_lookups(&self) -> usize {
        self.cache.len()
    }

    /// True if some configured physical key strictly extends `candidate`.
    /// An exact match is not a prefix.
    pub fn is_physical_key_prefix(&self, candidate: &str) -> bool {
        let candidate = normalize(candidate);
        self.keys
            .iter()
            .filter_map(|k| k.physical_key.as_deref())
            .map(normalize)
            .any(|physical| physical.len() > candidate.len() && physical.starts_with(&candidate))
    }

    /// Persist a designated keyboard, then rebuild from the saved contents
    pub fn store_keyboard(&mut self, device: &str) -> Result<(), KeymapError> {
        let mut file = self.file.clone();
        file.set_keyboard(device, &self.path)?;
        self.replace(file);
        Ok(())
    }
}
