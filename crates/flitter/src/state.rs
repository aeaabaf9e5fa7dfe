//! Persistent program state: the key/value store read by lookups and
//! written by controls and `StoreGlobal`.

use std::{collections::BTreeMap, fs, io::Write, path::Path};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{errors::EngineError, values::Vector};

/// A dictionary from vector keys to vector values with a dirty flag.
///
/// The flag is raised by any insert or by writing a value different from the
/// stored one; storing an equal value is a no-op. The frame scheduler reads
/// and clears the flag to drive re-specialization and persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDict {
    entries: AHashMap<Vector, Vector>,
    #[serde(skip)]
    dirty: bool,
}

impl StateDict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored value, or null on a miss.
    #[must_use]
    pub fn get(&self, key: &Vector) -> Vector {
        self.entries.get(key).cloned().unwrap_or_else(Vector::null)
    }

    #[must_use]
    pub fn contains(&self, key: &Vector) -> bool {
        self.entries.contains_key(key)
    }

    /// Stores `value`, returning whether anything changed.
    pub fn set(&mut self, key: Vector, value: Vector) -> bool {
        if self.entries.get(&key) == Some(&value) {
            return false;
        }
        self.entries.insert(key, value);
        self.dirty = true;
        true
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Reads and clears the dirty flag.
    pub fn clear_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Removes every key except single-symbol keys starting with an
    /// underscore, which carry engine internals across resets.
    pub fn reset(&mut self) {
        let before = self.entries.len();
        self.entries.retain(|key, _| match key {
            Vector::Symbols(syms) => syms.len() == 1 && syms[0].as_str().starts_with('_'),
            _ => false,
        });
        if self.entries.len() != before {
            self.dirty = true;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vector, &Vector)> {
        self.entries.iter()
    }
}

/// Per-page state dictionaries, snapshotted to the state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalState {
    pub pages: BTreeMap<usize, StateDict>,
}

impl GlobalState {
    /// Writes the snapshot atomically: serialize to a sibling temp file,
    /// then rename over the target.
    pub fn dump(&self, path: &Path) -> Result<(), EngineError> {
        let bytes = postcard::to_allocvec(self).map_err(|e| EngineError::StateFile(e.to_string()))?;
        let temp = path.with_extension("tmp");
        let mut file = fs::File::create(&temp).map_err(|e| EngineError::StateFile(e.to_string()))?;
        file.write_all(&bytes).map_err(|e| EngineError::StateFile(e.to_string()))?;
        file.sync_all().map_err(|e| EngineError::StateFile(e.to_string()))?;
        fs::rename(&temp, path).map_err(|e| EngineError::StateFile(e.to_string()))?;
        debug!(path = %path.display(), bytes = bytes.len(), "state snapshot written");
        Ok(())
    }

    /// Loads a snapshot, tolerating a missing or unreadable file.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(bytes) => match postcard::from_bytes(&bytes) {
                Ok(state) => {
                    debug!(path = %path.display(), "state snapshot recovered");
                    state
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "state snapshot unreadable, starting fresh");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}
