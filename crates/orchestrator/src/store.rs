//! Key/value attribute storage per entity.
//!
//! Every shared mutation in the orchestrator goes through
//! [`RecordStore::compare_and_swap`], a single-row conditional update.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;

type Records = BTreeMap<String, BTreeMap<String, String>>;

pub trait RecordStore: Send + Sync {
    fn get(&self, entity: &str, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, entity: &str, key: &str, value: &str) -> Result<(), StoreError>;
    fn delete(&self, entity: &str, key: &str) -> Result<bool, StoreError>;
    /// Writes `new` (or deletes when `None`) only if the current value equals
    /// `expected` (`None` meaning absent). Returns whether the swap happened.
    fn compare_and_swap(
        &self,
        entity: &str,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError>;
    fn keys(&self, entity: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Records>, StoreError> {
        self.records.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, entity: &str, key: &str) -> Result<Option<String>, StoreError> {
        Ok(read_value(&*self.lock()?, entity, key))
    }

    fn set(&self, entity: &str, key: &str, value: &str) -> Result<(), StoreError> {
        write_value(&mut *self.lock()?, entity, key, Some(value));
        Ok(())
    }

    fn delete(&self, entity: &str, key: &str) -> Result<bool, StoreError> {
        Ok(write_value(&mut *self.lock()?, entity, key, None))
    }

    fn compare_and_swap(
        &self,
        entity: &str,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut records = self.lock()?;
        if read_value(&records, entity, key).as_deref() != expected {
            return Ok(false);
        }
        write_value(&mut records, entity, key, new);
        Ok(true)
    }

    fn keys(&self, entity: &str) -> Result<Vec<String>, StoreError> {
        Ok(entity_keys(&*self.lock()?, entity))
    }
}

/// A JSON file holding every record. Each mutation rewrites the file through
/// a temporary sibling and a rename, so a crash leaves either the old or the
/// new contents.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    records: Mutex<Records>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let records = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Records::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Records::new(),
            Err(err) => return Err(err.into()),
        };
        tracing::info!(
            event = "store.opened",
            path = %path.display(),
            entities = records.len(),
        );
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Records>, StoreError> {
        self.records.lock().map_err(|_| StoreError::Poisoned)
    }

    fn persist(&self, records: &Records) -> Result<(), StoreError> {
        let payload = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, payload)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl RecordStore for FileStore {
    fn get(&self, entity: &str, key: &str) -> Result<Option<String>, StoreError> {
        Ok(read_value(&*self.lock()?, entity, key))
    }

    fn set(&self, entity: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        write_value(&mut records, entity, key, Some(value));
        self.persist(&records)
    }

    fn delete(&self, entity: &str, key: &str) -> Result<bool, StoreError> {
        let mut records = self.lock()?;
        let removed = write_value(&mut records, entity, key, None);
        if removed {
            self.persist(&records)?;
        }
        Ok(removed)
    }

    fn compare_and_swap(
        &self,
        entity: &str,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut records = self.lock()?;
        if read_value(&records, entity, key).as_deref() != expected {
            return Ok(false);
        }
        let previous = records.clone();
        write_value(&mut records, entity, key, new);
        if let Err(err) = self.persist(&records) {
            *records = previous;
            return Err(err);
        }
        Ok(true)
    }

    fn keys(&self, entity: &str) -> Result<Vec<String>, StoreError> {
        Ok(entity_keys(&*self.lock()?, entity))
    }
}

fn read_value(records: &Records, entity: &str, key: &str) -> Option<String> {
    records.get(entity).and_then(|row| row.get(key)).cloned()
}

/// Returns true when the stored value changed.
fn write_value(records: &mut Records, entity: &str, key: &str, value: Option<&str>) -> bool {
    match value {
        Some(value) => {
            let row = records.entry(entity.to_string()).or_default();
            row.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        }
        None => {
            let Some(row) = records.get_mut(entity) else {
                return false;
            };
            let removed = row.remove(key).is_some();
            if row.is_empty() {
                records.remove(entity);
            }
            removed
        }
    }
}

fn entity_keys(records: &Records, entity: &str) -> Vec<String> {
    records
        .get(entity)
        .map(|row| row.keys().cloned().collect())
        .unwrap_or_default()
}
