//! Key-value property store.
//!
//! Small string values the engine keeps between passes (watermarks, the
//! sync-pair registry, the stop flag). One store per principal.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{MirrorError, MirrorResult};

const PROPERTIES_FILE: &str = "properties.json";

pub trait PropertyStore: Send + Sync {
    fn get(&self, key: &str) -> MirrorResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> MirrorResult<()>;
    fn delete(&self, key: &str) -> MirrorResult<()>;
}

impl<P: PropertyStore + ?Sized> PropertyStore for Arc<P> {
    fn get(&self, key: &str) -> MirrorResult<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> MirrorResult<()> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &str) -> MirrorResult<()> {
        (**self).delete(key)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryProperties {
    values: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryProperties {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock().clone()
    }
}

impl PropertyStore for MemoryProperties {
    fn get(&self, key: &str) -> MirrorResult<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> MirrorResult<()> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> MirrorResult<()> {
        self.lock().remove(key);
        Ok(())
    }
}

/// Properties kept in a JSON object on disk.
///
/// Every write rewrites the whole file through a temporary file and a
/// rename, so a crash never leaves a half-written store behind. The file is
/// re-read on every access so that separate processes see each other's
/// writes.
#[derive(Debug)]
pub struct FileProperties {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileProperties {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileProperties {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// `properties.json` under the user's data directory.
    pub fn default_path() -> MirrorResult<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| MirrorError::Config("Could not determine data directory".into()))?
            .join("calmirror");
        Ok(data_dir.join(PROPERTIES_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> MirrorResult<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, values: &BTreeMap<String, String>) -> MirrorResult<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, serde_json::to_string_pretty(values)?)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> MirrorResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.read_all()?;
        f(&mut values);
        self.write_all(&values)
    }
}

impl PropertyStore for FileProperties {
    fn get(&self, key: &str) -> MirrorResult<Option<String>> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> MirrorResult<()> {
        self.update(|values| {
            values.insert(key.to_string(), value.to_string());
        })
    }

    fn delete(&self, key: &str) -> MirrorResult<()> {
        self.update(|values| {
            values.remove(key);
        })
    }
}
