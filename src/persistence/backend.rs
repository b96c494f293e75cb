use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::PersistenceError;

/// Durable byte storage keyed by task signature.
pub trait Backend: Send + Sync {
    fn exists(&self, key: &str) -> bool;

    /// Creates or overwrites the entry for `key`.
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError>;

    /// Fails with [`PersistenceError::NotFound`] for unknown keys.
    fn load(&self, key: &str) -> Result<Vec<u8>, PersistenceError>;

    /// Removes one entry, or every entry when `key` is `None`.
    fn invalidate(&self, key: Option<&str>) -> Result<(), PersistenceError>;
}

/// Keeps entries in process memory.
#[derive(Default)]
pub struct InMemoryBackend {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Backend for InMemoryBackend {
    fn exists(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Vec<u8>, PersistenceError> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(key.to_string()))
    }

    fn invalidate(&self, key: Option<&str>) -> Result<(), PersistenceError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match key {
            Some(key) => {
                entries.remove(key);
            }
            None => entries.clear(),
        }
        Ok(())
    }
}

const EXTENSION: &str = "cache";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One file per entry under a base directory.
///
/// Writes land in a temporary sibling file first and are then renamed over
/// the target, so readers see either the old or the new entry in full.
#[derive(Debug, Clone)]
pub struct FileSystemBackend {
    dir: Utf8PathBuf,
}

impl FileSystemBackend {
    /// Opens the store at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Location of the file backing `key`.
    pub fn path_for(&self, key: &str) -> Result<Utf8PathBuf, PersistenceError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.contains("..") {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid cache key '{key}'"),
            )
            .into());
        }
        Ok(self.dir.join(format!("{key}.{EXTENSION}")))
    }
}

impl Backend for FileSystemBackend {
    fn exists(&self, key: &str) -> bool {
        self.path_for(key).is_ok_and(|path| path.is_file())
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        let path = self.path_for(key)?;
        let temp = self.dir.join(format!(
            ".{key}.{}.{}.tmp",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        fs::write(&temp, bytes)?;
        if let Err(e) = fs::rename(&temp, &path) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        Ok(())
    }

    fn load(&self, key: &str) -> Result<Vec<u8>, PersistenceError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(PersistenceError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn invalidate(&self, key: Option<&str>) -> Result<(), PersistenceError> {
        match key {
            Some(key) => match fs::remove_file(self.path_for(key)?) {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
            None => {
                for entry in self.dir.read_dir_utf8()? {
                    let path = entry?.into_path();
                    if path.extension() == Some(EXTENSION) {
                        fs::remove_file(&path)?;
                    }
                }
                Ok(())
            }
        }
    }
}
