//! JSON state files with atomic replace-on-write
//!
//! Every save writes a sibling `.tmp` file and renames it over the target, so
//! a crash mid-write leaves the previous valid state in place.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error on {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A single JSON document on disk
#[derive(Debug, Clone)]
pub struct JsonStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, `None` when it has never been written
    pub async fn load(&self) -> Result<Option<T>, PersistenceError> {
        if !fs::try_exists(&self.path).await.map_err(|e| self.io_error(e))? {
            debug!(file = ?self.path, "No existing state file found");
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        let value = serde_json::from_str(&contents).map_err(|source| {
            PersistenceError::Serialization {
                path: self.path.clone(),
                source,
            }
        })?;

        debug!(file = ?self.path, "State loaded");
        Ok(Some(value))
    }

    pub async fn save(&self, value: &T) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.io_error(e))?;
            }
        }

        let serialized =
            serde_json::to_string_pretty(value).map_err(|source| PersistenceError::Serialization {
                path: self.path.clone(),
                source,
            })?;

        // Write to temporary file first, then rename (atomic operation)
        let temp_file = PathBuf::from(format!("{}.tmp", self.path.display()));
        fs::write(&temp_file, serialized)
            .await
            .map_err(|e| self.io_error(e))?;
        fs::rename(&temp_file, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        debug!(file = ?self.path, "State saved");
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Append-only list of records, rewritten atomically on each append
#[derive(Debug, Clone)]
pub struct HistoryLog<T> {
    store: JsonStore<Vec<T>>,
}

impl<T> HistoryLog<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    pub async fn entries(&self) -> Result<Vec<T>, PersistenceError> {
        Ok(self.store.load().await?.unwrap_or_default())
    }

    pub async fn append(&self, records: Vec<T>) -> Result<usize, PersistenceError> {
        if records.is_empty() {
            return Ok(self.entries().await?.len());
        }
        let mut entries = self.entries().await?;
        let appended = records.len();
        entries.extend(records);
        self.store.save(&entries).await?;

        info!(
            file = ?self.store.path(),
            appended,
            total = entries.len(),
            "History appended"
        );
        Ok(entries.len())
    }
}
