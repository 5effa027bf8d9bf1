//! Last-processed marker persistence
//!
//! Indexing resumes after a restart from the last marker it wrote. The
//! networking core never interprets the marker; it is an opaque byte string.

use crate::storage::persistence::{write_atomic, StorageError};
use std::fs;
use std::path::{Path, PathBuf};

/// Read/write access to the last-processed marker
pub trait MarkerStore: Send + Sync {
    /// The last marker written, if any
    fn read_last(&self) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the stored marker
    fn write_last(&self, marker: &[u8]) -> Result<(), StorageError>;
}

/// Marker kept as a hex line in a file
#[derive(Debug, Clone)]
pub struct FileMarkerStore {
    path: PathBuf,
}

impl FileMarkerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MarkerStore for FileMarkerStore {
    fn read_last(&self) -> Result<Option<Vec<u8>>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let text = fs::read_to_string(&self.path)?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        hex::decode(text)
            .map(Some)
            .map_err(|e| StorageError::InvalidData(format!("marker is not hex: {}", e)))
    }

    fn write_last(&self, marker: &[u8]) -> Result<(), StorageError> {
        let mut line = hex::encode(marker);
        line.push('\n');
        write_atomic(&self.path, line.as_bytes())
    }
}
