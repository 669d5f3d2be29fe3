//! Flat file storage used for the configuration documents.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    #[error("file not found")]
    NotFound,
    #[error("file system not mounted")]
    Unavailable,
    #[error("file system I/O failure")]
    Io,
}

/// Non-volatile flat file store (SPIFFS/LittleFS partition, NVS blobs, host directory).
pub trait FileStore {
    fn exists(&mut self, name: &str) -> bool;

    fn read(&mut self, name: &str) -> Result<Vec<u8>, FileError>;

    /// Create or replace `name`.
    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), FileError>;

    /// Move `from` to `to`, replacing `to` if it exists.
    fn rename(&mut self, from: &str, to: &str) -> Result<(), FileError>;

    fn remove(&mut self, name: &str) -> Result<(), FileError>;
}

/// File store kept in RAM.
#[derive(Debug, Clone, Default)]
pub struct MemoryFiles {
    files: BTreeMap<String, Vec<u8>>,
    writes: usize,
}

impl MemoryFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file without counting it as a write.
    pub fn with_file(mut self, name: &str, data: &[u8]) -> Self {
        self.files.insert(name.to_string(), data.to_vec());
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    /// Number of `write` calls since creation.
    pub fn write_count(&self) -> usize {
        self.writes
    }
}

impl FileStore for MemoryFiles {
    fn exists(&mut self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    fn read(&mut self, name: &str) -> Result<Vec<u8>, FileError> {
        self.files.get(name).cloned().ok_or(FileError::NotFound)
    }

    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), FileError> {
        self.writes += 1;
        self.files.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), FileError> {
        let data = self.files.remove(from).ok_or(FileError::NotFound)?;
        self.files.insert(to.to_string(), data);
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<(), FileError> {
        self.files
            .remove(name)
            .map(|_| ())
            .ok_or(FileError::NotFound)
    }
}
