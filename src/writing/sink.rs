//! Positioned writes into the file being built or updated.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{Error, Result};

/// A seekable write handle. All cascade leaves go through this; nothing else
/// touches the file.
pub struct FileSink {
    file: File,
    path: PathBuf,
}

impl FileSink {
    /// Creates or truncates a file.
    pub fn create(path: impl Into<PathBuf>) -> Result<FileSink> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        Ok(FileSink { file, path })
    }

    /// Opens an existing file for in-place updates.
    pub fn open_update(path: impl Into<PathBuf>) -> Result<FileSink> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        Ok(FileSink { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, location: u64, data: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(location))
            .and_then(|_| self.file.write_all(data))
            .map_err(|e| Error::io(&self.path, e))
    }

    /// Reads `[start, start + num_bytes)`, tolerating a short file as long
    /// as at least `insist` bytes come back.
    pub fn read(&mut self, start: u64, num_bytes: u64, insist: u64) -> Result<Vec<u8>> {
        let mut data = vec![0u8; num_bytes as usize];
        self.file
            .seek(SeekFrom::Start(start))
            .map_err(|e| Error::io(&self.path, e))?;
        let mut filled = 0usize;
        while filled < data.len() {
            match self.file.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(Error::io(&self.path, e)),
            }
        }
        if (filled as u64) < insist {
            return Err(Error::format(
                &self.path,
                format!("expected at least {insist} bytes at {start}, got {filled}"),
            ));
        }
        data.truncate(filled);
        Ok(data)
    }

    /// Pins the physical file length to the logical end tracked by the
    /// free-space map.
    pub fn set_file_length(&mut self, length: u64) -> Result<()> {
        self.file
            .set_len(length)
            .map_err(|e| Error::io(&self.path, e))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush().map_err(|e| Error::io(&self.path, e))
    }
}
