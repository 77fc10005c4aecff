//! The user-facing writable file handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use crate::compression::Compression;
use crate::errors::{Error, Result};
use crate::writing::cascade::{self, CascadingFile, Directory, Shared};
use crate::writing::hist::Histogram1D;
use crate::writing::sink::FileSink;
use crate::writing::tree::{BranchType, Column, Tree};

const INITIAL_DIRECTORY_BYTES: u64 = 256;
const INITIAL_STREAMERS_BYTES: u64 = 512;
const DEFAULT_BASKET_CAPACITY: usize = 10;
const DEFAULT_RESIZE_FACTOR: f64 = 10.0;

/// Creates a new file, truncating any existing one. The default compression
/// is ZLIB level 1.
pub fn create(path: impl Into<PathBuf>) -> Result<WritableFile> {
    let mut sink = FileSink::create(path)?;
    let cascading = cascade::create_empty(
        &mut sink,
        Some(Compression::Zlib(1)),
        INITIAL_DIRECTORY_BYTES,
        INITIAL_STREAMERS_BYTES,
    )?;
    Ok(WritableFile::new(sink, cascading))
}

/// Opens an existing file for in-place updates.
pub fn update(path: impl Into<PathBuf>) -> Result<WritableFile> {
    let mut sink = FileSink::open_update(path)?;
    let (cascading, _streamers) = cascade::update_existing(&mut sink)?;
    Ok(WritableFile::new(sink, cascading))
}

/// A single-writer handle over a file being built or updated.
///
/// Writes go through the cascade: payloads first, then keys, directory
/// records, the streamer list, and the free-space map last, so that an
/// interrupted write never leaves a reference to unwritten data.
pub struct WritableFile {
    sink: FileSink,
    cascading: CascadingFile,
    trees: HashMap<String, Tree>,
    subdirectories: HashMap<String, Shared<Directory>>,
    closed: bool,
}

impl WritableFile {
    fn new(sink: FileSink, cascading: CascadingFile) -> WritableFile {
        WritableFile {
            sink,
            cascading,
            trees: HashMap::new(),
            subdirectories: HashMap::new(),
            closed: false,
        }
    }

    pub fn path(&self) -> &Path {
        self.sink.path()
    }

    pub fn compression(&self) -> Option<Compression> {
        self.cascading.fileheader.borrow().compression()
    }

    pub fn set_compression(&mut self, compression: Option<Compression>) {
        self.cascading
            .fileheader
            .borrow_mut()
            .set_compression(compression);
    }

    /// All keys of the root directory, as `"name;cycle"` strings.
    pub fn keys(&self) -> Vec<String> {
        self.cascading.rootdirectory.borrow().data.key_names()
    }

    fn directory_at(&mut self, path: &str) -> Result<Shared<Directory>> {
        if path.is_empty() {
            return Ok(Rc::clone(&self.cascading.rootdirectory));
        }
        self.subdirectories.get(path).cloned().ok_or_else(|| {
            Error::format(
                self.sink.path(),
                format!("no writable directory at {path:?}; create it with mkdir first"),
            )
        })
    }

    /// Creates (nested) subdirectories, e.g. `"a/b/c"`.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let mut walked = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let parent = self.directory_at(&walked)?;
            if !walked.is_empty() {
                walked.push('/');
            }
            walked.push_str(component);
            if self.subdirectories.contains_key(&walked) {
                continue;
            }
            let subdirectory = parent.borrow_mut().add_directory(
                &mut self.sink,
                component,
                INITIAL_DIRECTORY_BYTES,
                uuid::Uuid::new_v4(),
            )?;
            self.subdirectories
                .insert(walked.clone(), cascade::shared(subdirectory));
        }
        Ok(())
    }

    /// Writes a 1-D histogram under `name` in the root directory, compressing
    /// with the file's compression setting.
    pub fn add_histogram(&mut self, name: &str, histogram: &Histogram1D) -> Result<()> {
        self.add_histogram_in("", name, histogram)
    }

    pub fn add_histogram_in(
        &mut self,
        directory: &str,
        name: &str,
        histogram: &Histogram1D,
    ) -> Result<()> {
        let raw = histogram.serialize(name);
        let compression = self.compression();
        let compressed = crate::compression::compress(&raw, compression, self.sink.path())?;
        let target = self.directory_at(directory)?;
        target.borrow_mut().add_object(
            &mut self.sink,
            "TH1D",
            name,
            &histogram.title,
            &compressed,
            raw.len() as u32,
            None,
            None,
        )?;
        debug!(name, directory, "wrote histogram");
        Ok(())
    }

    /// Writes an already-serialized object of any class into the root
    /// directory. The payload is stored uncompressed.
    pub fn add_object_raw(
        &mut self,
        classname: &str,
        name: &str,
        title: &str,
        raw: &[u8],
    ) -> Result<()> {
        self.cascading.rootdirectory.borrow_mut().add_object(
            &mut self.sink,
            classname,
            name,
            title,
            raw,
            raw.len() as u32,
            None,
            None,
        )?;
        Ok(())
    }

    /// Appends streamer records (`(class name, class version, serialized
    /// info)`) to the file's streamer list, skipping ones already present.
    pub fn add_streamers(&mut self, streamers: &[(String, i32, Vec<u8>)]) -> Result<()> {
        self.cascading
            .streamers
            .borrow_mut()
            .update_streamers(&mut self.sink, streamers)
    }

    /// Creates a `TTree` in the root directory and writes its (empty)
    /// metadata.
    pub fn mktree(
        &mut self,
        name: &str,
        title: &str,
        branches: &[(String, BranchType)],
    ) -> Result<()> {
        self.mktree_with(
            name,
            title,
            branches,
            DEFAULT_BASKET_CAPACITY,
            DEFAULT_RESIZE_FACTOR,
        )
    }

    pub fn mktree_with(
        &mut self,
        name: &str,
        title: &str,
        branches: &[(String, BranchType)],
        initial_basket_capacity: usize,
        resize_factor: f64,
    ) -> Result<()> {
        let compression = self.compression();
        let mut tree = Tree::new(
            Rc::clone(&self.cascading.rootdirectory),
            Rc::clone(&self.cascading.freesegments),
            name,
            title,
            branches,
            compression,
            initial_basket_capacity,
            resize_factor,
        )?;
        tree.write_anew(&mut self.sink)?;
        self.trees.insert(name.to_string(), tree);
        Ok(())
    }

    /// Appends one basket per branch to a tree created in this session.
    pub fn extend(&mut self, tree_name: &str, columns: &[(String, Column)]) -> Result<()> {
        let tree = self.trees.get_mut(tree_name).ok_or_else(|| {
            Error::format(
                self.sink.path(),
                format!("no writable tree named {tree_name:?}"),
            )
        })?;
        tree.extend(&mut self.sink, columns)
    }

    pub fn tree(&self, name: &str) -> Option<&Tree> {
        self.trees.get(name)
    }

    /// Flushes every dirty record. Calling it twice in a row writes nothing
    /// the second time.
    pub fn flush(&mut self) -> Result<()> {
        self.cascading.flush(&mut self.sink)
    }

    /// Flushes and closes. The file is closed even if the flush fails; the
    /// error is propagated.
    pub fn close(mut self) -> Result<()> {
        let result = self.flush();
        self.closed = true;
        result
    }
}

impl Drop for WritableFile {
    fn drop(&mut self) {
        if !self.closed {
            // Dirty flags stay set on failure, but there is no one left to
            // retry.
            let _ = self.flush();
        }
    }
}
