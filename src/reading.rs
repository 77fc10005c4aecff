//! The read path: file header, `TKey` records, directory trees, and the
//! process-wide entry point [`open`].

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use binrw::{binrw, BinReaderExt};
use lru::LruCache;
use tracing::{debug, warn};

use crate::compression::Compression;
use crate::cursor::Cursor;
use crate::deserialization::read_class;
use crate::errors::{Error, Result};
use crate::model::{
    bootstrap_registry, ClassDef, ClassResolver, DispatchByVersion, ObjectModel, Provenance,
    ReadContext,
};
use crate::models::tree::BranchColumn;
use crate::source::{Chunk, Executor, FileSource, MmapSource, Source, TrivialExecutor};
use crate::streamers::{StreamerInfo, StreamerRegistry};

/// How to open a file.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    /// Bytes to pre-fetch from the start of the file; must cover the 100-byte
    /// header.
    pub begin_chunk_size: u64,
    /// Independent file handles for parallel reads.
    pub num_workers: usize,
    /// Memory-map instead of pooled handles.
    pub use_mmap: bool,
    /// Entries in the object cache.
    pub object_cache_size: usize,
    /// Entries in the array cache.
    pub array_cache_size: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            begin_chunk_size: 512,
            num_workers: 1,
            use_mmap: false,
            object_cache_size: 100,
            array_cache_size: 100,
        }
    }
}

/// Splits `"path/to/file.root:directory/object;cycle"` into the file part
/// and the optional in-file part. A single final colon separates the two;
/// slashes in the in-file part traverse directories.
pub fn parse_path(spec: &str) -> (PathBuf, Option<String>) {
    if let Some(at) = spec.rfind(':') {
        let (file, object) = (&spec[..at], &spec[at + 1..]);
        // A Windows drive ("C:\data") or URL scheme ("root://...") colon is
        // part of the file path, not an object separator.
        let drive = file.len() == 1 && file.chars().all(|c| c.is_ascii_alphabetic());
        let scheme = object.starts_with("//") || object.starts_with('\\');
        if !object.is_empty() && !drive && !scheme {
            return (PathBuf::from(file), Some(object.to_string()));
        }
    }
    (PathBuf::from(spec), None)
}

/// The file header's fixed fields, small (32-bit seek) form.
#[binrw]
#[brw(big, magic = b"root")]
pub(crate) struct FileHeaderRecordSmall {
    pub version: i32,
    pub begin: i32,
    pub end: i32,
    pub seek_free: i32,
    pub nbytes_free: i32,
    pub nfree: i32,
    pub nbytes_name: i32,
    pub units: u8,
    pub compress: i32,
    pub seek_info: i32,
    pub nbytes_info: i32,
    pub uuid_version: u16,
    pub uuid: [u8; 16],
}

/// The big (64-bit seek) form, flagged by a version offset of 1 000 000.
#[binrw]
#[brw(big, magic = b"root")]
pub(crate) struct FileHeaderRecordBig {
    pub version: i32,
    pub begin: i32,
    pub end: i64,
    pub seek_free: i64,
    pub nbytes_free: i32,
    pub nfree: i32,
    pub nbytes_name: i32,
    pub units: u8,
    pub compress: i32,
    pub seek_info: i64,
    pub nbytes_info: i32,
    pub uuid_version: u16,
    pub uuid: [u8; 16],
}

/// A `TKey`'s fixed fields, small form.
#[binrw]
#[brw(big)]
pub(crate) struct KeyRecordSmall {
    pub total_bytes: i32,
    pub version: u16,
    pub object_len: i32,
    pub datime: u32,
    pub key_len: u16,
    pub cycle: u16,
    pub seek_key: i32,
    pub seek_pdir: i32,
}

/// A `TKey`'s fixed fields, big form (version offset by 1000).
#[binrw]
#[brw(big)]
pub(crate) struct KeyRecordBig {
    pub total_bytes: i32,
    pub version: u16,
    pub object_len: i32,
    pub datime: u32,
    pub key_len: u16,
    pub cycle: u16,
    pub seek_key: i64,
    pub seek_pdir: i64,
}

/// A directory header's fixed fields, small form.
#[binrw]
#[brw(big)]
pub(crate) struct DirectoryRecordSmall {
    pub version: u16,
    pub datime_created: u32,
    pub datime_modified: u32,
    pub nbytes_keys: i32,
    pub nbytes_name: i32,
    pub seek_dir: i32,
    pub seek_parent: i32,
    pub seek_keys: i32,
}

/// A directory header's fixed fields, big form (version offset by 1000).
#[binrw]
#[brw(big)]
pub(crate) struct DirectoryRecordBig {
    pub version: u16,
    pub datime_created: u32,
    pub datime_modified: u32,
    pub nbytes_keys: i32,
    pub nbytes_name: i32,
    pub seek_dir: i64,
    pub seek_parent: i64,
    pub seek_keys: i64,
}

/// Reads one fixed-layout record at the cursor and advances past it.
pub(crate) fn read_record<T>(chunk: &Chunk, cursor: &mut Cursor, path: &Path) -> Result<T>
where
    T: binrw::BinRead,
    T::Args: Default,
{
    let slice = chunk.get(cursor.index(), chunk.stop(), path)?;
    let mut reader = std::io::Cursor::new(slice);
    let record = reader
        .read_be()
        .map_err(|e| Error::format(path, format!("truncated record: {e}")))?;
    cursor.skip(reader.position());
    Ok(record)
}

/// The first 100 bytes of every file.
#[derive(Clone, Debug)]
pub struct FileHeader {
    pub version: i32,
    pub big: bool,
    pub begin: u64,
    pub end: u64,
    pub seek_free: u64,
    pub nbytes_free: i32,
    pub nfree: i32,
    pub nbytes_name: i32,
    pub units: u8,
    pub compression_code: i32,
    pub seek_info: u64,
    pub nbytes_info: i32,
    pub uuid: [u8; 16],
}

impl FileHeader {
    pub fn parse(bytes: &[u8], path: &Path) -> Result<FileHeader> {
        if bytes.len() < 4 || &bytes[..4] != b"root" {
            return Err(Error::format(
                path,
                format!(
                    "not a ROOT file: first four bytes are {:?}",
                    &bytes[..bytes.len().min(4)]
                ),
            ));
        }
        let err = |e: binrw::Error| Error::format(path, format!("truncated file header: {e}"));
        let mut reader = std::io::Cursor::new(bytes);

        let small: FileHeaderRecordSmall = reader.read_be().map_err(err)?;
        let (header, uuid_version) = if small.version >= 1_000_000 {
            reader.set_position(0);
            let record: FileHeaderRecordBig = reader.read_be().map_err(err)?;
            (
                FileHeader {
                    version: record.version - 1_000_000,
                    big: true,
                    begin: record.begin as u64,
                    end: record.end as u64,
                    seek_free: record.seek_free as u64,
                    nbytes_free: record.nbytes_free,
                    nfree: record.nfree,
                    nbytes_name: record.nbytes_name,
                    units: record.units,
                    compression_code: record.compress,
                    seek_info: record.seek_info as u64,
                    nbytes_info: record.nbytes_info,
                    uuid: record.uuid,
                },
                record.uuid_version,
            )
        } else {
            (
                FileHeader {
                    version: small.version,
                    big: false,
                    begin: small.begin as u64,
                    end: small.end as u64,
                    seek_free: small.seek_free as u64,
                    nbytes_free: small.nbytes_free,
                    nfree: small.nfree,
                    nbytes_name: small.nbytes_name,
                    units: small.units,
                    compression_code: small.compress,
                    seek_info: small.seek_info as u64,
                    nbytes_info: small.nbytes_info,
                    uuid: small.uuid,
                },
                small.uuid_version,
            )
        };

        if header.begin < 63 || header.end < header.begin || uuid_version == 0 {
            return Err(Error::format(
                path,
                format!(
                    "impossible file header: begin {}, end {}, uuid version {uuid_version}",
                    header.begin, header.end
                ),
            ));
        }
        if (header.big && header.units != 8) || (!header.big && header.units != 4) {
            return Err(Error::format(
                path,
                format!(
                    "file header units {} disagree with version {}",
                    header.units, small.version
                ),
            ));
        }

        Ok(header)
    }

    pub fn compression(&self) -> Option<Compression> {
        Compression::from_code(self.compression_code)
    }

    pub fn hex_uuid(&self) -> String {
        self.uuid.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// A `TKey` record header as it appears in the file, in either the small
/// (32-bit seeks) or big (64-bit seeks, version + 1000) form.
#[derive(Clone, Debug)]
pub struct KeyRecord {
    pub total_bytes: i32,
    pub version: u16,
    pub object_len: i32,
    pub datime: u32,
    pub key_len: u16,
    pub cycle: u16,
    pub seek_key: u64,
    pub seek_pdir: u64,
    pub big: bool,
    pub classname: String,
    pub name: String,
    pub title: String,
}

impl KeyRecord {
    /// Reads a key at the cursor. With `read_strings`, the class name, name,
    /// and title are interpreted; the cursor is left after whatever was read.
    pub fn read(
        chunk: &Chunk,
        cursor: &mut Cursor,
        path: &Path,
        read_strings: bool,
    ) -> Result<KeyRecord> {
        let slice = chunk.get(cursor.index(), chunk.stop(), path)?;
        let err = |e: binrw::Error| Error::format(path, format!("truncated key: {e}"));
        let mut reader = std::io::Cursor::new(slice);

        let small: KeyRecordSmall = reader.read_be().map_err(err)?;
        let big = small.version > 1000;
        let (total_bytes, version, object_len, datime, key_len, cycle, seek_key, seek_pdir) =
            if big {
                reader.set_position(0);
                let record: KeyRecordBig = reader.read_be().map_err(err)?;
                (
                    record.total_bytes,
                    record.version - 1000,
                    record.object_len,
                    record.datime,
                    record.key_len,
                    record.cycle,
                    record.seek_key as u64,
                    record.seek_pdir as u64,
                )
            } else {
                (
                    small.total_bytes,
                    small.version,
                    small.object_len,
                    small.datime,
                    small.key_len,
                    small.cycle,
                    small.seek_key as u64,
                    small.seek_pdir as u64,
                )
            };
        cursor.skip(reader.position());

        let (classname, name, title) = if read_strings {
            (
                cursor.string(chunk, path)?,
                cursor.string(chunk, path)?,
                cursor.string(chunk, path)?,
            )
        } else {
            (String::new(), String::new(), String::new())
        };

        Ok(KeyRecord {
            total_bytes,
            version,
            object_len,
            datime,
            key_len,
            cycle,
            seek_key,
            seek_pdir,
            big,
            classname,
            name,
            title,
        })
    }

    /// Validates the invariants every well-formed key satisfies. Keys listed
    /// in a directory's data block describe a record elsewhere, so their
    /// `seek_key` is not checked against `location`.
    pub fn validate(&self, location: u64, is_directory_key: bool, path: &Path) -> Result<()> {
        if self.total_bytes <= 0
            || self.total_bytes as i64 > self.key_len as i64 + self.object_len as i64
        {
            return Err(Error::format(
                path,
                format!(
                    "key {:?} has impossible sizes: fNbytes {} fKeylen {} fObjlen {}",
                    self.name, self.total_bytes, self.key_len, self.object_len
                ),
            ));
        }
        if self.cycle == 0 {
            return Err(Error::format(
                path,
                format!("key {:?} has cycle 0", self.name),
            ));
        }
        if !is_directory_key && self.seek_key != location {
            return Err(Error::format(
                path,
                format!(
                    "key {:?} declares fSeekKey {} but was read at {}",
                    self.name, self.seek_key, location
                ),
            ));
        }
        Ok(())
    }

    pub fn compressed_bytes(&self) -> u64 {
        (self.total_bytes as i64 - self.key_len as i64).max(0) as u64
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed_bytes() != self.object_len as u64
    }

    pub fn data_start(&self) -> u64 {
        self.seek_key + self.key_len as u64
    }
}

/// A key bound to its position in the directory tree.
#[derive(Clone, Debug)]
pub struct ReadOnlyKey {
    record: KeyRecord,
    object_path: String,
}

impl ReadOnlyKey {
    pub fn record(&self) -> &KeyRecord {
        &self.record
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn title(&self) -> &str {
        &self.record.title
    }

    pub fn classname(&self) -> &str {
        &self.record.classname
    }

    pub fn cycle(&self) -> u16 {
        self.record.cycle
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    pub fn is_directory(&self) -> bool {
        self.record.classname == "TDirectory" || self.record.classname == "TDirectoryFile"
    }

    fn cache_key(&self, file: &ReadOnlyFile) -> (String, u64) {
        (file.header.hex_uuid(), self.record.seek_key)
    }

    /// Decompresses the key's payload and returns it with a cursor whose
    /// origin accounts for the consumed key bytes. Decompression runs on the
    /// file's executor (inline by default).
    pub fn uncompressed(&self, file: &ReadOnlyFile) -> Result<(Chunk, Cursor)> {
        let record = &self.record;
        let data_start = record.data_start();
        let data_stop = data_start + record.compressed_bytes();
        let chunk = file.chunk(data_start, data_stop)?;
        let cursor = Cursor::with_origin(0, -(record.key_len as i64));
        if record.is_compressed() {
            let (sender, receiver) = std::sync::mpsc::channel();
            let job_chunk = chunk.clone();
            let path = file.file_path().to_path_buf();
            let compressed = record.compressed_bytes();
            let object_len = record.object_len as u64;
            file.decompression_executor.submit(Box::new(move || {
                let mut at = Cursor::new(data_start);
                let _ = sender.send(crate::compression::decompress(
                    &job_chunk,
                    &mut at,
                    compressed,
                    object_len,
                    &path,
                ));
            }));
            let data = receiver.recv().map_err(|_| {
                Error::io(
                    file.file_path(),
                    std::io::Error::new(std::io::ErrorKind::Other, "decompression job dropped"),
                )
            })??;
            Ok((Chunk::wrap(data), cursor))
        } else {
            let data = chunk.get(data_start, data_stop, file.file_path())?.to_vec();
            Ok((Chunk::wrap(data), cursor))
        }
    }

    /// Reads the object this key points to, consulting the object cache.
    ///
    /// If deserialization fails after consulting any caller-registered class
    /// model, those models are purged and the read is retried once with
    /// readers synthesized from the file's own streamers; a second failure
    /// surfaces.
    pub fn get(&self, file: &ReadOnlyFile) -> Result<Arc<ObjectModel>> {
        if let Some(hit) = file
            .object_cache
            .lock()
            .unwrap()
            .get(&self.cache_key(file))
        {
            return Ok(Arc::clone(hit));
        }

        let (chunk, start_cursor) = self.uncompressed(file)?;
        let mut cursor = start_cursor;
        let mut ctx = ReadContext::with_object_path(file, self.object_path.clone());
        let result = read_class(&self.record.classname, &chunk, &mut cursor, &mut ctx);

        let out = match result {
            Ok(out) => out,
            Err(err) if err.is_deserialization() && ctx.used_custom_classes() => {
                debug!(
                    class = %self.record.classname,
                    path = %self.object_path,
                    "deserialization failed with caller-registered models; retrying from \
                     this file's streamers"
                );
                for (classname, provenance) in &ctx.breadcrumbs {
                    if *provenance != Provenance::Bootstrap {
                        file.remove_class_definition(classname);
                    }
                }
                let mut cursor = start_cursor;
                let mut retry_ctx = ReadContext::with_object_path(file, self.object_path.clone());
                read_class(&self.record.classname, &chunk, &mut cursor, &mut retry_ctx)?
            }
            Err(err) => return Err(err),
        };

        let out = Arc::new(out);
        file.object_cache
            .lock()
            .unwrap()
            .put(self.cache_key(file), Arc::clone(&out));
        Ok(out)
    }
}

/// A directory's fixed-size header.
#[derive(Clone, Debug)]
pub struct DirectoryRecord {
    pub version: u16,
    pub datime_created: u32,
    pub datime_modified: u32,
    pub nbytes_keys: i32,
    pub nbytes_name: i32,
    pub seek_dir: u64,
    pub seek_parent: u64,
    pub seek_keys: u64,
    pub big: bool,
}

impl DirectoryRecord {
    pub fn read(chunk: &Chunk, cursor: &mut Cursor, path: &Path) -> Result<DirectoryRecord> {
        let slice = chunk.get(cursor.index(), chunk.stop(), path)?;
        let err = |e: binrw::Error| Error::format(path, format!("truncated directory: {e}"));
        let mut reader = std::io::Cursor::new(slice);

        let small: DirectoryRecordSmall = reader.read_be().map_err(err)?;
        let big = small.version > 1000;
        let out = if big {
            reader.set_position(0);
            let record: DirectoryRecordBig = reader.read_be().map_err(err)?;
            DirectoryRecord {
                version: record.version - 1000,
                datime_created: record.datime_created,
                datime_modified: record.datime_modified,
                nbytes_keys: record.nbytes_keys,
                nbytes_name: record.nbytes_name,
                seek_dir: record.seek_dir as u64,
                seek_parent: record.seek_parent as u64,
                seek_keys: record.seek_keys as u64,
                big,
            }
        } else {
            DirectoryRecord {
                version: small.version,
                datime_created: small.datime_created,
                datime_modified: small.datime_modified,
                nbytes_keys: small.nbytes_keys,
                nbytes_name: small.nbytes_name,
                seek_dir: small.seek_dir as u64,
                seek_parent: small.seek_parent as u64,
                seek_keys: small.seek_keys as u64,
                big,
            }
        };
        cursor.skip(reader.position());
        Ok(out)
    }
}

/// An entry retrieved from a directory.
pub enum Entry {
    Object(Arc<ObjectModel>),
    Directory(ReadOnlyDirectory),
}

/// A `TDirectory` and its table of child keys.
#[derive(Clone, Debug)]
pub struct ReadOnlyDirectory {
    path: Vec<String>,
    record: DirectoryRecord,
    keys: Vec<ReadOnlyKey>,
}

impl ReadOnlyDirectory {
    pub(crate) fn read(
        file: &ReadOnlyFile,
        path: Vec<String>,
        seek: u64,
    ) -> Result<ReadOnlyDirectory> {
        let file_path = file.file_path().to_path_buf();
        let header_stop = (seek + 64).min(file.header.end);
        let chunk = file.chunk(seek, header_stop)?;
        let mut cursor = Cursor::new(seek);
        let record = DirectoryRecord::read(&chunk, &mut cursor, &file_path)?;

        let mut keys = Vec::new();
        if record.seek_keys != 0 {
            let keys_start = record.seek_keys;
            let keys_stop = (keys_start + record.nbytes_keys as u64 + 8).min(file.header.end);
            let keys_chunk = file.chunk(keys_start, keys_stop)?;
            let mut keys_cursor = Cursor::new(keys_start);

            // The data block opens with its own key, which only needs to be
            // stepped over.
            KeyRecord::read(&keys_chunk, &mut keys_cursor, &file_path, true)?;
            let num_keys = keys_cursor.read_i32(&keys_chunk, &file_path)?.max(0);

            keys.reserve(num_keys as usize);
            for _ in 0..num_keys {
                let record =
                    KeyRecord::read(&keys_chunk, &mut keys_cursor, &file_path, true)?;
                record.validate(record.seek_key, true, &file_path)?;
                let object_path = if path.is_empty() {
                    format!("{};{}", record.name, record.cycle)
                } else {
                    format!("{}/{};{}", path.join("/"), record.name, record.cycle)
                };
                keys.push(ReadOnlyKey {
                    record,
                    object_path,
                });
            }
        }

        Ok(ReadOnlyDirectory { path, record, keys })
    }

    pub fn record(&self) -> &DirectoryRecord {
        &self.record
    }

    pub fn object_path(&self) -> String {
        self.path.join("/")
    }

    /// All keys as `"name;cycle"` strings, in file order.
    pub fn keys(&self) -> Vec<String> {
        self.keys
            .iter()
            .map(|key| format!("{};{}", key.name(), key.cycle()))
            .collect()
    }

    pub fn key_objects(&self) -> &[ReadOnlyKey] {
        &self.keys
    }

    /// Case-sensitive lookup. Without an explicit cycle (`"name;3"`), the
    /// key with the highest cycle wins.
    pub fn key(&self, name_spec: &str) -> Option<&ReadOnlyKey> {
        let (name, cycle) = match name_spec.rsplit_once(';') {
            Some((name, cycle)) => match cycle.parse::<u16>() {
                Ok(cycle) => (name, Some(cycle)),
                Err(_) => (name_spec, None),
            },
            None => (name_spec, None),
        };
        match cycle {
            Some(cycle) => self
                .keys
                .iter()
                .find(|key| key.name() == name && key.cycle() == cycle),
            None => self
                .keys
                .iter()
                .filter(|key| key.name() == name)
                .max_by_key(|key| key.cycle()),
        }
    }

    /// Retrieves an object or subdirectory, navigating slashes.
    pub fn get(&self, file: &ReadOnlyFile, path_spec: &str) -> Result<Entry> {
        let mut components = path_spec
            .split('/')
            .filter(|component| !component.is_empty())
            .collect::<Vec<_>>();
        if components.is_empty() {
            return Err(Error::format(
                file.file_path(),
                "empty object path".to_string(),
            ));
        }
        let leaf = components.pop().unwrap();

        let mut here = self.clone();
        for component in components {
            here = here.subdirectory(file, component)?;
        }

        let key = here.key(leaf).ok_or_else(|| {
            Error::format(
                file.file_path(),
                format!("no object named {leaf:?} in /{}", here.object_path()),
            )
        })?;
        if key.is_directory() {
            let mut sub_path = here.path.clone();
            sub_path.push(key.name().to_string());
            Ok(Entry::Directory(ReadOnlyDirectory::read(
                file,
                sub_path,
                key.record.seek_key + key.record.key_len as u64,
            )?))
        } else {
            Ok(Entry::Object(key.get(file)?))
        }
    }

    /// Retrieves an object (an error if the name refers to a subdirectory).
    pub fn get_object(&self, file: &ReadOnlyFile, path_spec: &str) -> Result<Arc<ObjectModel>> {
        match self.get(file, path_spec)? {
            Entry::Object(object) => Ok(object),
            Entry::Directory(_) => Err(Error::format(
                file.file_path(),
                format!("{path_spec:?} is a directory, not an object"),
            )),
        }
    }

    pub fn subdirectory(&self, file: &ReadOnlyFile, name: &str) -> Result<ReadOnlyDirectory> {
        let key = self.key(name).ok_or_else(|| {
            Error::format(
                file.file_path(),
                format!("no directory named {name:?} in /{}", self.object_path()),
            )
        })?;
        if !key.is_directory() {
            return Err(Error::format(
                file.file_path(),
                format!("{name:?} is a {}, not a directory", key.classname()),
            ));
        }
        let mut sub_path = self.path.clone();
        sub_path.push(key.name().to_string());
        ReadOnlyDirectory::read(
            file,
            sub_path,
            key.record.seek_key + key.record.key_len as u64,
        )
    }

    /// Walks the directory, yielding `(object_path, key)` pairs deduplicated
    /// by object path. Recursion descends into subdirectories.
    pub fn iterate(
        &self,
        file: &ReadOnlyFile,
        recursive: bool,
        filter_name: Option<&str>,
        filter_classname: Option<&str>,
    ) -> Result<Vec<(String, ReadOnlyKey)>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        self.iterate_into(
            file,
            recursive,
            filter_name,
            filter_classname,
            &mut seen,
            &mut out,
        )?;
        Ok(out)
    }

    fn iterate_into(
        &self,
        file: &ReadOnlyFile,
        recursive: bool,
        filter_name: Option<&str>,
        filter_classname: Option<&str>,
        seen: &mut std::collections::HashSet<String>,
        out: &mut Vec<(String, ReadOnlyKey)>,
    ) -> Result<()> {
        for key in &self.keys {
            let matches = filter_name.map_or(true, |f| key.name() == f)
                && filter_classname.map_or(true, |f| key.classname() == f);
            if matches && seen.insert(key.object_path().to_string()) {
                out.push((key.object_path().to_string(), key.clone()));
            }
            if recursive && key.is_directory() {
                self.subdirectory(file, key.name())?.iterate_into(
                    file,
                    recursive,
                    filter_name,
                    filter_classname,
                    seen,
                    out,
                )?;
            }
        }
        Ok(())
    }
}

/// An open, read-only file handle.
pub struct ReadOnlyFile {
    path: PathBuf,
    source: Arc<dyn Source>,
    header: FileHeader,
    begin_chunk: Chunk,
    classes: Mutex<HashMap<String, ClassDef>>,
    streamers: OnceLock<StreamerRegistry>,
    parsing_streamers: AtomicBool,
    decompression_executor: Arc<dyn Executor>,
    object_cache: Mutex<LruCache<(String, u64), Arc<ObjectModel>>>,
    array_cache: Mutex<LruCache<String, Arc<BranchColumn>>>,
}

/// Opens a file for reading. The path may carry an object suffix
/// (`"events.root:tree"`), which is ignored here; use
/// [`ReadOnlyFile::get_object`] to navigate.
pub fn open(path: impl AsRef<str>) -> Result<ReadOnlyFile> {
    let (file_path, _object) = parse_path(path.as_ref());
    ReadOnlyFile::open(file_path, OpenOptions::default())
}

impl ReadOnlyFile {
    pub fn open(path: impl Into<PathBuf>, options: OpenOptions) -> Result<ReadOnlyFile> {
        let path = path.into();
        let source: Arc<dyn Source> = if options.use_mmap {
            Arc::new(MmapSource::open(&path)?)
        } else {
            Arc::new(FileSource::open(&path, options.num_workers)?)
        };
        Self::from_source(path, source, options)
    }

    pub fn from_source(
        path: PathBuf,
        source: Arc<dyn Source>,
        options: OpenOptions,
    ) -> Result<ReadOnlyFile> {
        let begin_size = options.begin_chunk_size.max(100);
        let begin_chunk = source.chunk(0, begin_size)?;
        let header_bytes = begin_chunk.get(0, 100.min(begin_chunk.stop()), &path)?;
        let header = FileHeader::parse(header_bytes, &path)?;
        debug!(?path, version = header.version, big = header.big, "opened");

        Ok(ReadOnlyFile {
            path,
            source,
            header,
            begin_chunk,
            classes: Mutex::new(bootstrap_registry().clone()),
            streamers: OnceLock::new(),
            parsing_streamers: AtomicBool::new(false),
            decompression_executor: Arc::new(TrivialExecutor),
            object_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(options.object_cache_size.max(1)).unwrap(),
            )),
            array_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(options.array_cache_size.max(1)).unwrap(),
            )),
        })
    }

    /// Opens caller-supplied bytes as a file.
    pub fn from_bytes(data: Vec<u8>) -> Result<ReadOnlyFile> {
        let source = Arc::new(crate::source::MemSource::new(data));
        ReadOnlyFile::from_source(
            source.path().to_path_buf(),
            source,
            OpenOptions::default(),
        )
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn source(&self) -> &Arc<dyn Source> {
        &self.source
    }

    pub fn close(&self) {
        self.source.close();
    }

    /// Fetches a byte range, reusing the pre-fetched begin chunk when it
    /// covers the request.
    pub fn chunk(&self, start: u64, stop: u64) -> Result<Chunk> {
        if self.begin_chunk.contains(start, stop) {
            return Ok(self.begin_chunk.clone());
        }
        self.source.chunk(start, stop)
    }

    /// The root `TDirectory`.
    pub fn root_directory(&self) -> Result<ReadOnlyDirectory> {
        ReadOnlyDirectory::read(
            self,
            Vec::new(),
            self.header.begin + self.header.nbytes_name as u64,
        )
    }

    /// Shorthand for navigating from the root directory.
    pub fn get(&self, path_spec: &str) -> Result<Entry> {
        self.root_directory()?.get(self, path_spec)
    }

    pub fn get_object(&self, path_spec: &str) -> Result<Arc<ObjectModel>> {
        self.root_directory()?.get_object(self, path_spec)
    }

    /// The file's streamer registry, parsed on first access.
    pub fn streamers(&self) -> Result<&StreamerRegistry> {
        if let Some(registry) = self.streamers.get() {
            return Ok(registry);
        }
        self.parsing_streamers.store(true, Ordering::SeqCst);
        let parsed = self.parse_streamers();
        self.parsing_streamers.store(false, Ordering::SeqCst);
        Ok(self.streamers.get_or_init(|| match parsed {
            Ok(registry) => registry,
            Err(err) => {
                warn!(path = ?self.path, error = %err, "failed to parse streamers");
                StreamerRegistry::default()
            }
        }))
    }

    fn parse_streamers(&self) -> Result<StreamerRegistry> {
        if self.header.seek_info == 0 || self.header.nbytes_info <= 0 {
            return Ok(StreamerRegistry::default());
        }
        let start = self.header.seek_info;
        let stop = start + self.header.nbytes_info as u64;
        let chunk = self.chunk(start, stop)?;
        let mut cursor = Cursor::new(start);
        let key = KeyRecord::read(&chunk, &mut cursor, &self.path, true)?;
        key.validate(start, false, &self.path)?;

        let data_start = key.data_start();
        let data_stop = data_start + key.compressed_bytes();
        let data = if key.is_compressed() {
            let mut at = Cursor::new(data_start);
            crate::compression::decompress(
                &chunk,
                &mut at,
                key.compressed_bytes(),
                key.object_len as u64,
                &self.path,
            )?
        } else {
            chunk.get(data_start, data_stop, &self.path)?.to_vec()
        };
        let data_chunk = Chunk::wrap(data);
        let cursor = Cursor::with_origin(0, -(key.key_len as i64));
        StreamerRegistry::parse(&data_chunk, cursor, self)
    }

    /// Replaces the executor that decompression work is submitted to. The
    /// default runs jobs inline on the calling thread.
    pub fn set_decompression_executor(&mut self, executor: Arc<dyn Executor>) {
        self.decompression_executor = executor;
    }

    /// Registers a caller-supplied model for a class, shadowing streamers.
    pub fn register_class(&self, classname: impl Into<String>, reader: crate::model::ReaderFn) {
        self.classes
            .lock()
            .unwrap()
            .insert(classname.into(), ClassDef::Custom(reader));
    }

    /// Forgets a class definition so the next read resynthesizes it from the
    /// file's streamers. Bootstrap classes cannot be removed.
    pub fn remove_class_definition(&self, classname: &str) {
        let mut classes = self.classes.lock().unwrap();
        if let Some(def) = classes.get(classname) {
            if !matches!(def, ClassDef::Bootstrap(_)) {
                classes.remove(classname);
            }
        }
    }

    pub fn object_cache_len(&self) -> usize {
        self.object_cache.lock().unwrap().len()
    }

    /// The array cache, keyed by `(branch path, entry range, interpretation)`
    /// strings.
    pub fn cached_array(&self, key: &str) -> Option<Arc<BranchColumn>> {
        self.array_cache.lock().unwrap().get(key).map(Arc::clone)
    }

    pub fn cache_array(&self, key: String, column: Arc<BranchColumn>) {
        self.array_cache.lock().unwrap().put(key, column);
    }
}

impl ClassResolver for ReadOnlyFile {
    fn file_path(&self) -> &Path {
        &self.path
    }

    fn class_named(&self, classname: &str) -> ClassDef {
        if let Some(def) = self.classes.lock().unwrap().get(classname) {
            return def.clone();
        }
        if self.parsing_streamers.load(Ordering::SeqCst) {
            // Streamer records only contain bootstrap classes; anything else
            // is skippable.
            return ClassDef::Unknown;
        }
        let def = match self.streamer_named(classname, None) {
            Some(_) => ClassDef::Versioned(Arc::new(DispatchByVersion::new(classname))),
            None => ClassDef::Unknown,
        };
        self.classes
            .lock()
            .unwrap()
            .insert(classname.to_string(), def.clone());
        def
    }

    fn streamer_named(&self, classname: &str, version: Option<i32>) -> Option<Arc<StreamerInfo>> {
        match self.streamers() {
            Ok(registry) => registry.streamer_named(classname, version),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_specs_split_on_the_final_colon() {
        let (file, object) = parse_path("events.root:dir/tree;2");
        assert_eq!(file, PathBuf::from("events.root"));
        assert_eq!(object.as_deref(), Some("dir/tree;2"));

        let (file, object) = parse_path("plain.root");
        assert_eq!(file, PathBuf::from("plain.root"));
        assert!(object.is_none());
    }

    #[test]
    fn header_rejects_wrong_magic() {
        let mut bytes = vec![0u8; 100];
        bytes[..4].copy_from_slice(b"toor");
        assert!(FileHeader::parse(&bytes, Path::new("x.root")).is_err());
    }
}
