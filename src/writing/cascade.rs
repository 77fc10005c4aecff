//! Low-level writable records. Each leaf owns an interval of the file and a
//! dirty flag; composite nodes propagate positions downward and flush their
//! children in dependency order (referents before references, the free-space
//! map last).

use std::cell::RefCell;
use std::collections::HashSet;
use std::io::Cursor as IoCursor;
use std::path::Path;
use std::rc::Rc;

use binrw::{binrw, BinReaderExt, BinWriterExt};
use tracing::debug;
use uuid::Uuid;

use crate::compression::Compression;
use crate::cursor::Cursor;
use crate::errors::{Error, Result};
use crate::model::{bootstrap_registry, ClassDef, ClassResolver, ReadContext, Value};
use crate::reading::{
    DirectoryRecordBig, DirectoryRecordSmall, FileHeaderRecordBig, FileHeaderRecordSmall,
    KeyRecordBig, KeyRecordSmall,
};
use crate::serialization;
use crate::source::Chunk;
use crate::streamers::StreamerInfo;
use crate::writing::sink::FileSink;
use crate::START_BIG_FILE;

pub type Shared<T> = Rc<RefCell<T>>;

pub(crate) fn shared<T>(value: T) -> Shared<T> {
    Rc::new(RefCell::new(value))
}

pub const KEY_SMALL_BYTES: u64 = 26;
pub const KEY_BIG_BYTES: u64 = 34;
pub const DIRECTORY_SMALL_BYTES: u64 = 30;
pub const DIRECTORY_BIG_BYTES: u64 = 42;
pub const FREE_SMALL_BYTES: u64 = 10;
pub const FREE_BIG_BYTES: u64 = 18;
pub const FILE_HEADER_SMALL_BYTES: u64 = 63;
pub const FILE_HEADER_BIG_BYTES: u64 = 79;
pub const LIST_HEADER_BYTES: u64 = 21;

const KEY_CLASS_VERSION: u16 = 4;
const FREE_CLASS_VERSION: u16 = 1;
const DIRECTORY_CLASS_VERSION: u16 = 5;
const LIST_CLASS_VERSION: u16 = 5;
/// Declared ROOT release: 6.24/00.
const FILE_CLASS_VERSION: i32 = 62400;

// ---------------------------------------------------------------------------

/// A name, title, or class name written on its own (directory anchors).
#[derive(Clone, Debug)]
pub struct StringLeaf {
    location: Option<u64>,
    string: String,
    dirty: bool,
}

impl StringLeaf {
    pub fn new(location: Option<u64>, string: impl Into<String>) -> StringLeaf {
        StringLeaf {
            location,
            string: string.into(),
            dirty: true,
        }
    }

    pub fn string(&self) -> &str {
        &self.string
    }

    pub fn location(&self) -> Option<u64> {
        self.location
    }

    pub fn set_location(&mut self, location: u64) {
        if self.location != Some(location) {
            self.location = Some(location);
            self.dirty = true;
        }
    }

    pub fn allocation(&self) -> u64 {
        serialization::string_size(&self.string)
    }

    pub fn serialize(&self) -> Vec<u8> {
        serialization::string(&self.string)
    }

    pub fn write(&mut self, sink: &mut FileSink) -> Result<()> {
        if self.dirty {
            let location = self.location.ok_or_else(|| {
                Error::format(sink.path(), "can't write a string whose location is unknown")
            })?;
            sink.write(location, &self.serialize())?;
            self.dirty = false;
        }
        Ok(())
    }

    pub fn deserialize(raw: &[u8], location: u64) -> (StringLeaf, u64) {
        let (length, header) = if raw[0] == 255 {
            (
                u32::from_be_bytes(raw[1..5].try_into().unwrap()) as usize,
                5usize,
            )
        } else {
            (raw[0] as usize, 1usize)
        };
        let string = String::from_utf8_lossy(&raw[header..header + length]).into_owned();
        let mut out = StringLeaf::new(Some(location), string);
        out.dirty = false;
        (out, location + (header + length) as u64)
    }
}

// ---------------------------------------------------------------------------

/// A writable `TKey`. The small (32-bit) form is used unless any seek point
/// crosses the big-file threshold, in which case the version is offset by
/// 1000 and seeks widen to 64 bits.
#[derive(Clone, Debug)]
pub struct KeyLeaf {
    location: Option<u64>,
    uncompressed_bytes: Option<u32>,
    compressed_bytes: Option<u32>,
    classname: String,
    name: String,
    title: String,
    cycle: u16,
    parent_location: u64,
    seek_location: Option<u64>,
    created_on: u32,
    big: Option<bool>,
    dirty: bool,
}

impl KeyLeaf {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        location: Option<u64>,
        uncompressed_bytes: Option<u32>,
        compressed_bytes: Option<u32>,
        classname: impl Into<String>,
        name: impl Into<String>,
        title: impl Into<String>,
        cycle: u16,
        parent_location: u64,
        seek_location: Option<u64>,
    ) -> KeyLeaf {
        KeyLeaf {
            location,
            uncompressed_bytes,
            compressed_bytes,
            classname: classname.into(),
            name: name.into(),
            title: title.into(),
            cycle,
            parent_location,
            seek_location,
            created_on: serialization::datime_now(),
            big: None,
            dirty: true,
        }
    }

    pub fn location(&self) -> Option<u64> {
        self.location
    }

    pub fn set_location(&mut self, location: Option<u64>) {
        if self.location != location {
            self.location = location;
            self.dirty = true;
        }
    }

    pub fn seek_location(&self) -> Option<u64> {
        self.seek_location
    }

    pub fn set_seek_location(&mut self, seek_location: u64) {
        if self.seek_location != Some(seek_location) {
            self.seek_location = Some(seek_location);
            self.big = None;
            self.dirty = true;
        }
    }

    pub fn parent_location(&self) -> u64 {
        self.parent_location
    }

    pub fn set_parent_location(&mut self, parent_location: u64) {
        if self.parent_location != parent_location {
            self.parent_location = parent_location;
            self.big = None;
            self.dirty = true;
        }
    }

    pub fn uncompressed_bytes(&self) -> Option<u32> {
        self.uncompressed_bytes
    }

    pub fn set_uncompressed_bytes(&mut self, value: u32) {
        if self.uncompressed_bytes != Some(value) {
            self.uncompressed_bytes = Some(value);
            self.dirty = true;
        }
    }

    pub fn compressed_bytes(&self) -> Option<u32> {
        self.compressed_bytes
    }

    pub fn set_compressed_bytes(&mut self, value: u32) {
        if self.compressed_bytes != Some(value) {
            self.compressed_bytes = Some(value);
            self.dirty = true;
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn classname(&self) -> &str {
        &self.classname
    }

    pub fn cycle(&self) -> u16 {
        self.cycle
    }

    pub fn big(&self) -> bool {
        if let Some(big) = self.big {
            return big;
        }
        match self.seek_location {
            Some(seek) => seek >= START_BIG_FILE || self.parent_location >= START_BIG_FILE,
            None => match self.location {
                None => true,
                Some(location) => {
                    location >= START_BIG_FILE || self.parent_location >= START_BIG_FILE
                }
            },
        }
    }

    pub fn force_big(&mut self) {
        self.big = Some(true);
    }

    pub fn num_bytes(&self) -> u64 {
        let form = if self.big() {
            KEY_BIG_BYTES
        } else {
            KEY_SMALL_BYTES
        };
        form + serialization::string_size(&self.classname)
            + serialization::string_size(&self.name)
            + serialization::string_size(&self.title)
    }

    pub fn allocation(&self) -> u64 {
        self.num_bytes()
    }

    /// A copy destined for a directory's data block: it records the same
    /// object seek but will be written at a different position.
    pub fn copy_to(&self) -> KeyLeaf {
        let mut out = self.clone();
        out.location = self.seek_location.or(self.location);
        out.dirty = true;
        out
    }

    pub fn serialize(&self, path: &Path) -> Result<Vec<u8>> {
        let location = self.seek_location.or(self.location).ok_or_else(|| {
            Error::format(path, "can't serialize a key whose location is unknown")
        })?;
        let total = self.compressed_bytes.unwrap_or(0) as i64 + self.num_bytes() as i64;

        let mut w = IoCursor::new(Vec::with_capacity(self.num_bytes() as usize));
        if self.big() {
            w.write_be(&KeyRecordBig {
                total_bytes: total as i32,
                version: KEY_CLASS_VERSION + 1000,
                object_len: self.uncompressed_bytes.unwrap_or(0) as i32,
                datime: self.created_on,
                key_len: self.num_bytes() as u16,
                cycle: self.cycle,
                seek_key: location as i64,
                seek_pdir: self.parent_location as i64,
            })
            .unwrap();
        } else {
            w.write_be(&KeyRecordSmall {
                total_bytes: total as i32,
                version: KEY_CLASS_VERSION,
                object_len: self.uncompressed_bytes.unwrap_or(0) as i32,
                datime: self.created_on,
                key_len: self.num_bytes() as u16,
                cycle: self.cycle,
                seek_key: location as i32,
                seek_pdir: self.parent_location as i32,
            })
            .unwrap();
        }
        let mut out = w.into_inner();
        out.extend_from_slice(&serialization::string(&self.classname));
        out.extend_from_slice(&serialization::string(&self.name));
        out.extend_from_slice(&serialization::string(&self.title));
        Ok(out)
    }

    pub fn write(&mut self, sink: &mut FileSink) -> Result<()> {
        if self.dirty {
            let location = self.location.ok_or_else(|| {
                Error::format(sink.path(), "can't write a key whose location is unknown")
            })?;
            let data = self.serialize(sink.path())?;
            sink.write(location, &data)?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Parses a key for updating. `is_directory_key` skips the seek-vs-
    /// location consistency check (a directory's data block lists keys of
    /// records elsewhere in the file).
    pub fn deserialize(
        raw: &[u8],
        location: u64,
        path: &Path,
        is_directory_key: bool,
    ) -> Result<KeyLeaf> {
        let err = |e: binrw::Error| Error::format(path, format!("truncated key: {e}"));
        let mut r = IoCursor::new(raw);
        let small: KeyRecordSmall = r.read_be().map_err(err)?;
        let big = small.version >= 1000;
        let (total_bytes, version, object_len, datime, key_len, cycle, seek_key, seek_pdir) =
            if big {
                r.set_position(0);
                let record: KeyRecordBig = r.read_be().map_err(err)?;
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
        if version != KEY_CLASS_VERSION {
            return Err(Error::format(
                path,
                format!("can't update TKey version {version}, only version {KEY_CLASS_VERSION}"),
            ));
        }
        if total_bytes <= 0 || total_bytes as i64 > key_len as i64 + object_len as i64 {
            return Err(Error::format(
                path,
                format!("impossible key sizes: fNbytes {total_bytes} fKeylen {key_len} fObjlen {object_len}"),
            ));
        }
        if cycle == 0 {
            return Err(Error::format(path, "key cycle must be positive"));
        }
        if !is_directory_key && seek_key != location {
            return Err(Error::format(
                path,
                format!("key declares fSeekKey {seek_key} but was read at {location}"),
            ));
        }

        let mut position = r.position() as usize;
        let (classname, next) = StringLeaf::deserialize(&raw[position..], 0);
        position += (next) as usize;
        let (name, next) = StringLeaf::deserialize(&raw[position..], 0);
        position += next as usize;
        let (title, next) = StringLeaf::deserialize(&raw[position..], 0);
        position += next as usize;
        if position as u64 != key_len as u64 {
            return Err(Error::format(
                path,
                format!("key strings end at {position} but fKeylen is {key_len}"),
            ));
        }

        let mut out = KeyLeaf::new(
            Some(location),
            Some(object_len as u32),
            Some((total_bytes - key_len as i32) as u32),
            classname.string,
            name.string,
            title.string,
            cycle,
            seek_pdir,
            if is_directory_key {
                Some(seek_key)
            } else {
                Some(location)
            },
        );
        out.created_on = datime;
        out.big = Some(big);
        out.dirty = false;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------

/// One free interval on disk, storing `[fFirst, fLast]` inclusive.
#[binrw]
#[brw(big)]
struct FreeRecordSmall {
    version: u16,
    first: u32,
    last: u32,
}

/// The big form, for intervals past the big-file threshold (version offset
/// by 1000).
#[binrw]
#[brw(big)]
struct FreeRecordBig {
    version: u16,
    first: u64,
    last: u64,
}

/// The serialized payload of the free-space record: one interval per free
/// slice plus the end-of-file marker.
#[derive(Clone, Debug)]
pub struct FreeSegmentsData {
    location: Option<u64>,
    slices: Vec<(u64, u64)>,
    end: Option<u64>,
    allocation: Option<u64>,
    dirty: bool,
}

impl FreeSegmentsData {
    pub fn new(location: Option<u64>, slices: Vec<(u64, u64)>, end: Option<u64>) -> Self {
        FreeSegmentsData {
            location,
            slices,
            end,
            allocation: None,
            dirty: true,
        }
    }

    pub fn slices(&self) -> &[(u64, u64)] {
        &self.slices
    }

    pub fn set_slices(&mut self, slices: Vec<(u64, u64)>) {
        if self.slices != slices {
            self.slices = slices;
            self.dirty = true;
        }
    }

    pub fn end(&self) -> Option<u64> {
        self.end
    }

    pub fn set_end(&mut self, end: u64) {
        if self.end != Some(end) {
            self.end = Some(end);
            self.dirty = true;
        }
    }

    pub fn location(&self) -> Option<u64> {
        self.location
    }

    pub fn set_location(&mut self, location: u64) {
        if self.location != Some(location) {
            self.location = Some(location);
            self.dirty = true;
        }
    }

    pub fn allocation(&mut self) -> u64 {
        if self.allocation.is_none() {
            self.allocation = Some(self.num_bytes());
        }
        self.allocation.unwrap()
    }

    pub fn reset_allocation(&mut self) {
        self.allocation = None;
        self.dirty = true;
    }

    fn interval_bytes(stop_minus_one: u64) -> u64 {
        if stop_minus_one >= START_BIG_FILE {
            FREE_BIG_BYTES
        } else {
            FREE_SMALL_BYTES
        }
    }

    pub fn slices_bytes(slices: &[(u64, u64)]) -> u64 {
        slices
            .iter()
            .map(|&(_, stop)| Self::interval_bytes(stop - 1))
            .sum()
    }

    pub fn num_bytes(&self) -> u64 {
        let mut total = Self::slices_bytes(&self.slices);
        match self.end {
            None => {
                if total + FREE_SMALL_BYTES >= START_BIG_FILE {
                    total += FREE_BIG_BYTES;
                } else {
                    total += FREE_SMALL_BYTES;
                }
            }
            Some(end) if end >= START_BIG_FILE => total += FREE_BIG_BYTES,
            Some(_) => total += FREE_SMALL_BYTES,
        }
        total
    }

    pub fn serialize(&self, path: &Path) -> Result<Vec<u8>> {
        let end = self
            .end
            .ok_or_else(|| Error::format(path, "free-space map end is unknown"))?;
        let mut w = IoCursor::new(Vec::new());
        for &(start, stop) in &self.slices {
            if stop - 1 < START_BIG_FILE {
                w.write_be(&FreeRecordSmall {
                    version: FREE_CLASS_VERSION,
                    first: start as u32,
                    last: (stop - 1) as u32,
                })
                .unwrap();
            } else {
                w.write_be(&FreeRecordBig {
                    version: FREE_CLASS_VERSION + 1000,
                    first: start,
                    last: stop - 1,
                })
                .unwrap();
            }
        }
        // The final interval marks everything beyond the logical end as free,
        // out to a power-of-two horizon.
        if end < START_BIG_FILE {
            w.write_be(&FreeRecordSmall {
                version: FREE_CLASS_VERSION,
                first: end as u32,
                last: START_BIG_FILE as u32,
            })
            .unwrap();
        } else {
            let mut infinity = START_BIG_FILE;
            while end >= infinity {
                infinity *= 2;
            }
            w.write_be(&FreeRecordBig {
                version: FREE_CLASS_VERSION + 1000,
                first: end,
                last: infinity,
            })
            .unwrap();
        }
        Ok(w.into_inner())
    }

    pub fn write(&mut self, sink: &mut FileSink) -> Result<()> {
        if self.dirty {
            let location = self.location.ok_or_else(|| {
                Error::format(
                    sink.path(),
                    "can't write the free-space map at an unknown location",
                )
            })?;
            let data = self.serialize(sink.path())?;
            sink.write(location, &data)?;
            self.dirty = false;
        }
        Ok(())
    }

    pub fn deserialize(
        raw: &[u8],
        location: u64,
        num_bytes: u64,
        num_slices: usize,
        path: &Path,
    ) -> Result<FreeSegmentsData> {
        let err = |e: binrw::Error| Error::format(path, format!("truncated free-space map: {e}"));
        let mut r = IoCursor::new(raw);
        let mut slices = Vec::with_capacity(num_slices + 1);
        for _ in 0..num_slices + 1 {
            let record_start = r.position();
            let small: FreeRecordSmall = r.read_be().map_err(err)?;
            let (version, first, last): (u16, u64, u64) = if small.version >= 1000 {
                r.set_position(record_start);
                let record: FreeRecordBig = r.read_be().map_err(err)?;
                (record.version - 1000, record.first, record.last)
            } else {
                (small.version, small.first as u64, small.last as u64)
            };
            if version != FREE_CLASS_VERSION {
                return Err(Error::format(
                    path,
                    format!("can't update TFree version {version}, only version {FREE_CLASS_VERSION}"),
                ));
            }
            slices.push((first, last + 1));
        }
        let end = slices.pop().map(|(start, _)| start);
        if r.position() != num_bytes {
            return Err(Error::format(
                path,
                format!(
                    "free-space map occupies {} bytes but the header declares {num_bytes}",
                    r.position()
                ),
            ));
        }
        let mut out = FreeSegmentsData::new(Some(location), slices, end);
        out.allocation = Some(num_bytes);
        out.dirty = false;
        Ok(out)
    }
}

/// The disk-space allocator: the I/O equivalent of `malloc` and `free`.
///
/// Allocation and release usually change the size of the record itself, so
/// the record is kept at the end of the file whenever feasible, where it can
/// grow without bumping into anything.
pub struct FreeSegments {
    pub key: KeyLeaf,
    pub data: FreeSegmentsData,
    pub fileheader: Shared<HeaderLeaf>,
}

impl FreeSegments {
    pub fn new(key: KeyLeaf, data: FreeSegmentsData, fileheader: Shared<HeaderLeaf>) -> Self {
        FreeSegments {
            key,
            data,
            fileheader,
        }
    }

    pub fn at_end(&mut self) -> bool {
        let end_of_record = self.key.location.unwrap_or(0)
            + self.key.num_bytes()
            + self.data.allocation();
        match self.data.end {
            Some(end) => {
                debug_assert!(end_of_record <= end);
                end_of_record == end
            }
            None => false,
        }
    }

    /// Finds space for `num_bytes`: an exactly-fitting or larger free slice
    /// first, then the map's own slot (pushing the map toward the end), then
    /// the end of the file. A dry run reports the location without mutating.
    pub fn allocate(&mut self, num_bytes: u64, dry_run: bool) -> u64 {
        let slices = self.data.slices().to_vec();
        for (i, &(start, stop)) in slices.iter().enumerate() {
            if stop - start == num_bytes {
                // Consuming the whole slice shrinks the map record itself.
                if !dry_run {
                    let mut new_slices = slices.clone();
                    new_slices.remove(i);
                    self.data.set_slices(new_slices);
                }
                return start;
            } else if stop - start > num_bytes {
                if !dry_run {
                    let mut new_slices = slices.clone();
                    new_slices[i] = (start + num_bytes, stop);
                    self.data.set_slices(new_slices);
                }
                return start;
            }
        }

        if self.at_end() {
            // The new object takes the map's spot; the map moves to stay at
            // the end.
            let out = self.key.location.unwrap_or(0);
            if !dry_run {
                self.key.set_location(Some(out + num_bytes));
                let end = self.key.location.unwrap() + self.key.allocation() + self.data.allocation();
                self.data.set_end(end);
            }
            out
        } else {
            let out = self.data.end.unwrap_or(0);
            if !dry_run {
                self.data.set_end(out + num_bytes);
            }
            out
        }
    }

    fn another_slice(
        slices: &[(u64, u64)],
        original_start: u64,
        original_stop: u64,
        path: &Path,
    ) -> Result<Vec<(u64, u64)>> {
        for &(start, stop) in slices {
            if (start <= original_start && original_start < stop)
                || (start < original_stop && original_stop <= stop)
            {
                return Err(Error::Allocation {
                    path: path.to_path_buf(),
                    start: original_start,
                    stop: original_stop,
                    free_start: start,
                    free_stop: stop,
                });
            }
        }

        for i in 0..slices.len().saturating_sub(1) {
            if slices[i].1 == original_start && original_stop == slices[i + 1].0 {
                // The release bridges two slices; merge all three.
                let mut out = slices.to_vec();
                out[i] = (slices[i].0, slices[i + 1].1);
                out.remove(i + 1);
                return Ok(out);
            }
        }

        for (i, &(start, stop)) in slices.iter().enumerate() {
            if original_start == stop {
                let mut out = slices.to_vec();
                out[i] = (start, original_stop);
                return Ok(out);
            } else if original_stop == start {
                let mut out = slices.to_vec();
                out[i] = (original_start, stop);
                return Ok(out);
            }
        }

        let mut out = slices.to_vec();
        out.push((original_start, original_stop));
        out.sort_unstable();
        Ok(out)
    }

    /// Returns `[start, stop)` to the pool, merging with neighbors. If the
    /// record would grow while sitting mid-file, it moves itself to the end
    /// (releasing its old interval as part of the same operation).
    pub fn release(&mut self, start: u64, stop: u64) -> Result<()> {
        let path = self.fileheader.borrow().path.clone();
        let new_slices = Self::another_slice(self.data.slices(), start, stop, &path)?;

        if self.at_end() {
            self.data.set_slices(new_slices);
            self.data.reset_allocation();
            let allocation = self.data.allocation() as u32;
            self.key.set_uncompressed_bytes(allocation);
            self.key.set_compressed_bytes(allocation);
            let end =
                self.key.location.unwrap_or(0) + self.key.allocation() + allocation as u64;
            self.data.set_end(end);
        } else if FreeSegmentsData::slices_bytes(&new_slices)
            <= FreeSegmentsData::slices_bytes(self.data.slices())
        {
            // Not growing; it can stay where it is.
            self.data.set_slices(new_slices);
            self.data.reset_allocation();
            let allocation = self.data.allocation() as u32;
            self.key.set_uncompressed_bytes(allocation);
            self.key.set_compressed_bytes(allocation);
        } else {
            // The record must move, opening up its own old interval too.
            let old_start = self.key.location.unwrap_or(0);
            let old_stop = old_start + self.key.allocation() + self.data.allocation();
            let with_self = Self::another_slice(&new_slices, old_start, old_stop, &path)?;
            self.data.set_slices(with_self);
            self.data.reset_allocation();
            let allocation = self.data.allocation() as u32;
            self.key.set_uncompressed_bytes(allocation);
            self.key.set_compressed_bytes(allocation);
            let end = self.data.end.unwrap_or(0);
            self.key.set_location(Some(end));
            self.data
                .set_location(self.key.location.unwrap() + self.key.allocation());
            let new_end = self.data.location().unwrap() + allocation as u64;
            self.data.set_end(new_end);
        }
        Ok(())
    }

    /// Flushes the key, the interval data, and finally the file header (so a
    /// truncated flush leaves either the old map or a fully valid new one).
    pub fn write(&mut self, sink: &mut FileSink) -> Result<()> {
        let allocation = self.data.allocation() as u32;
        self.key.set_uncompressed_bytes(allocation);
        self.key.set_compressed_bytes(allocation);
        let key_location = self.key.location.ok_or_else(|| {
            Error::format(sink.path(), "free-space map has no location")
        })?;
        self.key.set_seek_location(key_location);
        self.data.set_location(key_location + self.key.allocation());
        {
            let mut header = self.fileheader.borrow_mut();
            header.set_free_location(key_location);
            header.set_free_num_bytes((self.key.allocation() + allocation as u64) as u32);
            header.set_free_num_slices(self.data.slices().len() as u32);
            if let Some(end) = self.data.end {
                header.set_end(end);
            }
        }
        self.key.write(sink)?;
        self.data.write(sink)?;
        self.fileheader.borrow_mut().write(sink)
    }
}

// ---------------------------------------------------------------------------

/// The on-disk header of the TList that carries the streamer records: byte
/// count, TList version, an inline `TObject` base, an empty name, and the
/// entry count.
#[binrw]
#[brw(big)]
struct ListHeaderRecord {
    byte_count: u32,
    version: u16,
    object_version: u16,
    unique_id: u32,
    bits: u32,
    name_length: u8,
    num_entries: u32,
}

/// The header of the TList that carries the streamer records.
#[derive(Clone, Debug)]
pub struct ListHeaderLeaf {
    location: Option<u64>,
    data_bytes: Option<u32>,
    num_entries: u32,
    dirty: bool,
}

impl ListHeaderLeaf {
    pub fn new(location: Option<u64>, data_bytes: Option<u32>, num_entries: u32) -> Self {
        ListHeaderLeaf {
            location,
            data_bytes,
            num_entries,
            dirty: true,
        }
    }

    pub fn set_location(&mut self, location: u64) {
        if self.location != Some(location) {
            self.location = Some(location);
            self.dirty = true;
        }
    }

    pub fn set_data_bytes(&mut self, data_bytes: u32) {
        if self.data_bytes != Some(data_bytes) {
            self.data_bytes = Some(data_bytes);
            self.dirty = true;
        }
    }

    pub fn set_num_entries(&mut self, num_entries: u32) {
        if self.num_entries != num_entries {
            self.num_entries = num_entries;
            self.dirty = true;
        }
    }

    pub fn num_bytes(&self) -> u64 {
        LIST_HEADER_BYTES
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = IoCursor::new(Vec::with_capacity(LIST_HEADER_BYTES as usize));
        w.write_be(&ListHeaderRecord {
            byte_count: (self.data_bytes.unwrap_or(4) - 4) | crate::BYTE_COUNT_MASK,
            version: LIST_CLASS_VERSION,
            object_version: 1,
            unique_id: 0,
            bits: crate::ObjectBits::NOT_DELETED.bits(),
            name_length: 0,
            num_entries: self.num_entries,
        })
        .unwrap();
        w.into_inner()
    }

    pub fn write(&mut self, sink: &mut FileSink) -> Result<()> {
        if self.dirty {
            let location = self.location.ok_or_else(|| {
                Error::format(sink.path(), "streamer list header has no location")
            })?;
            let data = self.serialize();
            sink.write(location, &data)?;
            self.dirty = false;
        }
        Ok(())
    }
}

/// One entry of the streamer list: either a `TStreamerInfo` or a nested
/// TList of TObjStrings (schema-evolution rules passed through verbatim).
#[derive(Clone, Debug)]
pub enum RawStreamer {
    Info {
        location: Option<u64>,
        serialization: Vec<u8>,
        name: String,
        class_version: i32,
        dirty: bool,
    },
    Strings {
        location: Option<u64>,
        serialization: Vec<u8>,
        dirty: bool,
    },
}

impl RawStreamer {
    pub fn num_bytes(&self) -> u64 {
        match self {
            RawStreamer::Info { serialization, .. }
            | RawStreamer::Strings { serialization, .. } => serialization.len() as u64,
        }
    }

    fn set_location(&mut self, new_location: u64) {
        match self {
            RawStreamer::Info {
                location, dirty, ..
            }
            | RawStreamer::Strings {
                location, dirty, ..
            } => {
                if *location != Some(new_location) {
                    *location = Some(new_location);
                    *dirty = true;
                }
            }
        }
    }

    fn write(&mut self, sink: &mut FileSink) -> Result<()> {
        match self {
            RawStreamer::Info {
                location,
                serialization,
                dirty,
                ..
            }
            | RawStreamer::Strings {
                location,
                serialization,
                dirty,
            } => {
                if *dirty {
                    let location = location.ok_or_else(|| {
                        Error::format(sink.path(), "streamer record has no location")
                    })?;
                    sink.write(location, serialization)?;
                    *dirty = false;
                }
                Ok(())
            }
        }
    }
}

/// The writable TList of `TStreamerInfo` records.
pub struct StreamerList {
    allocation: u64,
    pub key: KeyLeaf,
    header: ListHeaderLeaf,
    rawstreamers: Vec<RawStreamer>,
    pub freesegments: Shared<FreeSegments>,
    lookup: HashSet<(String, i32)>,
}

impl StreamerList {
    pub fn new(
        allocation: u64,
        key: KeyLeaf,
        header: ListHeaderLeaf,
        rawstreamers: Vec<RawStreamer>,
        freesegments: Shared<FreeSegments>,
    ) -> Self {
        let lookup = rawstreamers
            .iter()
            .filter_map(|raw| match raw {
                RawStreamer::Info {
                    name,
                    class_version,
                    ..
                } => Some((name.clone(), *class_version)),
                RawStreamer::Strings { .. } => None,
            })
            .collect();
        StreamerList {
            allocation,
            key,
            header,
            rawstreamers,
            freesegments,
            lookup,
        }
    }

    pub fn num_bytes(&self) -> u64 {
        self.header.num_bytes() + self.rawstreamers.iter().map(RawStreamer::num_bytes).sum::<u64>()
    }

    pub fn has(&self, name: &str, class_version: i32) -> bool {
        self.lookup.contains(&(name.to_string(), class_version))
    }

    /// Appends streamers that are not already present and flushes the list.
    /// Each serialization gains a trailing option byte, as TList items do.
    pub fn update_streamers(
        &mut self,
        sink: &mut FileSink,
        streamers: &[(String, i32, Vec<u8>)],
    ) -> Result<()> {
        for (name, class_version, serialization) in streamers {
            let pair = (name.clone(), *class_version);
            if self.lookup.contains(&pair) {
                continue;
            }
            self.lookup.insert(pair);
            let mut with_option = serialization.clone();
            with_option.push(0);
            self.rawstreamers.push(RawStreamer::Info {
                location: None,
                serialization: with_option,
                name: name.clone(),
                class_version: *class_version,
                dirty: true,
            });
        }
        self.write(sink)?;
        sink.flush()
    }

    fn reallocate(&mut self, self_num_bytes: u64) -> Result<()> {
        let original_start = self.key.location().unwrap_or(0);
        let original_stop = original_start + self.key.allocation() + self.allocation;

        let requested = self.key.num_bytes() + self_num_bytes;
        let mut freesegments = self.freesegments.borrow_mut();
        let new_location = freesegments.allocate(requested, false);
        self.key.set_location(Some(new_location));
        self.key.set_seek_location(new_location);
        self.allocation = self_num_bytes;
        freesegments.release(original_start, original_stop)
    }

    pub fn write(&mut self, sink: &mut FileSink) -> Result<()> {
        let self_num_bytes = self.num_bytes();
        if self_num_bytes > self.allocation {
            self.reallocate(self_num_bytes)?;
        }

        let after_key = self.key.location().unwrap_or(0) + self.key.num_bytes();
        let mut position = after_key;
        self.header.set_location(position);
        position += self.header.num_bytes();
        for raw in &mut self.rawstreamers {
            raw.set_location(position);
            position += raw.num_bytes();
        }
        self.header.set_data_bytes((position - after_key) as u32);
        self.header.set_num_entries(self.rawstreamers.len() as u32);

        self.key.set_uncompressed_bytes(self.allocation as u32);
        self.key.set_compressed_bytes(self.allocation as u32);
        {
            let freesegments = self.freesegments.borrow();
            let mut header = freesegments.fileheader.borrow_mut();
            header.set_info_location(self.key.location().unwrap_or(0));
            header.set_info_num_bytes((self.key.allocation() + self.allocation) as u32);
        }

        self.freesegments.borrow_mut().write(sink)?;
        self.key.write(sink)?;
        self.header.write(sink)?;
        for raw in &mut self.rawstreamers {
            raw.write(sink)?;
        }
        Ok(())
    }

    /// Rebuilds the writable list from a preexisting file's streamer record,
    /// capturing each entry's bytes verbatim. Also returns the parsed
    /// streamers for lookups while updating.
    pub fn deserialize(
        raw_bytes: &[u8],
        location: u64,
        key: KeyLeaf,
        freesegments: Shared<FreeSegments>,
        path: &Path,
    ) -> Result<(StreamerList, Vec<StreamerInfo>)> {
        let resolver = ReadForUpdate {
            path: path.to_path_buf(),
        };
        let compressed = key.compressed_bytes().unwrap_or(0) as u64;
        let uncompressed_len = key.uncompressed_bytes().unwrap_or(0) as u64;

        let uncompressed = if compressed == uncompressed_len {
            raw_bytes.to_vec()
        } else {
            let chunk = Chunk::wrap(raw_bytes.to_vec());
            let mut cursor = Cursor::new(0);
            crate::compression::decompress(&chunk, &mut cursor, compressed, uncompressed_len, path)?
        };
        let chunk = Chunk::wrap(uncompressed);
        let mut cursor = Cursor::with_origin(0, -(key.num_bytes() as i64));
        let mut ctx = ReadContext::new(&resolver);
        let tlist = crate::deserialization::read_class("TList", &chunk, &mut cursor, &mut ctx)?;

        let items = tlist
            .member("items")
            .and_then(Value::as_list)
            .map(|s| s.to_vec())
            .unwrap_or_default();
        let ranges = match tlist.member("@byte_ranges") {
            Some(Value::ArrayU64(ranges)) => ranges.clone(),
            _ => Vec::new(),
        };

        let header = ListHeaderLeaf::new(
            Some(location),
            key.uncompressed_bytes(),
            items.len() as u32,
        );

        let mut rawstreamers = Vec::new();
        let mut infos = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let serialization = chunk
                .get(ranges[2 * i], ranges[2 * i + 1], path)?
                .to_vec();
            match item {
                Value::Object(model) if model.classname == "TStreamerInfo" => {
                    let name = model
                        .member("fName")
                        .and_then(|v| v.as_str().map(str::to_owned))
                        .unwrap_or_default();
                    let class_version = model
                        .member("fClassVersion")
                        .and_then(Value::as_i64)
                        .unwrap_or(0) as i32;
                    rawstreamers.push(RawStreamer::Info {
                        location: Some(location + ranges[2 * i]),
                        serialization: serialization.clone(),
                        name: name.clone(),
                        class_version,
                        dirty: false,
                    });
                    if let Some(info) = crate::streamers::StreamerRegistry::info_from_model(
                        model.as_ref(),
                        serialization,
                    ) {
                        infos.push(info);
                    }
                }
                Value::Object(model) if model.classname == "TList" => {
                    rawstreamers.push(RawStreamer::Strings {
                        location: Some(location + ranges[2 * i]),
                        serialization,
                        dirty: false,
                    });
                }
                _ => {}
            }
        }

        let compressed_allocation = key.compressed_bytes().unwrap_or(0) as u64;
        Ok((
            StreamerList::new(
                compressed_allocation,
                key,
                header,
                rawstreamers,
                freesegments,
            ),
            infos,
        ))
    }
}

/// A minimal resolver for reading records while updating a file: bootstrap
/// classes only, no streamers.
struct ReadForUpdate {
    path: std::path::PathBuf,
}

impl ClassResolver for ReadForUpdate {
    fn file_path(&self) -> &Path {
        &self.path
    }

    fn class_named(&self, classname: &str) -> ClassDef {
        bootstrap_registry()
            .get(classname)
            .cloned()
            .unwrap_or(ClassDef::Unknown)
    }

    fn streamer_named(&self, _classname: &str, _version: Option<i32>) -> Option<std::sync::Arc<StreamerInfo>> {
        None
    }
}

// ---------------------------------------------------------------------------

/// The writable two-part directory: a table of child keys (this leaf) plus a
/// fixed-size header elsewhere.
pub struct DirectoryData {
    location: Option<u64>,
    allocation: Option<u64>,
    keys: Vec<KeyLeaf>,
    keys_num_bytes: u64,
    dirty: bool,
    dirty_keys: Vec<usize>,
    dirty_keys_start: Option<u64>,
}

impl DirectoryData {
    pub fn new(location: Option<u64>, allocation: Option<u64>, keys: Vec<KeyLeaf>) -> Self {
        let keys_num_bytes = keys.iter().map(KeyLeaf::allocation).sum();
        DirectoryData {
            location,
            allocation,
            keys,
            keys_num_bytes,
            dirty: true,
            dirty_keys: Vec::new(),
            dirty_keys_start: None,
        }
    }

    pub fn location(&self) -> Option<u64> {
        self.location
    }

    pub fn set_location(&mut self, location: u64) {
        if self.location != Some(location) {
            self.location = Some(location);
            self.dirty = true;
        }
    }

    pub fn allocation(&mut self) -> u64 {
        if self.allocation.is_none() {
            self.allocation = Some(self.num_bytes());
        }
        self.allocation.unwrap()
    }

    pub fn set_allocation(&mut self, allocation: u64) {
        if self.allocation != Some(allocation) {
            self.allocation = Some(allocation);
            self.dirty = true;
        }
    }

    pub fn next_cycle(&self, name: &str) -> u16 {
        self.keys
            .iter()
            .filter(|key| key.name() == name)
            .map(|key| key.cycle() + 1)
            .max()
            .unwrap_or(1)
    }

    pub fn add_key(&mut self, key: KeyLeaf, incremental: bool) {
        self.keys_num_bytes += key.allocation();
        self.keys.push(key);
        if incremental {
            self.dirty_keys.push(self.keys.len() - 1);
        } else {
            self.dirty = true;
        }
    }

    pub fn replace_key(&mut self, key: KeyLeaf) -> Result<()> {
        for i in 0..self.keys.len() {
            if self.keys[i].name() == key.name() && self.keys[i].cycle() == key.cycle() {
                self.keys_num_bytes += key.allocation();
                self.keys_num_bytes -= self.keys[i].allocation();
                self.keys[i] = key;
                self.dirty = true;
                return Ok(());
            }
        }
        Err(Error::format(
            Path::new(""),
            format!("no key named {:?} cycle {} to replace", key.name(), key.cycle()),
        ))
    }

    pub fn get_key(&self, name: &str, cycle: Option<u16>) -> Option<&KeyLeaf> {
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

    pub fn key_names(&self) -> Vec<String> {
        self.keys
            .iter()
            .map(|key| format!("{};{}", key.name(), key.cycle()))
            .collect()
    }

    pub fn keys(&self) -> &[KeyLeaf] {
        &self.keys
    }

    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn num_bytes(&self) -> u64 {
        4 + self.keys_num_bytes
    }

    pub fn next_location(&self) -> Option<u64> {
        self.location.map(|location| location + self.num_bytes())
    }

    pub fn serialize(&self, path: &Path) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.num_bytes() as usize);
        out.extend_from_slice(&(self.keys.len() as i32).to_be_bytes());
        for key in &self.keys {
            out.extend_from_slice(&key.serialize(path)?);
        }
        Ok(out)
    }

    /// A full rewrite when the table itself changed; otherwise only the key
    /// count and the newly appended keys.
    pub fn write(&mut self, sink: &mut FileSink) -> Result<()> {
        if self.dirty {
            let location = self.location.ok_or_else(|| {
                Error::format(sink.path(), "directory data has no location")
            })?;
            let data = self.serialize(sink.path())?;
            self.dirty_keys_start = Some(location + data.len() as u64);
            sink.write(location, &data)?;
            self.dirty = false;
        } else {
            let location = self.location.ok_or_else(|| {
                Error::format(sink.path(), "directory data has no location")
            })?;
            sink.write(location, &(self.keys.len() as i32).to_be_bytes())?;
            let mut start = self.dirty_keys_start.unwrap_or(location + 4);
            for &index in &self.dirty_keys {
                let mut copied = self.keys[index].copy_to();
                copied.set_location(Some(start));
                copied.write(sink)?;
                start += copied.num_bytes();
            }
            self.dirty_keys_start = Some(start);
        }
        self.dirty_keys.clear();
        Ok(())
    }

    pub fn deserialize(raw: &[u8], location: u64, path: &Path) -> Result<DirectoryData> {
        let num_keys = i32::from_be_bytes(raw[..4].try_into().unwrap()).max(0);
        let mut position = 4usize;
        let mut keys = Vec::with_capacity(num_keys as usize);
        for _ in 0..num_keys {
            let key = KeyLeaf::deserialize(&raw[position..], location + position as u64, path, true)?;
            position += key.num_bytes() as usize;
            keys.push(key);
        }
        let mut out = DirectoryData::new(Some(location), Some(raw.len() as u64), keys);
        out.dirty = false;
        out.dirty_keys_start = Some(location + position as u64);
        Ok(out)
    }
}

/// The fixed-size part of a writable directory: timestamps, UUID, and the
/// seek points that anchor the name/header block and the data block.
pub struct DirectoryHeaderLeaf {
    location: Option<u64>,
    begin_location: Option<u64>,
    begin_num_bytes: Option<u32>,
    data_location: Option<u64>,
    data_num_bytes: Option<u32>,
    parent_location: u64,
    uuid: Uuid,
    created_on: u32,
    modified_on: u32,
    dirty: bool,
}

impl DirectoryHeaderLeaf {
    pub fn new(
        location: Option<u64>,
        begin_location: Option<u64>,
        begin_num_bytes: Option<u32>,
        data_location: Option<u64>,
        data_num_bytes: Option<u32>,
        parent_location: u64,
        uuid: Uuid,
    ) -> Self {
        let now = serialization::datime_now();
        DirectoryHeaderLeaf {
            location,
            begin_location,
            begin_num_bytes,
            data_location,
            data_num_bytes,
            parent_location,
            uuid,
            created_on: now,
            modified_on: now,
            dirty: true,
        }
    }

    pub fn location(&self) -> Option<u64> {
        self.location
    }

    pub fn set_location(&mut self, location: u64) {
        if self.location != Some(location) {
            self.location = Some(location);
            self.dirty = true;
        }
    }

    pub fn set_begin_location(&mut self, begin_location: u64) {
        if self.begin_location != Some(begin_location) {
            self.begin_location = Some(begin_location);
            self.dirty = true;
        }
    }

    pub fn set_begin_num_bytes(&mut self, begin_num_bytes: u32) {
        if self.begin_num_bytes != Some(begin_num_bytes) {
            self.begin_num_bytes = Some(begin_num_bytes);
            self.dirty = true;
        }
    }

    pub fn data_location(&self) -> Option<u64> {
        self.data_location
    }

    pub fn set_data_location(&mut self, data_location: u64) {
        if self.data_location != Some(data_location) {
            self.data_location = Some(data_location);
            self.dirty = true;
        }
    }

    pub fn set_data_num_bytes(&mut self, data_num_bytes: u32) {
        if self.data_num_bytes != Some(data_num_bytes) {
            self.data_num_bytes = Some(data_num_bytes);
            self.dirty = true;
        }
    }

    pub fn parent_location(&self) -> u64 {
        self.parent_location
    }

    pub fn touch(&mut self) {
        self.modified_on = serialization::datime_now();
        self.dirty = true;
    }

    pub fn big(&self) -> bool {
        self.begin_location.unwrap_or(0) >= START_BIG_FILE
            || self.data_location.unwrap_or(0) >= START_BIG_FILE
            || self.parent_location >= START_BIG_FILE
    }

    pub fn num_bytes(&self) -> u64 {
        if self.big() {
            DIRECTORY_BIG_BYTES
        } else {
            DIRECTORY_SMALL_BYTES
        }
    }

    /// The on-disk reservation is always the big form plus the UUID, so the
    /// header never outgrows its slot.
    pub fn allocation(&self) -> u64 {
        DIRECTORY_BIG_BYTES + 18
    }

    pub fn serialize(&self) -> Vec<u8> {
        let big = self.big();
        let mut w = IoCursor::new(Vec::with_capacity(self.allocation() as usize));
        if big {
            w.write_be(&DirectoryRecordBig {
                version: DIRECTORY_CLASS_VERSION + 1000,
                datime_created: self.created_on,
                datime_modified: self.modified_on,
                nbytes_keys: self.data_num_bytes.unwrap_or(0) as i32,
                nbytes_name: self.begin_num_bytes.unwrap_or(0) as i32,
                seek_dir: self.begin_location.unwrap_or(0) as i64,
                seek_parent: self.parent_location as i64,
                seek_keys: self.data_location.unwrap_or(0) as i64,
            })
            .unwrap();
        } else {
            w.write_be(&DirectoryRecordSmall {
                version: DIRECTORY_CLASS_VERSION,
                datime_created: self.created_on,
                datime_modified: self.modified_on,
                nbytes_keys: self.data_num_bytes.unwrap_or(0) as i32,
                nbytes_name: self.begin_num_bytes.unwrap_or(0) as i32,
                seek_dir: self.begin_location.unwrap_or(0) as i32,
                seek_parent: self.parent_location as i32,
                seek_keys: self.data_location.unwrap_or(0) as i32,
            })
            .unwrap();
        }
        let mut out = w.into_inner();
        out.extend_from_slice(&[0, 1]); // TUUID version 1
        out.extend_from_slice(self.uuid.as_bytes());
        if !big {
            out.extend_from_slice(&[0u8; 12]);
        }
        out
    }

    pub fn write(&mut self, sink: &mut FileSink) -> Result<()> {
        if self.dirty {
            let location = self.location.ok_or_else(|| {
                Error::format(sink.path(), "directory header has no location")
            })?;
            let data = self.serialize();
            sink.write(location, &data)?;
            self.dirty = false;
        }
        Ok(())
    }

    pub fn deserialize(raw: &[u8], location: u64, path: &Path) -> Result<DirectoryHeaderLeaf> {
        let err = |e: binrw::Error| Error::format(path, format!("truncated directory header: {e}"));
        let mut r = IoCursor::new(raw);
        let small: DirectoryRecordSmall = r.read_be().map_err(err)?;
        let big = small.version >= 1000;
        let (
            version,
            created_on,
            modified_on,
            data_num_bytes,
            begin_num_bytes,
            begin_location,
            parent_location,
            data_location,
        ) = if big {
            r.set_position(0);
            let record: DirectoryRecordBig = r.read_be().map_err(err)?;
            (
                record.version - 1000,
                record.datime_created,
                record.datime_modified,
                record.nbytes_keys,
                record.nbytes_name,
                record.seek_dir as u64,
                record.seek_parent as u64,
                record.seek_keys as u64,
            )
        } else {
            (
                small.version,
                small.datime_created,
                small.datime_modified,
                small.nbytes_keys,
                small.nbytes_name,
                small.seek_dir as u64,
                small.seek_parent as u64,
                small.seek_keys as u64,
            )
        };
        if version != DIRECTORY_CLASS_VERSION {
            return Err(Error::format(
                path,
                format!(
                    "can't update TDirectory version {version}, only version {DIRECTORY_CLASS_VERSION}"
                ),
            ));
        }
        let position = r.position() as usize;
        if raw[position..position + 2] != [0, 1] {
            return Err(Error::format(path, "directory header has no TUUID"));
        }
        let uuid = Uuid::from_slice(&raw[position + 2..position + 18])
            .map_err(|e| Error::format(path, format!("bad directory UUID: {e}")))?;

        let mut out = DirectoryHeaderLeaf::new(
            Some(location),
            Some(begin_location),
            Some(begin_num_bytes as u32),
            Some(data_location),
            Some(data_num_bytes as u32),
            parent_location,
            uuid,
        );
        out.created_on = created_on;
        out.modified_on = modified_on;
        out.dirty = false;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------

/// Whether a directory is the file's root (which carries its own name and
/// title strings) or a subdirectory.
pub enum DirectoryKind {
    Root {
        name: StringLeaf,
        title: StringLeaf,
    },
    Sub,
}

/// A writable directory node: key, header, and the data block of child keys.
pub struct Directory {
    pub kind: DirectoryKind,
    pub key: KeyLeaf,
    pub header: DirectoryHeaderLeaf,
    pub datakey: KeyLeaf,
    pub data: DirectoryData,
    pub freesegments: Shared<FreeSegments>,
}

impl Directory {
    fn reallocate_data(&mut self, new_data_size: u64) -> Result<()> {
        let original_start = self.datakey.location().unwrap_or(0);
        let original_stop =
            original_start + self.datakey.num_bytes() + self.data.allocation();

        // Let the key assume it might be big at the new location.
        self.datakey.set_location(None);
        let requested = self.datakey.num_bytes() + new_data_size;
        let new_location = self.freesegments.borrow_mut().allocate(requested, false);
        self.datakey.set_location(Some(new_location));
        self.datakey.set_seek_location(new_location);
        self.header.set_data_location(new_location);
        self.data
            .set_location(new_location + self.datakey.num_bytes());
        let might_be_slightly_more = requested - self.datakey.num_bytes();
        self.data.set_allocation(might_be_slightly_more);

        self.freesegments
            .borrow_mut()
            .release(original_start, original_stop)
    }

    /// Places a serialized object in the file under this directory.
    ///
    /// Picks the object's cycle, allocates space (trying the small key form
    /// first unless forced big), writes the key and payload, registers the
    /// key in the data block (growing it by 1.5x on overflow), refreshes the
    /// modification time, and flushes.
    #[allow(clippy::too_many_arguments)]
    pub fn add_object(
        &mut self,
        sink: &mut FileSink,
        classname: &str,
        name: &str,
        title: &str,
        raw_data: &[u8],
        uncompressed_bytes: u32,
        replaces: Option<(&str, u16)>,
        big: Option<bool>,
    ) -> Result<KeyLeaf> {
        let cycle = match replaces {
            Some((_, cycle)) => cycle,
            None => self.data.next_cycle(name),
        };

        let strings_size = serialization::string_size(classname)
            + serialization::string_size(name)
            + serialization::string_size(title);
        let parent_location = self.key.location().unwrap_or(0);

        let mut location = None;
        if big != Some(true) && parent_location < START_BIG_FILE {
            let requested = KEY_SMALL_BYTES + strings_size + raw_data.len() as u64;
            let candidate = self.freesegments.borrow_mut().allocate(requested, true);
            if candidate < START_BIG_FILE {
                self.freesegments.borrow_mut().allocate(requested, false);
                location = Some(candidate);
            }
        }
        let location = match location {
            Some(location) => location,
            None => {
                let requested = KEY_BIG_BYTES + strings_size + raw_data.len() as u64;
                self.freesegments.borrow_mut().allocate(requested, false)
            }
        };

        let mut key = KeyLeaf::new(
            Some(location),
            Some(uncompressed_bytes),
            Some(raw_data.len() as u32),
            classname,
            name,
            title,
            cycle,
            parent_location,
            Some(location),
        );
        if big == Some(true) {
            key.force_big();
        }

        match replaces {
            None => {
                let mut next_key = key.copy_to();
                if self.data.num_bytes() + next_key.num_bytes() > self.data.allocation() {
                    let requested = ((self.data.allocation()
                        + next_key.num_bytes()
                        + 8) as f64
                        * 1.5)
                        .ceil() as u64;
                    self.reallocate_data(requested)?;
                    next_key = key.copy_to();
                }
                self.data.add_key(next_key, true);
            }
            Some((replace_name, replace_cycle)) => {
                let original_allocation = self
                    .data
                    .get_key(replace_name, Some(replace_cycle))
                    .map(KeyLeaf::allocation)
                    .ok_or_else(|| {
                        Error::format(
                            sink.path(),
                            format!("no key named {replace_name:?} cycle {replace_cycle} to replace"),
                        )
                    })?;
                let new_key = key.copy_to();
                if self.data.num_bytes() + new_key.num_bytes() - original_allocation
                    > self.data.allocation()
                {
                    let requested = ((self.data.allocation() + new_key.num_bytes() + 8) as f64
                        * 1.5)
                        .ceil() as u64;
                    self.reallocate_data(requested)?;
                }
                self.data.replace_key(key.copy_to())?;
            }
        }

        self.header.touch();

        key.write(sink)?;
        sink.write(location + key.num_bytes(), raw_data)?;
        self.write(sink)?;
        let end = self.freesegments.borrow().fileheader.borrow().end();
        if let Some(end) = end {
            sink.set_file_length(end)?;
        }
        sink.flush()?;

        debug!(classname, name, cycle, location, "added object");
        Ok(key)
    }

    /// Creates an empty subdirectory with room for `initial_directory_bytes`
    /// of child keys.
    pub fn add_directory(
        &mut self,
        sink: &mut FileSink,
        name: &str,
        initial_directory_bytes: u64,
        uuid: Uuid,
    ) -> Result<Directory> {
        let cycle = self.data.next_cycle(name);
        let parent_location = self.key.location().unwrap_or(0);

        let mut subdirectory_key = KeyLeaf::new(
            None,
            None,
            None,
            "TDirectory",
            name,
            name,
            cycle,
            parent_location,
            None,
        );
        let subdirectory_header =
            DirectoryHeaderLeaf::new(None, None, None, None, None, parent_location, uuid);
        let mut subdirectory_datakey = KeyLeaf::new(
            None,
            None,
            None,
            "TDirectory",
            name,
            name,
            cycle,
            parent_location,
            None,
        );

        let requested = subdirectory_key.num_bytes()
            + subdirectory_header.allocation()
            + subdirectory_datakey.num_bytes()
            + initial_directory_bytes;
        let key_location = self.freesegments.borrow_mut().allocate(requested, false);
        subdirectory_key.set_location(Some(key_location));
        subdirectory_key.set_seek_location(key_location);
        let datakey_location =
            key_location + subdirectory_key.num_bytes() + subdirectory_header.allocation();
        subdirectory_datakey.set_location(Some(datakey_location));
        subdirectory_datakey.set_seek_location(datakey_location);
        let might_be_slightly_more = requested
            - (subdirectory_key.num_bytes()
                + subdirectory_header.allocation()
                + subdirectory_datakey.num_bytes());
        let subdirectory_data = DirectoryData::new(None, Some(might_be_slightly_more), Vec::new());

        let header_allocation = subdirectory_header.allocation() as u32;
        subdirectory_key.set_uncompressed_bytes(header_allocation);
        subdirectory_key.set_compressed_bytes(header_allocation);

        let mut subdirectory = Directory {
            kind: DirectoryKind::Sub,
            key: subdirectory_key,
            header: subdirectory_header,
            datakey: subdirectory_datakey,
            data: subdirectory_data,
            freesegments: Rc::clone(&self.freesegments),
        };

        let mut next_key = subdirectory.key.copy_to();
        if self.data.num_bytes() + next_key.num_bytes() > self.data.allocation() {
            let requested =
                ((self.data.allocation() + next_key.num_bytes() + 8) as f64 * 1.5).ceil() as u64;
            self.reallocate_data(requested)?;
            next_key = subdirectory.key.copy_to();
        }
        self.data.add_key(next_key, true);

        self.header.touch();

        subdirectory.write(sink)?;
        self.write(sink)?;
        let end = self.freesegments.borrow().fileheader.borrow().end();
        if let Some(end) = end {
            sink.set_file_length(end)?;
        }
        sink.flush()?;

        Ok(subdirectory)
    }

    /// Propagates positions to the children and flushes them in dependency
    /// order.
    pub fn write(&mut self, sink: &mut FileSink) -> Result<()> {
        match &mut self.kind {
            DirectoryKind::Root { name, title } => {
                let key_location = self.key.location().ok_or_else(|| {
                    Error::format(sink.path(), "root directory has no location")
                })?;
                let uncompressed = (name.allocation()
                    + title.allocation()
                    + self.header.allocation()) as u32;
                self.key.set_uncompressed_bytes(uncompressed);
                self.key.set_compressed_bytes(uncompressed);
                name.set_location(key_location + self.key.allocation());
                title.set_location(name.location().unwrap() + name.allocation());
                self.header
                    .set_location(title.location().unwrap() + title.allocation());
                self.header.set_begin_location(key_location);
                let begin_num_bytes = (self.key.allocation()
                    + name.allocation()
                    + title.allocation()) as u32;
                self.header.set_begin_num_bytes(begin_num_bytes);
                let datakey_location = self.datakey.location().ok_or_else(|| {
                    Error::format(sink.path(), "root directory data has no location")
                })?;
                self.header.set_data_location(datakey_location);
                self.header.set_data_num_bytes(
                    (self.datakey.allocation() + self.data.allocation()) as u32,
                );
                let data_allocation = self.data.allocation() as u32;
                self.datakey.set_uncompressed_bytes(data_allocation);
                self.datakey.set_compressed_bytes(data_allocation);
                self.data
                    .set_location(datakey_location + self.datakey.allocation());
                self.freesegments
                    .borrow()
                    .fileheader
                    .borrow_mut()
                    .set_begin_num_bytes(begin_num_bytes);

                self.freesegments.borrow_mut().write(sink)?;
                self.datakey.write(sink)?;
                self.data.write(sink)?;
                self.key.write(sink)?;
                name.write(sink)?;
                title.write(sink)?;
                self.header.write(sink)
            }
            DirectoryKind::Sub => {
                let key_location = self.key.location().ok_or_else(|| {
                    Error::format(sink.path(), "subdirectory has no location")
                })?;
                let header_allocation = self.header.allocation() as u32;
                self.key.set_uncompressed_bytes(header_allocation);
                self.key.set_compressed_bytes(header_allocation);
                self.header
                    .set_location(key_location + self.key.allocation());
                self.header.set_begin_location(key_location);
                self.header
                    .set_begin_num_bytes(self.key.num_bytes() as u32);
                let datakey_location = self.datakey.location().ok_or_else(|| {
                    Error::format(sink.path(), "subdirectory data has no location")
                })?;
                self.header.set_data_location(datakey_location);
                self.header.set_data_num_bytes(
                    (self.datakey.allocation() + self.data.allocation()) as u32,
                );
                let data_allocation = self.data.allocation() as u32;
                self.datakey.set_uncompressed_bytes(data_allocation);
                self.datakey.set_compressed_bytes(data_allocation);
                self.data
                    .set_location(datakey_location + self.datakey.allocation());

                self.freesegments.borrow_mut().write(sink)?;
                self.datakey.write(sink)?;
                self.data.write(sink)?;
                self.key.write(sink)?;
                self.header.write(sink)
            }
        }
    }
}

// ---------------------------------------------------------------------------

/// The writable 100-byte file header.
pub struct HeaderLeaf {
    pub path: std::path::PathBuf,
    end: Option<u64>,
    free_location: Option<u64>,
    free_num_bytes: Option<u32>,
    free_num_slices: Option<u32>,
    begin_num_bytes: Option<u32>,
    compression: Option<Compression>,
    info_location: Option<u64>,
    info_num_bytes: Option<u32>,
    uuid: Uuid,
    version: i32,
    begin: u64,
    dirty: bool,
}

impl HeaderLeaf {
    pub fn new(path: std::path::PathBuf, compression: Option<Compression>, uuid: Uuid) -> Self {
        HeaderLeaf {
            path,
            end: None,
            free_location: None,
            free_num_bytes: None,
            free_num_slices: None,
            begin_num_bytes: None,
            compression,
            info_location: None,
            info_num_bytes: None,
            uuid,
            version: FILE_CLASS_VERSION,
            begin: 100,
            dirty: true,
        }
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> Option<u64> {
        self.end
    }

    pub fn set_end(&mut self, end: u64) {
        if self.end != Some(end) {
            self.end = Some(end);
            self.dirty = true;
        }
    }

    pub fn compression(&self) -> Option<Compression> {
        self.compression
    }

    pub fn set_compression(&mut self, compression: Option<Compression>) {
        if self.compression != compression {
            self.compression = compression;
            self.dirty = true;
        }
    }

    pub fn info_location(&self) -> Option<u64> {
        self.info_location
    }

    pub fn set_free_location(&mut self, value: u64) {
        if self.free_location != Some(value) {
            self.free_location = Some(value);
            self.dirty = true;
        }
    }

    pub fn set_free_num_bytes(&mut self, value: u32) {
        if self.free_num_bytes != Some(value) {
            self.free_num_bytes = Some(value);
            self.dirty = true;
        }
    }

    pub fn set_free_num_slices(&mut self, value: u32) {
        if self.free_num_slices != Some(value) {
            self.free_num_slices = Some(value);
            self.dirty = true;
        }
    }

    pub fn set_begin_num_bytes(&mut self, value: u32) {
        if self.begin_num_bytes != Some(value) {
            self.begin_num_bytes = Some(value);
            self.dirty = true;
        }
    }

    pub fn set_info_location(&mut self, value: u64) {
        if self.info_location != Some(value) {
            self.info_location = Some(value);
            self.dirty = true;
        }
    }

    pub fn set_info_num_bytes(&mut self, value: u32) {
        if self.info_num_bytes != Some(value) {
            self.info_num_bytes = Some(value);
            self.dirty = true;
        }
    }

    pub fn big(&self) -> bool {
        match self.end {
            None => true,
            Some(end) => {
                end >= START_BIG_FILE
                    || self.free_location.unwrap_or(0) >= START_BIG_FILE
                    || self.info_location.unwrap_or(0) >= START_BIG_FILE
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let big = self.big();
        let compression_code = self.compression.map_or(0, |c| c.code());
        let mut w = IoCursor::new(Vec::with_capacity(100));
        if big {
            w.write_be(&FileHeaderRecordBig {
                version: self.version + 1_000_000,
                begin: self.begin as i32,
                end: self.end.unwrap_or(0) as i64,
                seek_free: self.free_location.unwrap_or(0) as i64,
                nbytes_free: self.free_num_bytes.unwrap_or(0) as i32,
                nfree: (self.free_num_slices.unwrap_or(0) + 1) as i32,
                nbytes_name: self.begin_num_bytes.unwrap_or(0) as i32,
                units: 8,
                compress: compression_code,
                seek_info: self.info_location.unwrap_or(0) as i64,
                nbytes_info: self.info_num_bytes.unwrap_or(0) as i32,
                uuid_version: 1,
                uuid: *self.uuid.as_bytes(),
            })
            .unwrap();
        } else {
            w.write_be(&FileHeaderRecordSmall {
                version: self.version,
                begin: self.begin as i32,
                end: self.end.unwrap_or(0) as i32,
                seek_free: self.free_location.unwrap_or(0) as i32,
                nbytes_free: self.free_num_bytes.unwrap_or(0) as i32,
                nfree: (self.free_num_slices.unwrap_or(0) + 1) as i32,
                nbytes_name: self.begin_num_bytes.unwrap_or(0) as i32,
                units: 4,
                compress: compression_code,
                seek_info: self.info_location.unwrap_or(0) as i32,
                nbytes_info: self.info_num_bytes.unwrap_or(0) as i32,
                uuid_version: 1,
                uuid: *self.uuid.as_bytes(),
            })
            .unwrap();
        }
        let mut out = w.into_inner();
        out.resize(100, 0);
        out
    }

    pub fn write(&mut self, sink: &mut FileSink) -> Result<()> {
        if self.dirty {
            let data = self.serialize();
            sink.write(0, &data)?;
            self.dirty = false;
        }
        Ok(())
    }

    pub fn deserialize(raw: &[u8], path: &Path) -> Result<HeaderLeaf> {
        let parsed = crate::reading::FileHeader::parse(raw, path)?;
        let mut out = HeaderLeaf::new(
            path.to_path_buf(),
            Compression::from_code(parsed.compression_code),
            Uuid::from_bytes(parsed.uuid),
        );
        out.end = Some(parsed.end);
        out.free_location = Some(parsed.seek_free);
        out.free_num_bytes = Some(parsed.nbytes_free as u32);
        out.free_num_slices = Some((parsed.nfree - 1).max(0) as u32);
        out.begin_num_bytes = Some(parsed.nbytes_name as u32);
        out.info_location = Some(parsed.seek_info);
        out.info_num_bytes = Some(parsed.nbytes_info as u32);
        out.version = parsed.version;
        out.begin = parsed.begin;
        out.dirty = false;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------

/// The root of the cascade: every writable structure in one file.
pub struct CascadingFile {
    pub fileheader: Shared<HeaderLeaf>,
    pub freesegments: Shared<FreeSegments>,
    pub streamers: Shared<StreamerList>,
    pub rootdirectory: Shared<Directory>,
}

impl CascadingFile {
    /// Flushes everything that is still dirty: directories before the
    /// streamer list, the free-space map (and with it the file header) last.
    pub fn flush(&self, sink: &mut FileSink) -> Result<()> {
        self.rootdirectory.borrow_mut().write(sink)?;
        self.streamers.borrow_mut().write(sink)?;
        self.freesegments.borrow_mut().write(sink)?;
        sink.flush()
    }
}

/// Lays out and writes an empty file: root directory, empty streamer list,
/// free-space map, and header.
pub fn create_empty(
    sink: &mut FileSink,
    compression: Option<Compression>,
    initial_directory_bytes: u64,
    initial_streamers_bytes: u64,
) -> Result<CascadingFile> {
    let filename = sink
        .path()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("dynamic.root"));
    if filename.len() >= 256 {
        return Err(Error::format(
            sink.path(),
            "file names must be shorter than 256 bytes",
        ));
    }

    let fileheader = shared(HeaderLeaf::new(
        sink.path().to_path_buf(),
        compression,
        Uuid::new_v4(),
    ));
    let begin = fileheader.borrow().begin();

    let freesegments_key = KeyLeaf::new(
        None,
        None,
        None,
        "TFile",
        filename.clone(),
        "",
        1,
        begin,
        None,
    );
    let freesegments_data = FreeSegmentsData::new(None, Vec::new(), None);
    let freesegments = shared(FreeSegments::new(
        freesegments_key,
        freesegments_data,
        Rc::clone(&fileheader),
    ));

    let streamers_key = KeyLeaf::new(
        None,
        None,
        None,
        "TList",
        "StreamerInfo",
        "Doubly linked list",
        1,
        begin,
        None,
    );
    let streamers_header = ListHeaderLeaf::new(None, None, 0);
    let streamers = shared(StreamerList::new(
        initial_streamers_bytes,
        streamers_key,
        streamers_header,
        Vec::new(),
        Rc::clone(&freesegments),
    ));

    let directory_key = KeyLeaf::new(
        None,
        None,
        None,
        "TFile",
        filename.clone(),
        "",
        1,
        0,
        None,
    );
    let directory_name = StringLeaf::new(None, filename.clone());
    let directory_title = StringLeaf::new(None, "");
    let directory_header =
        DirectoryHeaderLeaf::new(None, Some(begin), None, None, None, 0, Uuid::new_v4());
    let directory_datakey = KeyLeaf::new(
        None,
        None,
        None,
        "TFile",
        filename,
        "",
        1,
        begin,
        None,
    );
    let directory_data = DirectoryData::new(None, Some(initial_directory_bytes), Vec::new());
    let rootdirectory = shared(Directory {
        kind: DirectoryKind::Root {
            name: directory_name,
            title: directory_title,
        },
        key: directory_key,
        header: directory_header,
        datakey: directory_datakey,
        data: directory_data,
        freesegments: Rc::clone(&freesegments),
    });

    // Fixed initial layout: root directory anchor, streamer list, directory
    // data block, free-space map, in that order after the header.
    {
        let mut root = rootdirectory.borrow_mut();
        root.key.set_location(Some(begin));
        root.key.set_seek_location(begin);
        let (name_allocation, title_allocation) = match &root.kind {
            DirectoryKind::Root { name, title } => (name.allocation(), title.allocation()),
            DirectoryKind::Sub => unreachable!(),
        };
        let streamers_location = begin
            + root.key.allocation()
            + name_allocation
            + title_allocation
            + root.header.allocation();
        let mut streamers_mut = streamers.borrow_mut();
        streamers_mut.key.set_location(Some(streamers_location));
        streamers_mut.key.set_seek_location(streamers_location);
        let datakey_location =
            streamers_location + streamers_mut.key.allocation() + initial_streamers_bytes;
        root.datakey.set_location(Some(datakey_location));
        root.datakey.set_seek_location(datakey_location);
        let data_location = datakey_location + root.datakey.allocation();
        root.data.set_location(data_location);
        let freesegments_location = data_location + root.data.allocation();
        let mut free = freesegments.borrow_mut();
        free.key.set_location(Some(freesegments_location));
        free.key.set_seek_location(freesegments_location);
        let end = freesegments_location + free.key.allocation() + free.data.allocation();
        free.data.set_end(end);
        let mut header = fileheader.borrow_mut();
        header.set_info_location(streamers_location);
        header.set_info_num_bytes(
            (streamers_mut.key.allocation() + initial_streamers_bytes) as u32,
        );
    }

    rootdirectory.borrow_mut().write(sink)?;
    streamers.borrow_mut().write(sink)?;
    let end = fileheader.borrow().end();
    if let Some(end) = end {
        sink.set_file_length(end)?;
    }
    sink.flush()?;

    Ok(CascadingFile {
        fileheader,
        freesegments,
        streamers,
        rootdirectory,
    })
}

/// Rebuilds the cascade from a preexisting file so it can be updated in
/// place. Rewrites the streamer list (to take ownership of its allocation)
/// and returns the parsed streamers for class lookups.
pub fn update_existing(sink: &mut FileSink) -> Result<(CascadingFile, Vec<StreamerInfo>)> {
    let path = sink.path().to_path_buf();
    let raw = sink.read(0, 100, FILE_HEADER_SMALL_BYTES)?;
    let fileheader = shared(HeaderLeaf::deserialize(&raw, &path)?);

    let (free_location, free_num_bytes, free_num_slices) = {
        let header = fileheader.borrow();
        (
            header.free_location.unwrap_or(0),
            header.free_num_bytes.unwrap_or(0) as u64,
            header.free_num_slices.unwrap_or(0) as usize,
        )
    };
    let raw = sink.read(free_location, free_num_bytes, free_num_bytes)?;
    let freesegments_key = KeyLeaf::deserialize(&raw, free_location, &path, false)?;
    let key_bytes = freesegments_key.num_bytes();
    let freesegments_data = FreeSegmentsData::deserialize(
        &raw[key_bytes as usize..],
        free_location + key_bytes,
        free_num_bytes - key_bytes,
        free_num_slices,
        &path,
    )?;
    let freesegments = shared(FreeSegments::new(
        freesegments_key,
        freesegments_data,
        Rc::clone(&fileheader),
    ));

    let (info_location, info_num_bytes) = {
        let header = fileheader.borrow();
        (
            header.info_location.unwrap_or(0),
            header.info_num_bytes.unwrap_or(0) as u64,
        )
    };
    let raw = sink.read(info_location, info_num_bytes, info_num_bytes)?;
    let streamers_key = KeyLeaf::deserialize(&raw, info_location, &path, false)?;
    let streamers_key_bytes = streamers_key.num_bytes();
    let (streamers, infos) = StreamerList::deserialize(
        &raw[streamers_key_bytes as usize..],
        info_location + streamers_key_bytes,
        streamers_key,
        Rc::clone(&freesegments),
        &path,
    )?;
    let streamers = shared(streamers);

    let (begin, begin_num_bytes) = {
        let header = fileheader.borrow();
        (header.begin(), header.begin_num_bytes.unwrap_or(0) as u64)
    };
    let raw = sink.read(
        begin,
        begin_num_bytes + DIRECTORY_BIG_BYTES + 18,
        begin_num_bytes,
    )?;
    let directory_key = KeyLeaf::deserialize(&raw, begin, &path, false)?;
    let mut position = directory_key.num_bytes();
    let (directory_name, next) = StringLeaf::deserialize(&raw[position as usize..], begin + position);
    position = next;
    let (directory_title, next) =
        StringLeaf::deserialize(&raw[(position - begin) as usize..], position);
    position = next;
    if position - begin != begin_num_bytes {
        return Err(Error::format(
            &path,
            format!(
                "root directory strings end at {} but fNbytesName is {begin_num_bytes}",
                position - begin
            ),
        ));
    }
    let directory_header =
        DirectoryHeaderLeaf::deserialize(&raw[(position - begin) as usize..], position, &path)?;
    if directory_header.begin_location != Some(begin)
        || directory_header.parent_location() != 0
    {
        return Err(Error::format(
            &path,
            "root directory header disagrees with the file header",
        ));
    }

    let (data_location, data_num_bytes) = (
        directory_header.data_location().unwrap_or(0),
        directory_header.data_num_bytes.unwrap_or(0) as u64,
    );
    let raw = sink.read(data_location, data_num_bytes, data_num_bytes)?;
    let directory_datakey = KeyLeaf::deserialize(&raw, data_location, &path, false)?;
    let datakey_bytes = directory_datakey.num_bytes();
    let directory_data = DirectoryData::deserialize(
        &raw[datakey_bytes as usize..],
        data_location + datakey_bytes,
        &path,
    )?;

    let rootdirectory = shared(Directory {
        kind: DirectoryKind::Root {
            name: directory_name,
            title: directory_title,
        },
        key: directory_key,
        header: directory_header,
        datakey: directory_datakey,
        data: directory_data,
        freesegments: Rc::clone(&freesegments),
    });

    streamers.borrow_mut().write(sink)?;
    sink.flush()?;

    Ok((
        CascadingFile {
            fileheader,
            freesegments,
            streamers,
            rootdirectory,
        },
        infos,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn free_segments(slices: Vec<(u64, u64)>) -> FreeSegments {
        let fileheader = shared(HeaderLeaf::new(
            PathBuf::from("test.root"),
            None,
            Uuid::new_v4(),
        ));
        let key = KeyLeaf::new(
            Some(10_000),
            None,
            None,
            "TFile",
            "test.root",
            "",
            1,
            100,
            Some(10_000),
        );
        let data = FreeSegmentsData::new(None, slices, None);
        let mut out = FreeSegments::new(key, data, fileheader);
        let end = out.key.location().unwrap() + out.key.num_bytes() + out.data.allocation();
        out.data.set_end(end);
        out
    }

    #[test]
    fn allocate_then_release_restores_the_map() {
        let mut free = free_segments(vec![(200, 300)]);
        let before = free.data.slices().to_vec();
        let location = free.allocate(50, false);
        assert_eq!(location, 200);
        assert_eq!(free.data.slices(), &[(250, 300)]);
        free.release(200, 250).unwrap();
        assert_eq!(free.data.slices(), before.as_slice());
    }

    #[test]
    fn exact_fits_consume_the_whole_slice() {
        let mut free = free_segments(vec![(200, 300), (400, 450)]);
        let location = free.allocate(50, false);
        assert_eq!(location, 400);
        assert_eq!(free.data.slices(), &[(200, 300)]);
    }

    #[test]
    fn dry_runs_do_not_mutate() {
        let mut free = free_segments(vec![(200, 300)]);
        let dry = free.allocate(64, true);
        let wet = free.allocate(64, false);
        assert_eq!(dry, wet);
    }

    #[test]
    fn end_of_file_allocation_moves_the_map() {
        let mut free = free_segments(vec![]);
        let old_location = free.key.location().unwrap();
        let end_before = free.data.end().unwrap();
        let location = free.allocate(1000, false);
        assert_eq!(location, old_location);
        assert_eq!(free.key.location().unwrap(), old_location + 1000);
        assert_eq!(free.data.end().unwrap(), end_before + 1000);
    }

    #[test]
    fn releases_merge_with_both_neighbors() {
        let mut free = free_segments(vec![(100, 200), (300, 400)]);
        free.release(200, 300).unwrap();
        assert_eq!(free.data.slices(), &[(100, 400)]);
    }

    #[test]
    fn overlapping_releases_are_corruption() {
        let mut free = free_segments(vec![(100, 200)]);
        let err = free.release(150, 250).unwrap_err();
        assert!(matches!(err, Error::Allocation { .. }));
        // The map is untouched.
        assert_eq!(free.data.slices(), &[(100, 200)]);
    }

    #[test]
    fn interval_records_round_trip() {
        let path = PathBuf::from("test.root");
        let mut data = FreeSegmentsData::new(Some(5000), vec![(128, 256), (512, 1024)], Some(9000));
        let raw = data.serialize(&path).unwrap();
        let parsed =
            FreeSegmentsData::deserialize(&raw, 5000, raw.len() as u64, 2, &path).unwrap();
        assert_eq!(parsed.slices(), data.slices());
        assert_eq!(parsed.end(), data.end());
        assert_eq!(data.allocation(), raw.len() as u64);
    }

    #[test]
    fn keys_round_trip_through_their_serialization() {
        let path = PathBuf::from("test.root");
        let key = KeyLeaf::new(
            Some(4242),
            Some(1000),
            Some(400),
            "TH1D",
            "h",
            "a title",
            3,
            100,
            Some(4242),
        );
        let raw = key.serialize(&path).unwrap();
        let parsed = KeyLeaf::deserialize(&raw, 4242, &path, false).unwrap();
        assert_eq!(parsed.classname(), "TH1D");
        assert_eq!(parsed.name(), "h");
        assert_eq!(parsed.title(), "a title");
        assert_eq!(parsed.cycle(), 3);
        assert_eq!(parsed.uncompressed_bytes(), Some(1000));
        assert_eq!(parsed.compressed_bytes(), Some(400));
        assert_eq!(parsed.num_bytes(), key.num_bytes());
    }

    #[test]
    fn directory_headers_round_trip() {
        let path = PathBuf::from("test.root");
        let header = DirectoryHeaderLeaf::new(
            Some(300),
            Some(100),
            Some(46),
            Some(700),
            Some(120),
            0,
            Uuid::new_v4(),
        );
        let raw = header.serialize();
        // Small form: header fields, TUUID, and padding out to the big form.
        assert_eq!(raw.len() as u64, DIRECTORY_BIG_BYTES + 18);
        let parsed = DirectoryHeaderLeaf::deserialize(&raw, 300, &path).unwrap();
        assert_eq!(parsed.data_location(), Some(700));
        assert_eq!(parsed.parent_location(), 0);
        assert_eq!(parsed.uuid, header.uuid);
    }

    #[test]
    fn big_seeks_switch_the_key_form() {
        let small = KeyLeaf::new(
            Some(1000),
            None,
            None,
            "TTree",
            "t",
            "",
            1,
            100,
            Some(1000),
        );
        assert!(!small.big());
        assert_eq!(
            small.num_bytes(),
            KEY_SMALL_BYTES + 6 + 2 + 1
        );

        let big = KeyLeaf::new(
            Some(START_BIG_FILE + 1),
            None,
            None,
            "TTree",
            "t",
            "",
            1,
            100,
            Some(START_BIG_FILE + 1),
        );
        assert!(big.big());
        assert_eq!(big.num_bytes(), KEY_BIG_BYTES + 6 + 2 + 1);
    }
}
