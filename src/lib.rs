//! Reader and writer for the ROOT binary container format: a self-describing,
//! random-access file of named, versioned objects with an embedded schema
//! (`TStreamerInfo`), per-record compression, a free-space map that supports
//! in-place updates, and columnar event data (`TTree`).

pub mod compression;
pub mod cursor;
pub mod errors;
pub mod model;
pub mod models;
pub mod reading;
pub mod serialization;
pub mod source;
pub mod streamers;
pub mod writing;

pub(crate) mod deserialization;

pub use errors::{Error, Result};
pub use reading::{open, ReadOnlyDirectory, ReadOnlyFile, ReadOnlyKey};
pub use writing::file::{create, update, WritableFile};

/// Seek points at or above this value do not fit the 32-bit record forms and
/// switch keys, directories, and the file header to their "big" encodings.
///
/// ROOT uses 2 GB decimal, not 2 GiB.
pub const START_BIG_FILE: u64 = 2_000_000_000;

/// Set in the leading 4-byte field of a record when the low 30 bits carry the
/// record's byte count.
pub(crate) const BYTE_COUNT_MASK: u32 = 0x4000_0000;

/// Set in a version field when the object was serialized memberwise.
pub(crate) const STREAMED_MEMBERWISE: u16 = 0x4000;

/// Tag announcing an inline class name in the read-any-object protocol.
pub(crate) const NEW_CLASS_TAG: u32 = 0xFFFF_FFFF;

/// High bit of a read-any-object tag: the rest is a class back-reference.
pub(crate) const CLASS_MASK: u32 = 0x8000_0000;

/// Back-reference positions are biased by this much relative to the start of
/// the enclosing record.
pub(crate) const MAP_OFFSET: u64 = 2;

bitflags::bitflags! {
    /// `TObject::fBits` status bits that appear on disk.
    pub struct ObjectBits: u32 {
        const MUST_CLEANUP  = 1 << 3;
        const IS_REFERENCED = 1 << 4;
        const IS_ON_HEAP    = 0x0100_0000;
        const NOT_DELETED   = 0x0200_0000;
    }
}
