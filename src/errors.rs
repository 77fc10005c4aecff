use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while reading or writing a file.
///
/// Every variant carries the file path; deserialization failures additionally
/// carry the object path (when one is known) and a hex dump of the bytes
/// around the cursor.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O fault, timeout, or use of a closed source.
    #[error("i/o failure on {path:?}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Magic mismatch, impossible field values, or a self-inconsistent record.
    #[error("invalid file format in {path:?}: {reason}")]
    Format { path: PathBuf, reason: String },

    /// A record did not decode: byte-count mismatch at record end, an
    /// unexpected tag, or a class version with neither a streamer nor a
    /// registered model.
    #[error("deserialization failed in {path:?}{}: {reason}\n{dump}", fmt_object_path(.object_path))]
    Deserialization {
        path: PathBuf,
        object_path: Option<String>,
        reason: String,
        dump: String,
    },

    /// An unusable streamer element or a class without a writable model.
    #[error("bad schema in {path:?}: {reason}")]
    Schema { path: PathBuf, reason: String },

    /// The free-space map was asked to release an interval that overlaps one
    /// already free. Indicates in-memory corruption; never raised by a
    /// correctly functioning writer.
    #[error(
        "releasing [{start}, {stop}) in {path:?} but [{free_start}, {free_stop}) is already free"
    )]
    Allocation {
        path: PathBuf,
        start: u64,
        stop: u64,
        free_start: u64,
        free_stop: u64,
    },

    /// Memberwise serialization, the retired "CS" compression tag, or writing
    /// a class with no writable model.
    #[error("not implemented ({path:?}): {reason}")]
    NotImplemented { path: PathBuf, reason: String },
}

fn fmt_object_path(object_path: &Option<String>) -> String {
    match object_path {
        Some(p) => format!(" at {p}"),
        None => String::new(),
    }
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Source {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn schema(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Schema {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn not_implemented(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::NotImplemented {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that the streamer-refresh retry in `ReadOnlyKey::get`
    /// may be able to fix.
    pub fn is_deserialization(&self) -> bool {
        matches!(self, Error::Deserialization { .. })
    }
}
