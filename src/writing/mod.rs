//! The cascading writer: a tree of dirty-flagged leaves flushed in
//! dependency order so that referents always hit the disk before their
//! references.

pub mod cascade;
pub mod file;
pub mod hist;
pub mod sink;
pub mod tree;

pub use cascade::CascadingFile;
pub use file::WritableFile;
pub use hist::Histogram1D;
pub use sink::FileSink;
pub use tree::{BranchType, Column, Dtype, Tree};
