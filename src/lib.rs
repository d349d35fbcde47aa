//! Keyed and positional random access into large flat files.
//!
//! An index is built once with [`IndexBuilder`], which accepts files, primary
//! keys and aliases in any order and writes them out sorted. [`IndexReader`]
//! then answers lookups by binary search straight against the index file,
//! and can translate a position inside a record into a byte offset when the
//! data file's lines are uniform.

mod accumulator;
pub mod config;
pub mod encoding;
pub mod error;
pub mod fs;
pub mod sort;
pub mod ssi;

pub use config::BuildConfig;
pub use encoding::{ByteOrder, OffsetWidth};
pub use error::{Error, Result};
pub use fs::{DbDir, DbFile, MockDir, OsDir};
pub use sort::{InProcessSorter, ProcessSorter, Sorter};
pub use ssi::{
    reader::{IndexReader, SubrangeOffset},
    writer::{IndexBuilder, IndexSummary},
    FileEntry, FileHandle, PrimaryKeyRecord, SecondaryKeyRecord,
};
