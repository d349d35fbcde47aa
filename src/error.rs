//! Error types for building and reading indexes.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("invalid index format: {0}")]
    Format(String),

    #[error("offset {value} cannot be represented in {width} bytes")]
    RangeUnsupported { value: u64, width: u8 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("external sort failed: {0:#}")]
    Sort(anyhow::Error),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("refusing to overwrite existing file {0}")]
    Overwrite(String),

    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("no file registered with handle {0}")]
    InvalidHandle(u16),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("position {requested} is outside 1..={length}")]
    PositionOutOfRange { requested: u64, length: u64 },

    #[error("duplicate primary key {0:?}")]
    DuplicateKey(String),

    #[error("alias {alias:?} points at unknown primary key {target:?}")]
    DanglingAlias { alias: String, target: String },
}

impl Error {
    /// Whether the failed call left its builder or reader usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::CapacityExceeded(_)
                | Error::InvalidKey { .. }
                | Error::InvalidHandle(_)
                | Error::InvalidArgument(_)
                | Error::PositionOutOfRange { .. }
        )
    }
}
