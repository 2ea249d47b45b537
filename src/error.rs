use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// One variant per error kind in the reader's error-handling design.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Header/version mismatch, truncated key or entries during unmarshal,
    /// or an index-start pointer that lands past EOF. Fatal to `open`.
    #[error("bad format: {0}")]
    BadFormat(String),

    /// A stat/seek/mmap/munmap/close/remove syscall failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A read observed `offset + size > image.len()`, or an operation ran
    /// after `close`.
    #[error("reader closed")]
    Closed,

    /// `block_type(key)` was called for a key not present in the index.
    #[error("key not found")]
    NotFound,

    /// A block payload decoder rejected its input bytes.
    #[error("decode error: {0}")]
    Decode(String),

    /// The tombstone log failed to read or append a record.
    #[error("tombstone io error: {0}")]
    TombstoneIo(String),

    /// Optional, only surfaced when `OpenOptions::validate_checksums` is set.
    #[error("checksum mismatch for key {key:?}: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        key: Vec<u8>,
        expected: u32,
        actual: u32,
    },
}

impl Error {
    pub(crate) fn bad_format(msg: impl fmt::Display) -> Self {
        Error::BadFormat(msg.to_string())
    }

    pub(crate) fn decode(msg: impl fmt::Display) -> Self {
        Error::Decode(msg.to_string())
    }

    pub(crate) fn tombstone_io(msg: impl fmt::Display) -> Self {
        Error::TombstoneIo(msg.to_string())
    }
}
