//! Read-side access to immutable time-series storage files (TSFs): an
//! indirect index over a raw byte image, a memory-mapped block accessor,
//! a tombstone overlay for logical deletes, and a façade tying the three
//! together behind one reader-level lock.
//!
//! Grounded on the teacher's `tsdb/src/engine/tsm1/file_store` module
//! tree, rewritten synchronously over [`memmap2`] instead of `opendal`.

pub mod accessor;
pub mod decode;
pub mod error;
pub mod index;
pub mod index_entry;
pub mod iterator;
pub mod mmap;
pub mod reader;
pub mod stat;
pub mod tombstone;

pub use decode::{
    BlockDecoder, BooleanValues, FloatValues, IntegerValues, Point, StringValues, Values,
    BLOCK_BOOLEAN, BLOCK_FLOAT64, BLOCK_INTEGER, BLOCK_STRING,
};
pub use error::{Error, Result};
pub use index::TimeRange;
pub use index_entry::IndexEntry;
pub use iterator::BlockIterator;
pub use reader::{OpenOptions, Reader};
pub use stat::FileStat;
pub use tombstone::{FileTombstoneLog, TombstoneLog, TombstoneRecord};
