//! Mapped block accessor (C3): maps the file, locates the index trailer,
//! and exposes checksum-prefixed block byte ranges and decoded-block
//! reads. Grounded on the teacher's `tsm_reader.rs::DefaultBlockAccessor`
//! (header verification, index-start trailer) and
//! `block_reader.rs::DefaultBlockAccessor` (checksum-prefixed block
//! layout), rewritten over a synchronous `memmap2` mapping instead of an
//! `opendal`/`tokio` reader.

use byteorder::{BigEndian, ByteOrder};
use parking_lot::{RwLock, RwLockReadGuard};

use crate::decode::{BlockDecoder, BooleanValues, FloatValues, IntegerValues, StringValues, Values};
use crate::error::{Error, Result};
use crate::index::IndirectIndex;
use crate::index_entry::IndexEntry;
use crate::mmap::MappedFile;

/// First 4 bytes of a TSF: identifies the file format.
pub const MAGIC_NUMBER: u32 = 0x16D116D1;
/// Format version this reader understands.
pub const VERSION: u8 = 1;

struct State {
    mmap: Option<MappedFile>,
}

/// A zero-copy, checksum-prefixed block byte range borrowed from the
/// memory map, plus the shared lock guard keeping that map alive.
pub struct BlockBytes<'a> {
    guard: RwLockReadGuard<'a, State>,
    offset: usize,
    size: usize,
}

impl<'a> BlockBytes<'a> {
    pub fn checksum(&self) -> u32 {
        let image = self.guard.mmap.as_ref().unwrap().as_slice();
        BigEndian::read_u32(&image[self.offset..self.offset + 4])
    }

    pub fn payload(&self) -> &[u8] {
        let image = self.guard.mmap.as_ref().unwrap().as_slice();
        &image[self.offset + 4..self.offset + self.size]
    }
}

/// Maps a TSF read-only, verifies its header, and parses the index
/// trailer into an [`IndirectIndex`]. Exposes raw and decoded block reads
/// guarded by its own readers-writer lock (§5): reads take shared,
/// `init`/`close` take exclusive.
pub struct MappedBlockAccessor {
    state: RwLock<State>,
}

impl MappedBlockAccessor {
    /// Maps `path`, verifies the header, and parses the index. Returns the
    /// accessor plus the index it built, per §4.3.
    pub fn init(path: impl AsRef<std::path::Path>) -> Result<(Self, IndirectIndex)> {
        let mmap = MappedFile::open(path)?;
        let image = mmap.as_slice();

        Self::verify_header(image)?;

        if image.len() < 8 {
            return Err(Error::bad_format(
                "byte slice too small for an index trailer",
            ));
        }
        let index_ofs_pos = image.len() - 8;
        let index_start = BigEndian::read_u64(&image[index_ofs_pos..index_ofs_pos + 8]) as usize;
        if index_start > index_ofs_pos {
            return Err(Error::bad_format("index start pointer past EOF"));
        }

        let index = IndirectIndex::unmarshal(mmap.clone(), index_start, index_ofs_pos - index_start)?;

        Ok((
            Self {
                state: RwLock::new(State { mmap: Some(mmap) }),
            },
            index,
        ))
    }

    fn verify_header(image: &[u8]) -> Result<()> {
        if image.len() < 5 {
            return Err(Error::bad_format("file too small for header"));
        }
        let magic = BigEndian::read_u32(&image[0..4]);
        if magic != MAGIC_NUMBER {
            return Err(Error::bad_format("not a tsf file: bad magic number"));
        }
        let version = image[4];
        if version != VERSION {
            return Err(Error::bad_format(format!(
                "unsupported version {}, expected {}",
                version, VERSION
            )));
        }
        Ok(())
    }

    /// Returns `(checksum, payload)` for `entry`. Bounds-checks
    /// `offset + size <= file size`; returns `Closed` on violation (covers
    /// both genuine truncation and reads issued after `close`).
    ///
    /// The returned [`BlockBytes`] borrows directly from the memory map —
    /// zero-copy, per §5/§9 — and holds the accessor's shared lock for its
    /// lifetime, so it must not be retained past a `close()` call (which
    /// blocks on the exclusive lock until every outstanding `BlockBytes` is
    /// dropped).
    pub fn read_bytes(&self, entry: IndexEntry) -> Result<BlockBytes<'_>> {
        let guard = self.state.read();
        {
            let mmap = guard.mmap.as_ref().ok_or(Error::Closed)?;
            let image = mmap.as_slice();
            let offset = entry.offset as usize;
            let size = entry.size as usize;
            if size < 4 || offset.checked_add(size).map_or(true, |end| end > image.len()) {
                return Err(Error::Closed);
            }
        }
        Ok(BlockBytes {
            guard,
            offset: entry.offset as usize,
            size: entry.size as usize,
        })
    }

    /// Validates a block's CRC-32 checksum against its payload. Only
    /// invoked when `OpenOptions::validate_checksums` is set (§9's
    /// checksum-validation open question, SPEC_FULL.md §A/§G.2).
    pub fn verify_checksum(key: &[u8], checksum: u32, payload: &[u8]) -> Result<()> {
        let actual = crc32fast::hash(payload);
        if actual != checksum {
            return Err(Error::ChecksumMismatch {
                key: key.to_vec(),
                expected: checksum,
                actual,
            });
        }
        Ok(())
    }

    pub fn read_block(
        &self,
        key: &[u8],
        entry: IndexEntry,
        block_type: u8,
        decoder: &dyn BlockDecoder,
        validate_checksums: bool,
        out: &mut Option<Values>,
    ) -> Result<()> {
        let block = self.read_bytes(entry)?;
        let payload = block.payload();
        if validate_checksums {
            Self::verify_checksum(key, block.checksum(), payload)?;
        }
        decoder.decode_block(block_type, payload, out)
    }

    pub fn read_float_block(
        &self,
        key: &[u8],
        entry: IndexEntry,
        decoder: &dyn BlockDecoder,
        validate_checksums: bool,
        out: &mut FloatValues,
    ) -> Result<()> {
        let block = self.read_bytes(entry)?;
        let payload = block.payload();
        if validate_checksums {
            Self::verify_checksum(key, block.checksum(), payload)?;
        }
        decoder.decode_float_block(payload, out)
    }

    pub fn read_integer_block(
        &self,
        key: &[u8],
        entry: IndexEntry,
        decoder: &dyn BlockDecoder,
        validate_checksums: bool,
        out: &mut IntegerValues,
    ) -> Result<()> {
        let block = self.read_bytes(entry)?;
        let payload = block.payload();
        if validate_checksums {
            Self::verify_checksum(key, block.checksum(), payload)?;
        }
        decoder.decode_integer_block(payload, out)
    }

    pub fn read_string_block(
        &self,
        key: &[u8],
        entry: IndexEntry,
        decoder: &dyn BlockDecoder,
        validate_checksums: bool,
        out: &mut StringValues,
    ) -> Result<()> {
        let block = self.read_bytes(entry)?;
        let payload = block.payload();
        if validate_checksums {
            Self::verify_checksum(key, block.checksum(), payload)?;
        }
        decoder.decode_string_block(payload, out)
    }

    pub fn read_boolean_block(
        &self,
        key: &[u8],
        entry: IndexEntry,
        decoder: &dyn BlockDecoder,
        validate_checksums: bool,
        out: &mut BooleanValues,
    ) -> Result<()> {
        let block = self.read_bytes(entry)?;
        let payload = block.payload();
        if validate_checksums {
            Self::verify_checksum(key, block.checksum(), payload)?;
        }
        decoder.decode_boolean_block(payload, out)
    }

    /// Unmaps and releases the file handle. Idempotent: a second call
    /// finds the mapping already released and returns success.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        state.mmap = None;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().mmap.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::test_support::RawDecoder;
    use crate::index_entry::INDEX_ENTRY_SIZE;

    fn build_tsf(dir: &std::path::Path) -> (std::path::PathBuf, IndexEntry) {
        let path = dir.join("test.tsf");
        let mut file = Vec::new();

        // header
        file.extend_from_slice(&MAGIC_NUMBER.to_be_bytes());
        file.push(VERSION);

        // one block: checksum + payload
        let payload = RawDecoder::encode_float(&[(1, 1.0), (2, 2.0)]);
        let checksum = crc32fast::hash(&payload);
        let block_offset = file.len() as i64;
        file.extend_from_slice(&checksum.to_be_bytes());
        file.extend_from_slice(&payload);
        let block_size = 4 + payload.len();

        let index_start = file.len() as u64;

        // index: one key "cpu" with one entry
        let entry = IndexEntry::new(1, 2, block_offset, block_size as u32);

        file.extend_from_slice(&3u16.to_be_bytes());
        file.extend_from_slice(b"cpu");
        file.push(crate::decode::BLOCK_FLOAT64);
        file.extend_from_slice(&1u16.to_be_bytes());
        entry.append_to(&mut file);
        assert_eq!(INDEX_ENTRY_SIZE, 28);

        file.extend_from_slice(&index_start.to_be_bytes());

        std::fs::write(&path, &file).unwrap();
        (path, entry)
    }

    #[test]
    fn init_parses_header_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let (path, entry) = build_tsf(dir.path());

        let (accessor, index) = MappedBlockAccessor::init(&path).unwrap();
        assert_eq!(index.key_count(), 1);

        let decoder = RawDecoder;
        let mut out = FloatValues::new();
        accessor
            .read_float_block(b"cpu", entry, &decoder, false, &mut out)
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].timestamp, 1);
        assert_eq!(out[0].value, 1.0);
    }

    #[test]
    fn close_is_idempotent_and_fails_reads() {
        let dir = tempfile::tempdir().unwrap();
        let (path, entry) = build_tsf(dir.path());
        let (accessor, _index) = MappedBlockAccessor::init(&path).unwrap();

        accessor.close().unwrap();
        accessor.close().unwrap();
        assert!(accessor.is_closed());

        let err = accessor.read_bytes(entry).unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tsf");
        std::fs::write(&path, [0u8; 32]).unwrap();
        assert!(MappedBlockAccessor::init(&path).is_err());
    }
}
