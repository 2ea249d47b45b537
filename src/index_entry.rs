//! Byte-image codec (C1): pure parsers over a byte view starting at a
//! per-key record boundary, plus the 28-byte `IndexEntry` wire format.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Size in bytes used to store the count of index entries for a key.
pub const INDEX_COUNT_SIZE: usize = 2;
/// Size in bytes used to store the type of block encoded.
pub const INDEX_TYPE_SIZE: usize = 1;
/// Size in bytes of one on-disk `IndexEntry`.
pub const INDEX_ENTRY_SIZE: usize = 28;

/// The index information for a given block in a TSF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// The min and max time of all points stored in the block.
    pub min_time: i64,
    pub max_time: i64,

    /// The absolute byte offset in the file where this block is located,
    /// including its leading 4-byte checksum.
    pub offset: i64,

    /// The size in bytes of the block, including the checksum.
    pub size: u32,
}

impl IndexEntry {
    pub fn new(min_time: i64, max_time: i64, offset: i64, size: u32) -> Self {
        Self {
            min_time,
            max_time,
            offset,
            size,
        }
    }

    /// Decodes an `IndexEntry` from its 28-byte big-endian wire form.
    pub fn unmarshal_binary(b: &[u8]) -> Result<Self> {
        if b.len() < INDEX_ENTRY_SIZE {
            return Err(Error::bad_format(format!(
                "unmarshal_binary: short buf: {} < {}",
                b.len(),
                INDEX_ENTRY_SIZE
            )));
        }

        let min_time = BigEndian::read_i64(&b[0..8]);
        let max_time = BigEndian::read_i64(&b[8..16]);
        let offset = BigEndian::read_i64(&b[16..24]);
        let size = BigEndian::read_u32(&b[24..28]);

        Ok(Self {
            min_time,
            max_time,
            offset,
            size,
        })
    }

    /// Appends the binary-encoded form of this entry to `buf`.
    pub fn append_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.min_time.to_be_bytes());
        buf.extend_from_slice(&self.max_time.to_be_bytes());
        buf.extend_from_slice(&self.offset.to_be_bytes());
        buf.extend_from_slice(&self.size.to_be_bytes());
    }

    /// Returns true if this entry may contain values for the given time.
    /// Min and max are inclusive.
    pub fn contains(&self, t: i64) -> bool {
        self.min_time <= t && t <= self.max_time
    }

    /// Returns true if `[min, max]` overlaps this entry's time bounds.
    pub fn overlaps_time_range(&self, min: i64, max: i64) -> bool {
        self.min_time <= max && self.max_time >= min
    }

    /// Returns true if `[min, max]` fully encloses this entry's time bounds.
    pub fn enclosed_by(&self, min: i64, max: i64) -> bool {
        min <= self.min_time && self.max_time <= max
    }
}

/// Reads a `u16 BE` length-prefixed key from the start of `bytes`.
///
/// Returns the number of bytes consumed (`2 + key_len`) and the key slice.
pub fn read_key(bytes: &[u8]) -> Result<(usize, &[u8])> {
    if bytes.len() < INDEX_COUNT_SIZE {
        return Err(Error::bad_format("read_key: buffer too short for key length"));
    }
    let key_len = BigEndian::read_u16(&bytes[..INDEX_COUNT_SIZE]) as usize;
    let consumed = INDEX_COUNT_SIZE + key_len;
    if bytes.len() < consumed {
        return Err(Error::bad_format(format!(
            "read_key: short buf: {} < {}",
            bytes.len(),
            consumed
        )));
    }
    Ok((consumed, &bytes[INDEX_COUNT_SIZE..consumed]))
}

/// Reads a block-type byte, an entry count (`u16 BE`), and that many
/// `IndexEntry` records from the start of `bytes`.
pub fn read_entries(bytes: &[u8]) -> Result<(usize, u8, Vec<IndexEntry>)> {
    if bytes.len() < INDEX_TYPE_SIZE + INDEX_COUNT_SIZE {
        return Err(Error::bad_format("read_entries: buffer too short for header"));
    }
    let block_type = bytes[0];
    let count = BigEndian::read_u16(&bytes[INDEX_TYPE_SIZE..INDEX_TYPE_SIZE + INDEX_COUNT_SIZE])
        as usize;

    let header_len = INDEX_TYPE_SIZE + INDEX_COUNT_SIZE;
    let needed = header_len + count * INDEX_ENTRY_SIZE;
    if bytes.len() < needed {
        return Err(Error::bad_format(format!(
            "read_entries: short buf: {} < {}",
            bytes.len(),
            needed
        )));
    }

    let mut entries = Vec::with_capacity(count);
    let mut pos = header_len;
    for _ in 0..count {
        entries.push(IndexEntry::unmarshal_binary(&bytes[pos..pos + INDEX_ENTRY_SIZE])?);
        pos += INDEX_ENTRY_SIZE;
    }

    Ok((needed, block_type, entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trip() {
        let e = IndexEntry::new(10, 20, 1234, 56);
        let mut buf = Vec::new();
        e.append_to(&mut buf);
        assert_eq!(buf.len(), INDEX_ENTRY_SIZE);
        let back = IndexEntry::unmarshal_binary(&buf).unwrap();
        assert_eq!(e, back);
    }

    #[test]
    fn entry_contains() {
        let e = IndexEntry::new(10, 20, 0, 4);
        assert!(e.contains(10));
        assert!(e.contains(20));
        assert!(e.contains(15));
        assert!(!e.contains(9));
        assert!(!e.contains(21));
    }

    fn build_key_record(key: &[u8], block_type: u8, entries: &[IndexEntry]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
        buf.extend_from_slice(key);
        buf.push(block_type);
        buf.extend_from_slice(&(entries.len() as u16).to_be_bytes());
        for e in entries {
            e.append_to(&mut buf);
        }
        buf
    }

    #[test]
    fn read_key_and_entries() {
        let entries = vec![IndexEntry::new(1, 5, 0, 10), IndexEntry::new(6, 9, 10, 8)];
        let rec = build_key_record(b"cpu", 0, &entries);

        let (consumed, key) = read_key(&rec).unwrap();
        assert_eq!(key, b"cpu");
        assert_eq!(consumed, 2 + 3);

        let (consumed2, typ, parsed) = read_entries(&rec[consumed..]).unwrap();
        assert_eq!(typ, 0);
        assert_eq!(parsed, entries);
        assert_eq!(consumed + consumed2, rec.len());
    }

    #[test]
    fn read_key_truncated() {
        let rec = [0u8, 3, b'c', b'p']; // claims 3 bytes, only 2 present
        assert!(read_key(&rec).is_err());
    }

    quickcheck::quickcheck! {
        fn prop_entry_round_trips(min_time: i64, max_time: i64, offset: i64, size: u32) -> bool {
            let e = IndexEntry::new(min_time, max_time, offset, size);
            let mut buf = Vec::new();
            e.append_to(&mut buf);
            IndexEntry::unmarshal_binary(&buf).unwrap() == e
        }
    }
}
