//! Block iterator (C5): walks every `(key, block)` pair of a reader in
//! index order, one block at a time, without buffering the whole index.
//! Grounded on the teacher's `block_iterator.rs::DefaultBlockIterator`
//! surface (`next`/`peek_next`/`read`), rewritten over the synchronous
//! [`Reader`] instead of an async cursor.

use crate::error::{Error, Result};
use crate::index_entry::IndexEntry;
use crate::reader::Reader;

/// Iterates every block of every key, in index order. `next()` must be
/// called once before the first `read()`; each subsequent `next()`
/// advances past the block last returned.
pub struct BlockIterator<'a> {
    reader: &'a Reader,
    n_keys: usize,
    /// Index of the next key to load once `entries` is exhausted.
    next_key_idx: usize,
    key: Vec<u8>,
    entries: Vec<IndexEntry>,
    /// Count of entries already served from `entries`; the current entry
    /// is `entries[pos - 1]`.
    pos: usize,
}

impl<'a> BlockIterator<'a> {
    pub(crate) fn new(reader: &'a Reader) -> Result<Self> {
        Ok(Self {
            reader,
            n_keys: reader.key_count()?,
            next_key_idx: 0,
            key: Vec::new(),
            entries: Vec::new(),
            pos: 0,
        })
    }

    fn load_key(&mut self, idx: usize) -> Result<()> {
        let (key, entries) = self.reader.key(idx)?;
        self.key = key;
        self.entries = entries;
        self.pos = 0;
        Ok(())
    }

    fn current_entry(&self) -> Option<&IndexEntry> {
        self.pos.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    /// Advances to the next block. Returns `false` once every key's every
    /// block has been visited.
    pub fn next(&mut self) -> Result<bool> {
        loop {
            if self.entries.is_empty() {
                if self.next_key_idx >= self.n_keys {
                    return Ok(false);
                }
                self.load_key(self.next_key_idx)?;
                self.next_key_idx += 1;
            }

            if self.pos < self.entries.len() {
                self.pos += 1;
                return Ok(true);
            }

            self.entries.clear();
        }
    }

    /// Returns the key of the block that the next call to [`next`](Self::next)
    /// will land on, without advancing the iterator. Empty once exhausted.
    pub fn peek_next(&self) -> Result<Vec<u8>> {
        if self.pos < self.entries.len() {
            return Ok(self.key.clone());
        }
        if self.next_key_idx < self.n_keys {
            let (key, _typ) = self.reader.key_at(self.next_key_idx)?;
            return Ok(key);
        }
        Ok(Vec::new())
    }

    /// Reads the current block's key, time bounds, checksum, and payload.
    /// Must be called after a `next()` that returned `true`.
    pub fn read(&self) -> Result<(Vec<u8>, i64, i64, u32, Vec<u8>)> {
        let entry = self.current_entry().ok_or(Error::Closed)?;
        let block = self.reader.accessor().read_bytes(*entry)?;
        let checksum = block.checksum();
        let payload = block.payload().to_vec();
        Ok((self.key.clone(), entry.min_time, entry.max_time, checksum, payload))
    }
}
