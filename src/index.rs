//! Indirect index (C2): a sorted array of offsets into a raw index byte
//! image, giving binary-searchable random access by key without
//! materializing one object per key.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::index_entry::{read_entries, read_key, IndexEntry};
use crate::mmap::MappedFile;

/// A half-open `[min, max]` inclusive timestamp range, used both for
/// queries and for tombstoned intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub min: i64,
    pub max: i64,
}

impl TimeRange {
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn unbound() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    pub fn is_unbound(&self) -> bool {
        self.min == i64::MIN && self.max == i64::MAX
    }

    pub fn contains(&self, t: i64) -> bool {
        self.min <= t && t <= self.max
    }

    pub fn encloses(&self, other_min: i64, other_max: i64) -> bool {
        self.min <= other_min && other_max <= self.max
    }

    fn overlaps_or_touches(&self, other: &TimeRange) -> bool {
        self.min <= other.max.saturating_add(1) && other.min <= self.max.saturating_add(1)
    }

    fn merge(&mut self, other: &TimeRange) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

/// Mutable state of the index: everything that `delete`/`delete_range`
/// touch. Guarded by the index's own readers-writer lock (§5).
struct Inner {
    offsets: Vec<i32>,
    tombstones: HashMap<Vec<u8>, Vec<TimeRange>>,
}

/// A `TSMIndex`-shaped in-memory directory over a raw index byte image.
/// Lookups binary-search `offsets`; each probe dereferences into the
/// image to compare key bytes.
pub struct IndirectIndex {
    mmap: MappedFile,
    image_start: usize,
    image_len: usize,

    min_key: Vec<u8>,
    max_key: Vec<u8>,
    min_time: i64,
    max_time: i64,

    inner: RwLock<Inner>,
}

impl IndirectIndex {
    /// Scans `mmap[image_start..image_start+image_len]` once, building the
    /// offset array and the min/max key/time aggregates. O(image size).
    pub fn unmarshal(mmap: MappedFile, image_start: usize, image_len: usize) -> Result<Self> {
        if image_start + image_len > mmap.len() {
            return Err(Error::bad_format("index image out of file bounds"));
        }
        let image = &mmap.as_slice()[image_start..image_start + image_len];

        let mut offsets = Vec::new();
        let mut min_time = i64::MAX;
        let mut max_time = i64::MIN;

        let mut pos = 0usize;
        while pos < image.len() {
            offsets.push(pos as i32);

            let (key_consumed, _key) = read_key(&image[pos..])?;
            let type_and_count_start = pos + key_consumed;
            if image.len() < type_and_count_start + 1 + 2 {
                return Err(Error::bad_format("truncated index entry header"));
            }
            let count = u16::from_be_bytes([
                image[type_and_count_start + 1],
                image[type_and_count_start + 2],
            ]) as usize;
            if count == 0 {
                return Err(Error::bad_format("key record with zero entries"));
            }

            let entries_start = type_and_count_start + 1 + 2;
            let entries_len = count * crate::index_entry::INDEX_ENTRY_SIZE;
            if image.len() < entries_start + entries_len {
                return Err(Error::bad_format("truncated index entries"));
            }

            let first_min_time =
                i64::from_be_bytes(image[entries_start..entries_start + 8].try_into().unwrap());
            let last_entry_start = entries_start + (count - 1) * crate::index_entry::INDEX_ENTRY_SIZE;
            let last_max_time = i64::from_be_bytes(
                image[last_entry_start + 8..last_entry_start + 16]
                    .try_into()
                    .unwrap(),
            );

            min_time = min_time.min(first_min_time);
            max_time = max_time.max(last_max_time);

            pos = entries_start + entries_len;
        }

        let (min_key, max_key) = match (offsets.first(), offsets.last()) {
            (Some(&first), Some(&last)) => {
                let (_, fk) = read_key(&image[first as usize..])?;
                let (_, lk) = read_key(&image[last as usize..])?;
                (fk.to_vec(), lk.to_vec())
            }
            _ => (Vec::new(), Vec::new()),
        };

        if offsets.is_empty() {
            min_time = 0;
            max_time = 0;
        }

        Ok(Self {
            mmap,
            image_start,
            image_len,
            min_key,
            max_key,
            min_time,
            max_time,
            inner: RwLock::new(Inner {
                offsets,
                tombstones: HashMap::new(),
            }),
        })
    }

    fn image(&self) -> &[u8] {
        &self.mmap.as_slice()[self.image_start..self.image_start + self.image_len]
    }

    fn key_at_offset(&self, offset: i32) -> Result<&[u8]> {
        let (_, key) = read_key(&self.image()[offset as usize..])?;
        Ok(key)
    }

    /// Binary search for the leftmost offset whose key is `>= key`. Returns
    /// `image.len()` as a miss sentinel if `key` is not present.
    pub fn search(&self, key: &[u8]) -> Result<usize> {
        let inner = self.inner.read();
        let offsets = &inner.offsets;
        let image = self.image();

        let mut lo = 0usize;
        let mut hi = offsets.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let k = self.key_at_offset(offsets[mid])?;
            if k < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        if lo < offsets.len() {
            let k = self.key_at_offset(offsets[lo])?;
            if k == key {
                return Ok(offsets[lo] as usize);
            }
        }
        Ok(image.len())
    }

    /// Returns all entries for `key`, empty if not present.
    pub fn entries(&self, key: &[u8]) -> Result<Vec<IndexEntry>> {
        let offset = self.search(key)?;
        let image = self.image();
        if offset >= image.len() {
            return Ok(Vec::new());
        }
        let (key_consumed, _) = read_key(&image[offset..])?;
        let (_, _typ, entries) = read_entries(&image[offset + key_consumed..])?;
        Ok(entries)
    }

    /// Like [`entries`](Self::entries) but also returns the block type.
    pub fn entries_typed(&self, key: &[u8]) -> Result<(u8, Vec<IndexEntry>)> {
        let offset = self.search(key)?;
        let image = self.image();
        if offset >= image.len() {
            return Ok((0, Vec::new()));
        }
        let (key_consumed, _) = read_key(&image[offset..])?;
        let (_, typ, entries) = read_entries(&image[offset + key_consumed..])?;
        Ok((typ, entries))
    }

    /// The single entry covering `(key, t)`, via a deliberate linear scan —
    /// expected per-key entry counts are small and locality beats an extra
    /// binary search.
    pub fn entry(&self, key: &[u8], t: i64) -> Result<Option<IndexEntry>> {
        Ok(self
            .entries(key)?
            .into_iter()
            .find(|e| e.contains(t)))
    }

    /// Direct indexing into `offsets`; out-of-range indexes return empty
    /// results, not errors.
    pub fn key(&self, i: usize) -> Result<(Vec<u8>, Vec<IndexEntry>)> {
        let offset = {
            let inner = self.inner.read();
            match inner.offsets.get(i) {
                Some(&o) => o,
                None => return Ok((Vec::new(), Vec::new())),
            }
        };
        let image = self.image();
        let (key_consumed, key) = read_key(&image[offset as usize..])?;
        let key = key.to_vec();
        let (_, _typ, entries) = read_entries(&image[offset as usize + key_consumed..])?;
        Ok((key, entries))
    }

    /// Returns the key at position `i` plus the block-type byte
    /// immediately after it.
    pub fn key_at(&self, i: usize) -> Result<(Vec<u8>, u8)> {
        let offset = {
            let inner = self.inner.read();
            match inner.offsets.get(i) {
                Some(&o) => o,
                None => return Ok((Vec::new(), 0)),
            }
        };
        let image = self.image();
        let (key_consumed, key) = read_key(&image[offset as usize..])?;
        let typ = image[offset as usize + key_consumed];
        Ok((key.to_vec(), typ))
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(!self.entries(key)?.is_empty())
    }

    pub fn contains_value(&self, key: &[u8], t: i64) -> Result<bool> {
        if self.entry(key, t)?.is_none() {
            return Ok(false);
        }
        let inner = self.inner.read();
        if let Some(ranges) = inner.tombstones.get(key) {
            if ranges.iter().any(|r| r.contains(t)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Resolves the block type for `key`. Fails with `NotFound` on a miss.
    pub fn block_type(&self, key: &[u8]) -> Result<u8> {
        let offset = self.search(key)?;
        let image = self.image();
        if offset >= image.len() {
            return Err(Error::NotFound);
        }
        let (key_consumed, _) = read_key(&image[offset..])?;
        Ok(image[offset + key_consumed])
    }

    pub fn size(&self) -> usize {
        self.image_len
    }

    pub fn key_count(&self) -> usize {
        self.inner.read().offsets.len()
    }

    pub fn time_range(&self) -> (i64, i64) {
        (self.min_time, self.max_time)
    }

    pub fn key_range(&self) -> (&[u8], &[u8]) {
        (&self.min_key, &self.max_key)
    }

    pub fn tombstone_range(&self, key: &[u8]) -> Vec<TimeRange> {
        self.inner
            .read()
            .tombstones
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn overlaps_time_range(&self, min: i64, max: i64) -> bool {
        self.min_time <= max && self.max_time >= min
    }

    pub fn overlaps_key_range(&self, min: &[u8], max: &[u8]) -> bool {
        !min.is_empty()
            && !max.is_empty()
            && self.min_key.as_slice() <= max
            && self.max_key.as_slice() >= min
    }

    /// Removes `keys` from the index. The underlying image is untouched;
    /// the keys simply become unreachable via `search`.
    pub fn delete(&self, keys: &[&[u8]]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let set: std::collections::HashSet<&[u8]> = keys.iter().copied().collect();

        let image = self.image();
        let mut inner = self.inner.write();
        let mut kept = Vec::with_capacity(inner.offsets.len());
        for &offset in inner.offsets.iter() {
            let (_, key) = read_key(&image[offset as usize..])?;
            if !set.contains(key) {
                kept.push(offset);
            }
        }
        inner.offsets = kept;
        for k in keys {
            inner.tombstones.remove(*k);
        }
        Ok(())
    }

    /// Implements §4.2's ordered policy, including the over-delete-bug fix
    /// (SPEC_FULL.md §G.1): a key whose time range is fully covered is
    /// deleted on its own, never dragging in the rest of `keys`.
    pub fn delete_range(&self, keys: &[&[u8]], t_min: i64, t_max: i64) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        if t_min == i64::MIN && t_max == i64::MAX {
            return self.delete(keys);
        }
        if t_min > self.max_time || t_max < self.min_time {
            return Ok(());
        }

        for &key in keys {
            let entries = self.entries(key)?;
            let (first, last) = match (entries.first(), entries.last()) {
                (Some(f), Some(l)) => (f, l),
                _ => continue,
            };
            if t_min > last.max_time || t_max < first.min_time {
                continue;
            }
            if t_min <= first.min_time && t_max >= last.max_time {
                self.delete(&[key])?;
                continue;
            }

            let mut inner = self.inner.write();
            let list = inner.tombstones.entry(key.to_vec()).or_default();
            let new_range = TimeRange::new(t_min, t_max);
            if let Some(existing) = list.iter_mut().find(|r| r.overlaps_or_touches(&new_range)) {
                existing.merge(&new_range);
            } else {
                list.push(new_range);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_entry::IndexEntry;

    fn key_record(key: &[u8], typ: u8, entries: &[IndexEntry]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
        buf.extend_from_slice(key);
        buf.push(typ);
        buf.extend_from_slice(&(entries.len() as u16).to_be_bytes());
        for e in entries {
            e.append_to(&mut buf);
        }
        buf
    }

    fn build_index(path: &std::path::Path) -> IndirectIndex {
        let mut image = Vec::new();
        image.extend(key_record(b"a", 0, &[IndexEntry::new(10, 20, 0, 10)]));
        image.extend(key_record(
            b"b",
            0,
            &[
                IndexEntry::new(1, 5, 10, 10),
                IndexEntry::new(6, 9, 20, 10),
            ],
        ));

        std::fs::write(path, &image).unwrap();
        let mmap = MappedFile::open(path).unwrap();
        let len = mmap.len();
        IndirectIndex::unmarshal(mmap, 0, len).unwrap()
    }

    #[test]
    fn s1_open_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let idx = build_index(&dir.path().join("idx"));

        assert_eq!(idx.key_count(), 2);
        assert_eq!(idx.key_range(), (b"a".as_slice(), b"b".as_slice()));
        assert_eq!(idx.time_range(), (1, 20));
        assert_eq!(idx.entries(b"a").unwrap().len(), 1);
        assert_eq!(idx.entries(b"b").unwrap().len(), 2);
    }

    #[test]
    fn s2_entry_selection() {
        let dir = tempfile::tempdir().unwrap();
        let idx = build_index(&dir.path().join("idx"));

        assert_eq!(idx.entry(b"b", 5).unwrap().unwrap().min_time, 1);
        assert_eq!(idx.entry(b"b", 6).unwrap().unwrap().min_time, 6);
        assert!(idx.entry(b"b", 0).unwrap().is_none());
        assert!(idx.entry(b"c", 0).unwrap().is_none());
    }

    #[test]
    fn s3_full_range_delete() {
        let dir = tempfile::tempdir().unwrap();
        let idx = build_index(&dir.path().join("idx"));

        idx.delete_range(&[b"a"], i64::MIN, i64::MAX).unwrap();
        assert_eq!(idx.key_count(), 1);
        assert!(!idx.contains(b"a").unwrap());
        assert!(idx.contains(b"b").unwrap());
    }

    #[test]
    fn s4_partial_tombstone() {
        let dir = tempfile::tempdir().unwrap();
        let idx = build_index(&dir.path().join("idx"));

        idx.delete_range(&[b"b"], 2, 4).unwrap();
        assert!(idx.contains(b"b").unwrap());
        assert_eq!(idx.tombstone_range(b"b"), vec![TimeRange::new(2, 4)]);
        assert!(!idx.contains_value(b"b", 3).unwrap());
        assert!(idx.contains_value(b"b", 5).unwrap());
    }

    #[test]
    fn s5_out_of_horizon_delete_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let idx = build_index(&dir.path().join("idx"));

        idx.delete_range(&[b"b"], 100, 200).unwrap();
        assert!(idx.tombstone_range(b"b").is_empty());
    }

    #[test]
    fn delete_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let idx = build_index(&dir.path().join("idx"));

        idx.delete(&[b"a"]).unwrap();
        idx.delete(&[b"a"]).unwrap();
        assert_eq!(idx.key_count(), 1);
    }

    #[test]
    fn delete_range_over_delete_fix() {
        let dir = tempfile::tempdir().unwrap();
        let idx = build_index(&dir.path().join("idx"));

        // "a"'s whole range [10,20] is covered but "b" isn't; only "a"
        // should be removed, "b" must survive untouched.
        idx.delete_range(&[b"a", b"b"], 10, 20).unwrap();
        assert!(!idx.contains(b"a").unwrap());
        assert!(idx.contains(b"b").unwrap());
    }
}
