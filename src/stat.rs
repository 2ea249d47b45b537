//! `FileStat` — summary information about a TSF on disk. Grounded on the
//! teacher's `file_store/stat.rs`, field for field.

#[derive(Debug, Clone)]
pub struct FileStat {
    pub path: String,
    pub has_tombstone: bool,
    pub size: u32,
    pub last_modified: i64,

    pub min_time: i64,
    pub max_time: i64,

    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

impl FileStat {
    /// Returns true if the time range of the file intersects `[min, max]`.
    pub fn overlaps_time_range(&self, min: i64, max: i64) -> bool {
        self.min_time <= max && self.max_time >= min
    }

    /// Returns true if the min and max keys of the file overlap `[min, max]`.
    pub fn overlaps_key_range(&self, min: &[u8], max: &[u8]) -> bool {
        !min.is_empty()
            && !max.is_empty()
            && self.min_key.as_slice() <= max
            && self.max_key.as_slice() >= min
    }

    /// Returns true if `key` falls within the file's key range.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.min_key.as_slice() <= key && key <= self.max_key.as_slice()
    }
}
