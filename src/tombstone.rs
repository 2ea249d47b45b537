//! Tombstone log (external collaborator, §1/§6): a persistent append-only
//! record of `(key, min_time, max_time)` deletions. The trait is the
//! consumed interface; `FileTombstoneLog` is one conforming, flat-file
//! implementation grounded on the teacher's `file_store/tombstone.rs`
//! (v4-header-prefixed records, tmp-file-then-rename commits) with the
//! gzip/async-stream machinery dropped — it was an artifact of the
//! teacher's `opendal` writer, not of the record format itself.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::index::TimeRange;
use crate::stat::FileStat;

const TOMBSTONE_EXTENSION: &str = "tombstone";
const V4_HEADER: u32 = 0x1504;
const HEADER_SIZE: usize = 4;

/// One `(key, min_time, max_time)` deletion record.
#[derive(Debug, Clone, PartialEq)]
pub struct TombstoneRecord {
    pub key: Vec<u8>,
    pub min: i64,
    pub max: i64,
}

/// The persistent, append-only tombstone log consumed by the reader
/// façade. Writers are expected to call `add_range` with records grouped
/// by `(min, max)`, a convention the façade's `apply_tombstones` relies on
/// to batch `delete_range` calls (§4.4).
pub trait TombstoneLog: Send + Sync {
    fn read_all(&self) -> Result<Vec<TombstoneRecord>>;
    fn add(&mut self, keys: &[&[u8]]) -> Result<()>;
    fn add_range(&mut self, keys: &[&[u8]], min: i64, max: i64) -> Result<()>;
    fn has_tombstones(&self) -> bool;
    fn files(&self) -> Result<Vec<FileStat>>;
    fn delete_file(&mut self) -> Result<()>;
}

/// `FileTombstoneLog` stores its records next to the TSF it shadows, as
/// `<tsm-stem>.tombstone`.
pub struct FileTombstoneLog {
    tombstone_path: PathBuf,
}

impl FileTombstoneLog {
    pub fn new(tsm_path: impl AsRef<Path>) -> Self {
        Self {
            tombstone_path: Self::tombstone_path(tsm_path.as_ref()),
        }
    }

    fn tombstone_path(tsm_path: &Path) -> PathBuf {
        let stem = tsm_path.file_stem().unwrap_or(tsm_path.as_os_str());
        tsm_path
            .parent()
            .map(|p| p.join(format!("{}.{}", stem.to_string_lossy(), TOMBSTONE_EXTENSION)))
            .unwrap_or_else(|| PathBuf::from(format!("{}.{}", stem.to_string_lossy(), TOMBSTONE_EXTENSION)))
    }

    fn write_all(&self, records: &[TombstoneRecord]) -> Result<()> {
        let tmp_path = self.tombstone_path.with_extension(format!(
            "{}.tmp",
            self.tombstone_path
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));

        {
            let mut f = File::create(&tmp_path).map_err(|e| Error::tombstone_io(e))?;
            f.write_all(&V4_HEADER.to_be_bytes())
                .map_err(|e| Error::tombstone_io(e))?;
            for r in records {
                f.write_all(&(r.key.len() as u32).to_be_bytes())
                    .map_err(|e| Error::tombstone_io(e))?;
                f.write_all(&r.key).map_err(|e| Error::tombstone_io(e))?;
                f.write_all(&r.min.to_be_bytes())
                    .map_err(|e| Error::tombstone_io(e))?;
                f.write_all(&r.max.to_be_bytes())
                    .map_err(|e| Error::tombstone_io(e))?;
            }
            f.sync_all().map_err(|e| Error::tombstone_io(e))?;
        }

        std::fs::rename(&tmp_path, &self.tombstone_path).map_err(|e| Error::tombstone_io(e))
    }
}

impl TombstoneLog for FileTombstoneLog {
    fn read_all(&self) -> Result<Vec<TombstoneRecord>> {
        if !self.tombstone_path.exists() {
            return Ok(Vec::new());
        }

        let mut buf = Vec::new();
        File::open(&self.tombstone_path)
            .and_then(|mut f| f.read_to_end(&mut buf))
            .map_err(|e| Error::tombstone_io(e))?;

        if buf.len() < HEADER_SIZE {
            return Err(Error::tombstone_io("tombstone file shorter than header"));
        }
        let header = BigEndian::read_u32(&buf[..HEADER_SIZE]);
        if header != V4_HEADER {
            return Err(Error::tombstone_io(format!(
                "unsupported tombstone header {:#x}",
                header
            )));
        }

        let mut records = Vec::new();
        let mut pos = HEADER_SIZE;
        while pos < buf.len() {
            if pos + 4 > buf.len() {
                return Err(Error::tombstone_io("truncated tombstone record"));
            }
            let key_len = BigEndian::read_u32(&buf[pos..pos + 4]) as usize;
            pos += 4;
            if pos + key_len + 16 > buf.len() {
                return Err(Error::tombstone_io("truncated tombstone record"));
            }
            let key = buf[pos..pos + key_len].to_vec();
            pos += key_len;
            let min = BigEndian::read_i64(&buf[pos..pos + 8]);
            pos += 8;
            let max = BigEndian::read_i64(&buf[pos..pos + 8]);
            pos += 8;
            records.push(TombstoneRecord { key, min, max });
        }

        Ok(records)
    }

    fn add(&mut self, keys: &[&[u8]]) -> Result<()> {
        let unbound = TimeRange::unbound();
        self.add_range(keys, unbound.min, unbound.max)
    }

    fn add_range(&mut self, keys: &[&[u8]], min: i64, max: i64) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut records = self.read_all()?;
        for key in keys {
            records.push(TombstoneRecord {
                key: key.to_vec(),
                min,
                max,
            });
        }
        self.write_all(&records)
    }

    fn has_tombstones(&self) -> bool {
        self.tombstone_path
            .metadata()
            .map(|m| m.len() > HEADER_SIZE as u64)
            .unwrap_or(false)
    }

    fn files(&self) -> Result<Vec<FileStat>> {
        if !self.has_tombstones() {
            return Ok(Vec::new());
        }
        let meta = self
            .tombstone_path
            .metadata()
            .map_err(|e| Error::tombstone_io(e))?;
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);

        Ok(vec![FileStat {
            path: self.tombstone_path.to_string_lossy().into_owned(),
            has_tombstone: true,
            size: meta.len() as u32,
            last_modified,
            min_time: 0,
            max_time: 0,
            min_key: Vec::new(),
            max_key: Vec::new(),
        }])
    }

    fn delete_file(&mut self) -> Result<()> {
        match std::fs::remove_file(&self.tombstone_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::tombstone_io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let tsm_path = dir.path().join("000001.tsf");
        let mut log = FileTombstoneLog::new(&tsm_path);

        assert!(!log.has_tombstones());
        assert!(log.read_all().unwrap().is_empty());

        log.add(&[b"cpu", b"mem"]).unwrap();
        log.add_range(&[b"disk"], 10, 20).unwrap();

        assert!(log.has_tombstones());
        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key, b"cpu");
        assert_eq!(records[0].min, i64::MIN);
        assert_eq!(records[2].key, b"disk");
        assert_eq!(records[2].min, 10);
        assert_eq!(records[2].max, 20);

        let files = log.files().unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].has_tombstone);

        log.delete_file().unwrap();
        assert!(!log.has_tombstones());
        // idempotent
        log.delete_file().unwrap();
    }
}
