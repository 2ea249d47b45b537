//! Memory mapping primitive: maps a file region read-only into a
//! contiguous byte view and releases it. Synchronous counterpart of the
//! teacher's `storage/src/mmap/mod.rs::MmapReadableFile`.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::Result;

/// A read-only memory mapping of an entire file, plus the handle that
/// keeps it backed. Cheaply cloned (`Arc`) so the index and the block
/// accessor can share one mapping without copying bytes.
#[derive(Clone)]
pub struct MappedFile {
    inner: Arc<Inner>,
}

struct Inner {
    // Kept alive so the fd stays valid for as long as the mapping is used,
    // even though reads go through `mmap`, not `file`, once mapped.
    #[allow(dead_code)]
    file: File,
    mmap: Mmap,
}

impl MappedFile {
    /// Maps the whole file read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and this type does not expose
        // any way to write through it; the caller is expected not to mutate
        // the underlying file out from under a live mapping (standard mmap
        // caveat, not specific to this crate).
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            inner: Arc::new(Inner { file, mmap }),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner.mmap[..]
    }

    pub fn len(&self) -> usize {
        self.inner.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.mmap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn maps_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(b"0123456789").unwrap();
        }

        let mapped = MappedFile::open(&path).unwrap();
        assert_eq!(mapped.len(), 10);
        assert_eq!(mapped.as_slice(), b"0123456789");

        let clone = mapped.clone();
        assert_eq!(clone.as_slice(), b"0123456789");
    }
}
