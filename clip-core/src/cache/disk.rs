use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::Result;

/// A directory of immutable files named by a content-addressed key.
///
/// Writes go through a temp file in the same directory and land with an
/// atomic rename, so a key either resolves to complete bytes or does not
/// resolve at all. Files are never rewritten.
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }

    pub fn open(&self, key: &str) -> Result<Option<File>> {
        match File::open(self.path_for(key)) {
            Ok(f) => Ok(Some(f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads up to `buf.len()` bytes at `offset` from the cached file.
    /// Returns None when the key is not cached; short counts mean EOF.
    pub fn read_at(&self, key: &str, offset: u64, buf: &mut [u8]) -> Result<Option<usize>> {
        let Some(mut file) = self.open(key)? else {
            return Ok(None);
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(Some(total))
    }

    /// Drains `reader` into the cache under `key`, atomically. Returns
    /// the byte count written. An existing entry is left untouched.
    pub fn insert_from(&self, key: &str, reader: &mut dyn Read) -> Result<u64> {
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        let written = std::io::copy(reader, tmp.as_file_mut())?;
        let target = self.path_for(key);
        if target.exists() {
            // A concurrent producer won; its bytes are identical.
            debug!(key, "cache entry already present, dropping temp file");
            return Ok(written);
        }
        tmp.persist(&target).map_err(|e| e.error)?;
        debug!(key, bytes = written, "cache fill");
        Ok(written)
    }

    /// Temp file in the cache directory, for fills whose key is only
    /// known once the content has been hashed.
    pub fn temp_file(&self) -> Result<NamedTempFile> {
        Ok(NamedTempFile::new_in(&self.root)?)
    }

    /// Atomically lands a temp file under `key`. An existing entry wins;
    /// content-addressed bytes are identical either way.
    pub fn persist_temp(&self, tmp: NamedTempFile, key: &str) -> Result<()> {
        let target = self.path_for(key);
        if target.exists() {
            debug!(key, "cache entry already present, dropping temp file");
            return Ok(());
        }
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }

    /// Removes leftover temp files from interrupted fills.
    pub fn sweep_temp_files(&self) {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(".tmp") {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_read_at() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path()).unwrap();
        assert!(!cache.contains("k"));

        cache.insert_from("k", &mut &b"hello world"[..]).unwrap();
        assert!(cache.contains("k"));

        let mut buf = [0u8; 5];
        let n = cache.read_at("k", 6, &mut buf).unwrap().unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn read_past_eof_is_short() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path()).unwrap();
        cache.insert_from("k", &mut &b"abc"[..]).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(cache.read_at("k", 2, &mut buf).unwrap(), Some(1));
        assert_eq!(cache.read_at("k", 100, &mut buf).unwrap(), Some(0));
    }

    #[test]
    fn missing_key_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path()).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(cache.read_at("nope", 0, &mut buf).unwrap(), None);
    }

    #[test]
    fn existing_entry_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path()).unwrap();
        cache.insert_from("k", &mut &b"first"[..]).unwrap();
        cache.insert_from("k", &mut &b"second!"[..]).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(cache.read_at("k", 0, &mut buf).unwrap(), Some(5));
        assert_eq!(&buf, b"first");
    }
}
