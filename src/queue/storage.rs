/// Storage backends for the retry queue
///
/// One record per undelivered reading, keyed by the reading timestamp.
/// Backends are blocking; the retry queue calls them off the async workers.
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use log::warn;

use crate::error::StorageError;

const ENTRY_EXT: &str = "json";
const TMP_EXT: &str = "tmp";
const CORRUPT_EXT: &str = "corrupt";

pub trait Storage: Send + Sync {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    /// All live keys, in no particular order.
    fn keys(&self) -> Result<Vec<String>, StorageError>;
    /// Moves an unreadable record out of the queue without deleting it.
    fn quarantine(&self, key: &str) -> Result<(), StorageError>;

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }
}

fn io_error(key: &str, source: io::Error) -> StorageError {
    StorageError::Io {
        key: key.to_string(),
        source,
    }
}

/// One `<timestamp>.json` file per entry in a single directory.
pub struct FsStorage {
    dir: PathBuf,
}

impl FsStorage {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir.display().to_string(), e))?;
        Ok(FsStorage { dir })
    }

    fn path_for(&self, key: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, ext))
    }

    /// Persists renames and unlinks in the queue directory.
    #[cfg(unix)]
    fn sync_dir(&self) -> io::Result<()> {
        fs::File::open(&self.dir)?.sync_all()
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> io::Result<()> {
        Ok(())
    }
}

impl Storage for FsStorage {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        // Write, fsync, rename, fsync the directory: after a power cut the
        // entry is either complete or absent.
        let tmp = self.path_for(key, TMP_EXT);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| io_error(key, e))?;
        file.write_all(data).map_err(|e| io_error(key, e))?;
        file.sync_all().map_err(|e| io_error(key, e))?;
        drop(file);
        fs::rename(&tmp, self.path_for(key, ENTRY_EXT)).map_err(|e| io_error(key, e))?;
        self.sync_dir().map_err(|e| io_error(key, e))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path_for(key, ENTRY_EXT)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(key, e)),
        }
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key, ENTRY_EXT)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let dir_key = self.dir.display().to_string();
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(|e| io_error(&dir_key, e))? {
            let path = entry.map_err(|e| io_error(&dir_key, e))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                keys.push(stem.to_string());
            }
        }
        Ok(keys)
    }

    fn quarantine(&self, key: &str) -> Result<(), StorageError> {
        let target = self.path_for(key, CORRUPT_EXT);
        warn!("Quarantining queue entry {} as {}", key, target.display());
        fs::rename(self.path_for(key, ENTRY_EXT), target).map_err(|e| io_error(key, e))?;
        self.sync_dir().map_err(|e| io_error(key, e))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("queue-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn fs_storage_lists_only_live_entries() {
        let dir = scratch_dir("list");
        let storage = FsStorage::open(&dir).unwrap();
        storage.put("20260101T000000.000001Z", b"{}").unwrap();
        storage.put("20260101T000000.000002Z", b"{}").unwrap();
        storage.put("20260101T000000.000003Z", b"{}").unwrap();
        storage.quarantine("20260101T000000.000003Z").unwrap();
        fs::write(dir.join("stray.tmp"), b"partial").unwrap();

        let mut keys = storage.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["20260101T000000.000001Z", "20260101T000000.000002Z"]);
        assert!(dir.join("20260101T000000.000003Z.corrupt").exists());

        storage.remove("20260101T000000.000001Z").unwrap();
        storage.remove("20260101T000000.000001Z").unwrap();
        assert_eq!(storage.get("20260101T000000.000001Z").unwrap(), None);
        assert!(storage.contains("20260101T000000.000002Z").unwrap());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn put_replaces_leftover_temp_file_and_leaves_no_temp_behind() {
        let dir = scratch_dir("put");
        let storage = FsStorage::open(&dir).unwrap();
        let key = "20260101T000000.000001Z";
        // a longer temp file from an interrupted write
        fs::write(dir.join(format!("{}.tmp", key)), b"{\"partial\": \"garbage garbage\"").unwrap();

        storage.put(key, b"{}").unwrap();
        assert_eq!(storage.get(key).unwrap().as_deref(), Some(&b"{}"[..]));
        assert!(!dir.join(format!("{}.tmp", key)).exists());
        assert_eq!(storage.keys().unwrap(), vec![key.to_string()]);

        storage.put(key, b"[1]").unwrap();
        assert_eq!(storage.get(key).unwrap().as_deref(), Some(&b"[1]"[..]));

        fs::remove_dir_all(&dir).unwrap();
    }
}
