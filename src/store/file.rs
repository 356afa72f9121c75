//! Directory-backed store, one file per key.

use super::KvStore;
use failure::{Fallible, ResultExt};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::{fs, sync};

/// Store keeping every record as a file named after its key.
///
/// Writes go to a temporary file in the same directory, which is synced
/// and then renamed over the previous record. The directory itself is
/// synced after every rename or removal.
#[derive(Debug)]
pub(crate) struct FileStore {
    dir: PathBuf,
    // Serializes writers of the same directory, renames stay atomic anyway.
    write_lock: sync::Mutex<()>,
}

impl FileStore {
    pub(crate) fn open<P: AsRef<Path>>(dir: P) -> Fallible<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .context(format!("failed to create state directory '{}'", dir.display()))?;
        trace!("file store opened at {}", dir.display());
        Ok(Self {
            dir,
            write_lock: sync::Mutex::new(()),
        })
    }

    fn record_path(&self, key: &str) -> Fallible<PathBuf> {
        if key.is_empty() || key.contains('/') || key.starts_with('.') {
            bail!("invalid record key '{}'", key);
        }
        Ok(self.dir.join(key))
    }

    /// Make renames and removals in the store directory durable.
    fn sync_dir(&self) -> Fallible<()> {
        fs::File::open(&self.dir)
            .and_then(|dir| dir.sync_all())
            .context(format!("failed to sync state directory '{}'", self.dir.display()))?;
        Ok(())
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Fallible<Option<Vec<u8>>> {
        let path = self.record_path(key)?;
        match fs::read(&path) {
            Ok(content) => Ok(Some(content)),
            Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .context(format!("failed to read record '{}'", key))
                .map_err(Into::into),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Fallible<()> {
        let path = self.record_path(key)?;
        let _guard = self.write_lock.lock().expect("poisoned lock");

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .context(format!("failed to create temporary record for '{}'", key))?;
        tmp.write_all(value)
            .context(format!("failed to write record '{}'", key))?;
        tmp.as_file()
            .sync_all()
            .context(format!("failed to sync record '{}'", key))?;
        tmp.persist(&path)
            .map_err(|e| e.error)
            .context(format!("failed to replace record '{}'", key))?;
        self.sync_dir()
    }

    fn delete(&self, key: &str) -> Fallible<()> {
        let path = self.record_path(key)?;
        let _guard = self.write_lock.lock().expect("poisoned lock");
        match fs::remove_file(&path) {
            Ok(_) => self.sync_dir(),
            Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .context(format!("failed to delete record '{}'", key))
                .map_err(Into::into),
        }
    }
}
