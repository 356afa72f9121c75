//! Package destinations.

use crate::engine::EngineError;
use crate::state::UpdateType;
use std::fs;
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Durable destination of a package.
pub(crate) trait StoreTarget: Send {
    /// Open for writing, keeping exactly `offset` bytes already stored.
    fn open(&mut self, offset: u64) -> Result<(), EngineError>;

    /// Append a range; durable once this returns.
    fn store_range(&mut self, buf: &[u8]) -> Result<(), EngineError>;

    fn finish(&mut self) -> Result<(), EngineError>;

    /// Drop everything stored so far.
    fn discard(&mut self) -> Result<(), EngineError>;
}

/// Factory of destinations, one per update type.
pub(crate) trait TargetProvider: Send + Sync {
    fn target_for(&self, update_type: UpdateType) -> Box<dyn StoreTarget>;

    /// Where a completed package can be found.
    fn package_path(&self, update_type: UpdateType) -> PathBuf;
}

/// Packages stored as plain files in a download directory.
#[derive(Clone, Debug)]
pub(crate) struct FileTargets {
    dir: PathBuf,
}

impl FileTargets {
    pub(crate) fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl TargetProvider for FileTargets {
    fn target_for(&self, update_type: UpdateType) -> Box<dyn StoreTarget> {
        Box::new(FileTarget::new(self.package_path(update_type)))
    }

    fn package_path(&self, update_type: UpdateType) -> PathBuf {
        match update_type {
            UpdateType::Firmware => self.dir.join("firmware.pkg"),
            UpdateType::Software => self.dir.join("software.pkg"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct FileTarget {
    path: PathBuf,
    file: Option<fs::File>,
}

impl FileTarget {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }
}

impl StoreTarget for FileTarget {
    fn open(&mut self, offset: u64) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(EngineError::from_storage)?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(EngineError::from_storage)?;

        let current = file.metadata().map_err(EngineError::from_storage)?.len();
        if current < offset {
            return Err(EngineError::Storage(format!(
                "destination holds {} bytes, cannot resume at {}",
                current, offset
            )));
        }
        // Anything past the checkpoint was never accounted for.
        file.set_len(offset).map_err(EngineError::from_storage)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(EngineError::from_storage)?;

        trace!("destination {} opened at {}", self.path.display(), offset);
        self.file = Some(file);
        Ok(())
    }

    fn store_range(&mut self, buf: &[u8]) -> Result<(), EngineError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| EngineError::Storage("destination not open".to_string()))?;
        file.write_all(buf).map_err(EngineError::from_storage)?;
        file.sync_data().map_err(EngineError::from_storage)
    }

    fn finish(&mut self) -> Result<(), EngineError> {
        match self.file.take() {
            Some(file) => file.sync_all().map_err(EngineError::from_storage),
            None => Ok(()),
        }
    }

    fn discard(&mut self) -> Result<(), EngineError> {
        self.file = None;
        match fs::remove_file(&self.path) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::from_storage(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_truncates_to_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let targets = FileTargets::new(dir.path().join("downloads"));
        let path = targets.package_path(UpdateType::Firmware);

        let mut target = targets.target_for(UpdateType::Firmware);
        target.open(0).unwrap();
        target.store_range(b"0123456789").unwrap();
        drop(target);

        let mut target = targets.target_for(UpdateType::Firmware);
        target.open(4).unwrap();
        target.store_range(b"abcd").unwrap();
        target.finish().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"0123abcd".to_vec());
    }

    #[test]
    fn resume_past_end_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let targets = FileTargets::new(dir.path());
        let mut target = targets.target_for(UpdateType::Software);
        assert!(target.open(100).is_err());
    }

    #[test]
    fn discard_removes_package() {
        let dir = tempfile::tempdir().unwrap();
        let targets = FileTargets::new(dir.path());
        let mut target = targets.target_for(UpdateType::Software);
        target.open(0).unwrap();
        target.store_range(b"data").unwrap();
        target.discard().unwrap();
        target.discard().unwrap();
        assert!(!targets.package_path(UpdateType::Software).exists());
    }
}
