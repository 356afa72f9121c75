//! Local `file://` engine, for sideloaded packages.

use super::{ChunkSink, DownloadEngine, EngineError, Interrupt, PackageInfo, Transfer};
use std::fs;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::PathBuf;

#[derive(Debug)]
pub(crate) struct FileEngine {
    chunk_size: usize,
    path: Option<PathBuf>,
}

impl FileEngine {
    pub(crate) fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            path: None,
        }
    }

    fn path(&self) -> Result<&PathBuf, EngineError> {
        self.path
            .as_ref()
            .ok_or_else(|| EngineError::InvalidUri("file engine not initialized".to_string()))
    }
}

fn source_error(err: std::io::Error) -> EngineError {
    match err.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => EngineError::InvalidUri(err.to_string()),
        _ => EngineError::Communication(err.to_string()),
    }
}

impl DownloadEngine for FileEngine {
    fn init(&mut self, uri: &reqwest::Url) -> Result<(), EngineError> {
        let path = uri
            .to_file_path()
            .map_err(|_| EngineError::InvalidUri(uri.to_string()))?;
        self.path = Some(path);
        Ok(())
    }

    fn get_info(&mut self) -> Result<PackageInfo, EngineError> {
        let meta = fs::metadata(self.path()?).map_err(source_error)?;
        if !meta.is_file() {
            return Err(EngineError::UnsupportedPackage(
                "package is not a regular file".to_string(),
            ));
        }
        Ok(PackageInfo {
            size: Some(meta.len()),
        })
    }

    fn download(
        &mut self,
        start_offset: u64,
        sink: &mut dyn ChunkSink,
    ) -> Result<Transfer, EngineError> {
        let mut src = fs::File::open(self.path()?).map_err(source_error)?;
        src.seek(SeekFrom::Start(start_offset))
            .map_err(source_error)?;

        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let len = src.read(&mut buf).map_err(source_error)?;
            if len == 0 {
                return Ok(Transfer::Complete);
            }
            if sink.push(&buf[..len])? == 0 {
                let reason = sink.interrupted().unwrap_or(Interrupt::Abort);
                return Ok(Transfer::Interrupted(reason));
            }
        }
    }

    fn end_download(&mut self) {
        self.path = None;
    }
}
