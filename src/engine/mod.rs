//! Download engines.
//!
//! An engine performs the actual transfer for one package and hands the
//! data over chunk by chunk to a `ChunkSink`. The pipeline drives the
//! `init -> get_info -> download -> end_download` sequence and only reacts
//! to the returned errors.

mod file;
pub(crate) use file::FileEngine;

mod http;
pub(crate) use http::{HttpEngine, HttpSettings};

use crate::state::UpdateResult;
use failure::Fail;
use std::io;

/// Why a transfer stopped before the end of the package.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Interrupt {
    /// Stop and forget: the partial package is discarded.
    Abort,
    /// Stop and remember the offset for a later resume.
    Suspend,
}

/// How a `download` call ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Transfer {
    Complete,
    Interrupted(Interrupt),
}

/// Package metadata, as announced by the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PackageInfo {
    pub(crate) size: Option<u64>,
}

/// Receiver side of a transfer.
pub(crate) trait ChunkSink {
    /// Accept one chunk, returning the number of bytes taken.
    ///
    /// Zero means the transfer has been interrupted and the engine
    /// must return without touching the network again.
    fn push(&mut self, chunk: &[u8]) -> Result<usize, EngineError>;

    /// Pending interruption, polled by engines between retries.
    fn interrupted(&self) -> Option<Interrupt>;
}

/// Transfer strategy for one package.
pub(crate) trait DownloadEngine: Send {
    fn init(&mut self, uri: &reqwest::Url) -> Result<(), EngineError>;

    fn get_info(&mut self) -> Result<PackageInfo, EngineError> {
        Ok(PackageInfo::default())
    }

    /// Stream the package, starting at `start_offset`, into `sink`.
    fn download(
        &mut self,
        start_offset: u64,
        sink: &mut dyn ChunkSink,
    ) -> Result<Transfer, EngineError>;

    fn end_download(&mut self) {}
}

/// Factory of engines, one per download.
pub(crate) trait EngineProvider: Send + Sync {
    fn engine_for(&self, uri: &reqwest::Url) -> Result<Box<dyn DownloadEngine>, EngineError>;
}

/// Engine selection based on the URI scheme.
#[derive(Clone, Debug)]
pub(crate) struct SchemeEngines {
    pub(crate) http: HttpSettings,
    pub(crate) chunk_size: usize,
}

impl EngineProvider for SchemeEngines {
    fn engine_for(&self, uri: &reqwest::Url) -> Result<Box<dyn DownloadEngine>, EngineError> {
        match uri.scheme() {
            "http" | "https" => Ok(Box::new(HttpEngine::new(self.http.clone()))),
            "file" => Ok(Box::new(FileEngine::new(self.chunk_size))),
            x => Err(EngineError::UnsupportedProtocol(x.to_string())),
        }
    }
}

/// Error classes, driving the retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ErrorClass {
    /// Transport trouble, safe to retry at the same offset.
    Communication,
    /// Bad package or location, must restart from scratch.
    Content,
    /// Out of memory or storage.
    Resource,
}

#[derive(Debug, Fail)]
pub(crate) enum EngineError {
    #[fail(display = "communication failure: {}", _0)]
    Communication(String),
    #[fail(display = "server replied with HTTP status {}", _0)]
    HttpStatus(u16),
    #[fail(display = "invalid package URI: {}", _0)]
    InvalidUri(String),
    #[fail(display = "unsupported protocol '{}'", _0)]
    UnsupportedProtocol(String),
    #[fail(display = "unsupported package: {}", _0)]
    UnsupportedPackage(String),
    #[fail(display = "local storage failure: {}", _0)]
    Storage(String),
    #[fail(display = "not enough storage space")]
    NoSpace,
}

// ENOSPC on Linux.
const ENOSPC: i32 = 28;

impl EngineError {
    pub(crate) fn class(&self) -> ErrorClass {
        match self {
            EngineError::Communication(_) => ErrorClass::Communication,
            EngineError::HttpStatus(500) | EngineError::HttpStatus(502) | EngineError::HttpStatus(503) => {
                ErrorClass::Communication
            }
            EngineError::HttpStatus(_)
            | EngineError::InvalidUri(_)
            | EngineError::UnsupportedProtocol(_)
            | EngineError::UnsupportedPackage(_) => ErrorClass::Content,
            EngineError::Storage(_) | EngineError::NoSpace => ErrorClass::Resource,
        }
    }

    /// Result code reported for this error.
    pub(crate) fn result_code(&self) -> UpdateResult {
        match self {
            EngineError::Communication(_) => UpdateResult::ConnectionLost,
            EngineError::HttpStatus(404) => UpdateResult::InvalidUri,
            EngineError::HttpStatus(_) if self.class() == ErrorClass::Communication => {
                UpdateResult::ConnectionLost
            }
            EngineError::HttpStatus(_) => UpdateResult::DownloadFailed,
            EngineError::InvalidUri(_) => UpdateResult::InvalidUri,
            EngineError::UnsupportedProtocol(_) => UpdateResult::UnsupportedProtocol,
            EngineError::UnsupportedPackage(_) => UpdateResult::UnsupportedPackage,
            EngineError::Storage(_) => UpdateResult::DownloadFailed,
            EngineError::NoSpace => UpdateResult::NotEnoughMemory,
        }
    }

    /// Map a local I/O failure on the destination.
    pub(crate) fn from_storage(err: io::Error) -> Self {
        if err.raw_os_error() == Some(ENOSPC) {
            EngineError::NoSpace
        } else {
            EngineError::Storage(err.to_string())
        }
    }
}
