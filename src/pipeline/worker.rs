//! Download and store workers.
//!
//! Firmware packages flow through a bounded pipe from the download worker
//! to a dedicated store worker. Software packages are written directly by
//! the download worker, since unpacking cannot overlap a raw append.

use super::control::Semaphore;
use super::target::StoreTarget;
use super::{DownloadOutcome, DownloadReport, Shared};
use crate::engine::{ChunkSink, DownloadEngine, EngineError, ErrorClass, Interrupt, Transfer};
use crate::state::{UpdateResult, UpdateState, UpdateType};
use std::sync::{mpsc, Arc};
use std::thread;

/// One accepted download.
#[derive(Clone, Debug)]
pub(super) struct Job {
    pub(super) uri: reqwest::Url,
    pub(super) update_type: UpdateType,
    pub(super) start_offset: u64,
    pub(super) pipe_depth: usize,
}

/// Bytes stored in total when the transfer ended.
type Stored = (Transfer, u64);

/// Entry point of the download worker thread.
pub(super) fn run_download(shared: Arc<Shared>, job: Job) {
    debug!(
        "download worker started: {} {} at offset {}",
        job.update_type, job.uri, job.start_offset
    );

    let stored = match job.update_type {
        UpdateType::Firmware => download_piped(&shared, &job),
        UpdateType::Software => download_direct(&shared, &job),
    };
    let outcome = conclude(&shared, &job, stored);

    let acknowledged = shared.control.finish();
    // An abort acknowledged here is cleaned up by the aborting side, whatever
    // the transfer managed to persist before.
    let outcome = match acknowledged {
        Some(Interrupt::Abort) => DownloadOutcome::Aborted,
        _ => outcome,
    };
    debug!(
        "download worker exiting: {:?} (acknowledged stop: {:?})",
        outcome, acknowledged
    );

    if let Some(ref listener) = shared.listener {
        let report = DownloadReport {
            update_type: job.update_type,
            outcome,
        };
        listener.download_finished(&report);
    }
}

/// Engine ready to transfer, plus the announced package size.
fn open_engine(
    shared: &Shared,
    job: &Job,
) -> Result<(Box<dyn DownloadEngine>, Option<u64>), EngineError> {
    let mut engine = shared.engines.engine_for(&job.uri)?;
    engine.init(&job.uri)?;
    let info = engine.get_info()?;
    if let Some(size) = info.size {
        if job.start_offset > size {
            return Err(EngineError::UnsupportedPackage(format!(
                "resume offset {} beyond package size {}",
                job.start_offset, size
            )));
        }
        shared
            .records
            .set_package_size(size)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
    }
    Ok((engine, info.size))
}

/// Stream the rest of the package, unless everything is already stored.
fn stream_rest(
    engine: &mut dyn DownloadEngine,
    job: &Job,
    size: Option<u64>,
    sink: &mut dyn ChunkSink,
) -> Result<Transfer, EngineError> {
    if size == Some(job.start_offset) {
        debug!("all {} bytes already stored", job.start_offset);
        return Ok(Transfer::Complete);
    }
    engine.download(job.start_offset, sink)
}

/// A finished transfer must hold exactly the announced size.
fn check_complete(shared: &Shared, written: u64) -> Result<(), EngineError> {
    let announced = shared
        .records
        .resume_record()
        .map_err(|e| EngineError::Storage(e.to_string()))?
        .map_or(0, |r| r.package_size);
    if announced == 0 || written == announced {
        Ok(())
    } else if written < announced {
        Err(EngineError::Communication(format!(
            "transfer ended at byte {} of {}",
            written, announced
        )))
    } else {
        Err(EngineError::UnsupportedPackage(format!(
            "{} bytes received, {} announced",
            written, announced
        )))
    }
}

/// Software path: network straight to the destination.
fn download_direct(shared: &Shared, job: &Job) -> Result<Stored, EngineError> {
    let (mut engine, size) = open_engine(shared, job)?;
    let mut target = shared.targets.target_for(job.update_type);
    if let Err(e) = target.open(job.start_offset) {
        engine.end_download();
        return Err(e);
    }

    let mut sink = DirectSink {
        shared,
        update_type: job.update_type,
        target: &mut *target,
        written: job.start_offset,
    };
    let transfer = stream_rest(&mut *engine, job, size, &mut sink);
    let written = sink.written;
    engine.end_download();

    let transfer = transfer?;
    if transfer == Transfer::Complete {
        check_complete(shared, written)?;
        target.finish()?;
    }
    Ok((transfer, written))
}

struct DirectSink<'a> {
    shared: &'a Shared,
    update_type: UpdateType,
    target: &'a mut dyn StoreTarget,
    written: u64,
}

impl<'a> ChunkSink for DirectSink<'a> {
    fn push(&mut self, chunk: &[u8]) -> Result<usize, EngineError> {
        if self.shared.control.interrupted().is_some() {
            return Ok(0);
        }
        self.target.store_range(chunk)?;
        self.written += chunk.len() as u64;
        checkpoint(self.shared, self.update_type, self.written)?;
        Ok(chunk.len())
    }

    fn interrupted(&self) -> Option<Interrupt> {
        self.shared.control.interrupted()
    }
}

fn checkpoint(shared: &Shared, update_type: UpdateType, written: u64) -> Result<(), EngineError> {
    trace!("{} bytes stored", written);
    shared
        .records
        .set_byte_offset(update_type, written)
        .map_err(|e| EngineError::Storage(e.to_string()))
}

enum PipeMsg {
    Data(Vec<u8>),
    End,
}

/// Firmware path: network into the pipe, store worker out of it.
fn download_piped(shared: &Arc<Shared>, job: &Job) -> Result<Stored, EngineError> {
    let (tx, rx) = mpsc::sync_channel(job.pipe_depth.max(1));
    let started = Arc::new(Semaphore::default());

    let store = {
        let shared = shared.clone();
        let started = started.clone();
        let update_type = job.update_type;
        let offset = job.start_offset;
        thread::Builder::new()
            .name("otad-store".to_string())
            .spawn(move || store_worker(&shared, update_type, offset, rx, &started))
            .map_err(|e| EngineError::Storage(format!("failed to spawn store worker: {}", e)))?
    };

    let mut signaled = false;
    let transfer = (|| -> Result<Transfer, EngineError> {
        let (mut engine, size) = open_engine(shared, job)?;
        // Transfer genuinely starting, the store worker may proceed.
        started.post();
        signaled = true;

        let mut sink = PipeSink {
            shared: &**shared,
            tx: &tx,
        };
        let transfer = stream_rest(&mut *engine, job, size, &mut sink);
        engine.end_download();
        let transfer = transfer?;
        if transfer == Transfer::Complete {
            tx.send(PipeMsg::End)
                .map_err(|_| EngineError::Communication("pipe closed mid-transfer".to_string()))?;
        }
        Ok(transfer)
    })();
    if !signaled {
        started.post();
    }
    drop(tx);

    let stored = match store.join() {
        Ok(stored) => stored,
        Err(_) => Err(EngineError::Storage("store worker panicked".to_string())),
    };

    // A storage failure closes the pipe, which the engine sees as a transport error.
    match (transfer, stored) {
        (_, Err(store_err)) => Err(store_err),
        (Err(e), Ok(_)) => Err(e),
        (Ok(Transfer::Complete), Ok((finished, written))) => {
            if finished {
                Ok((Transfer::Complete, written))
            } else {
                Err(EngineError::Communication(
                    "pipe closed mid-transfer".to_string(),
                ))
            }
        }
        (Ok(interrupted), Ok((_, written))) => Ok((interrupted, written)),
    }
}

struct PipeSink<'a> {
    shared: &'a Shared,
    tx: &'a mpsc::SyncSender<PipeMsg>,
}

impl<'a> ChunkSink for PipeSink<'a> {
    fn push(&mut self, chunk: &[u8]) -> Result<usize, EngineError> {
        if self.shared.control.interrupted().is_some() {
            return Ok(0);
        }
        self.tx
            .send(PipeMsg::Data(chunk.to_vec()))
            .map_err(|_| EngineError::Communication("pipe closed mid-transfer".to_string()))?;
        Ok(chunk.len())
    }

    fn interrupted(&self) -> Option<Interrupt> {
        self.shared.control.interrupted()
    }
}

/// Store worker body, returns whether the package was finished and its size.
fn store_worker(
    shared: &Shared,
    update_type: UpdateType,
    offset: u64,
    rx: mpsc::Receiver<PipeMsg>,
    started: &Semaphore,
) -> Result<(bool, u64), EngineError> {
    started.wait();
    trace!("store worker running");

    let mut target: Option<Box<dyn StoreTarget>> = None;
    let mut written = offset;
    for msg in rx.iter() {
        if shared.control.interrupted() == Some(Interrupt::Abort) {
            debug!("store worker aborted at {}", written);
            return Ok((false, written));
        }

        if target.is_none() {
            let mut opened = shared.targets.target_for(update_type);
            opened.open(offset)?;
            target = Some(opened);
        }
        let dest = match target.as_mut() {
            Some(t) => t,
            None => continue,
        };

        match msg {
            PipeMsg::Data(chunk) => {
                dest.store_range(&chunk)?;
                written += chunk.len() as u64;
                checkpoint(shared, update_type, written)?;
            }
            PipeMsg::End => {
                check_complete(shared, written)?;
                dest.finish()?;
                return Ok((true, written));
            }
        }
    }

    // Pipe closed without an end marker: interrupted or failed upstream.
    Ok((false, written))
}

/// Persist the outcome of a transfer before the worker goes idle.
fn conclude(shared: &Shared, job: &Job, stored: Result<Stored, EngineError>) -> DownloadOutcome {
    let update_type = job.update_type;
    let pending = shared.control.interrupted();
    if pending == Some(Interrupt::Abort) {
        // Cleanup belongs to the aborting side.
        return DownloadOutcome::Aborted;
    }

    let persisted = match stored {
        Ok((Transfer::Complete, bytes)) => {
            info!("{} package downloaded, {} bytes", update_type, bytes);
            let outcome = DownloadOutcome::Completed { bytes };
            shared
                .records
                .clear_byte_offset(update_type)
                .and_then(|_| {
                    shared.states.set_state(
                        update_type,
                        UpdateState::Downloaded,
                        UpdateResult::Downloaded,
                    )
                })
                .map(|_| outcome)
        }
        Ok((Transfer::Interrupted(Interrupt::Suspend), offset)) => {
            info!("{} download suspended at byte {}", update_type, offset);
            Ok(DownloadOutcome::Suspended { offset })
        }
        Ok((Transfer::Interrupted(Interrupt::Abort), _)) => Ok(DownloadOutcome::Aborted),
        Err(ref e) if e.class() == ErrorClass::Communication && pending == Some(Interrupt::Suspend) => {
            let offset = shared.records.byte_offset(update_type).unwrap_or(job.start_offset);
            info!("{} download suspended at byte {} ({})", update_type, offset, e);
            Ok(DownloadOutcome::Suspended { offset })
        }
        Err(e) => {
            let class = e.class();
            let result = e.result_code();
            error!("{} download failed: {} ({:?} error)", update_type, e, class);
            let outcome = DownloadOutcome::Failed { result, class };
            match class {
                ErrorClass::Communication => shared
                    .states
                    .set_state(update_type, UpdateState::DownloadStarted, result)
                    .map(|_| outcome),
                ErrorClass::Content | ErrorClass::Resource => {
                    if let Err(e) = shared.targets.target_for(update_type).discard() {
                        warn!("failed to discard partial package: {}", e);
                    }
                    shared
                        .records
                        .clear_resume_record()
                        .and_then(|_| {
                            shared
                                .states
                                .set_state(update_type, UpdateState::Initial, result)
                        })
                        .map(|_| outcome)
                }
            }
        }
    };

    match persisted {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("failed to persist download outcome: {}", e);
            DownloadOutcome::Failed {
                result: UpdateResult::DownloadFailed,
                class: ErrorClass::Resource,
            }
        }
    }
}
