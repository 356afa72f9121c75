//! Download/store pipeline.
//!
//! `DownloadPipeline` owns the worker threads moving a package from the
//! network to durable storage. Only one transfer runs at a time; it can be
//! aborted (partial package dropped) or suspended (partial package kept,
//! resumable at the persisted byte offset).

mod control;
mod target;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub(crate) use control::DownloadStatus;
pub(crate) use target::{FileTargets, TargetProvider};

use crate::engine::{EngineProvider, ErrorClass, Interrupt};
use crate::records::{Records, ResumeRecord};
use crate::state::{InternalState, StateError, UpdateResult, UpdateState, UpdateStateMachine, UpdateType};
use control::{DownloadControl, StopRequest};
use failure::{Fail, Fallible, ResultExt};
use std::path::PathBuf;
use std::sync::{self, Arc};
use std::{thread, time};

/// Final outcome of one worker run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DownloadOutcome {
    Completed { bytes: u64 },
    Suspended { offset: u64 },
    Aborted,
    Failed { result: UpdateResult, class: ErrorClass },
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DownloadReport {
    pub(crate) update_type: UpdateType,
    pub(crate) outcome: DownloadOutcome,
}

/// Observer of finished transfers, called from the worker thread.
pub(crate) trait PipelineListener: Send + Sync {
    fn download_finished(&self, report: &DownloadReport);
}

#[derive(Clone, Debug)]
pub(crate) struct PipelineSettings {
    /// Bound on waiting for the workers to acknowledge a stop.
    pub(crate) abort_timeout: time::Duration,
    /// Chunks buffered between the download and store workers.
    pub(crate) pipe_depth: usize,
    pub(crate) max_uri_len: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            abort_timeout: time::Duration::from_secs(15),
            pipe_depth: 8,
            max_uri_len: 255,
        }
    }
}

#[derive(Debug, Fail)]
pub(crate) enum PipelineError {
    #[fail(display = "a download is already in progress")]
    Busy,
    #[fail(display = "package URI too long ({} > {} bytes)", len, max)]
    UriTooLong { len: usize, max: usize },
    #[fail(display = "invalid package URI: {}", _0)]
    InvalidUri(String),
    #[fail(display = "no interrupted {} download to resume", _0)]
    NothingToResume(UpdateType),
}

/// Result of an abort or suspend request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopOutcome {
    NotRunning,
    AlreadyStopping,
    Acknowledged,
    /// Workers did not exit in time; reported, not fatal.
    TimedOut,
}

/// State shared with the worker threads.
struct Shared {
    control: DownloadControl,
    records: Records,
    states: Arc<UpdateStateMachine>,
    engines: Arc<dyn EngineProvider>,
    targets: Arc<dyn TargetProvider>,
    listener: Option<Arc<dyn PipelineListener>>,
    current: sync::Mutex<Option<UpdateType>>,
}

pub(crate) struct DownloadPipeline {
    shared: Arc<Shared>,
    settings: PipelineSettings,
}

impl DownloadPipeline {
    pub(crate) fn new(
        states: Arc<UpdateStateMachine>,
        engines: Arc<dyn EngineProvider>,
        targets: Arc<dyn TargetProvider>,
        listener: Option<Arc<dyn PipelineListener>>,
        settings: PipelineSettings,
    ) -> Self {
        let shared = Shared {
            control: DownloadControl::default(),
            records: states.records().clone(),
            states,
            engines,
            targets,
            listener,
            current: sync::Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
            settings,
        }
    }

    pub(crate) fn status(&self) -> DownloadStatus {
        self.shared.control.status()
    }

    pub(crate) fn package_path(&self, update_type: UpdateType) -> PathBuf {
        self.shared.targets.package_path(update_type)
    }

    /// Validate a package location before anything is persisted.
    pub(crate) fn check_uri(&self, uri: &str) -> Result<reqwest::Url, PipelineError> {
        if uri.len() > self.settings.max_uri_len {
            return Err(PipelineError::UriTooLong {
                len: uri.len(),
                max: self.settings.max_uri_len,
            });
        }
        reqwest::Url::parse(uri).map_err(|e| PipelineError::InvalidUri(e.to_string()))
    }

    /// Launch the workers for `uri`.
    ///
    /// With `is_resume`, the transfer continues at the persisted offset of
    /// a matching resume record.
    pub(crate) fn start_download(
        &self,
        uri: &str,
        update_type: UpdateType,
        is_resume: bool,
    ) -> Fallible<()> {
        let url = self.check_uri(uri)?;
        if update_type == UpdateType::Software && self.shared.states.software_instance()?.is_none() {
            return Err(StateError::NoSoftwareSession.into());
        }

        if !self.shared.control.activate() {
            return Err(PipelineError::Busy.into());
        }
        if let Err(e) = self.launch(url, update_type, is_resume) {
            self.shared.control.finish();
            return Err(e);
        }
        Ok(())
    }

    fn launch(&self, url: reqwest::Url, update_type: UpdateType, is_resume: bool) -> Fallible<()> {
        let records = &self.shared.records;
        let start_offset = if is_resume {
            match records.resume_record()? {
                Some(ref r) if r.update_type == update_type && r.uri.as_ref() == Some(&url) => {
                    r.byte_offset
                }
                _ => return Err(PipelineError::NothingToResume(update_type).into()),
            }
        } else {
            records.write_resume_record(&ResumeRecord::new(url.clone(), update_type))?;
            0
        };

        *self.shared.current.lock().expect("poisoned lock") = Some(update_type);
        self.shared.states.set_update_started(true);
        self.shared.states.set_state(
            update_type,
            UpdateState::DownloadStarted,
            UpdateResult::Downloading,
        )?;

        info!(
            "{} {} download from {} at offset {}",
            if is_resume { "resuming" } else { "starting" },
            update_type,
            url,
            start_offset
        );
        let job = worker::Job {
            uri: url,
            update_type,
            start_offset,
            pipe_depth: self.settings.pipe_depth,
        };
        let shared = self.shared.clone();
        thread::Builder::new()
            .name("otad-download".to_string())
            .spawn(move || worker::run_download(shared, job))
            .context("failed to spawn download worker")?;
        Ok(())
    }

    /// Stop the transfer and forget it.
    ///
    /// Never blocks when nothing is running. Cleanup happens even when the
    /// workers fail to acknowledge in time.
    pub(crate) fn abort_download(&self) -> Fallible<StopOutcome> {
        match self.shared.control.request_stop(Interrupt::Abort) {
            StopRequest::NotRunning => {
                debug!("abort requested, no download in progress");
                return Ok(StopOutcome::NotRunning);
            }
            StopRequest::AlreadyStopping => return Ok(StopOutcome::AlreadyStopping),
            StopRequest::Requested => {}
        }

        let outcome = self.wait_for_workers("abort");
        let current = *self.shared.current.lock().expect("poisoned lock");
        if let Some(update_type) = current {
            self.clear_download(update_type, UpdateResult::Normal)?;
        }
        Ok(outcome)
    }

    /// Stop the transfer, keeping the resume point.
    pub(crate) fn suspend_download(&self) -> StopOutcome {
        match self.shared.control.request_stop(Interrupt::Suspend) {
            StopRequest::NotRunning => {
                debug!("suspend requested, no download in progress");
                StopOutcome::NotRunning
            }
            StopRequest::AlreadyStopping => StopOutcome::AlreadyStopping,
            StopRequest::Requested => self.wait_for_workers("suspend"),
        }
    }

    fn wait_for_workers(&self, what: &str) -> StopOutcome {
        if self.shared.control.wait_exit(self.settings.abort_timeout) {
            debug!("download workers acknowledged {}", what);
            StopOutcome::Acknowledged
        } else {
            error!(
                "download workers did not acknowledge {} within {:?}",
                what, self.settings.abort_timeout
            );
            StopOutcome::TimedOut
        }
    }

    /// Delete the stored package, complete or not.
    pub(crate) fn discard_package(&self, update_type: UpdateType) {
        if let Err(e) = self.shared.targets.target_for(update_type).discard() {
            warn!("failed to discard {} package: {}", update_type, e);
        }
    }

    /// Drop the package and every resume field, back to `Initial`.
    pub(crate) fn clear_download(&self, update_type: UpdateType, result: UpdateResult) -> Fallible<()> {
        self.discard_package(update_type);
        let records = &self.shared.records;
        records.clear_resume_record()?;
        records.set_internal_state(update_type, InternalState::Invalid)?;
        self.shared.states.set_update_started(false);
        self.shared
            .states
            .set_state(update_type, UpdateState::Initial, result)
    }

    /// Wait until no transfer is running, `false` on timeout.
    pub(crate) fn wait_idle(&self, timeout: time::Duration) -> bool {
        self.shared.control.wait_idle(timeout)
    }
}
