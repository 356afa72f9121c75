//! Coordination between the pipeline owner and its workers.

use crate::engine::Interrupt;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Lifecycle of the worker pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DownloadStatus {
    Idle,
    Active,
    Abort,
    Suspend,
}

impl Default for DownloadStatus {
    fn default() -> Self {
        DownloadStatus::Idle
    }
}

/// Outcome of a stop request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopRequest {
    /// Nothing was running.
    NotRunning,
    /// Another stop request is already being processed.
    AlreadyStopping,
    /// The workers have been asked to stop.
    Requested,
}

/// Counting semaphore.
#[derive(Debug, Default)]
pub(crate) struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub(crate) fn post(&self) {
        let mut count = self.count.lock().expect("poisoned lock");
        *count += 1;
        self.cond.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut count = self.count.lock().expect("poisoned lock");
        while *count == 0 {
            count = self.cond.wait(count).expect("poisoned lock");
        }
        *count -= 1;
    }

    /// Wait for a post, returning `false` on timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let count = self.count.lock().expect("poisoned lock");
        let (mut count, _) = self
            .cond
            .wait_timeout_while(count, timeout, |c| *c == 0)
            .expect("poisoned lock");
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    fn drain(&self) {
        *self.count.lock().expect("poisoned lock") = 0;
    }
}

/// Shared status flag plus the "worker exited" semaphore.
///
/// Workers poll the status at chunk boundaries; nothing is ever preempted.
#[derive(Debug, Default)]
pub(crate) struct DownloadControl {
    status: Mutex<DownloadStatus>,
    changed: Condvar,
    exited: Semaphore,
}

impl DownloadControl {
    pub(crate) fn status(&self) -> DownloadStatus {
        *self.status.lock().expect("poisoned lock")
    }

    /// Move from `Idle` to `Active`, `false` if a transfer is already running.
    pub(crate) fn activate(&self) -> bool {
        let mut status = self.status.lock().expect("poisoned lock");
        if *status != DownloadStatus::Idle {
            return false;
        }
        // Posts left over from a stop that timed out.
        self.exited.drain();
        *status = DownloadStatus::Active;
        true
    }

    pub(crate) fn request_stop(&self, reason: Interrupt) -> StopRequest {
        let mut status = self.status.lock().expect("poisoned lock");
        match *status {
            DownloadStatus::Idle => StopRequest::NotRunning,
            DownloadStatus::Abort | DownloadStatus::Suspend => StopRequest::AlreadyStopping,
            DownloadStatus::Active => {
                *status = match reason {
                    Interrupt::Abort => DownloadStatus::Abort,
                    Interrupt::Suspend => DownloadStatus::Suspend,
                };
                self.changed.notify_all();
                StopRequest::Requested
            }
        }
    }

    /// Pending stop request, if any.
    pub(crate) fn interrupted(&self) -> Option<Interrupt> {
        match self.status() {
            DownloadStatus::Abort => Some(Interrupt::Abort),
            DownloadStatus::Suspend => Some(Interrupt::Suspend),
            DownloadStatus::Idle | DownloadStatus::Active => None,
        }
    }

    /// Worker exit: back to `Idle`, acknowledging any stop request.
    pub(crate) fn finish(&self) -> Option<Interrupt> {
        let mut status = self.status.lock().expect("poisoned lock");
        let acknowledged = match *status {
            DownloadStatus::Abort => Some(Interrupt::Abort),
            DownloadStatus::Suspend => Some(Interrupt::Suspend),
            DownloadStatus::Idle | DownloadStatus::Active => None,
        };
        if acknowledged.is_some() {
            self.exited.post();
        }
        *status = DownloadStatus::Idle;
        self.changed.notify_all();
        acknowledged
    }

    /// Wait for the workers to acknowledge a stop request.
    pub(crate) fn wait_exit(&self, timeout: Duration) -> bool {
        self.exited.wait_timeout(timeout)
    }

    /// Wait until no transfer is running.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let status = self.status.lock().expect("poisoned lock");
        let (status, _) = self
            .changed
            .wait_timeout_while(status, timeout, |s| *s != DownloadStatus::Idle)
            .expect("poisoned lock");
        *status == DownloadStatus::Idle
    }
}
