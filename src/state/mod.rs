//! Update progress model.
//!
//! The `(state, result)` pair describes where an update session stands.
//! `InternalState` records why the device sits in a given state, so that
//! a restart can tell a pending consent from an idle device.

mod machine;

pub(crate) use machine::{LogNotifier, Notifier, StateChange, StateError, UpdateStateMachine};

use std::fmt;

/// Kind of package being updated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) enum UpdateType {
    Firmware,
    Software,
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UpdateType::Firmware => write!(f, "firmware"),
            UpdateType::Software => write!(f, "software"),
        }
    }
}

/// Progress of an update session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum UpdateState {
    Initial,
    DownloadStarted,
    Downloaded,
    Delivered,
    Installed,
    WaitInstallResult,
}

impl Default for UpdateState {
    fn default() -> Self {
        UpdateState::Initial
    }
}

/// Outcome attached to an update state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum UpdateResult {
    /// Nothing to report, the default.
    Normal,
    Downloading,
    Downloaded,
    Installed,
    NotEnoughMemory,
    OutOfMemory,
    /// Transfer interrupted by the network, resumable.
    ConnectionLost,
    IntegrityCheckFailure,
    UnsupportedPackage,
    InvalidUri,
    UnsupportedProtocol,
    DownloadFailed,
    InstallFailed,
    UninstallFailed,
}

impl Default for UpdateResult {
    fn default() -> Self {
        UpdateResult::Normal
    }
}

impl UpdateResult {
    /// Whether this result terminates the current attempt.
    pub(crate) fn is_failure(self) -> bool {
        match self {
            UpdateResult::Normal
            | UpdateResult::Downloading
            | UpdateResult::Downloaded
            | UpdateResult::Installed
            | UpdateResult::ConnectionLost => false,
            UpdateResult::NotEnoughMemory
            | UpdateResult::OutOfMemory
            | UpdateResult::IntegrityCheckFailure
            | UpdateResult::UnsupportedPackage
            | UpdateResult::InvalidUri
            | UpdateResult::UnsupportedProtocol
            | UpdateResult::DownloadFailed
            | UpdateResult::InstallFailed
            | UpdateResult::UninstallFailed => true,
        }
    }
}

/// Reason for the current state, used to disambiguate resumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum InternalState {
    Invalid,
    DownloadRequested,
    InstallRequested,
    UninstallRequested,
}

impl Default for InternalState {
    fn default() -> Self {
        InternalState::Invalid
    }
}

/// Name and version of a software package, from its manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PackageIdent {
    pub(crate) name: String,
    pub(crate) version: semver::Version,
}

impl fmt::Display for PackageIdent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}
