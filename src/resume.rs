//! Startup recovery.
//!
//! Looks at what was persisted before the last shutdown and decides how to
//! pick the update up again. Planning is pure; the update agent executes
//! the resulting action once its actor has started.

use crate::records::Records;
use crate::state::{InternalState, UpdateState, UpdateType};
use failure::Fallible;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ResumeAction {
    Nothing,
    /// Download consent was still pending.
    QueryDownload {
        uri: reqwest::Url,
        update_type: UpdateType,
    },
    /// Continue the transfer at the persisted offset.
    ResumeDownload {
        uri: reqwest::Url,
        update_type: UpdateType,
        offset: u64,
    },
    /// The package is complete, deliver it without touching the network.
    Deliver { update_type: UpdateType },
    QueryInstall { update_type: UpdateType },
    QueryUninstall { instance_id: u16 },
    /// Firmware was flashed before the reboot, collect the result.
    CheckInstallResult,
}

/// Decide what to resume. Inconsistent records resolve to `Nothing`.
pub(crate) fn plan(records: &Records) -> Fallible<ResumeAction> {
    let (fw_state, _) = records.update_state(UpdateType::Firmware)?;
    if fw_state == UpdateState::WaitInstallResult && records.fw_install_pending()? {
        return Ok(ResumeAction::CheckInstallResult);
    }

    let record = match records.resume_record()? {
        Some(r) => r,
        None => {
            debug!("no resume record");
            return Ok(ResumeAction::Nothing);
        }
    };
    let update_type = record.update_type;
    let (state, _) = records.update_state(update_type)?;
    let internal = records.internal_state(update_type)?;
    debug!(
        "resume record for {} update: {:?}/{:?}, offset {}",
        update_type, state, internal, record.byte_offset
    );

    let action = match (state, internal, record.uri) {
        (UpdateState::Initial, InternalState::DownloadRequested, Some(uri)) => {
            ResumeAction::QueryDownload { uri, update_type }
        }
        (UpdateState::DownloadStarted, _, Some(uri)) => ResumeAction::ResumeDownload {
            uri,
            update_type,
            offset: record.byte_offset,
        },
        (UpdateState::Downloaded, _, _) => ResumeAction::Deliver { update_type },
        (UpdateState::Delivered, _, _) => ResumeAction::QueryInstall { update_type },
        (UpdateState::Installed, InternalState::UninstallRequested, _)
            if update_type == UpdateType::Software =>
        {
            match records.sw_instance_id()? {
                Some(instance_id) => ResumeAction::QueryUninstall { instance_id },
                None => {
                    warn!("uninstall pending without an instance id");
                    ResumeAction::Nothing
                }
            }
        }
        (state, internal, uri) => {
            warn!(
                "nothing to resume for {} update in {:?}/{:?} (uri: {:?})",
                update_type,
                state,
                internal,
                uri.map(|u| u.to_string())
            );
            ResumeAction::Nothing
        }
    };
    Ok(action)
}
