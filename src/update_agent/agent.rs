//! Update agent actor.

use crate::arbiter::{self, ArbiterActor, OpKind, Query};
use crate::install::Installer;
use crate::pipeline::{
    DownloadOutcome, DownloadPipeline, DownloadReport, DownloadStatus, PipelineError,
    PipelineListener, StopOutcome,
};
use crate::records::{Records, ResumeRecord};
use crate::resume::{self, ResumeAction};
use crate::state::{InternalState, UpdateResult, UpdateState, UpdateStateMachine, UpdateType};
use crate::unpack;
use actix::prelude::*;
use failure::{Error, Fallible};
use std::path::PathBuf;
use std::sync::{self, Arc};

/// Drives update sessions from request to install.
pub(crate) struct UpdateAgent {
    pub(super) arbiter: Addr<ArbiterActor>,
    pub(super) states: Arc<UpdateStateMachine>,
    pub(super) records: Records,
    pub(super) pipeline: DownloadPipeline,
    pub(super) installer: Box<dyn Installer>,
    /// Unpacked software packages, waiting for install consent.
    pub(super) staging_dir: PathBuf,
}

impl Actor for UpdateAgent {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        trace!("update agent started");
        match resume::plan(&self.records) {
            Ok(action) => {
                if action != ResumeAction::Nothing {
                    info!("resuming: {:?}", action);
                }
                self.resume(ctx, action);
            }
            Err(e) => error!("failed to read resume records: {}", e),
        }
    }
}

/// Bridge from pipeline workers back into the actor.
pub(super) struct AgentListener {
    pub(super) addr: sync::Mutex<Addr<UpdateAgent>>,
}

impl PipelineListener for AgentListener {
    fn download_finished(&self, report: &DownloadReport) {
        let addr = self.addr.lock().expect("poisoned lock");
        addr.do_send(DownloadFinished(report.clone()));
    }
}

impl UpdateAgent {
    fn resume(&mut self, ctx: &mut Context<Self>, action: ResumeAction) {
        match action {
            ResumeAction::Nothing => {}
            ResumeAction::QueryDownload { uri, update_type } => {
                self.query_download(ctx, uri, update_type)
            }
            ResumeAction::ResumeDownload {
                uri, update_type, ..
            } => {
                if let Err(e) = self.pipeline.start_download(uri.as_str(), update_type, true) {
                    error!("failed to resume {} download: {}", update_type, e);
                }
            }
            ResumeAction::Deliver { update_type } => self.deliver(ctx, update_type),
            ResumeAction::QueryInstall { update_type } => self.query_install(ctx, update_type),
            ResumeAction::QueryUninstall { instance_id } => self.query_uninstall(ctx, instance_id),
            ResumeAction::CheckInstallResult => {
                if let Err(e) = self.check_install_result() {
                    error!("failed to collect firmware install result: {}", e);
                }
            }
        }
    }

    /// Send a consent query, logging the decision.
    fn ask(&self, ctx: &mut Context<Self>, query: Query) {
        let kind = query.kind();
        let request = actix::fut::wrap_future::<_, Self>(self.arbiter.send(query))
            .map(move |res, _actor, _ctx| match res {
                Ok(decision) => debug!("{} query: {:?}", kind, decision),
                Err(e) => error!("{} query refused: {}", kind, e),
            })
            .map_err(|e, _actor, _ctx| error!("arbiter unreachable: {}", e));
        ctx.spawn(request);
    }

    /// Refuse a new session while another one is persisted.
    fn ensure_no_session(&self) -> Fallible<()> {
        match self.records.resume_record()? {
            Some(record) => bail!("{} update session already in progress", record.update_type),
            None => Ok(()),
        }
    }

    fn complete(&self, kind: OpKind) {
        self.arbiter.do_send(arbiter::Complete(kind));
    }

    fn query_download(&mut self, ctx: &mut Context<Self>, uri: reqwest::Url, update_type: UpdateType) {
        let size = self
            .records
            .resume_record()
            .ok()
            .and_then(|r| r)
            .map(|r| r.package_size)
            .unwrap_or(0);
        let addr = ctx.address();
        let query = Query::download(update_type, size, move |_| {
            addr.do_send(DownloadConsented { uri, update_type })
        });
        self.ask(ctx, query);
    }

    fn query_install(&mut self, ctx: &mut Context<Self>, update_type: UpdateType) {
        let instance_id = match update_type {
            UpdateType::Firmware => None,
            UpdateType::Software => self.states.software_instance().unwrap_or(None),
        };
        if let Err(e) = self
            .records
            .set_internal_state(update_type, InternalState::InstallRequested)
        {
            error!("failed to persist install request: {}", e);
            return;
        }
        let addr = ctx.address();
        let query = Query::install(update_type, instance_id, move |_| {
            addr.do_send(InstallConsented { update_type })
        });
        self.ask(ctx, query);
    }

    fn query_uninstall(&mut self, ctx: &mut Context<Self>, instance_id: u16) {
        let addr = ctx.address();
        let query = Query::uninstall(instance_id, move |_| {
            addr.do_send(UninstallConsented { instance_id })
        });
        self.ask(ctx, query);
    }

    fn query_reboot(&mut self, ctx: &mut Context<Self>) {
        let addr = ctx.address();
        self.ask(ctx, Query::reboot(move |_| addr.do_send(RebootConsented)));
    }

    /// Verify or unpack a complete package, then ask for install consent.
    fn deliver(&mut self, ctx: &mut Context<Self>, update_type: UpdateType) {
        let package = self.pipeline.package_path(update_type);
        let delivered = match update_type {
            UpdateType::Firmware => {
                let expected = self
                    .records
                    .resume_record()
                    .ok()
                    .and_then(|r| r)
                    .map(|r| r.package_size)
                    .unwrap_or(0);
                unpack::verify_firmware(&package, expected).map(|_| ())
            }
            UpdateType::Software => unpack::unpack_software(&package, &self.staging_dir)
                .map(|ident| self.states.set_software_package(Some(ident))),
        };

        let persisted = match delivered {
            Ok(()) => self
                .states
                .set_state(update_type, UpdateState::Delivered, UpdateResult::Normal)
                .map(|_| true),
            Err(e) => {
                error!("{} package rejected: {}", update_type, e);
                self.pipeline
                    .clear_download(update_type, e.result_code())
                    .map(|_| false)
            }
        };
        match persisted {
            Ok(true) => self.query_install(ctx, update_type),
            Ok(false) => {}
            Err(e) => error!("failed to persist delivery of {} package: {}", update_type, e),
        }
    }

    fn install(&mut self, ctx: &mut Context<Self>, update_type: UpdateType) -> Fallible<()> {
        self.records
            .set_internal_state(update_type, InternalState::Invalid)?;
        match update_type {
            UpdateType::Firmware => {
                let image = self.pipeline.package_path(update_type);
                if let Err(e) = self.installer.install_firmware(&image) {
                    error!("firmware install failed: {}", e);
                    return self
                        .pipeline
                        .clear_download(update_type, UpdateResult::InstallFailed);
                }
                self.records.set_fw_install_pending(true)?;
                self.states.set_state(
                    update_type,
                    UpdateState::WaitInstallResult,
                    UpdateResult::Normal,
                )?;
                self.query_reboot(ctx);
            }
            UpdateType::Software => {
                let instance_id = self
                    .states
                    .software_instance()?
                    .ok_or_else(|| format_err!("software install without an instance"))?;
                if let Err(e) = self.installer.install_software(instance_id, &self.staging_dir) {
                    error!("software install failed: {}", e);
                    return self
                        .pipeline
                        .clear_download(update_type, UpdateResult::InstallFailed);
                }
                self.states.set_update_started(false);
                self.records.clear_resume_record()?;
                self.states
                    .set_state(update_type, UpdateState::Installed, UpdateResult::Installed)?;
                self.pipeline.discard_package(update_type);
            }
        }
        Ok(())
    }

    fn uninstall(&mut self, instance_id: u16) -> Fallible<()> {
        let update_type = UpdateType::Software;
        self.records
            .set_internal_state(update_type, InternalState::Invalid)?;
        let result = self.installer.uninstall_software(instance_id);
        self.records.clear_resume_record()?;
        match result {
            Ok(()) => {
                self.states.set_software_package(None);
                self.states
                    .set_state(update_type, UpdateState::Initial, UpdateResult::Normal)
            }
            Err(e) => {
                error!("uninstall of instance {} failed: {}", instance_id, e);
                self.states.set_state(
                    update_type,
                    UpdateState::Installed,
                    UpdateResult::UninstallFailed,
                )
            }
        }
    }

    /// Firmware was flashed before the last reboot; report how it went.
    fn check_install_result(&mut self) -> Fallible<()> {
        let update_type = UpdateType::Firmware;
        let installed = self.installer.firmware_installed()?;
        self.records.set_fw_install_pending(false)?;
        self.records.set_fw_notification(true)?;
        self.records.clear_resume_record()?;
        self.pipeline.discard_package(update_type);
        if installed {
            info!("firmware update installed");
            self.states
                .set_state(update_type, UpdateState::Installed, UpdateResult::Installed)
        } else {
            error!("firmware update did not survive the reboot");
            self.states
                .set_state(update_type, UpdateState::Initial, UpdateResult::InstallFailed)
        }
    }
}

/// Download a package, after consent.
pub(crate) struct RequestDownload {
    pub(crate) uri: String,
    pub(crate) update_type: UpdateType,
    /// Object-9 instance, for software packages.
    pub(crate) instance_id: Option<u16>,
}

impl Message for RequestDownload {
    type Result = Result<(), Error>;
}

impl Handler<RequestDownload> for UpdateAgent {
    type Result = Result<(), Error>;

    fn handle(&mut self, msg: RequestDownload, ctx: &mut Self::Context) -> Self::Result {
        let uri = self.pipeline.check_uri(&msg.uri)?;
        if self.pipeline.status() != DownloadStatus::Idle {
            return Err(PipelineError::Busy.into());
        }
        self.ensure_no_session()?;
        if msg.update_type == UpdateType::Software {
            let instance_id = msg
                .instance_id
                .ok_or_else(|| format_err!("software download without an instance id"))?;
            self.states.begin_software_session(instance_id)?;
        }

        info!("{} download requested: {}", msg.update_type, uri);
        self.records
            .write_resume_record(&ResumeRecord::new(uri.clone(), msg.update_type))?;
        self.records
            .set_internal_state(msg.update_type, InternalState::DownloadRequested)?;
        self.query_download(ctx, uri, msg.update_type);
        Ok(())
    }
}

/// Remove an installed application, after consent.
pub(crate) struct RequestUninstall {
    pub(crate) instance_id: u16,
}

impl Message for RequestUninstall {
    type Result = Result<(), Error>;
}

impl Handler<RequestUninstall> for UpdateAgent {
    type Result = Result<(), Error>;

    fn handle(&mut self, msg: RequestUninstall, ctx: &mut Self::Context) -> Self::Result {
        self.ensure_no_session()?;
        self.states.begin_software_session(msg.instance_id)?;
        self.records.write_resume_record(&ResumeRecord {
            uri: None,
            update_type: UpdateType::Software,
            byte_offset: 0,
            package_size: 0,
        })?;
        self.records
            .set_internal_state(UpdateType::Software, InternalState::UninstallRequested)?;
        self.query_uninstall(ctx, msg.instance_id);
        Ok(())
    }
}

pub(crate) struct RequestReboot;

impl Message for RequestReboot {
    type Result = ();
}

impl Handler<RequestReboot> for UpdateAgent {
    type Result = ();

    fn handle(&mut self, _msg: RequestReboot, ctx: &mut Self::Context) -> Self::Result {
        self.query_reboot(ctx);
    }
}

/// Stop the running download and forget it.
pub(crate) struct AbortDownload;

impl Message for AbortDownload {
    type Result = Result<StopOutcome, Error>;
}

impl Handler<AbortDownload> for UpdateAgent {
    type Result = Result<StopOutcome, Error>;

    fn handle(&mut self, _msg: AbortDownload, _ctx: &mut Self::Context) -> Self::Result {
        self.pipeline.abort_download()
    }
}

/// Stop the running download, keeping the resume point.
pub(crate) struct SuspendDownload;

impl Message for SuspendDownload {
    type Result = StopOutcome;
}

impl Handler<SuspendDownload> for UpdateAgent {
    type Result = MessageResult<SuspendDownload>;

    fn handle(&mut self, _msg: SuspendDownload, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.pipeline.suspend_download())
    }
}

/// Continue a suspended or interrupted download.
pub(crate) struct ResumeDownload;

impl Message for ResumeDownload {
    type Result = Result<(), Error>;
}

impl Handler<ResumeDownload> for UpdateAgent {
    type Result = Result<(), Error>;

    fn handle(&mut self, _msg: ResumeDownload, _ctx: &mut Self::Context) -> Self::Result {
        let record = self.records.resume_record()?;
        match record {
            Some(ResumeRecord {
                uri: Some(uri),
                update_type,
                ..
            }) if self.states.state(update_type)?.0 == UpdateState::DownloadStarted => {
                self.pipeline.start_download(uri.as_str(), update_type, true)
            }
            Some(r) => bail!("{} update is not in a resumable download", r.update_type),
            None => bail!("no download to resume"),
        }
    }
}

/// Forget an idle, interrupted download.
pub(crate) struct ClearResumeInfo;

impl Message for ClearResumeInfo {
    type Result = Result<(), Error>;
}

impl Handler<ClearResumeInfo> for UpdateAgent {
    type Result = Result<(), Error>;

    fn handle(&mut self, _msg: ClearResumeInfo, _ctx: &mut Self::Context) -> Self::Result {
        if self.pipeline.status() != DownloadStatus::Idle {
            return Err(PipelineError::Busy.into());
        }
        match self.records.resume_record()? {
            Some(record) => self
                .pipeline
                .clear_download(record.update_type, UpdateResult::Normal),
            None => Ok(()),
        }
    }
}

struct DownloadConsented {
    uri: reqwest::Url,
    update_type: UpdateType,
}

impl Message for DownloadConsented {
    type Result = ();
}

impl Handler<DownloadConsented> for UpdateAgent {
    type Result = ();

    fn handle(&mut self, msg: DownloadConsented, _ctx: &mut Self::Context) -> Self::Result {
        let started = self
            .records
            .set_internal_state(msg.update_type, InternalState::Invalid)
            .and_then(|_| {
                self.pipeline
                    .start_download(msg.uri.as_str(), msg.update_type, false)
            });
        if let Err(e) = started {
            error!("failed to start {} download: {}", msg.update_type, e);
            self.complete(OpKind::Download);
        }
    }
}

struct DownloadFinished(DownloadReport);

impl Message for DownloadFinished {
    type Result = ();
}

impl Handler<DownloadFinished> for UpdateAgent {
    type Result = ();

    fn handle(&mut self, msg: DownloadFinished, ctx: &mut Self::Context) -> Self::Result {
        let DownloadReport {
            update_type,
            outcome,
        } = msg.0;
        self.complete(OpKind::Download);
        match outcome {
            DownloadOutcome::Completed { .. } => self.deliver(ctx, update_type),
            DownloadOutcome::Suspended { offset } => {
                debug!("{} download parked at {}", update_type, offset)
            }
            DownloadOutcome::Aborted => debug!("{} download aborted", update_type),
            DownloadOutcome::Failed { result, class } => warn!(
                "{} download ended with {:?} ({:?} error)",
                update_type, result, class
            ),
        }
    }
}

struct InstallConsented {
    update_type: UpdateType,
}

impl Message for InstallConsented {
    type Result = ();
}

impl Handler<InstallConsented> for UpdateAgent {
    type Result = ();

    fn handle(&mut self, msg: InstallConsented, ctx: &mut Self::Context) -> Self::Result {
        if let Err(e) = self.install(ctx, msg.update_type) {
            error!("{} install aborted: {}", msg.update_type, e);
        }
        self.complete(OpKind::Install);
    }
}

struct UninstallConsented {
    instance_id: u16,
}

impl Message for UninstallConsented {
    type Result = ();
}

impl Handler<UninstallConsented> for UpdateAgent {
    type Result = ();

    fn handle(&mut self, msg: UninstallConsented, _ctx: &mut Self::Context) -> Self::Result {
        if let Err(e) = self.uninstall(msg.instance_id) {
            error!("failed to record uninstall: {}", e);
        }
        self.complete(OpKind::Uninstall);
    }
}

struct RebootConsented;

impl Message for RebootConsented {
    type Result = ();
}

impl Handler<RebootConsented> for UpdateAgent {
    type Result = ();

    fn handle(&mut self, _msg: RebootConsented, _ctx: &mut Self::Context) -> Self::Result {
        if let Err(e) = self.installer.reboot() {
            error!("reboot failed: {}", e);
        }
        self.complete(OpKind::Reboot);
    }
}
