//! Update agent state-machine.

mod agent;

pub(crate) use agent::{
    AbortDownload, ClearResumeInfo, RequestDownload, RequestReboot, RequestUninstall,
    ResumeDownload, SuspendDownload, UpdateAgent,
};

use crate::arbiter::ArbiterActor;
use crate::engine::EngineProvider;
use crate::install::Installer;
use crate::pipeline::{DownloadPipeline, PipelineListener, PipelineSettings, TargetProvider};
use crate::state::UpdateStateMachine;
use actix::prelude::*;
use std::path::PathBuf;
use std::sync::{self, Arc};

/// Everything the agent is built from.
pub(crate) struct AgentParts {
    pub(crate) arbiter: Addr<ArbiterActor>,
    pub(crate) states: Arc<UpdateStateMachine>,
    pub(crate) engines: Arc<dyn EngineProvider>,
    pub(crate) targets: Arc<dyn TargetProvider>,
    pub(crate) installer: Box<dyn Installer>,
    pub(crate) pipeline: PipelineSettings,
    pub(crate) staging_dir: PathBuf,
}

impl UpdateAgent {
    /// Start the agent on the current arbiter; resumption runs right away.
    pub(crate) fn start_with(parts: AgentParts) -> Addr<UpdateAgent> {
        UpdateAgent::create(move |ctx| {
            let listener: Arc<dyn PipelineListener> = Arc::new(agent::AgentListener {
                addr: sync::Mutex::new(ctx.address()),
            });
            let pipeline = DownloadPipeline::new(
                parts.states.clone(),
                parts.engines,
                parts.targets,
                Some(listener),
                parts.pipeline,
            );
            UpdateAgent {
                arbiter: parts.arbiter,
                records: parts.states.records().clone(),
                states: parts.states,
                pipeline,
                installer: parts.installer,
                staging_dir: parts.staging_dir,
            }
        })
    }
}
