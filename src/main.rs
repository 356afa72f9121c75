//! otad: over-the-air update daemon.
//!
//! This binary downloads, stores and installs firmware images and
//! software packages, surviving restarts and power cycles in the middle
//! of an update session.
//!
//! It is made of two actors passing action-requests to each other:
//!  * `ArbiterActor` - gatekeeper for downloads, installs, uninstalls and reboots.
//!  * `UpdateAgent` - drives update sessions and resumes them at startup.
//!
//! Package transfers run on dedicated worker threads owned by the
//! `DownloadPipeline`.

#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate structopt;

mod arbiter;
mod config;
mod engine;
mod install;
mod pipeline;
mod records;
mod resume;
mod state;
mod store;
mod unpack;
mod update_agent;

use crate::arbiter::ArbiterActor;
use crate::config::OtadConfig;
use crate::pipeline::FileTargets;
use crate::records::Records;
use crate::state::{LogNotifier, UpdateStateMachine, UpdateType};
use crate::store::FileStore;
use crate::update_agent::{AgentParts, RequestDownload, UpdateAgent};
use actix::prelude::*;
use failure::Fallible;
use log::LevelFilter;
use std::sync::Arc;
use structopt::StructOpt;

/// Command-line options.
#[derive(Debug, StructOpt)]
#[structopt(name = "otad")]
struct CliOptions {
    /// Verbosity level (repeat for more details)
    #[structopt(short = "v", parse(from_occurrences))]
    verbosity: u8,
    /// Request a package download at startup
    #[structopt(long = "download")]
    download: Option<String>,
    /// Object-9 instance, makes the startup download a software update
    #[structopt(long = "software-instance")]
    software_instance: Option<u16>,
}

impl CliOptions {
    fn log_level(&self) -> Option<LevelFilter> {
        match self.verbosity {
            0 => None,
            1 => Some(LevelFilter::Debug),
            _ => Some(LevelFilter::Trace),
        }
    }
}

fn main() -> Fallible<()> {
    let opts = CliOptions::from_args();
    let mut logger = env_logger::Builder::from_default_env();
    if let Some(level) = opts.log_level() {
        logger.filter(Some("otad"), level);
    }
    logger.try_init()?;
    info!("starting otad");

    let cfg = OtadConfig::read_config(config::CONFIG_DIRS)?;
    let store = FileStore::open(&cfg.state_dir)?;
    let records = Records::new(Arc::new(store));
    let states = Arc::new(UpdateStateMachine::new(
        records,
        Arc::new(LogNotifier::default()),
    )?);

    let sys = actix::System::new("otad");

    // Start the arbiter in its own thread and event loop.
    let arbiter_thread = Arbiter::builder()
        .name("arbiter")
        .stop_system_on_panic(true)
        .build();
    let settings = cfg.arbiter();
    let arbiter = Supervisor::start_in_arbiter(&arbiter_thread, move |_| {
        ArbiterActor::new(settings)
    });

    let agent = UpdateAgent::start_with(AgentParts {
        arbiter,
        states,
        engines: Arc::new(cfg.engines()),
        targets: Arc::new(FileTargets::new(&cfg.download_dir)),
        installer: Box::new(cfg.installer()),
        pipeline: cfg.pipeline(),
        staging_dir: cfg.staging_dir(),
    });

    if let Some(uri) = opts.download {
        let update_type = match opts.software_instance {
            Some(_) => UpdateType::Software,
            None => UpdateType::Firmware,
        };
        agent.do_send(RequestDownload {
            uri,
            update_type,
            instance_id: opts.software_instance,
        });
    }

    sys.run();
    Ok(())
}
