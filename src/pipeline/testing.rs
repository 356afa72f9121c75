//! Scripted engines and fixtures for pipeline-driven tests.

use super::{DownloadPipeline, DownloadReport, FileTargets, PipelineListener, PipelineSettings};
use crate::engine::{
    ChunkSink, DownloadEngine, EngineError, EngineProvider, Interrupt, PackageInfo, Transfer,
};
use crate::records::Records;
use crate::state::{LogNotifier, Notifier, UpdateStateMachine};
use crate::store::FileStore;
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::time::Duration;
use std::{cmp, thread};

/// Deterministic package content.
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[derive(Clone, Debug)]
struct Script {
    content: Vec<u8>,
    chunk_size: usize,
    hold_at: Option<u64>,
    fail_at: Option<(u64, u16)>,
    announced: Option<u64>,
}

/// Engine provider serving one in-memory package.
#[derive(Clone)]
pub(crate) struct ScriptedEngines {
    script: Script,
    offsets: Arc<Mutex<Vec<u64>>>,
    held: Arc<(Mutex<bool>, Condvar)>,
}

impl ScriptedEngines {
    pub(crate) fn new(content: Vec<u8>, chunk_size: usize) -> Self {
        Self {
            script: Script {
                content,
                chunk_size,
                hold_at: None,
                fail_at: None,
                announced: None,
            },
            offsets: Arc::new(Mutex::new(vec![])),
            held: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Stall at `offset` until interrupted, unless the transfer starts past it.
    pub(crate) fn hold_at(mut self, offset: u64) -> Self {
        self.script.hold_at = Some(offset);
        self
    }

    /// Fail with an HTTP status once `offset` is reached.
    pub(crate) fn fail_at(mut self, offset: u64, status: u16) -> Self {
        self.script.fail_at = Some((offset, status));
        self
    }

    /// Announce `size` bytes, whatever the content really holds.
    pub(crate) fn announce(mut self, size: u64) -> Self {
        self.script.announced = Some(size);
        self
    }

    pub(crate) fn wait_held(&self, timeout: Duration) -> bool {
        let (ref lock, ref cond) = *self.held;
        let held = lock.lock().unwrap();
        let (held, _) = cond.wait_timeout_while(held, timeout, |h| !*h).unwrap();
        *held
    }

    /// Start offsets of every transfer so far.
    pub(crate) fn requested_offsets(&self) -> Vec<u64> {
        self.offsets.lock().unwrap().clone()
    }
}

impl EngineProvider for ScriptedEngines {
    fn engine_for(&self, _uri: &reqwest::Url) -> Result<Box<dyn DownloadEngine>, EngineError> {
        Ok(Box::new(ScriptedEngine {
            source: self.clone(),
        }))
    }
}

struct ScriptedEngine {
    source: ScriptedEngines,
}

impl ScriptedEngine {
    fn hold(&self, sink: &mut dyn ChunkSink) -> Interrupt {
        {
            let (ref lock, ref cond) = *self.source.held;
            *lock.lock().unwrap() = true;
            cond.notify_all();
        }
        loop {
            if let Some(reason) = sink.interrupted() {
                return reason;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl DownloadEngine for ScriptedEngine {
    fn init(&mut self, _uri: &reqwest::Url) -> Result<(), EngineError> {
        Ok(())
    }

    fn get_info(&mut self) -> Result<PackageInfo, EngineError> {
        let script = &self.source.script;
        Ok(PackageInfo {
            size: Some(script.announced.unwrap_or(script.content.len() as u64)),
        })
    }

    fn download(
        &mut self,
        start_offset: u64,
        sink: &mut dyn ChunkSink,
    ) -> Result<Transfer, EngineError> {
        self.source.offsets.lock().unwrap().push(start_offset);
        let script = self.source.script.clone();
        let len = script.content.len() as u64;
        let hold_at = script.hold_at.filter(|h| start_offset < *h);

        let mut pos = start_offset;
        while pos < len {
            if let Some((at, status)) = script.fail_at {
                if pos >= at {
                    return Err(EngineError::HttpStatus(status));
                }
            }
            if let Some(h) = hold_at {
                if pos >= h {
                    return Ok(Transfer::Interrupted(self.hold(sink)));
                }
            }
            let mut end = cmp::min(pos + script.chunk_size as u64, len);
            if let Some(h) = hold_at {
                end = cmp::min(end, h);
            }
            let pushed = sink.push(&script.content[pos as usize..end as usize])?;
            if pushed == 0 {
                return Ok(Transfer::Interrupted(
                    sink.interrupted().unwrap_or(Interrupt::Abort),
                ));
            }
            pos += pushed as u64;
        }
        Ok(Transfer::Complete)
    }
}

/// Listener forwarding reports to a channel.
pub(crate) struct ChannelListener {
    tx: Mutex<mpsc::Sender<DownloadReport>>,
}

impl ChannelListener {
    pub(crate) fn new() -> (Arc<dyn PipelineListener>, mpsc::Receiver<DownloadReport>) {
        let (tx, rx) = mpsc::channel();
        let listener: Arc<dyn PipelineListener> = Arc::new(Self { tx: Mutex::new(tx) });
        (listener, rx)
    }
}

impl PipelineListener for ChannelListener {
    fn download_finished(&self, report: &DownloadReport) {
        let _ = self.tx.lock().unwrap().send(report.clone());
    }
}

/// On-disk state and download directories, reusable across simulated restarts.
pub(crate) struct Fixture {
    pub(crate) dir: tempfile::TempDir,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub(crate) fn records(&self) -> Records {
        let store = FileStore::open(self.dir.path().join("state")).unwrap();
        Records::new(Arc::new(store))
    }

    pub(crate) fn states(&self) -> Arc<UpdateStateMachine> {
        self.states_with(Arc::new(LogNotifier::default()))
    }

    pub(crate) fn states_with(&self, notifier: Arc<dyn Notifier>) -> Arc<UpdateStateMachine> {
        let machine = UpdateStateMachine::new(self.records(), notifier);
        Arc::new(machine.unwrap())
    }

    pub(crate) fn targets(&self) -> FileTargets {
        FileTargets::new(self.dir.path().join("downloads"))
    }

    /// A fresh state machine and pipeline, as after a process start.
    pub(crate) fn pipeline(
        &self,
        engines: ScriptedEngines,
        listener: Option<Arc<dyn PipelineListener>>,
    ) -> (Arc<UpdateStateMachine>, DownloadPipeline) {
        let states = self.states();
        let pipeline = self.pipeline_for(states.clone(), engines, listener);
        (states, pipeline)
    }

    pub(crate) fn pipeline_for(
        &self,
        states: Arc<UpdateStateMachine>,
        engines: ScriptedEngines,
        listener: Option<Arc<dyn PipelineListener>>,
    ) -> DownloadPipeline {
        DownloadPipeline::new(
            states,
            Arc::new(engines),
            Arc::new(self.targets()),
            listener,
            PipelineSettings {
                abort_timeout: Duration::from_secs(5),
                ..PipelineSettings::default()
            },
        )
    }
}
