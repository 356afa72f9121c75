//! Arbitration policy, free of timers and actors.
//!
//! Every kind of sensitive operation goes through the same shape:
//! `Idle -> Pending -> InProgress -> Idle`, with a `Deferred` detour when
//! the decision has to be taken again later. Idle kinds have no entry.

use crate::state::UpdateType;
use failure::Fail;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum OpKind {
    Download,
    Install,
    Uninstall,
    Reboot,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            OpKind::Download => "download",
            OpKind::Install => "install",
            OpKind::Uninstall => "uninstall",
            OpKind::Reboot => "reboot",
        };
        f.write_str(name)
    }
}

/// What the pending operation is about.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum OpContext {
    Download { update_type: UpdateType, size: u64 },
    Install { update_type: UpdateType, instance_id: Option<u16> },
    Uninstall { instance_id: u16 },
    Reboot,
}

impl OpContext {
    pub(crate) fn kind(&self) -> OpKind {
        match self {
            OpContext::Download { .. } => OpKind::Download,
            OpContext::Install { .. } => OpKind::Install,
            OpContext::Uninstall { .. } => OpKind::Uninstall,
            OpContext::Reboot => OpKind::Reboot,
        }
    }
}

/// Invoked once, when the operation is allowed to start.
pub(crate) type ConsentHandler = Box<dyn FnOnce(OpContext) + Send>;

/// Control authority, told about every operation waiting for consent.
pub(crate) type AuthorityHandler = Box<dyn Fn(&OpContext) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Pending,
    Deferred,
    InProgress,
}

/// Outcome of an arbitration round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Accepted, the handler has run.
    Proceed,
    /// Waiting for the control authority.
    Forwarded,
    /// Decide again after this delay.
    Deferred(Duration),
}

#[derive(Debug, Fail, PartialEq)]
pub(crate) enum ArbiterError {
    #[fail(display = "{} operation already registered", _0)]
    AlreadyRegistered(OpKind),
    #[fail(display = "no pending {} operation", _0)]
    NotPending(OpKind),
    #[fail(display = "no {} operation in progress", _0)]
    NotInProgress(OpKind),
    #[fail(display = "unknown block token {}", _0)]
    InvalidToken(u64),
}

/// Handle proving that its holder blocks automatic decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct BlockToken(pub(super) u64);

impl BlockToken {
    pub(crate) fn id(self) -> u64 {
        self.0
    }
}

struct Registration {
    context: OpContext,
    handler: Option<ConsentHandler>,
    phase: Phase,
    evaluations: u32,
}

/// Per-kind snapshot.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OpStatus {
    pub(crate) kind: OpKind,
    pub(crate) phase: Phase,
    /// Arbitration rounds run so far.
    pub(crate) evaluations: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ArbiterStatus {
    pub(crate) authority_attached: bool,
    pub(crate) authority_expected: bool,
    pub(crate) block_count: usize,
    pub(crate) ops: Vec<OpStatus>,
    /// Kinds with an armed defer timer.
    pub(crate) timers: Vec<OpKind>,
}

impl ArbiterStatus {
    pub(crate) fn phase(&self, kind: OpKind) -> Option<Phase> {
        self.ops.iter().find(|op| op.kind == kind).map(|op| op.phase)
    }
}

pub(crate) struct PendingOps {
    ops: HashMap<OpKind, Registration>,
    authority: Option<AuthorityHandler>,
    authority_expected: bool,
    blocks: HashSet<BlockToken>,
    next_token: u64,
    blocked_defer: Duration,
}

impl PendingOps {
    pub(crate) fn new(blocked_defer: Duration, authority_expected: bool) -> Self {
        Self {
            ops: HashMap::new(),
            authority: None,
            authority_expected,
            blocks: HashSet::new(),
            next_token: 1,
            blocked_defer,
        }
    }

    /// Register an operation and run a first arbitration round.
    pub(crate) fn query(
        &mut self,
        context: OpContext,
        handler: ConsentHandler,
    ) -> Result<Decision, ArbiterError> {
        let kind = context.kind();
        if self.ops.contains_key(&kind) {
            error!("{} query rejected, one is already registered", kind);
            return Err(ArbiterError::AlreadyRegistered(kind));
        }

        self.ops.insert(
            kind,
            Registration {
                context,
                handler: Some(handler),
                phase: Phase::Pending,
                evaluations: 0,
            },
        );
        Ok(self.evaluate(kind))
    }

    fn evaluate(&mut self, kind: OpKind) -> Decision {
        let reg = match self.ops.get_mut(&kind) {
            Some(reg) => reg,
            None => return Decision::Proceed,
        };
        reg.evaluations += 1;

        let decision = if let Some(ref authority) = self.authority {
            reg.phase = Phase::Pending;
            authority(&reg.context);
            Decision::Forwarded
        } else if self.authority_expected {
            reg.phase = Phase::Deferred;
            Decision::Deferred(self.blocked_defer)
        } else if !self.blocks.is_empty() {
            reg.phase = Phase::Deferred;
            Decision::Deferred(self.blocked_defer)
        } else {
            self.start(kind);
            Decision::Proceed
        };
        debug!("{} arbitration: {:?}", kind, decision);
        decision
    }

    fn start(&mut self, kind: OpKind) {
        if let Some(reg) = self.ops.get_mut(&kind) {
            reg.phase = Phase::InProgress;
            if let Some(handler) = reg.handler.take() {
                handler(reg.context.clone());
            }
        }
    }

    fn phase(&self, kind: OpKind) -> Option<Phase> {
        self.ops.get(&kind).map(|reg| reg.phase)
    }

    /// Consent from the control authority.
    pub(crate) fn accept(&mut self, kind: OpKind) -> Result<(), ArbiterError> {
        if self.phase(kind) != Some(Phase::Pending) {
            error!("accept on {} rejected, nothing pending", kind);
            return Err(ArbiterError::NotPending(kind));
        }
        info!("{} accepted", kind);
        self.start(kind);
        Ok(())
    }

    /// Postpone a pending operation; the caller arms the timer.
    pub(crate) fn defer(&mut self, kind: OpKind, delay: Duration) -> Result<Duration, ArbiterError> {
        match self.ops.get_mut(&kind) {
            Some(reg) if reg.phase == Phase::Pending => {
                info!("{} deferred for {:?}", kind, delay);
                reg.phase = Phase::Deferred;
                Ok(delay)
            }
            _ => {
                error!("defer on {} rejected, nothing pending", kind);
                Err(ArbiterError::NotPending(kind))
            }
        }
    }

    /// Re-run the decision for a deferred kind, `None` if the timer is stale.
    pub(crate) fn timer_fired(&mut self, kind: OpKind) -> Option<Decision> {
        if self.phase(kind) != Some(Phase::Deferred) {
            trace!("stale {} timer", kind);
            return None;
        }
        Some(self.evaluate(kind))
    }

    /// The started operation is over, the kind goes back to idle.
    pub(crate) fn complete(&mut self, kind: OpKind) -> Result<(), ArbiterError> {
        if self.phase(kind) != Some(Phase::InProgress) {
            return Err(ArbiterError::NotInProgress(kind));
        }
        self.ops.remove(&kind);
        debug!("{} completed", kind);
        Ok(())
    }

    /// Drop a registration that never started, `false` if there was none.
    pub(crate) fn cancel(&mut self, kind: OpKind) -> Result<bool, ArbiterError> {
        match self.phase(kind) {
            None => Ok(false),
            Some(Phase::InProgress) => Err(ArbiterError::NotPending(kind)),
            Some(_) => {
                self.ops.remove(&kind);
                info!("{} request cancelled", kind);
                Ok(true)
            }
        }
    }

    pub(crate) fn block(&mut self) -> BlockToken {
        let token = BlockToken(self.next_token);
        self.next_token += 1;
        self.blocks.insert(token);
        debug!("block token {} issued, {} held", token.0, self.blocks.len());
        token
    }

    pub(crate) fn unblock(&mut self, token: BlockToken) -> Result<(), ArbiterError> {
        if !self.blocks.remove(&token) {
            error!("release of unknown block token {}", token.0);
            return Err(ArbiterError::InvalidToken(token.0));
        }
        debug!("block token {} released, {} held", token.0, self.blocks.len());
        Ok(())
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Attach the control authority; everything waiting is forwarded to it.
    pub(crate) fn attach_authority(&mut self, authority: AuthorityHandler) -> Vec<OpKind> {
        info!("control authority attached");
        self.authority = Some(authority);
        let waiting = self.kinds_in(Phase::Deferred);
        for kind in &waiting {
            self.evaluate(*kind);
        }
        waiting
    }

    /// Detach the control authority.
    ///
    /// Operations it never answered go back to deferred re-evaluation; the
    /// kinds returned need a timer.
    pub(crate) fn detach_authority(&mut self) -> Vec<OpKind> {
        if self.authority.take().is_none() {
            return vec![];
        }
        info!("control authority detached");
        let orphaned = self.kinds_in(Phase::Pending);
        for kind in &orphaned {
            if let Some(reg) = self.ops.get_mut(kind) {
                reg.phase = Phase::Deferred;
            }
        }
        orphaned
    }

    pub(crate) fn set_authority_expected(&mut self, expected: bool) {
        self.authority_expected = expected;
    }

    pub(crate) fn blocked_defer(&self) -> Duration {
        self.blocked_defer
    }

    fn kinds_in(&self, phase: Phase) -> Vec<OpKind> {
        let mut kinds: Vec<OpKind> = self
            .ops
            .iter()
            .filter(|(_, reg)| reg.phase == phase)
            .map(|(kind, _)| *kind)
            .collect();
        kinds.sort();
        kinds
    }

    pub(crate) fn status(&self) -> ArbiterStatus {
        let mut ops: Vec<OpStatus> = self
            .ops
            .iter()
            .map(|(kind, reg)| OpStatus {
                kind: *kind,
                phase: reg.phase,
                evaluations: reg.evaluations,
            })
            .collect();
        ops.sort_by_key(|op| op.kind);
        ArbiterStatus {
            authority_attached: self.authority.is_some(),
            authority_expected: self.authority_expected,
            block_count: self.blocks.len(),
            ops,
            timers: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const SHORT: Duration = Duration::from_secs(180);

    fn counting() -> (Arc<Mutex<Vec<OpContext>>>, impl Fn() -> ConsentHandler) {
        let calls = Arc::new(Mutex::new(vec![]));
        let for_handler = calls.clone();
        let make = move || -> ConsentHandler {
            let calls = for_handler.clone();
            Box::new(move |ctx| calls.lock().unwrap().push(ctx))
        };
        (calls, make)
    }

    fn install() -> OpContext {
        OpContext::Install {
            update_type: UpdateType::Firmware,
            instance_id: None,
        }
    }

    #[test]
    fn no_authority_proceeds_immediately() {
        let mut ops = PendingOps::new(SHORT, false);
        let (calls, handler) = counting();
        let ctx = OpContext::Download {
            update_type: UpdateType::Firmware,
            size: 4096,
        };
        assert_eq!(ops.query(ctx.clone(), handler()).unwrap(), Decision::Proceed);
        assert_eq!(*calls.lock().unwrap(), vec![ctx]);
        assert_eq!(ops.status().phase(OpKind::Download), Some(Phase::InProgress));

        ops.complete(OpKind::Download).unwrap();
        assert_eq!(ops.status().phase(OpKind::Download), None);
    }

    #[test]
    fn duplicate_query_keeps_first_handler() {
        let mut ops = PendingOps::new(SHORT, false);
        let forwarded = Arc::new(Mutex::new(0));
        {
            let forwarded = forwarded.clone();
            ops.attach_authority(Box::new(move |_: &OpContext| *forwarded.lock().unwrap() += 1));
        }
        let (first, make_first) = counting();
        let (second, make_second) = counting();

        assert_eq!(ops.query(install(), make_first()).unwrap(), Decision::Forwarded);
        assert_eq!(
            ops.query(install(), make_second()).unwrap_err(),
            ArbiterError::AlreadyRegistered(OpKind::Install)
        );
        assert_eq!(*forwarded.lock().unwrap(), 1);

        ops.accept(OpKind::Install).unwrap();
        assert_eq!(first.lock().unwrap().len(), 1);
        assert!(second.lock().unwrap().is_empty());
    }

    #[test]
    fn accept_requires_pending() {
        let mut ops = PendingOps::new(SHORT, false);
        assert_eq!(
            ops.accept(OpKind::Reboot).unwrap_err(),
            ArbiterError::NotPending(OpKind::Reboot)
        );

        let (calls, handler) = counting();
        ops.query(OpContext::Reboot, handler()).unwrap();
        // Already started without authority.
        assert!(ops.accept(OpKind::Reboot).is_err());
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn expected_authority_defers() {
        let mut ops = PendingOps::new(SHORT, true);
        let (calls, handler) = counting();
        assert_eq!(
            ops.query(install(), handler()).unwrap(),
            Decision::Deferred(SHORT)
        );
        assert_eq!(ops.timer_fired(OpKind::Install), Some(Decision::Deferred(SHORT)));
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(ops.status().ops[0].evaluations, 2);

        // Gone for good.
        ops.set_authority_expected(false);
        assert_eq!(ops.timer_fired(OpKind::Install), Some(Decision::Proceed));
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(ops.timer_fired(OpKind::Install), None);
    }

    #[test]
    fn blocks_defer_until_released() {
        let mut ops = PendingOps::new(SHORT, false);
        let first = ops.block();
        let second = ops.block();
        let (calls, handler) = counting();

        assert_eq!(
            ops.query(install(), handler()).unwrap(),
            Decision::Deferred(SHORT)
        );
        ops.unblock(first).unwrap();
        assert_eq!(ops.timer_fired(OpKind::Install), Some(Decision::Deferred(SHORT)));
        ops.unblock(second).unwrap();
        assert_eq!(ops.timer_fired(OpKind::Install), Some(Decision::Proceed));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn unknown_token_is_rejected() {
        let mut ops = PendingOps::new(SHORT, false);
        let token = ops.block();
        ops.unblock(token).unwrap();
        assert_eq!(
            ops.unblock(token).unwrap_err(),
            ArbiterError::InvalidToken(token.id())
        );
        assert_eq!(ops.block_count(), 0);
    }

    #[test]
    fn explicit_defer_then_forward_again() {
        let mut ops = PendingOps::new(SHORT, false);
        let forwarded = Arc::new(Mutex::new(vec![]));
        {
            let forwarded = forwarded.clone();
            ops.attach_authority(Box::new(move |ctx: &OpContext| forwarded.lock().unwrap().push(ctx.kind())));
        }
        let (_, handler) = counting();
        ops.query(OpContext::Uninstall { instance_id: 3 }, handler())
            .unwrap();

        let delay = Duration::from_secs(10 * 60);
        assert_eq!(ops.defer(OpKind::Uninstall, delay).unwrap(), delay);
        assert!(ops.defer(OpKind::Uninstall, delay).is_err());
        assert!(ops.accept(OpKind::Uninstall).is_err());

        assert_eq!(ops.timer_fired(OpKind::Uninstall), Some(Decision::Forwarded));
        assert_eq!(
            *forwarded.lock().unwrap(),
            vec![OpKind::Uninstall, OpKind::Uninstall]
        );
    }

    #[test]
    fn detached_authority_falls_back_to_deferral() {
        let mut ops = PendingOps::new(SHORT, false);
        ops.attach_authority(Box::new(|_: &OpContext| {}));
        let (calls, handler) = counting();
        ops.query(install(), handler()).unwrap();

        assert_eq!(ops.detach_authority(), vec![OpKind::Install]);
        assert_eq!(ops.status().phase(OpKind::Install), Some(Phase::Deferred));
        assert_eq!(ops.timer_fired(OpKind::Install), Some(Decision::Proceed));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn attaching_forwards_deferred_operations() {
        let mut ops = PendingOps::new(SHORT, true);
        let (_, handler) = counting();
        ops.query(install(), handler()).unwrap();

        let forwarded = Arc::new(Mutex::new(0));
        let counter = forwarded.clone();
        let kinds = ops.attach_authority(Box::new(move |_: &OpContext| *counter.lock().unwrap() += 1));
        assert_eq!(kinds, vec![OpKind::Install]);
        assert_eq!(*forwarded.lock().unwrap(), 1);
        assert_eq!(ops.status().phase(OpKind::Install), Some(Phase::Pending));
    }

    #[test]
    fn cancel_only_drops_unstarted_operations() {
        let mut ops = PendingOps::new(SHORT, true);
        let (_, handler) = counting();
        assert_eq!(ops.cancel(OpKind::Download).unwrap(), false);
        ops.query(install(), handler()).unwrap();
        assert_eq!(ops.cancel(OpKind::Install).unwrap(), true);

        ops.set_authority_expected(false);
        let (_, handler) = counting();
        ops.query(OpContext::Reboot, handler()).unwrap();
        assert!(ops.cancel(OpKind::Reboot).is_err());
        assert!(ops.complete(OpKind::Install).is_err());
    }
}
