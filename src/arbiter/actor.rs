//! Arbiter actor, owning the per-kind defer timers.

use super::pending::{
    ArbiterError, ArbiterStatus, AuthorityHandler, BlockToken, ConsentHandler, Decision, OpContext,
    OpKind, PendingOps,
};
use crate::state::UpdateType;
use actix::prelude::*;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone, Debug)]
pub(crate) struct ArbiterSettings {
    /// Re-evaluation delay while blocked or waiting for the authority.
    pub(crate) blocked_defer: Duration,
    /// A control application is installed and will attach eventually.
    pub(crate) authority_expected: bool,
}

impl Default for ArbiterSettings {
    fn default() -> Self {
        Self {
            blocked_defer: Duration::from_secs(180),
            authority_expected: false,
        }
    }
}

/// Single-threaded home of all arbitration state.
pub(crate) struct ArbiterActor {
    ops: PendingOps,
    timers: HashMap<OpKind, SpawnHandle>,
}

impl ArbiterActor {
    pub(crate) fn new(settings: ArbiterSettings) -> Self {
        Self {
            ops: PendingOps::new(settings.blocked_defer, settings.authority_expected),
            timers: HashMap::new(),
        }
    }

    fn arm(&mut self, ctx: &mut Context<Self>, kind: OpKind, after: Duration) {
        self.disarm(ctx, kind);
        trace!("{} timer armed for {:?}", kind, after);
        let handle = ctx.run_later(after, move |actor, ctx| {
            actor.timers.remove(&kind);
            if let Some(decision) = actor.ops.timer_fired(kind) {
                actor.apply(ctx, kind, decision);
            }
        });
        self.timers.insert(kind, handle);
    }

    fn disarm(&mut self, ctx: &mut Context<Self>, kind: OpKind) {
        if let Some(handle) = self.timers.remove(&kind) {
            ctx.cancel_future(handle);
        }
    }

    fn apply(&mut self, ctx: &mut Context<Self>, kind: OpKind, decision: Decision) {
        match decision {
            Decision::Deferred(after) => self.arm(ctx, kind, after),
            Decision::Proceed | Decision::Forwarded => self.disarm(ctx, kind),
        }
    }
}

impl Actor for ArbiterActor {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        trace!("arbiter started");
    }
}

impl actix::Supervised for ArbiterActor {}

/// Ask for consent to run an operation.
pub(crate) struct Query {
    context: OpContext,
    handler: ConsentHandler,
}

impl Query {
    pub(crate) fn new<F>(context: OpContext, handler: F) -> Self
    where
        F: FnOnce(OpContext) + Send + 'static,
    {
        Self {
            context,
            handler: Box::new(handler),
        }
    }

    pub(crate) fn kind(&self) -> OpKind {
        self.context.kind()
    }

    pub(crate) fn download<F>(update_type: UpdateType, size: u64, handler: F) -> Self
    where
        F: FnOnce(OpContext) + Send + 'static,
    {
        Self::new(OpContext::Download { update_type, size }, handler)
    }

    pub(crate) fn install<F>(update_type: UpdateType, instance_id: Option<u16>, handler: F) -> Self
    where
        F: FnOnce(OpContext) + Send + 'static,
    {
        Self::new(
            OpContext::Install {
                update_type,
                instance_id,
            },
            handler,
        )
    }

    pub(crate) fn uninstall<F>(instance_id: u16, handler: F) -> Self
    where
        F: FnOnce(OpContext) + Send + 'static,
    {
        Self::new(OpContext::Uninstall { instance_id }, handler)
    }

    pub(crate) fn reboot<F>(handler: F) -> Self
    where
        F: FnOnce(OpContext) + Send + 'static,
    {
        Self::new(OpContext::Reboot, handler)
    }
}

impl Message for Query {
    type Result = Result<Decision, ArbiterError>;
}

impl Handler<Query> for ArbiterActor {
    type Result = Result<Decision, ArbiterError>;

    fn handle(&mut self, msg: Query, ctx: &mut Self::Context) -> Self::Result {
        let kind = msg.context.kind();
        let decision = self.ops.query(msg.context, msg.handler)?;
        self.apply(ctx, kind, decision);
        Ok(decision)
    }
}

/// Consent from the control authority.
pub(crate) struct Accept(pub(crate) OpKind);

impl Message for Accept {
    type Result = Result<(), ArbiterError>;
}

impl Handler<Accept> for ArbiterActor {
    type Result = Result<(), ArbiterError>;

    fn handle(&mut self, msg: Accept, ctx: &mut Self::Context) -> Self::Result {
        self.ops.accept(msg.0)?;
        self.disarm(ctx, msg.0);
        Ok(())
    }
}

/// Postpone a pending operation.
pub(crate) struct Defer {
    pub(crate) kind: OpKind,
    pub(crate) delay: Duration,
}

impl Defer {
    pub(crate) fn minutes(kind: OpKind, minutes: u32) -> Self {
        Self {
            kind,
            delay: Duration::from_secs(u64::from(minutes) * 60),
        }
    }
}

impl Message for Defer {
    type Result = Result<(), ArbiterError>;
}

impl Handler<Defer> for ArbiterActor {
    type Result = Result<(), ArbiterError>;

    fn handle(&mut self, msg: Defer, ctx: &mut Self::Context) -> Self::Result {
        let delay = self.ops.defer(msg.kind, msg.delay)?;
        self.arm(ctx, msg.kind, delay);
        Ok(())
    }
}

/// The started operation finished, successfully or not.
pub(crate) struct Complete(pub(crate) OpKind);

impl Message for Complete {
    type Result = Result<(), ArbiterError>;
}

impl Handler<Complete> for ArbiterActor {
    type Result = Result<(), ArbiterError>;

    fn handle(&mut self, msg: Complete, _ctx: &mut Self::Context) -> Self::Result {
        self.ops.complete(msg.0)
    }
}

/// Withdraw a request which has not started yet.
pub(crate) struct Cancel(pub(crate) OpKind);

impl Message for Cancel {
    type Result = Result<bool, ArbiterError>;
}

impl Handler<Cancel> for ArbiterActor {
    type Result = Result<bool, ArbiterError>;

    fn handle(&mut self, msg: Cancel, ctx: &mut Self::Context) -> Self::Result {
        let cancelled = self.ops.cancel(msg.0)?;
        self.disarm(ctx, msg.0);
        Ok(cancelled)
    }
}

pub(crate) struct AttachAuthority(pub(crate) AuthorityHandler);

impl Message for AttachAuthority {
    type Result = ();
}

impl Handler<AttachAuthority> for ArbiterActor {
    type Result = ();

    fn handle(&mut self, msg: AttachAuthority, ctx: &mut Self::Context) -> Self::Result {
        for kind in self.ops.attach_authority(msg.0) {
            self.disarm(ctx, kind);
        }
    }
}

pub(crate) struct DetachAuthority;

impl Message for DetachAuthority {
    type Result = ();
}

impl Handler<DetachAuthority> for ArbiterActor {
    type Result = ();

    fn handle(&mut self, _msg: DetachAuthority, ctx: &mut Self::Context) -> Self::Result {
        let after = self.ops.blocked_defer();
        for kind in self.ops.detach_authority() {
            self.arm(ctx, kind, after);
        }
    }
}

pub(crate) struct SetAuthorityExpected(pub(crate) bool);

impl Message for SetAuthorityExpected {
    type Result = ();
}

impl Handler<SetAuthorityExpected> for ArbiterActor {
    type Result = ();

    fn handle(&mut self, msg: SetAuthorityExpected, _ctx: &mut Self::Context) -> Self::Result {
        self.ops.set_authority_expected(msg.0);
    }
}

/// Hold back automatic decisions until the token is released.
pub(crate) struct BlockInstall;

impl Message for BlockInstall {
    type Result = BlockToken;
}

impl Handler<BlockInstall> for ArbiterActor {
    type Result = MessageResult<BlockInstall>;

    fn handle(&mut self, _msg: BlockInstall, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.ops.block())
    }
}

pub(crate) struct UnblockInstall(pub(crate) BlockToken);

impl Message for UnblockInstall {
    type Result = Result<(), ArbiterError>;
}

impl Handler<UnblockInstall> for ArbiterActor {
    type Result = Result<(), ArbiterError>;

    fn handle(&mut self, msg: UnblockInstall, _ctx: &mut Self::Context) -> Self::Result {
        self.ops.unblock(msg.0)
    }
}

pub(crate) struct GetStatus;

impl Message for GetStatus {
    type Result = ArbiterStatus;
}

impl Handler<GetStatus> for ArbiterActor {
    type Result = MessageResult<GetStatus>;

    fn handle(&mut self, _msg: GetStatus, _ctx: &mut Self::Context) -> Self::Result {
        let mut status = self.ops.status();
        status.timers = self.timers.keys().cloned().collect();
        status.timers.sort();
        MessageResult(status)
    }
}
