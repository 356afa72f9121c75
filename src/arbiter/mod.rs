//! Pending-operation arbiter.
//!
//! Decides whether a download, install, uninstall or reboot may start now,
//! has to wait for a control authority, or is deferred.

mod actor;
mod pending;

pub(crate) use actor::{
    Accept, ArbiterActor, ArbiterSettings, AttachAuthority, BlockInstall, Cancel, Complete, Defer,
    DetachAuthority, GetStatus, Query, SetAuthorityExpected, UnblockInstall,
};
pub(crate) use pending::{
    ArbiterError, ArbiterStatus, BlockToken, Decision, OpContext, OpKind, Phase,
};
