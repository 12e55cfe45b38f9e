//! Message staleness filter.
//!
//! Pure classification of an inbound message against the failover unit it
//! targets. The generation check happens when a message is queued (see
//! [`crate::generation`]); the rules here run when the job item executes,
//! against the state the handler will see:
//!
//! 1. message epoch below the unit's CC: drop
//! 2. message replica instance below the local instance: stale reply or drop
//! 3. local replica closing or in create and the message starts a
//!    conflicting transition: drop
//! 4. local replica down and the message expects it up: drop
//!
//! Comparisons are lexicographic: epoch first, then replica instance.

use failover_types::{Epoch, ReplicaInstance};

use crate::error::ErrorCode;

/// The kind of transition a message would start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    Open,
    Close,
    Reconfigure,
    Query,
}

/// What the filter needs to know about a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContext {
    pub kind: TransitionKind,
    pub epoch: Option<Epoch>,
    pub instance: Option<ReplicaInstance>,
    pub expects_up: bool,
    /// The message has a reply that can carry `StaleRequest`.
    pub has_reply: bool,
}

impl MessageContext {
    pub fn new(kind: TransitionKind) -> Self {
        Self {
            kind,
            epoch: None,
            instance: None,
            expects_up: false,
            has_reply: false,
        }
    }

    pub fn with_epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = Some(epoch);
        self
    }

    pub fn with_instance(mut self, instance: ReplicaInstance) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn expecting_up(mut self) -> Self {
        self.expects_up = true;
        self
    }

    pub fn with_reply(mut self) -> Self {
        self.has_reply = true;
        self
    }
}

/// What the filter needs to know about the failover unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverUnitView {
    pub cc: Epoch,
    pub local_instance: ReplicaInstance,
    pub is_closing: bool,
    pub is_in_create: bool,
    pub is_local_up: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Accept,
    /// Reply with the code, do not mutate.
    ReadOnly(ErrorCode),
    Drop,
}

/// Classifies a message. An absent unit accepts everything; the handler
/// decides whether the message creates one.
pub fn classify(ft: Option<&FailoverUnitView>, msg: &MessageContext) -> Staleness {
    let Some(ft) = ft else {
        return Staleness::Accept;
    };

    if let Some(epoch) = msg.epoch {
        if epoch < ft.cc {
            return Staleness::Drop;
        }
    }

    if let Some(instance) = msg.instance {
        if instance < ft.local_instance {
            return if msg.has_reply {
                Staleness::ReadOnly(ErrorCode::StaleRequest)
            } else {
                Staleness::Drop
            };
        }
    }

    let conflicts = match msg.kind {
        TransitionKind::Open => ft.is_closing,
        TransitionKind::Reconfigure => ft.is_closing || ft.is_in_create,
        TransitionKind::Close | TransitionKind::Query => false,
    };
    if conflicts {
        return Staleness::Drop;
    }

    if msg.expects_up && !ft.is_local_up {
        return Staleness::Drop;
    }

    Staleness::Accept
}
