/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications emitted when significant things happen in the local replicator.
//!
//! Each variant of the [event enum](Event) contains an inner struct with a timestamp
//! and a summary of the occurrence. Library users register handler closures through
//! the replicator builder; the [event bus](crate::event_bus) thread runs them, plus the
//! default CSV logging handlers of [`crate::logging`] when logging is enabled.
//!
//! Events are emitted **after** the occurrence completes: a [`CertifyEvent`] fires only
//! once the write-set is cached and the certification verdict is final.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::basic::{MemberId, Seqno, TrxId};
use crate::types::view::View;

pub enum Event {
    ViewDelivered(ViewDeliveredEvent),
    Certify(CertifyEvent),
    CertifyFailed(CertifyFailedEvent),
    CommitCut(CommitCutEvent),
    StateTransferBegin(StateTransferBeginEvent),
    StateTransferEnd(StateTransferEndEvent),
    FlowControl(FlowControlEvent),
}

impl Event {
    /// Publish this event on the event publisher channel, if one is defined.
    pub fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// A configuration change was delivered and processed.
pub struct ViewDeliveredEvent {
    pub timestamp: SystemTime,
    pub view: View,
}

/// A write-set passed certification at its seqno.
pub struct CertifyEvent {
    pub timestamp: SystemTime,
    pub seqno: Seqno,
    pub source: MemberId,
    pub trx_id: TrxId,
    pub local: bool,
}

/// A write-set was rejected by certification.
pub struct CertifyFailedEvent {
    pub timestamp: SystemTime,
    pub seqno: Seqno,
    pub source: MemberId,
    pub trx_id: TrxId,
    pub local: bool,
}

/// The cluster-wide commit horizon advanced.
pub struct CommitCutEvent {
    pub timestamp: SystemTime,
    pub last_committed: Seqno,
}

/// A member requested state transfer; the donor has been chosen.
pub struct StateTransferBeginEvent {
    pub timestamp: SystemTime,
    pub joiner: MemberId,
    pub donor: Option<MemberId>,
    pub full_snapshot: bool,
}

/// A member finished state transfer and rejoined the synced set.
pub struct StateTransferEndEvent {
    pub timestamp: SystemTime,
    pub member: MemberId,
}

/// The local member paused or resumed cluster-wide origination.
pub struct FlowControlEvent {
    pub timestamp: SystemTime,
    pub pause: bool,
    pub backlog: usize,
}
