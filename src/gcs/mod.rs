/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! GCS: the sequencing and flow-control layer. Consumes the totally-ordered delivery
//! stream of [EVS](crate::evs) plus the decided views of [PC](crate::pc), and produces a
//! monotonic stream of [`GcsAction`]s with assigned global seqnos.
//!
//! ## Seqno assignment
//!
//! Delivery is totally ordered, so every member assigns the *same* next global seqno to
//! the *same* payload by incrementing a local counter. Write-sets and primary
//! configuration changes consume seqnos; control actions and flow-control traffic do
//! not. Members entering the group align their counter using the group seqno carried by
//! the configuration change.
//!
//! Between an EVS view installation and the PC decision for it, replicated actions are
//! buffered: the configuration change must occupy the same position in every member's
//! action stream, and the EVS view barrier pins that position to "immediately after the
//! last old-view delivery".
//!
//! ## Flow control
//!
//! A member whose apply backlog crosses the upper watermark multicasts a pause; once
//! drained below the lower watermark it multicasts a resume. Senders block origination
//! while any member is paused. Both travel on the same totally-ordered channel as
//! everything else. Desynced members (donors) opt out.

pub mod fifo;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::evs::Delivery;
use crate::pc::DecidedView;
use crate::types::basic::{LocalSeqno, MemberId, Seqno, StateId};
use crate::types::view::View;
use crate::types::writeset::WriteSet;

/// EVS user-type tag for replicated actions.
pub const USER_TYPE_ACTION: u8 = 0;
/// EVS user-type tag for flow-control traffic.
pub const USER_TYPE_FC: u8 = 1;

/// The wire form of a replicated action, carried in EVS user payloads.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum ActionFrame {
    WriteSet(WriteSet),
    /// The sender's lowest locally-committed seqno, for certification purging.
    CommitCut { committed: Seqno },
    /// A joiner requests state transfer.
    StateReq {
        donor_hint: Option<MemberId>,
        state_id: StateId,
        /// The joiner's current position: transfer is needed above this.
        have_seqno: Seqno,
    },
    /// The sender has completed state transfer and holds a consistent state.
    Join { dataless: bool },
    /// The sender has drained its catch-up queue and is fully synced.
    Sync,
    /// Graceful leave announcement at the action level.
    Leave,
    /// Inconsistency vote (kept minimal: seqno and a result code).
    Vote { seqno: Seqno, code: i64 },
    /// Causal-read token; meaningful only at the member that sent it.
    Causal { token: u64 },
}

/// Flow-control state broadcast.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct FcFrame {
    /// True: the sender asks the cluster to stop originating write-sets.
    pub pause: bool,
    /// The sender's apply backlog at send time, for observability.
    pub backlog: u64,
}

/// Node state within the group, as defined by the GCS state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    Closed,
    Open,
    Connected,
    Joiner,
    Joined,
    /// Serving a state transfer; still replicating, exempt from flow control.
    Donor,
    Synced,
}

/// An ordered action handed up to the certification layer.
#[derive(Clone, Debug)]
pub struct GcsAction {
    pub source: MemberId,
    pub local_seqno: LocalSeqno,
    /// Global seqno; `Seqno::NONE` for actions that do not consume one.
    pub seqno: Seqno,
    pub kind: GcsActionKind,
}

#[derive(Clone, Debug)]
pub enum GcsActionKind {
    WriteSet(WriteSet),
    ConfChange(ConfChange),
    CommitCut(Seqno),
    StateReq {
        donor_hint: Option<MemberId>,
        state_id: StateId,
        have_seqno: Seqno,
    },
    Join { dataless: bool },
    Sync,
    Leave,
    Vote { seqno: Seqno, code: i64 },
    Causal { token: u64 },
}

/// A configuration change: the decided view plus per-member replication state.
#[derive(Clone, Debug)]
pub struct ConfChange {
    pub view: View,
    pub members: Vec<MemberInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    pub member: MemberId,
    pub synced: bool,
    pub dataless: bool,
}

/// Why an origination attempt was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcsError {
    Closed,
    NotConnected,
    NotPrimary,
}

struct SharedInner {
    node_state: NodeState,
    primary: bool,
    desynced: bool,
    closed: bool,
    /// Members currently asking the cluster to pause origination.
    pausers: HashSet<MemberId>,
}

/// State shared between the group thread and caller threads: the node state machine,
/// the primary flag, and the flow-control gate.
pub struct GcsShared {
    inner: Mutex<SharedInner>,
    changed: Condvar,
}

impl GcsShared {
    pub fn new() -> Arc<GcsShared> {
        Arc::new(GcsShared {
            inner: Mutex::new(SharedInner {
                node_state: NodeState::Closed,
                primary: false,
                desynced: false,
                closed: false,
                pausers: HashSet::new(),
            }),
            changed: Condvar::new(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SharedInner> {
        self.inner.lock().expect("gcs shared lock poisoned")
    }

    pub fn node_state(&self) -> NodeState {
        self.lock().node_state
    }

    pub fn set_node_state(&self, state: NodeState) {
        let mut inner = self.lock();
        if inner.node_state != state {
            log::info!("gcs: node state {:?} -> {:?}", inner.node_state, state);
            inner.node_state = state;
            self.changed.notify_all();
        }
    }

    pub fn is_primary(&self) -> bool {
        self.lock().primary
    }

    pub fn set_primary(&self, primary: bool) {
        let mut inner = self.lock();
        inner.primary = primary;
        self.changed.notify_all();
    }

    pub fn set_desynced(&self, desynced: bool) {
        let mut inner = self.lock();
        inner.desynced = desynced;
        self.changed.notify_all();
    }

    pub fn is_desynced(&self) -> bool {
        self.lock().desynced
    }

    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.node_state = NodeState::Closed;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn fc_update(&self, member: MemberId, pause: bool) {
        let mut inner = self.lock();
        let changed = if pause {
            inner.pausers.insert(member)
        } else {
            inner.pausers.remove(&member)
        };
        if changed {
            log::debug!(
                "gcs: flow control {} by {} ({} pausing)",
                if pause { "pause" } else { "resume" },
                member,
                inner.pausers.len()
            );
            self.changed.notify_all();
        }
    }

    /// Drop pause requests from members that left the view.
    fn fc_retain(&self, members: &[MemberId]) {
        let mut inner = self.lock();
        let before = inner.pausers.len();
        inner.pausers.retain(|member| members.contains(member));
        if inner.pausers.len() != before {
            self.changed.notify_all();
        }
    }

    /// Gate for originating a write-set. Returns immediately with an error when the
    /// node cannot replicate at all; blocks (flow control is backpressure, never an
    /// error) while a member asks for a pause.
    pub fn wait_send_permission(&self) -> Result<(), GcsError> {
        let mut inner = self.lock();
        loop {
            if inner.closed {
                return Err(GcsError::Closed);
            }
            if !inner.primary {
                return Err(GcsError::NotPrimary);
            }
            match inner.node_state {
                NodeState::Synced | NodeState::Donor => (),
                _ => return Err(GcsError::NotConnected),
            }
            if inner.desynced || inner.pausers.is_empty() {
                return Ok(());
            }
            inner = self.changed.wait(inner).expect("gcs shared lock poisoned");
        }
    }
}

/// The sequencing core. Owned and driven by the group thread.
pub struct GcsCore {
    me: MemberId,
    shared: Arc<GcsShared>,
    /// The last assigned global seqno.
    global_seqno: Seqno,
    local_seqno: LocalSeqno,
    view: Option<View>,
    /// True between an EVS view installation and the PC decision for it; replicated
    /// actions are buffered meanwhile.
    pc_round_active: bool,
    buffered: VecDeque<Delivery>,
}

impl GcsCore {
    pub fn new(me: MemberId, shared: Arc<GcsShared>) -> GcsCore {
        GcsCore {
            me,
            shared,
            global_seqno: Seqno::NONE,
            local_seqno: LocalSeqno::init(),
            view: None,
            pc_round_active: false,
            buffered: VecDeque::new(),
        }
    }

    pub fn last_seqno(&self) -> Seqno {
        self.global_seqno
    }

    pub fn current_view(&self) -> Option<&View> {
        self.view.as_ref()
    }

    /// An EVS view has been installed; hold replicated actions until PC decides.
    pub fn begin_view_change(&mut self) {
        self.pc_round_active = true;
    }

    /// Process one EVS delivery into zero or more actions.
    pub fn handle_delivery(&mut self, delivery: Delivery) -> Vec<GcsAction> {
        match delivery.user_type {
            USER_TYPE_FC => {
                match borsh::from_slice::<FcFrame>(&delivery.payload) {
                    Ok(frame) => self.shared.fc_update(delivery.source, frame.pause),
                    Err(err) => log::warn!("gcs: undecodable flow-control frame: {}", err),
                }
                Vec::new()
            }
            USER_TYPE_ACTION => {
                if self.pc_round_active {
                    self.buffered.push_back(delivery);
                    return Vec::new();
                }
                self.process(delivery).into_iter().collect()
            }
            other => {
                log::warn!("gcs: unknown user type {} from {}", other, delivery.source);
                Vec::new()
            }
        }
    }

    /// PC has decided the view: emit the configuration change, then release buffered
    /// deliveries. The conf change occupies the same stream position at every member.
    pub fn handle_decided_view(&mut self, decided: DecidedView) -> Vec<GcsAction> {
        self.pc_round_active = false;
        let view = decided.view.clone();

        let seqno = if view.is_primary() {
            // Align with the group (a no-op for members that were already in), then
            // let the configuration change consume the next seqno.
            if decided.group_seqno > self.global_seqno {
                self.global_seqno = decided.group_seqno;
            }
            self.global_seqno = self.global_seqno.next();
            self.global_seqno
        } else {
            Seqno::NONE
        };

        self.shared.set_primary(view.is_primary());
        self.shared.fc_retain(&view.members);
        if self.shared.node_state() == NodeState::Open && !view.is_empty() {
            self.shared.set_node_state(NodeState::Connected);
        }

        let members = decided
            .members
            .iter()
            .map(|info| MemberInfo {
                member: info.member,
                synced: info.synced,
                dataless: info.dataless,
            })
            .collect();

        self.view = Some(view.clone());
        let mut actions = vec![GcsAction {
            source: self.me,
            local_seqno: self.local_seqno.increment(),
            seqno,
            kind: GcsActionKind::ConfChange(ConfChange { view, members }),
        }];

        let buffered: Vec<Delivery> = self.buffered.drain(..).collect();
        for delivery in buffered {
            if let Some(action) = self.process(delivery) {
                actions.push(action);
            }
        }
        actions
    }

    fn process(&mut self, delivery: Delivery) -> Option<GcsAction> {
        let frame: ActionFrame = match borsh::from_slice(&delivery.payload) {
            Ok(frame) => frame,
            Err(err) => {
                log::error!(
                    "gcs: undecodable action from {} at evs seq {}: {}",
                    delivery.source,
                    delivery.seq,
                    err
                );
                return None;
            }
        };

        let primary = self
            .view
            .as_ref()
            .map(|view| view.is_primary())
            .unwrap_or(false);
        if !primary {
            // A non-primary component delivers membership, never application traffic.
            log::debug!(
                "gcs: dropping {:?} from {}: not in a primary component",
                std::mem::discriminant(&frame),
                delivery.source
            );
            return None;
        }

        let local_seqno = self.local_seqno.increment();
        let kind = match frame {
            ActionFrame::WriteSet(ws) => {
                if delivery.transitional {
                    // Never acknowledged by the full view: no member may certify or
                    // commit it. Every survivor drops the same flush set, so streams
                    // stay aligned; the originator is aborted at the view boundary
                    // and retries.
                    log::info!(
                        "gcs: dropping transitional write-set from {} (trx {})",
                        delivery.source,
                        ws.trx_id
                    );
                    return None;
                }
                self.global_seqno = self.global_seqno.next();
                let action = GcsAction {
                    source: delivery.source,
                    local_seqno,
                    seqno: self.global_seqno,
                    kind: GcsActionKind::WriteSet(ws),
                };
                return Some(action);
            }
            ActionFrame::CommitCut { committed } => GcsActionKind::CommitCut(committed),
            ActionFrame::StateReq {
                donor_hint,
                state_id,
                have_seqno,
            } => GcsActionKind::StateReq {
                donor_hint,
                state_id,
                have_seqno,
            },
            ActionFrame::Join { dataless } => GcsActionKind::Join { dataless },
            ActionFrame::Sync => GcsActionKind::Sync,
            ActionFrame::Leave => GcsActionKind::Leave,
            ActionFrame::Vote { seqno, code } => GcsActionKind::Vote { seqno, code },
            ActionFrame::Causal { token } => GcsActionKind::Causal { token },
        };

        Some(GcsAction {
            source: delivery.source,
            local_seqno,
            seqno: Seqno::NONE,
            kind,
        })
    }
}
