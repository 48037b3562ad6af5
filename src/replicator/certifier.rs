/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The certifier thread: the single consumer of the ordered action stream.
//!
//! Everything that needs the total order happens here, in delivery order: caching
//! write-sets, certification, resolving local `replicate` calls, dispatching remote
//! apply work, tracking member replication states, driving the joiner/donor
//! choreography, advancing the commit cut, and flow control.
//!
//! A catching-up joiner buffers live write-sets aside until its incremental state
//! transfer has replayed the range it missed, so certification still observes every
//! seqno in ascending order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use threadpool::ThreadPool;

use crate::cache::index::BufferId;
use crate::cache::WriteSetCache;
use crate::cert::{CertResult, Certifier};
use crate::config::Configuration;
use crate::events::{
    CertifyEvent, CertifyFailedEvent, CommitCutEvent, Event, FlowControlEvent,
    StateTransferBeginEvent, StateTransferEndEvent, ViewDeliveredEvent,
};
use crate::gcs::fifo::ActionFifo;
use crate::gcs::{
    ActionFrame, ConfChange, FcFrame, GcsAction, GcsActionKind, GcsShared, NodeState,
    USER_TYPE_ACTION, USER_TYPE_FC,
};
use crate::network::{Network, WireMessage};
use crate::types::basic::{MemberId, Seqno, StateId};
use crate::types::writeset::{WriteSet, WsFlags};

use super::state_transfer::{
    pick_donor, IstRequest, IstResponse, MemberState,
};
use super::{CachedAction, CausalWaiters, CertOutcome, CommitMonitor, Outgoing, Waiters};

/// How long the certifier waits on the action FIFO before servicing IST responses and
/// periodic duties.
const TICK: Duration = Duration::from_millis(5);

/// How long an applier waits for its certification dependency before giving up (the
/// monitor closes well before this in any real shutdown).
const APPLY_WAIT: Duration = Duration::from_secs(3600);

/// Re-issue a stalled state request after this long (the original can be discarded in
/// view churn).
const STATE_TRANSFER_RETRY: Duration = Duration::from_secs(2);

/// Re-announce join/sync until our own sync action comes back through the total order.
const SYNC_RETRY: Duration = Duration::from_millis(500);

struct PendingWriteSet {
    seqno: Seqno,
    ws: WriteSet,
    buffer: BufferId,
}

pub(crate) struct CertifierThread<N: Network> {
    me: MemberId,
    config: Configuration,
    handler: Arc<dyn super::ReplicationHandler>,
    network: N,
    cache: Arc<WriteSetCache>,
    engine: Certifier,
    monitor: Arc<CommitMonitor>,
    shared: Arc<GcsShared>,
    recv: ActionFifo<GcsAction>,
    outgoing: ActionFifo<Outgoing>,
    ist_responses: Receiver<(MemberId, IstResponse)>,
    waiters: Waiters,
    causal_waiters: CausalWaiters,
    appliers: ThreadPool,
    members: BTreeMap<MemberId, MemberState>,
    commit_cuts: HashMap<MemberId, Seqno>,
    cluster_commit_cut: Seqno,
    applied_state_id: StateId,
    /// The last seqno observed in the ordered stream (write-sets and configuration
    /// changes alike).
    group_position: Seqno,
    /// Seqno of the latest configuration change.
    conf_seqno: Seqno,
    /// Serialisation floor for isolated (total-order) executions.
    last_iso: Seqno,
    catching_up: bool,
    awaiting_snapshot: bool,
    ist_done: bool,
    catchup_have: Seqno,
    pending_live: VecDeque<PendingWriteSet>,
    /// Joiners this member is currently the donor for.
    donor_of: std::collections::HashSet<MemberId>,
    fc_paused: bool,
    last_commit_cut_sent: Instant,
    /// Last time the catch-up machinery made observable progress; drives retries.
    last_catchup_progress: Instant,
    events: Option<std::sync::mpsc::Sender<Event>>,
    connect_waiter: Option<SyncSender<()>>,
}

impl<N: Network> CertifierThread<N> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        me: MemberId,
        config: Configuration,
        handler: Arc<dyn super::ReplicationHandler>,
        network: N,
        cache: Arc<WriteSetCache>,
        monitor: Arc<CommitMonitor>,
        shared: Arc<GcsShared>,
        recv: ActionFifo<GcsAction>,
        outgoing: ActionFifo<Outgoing>,
        ist_responses: Receiver<(MemberId, IstResponse)>,
        waiters: Waiters,
        causal_waiters: CausalWaiters,
        events: Option<std::sync::mpsc::Sender<Event>>,
        connect_waiter: SyncSender<()>,
    ) -> JoinHandle<()> {
        let appliers = ThreadPool::with_name(
            "tandem-applier".to_string(),
            config.replicator.applier_threads,
        );
        let engine = Certifier::new(config.cert.clone());
        let mut certifier = CertifierThread {
            me,
            config,
            handler,
            network,
            cache,
            engine,
            monitor,
            shared,
            recv,
            outgoing,
            ist_responses,
            waiters,
            causal_waiters,
            appliers,
            members: BTreeMap::new(),
            commit_cuts: HashMap::new(),
            cluster_commit_cut: Seqno::NONE,
            applied_state_id: StateId::UNDEFINED,
            group_position: Seqno::NONE,
            conf_seqno: Seqno::NONE,
            last_iso: Seqno::NONE,
            catching_up: false,
            awaiting_snapshot: false,
            ist_done: false,
            catchup_have: Seqno::NONE,
            pending_live: VecDeque::new(),
            donor_of: std::collections::HashSet::new(),
            fc_paused: false,
            last_commit_cut_sent: Instant::now(),
            last_catchup_progress: Instant::now(),
            events,
            connect_waiter: Some(connect_waiter),
        };
        thread::Builder::new()
            .name("tandem-certifier".to_string())
            .spawn(move || certifier.run())
            .expect("spawning the certifier thread")
    }

    fn run(&mut self) {
        loop {
            while let Ok((from, response)) = self.ist_responses.try_recv() {
                self.handle_ist_response(from, response);
            }

            match self.recv.pop_timeout(TICK) {
                Ok(Some(action)) => {
                    if self.handle_action(action).is_break() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(()) => (),
            }

            self.flow_control_tick();
            self.commit_cut_tick();
            self.catchup_retry_tick();
        }
        self.appliers.join();
        log::info!("certifier: stopped");
    }

    fn publish(&self, event: Event) {
        event.publish(&self.events);
    }

    fn handle_action(&mut self, action: GcsAction) -> std::ops::ControlFlow<()> {
        match action.kind {
            GcsActionKind::WriteSet(ws) => {
                self.handle_writeset(action.seqno, ws);
                std::ops::ControlFlow::Continue(())
            }
            GcsActionKind::ConfChange(conf) => self.handle_conf_change(action.seqno, conf),
            GcsActionKind::CommitCut(committed) => {
                self.handle_commit_cut(action.source, committed);
                std::ops::ControlFlow::Continue(())
            }
            GcsActionKind::StateReq {
                donor_hint,
                state_id,
                have_seqno,
            } => {
                self.handle_state_req(action.source, donor_hint, state_id, have_seqno);
                std::ops::ControlFlow::Continue(())
            }
            GcsActionKind::Join { dataless } => {
                self.handle_join(action.source, dataless);
                std::ops::ControlFlow::Continue(())
            }
            GcsActionKind::Sync => {
                self.handle_sync(action.source);
                std::ops::ControlFlow::Continue(())
            }
            GcsActionKind::Leave => {
                self.members.remove(&action.source);
                self.commit_cuts.remove(&action.source);
                std::ops::ControlFlow::Continue(())
            }
            GcsActionKind::Vote { seqno, code } => {
                log::warn!(
                    "certifier: inconsistency vote from {} at {}: code {}",
                    action.source,
                    seqno,
                    code
                );
                std::ops::ControlFlow::Continue(())
            }
            GcsActionKind::Causal { token } => {
                if action.source == self.me {
                    let waiter = self
                        .causal_waiters
                        .lock()
                        .expect("causal waiter table lock poisoned")
                        .remove(&token);
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(self.engine.position());
                    }
                }
                std::ops::ControlFlow::Continue(())
            }
        }
    }

    fn handle_writeset(&mut self, seqno: Seqno, ws: WriteSet) {
        let payload = borsh::to_vec(&CachedAction::WriteSet(ws.clone()))
            .expect("write-set serializes");
        let buffer = match self.cache.insert(&payload) {
            Ok(buffer) => buffer,
            Err(err) => {
                // Losing a delivered write-set means this node can no longer follow
                // the totally-ordered stream. Unrecoverable.
                log::error!("certifier: cannot cache write-set at {}: {}", seqno, err);
                panic!("write-set cache failure at seqno {}: {}", seqno, err);
            }
        };
        if let Err(err) = self.cache.seqno_assign(buffer, seqno) {
            log::error!("certifier: cannot index write-set at {}: {}", seqno, err);
            panic!("write-set cache failure at seqno {}: {}", seqno, err);
        }
        self.group_position = seqno;

        if self.catching_up {
            self.pending_live.push_back(PendingWriteSet { seqno, ws, buffer });
            return;
        }
        self.certify_and_dispatch(seqno, ws, buffer);
    }

    fn certify_and_dispatch(&mut self, seqno: Seqno, ws: WriteSet, buffer: BufferId) {
        let local = ws.source == self.me;
        match self.engine.certify(seqno, &ws) {
            CertResult::Certified { depends_seqno } => {
                let mut depends = depends_seqno.max(self.last_iso);
                if ws.flags.contains(WsFlags::ISOLATION) || ws.flags.contains(WsFlags::PA_UNSAFE) {
                    // Total-order execution: wait for everything before it, and make
                    // everything after it wait.
                    depends = seqno - 1;
                    self.last_iso = seqno;
                }
                self.publish(Event::Certify(CertifyEvent {
                    timestamp: SystemTime::now(),
                    seqno,
                    source: ws.source,
                    trx_id: ws.trx_id,
                    local,
                }));
                if local {
                    if !self.resolve_waiter(ws.trx_id, CertOutcome::Certified(seqno)) {
                        // The originator was aborted at a view boundary before its
                        // write-set got sequenced. It is certified cluster-wide now,
                        // so replay it here like a remote write-set to stay
                        // consistent with the members that apply it.
                        log::info!(
                            "certifier: replaying orphaned local write-set at {}",
                            seqno
                        );
                        self.dispatch_apply(seqno, depends, ws, buffer);
                    }
                } else {
                    self.dispatch_apply(seqno, depends, ws, buffer);
                }
            }
            CertResult::Rejected => {
                let _ = self
                    .cache
                    .set_flags(buffer, crate::cache::header::BufferFlags::SKIPPED);
                let _ = self.cache.free(buffer);
                self.monitor.mark_skipped(seqno);
                self.publish(Event::CertifyFailed(CertifyFailedEvent {
                    timestamp: SystemTime::now(),
                    seqno,
                    source: ws.source,
                    trx_id: ws.trx_id,
                    local,
                }));
                if local {
                    self.resolve_waiter(ws.trx_id, CertOutcome::Failed(seqno));
                }
            }
        }
    }

    fn abort_waiters(&self, err: crate::replicator::ReplicationError) {
        let drained: Vec<SyncSender<CertOutcome>> = {
            let mut waiters = self.waiters.lock().expect("waiter table lock poisoned");
            waiters.drain().map(|(_, waiter)| waiter).collect()
        };
        for waiter in drained {
            let _ = waiter.send(CertOutcome::Aborted(err));
        }
    }

    /// Returns whether a waiter was found (a send failure still counts: the caller
    /// existed and made its own decision).
    fn resolve_waiter(&self, trx_id: crate::types::basic::TrxId, outcome: CertOutcome) -> bool {
        let waiter = self
            .waiters
            .lock()
            .expect("waiter table lock poisoned")
            .remove(&trx_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(outcome);
                true
            }
            None => false,
        }
    }

    fn dispatch_apply(&self, seqno: Seqno, depends: Seqno, ws: WriteSet, buffer: BufferId) {
        let handler = Arc::clone(&self.handler);
        let monitor = Arc::clone(&self.monitor);
        let cache = Arc::clone(&self.cache);
        self.appliers.execute(move || {
            if !depends.is_none() && !monitor.wait_committed(depends, APPLY_WAIT) {
                return;
            }
            if ws.flags.contains(WsFlags::ROLLBACK) {
                // A voluntary rollback replicates only to keep seqno continuity.
                monitor.mark_skipped(seqno);
            } else {
                handler.apply(seqno, &ws);
                if monitor.commit(seqno).is_err() {
                    return;
                }
            }
            let _ = cache.free(buffer);
        });
    }

    fn handle_conf_change(&mut self, seqno: Seqno, conf: ConfChange) -> std::ops::ControlFlow<()> {
        let view = conf.view.clone();
        log::info!("certifier: {} at seqno {}", view, seqno);

        self.members = conf
            .members
            .iter()
            .map(|info| {
                (
                    info.member,
                    MemberState {
                        joined: info.synced,
                        synced: info.synced,
                        dataless: info.dataless,
                    },
                )
            })
            .collect();
        self.commit_cuts.retain(|member, _| view.contains(member));

        self.handler.view_changed(&view);
        self.publish(Event::ViewDelivered(ViewDeliveredEvent {
            timestamp: SystemTime::now(),
            view: view.clone(),
        }));

        if view.is_empty() {
            // Our own graceful leave: the final view.
            self.abort_waiters(crate::replicator::ReplicationError::ConnectionLost);
            self.shared.set_node_state(NodeState::Closed);
            return std::ops::ControlFlow::Break(());
        }

        // A write-set still awaiting its verdict at a view boundary was either flushed
        // transitionally (dropped by GCS) or discarded unsent; either way it will
        // never be sequenced. Fail the originator so it can retry in the new view.
        self.abort_waiters(if view.is_primary() {
            crate::replicator::ReplicationError::ConnectionLost
        } else {
            crate::replicator::ReplicationError::NotPrimary
        });

        if !view.is_primary() {
            if self.shared.node_state() > NodeState::Connected {
                self.shared.set_node_state(NodeState::Connected);
            }
            return std::ops::ControlFlow::Continue(());
        }

        // A primary configuration change consumes a seqno.
        let previous_position = self.group_position;
        self.conf_seqno = seqno;
        self.group_position = seqno;
        self.monitor.mark_skipped(seqno);
        let marker = borsh::to_vec(&CachedAction::ConfChange).expect("marker serializes");
        match self.cache.insert(&marker) {
            Ok(buffer) => {
                let _ = self.cache.seqno_assign(buffer, seqno);
                let _ = self.cache.free(buffer);
            }
            Err(err) => log::warn!("certifier: cannot cache conf marker: {}", err),
        }

        if seqno == Seqno::new(0) {
            // The first configuration of a fresh replication history: every founding
            // member starts consistent and synced.
            self.applied_state_id = view.state_id;
            for state in self.members.values_mut() {
                state.joined = true;
                state.synced = true;
            }
            self.become_synced();
            return std::ops::ControlFlow::Continue(());
        }

        let state_matches = self.applied_state_id == view.state_id;
        let behind = previous_position < seqno - 1;
        if state_matches && !behind {
            if !self.catching_up {
                self.become_synced();
            }
            return std::ops::ControlFlow::Continue(());
        }

        // This member lags the group: request state transfer.
        self.shared.set_node_state(NodeState::Joiner);
        self.catching_up = true;
        self.last_catchup_progress = Instant::now();
        self.ist_done = false;
        self.awaiting_snapshot = !state_matches;
        self.catchup_have = if state_matches {
            previous_position
        } else {
            Seqno::NONE
        };
        log::info!(
            "certifier: lagging the group (have {}, group at {}); requesting state transfer",
            self.catchup_have,
            seqno
        );
        self.send_action(&ActionFrame::StateReq {
            donor_hint: None,
            state_id: self.applied_state_id,
            have_seqno: self.catchup_have,
        });
        std::ops::ControlFlow::Continue(())
    }

    fn become_synced(&mut self) {
        let already_announced = self
            .members
            .get(&self.me)
            .map(|state| state.synced)
            .unwrap_or(false);
        if let Some(state) = self.members.get_mut(&self.me) {
            state.joined = true;
            state.synced = true;
        }
        self.shared.set_node_state(NodeState::Synced);
        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(());
        }
        if !already_announced {
            // Let the rest of the group update its member table.
            self.send_action(&ActionFrame::Sync);
        }
    }

    fn handle_commit_cut(&mut self, source: MemberId, committed: Seqno) {
        self.commit_cuts.insert(source, committed);
        // The horizon is sound only once every synced member has reported: a missing
        // report could hide a member whose committed position is lower than the rest.
        let synced: Vec<MemberId> = self
            .members
            .iter()
            .filter(|(_, state)| state.synced)
            .map(|(member, _)| *member)
            .collect();
        if !synced
            .iter()
            .all(|member| self.commit_cuts.contains_key(member))
        {
            return;
        }
        let cut = synced
            .iter()
            .filter_map(|member| self.commit_cuts.get(member))
            .min()
            .copied();
        if let Some(cut) = cut {
            if cut > self.cluster_commit_cut {
                self.cluster_commit_cut = cut;
                self.engine.set_last_committed(cut);
                self.handler.commit_cut(cut);
                self.publish(Event::CommitCut(CommitCutEvent {
                    timestamp: SystemTime::now(),
                    last_committed: cut,
                }));
            }
        }
    }

    fn handle_state_req(
        &mut self,
        source: MemberId,
        donor_hint: Option<MemberId>,
        state_id: StateId,
        have_seqno: Seqno,
    ) {
        if let Some(state) = self.members.get_mut(&source) {
            state.joined = false;
            state.synced = false;
        }
        let donor = pick_donor(&self.members, donor_hint, source);
        let full_snapshot = state_id != self.applied_state_id;
        self.publish(Event::StateTransferBegin(StateTransferBeginEvent {
            timestamp: SystemTime::now(),
            joiner: source,
            donor,
            full_snapshot,
        }));

        if donor == Some(self.me) {
            self.donor_of.insert(source);
            self.shared.set_desynced(true);
            self.shared.set_node_state(NodeState::Donor);
            if full_snapshot {
                self.cache.seqno_lock(Seqno::new(0));
                let snapshot_seqno = self.group_position;
                let handler = Arc::clone(&self.handler);
                let mut network = self.network.clone();
                let our_state = self.applied_state_id;
                log::info!(
                    "certifier: donating a full snapshot at {} to {}",
                    snapshot_seqno,
                    source
                );
                // Snapshot production can take a while; do not stall the ordered
                // stream behind it.
                thread::spawn(move || {
                    let data = handler.donate_snapshot();
                    network.send(
                        source,
                        WireMessage::IstResponse(IstResponse::Snapshot {
                            state_id: our_state,
                            seqno: snapshot_seqno,
                            data,
                        }),
                    );
                });
            } else {
                let lock = self.cache.seqno_locked().min(have_seqno.next());
                self.cache.seqno_lock(lock);
                log::info!(
                    "certifier: serving incremental transfer above {} to {}",
                    have_seqno,
                    source
                );
            }
        }

        if source == self.me {
            match donor {
                Some(donor) if !self.awaiting_snapshot => {
                    let from_seqno = self.catchup_have.next();
                    let to_seqno = self.conf_seqno - 1;
                    if from_seqno > to_seqno {
                        self.ist_done = true;
                        self.try_finish_catchup();
                    } else {
                        self.network.send(
                            donor,
                            WireMessage::IstRequest(IstRequest {
                                state_id: self.applied_state_id,
                                from_seqno,
                                to_seqno,
                            }),
                        );
                    }
                }
                Some(_) => (), // waiting for the snapshot to arrive
                None => log::warn!("certifier: no donor available; waiting for one to sync"),
            }
        }
    }

    fn handle_join(&mut self, source: MemberId, dataless: bool) {
        if let Some(state) = self.members.get_mut(&source) {
            state.joined = true;
            state.dataless = dataless;
        }
        if self.donor_of.remove(&source) {
            self.publish(Event::StateTransferEnd(StateTransferEndEvent {
                timestamp: SystemTime::now(),
                member: source,
            }));
            if self.donor_of.is_empty() {
                // Every joiner we served holds a consistent state; stop protecting
                // the range.
                self.cache.seqno_unlock();
                self.shared.set_desynced(false);
                self.shared.set_node_state(NodeState::Synced);
            }
        }
    }

    fn handle_sync(&mut self, source: MemberId) {
        if let Some(state) = self.members.get_mut(&source) {
            state.synced = true;
        }
        if source == self.me && self.shared.node_state() != NodeState::Synced {
            self.become_synced();
        }
    }

    fn handle_ist_response(&mut self, from: MemberId, response: IstResponse) {
        if !self.catching_up {
            return;
        }
        self.last_catchup_progress = Instant::now();
        match response {
            IstResponse::Snapshot {
                state_id,
                seqno,
                data,
            } => {
                if !self.awaiting_snapshot {
                    return;
                }
                log::info!(
                    "certifier: installing snapshot {} at {} from {}",
                    state_id,
                    seqno,
                    from
                );
                self.handler.install_snapshot(state_id, seqno, &data);
                self.applied_state_id = state_id;
                self.engine.fast_forward(seqno);
                self.monitor.fast_forward(seqno);
                self.awaiting_snapshot = false;
                // Everything at or below the snapshot point is covered by it.
                while self
                    .pending_live
                    .front()
                    .map(|pending| pending.seqno <= seqno)
                    .unwrap_or(false)
                {
                    let _ = self.pending_live.pop_front();
                }
                self.ist_done = true;
                self.try_finish_catchup();
            }
            IstResponse::WriteSets { entries, last } => {
                for entry in entries {
                    // Retries can overlap ranges already replayed; skip duplicates.
                    if entry.seqno <= self.engine.position()
                        || self.cache.index().get(entry.seqno).is_some()
                    {
                        continue;
                    }
                    match borsh::from_slice::<CachedAction>(&entry.payload) {
                        Ok(CachedAction::WriteSet(ws)) => {
                            let buffer = match self.cache.insert(&entry.payload) {
                                Ok(buffer) => buffer,
                                Err(err) => {
                                    log::error!(
                                        "certifier: cannot cache transferred write-set: {}",
                                        err
                                    );
                                    panic!("write-set cache failure during state transfer");
                                }
                            };
                            let _ = self.cache.seqno_assign(buffer, entry.seqno);
                            self.certify_and_dispatch(entry.seqno, ws, buffer);
                        }
                        Ok(CachedAction::ConfChange) => {
                            if let Ok(buffer) = self.cache.insert(&entry.payload) {
                                let _ = self.cache.seqno_assign(buffer, entry.seqno);
                                let _ = self.cache.free(buffer);
                            }
                            self.monitor.mark_skipped(entry.seqno);
                        }
                        Err(err) => {
                            log::error!("certifier: undecodable transfer entry: {}", err);
                            panic!("corrupt incremental state transfer stream");
                        }
                    }
                }
                if last {
                    self.ist_done = true;
                    self.try_finish_catchup();
                }
            }
            IstResponse::Refused { first_available } => {
                log::warn!(
                    "certifier: incremental transfer refused (donor starts at {}); falling back to a full snapshot",
                    first_available
                );
                self.awaiting_snapshot = true;
                self.ist_done = false;
                self.send_action(&ActionFrame::StateReq {
                    donor_hint: None,
                    // An undefined state id forces the donor onto the snapshot path.
                    state_id: StateId::UNDEFINED,
                    have_seqno: Seqno::NONE,
                });
            }
        }
    }

    fn try_finish_catchup(&mut self) {
        if !self.catching_up || self.awaiting_snapshot || !self.ist_done {
            return;
        }
        while let Some(pending) = self.pending_live.pop_front() {
            if pending.seqno <= self.engine.position() {
                continue;
            }
            self.certify_and_dispatch(pending.seqno, pending.ws, pending.buffer);
        }
        self.catching_up = false;
        self.last_catchup_progress = Instant::now();
        log::info!(
            "certifier: caught up at {}; joining the synced set",
            self.group_position
        );
        self.send_action(&ActionFrame::Join {
            dataless: self.config.pc.dataless,
        });
        self.send_action(&ActionFrame::Sync);
    }

    fn send_action(&self, frame: &ActionFrame) {
        let payload = borsh::to_vec(frame).expect("action frame serializes");
        self.send_outgoing(Outgoing {
            user_type: USER_TYPE_ACTION,
            payload,
        });
    }

    /// Control traffic must not be dropped, but the certifier also must not block
    /// behind a FIFO stuffed by originators (the group thread drains it between
    /// deliveries). Bounded retry covers the gap.
    fn send_outgoing(&self, mut outgoing: Outgoing) {
        for _ in 0..500 {
            match self.outgoing.try_push(outgoing) {
                Ok(()) => return,
                Err(crate::gcs::fifo::FifoClosed(rejected)) => {
                    if self.outgoing.is_closed() {
                        return;
                    }
                    outgoing = rejected;
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
        log::error!("certifier: origination queue jammed; dropping a control action");
    }

    fn flow_control_tick(&mut self) {
        let backlog = self.recv.len() + self.appliers.queued_count();
        if !self.fc_paused && backlog > self.config.gcs.fc_upper_limit {
            self.fc_paused = true;
            self.send_fc(true, backlog);
        } else if self.fc_paused && backlog < self.config.gcs.fc_lower_limit {
            self.fc_paused = false;
            self.send_fc(false, backlog);
        }
    }

    fn send_fc(&self, pause: bool, backlog: usize) {
        log::info!(
            "certifier: flow control {} (backlog {})",
            if pause { "pause" } else { "resume" },
            backlog
        );
        let payload = borsh::to_vec(&FcFrame {
            pause,
            backlog: backlog as u64,
        })
        .expect("flow-control frame serializes");
        self.send_outgoing(Outgoing {
            user_type: USER_TYPE_FC,
            payload,
        });
        self.publish(Event::FlowControl(FlowControlEvent {
            timestamp: SystemTime::now(),
            pause,
            backlog,
        }));
    }

    /// Retry the catch-up control actions that may have been discarded in view churn.
    fn catchup_retry_tick(&mut self) {
        let now = Instant::now();
        if self.catching_up {
            if now.duration_since(self.last_catchup_progress) >= STATE_TRANSFER_RETRY {
                self.last_catchup_progress = now;
                log::warn!("certifier: state transfer stalled; re-requesting");
                let state_id = if self.awaiting_snapshot {
                    StateId::UNDEFINED
                } else {
                    self.applied_state_id
                };
                self.send_action(&ActionFrame::StateReq {
                    donor_hint: None,
                    state_id,
                    have_seqno: self.catchup_have,
                });
            }
            return;
        }
        let state = self.shared.node_state();
        if (state == NodeState::Joiner || state == NodeState::Joined)
            && self.ist_done
            && now.duration_since(self.last_catchup_progress) >= SYNC_RETRY
        {
            self.last_catchup_progress = now;
            self.send_action(&ActionFrame::Join {
                dataless: self.config.pc.dataless,
            });
            self.send_action(&ActionFrame::Sync);
        }
    }

    fn commit_cut_tick(&mut self) {
        if self.shared.node_state() != NodeState::Synced {
            return;
        }
        let now = Instant::now();
        if now.duration_since(self.last_commit_cut_sent) < self.config.gcs.commit_cut_period {
            return;
        }
        self.last_commit_cut_sent = now;
        self.send_action(&ActionFrame::CommitCut {
            committed: self.monitor.last_committed(),
        });
    }
}
