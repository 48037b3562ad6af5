/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The replicator: the state machine that coordinates joining, state transfer,
//! steady-state replication, and graceful leave, and the public API the embedding
//! database calls.
//!
//! ## Threads
//!
//! [`Replicator::connect`] starts:
//! - the transport's I/O machinery (inside the [`Network`] implementation),
//! - the **poller**, which distributes received messages ([`crate::network`]),
//! - the **group thread**, which owns the EVS, PC, and GCS state machines and turns
//!   network traffic into ordered actions,
//! - the **certifier thread**, which consumes ordered actions, certifies write-sets,
//!   and dispatches remote apply work,
//! - the **applier pool**, which applies certified remote write-sets in parallel
//!   (bounded by their certification dependencies) and commits them in seqno order,
//! - the **IST server**, which serves cached write-set ranges to joiners, and
//! - optionally the **event bus**.
//!
//! Local transactions run on caller threads: `replicate` blocks on the origination
//! FIFO (backpressure), then on the certification verdict for its own write-set.

pub mod state_transfer;

mod certifier;

mod group;

use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::cache::WriteSetCache;
use crate::config::Configuration;
use crate::event_bus::{start_event_bus, EventHandlers};
use crate::events::Event;
use crate::gcs::fifo::ActionFifo;
use crate::gcs::{ActionFrame, GcsAction, GcsError, GcsShared};
use crate::network::{start_polling, Network};
use crate::types::basic::{MemberId, Seqno, StateId, TrxId};
use crate::types::view::View;
use crate::types::writeset::{WriteSet, WsFlags, WsKey};

use self::certifier::CertifierThread;
use self::state_transfer::start_ist_server;

/// Errors surfaced to the embedding database. All are recoverable except
/// [`InternalFatal`](ReplicationError::InternalFatal), which means the node's state can
/// no longer be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationError {
    ConnectionLost,
    NotConnected,
    NotPrimary,
    CertificationFailed,
    SizeExceeded,
    BadRequest,
    TransportError,
    Conflict,
    InternalFatal,
}

impl Display for ReplicationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReplicationError::ConnectionLost => "connection to the cluster lost",
            ReplicationError::NotConnected => "not connected to a cluster",
            ReplicationError::NotPrimary => "not in a primary component",
            ReplicationError::CertificationFailed => "certification failed",
            ReplicationError::SizeExceeded => "write-set exceeds the size limit",
            ReplicationError::BadRequest => "malformed request",
            ReplicationError::TransportError => "transport failure",
            ReplicationError::Conflict => "conflict with a concurrent operation",
            ReplicationError::InternalFatal => "fatal internal inconsistency",
        };
        f.write_str(text)
    }
}

impl From<GcsError> for ReplicationError {
    fn from(err: GcsError) -> ReplicationError {
        match err {
            GcsError::Closed => ReplicationError::ConnectionLost,
            GcsError::NotConnected => ReplicationError::NotConnected,
            GcsError::NotPrimary => ReplicationError::NotPrimary,
        }
    }
}

/// The seam to the embedding database. Called from replicator threads; implementations
/// must be thread-safe.
pub trait ReplicationHandler: Send + Sync + 'static {
    /// Apply a certified remote write-set, including the database's own commit of it.
    /// May be called in parallel for write-sets whose certification dependencies are
    /// satisfied; the replicator serialises the commit order separately.
    fn apply(&self, seqno: Seqno, ws: &WriteSet);

    /// A configuration change was delivered.
    fn view_changed(&self, view: &View);

    /// Produce a full state snapshot for a joiner (donor side). The bytes are opaque
    /// to the replicator.
    fn donate_snapshot(&self) -> Vec<u8>;

    /// Install a received snapshot consistent at `seqno` (joiner side).
    fn install_snapshot(&self, state_id: StateId, seqno: Seqno, snapshot: &[u8]);

    /// Every write-set at or below `seqno` has been committed cluster-wide.
    fn commit_cut(&self, seqno: Seqno) {
        let _ = seqno;
    }
}

/// What the write-set cache stores per seqno: the replicated write-set, or a marker
/// holding the seqno a configuration change consumed, so that cached ranges stay
/// contiguous for incremental state transfer.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum CachedAction {
    WriteSet(WriteSet),
    ConfChange,
}

/// An outbound item on the origination FIFO: an EVS user-type tag plus the serialized
/// payload.
pub(crate) struct Outgoing {
    pub(crate) user_type: u8,
    pub(crate) payload: Vec<u8>,
}

pub(crate) enum GroupCommand {
    Leave,
}

/// The verdict a waiting `replicate` call receives for its write-set.
#[derive(Clone, Copy, Debug)]
pub(crate) enum CertOutcome {
    Certified(Seqno),
    Failed(Seqno),
    /// The write-set never reached certification (the component lost primary status
    /// or the node left).
    Aborted(ReplicationError),
}

pub(crate) type Waiters = Arc<Mutex<HashMap<TrxId, SyncSender<CertOutcome>>>>;
pub(crate) type CausalWaiters = Arc<Mutex<HashMap<u64, SyncSender<Seqno>>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CommitMonitorError {
    Closed,
    BadSeqno,
}

struct MonitorState {
    last_committed: Seqno,
    committed: BTreeSet<Seqno>,
    skipped: BTreeSet<Seqno>,
    closed: bool,
}

/// Tracks the locally committed prefix of the global seqno stream and enforces the
/// commit order. Seqnos nobody commits (rejected write-sets, configuration changes)
/// are marked skipped and absorbed as the prefix reaches them.
pub(crate) struct CommitMonitor {
    state: Mutex<MonitorState>,
    changed: Condvar,
    enforce_order: bool,
}

impl CommitMonitor {
    pub(crate) fn new(enforce_order: bool) -> Arc<CommitMonitor> {
        Arc::new(CommitMonitor {
            state: Mutex::new(MonitorState {
                last_committed: Seqno::NONE,
                committed: BTreeSet::new(),
                skipped: BTreeSet::new(),
                closed: false,
            }),
            changed: Condvar::new(),
            enforce_order,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().expect("commit monitor lock poisoned")
    }

    fn advance(state: &mut MonitorState) {
        loop {
            let next = state.last_committed.next();
            if state.skipped.remove(&next) || state.committed.remove(&next) {
                state.last_committed = next;
            } else {
                return;
            }
        }
    }

    pub(crate) fn last_committed(&self) -> Seqno {
        self.lock().last_committed
    }

    /// Record a commit. With commit ordering enforced, blocks until every earlier
    /// seqno has committed or been skipped.
    pub(crate) fn commit(&self, seqno: Seqno) -> Result<(), CommitMonitorError> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(CommitMonitorError::Closed);
            }
            if seqno <= state.last_committed || state.committed.contains(&seqno) {
                return Err(CommitMonitorError::BadSeqno);
            }
            if !self.enforce_order {
                state.committed.insert(seqno);
                Self::advance(&mut state);
                self.changed.notify_all();
                return Ok(());
            }
            Self::advance(&mut state);
            if state.last_committed.next() == seqno {
                state.last_committed = seqno;
                Self::advance(&mut state);
                self.changed.notify_all();
                return Ok(());
            }
            state = self
                .changed
                .wait(state)
                .expect("commit monitor lock poisoned");
        }
    }

    /// Mark a seqno that will never be committed (rejected write-set, configuration
    /// change).
    pub(crate) fn mark_skipped(&self, seqno: Seqno) {
        let mut state = self.lock();
        if seqno <= state.last_committed {
            return;
        }
        state.skipped.insert(seqno);
        Self::advance(&mut state);
        self.changed.notify_all();
    }

    /// Jump the committed prefix forward after installing a snapshot.
    pub(crate) fn fast_forward(&self, seqno: Seqno) {
        let mut state = self.lock();
        if seqno > state.last_committed {
            state.last_committed = seqno;
            state.committed = state.committed.split_off(&seqno.next());
            state.skipped = state.skipped.split_off(&seqno.next());
            Self::advance(&mut state);
            self.changed.notify_all();
        }
    }

    /// Wait until the committed prefix reaches `seqno`. Returns false on timeout or
    /// close.
    pub(crate) fn wait_committed(&self, seqno: Seqno, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.last_committed >= seqno {
                return true;
            }
            if state.closed {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .expect("commit monitor lock poisoned");
            state = next;
        }
    }

    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.changed.notify_all();
    }
}

/// Parse a cluster address: a `tcp://`/`ssl://` URI with a comma-separated seed list.
/// `udp://` is recognised but refused: the mesh is stream-oriented.
pub fn parse_cluster_address(cluster_addr: &str) -> Result<Vec<String>, ReplicationError> {
    let rest = if let Some(rest) = cluster_addr.strip_prefix("tcp://") {
        rest
    } else if let Some(rest) = cluster_addr.strip_prefix("ssl://") {
        rest
    } else if cluster_addr.strip_prefix("udp://").is_some() {
        return Err(ReplicationError::BadRequest);
    } else {
        cluster_addr
    };
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    Ok(rest
        .split(',')
        .map(|seed| seed.trim().to_string())
        .filter(|seed| !seed.is_empty())
        .collect())
}

/// `mpsc` senders used only at shutdown, kept under one lock so the replicator stays
/// `Sync` for the database's worker threads.
struct ShutdownHandles {
    group_commands: mpsc::Sender<GroupCommand>,
    poller: mpsc::Sender<()>,
    ist: mpsc::Sender<()>,
    event_bus: Option<mpsc::Sender<()>>,
}

/// The replication provider. One instance per embedded database process; shared by the
/// database's worker threads.
pub struct Replicator<N: Network> {
    me: MemberId,
    config: Configuration,
    shared: Arc<GcsShared>,
    monitor: Arc<CommitMonitor>,
    cache: Arc<WriteSetCache>,
    outgoing: ActionFifo<Outgoing>,
    recv: ActionFifo<GcsAction>,
    waiters: Waiters,
    causal_waiters: CausalWaiters,
    network: Mutex<N>,
    shutdown: Mutex<ShutdownHandles>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    next_causal_token: Mutex<u64>,
}

impl<N: Network> Replicator<N> {
    /// Join the cluster reachable through `network`. Blocks until this member is part
    /// of a primary component and fully synced, or the connect timeout passes.
    pub fn connect(
        config: Configuration,
        handler: Arc<dyn ReplicationHandler>,
        network: N,
    ) -> Result<Replicator<N>, ReplicationError> {
        Self::connect_with_handlers(config, handler, network, EventHandlerSpec::default())
    }

    /// As [`connect`](Self::connect), with user event handlers.
    pub fn connect_with_handlers(
        config: Configuration,
        handler: Arc<dyn ReplicationHandler>,
        network: N,
        event_handlers: EventHandlerSpec,
    ) -> Result<Replicator<N>, ReplicationError> {
        let me = config.member_id.unwrap_or_else(MemberId::generate);
        log::info!(
            "replicator: starting member {} ({})",
            me,
            config.replicator.node_name
        );

        let cache = Arc::new(
            WriteSetCache::open(config.cache.clone()).map_err(|err| {
                log::error!("replicator: cannot open write-set cache: {}", err);
                ReplicationError::InternalFatal
            })?,
        );
        let shared = GcsShared::new();
        shared.set_node_state(crate::gcs::NodeState::Open);
        let monitor = CommitMonitor::new(config.replicator.commit_order);
        let recv: ActionFifo<GcsAction> = ActionFifo::new(config.gcs.recv_queue_len);
        let outgoing: ActionFifo<Outgoing> = ActionFifo::new(config.gcs.send_queue_len);
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let causal_waiters: CausalWaiters = Arc::new(Mutex::new(HashMap::new()));

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (poller, group_events, ist_requests, ist_responses) =
            start_polling(network.clone(), poller_shutdown_receiver);

        let (ist_shutdown, ist_shutdown_receiver) = mpsc::channel();
        let ist_server = start_ist_server(
            Arc::clone(&cache),
            network.clone(),
            ist_requests,
            ist_shutdown_receiver,
        );

        let handlers = event_handlers.into_handlers(config.log_events);
        let (event_publisher, event_bus, event_bus_shutdown) = if handlers.is_empty() {
            (None, None, None)
        } else {
            let (publisher, subscriber) = mpsc::channel();
            let (shutdown, shutdown_receiver) = mpsc::channel();
            let bus = start_event_bus(handlers, subscriber, shutdown_receiver);
            (Some(publisher), Some(bus), Some(shutdown))
        };

        let (group_commands, group_command_receiver) = mpsc::channel();
        let group = group::start_group_thread(
            me,
            config.clone(),
            network.clone(),
            Arc::clone(&shared),
            recv.clone(),
            outgoing.clone(),
            group_events,
            group_command_receiver,
        );

        let (connect_tx, connect_rx) = mpsc::sync_channel(1);
        let certifier = CertifierThread::start(
            me,
            config.clone(),
            Arc::clone(&handler),
            network.clone(),
            Arc::clone(&cache),
            Arc::clone(&monitor),
            Arc::clone(&shared),
            recv.clone(),
            outgoing.clone(),
            ist_responses,
            Arc::clone(&waiters),
            Arc::clone(&causal_waiters),
            event_publisher,
            connect_tx,
        );

        let mut threads = vec![group, certifier, ist_server, poller];
        if let Some(bus) = event_bus {
            threads.push(bus);
        }

        let replicator = Replicator {
            me,
            config,
            shared,
            monitor,
            cache,
            outgoing,
            recv,
            waiters,
            causal_waiters,
            network: Mutex::new(network),
            shutdown: Mutex::new(ShutdownHandles {
                group_commands,
                poller: poller_shutdown,
                ist: ist_shutdown,
                event_bus: event_bus_shutdown,
            }),
            threads: Mutex::new(threads),
            closed: AtomicBool::new(false),
            next_causal_token: Mutex::new(1),
        };

        match connect_rx.recv_timeout(replicator.config.replicator.connect_timeout) {
            Ok(()) => Ok(replicator),
            Err(_) => {
                log::error!("replicator: no primary component within the connect timeout");
                replicator.close();
                Err(ReplicationError::ConnectionLost)
            }
        }
    }

    pub fn member_id(&self) -> MemberId {
        self.me
    }

    /// The highest locally committed seqno: the snapshot horizon for the next
    /// write-set.
    pub fn last_committed(&self) -> Seqno {
        self.monitor.last_committed()
    }

    /// Replicate a locally prepared write-set. Returns its global seqno once it has
    /// been ordered and certified; the caller then applies its own transaction and
    /// calls [`commit`](Self::commit).
    ///
    /// On [`ConnectionLost`](ReplicationError::ConnectionLost) or
    /// [`NotPrimary`](ReplicationError::NotPrimary) the write-set was not sequenced;
    /// the caller may retry, and every attempt must use a fresh `trx_id`.
    pub fn replicate(
        &self,
        trx_id: TrxId,
        keys: Vec<WsKey>,
        data: Vec<u8>,
        flags: WsFlags,
    ) -> Result<Seqno, ReplicationError> {
        self.replicate_inner(trx_id, keys, data, flags)
    }

    fn replicate_inner(
        &self,
        trx_id: TrxId,
        keys: Vec<WsKey>,
        data: Vec<u8>,
        flags: WsFlags,
    ) -> Result<Seqno, ReplicationError> {
        let ws = WriteSet {
            source: self.me,
            trx_id,
            last_seen: self.monitor.last_committed(),
            keys,
            data,
            flags,
        };
        if ws.size() > self.config.replicator.max_ws_size {
            return Err(ReplicationError::SizeExceeded);
        }

        self.shared.wait_send_permission()?;

        let payload =
            borsh::to_vec(&ActionFrame::WriteSet(ws)).map_err(|_| ReplicationError::BadRequest)?;
        let (verdict_tx, verdict_rx) = mpsc::sync_channel(1);
        self.waiters
            .lock()
            .expect("waiter table lock poisoned")
            .insert(trx_id, verdict_tx);

        if self
            .outgoing
            .push(Outgoing {
                user_type: crate::gcs::USER_TYPE_ACTION,
                payload,
            })
            .is_err()
        {
            self.waiters
                .lock()
                .expect("waiter table lock poisoned")
                .remove(&trx_id);
            return Err(ReplicationError::ConnectionLost);
        }

        match verdict_rx.recv() {
            Ok(CertOutcome::Certified(seqno)) => Ok(seqno),
            Ok(CertOutcome::Failed(_)) => Err(ReplicationError::CertificationFailed),
            Ok(CertOutcome::Aborted(err)) => Err(err),
            Err(_) => Err(ReplicationError::ConnectionLost),
        }
    }

    /// Record that the transaction at `seqno` has committed locally, releasing its
    /// cache buffer and advancing the commit horizon.
    pub fn commit(&self, seqno: Seqno) -> Result<(), ReplicationError> {
        match self.monitor.commit(seqno) {
            Ok(()) => {
                if let Some(id) = self.cache.index().get(seqno) {
                    let _ = self.cache.free(id);
                }
                Ok(())
            }
            Err(CommitMonitorError::Closed) => Err(ReplicationError::ConnectionLost),
            Err(CommitMonitorError::BadSeqno) => Err(ReplicationError::BadRequest),
        }
    }

    /// Begin a totally-ordered (isolated) execution: the write-set is replicated with
    /// isolation semantics and every member executes it serially at its seqno.
    pub fn to_execute_start(
        &self,
        trx_id: TrxId,
        keys: Vec<WsKey>,
        data: Vec<u8>,
    ) -> Result<Seqno, ReplicationError> {
        self.replicate_inner(
            trx_id,
            keys,
            data,
            WsFlags::COMMIT.union(WsFlags::ISOLATION),
        )
    }

    /// Finish a totally-ordered execution started with
    /// [`to_execute_start`](Self::to_execute_start).
    pub fn to_execute_end(&self, seqno: Seqno) -> Result<(), ReplicationError> {
        self.commit(seqno)
    }

    /// Opt out of flow control (donors do this while shipping a snapshot).
    pub fn desync(&self) -> Result<(), ReplicationError> {
        if self.shared.is_closed() {
            return Err(ReplicationError::ConnectionLost);
        }
        self.shared.set_desynced(true);
        Ok(())
    }

    /// Opt back into flow control.
    pub fn resync(&self) -> Result<(), ReplicationError> {
        if self.shared.is_closed() {
            return Err(ReplicationError::ConnectionLost);
        }
        self.shared.set_desynced(false);
        Ok(())
    }

    /// Causal read barrier: returns once everything ordered before this call has been
    /// committed locally, yielding that position.
    pub fn causal_read(&self) -> Result<Seqno, ReplicationError> {
        let timeout = self.config.replicator.causal_read_timeout;
        let token = {
            let mut next = self
                .next_causal_token
                .lock()
                .expect("causal token lock poisoned");
            *next += 1;
            *next
        };
        let (point_tx, point_rx) = mpsc::sync_channel(1);
        self.causal_waiters
            .lock()
            .expect("causal waiter table lock poisoned")
            .insert(token, point_tx);

        let payload = borsh::to_vec(&ActionFrame::Causal { token })
            .map_err(|_| ReplicationError::BadRequest)?;
        if self
            .outgoing
            .push(Outgoing {
                user_type: crate::gcs::USER_TYPE_ACTION,
                payload,
            })
            .is_err()
        {
            self.causal_waiters
                .lock()
                .expect("causal waiter table lock poisoned")
                .remove(&token);
            return Err(ReplicationError::ConnectionLost);
        }

        let point = match point_rx.recv_timeout(timeout) {
            Ok(point) => point,
            Err(_) => {
                self.causal_waiters
                    .lock()
                    .expect("causal waiter table lock poisoned")
                    .remove(&token);
                return Err(ReplicationError::TransportError);
            }
        };
        if self.monitor.wait_committed(point, timeout) {
            Ok(point)
        } else {
            Err(ReplicationError::TransportError)
        }
    }

    /// Leave the cluster gracefully. Outstanding `replicate` calls fail with
    /// [`ConnectionLost`](ReplicationError::ConnectionLost); the remaining members
    /// install a new view promptly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("replicator: leaving the cluster");
        {
            let shutdown = self.shutdown.lock().expect("shutdown handles lock poisoned");
            let _ = shutdown.group_commands.send(GroupCommand::Leave);
        }

        // The group thread broadcasts the leave, delivers the final empty view, and
        // exits; the certifier follows once it processes that view or the queue
        // closes.
        let threads: Vec<JoinHandle<()>> = {
            let mut threads = self.threads.lock().expect("thread table lock poisoned");
            threads.drain(..).collect()
        };

        self.shared.close();
        self.outgoing.close();
        self.recv.close();
        self.monitor.close();
        // Dropping the verdict senders fails outstanding replicate calls with
        // ConnectionLost.
        self.waiters.lock().expect("waiter table lock poisoned").clear();
        self.causal_waiters
            .lock()
            .expect("causal waiter table lock poisoned")
            .clear();

        {
            let shutdown = self.shutdown.lock().expect("shutdown handles lock poisoned");
            let _ = shutdown.poller.send(());
            let _ = shutdown.ist.send(());
            if let Some(event_bus) = &shutdown.event_bus {
                let _ = event_bus.send(());
            }
        }
        for thread in threads {
            let _ = thread.join();
        }
        self.network.lock().expect("network lock poisoned").close();
        self.cache.close();
    }
}

impl<N: Network> Drop for Replicator<N> {
    fn drop(&mut self) {
        self.close();
    }
}

/// User event handlers, passed to
/// [`connect_with_handlers`](Replicator::connect_with_handlers).
#[derive(Default)]
pub struct EventHandlerSpec {
    pub view_delivered: Option<crate::event_bus::HandlerPtr<crate::events::ViewDeliveredEvent>>,
    pub certify: Option<crate::event_bus::HandlerPtr<crate::events::CertifyEvent>>,
    pub certify_failed: Option<crate::event_bus::HandlerPtr<crate::events::CertifyFailedEvent>>,
    pub commit_cut: Option<crate::event_bus::HandlerPtr<crate::events::CommitCutEvent>>,
    pub state_transfer_begin:
        Option<crate::event_bus::HandlerPtr<crate::events::StateTransferBeginEvent>>,
    pub state_transfer_end:
        Option<crate::event_bus::HandlerPtr<crate::events::StateTransferEndEvent>>,
    pub flow_control: Option<crate::event_bus::HandlerPtr<crate::events::FlowControlEvent>>,
}

impl EventHandlerSpec {
    fn into_handlers(self, log: bool) -> EventHandlers {
        EventHandlers::new(
            log,
            self.view_delivered,
            self.certify,
            self.certify_failed,
            self.commit_cut,
            self.state_transfer_begin,
            self.state_transfer_end,
            self.flow_control,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_monitor_absorbs_skips_and_enforces_order() {
        let monitor = CommitMonitor::new(true);
        monitor.mark_skipped(Seqno::new(0)); // a conf change
        assert_eq!(monitor.last_committed(), Seqno::new(0));

        // Commit 2 out of order on another thread; it must wait for 1.
        let monitor_for_thread = Arc::clone(&monitor);
        let out_of_order = std::thread::spawn(move || monitor_for_thread.commit(Seqno::new(2)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(monitor.last_committed(), Seqno::new(0));

        monitor.commit(Seqno::new(1)).unwrap();
        out_of_order.join().unwrap().unwrap();
        assert_eq!(monitor.last_committed(), Seqno::new(2));
    }

    #[test]
    fn commit_monitor_without_order_enforcement_accepts_any_order() {
        let monitor = CommitMonitor::new(false);
        monitor.mark_skipped(Seqno::new(0));
        monitor.commit(Seqno::new(3)).unwrap();
        monitor.commit(Seqno::new(2)).unwrap();
        assert_eq!(monitor.last_committed(), Seqno::new(0));
        monitor.commit(Seqno::new(1)).unwrap();
        assert_eq!(monitor.last_committed(), Seqno::new(3));
    }

    #[test]
    fn commit_monitor_rejects_double_commit() {
        let monitor = CommitMonitor::new(false);
        monitor.mark_skipped(Seqno::new(0));
        monitor.commit(Seqno::new(1)).unwrap();
        assert_eq!(
            monitor.commit(Seqno::new(1)),
            Err(CommitMonitorError::BadSeqno)
        );
    }

    #[test]
    fn commit_monitor_fast_forward() {
        let monitor = CommitMonitor::new(true);
        monitor.fast_forward(Seqno::new(41));
        assert_eq!(monitor.last_committed(), Seqno::new(41));
        monitor.commit(Seqno::new(42)).unwrap();
        assert_eq!(monitor.last_committed(), Seqno::new(42));
    }

    #[test]
    fn cluster_address_parsing() {
        assert_eq!(
            parse_cluster_address("tcp://a:1,b:2").unwrap(),
            vec!["a:1".to_string(), "b:2".to_string()]
        );
        assert_eq!(
            parse_cluster_address("ssl://a:1").unwrap(),
            vec!["a:1".to_string()]
        );
        assert_eq!(parse_cluster_address("tcp://").unwrap(), Vec::<String>::new());
        assert_eq!(
            parse_cluster_address("udp://a:1"),
            Err(ReplicationError::BadRequest)
        );
        assert_eq!(
            parse_cluster_address("a:1,b:2").unwrap().len(),
            2,
            "bare address lists are accepted"
        );
    }

    #[test]
    fn wait_committed_times_out() {
        let monitor = CommitMonitor::new(true);
        assert!(!monitor.wait_committed(Seqno::new(5), Duration::from_millis(10)));
        monitor.fast_forward(Seqno::new(5));
        assert!(monitor.wait_committed(Seqno::new(5), Duration::from_millis(10)));
    }
}
