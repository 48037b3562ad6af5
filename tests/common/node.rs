//! Per-node test harness: a mock key-value database implementing
//! [`ReplicationHandler`], plus helpers to start whole clusters over the mock network.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use tandem::config::Configuration;
use tandem::replicator::Replicator;
use tandem::{
    MemberId, ReplicationError, ReplicationHandler, Seqno, StateId, TrxId, View, WriteSet,
    WsFlags, WsKey,
};

use super::network::{Hub, NetworkStub};

type Rows = Vec<(Vec<u8>, Vec<u8>)>;

/// A mock database: an in-memory key-value map whose "change-log" payloads are
/// borsh-encoded row lists.
pub(crate) struct MockDb {
    state: Mutex<DbState>,
}

struct DbState {
    rows: BTreeMap<Vec<u8>, Vec<u8>>,
    applied: Vec<Seqno>,
    views: Vec<View>,
    snapshots_installed: u32,
}

impl MockDb {
    pub(crate) fn new() -> Arc<MockDb> {
        Arc::new(MockDb {
            state: Mutex::new(DbState {
                rows: BTreeMap::new(),
                applied: Vec::new(),
                views: Vec::new(),
                snapshots_installed: 0,
            }),
        })
    }

    pub(crate) fn encode_rows(rows: &Rows) -> Vec<u8> {
        borsh::to_vec(rows).unwrap()
    }

    pub(crate) fn apply_rows(&self, seqno: Seqno, data: &[u8]) {
        let rows: Rows = borsh::from_slice(data).expect("test payloads are row lists");
        let mut state = self.state.lock().unwrap();
        for (key, value) in rows {
            state.rows.insert(key, value);
        }
        state.applied.push(seqno);
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.lock().unwrap().rows.get(key).cloned()
    }

    pub(crate) fn applied_count(&self) -> usize {
        self.state.lock().unwrap().applied.len()
    }

    pub(crate) fn views(&self) -> Vec<View> {
        self.state.lock().unwrap().views.clone()
    }

    pub(crate) fn latest_view(&self) -> Option<View> {
        self.state.lock().unwrap().views.last().cloned()
    }

    pub(crate) fn snapshots_installed(&self) -> u32 {
        self.state.lock().unwrap().snapshots_installed
    }
}

impl ReplicationHandler for MockDb {
    fn apply(&self, seqno: Seqno, ws: &WriteSet) {
        self.apply_rows(seqno, &ws.data);
    }

    fn view_changed(&self, view: &View) {
        self.state.lock().unwrap().views.push(view.clone());
    }

    fn donate_snapshot(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let rows: Rows = state
            .rows
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        borsh::to_vec(&rows).unwrap()
    }

    fn install_snapshot(&self, _state_id: StateId, _seqno: Seqno, snapshot: &[u8]) {
        let rows: Rows = borsh::from_slice(snapshot).expect("snapshots are row lists");
        let mut state = self.state.lock().unwrap();
        state.rows = rows.into_iter().collect();
        state.snapshots_installed += 1;
    }
}

pub(crate) struct TestNode {
    pub(crate) member_id: MemberId,
    pub(crate) db: Arc<MockDb>,
    pub(crate) replicator: Replicator<NetworkStub>,
    next_trx: AtomicU64,
    _cache_dir: TempDir,
}

impl TestNode {
    /// Replicate one row write, apply it locally, and commit it.
    pub(crate) fn write(&self, key: &[u8], value: &[u8]) -> Result<Seqno, ReplicationError> {
        let data = MockDb::encode_rows(&vec![(key.to_vec(), value.to_vec())]);
        let seqno = self.replicate_row(key, &data)?;
        self.db.apply_rows(seqno, &data);
        self.replicator.commit(seqno)?;
        Ok(seqno)
    }

    /// Replicate only (certification verdict without the local commit); the caller
    /// commits or lets the write-set hang.
    pub(crate) fn replicate_row(&self, key: &[u8], data: &[u8]) -> Result<Seqno, ReplicationError> {
        let trx_id = TrxId::new(self.next_trx.fetch_add(1, Ordering::SeqCst));
        self.replicator.replicate(
            trx_id,
            vec![WsKey::exclusive(vec![key.to_vec()])],
            data.to_vec(),
            WsFlags::COMMIT,
        )
    }
}

/// A test-sized configuration: short protocol timers, a tiny cache in `dir`.
pub(crate) fn test_configuration(
    member_id: MemberId,
    bootstrap: bool,
    dir: &TempDir,
) -> Configuration {
    let mut config = Configuration::default();
    config.member_id = Some(member_id);
    config.evs.join_retrans_period = Duration::from_millis(50);
    config.evs.settle_period = Duration::from_millis(150);
    config.pc.bootstrap = bootstrap;
    config.gcs.commit_cut_period = Duration::from_millis(50);
    config.cache.dir = dir.path().to_path_buf();
    config.cache.mem_max = 1024 * 1024;
    config.cache.page_size = 1024 * 1024;
    config.cache.total_size = 16 * 1024 * 1024;
    config.replicator.connect_timeout = Duration::from_secs(20);
    config.replicator.applier_threads = 2;
    config
}

/// Start an `n`-member cluster over `hub`. The lowest member id is the bootstrap
/// member. Nodes come back fully synced.
pub(crate) fn start_cluster(hub: &Hub, n: usize) -> Vec<TestNode> {
    let mut ids: Vec<MemberId> = (0..n).map(|_| MemberId::generate()).collect();
    ids.sort();
    let stubs: Vec<NetworkStub> = ids.iter().map(|id| hub.register(*id)).collect();
    hub.connect_full();

    let connects: Vec<thread::JoinHandle<TestNode>> = ids
        .iter()
        .zip(stubs)
        .enumerate()
        .map(|(index, (member_id, stub))| {
            let member_id = *member_id;
            thread::spawn(move || start_node(member_id, index == 0, stub))
        })
        .collect();

    connects
        .into_iter()
        .map(|handle| handle.join().expect("node connects"))
        .collect()
}

pub(crate) fn start_node(member_id: MemberId, bootstrap: bool, stub: NetworkStub) -> TestNode {
    let cache_dir = TempDir::new().unwrap();
    let config = test_configuration(member_id, bootstrap, &cache_dir);
    let db = MockDb::new();
    let handler: Arc<dyn ReplicationHandler> = Arc::clone(&db) as Arc<dyn ReplicationHandler>;
    let replicator = Replicator::connect(config, handler, stub).expect("node joins the cluster");
    TestNode {
        member_id,
        db,
        replicator,
        next_trx: AtomicU64::new(1),
        _cache_dir: cache_dir,
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub(crate) fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(25));
    }
}
