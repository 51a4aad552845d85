//! Fixtures for testing the cluster core.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use maplit::btreeset;
use tokio::sync::mpsc;
use tokio::sync::RwLock;

use causal_raft::applier::ApplierHandle;
use causal_raft::config::Config;
use causal_raft::error::ReplicationError;
use causal_raft::handle::RaftHandle;
use causal_raft::log::RaftLog;
use causal_raft::message::Inbound;
use causal_raft::message::RaftMessage;
use causal_raft::metrics::CoreMetrics;
use causal_raft::metrics::Wait;
use causal_raft::node::RaftMember;
use causal_raft::operation::AppliedResult;
use causal_raft::operation::LogEntry;
use causal_raft::operation::ReplicatedContent;
use causal_raft::replicator::progress::ProgressTracker;
use causal_raft::replicator::Replicator;
use causal_raft::state_machines::NullTransactionApplier;
use causal_raft::storage::CoreSnapshot;
use causal_raft::storage::LogReader;
use causal_raft::storage::LogStore;
use causal_raft::storage::StableStore;
use causal_raft::storage::StateFlush;
use causal_raft::storage::VoteRecord;
use causal_raft::ClusterId;
use causal_raft::CoreEvent;
use causal_raft::LogId;
use causal_raft::MemberId;
use causal_raft::Outbound;
use causal_raft::State;
use causal_raft::StoreId;

/// Initialize the tracing system.
pub fn init_tracing() {
    use tracing_subscriber::prelude::*;
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A config tuned for fast test clusters.
pub fn test_config() -> Arc<Config> {
    Config::build("test".into())
        .election_timeout(300)
        .heartbeat_interval(50)
        .append_batch_delay(2)
        .replication_retry(20, 200, 10)
        .catchup_backoff(50, 500)
        .validate()
        .expect("failed to build config")
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An in-memory log store.
#[derive(Debug, Default)]
pub struct MemLogStore {
    inner: Mutex<MemLogInner>,
    append: AtomicU64,
    prev_index: AtomicU64,
    prev_term: AtomicU64,
}

#[derive(Debug, Default)]
struct MemLogInner {
    /// Entries for `(prev.index, append]`, in order.
    entries: Vec<LogEntry>,
    prev: LogId,
}

impl MemLogStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn locate(inner: &MemLogInner, index: u64) -> Option<usize> {
        index
            .checked_sub(inner.prev.index + 1)
            .map(|rel| rel as usize)
            .filter(|rel| *rel < inner.entries.len())
    }

    /// The full entry slice, for end-state assertions.
    pub fn all_entries(&self) -> Vec<LogEntry> {
        self.inner.lock().unwrap().entries.clone()
    }
}

#[async_trait]
impl LogStore for MemLogStore {
    type Reader = MemLogReader;

    async fn append(&self, entries: &[LogEntry]) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        for entry in entries {
            let expected = inner.prev.index + inner.entries.len() as u64 + 1;
            if entry.log_id.index != expected {
                return Err(anyhow!(
                    "append of {} does not follow the log at {}",
                    entry.log_id.index,
                    expected
                ));
            }
            inner.entries.push(entry.clone());
        }
        let append = inner.prev.index + inner.entries.len() as u64;
        self.append.store(append, Ordering::Release);
        Ok(append)
    }

    async fn truncate(&self, from_index: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if from_index <= inner.prev.index {
            return Err(anyhow!("truncate below the prune horizon"));
        }
        let keep = (from_index - inner.prev.index - 1) as usize;
        inner.entries.truncate(keep);
        let append = inner.prev.index + inner.entries.len() as u64;
        self.append.store(append, Ordering::Release);
        Ok(())
    }

    async fn prune(&self, up_to_index: u64) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let last = inner.prev.index + inner.entries.len() as u64;
        let horizon = up_to_index.min(last);
        while inner.prev.index < horizon {
            let entry = inner.entries.remove(0);
            inner.prev = entry.log_id;
        }
        self.prev_index.store(inner.prev.index, Ordering::Release);
        self.prev_term.store(inner.prev.term, Ordering::Release);
        Ok(inner.prev.index)
    }

    async fn reset(&self, prev: LogId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.prev = prev;
        self.append.store(prev.index, Ordering::Release);
        self.prev_index.store(prev.index, Ordering::Release);
        self.prev_term.store(prev.term, Ordering::Release);
        Ok(())
    }

    async fn entry(&self, index: u64) -> Result<Option<LogEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::locate(&inner, index).map(|rel| inner.entries[rel].clone()))
    }

    async fn entries(&self, from: u64, to_exclusive: u64) -> Result<Vec<LogEntry>> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for index in from..to_exclusive {
            match Self::locate(&inner, index) {
                Some(rel) => out.push(inner.entries[rel].clone()),
                None => break,
            }
        }
        Ok(out)
    }

    async fn entry_term(&self, index: u64) -> Result<Option<u64>> {
        let inner = self.inner.lock().unwrap();
        if index == inner.prev.index {
            return Ok(Some(inner.prev.term));
        }
        Ok(Self::locate(&inner, index).map(|rel| inner.entries[rel].log_id.term))
    }

    async fn reader(&self, from: u64) -> Result<MemLogReader> {
        let inner = self.inner.lock().unwrap();
        let entries = inner
            .entries
            .iter()
            .filter(|e| e.log_id.index >= from)
            .cloned()
            .collect();
        Ok(MemLogReader { entries, pos: 0 })
    }

    fn append_index(&self) -> u64 {
        self.append.load(Ordering::Acquire)
    }

    fn prev_index(&self) -> u64 {
        self.prev_index.load(Ordering::Acquire)
    }

    fn prev_term(&self) -> u64 {
        self.prev_term.load(Ordering::Acquire)
    }
}

pub struct MemLogReader {
    entries: Vec<LogEntry>,
    pos: usize,
}

#[async_trait]
impl LogReader for MemLogReader {
    async fn next_entry(&mut self) -> Result<Option<LogEntry>> {
        let entry = self.entries.get(self.pos).cloned();
        self.pos += 1;
        Ok(entry)
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// In-memory stable storage with a fixed member identity.
pub struct MemStable {
    member: MemberId,
    store: StoreId,
    vote: Mutex<VoteRecord>,
    cluster: Mutex<Option<ClusterId>>,
}

impl MemStable {
    pub fn new(member: MemberId, store: StoreId) -> Arc<Self> {
        Arc::new(Self {
            member,
            store,
            vote: Mutex::new(VoteRecord::default()),
            cluster: Mutex::new(None),
        })
    }

    pub fn read_vote_record(&self) -> VoteRecord {
        self.vote.lock().unwrap().clone()
    }
}

#[async_trait]
impl StableStore for MemStable {
    async fn save_vote(&self, vote: &VoteRecord) -> Result<()> {
        *self.vote.lock().unwrap() = vote.clone();
        Ok(())
    }

    async fn read_vote(&self) -> Result<VoteRecord> {
        Ok(self.vote.lock().unwrap().clone())
    }

    async fn member_id(&self) -> Result<MemberId> {
        Ok(self.member)
    }

    async fn cluster_id(&self) -> Result<Option<ClusterId>> {
        Ok(*self.cluster.lock().unwrap())
    }

    async fn bind_cluster(&self, cluster: ClusterId) -> Result<()> {
        *self.cluster.lock().unwrap() = Some(cluster);
        Ok(())
    }

    async fn store_id(&self) -> Result<StoreId> {
        Ok(self.store)
    }
}

/// In-memory flushed-state storage.
#[derive(Default)]
pub struct MemFlush {
    snapshot: Mutex<Option<CoreSnapshot>>,
}

impl MemFlush {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl StateFlush for MemFlush {
    async fn flush(&self, snapshot: &CoreSnapshot) -> Result<()> {
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }

    async fn read(&self) -> Result<Option<CoreSnapshot>> {
        Ok(self.snapshot.lock().unwrap().clone())
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The durable pieces of one node, kept so the node can be restarted.
#[derive(Clone)]
pub struct NodeStores {
    pub log: Arc<MemLogStore>,
    pub stable: Arc<MemStable>,
    pub flush: Arc<MemFlush>,
}

/// One running node in the router.
pub struct Node {
    pub raft: RaftHandle,
    pub replicator: Arc<Replicator>,
    pub applier: ApplierHandle,
    pub progress: Arc<ProgressTracker>,
    pub log: Arc<RaftLog<MemLogStore>>,
    pub stores: NodeStores,
    pub rx_events: Mutex<Option<mpsc::UnboundedReceiver<CoreEvent>>>,
}

/// A type which emulates a network transport between in-process members.
pub struct RaftRouter {
    config: Arc<Config>,
    store_id: StoreId,
    members: BTreeSet<MemberId>,
    table: RwLock<BTreeMap<MemberId, Arc<Node>>>,
    /// Nodes which can neither send nor receive messages.
    isolated: std::sync::RwLock<HashSet<MemberId>>,
}

impl RaftRouter {
    pub fn new(config: Arc<Config>, member_count: u128) -> Arc<Self> {
        let members = (0..member_count).map(MemberId::from_u128).collect();
        Arc::new(Self {
            config,
            store_id: StoreId::random(),
            members,
            table: RwLock::new(BTreeMap::new()),
            isolated: std::sync::RwLock::new(HashSet::new()),
        })
    }

    pub fn member_ids(&self) -> BTreeSet<MemberId> {
        self.members.clone()
    }

    /// Create and register a new node bearing the given ID.
    pub async fn new_raft_node(self: &Arc<Self>, id: u128) -> Result<()> {
        let member = MemberId::from_u128(id);
        let stores = NodeStores {
            log: MemLogStore::new(),
            stable: MemStable::new(member, self.store_id),
            flush: MemFlush::new(),
        };
        self.start_node(member, stores).await
    }

    /// Start (or restart) a node from its durable stores.
    pub async fn start_node(self: &Arc<Self>, member: MemberId, stores: NodeStores) -> Result<()> {
        let network = Arc::new(RouterHandle {
            router: self.clone(),
            me: member,
        });
        let assembled = RaftMember::assemble(
            self.config.clone(),
            stores.log.clone(),
            stores.stable.clone(),
            stores.flush.clone(),
            Box::new(NullTransactionApplier::default()),
            network,
            self.members.clone(),
        )
        .await?;

        let RaftMember {
            id: _,
            raft,
            replicator,
            applier,
            progress,
            log,
            rx_events,
        } = assembled;

        let node = Arc::new(Node {
            raft,
            replicator,
            applier,
            progress,
            log,
            stores,
            rx_events: Mutex::new(Some(rx_events)),
        });
        self.table.write().await.insert(member, node);
        Ok(())
    }

    /// Stop a node, keeping its durable stores for a later restart.
    pub async fn stop_node(&self, id: u128) -> Result<NodeStores> {
        let member = MemberId::from_u128(id);
        let node = self
            .table
            .write()
            .await
            .remove(&member)
            .with_context(|| format!("node {} not found", member))?;
        node.raft.shutdown().await?;
        Ok(node.stores.clone())
    }

    pub async fn node(&self, id: u128) -> Arc<Node> {
        let member = MemberId::from_u128(id);
        self.table
            .read()
            .await
            .get(&member)
            .cloned()
            .unwrap_or_else(|| panic!("node {} does not exist in the routing table", member))
    }

    /// Initialize the cluster from the given node.
    pub async fn initialize(&self, id: u128) -> Result<()> {
        let node = self.node(id).await;
        node.raft.initialize(self.members.clone()).await?;
        Ok(())
    }

    /// Isolate the network of the specified node.
    pub fn isolate_node(&self, id: u128) {
        self.isolated.write().unwrap().insert(MemberId::from_u128(id));
    }

    /// Restore the network of the specified node.
    pub fn restore_node(&self, id: u128) {
        self.isolated.write().unwrap().remove(&MemberId::from_u128(id));
    }

    fn is_isolated(&self, member: MemberId) -> bool {
        self.isolated.read().unwrap().contains(&member)
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<CoreMetrics> {
        let table = self.table.read().await;
        table.values().map(|node| node.raft.metrics().borrow().clone()).collect()
    }

    /// Get the ID of the current leader, ignoring isolated nodes.
    pub async fn leader(&self) -> Option<MemberId> {
        self.latest_metrics().await.into_iter().find_map(|m| {
            if m.state == State::Leader && !self.is_isolated(m.id) {
                Some(m.id)
            } else {
                None
            }
        })
    }

    pub async fn wait(&self, id: u128, timeout: Option<Duration>) -> Wait {
        let node = self.node(id).await;
        node.raft.wait(timeout.or(Some(Duration::from_secs(10))))
    }

    /// Wait for the given nodes to hold and apply the log up to
    /// `want_log`.
    pub async fn wait_for_log(&self, node_ids: &BTreeSet<u128>, want_log: u64, msg: &str) -> Result<()> {
        for id in node_ids {
            self.wait(*id, None).await.log(want_log, msg).await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to assume a state.
    pub async fn wait_for_state(&self, node_ids: &BTreeSet<u128>, want: State, msg: &str) -> Result<()> {
        for id in node_ids {
            self.wait(*id, None).await.state(want, msg).await?;
        }
        Ok(())
    }

    /// Wait until some non-isolated node is leader, returning it.
    pub async fn wait_for_leader(&self) -> Result<MemberId> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("no leader emerged"));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Replicate a content value through the target node's replicator.
    pub async fn replicate(
        &self,
        target: u128,
        content: ReplicatedContent,
    ) -> Result<AppliedResult, ReplicationError> {
        let node = self.node(target).await;
        node.replicator.replicate(content, true).await
    }

    /// Send `count` dummy operations through the target's replicator,
    /// panicking on error.
    pub async fn replicate_many(&self, target: u128, count: usize) {
        let node = self.node(target).await;
        for _ in 0..count {
            if let Err(err) = node.replicator.replicate(ReplicatedContent::Dummy { size: 16 }, true).await {
                panic!("replication failed: {:?}", err);
            }
        }
    }

    /// Assert that all non-isolated nodes agree on leader, term, log and
    /// applied position.
    pub async fn assert_stable_cluster(&self) {
        let metrics: Vec<_> = self
            .latest_metrics()
            .await
            .into_iter()
            .filter(|m| !self.is_isolated(m.id))
            .collect();
        let leader = metrics
            .iter()
            .find(|m| m.state == State::Leader)
            .expect("expected a cluster leader");

        for m in &metrics {
            assert_eq!(
                m.current_leader,
                Some(leader.id),
                "node {} sees leader {:?}, expected {}",
                m.id,
                m.current_leader,
                leader.id
            );
            assert_eq!(m.current_term, leader.current_term, "term mismatch on {}", m.id);
            assert_eq!(
                m.last_log_index, leader.last_log_index,
                "log mismatch on {}",
                m.id
            );
            assert_eq!(
                m.last_applied, leader.last_log_index,
                "apply lag on {}",
                m.id
            );
        }
    }

    /// Assert that the given nodes hold byte-identical logs.
    pub async fn assert_logs_match(&self, node_ids: &BTreeSet<u128>) {
        let mut reference: Option<(u128, Vec<LogEntry>)> = None;
        for id in node_ids {
            let node = self.node(*id).await;
            let entries = node.stores.log.all_entries();
            match &reference {
                None => reference = Some((*id, entries)),
                Some((ref_id, ref_entries)) => {
                    let min = ref_entries.len().min(entries.len());
                    // Compare the shared suffix above each node's prune
                    // horizon.
                    let a = &ref_entries[ref_entries.len() - min..];
                    let b = &entries[entries.len() - min..];
                    assert_eq!(a, b, "logs of nodes {} and {} diverge", ref_id, id);
                }
            }
        }
    }
}

/// The per-node sending side of the router.
pub struct RouterHandle {
    router: Arc<RaftRouter>,
    me: MemberId,
}

#[async_trait]
impl Outbound for RouterHandle {
    async fn send(&self, target: MemberId, message: RaftMessage) -> Result<()> {
        if self.router.is_isolated(self.me) || self.router.is_isolated(target) {
            return Err(anyhow!("target node is isolated"));
        }
        let node = {
            let table = self.router.table.read().await;
            table.get(&target).cloned()
        };
        let node = node.ok_or_else(|| anyhow!("node {} not found in routing table", target))?;
        node.raft
            .inbound(Inbound::new(self.me, message))
            .map_err(|_| anyhow!("node {} is shutting down", target))
    }
}

/// Decode a state machine blob out of a snapshot for assertions.
pub fn snapshot_blob(snapshot: &CoreSnapshot, kind: u8) -> Bytes {
    snapshot
        .app_states
        .get(&kind)
        .cloned()
        .unwrap_or_else(|| panic!("snapshot misses state blob {}", kind))
}

pub fn member(id: u128) -> MemberId {
    MemberId::from_u128(id)
}

pub fn ids(range: std::ops::Range<u128>) -> BTreeSet<u128> {
    range.collect()
}

pub fn all3() -> BTreeSet<u128> {
    btreeset![0, 1, 2]
}
