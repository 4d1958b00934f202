//! In-memory collaborators and a loopback multi-core harness for tests.
//! Several cores run in one process wired through [`LoopbackHub`]; there is
//! no global state, so tests stay independent.

use std::ops::RangeInclusive;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::DashSet;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::protocol::AppendEntriesReply;
use crate::protocol::AppendEntriesRequest;
use crate::protocol::ClientId;
use crate::protocol::ClientRequest;
use crate::protocol::GroupId;
use crate::protocol::InstallSnapshotReply;
use crate::protocol::InstallSnapshotRequest;
use crate::protocol::LogEntry;
use crate::protocol::LogIndex;
use crate::protocol::PeerId;
use crate::protocol::RaftPeer;
use crate::protocol::RaftRoleName;
use crate::protocol::RequestKind;
use crate::protocol::RequestVoteReply;
use crate::protocol::RequestVoteRequest;
use crate::protocol::SnapshotChunk;
use crate::protocol::Term;
use crate::protocol::TermIndex;
use crate::storage::AppendReceipt;
use crate::storage::MetadataStore;
use crate::storage::PersistedMetadata;
use crate::storage::RaftLog;
use crate::storage::StateMachine;
use crate::storage::TransactionContext;
use crate::RaftConfig;
use crate::RaftGroup;
use crate::Result;
use crate::ServerConfig;
use crate::ServerCore;
use crate::StateMachineError;
use crate::Transport;
use crate::TransportError;
use crate::TypeConfig;

//--------------------------------------------------------------------------
// In-memory raft log
//--------------------------------------------------------------------------

pub struct MemRaftLog {
    entries: Mutex<Vec<LogEntry>>,
    start_index: AtomicU64,
    committed: AtomicU64,
}

impl MemRaftLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            start_index: AtomicU64::new(1),
            committed: AtomicU64::new(0),
        }
    }

    /// A log whose prefix was compacted into a snapshot ending at
    /// `snapshot_index`.
    pub fn compacted_at(snapshot_index: LogIndex) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            start_index: AtomicU64::new(snapshot_index + 1),
            committed: AtomicU64::new(snapshot_index),
        }
    }

    pub fn seed(&self, entries: Vec<LogEntry>) {
        *self.entries.lock().unwrap() = entries;
    }

    pub fn all_entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        let start = self.start_index.load(Ordering::Acquire);
        if index < start {
            return None;
        }
        Some((index - start) as usize)
    }
}

impl Default for MemRaftLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftLog for MemRaftLog {
    fn start_index(&self) -> LogIndex {
        self.start_index.load(Ordering::Acquire)
    }

    fn next_index(&self) -> LogIndex {
        let entries = self.entries.lock().unwrap();
        self.start_index.load(Ordering::Acquire) + entries.len() as u64
    }

    fn last_entry(&self) -> Option<TermIndex> {
        self.entries.lock().unwrap().last().map(|e| e.term_index())
    }

    fn get(&self, index: LogIndex) -> Option<LogEntry> {
        let pos = self.position(index)?;
        self.entries.lock().unwrap().get(pos).cloned()
    }

    fn get_range(&self, range: RangeInclusive<LogIndex>) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|e| range.contains(&e.index))
            .cloned()
            .collect()
    }

    fn contains(&self, term_index: TermIndex) -> bool {
        self.get(term_index.index)
            .map(|e| e.term == term_index.term)
            .unwrap_or(false)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.get(index).map(|e| e.term)
    }

    fn append(&self, new_entries: Vec<LogEntry>) -> Vec<AppendReceipt> {
        let mut receipts = Vec::with_capacity(new_entries.len());
        let mut entries = self.entries.lock().unwrap();
        let start = self.start_index.load(Ordering::Acquire);

        for entry in new_entries {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Ok(()));
            receipts.push(rx);

            // entries at or below a freshly installed snapshot are gone
            if entry.index < start {
                continue;
            }
            let pos = (entry.index - start) as usize;
            if pos < entries.len() {
                if entries[pos].term != entry.term {
                    // conflicting suffix goes away (Section 5.3)
                    entries.truncate(pos);
                    entries.push(entry);
                }
            } else {
                entries.push(entry);
            }
        }
        receipts
    }

    fn last_committed_index(&self) -> LogIndex {
        self.committed.load(Ordering::Acquire)
    }

    fn update_last_committed_index(&self, index: LogIndex) -> Result<()> {
        self.committed.fetch_max(index, Ordering::AcqRel);
        Ok(())
    }

    fn reset_to_snapshot(&self, snapshot: TermIndex) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.clear();
        self.start_index.store(snapshot.index + 1, Ordering::Release);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

//--------------------------------------------------------------------------
// In-memory state machine
//--------------------------------------------------------------------------

pub struct MemStateMachine {
    applied: Mutex<Vec<(ClientId, u64, Vec<u8>)>>,
    last_applied: AtomicU64,
    latest_snapshot: Mutex<Option<TermIndex>>,
    paused: AtomicBool,
    chunks: Mutex<Vec<SnapshotChunk>>,
    install_notifications: AtomicU64,
    /// When set, `start_transaction` rejects everything with this reason.
    reject_transactions: Mutex<Option<String>>,
    /// When set, staged contexts carry this exception into the pre-append
    /// stage.
    stage_exception: Mutex<Option<String>>,
}

impl MemStateMachine {
    pub fn new() -> Self {
        Self {
            applied: Mutex::new(Vec::new()),
            last_applied: AtomicU64::new(0),
            latest_snapshot: Mutex::new(None),
            paused: AtomicBool::new(false),
            chunks: Mutex::new(Vec::new()),
            install_notifications: AtomicU64::new(0),
            reject_transactions: Mutex::new(None),
            stage_exception: Mutex::new(None),
        }
    }

    /// A machine restored from a snapshot ending at `snapshot`.
    pub fn with_snapshot(snapshot: TermIndex) -> Self {
        let sm = Self::new();
        *sm.latest_snapshot.lock().unwrap() = Some(snapshot);
        sm.last_applied.store(snapshot.index, Ordering::Release);
        sm
    }

    pub fn apply_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    pub fn apply_count_for(&self, client_id: &ClientId, call_id: u64) -> usize {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, call, _)| c == client_id && *call == call_id)
            .count()
    }

    pub fn install_notification_count(&self) -> u64 {
        self.install_notifications.load(Ordering::Acquire)
    }

    pub fn reject_transactions_with(&self, reason: &str) {
        *self.reject_transactions.lock().unwrap() = Some(reason.to_string());
    }

    pub fn stage_exception_with(&self, reason: &str) {
        *self.stage_exception.lock().unwrap() = Some(reason.to_string());
    }
}

impl Default for MemStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateMachine for MemStateMachine {
    fn start_transaction(&self, request: &ClientRequest) -> Result<TransactionContext> {
        if let Some(reason) = self.reject_transactions.lock().unwrap().clone() {
            return Err(StateMachineError::TransactionRejected(reason).into());
        }
        match &request.kind {
            RequestKind::Write { data } => {
                let mut ctx = TransactionContext::new(
                    request.client_id.clone(),
                    request.call_id,
                    data.clone(),
                );
                ctx.exception = self.stage_exception.lock().unwrap().clone();
                Ok(ctx)
            }
            _ => Err(StateMachineError::TransactionRejected("not a write".to_string()).into()),
        }
    }

    fn apply_transaction_serial(&self, ctx: TransactionContext) -> Result<TransactionContext> {
        Ok(ctx)
    }

    async fn apply_transaction(&self, ctx: TransactionContext) -> Result<Vec<u8>> {
        self.applied
            .lock()
            .unwrap()
            .push((ctx.client_id.clone(), ctx.call_id, ctx.data.clone()));
        self.last_applied.fetch_max(ctx.log_index(), Ordering::AcqRel);
        Ok(ctx.data)
    }

    async fn query(&self, query: Vec<u8>) -> Result<Vec<u8>> {
        Ok(query)
    }

    async fn query_stale(&self, query: Vec<u8>, _min_index: LogIndex) -> Result<Vec<u8>> {
        Ok(query)
    }

    fn notify_index_update(&self, _term: Term, index: LogIndex) {
        self.last_applied.fetch_max(index, Ordering::AcqRel);
    }

    async fn notify_install_snapshot_from_leader(&self, first_available: TermIndex) -> Result<TermIndex> {
        self.install_notifications.fetch_add(1, Ordering::AcqRel);
        *self.latest_snapshot.lock().unwrap() = Some(first_available);
        self.last_applied.fetch_max(first_available.index, Ordering::AcqRel);
        Ok(first_available)
    }

    fn install_snapshot_chunk(&self, chunk: &SnapshotChunk) -> Result<()> {
        self.chunks.lock().unwrap().push(chunk.clone());
        Ok(())
    }

    fn notify_extended_no_leader(&self, _group_id: &GroupId, _role: RaftRoleName) {}

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn reload(&self, snapshot: TermIndex) -> Result<()> {
        *self.latest_snapshot.lock().unwrap() = Some(snapshot);
        self.last_applied.fetch_max(snapshot.index, Ordering::AcqRel);
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    fn latest_snapshot(&self) -> Option<TermIndex> {
        *self.latest_snapshot.lock().unwrap()
    }

    fn last_applied(&self) -> LogIndex {
        self.last_applied.load(Ordering::Acquire)
    }
}

//--------------------------------------------------------------------------
// In-memory metadata store
//--------------------------------------------------------------------------

#[derive(Default)]
pub struct MemMetadataStore {
    metadata: Mutex<Option<PersistedMetadata>>,
    saves: AtomicU64,
}

impl MemMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Acquire)
    }
}

impl MetadataStore for MemMetadataStore {
    fn load(&self) -> Result<Option<PersistedMetadata>> {
        Ok(self.metadata.lock().unwrap().clone())
    }

    fn save(&self, metadata: &PersistedMetadata) -> Result<()> {
        *self.metadata.lock().unwrap() = Some(metadata.clone());
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

//--------------------------------------------------------------------------
// Loopback transport
//--------------------------------------------------------------------------

/// Routes RPCs between cores registered in the same process. Blocking a
/// peer cuts it off in both directions, which is how tests partition.
pub struct LoopbackHub {
    cores: DashMap<PeerId, Arc<ServerCore<TestTypeConfig>>>,
    blocked: DashSet<PeerId>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cores: DashMap::new(),
            blocked: DashSet::new(),
        })
    }

    pub fn register(&self, id: PeerId, core: Arc<ServerCore<TestTypeConfig>>) {
        self.cores.insert(id, core);
    }

    pub fn block(&self, id: &PeerId) {
        self.blocked.insert(id.clone());
    }

    pub fn unblock(&self, id: &PeerId) {
        self.blocked.remove(id);
    }

    fn route(&self, from: &PeerId, to: &PeerId) -> Result<Arc<ServerCore<TestTypeConfig>>> {
        if self.blocked.contains(from) || self.blocked.contains(to) {
            return Err(TransportError::Unreachable(to.to_string()).into());
        }
        self.cores
            .get(to)
            .map(|c| c.value().clone())
            .ok_or_else(|| TransportError::Unreachable(to.to_string()).into())
    }
}

pub struct LoopbackTransport {
    local: PeerId,
    hub: Arc<LoopbackHub>,
}

impl LoopbackTransport {
    pub fn new(local: PeerId, hub: Arc<LoopbackHub>) -> Self {
        Self { local, hub }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send_request_vote(&self, target: &RaftPeer, request: RequestVoteRequest) -> Result<RequestVoteReply> {
        let core = self.hub.route(&self.local, &target.id)?;
        core.handle_request_vote(request).await
    }

    async fn send_append_entries(
        &self,
        target: &RaftPeer,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply> {
        let core = self.hub.route(&self.local, &target.id)?;
        core.handle_append_entries(request).await
    }

    async fn send_install_snapshot(
        &self,
        target: &RaftPeer,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotReply> {
        let core = self.hub.route(&self.local, &target.id)?;
        core.handle_install_snapshot(request).await
    }

    fn add_peers(&self, _peers: Vec<RaftPeer>) {}

    fn local_address(&self) -> String {
        format!("loopback://{}", self.local)
    }
}

//--------------------------------------------------------------------------
// Test type config and node builders
//--------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TestTypeConfig;

impl TypeConfig for TestTypeConfig {
    type R = MemRaftLog;
    type TR = LoopbackTransport;
    type SM = MemStateMachine;
    type MS = MemMetadataStore;
}

pub struct TestNode {
    pub id: PeerId,
    pub core: Arc<ServerCore<TestTypeConfig>>,
    pub raft_log: Arc<MemRaftLog>,
    pub state_machine: Arc<MemStateMachine>,
    pub metadata: Arc<MemMetadataStore>,
}

pub const TEST_GROUP: &str = "test-group";

/// Fast timeouts so election tests finish quickly.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        raft: RaftConfig {
            election_timeout_min_ms: 100,
            election_timeout_max_ms: 200,
            heartbeat_interval_ms: 30,
            rpc_timeout_ms: 150,
            install_snapshot_timeout_ms: 2_000,
            ..RaftConfig::default()
        },
        ..ServerConfig::default()
    }
}

/// Election timeouts far beyond any test's runtime, for tests that drive
/// the RPC handlers directly and must not race a background election.
pub fn slow_config() -> ServerConfig {
    ServerConfig {
        raft: RaftConfig {
            election_timeout_min_ms: 60_000,
            election_timeout_max_ms: 120_000,
            heartbeat_interval_ms: 30,
            rpc_timeout_ms: 150,
            ..RaftConfig::default()
        },
        ..ServerConfig::default()
    }
}

pub fn test_peers(ids: &[&str]) -> Vec<RaftPeer> {
    ids.iter().map(|id| RaftPeer::new(*id, format!("mem://{id}"))).collect()
}

pub fn build_node(id: &str, peer_ids: &[&str], hub: &Arc<LoopbackHub>, config: ServerConfig) -> TestNode {
    build_node_with(
        id,
        peer_ids,
        hub,
        config,
        Arc::new(MemRaftLog::new()),
        Arc::new(MemStateMachine::new()),
    )
}

pub fn build_node_with(
    id: &str,
    peer_ids: &[&str],
    hub: &Arc<LoopbackHub>,
    config: ServerConfig,
    raft_log: Arc<MemRaftLog>,
    state_machine: Arc<MemStateMachine>,
) -> TestNode {
    let peer_id = PeerId::new(id);
    let metadata = Arc::new(MemMetadataStore::new());
    let transport = Arc::new(LoopbackTransport::new(peer_id.clone(), hub.clone()));
    let group = RaftGroup {
        group_id: GroupId::new(TEST_GROUP),
        peers: test_peers(peer_ids),
    };
    let core = ServerCore::<TestTypeConfig>::new(
        peer_id.clone(),
        group,
        raft_log.clone(),
        state_machine.clone(),
        transport,
        metadata.clone(),
        Arc::new(config),
    )
    .expect("core builds");
    hub.register(peer_id.clone(), core.clone());
    TestNode {
        id: peer_id,
        core,
        raft_log,
        state_machine,
        metadata,
    }
}

/// Starts every node and waits for a single leader to emerge.
pub async fn wait_for_leader(nodes: &[TestNode], deadline: Duration) -> Option<PeerId> {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        let leaders: Vec<&TestNode> = nodes.iter().filter(|n| n.core.is_leader()).collect();
        if leaders.len() == 1 {
            return Some(leaders[0].id.clone());
        }
        sleep(Duration::from_millis(10)).await;
    }
    None
}

/// Waits until `pred` holds or the deadline passes.
pub async fn wait_until(deadline: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if pred() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

pub fn write_request(client: &str, call_id: u64, payload: &[u8]) -> ClientRequest {
    ClientRequest::write(client, call_id, TEST_GROUP, payload.to_vec())
}
