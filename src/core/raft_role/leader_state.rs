//! Leader-side state: per-follower replication progress, pending client
//! requests, watch registrations and the staging bookkeeping of an
//! in-flight configuration change.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::core::pending_requests::PendingRequests;
use crate::protocol::ClientReply;
use crate::protocol::ClientRequest;
use crate::protocol::LogIndex;
use crate::protocol::PeerId;
use crate::protocol::RaftPeer;
use crate::protocol::ReplicationLevel;
use crate::protocol::SetConfigurationRequest;
use crate::storage::TransactionContext;

/// Replication progress of one follower, shared with its appender task.
///
/// `next_index` starts at the leader's last log index + 1 and walks down on
/// inconsistency replies; `match_index` only ever grows.
pub struct FollowerProgress {
    pub peer: RaftPeer,
    next_index: AtomicU64,
    match_index: AtomicU64,
    /// False while the peer is only bootstrapping (staged by a
    /// configuration change, not yet voting).
    attend_vote: AtomicBool,
    last_response: Mutex<Instant>,
}

impl FollowerProgress {
    pub fn new(peer: RaftPeer, next_index: LogIndex, attend_vote: bool) -> Self {
        Self {
            peer,
            next_index: AtomicU64::new(next_index),
            match_index: AtomicU64::new(0),
            attend_vote: AtomicBool::new(attend_vote),
            last_response: Mutex::new(Instant::now()),
        }
    }

    pub fn next_index(&self) -> LogIndex {
        self.next_index.load(Ordering::Acquire)
    }

    pub fn set_next_index(&self, index: LogIndex) {
        self.next_index.store(index.max(1), Ordering::Release);
    }

    pub fn match_index(&self) -> LogIndex {
        self.match_index.load(Ordering::Acquire)
    }

    /// Raises the match index; stale replies cannot lower it.
    pub fn update_match_index(&self, index: LogIndex) {
        self.match_index.fetch_max(index, Ordering::AcqRel);
    }

    pub fn attend_vote(&self) -> bool {
        self.attend_vote.load(Ordering::Acquire)
    }

    pub fn promote_to_voting(&self) {
        self.attend_vote.store(true, Ordering::Release);
    }

    pub fn record_response(&self) {
        *self.last_response.lock().expect("appender clock poisoned") = Instant::now();
    }

    pub fn is_slow(&self, slowness_timeout: Duration) -> bool {
        self.last_response.lock().expect("appender clock poisoned").elapsed() >= slowness_timeout
    }
}

/// A client watch waiting for `index` to reach `level`.
pub struct WatchRequest {
    pub request: ClientRequest,
    pub index: LogIndex,
    pub level: ReplicationLevel,
    pub reply_tx: oneshot::Sender<ClientReply>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StagingPhase {
    /// New peers are being caught up before the joint conf is proposed.
    CatchingUp,
    /// The joint (old + new) entry is in the log, awaiting commit.
    Joint { joint_index: LogIndex },
    /// The final new-conf entry is in the log, awaiting commit.
    NewConf { conf_index: LogIndex },
}

/// Bookkeeping of one in-flight `set_configuration`.
pub struct StagingState {
    pub request: SetConfigurationRequest,
    pub new_peers: Vec<RaftPeer>,
    /// Log index at which staging started; a staged peer is caught up once
    /// its match index reaches it.
    pub start_index: LogIndex,
    pub phase: StagingPhase,
    pub reply_tx: oneshot::Sender<ClientReply>,
}

pub struct AppenderHandle {
    pub peer_id: PeerId,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

pub struct LeaderState {
    pending: PendingRequests,
    /// Leader-side transaction contexts by log index, reused by the apply
    /// loop for entries this leader originated.
    transactions: HashMap<LogIndex, TransactionContext>,
    watches: Vec<WatchRequest>,
    pub staging: Option<StagingState>,
    followers: HashMap<PeerId, Arc<FollowerProgress>>,
    appenders: Vec<AppenderHandle>,
    /// Set once the no-op entry of this term is committed; the leader
    /// serves reads and writes only from then on.
    ready: Arc<AtomicBool>,
    noop_index: LogIndex,
    replicate_notify: Arc<Notify>,
    stop_tx: watch::Sender<bool>,
    since: Instant,
}

impl LeaderState {
    pub fn new(noop_index: LogIndex) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            pending: PendingRequests::new(),
            transactions: HashMap::new(),
            watches: Vec::new(),
            staging: None,
            followers: HashMap::new(),
            appenders: Vec::new(),
            ready: Arc::new(AtomicBool::new(false)),
            noop_index,
            replicate_notify: Arc::new(Notify::new()),
            stop_tx,
            since: Instant::now(),
        }
    }

    pub fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn add_follower(&mut self, progress: Arc<FollowerProgress>, handle: JoinHandle<()>) {
        let peer_id = progress.peer.id.clone();
        self.followers.insert(peer_id.clone(), progress);
        self.appenders.push(AppenderHandle { peer_id, handle });
    }

    pub fn remove_follower(&mut self, peer_id: &PeerId) {
        self.followers.remove(peer_id);
        self.appenders.retain(|a| &a.peer_id != peer_id);
    }

    pub fn progress(&self, peer_id: &PeerId) -> Option<Arc<FollowerProgress>> {
        self.followers.get(peer_id).cloned()
    }

    pub fn followers(&self) -> impl Iterator<Item = &Arc<FollowerProgress>> {
        self.followers.values()
    }

    pub fn follower_ids(&self) -> Vec<PeerId> {
        self.followers.keys().cloned().collect()
    }

    pub fn match_index_of(&self, peer_id: &PeerId) -> LogIndex {
        self.followers.get(peer_id).map(|f| f.match_index()).unwrap_or(0)
    }

    pub fn noop_index(&self) -> LogIndex {
        self.noop_index
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Wakes every appender; called after new entries are appended.
    pub fn notify_senders(&self) {
        self.replicate_notify.notify_waiters();
    }

    pub fn replicate_notify(&self) -> Arc<Notify> {
        self.replicate_notify.clone()
    }

    pub fn add_pending_request(
        &mut self,
        index: LogIndex,
        request: ClientRequest,
        ctx: TransactionContext,
    ) -> oneshot::Receiver<ClientReply> {
        self.transactions.insert(index, ctx);
        self.pending.add(index, request)
    }

    /// Removes and returns the leader-side context for `index`.
    pub fn take_transaction(&mut self, index: LogIndex) -> Option<TransactionContext> {
        self.transactions.remove(&index)
    }

    pub fn reply_pending_request(&mut self, index: LogIndex, reply: ClientReply) {
        self.pending.reply(index, reply);
    }

    pub fn fail_pending_requests(
        &mut self,
        make_reply: impl FnMut(LogIndex, &ClientRequest) -> ClientReply,
    ) {
        self.transactions.clear();
        self.pending.fail_all(make_reply);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// A peer staged by a reconfiguration but not yet part of the conf.
    pub fn is_bootstrapping_peer(&self, peer_id: &PeerId) -> bool {
        self.followers
            .get(peer_id)
            .map(|f| !f.attend_vote())
            .unwrap_or(false)
    }

    pub fn add_watch(&mut self, watch: WatchRequest) {
        self.watches.push(watch);
    }

    /// (index, level) of every registered watch.
    pub fn watches_snapshot(&self) -> Vec<(LogIndex, ReplicationLevel)> {
        self.watches.iter().map(|w| (w.index, w.level)).collect()
    }

    /// Removes and returns every watch satisfying `pred`.
    pub fn take_watches_where(&mut self, mut pred: impl FnMut(&WatchRequest) -> bool) -> Vec<WatchRequest> {
        let mut satisfied = Vec::new();
        let mut remaining = Vec::new();
        for watch in self.watches.drain(..) {
            if pred(&watch) {
                satisfied.push(watch);
            } else {
                remaining.push(watch);
            }
        }
        self.watches = remaining;
        satisfied
    }

    pub fn take_all_watches(&mut self) -> Vec<WatchRequest> {
        std::mem::take(&mut self.watches)
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        self.replicate_notify.notify_waiters();
    }

    pub fn since(&self) -> Instant {
        self.since
    }
}
