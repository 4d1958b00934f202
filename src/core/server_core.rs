//! The per-peer consensus engine: owns the role state machine, the
//! persisted election metadata, the client bookkeeping and the three
//! inbound RPC handlers, and drives role transitions.
//!
//! One peer-wide mutex (`inner`) serializes role transitions, the decision
//! sections of the RPC handlers, all volatile `ServerState` mutation and
//! pending-request enqueues. The mutex is never held across an await; log
//! durability, state-machine futures and outbound RPCs complete outside it
//! and re-acquire it in their continuations.

use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;

use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio::time::sleep_until;
use tokio::time::timeout;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::alias::MSOF;
use crate::alias::ROF;
use crate::alias::SMOF;
use crate::alias::TROF;
use crate::constants::ASYNC_INSTALL_CHUNK_INDEX;
use crate::core::apply;
use crate::core::commit_info::CommitInfoCache;
use crate::core::election_timer::ElectionTimer;
use crate::core::lifecycle::LifeCycle;
use crate::core::lifecycle::LifeCycleState;
use crate::core::raft_role::CandidateState;
use crate::core::raft_role::FollowerProgress;
use crate::core::raft_role::FollowerShared;
use crate::core::raft_role::FollowerState;
use crate::core::raft_role::LastRpcUpdate;
use crate::core::raft_role::LeaderState;
use crate::core::raft_role::RaftRole;
use crate::core::raft_role::StagingPhase;
use crate::core::raft_role::StagingState;
use crate::core::raft_role::WatchRequest;
use crate::core::retry_cache::CacheEntry;
use crate::core::retry_cache::RetryCache;
use crate::core::server_state::ServerState;
use crate::membership::RaftConfiguration;
use crate::metrics::RETRY_CACHE_HITS_METRIC;
use crate::metrics::ROLE_TRANSITIONS_METRIC;
use crate::metrics::SERVER_ROLE_METRIC;
use crate::metrics::VOTES_GRANTED_METRIC;
use crate::protocol::AppendEntriesReply;
use crate::protocol::AppendEntriesRequest;
use crate::protocol::AppendResult;
use crate::protocol::ClientReply;
use crate::protocol::ClientRequest;
use crate::protocol::CommitInfo;
use crate::protocol::ConfPayload;
use crate::protocol::EntryPayload;
use crate::protocol::GroupId;
use crate::protocol::GroupInfo;
use crate::protocol::InstallSnapshotReply;
use crate::protocol::InstallSnapshotRequest;
use crate::protocol::InstallSnapshotResult;
use crate::protocol::LogEntry;
use crate::protocol::LogIndex;
use crate::protocol::PeerId;
use crate::protocol::RaftPeer;
use crate::protocol::RaftRoleName;
use crate::protocol::ReplicationLevel;
use crate::protocol::ReplyException;
use crate::protocol::RequestKind;
use crate::protocol::RequestVoteReply;
use crate::protocol::RequestVoteRequest;
use crate::protocol::SetConfigurationRequest;
use crate::protocol::SnapshotChunk;
use crate::protocol::SnapshotRequestKind;
use crate::protocol::Term;
use crate::protocol::TermIndex;
use crate::storage::RaftLog;
use crate::storage::StateMachine;
use crate::storage::TransactionContext;
use crate::ClientError;
use crate::Error;
use crate::ReplicationError;
use crate::Result;
use crate::ServerConfig;
use crate::SnapshotError;
use crate::Transport;
use crate::TypeConfig;

/// The group one core participates in.
#[derive(Clone, Debug)]
pub struct RaftGroup {
    pub group_id: GroupId,
    pub peers: Vec<RaftPeer>,
}

pub(crate) struct CoreMutable<T: TypeConfig> {
    pub(crate) state: ServerState<T>,
    pub(crate) role: RaftRole,
}

pub struct ServerCore<T: TypeConfig> {
    pub(crate) id: PeerId,
    pub(crate) group_id: GroupId,
    pub(crate) node_config: Arc<ServerConfig>,
    pub(crate) lifecycle: LifeCycle,

    /// The peer mutex.
    pub(crate) inner: Mutex<CoreMutable<T>>,

    pub(crate) raft_log: Arc<ROF<T>>,
    pub(crate) state_machine: Arc<SMOF<T>>,
    pub(crate) transport: Arc<TROF<T>>,

    pub(crate) retry_cache: RetryCache,
    pub(crate) commit_info_cache: CommitInfoCache,

    /// At most one state-machine snapshot install outstanding.
    pub(crate) in_progress_install_snapshot: Mutex<Option<TermIndex>>,

    pub(crate) apply_notify: Arc<Notify>,
    /// Frontier of the apply loop.
    pub(crate) last_applied: AtomicU64,

    pub(crate) shutdown_tx: watch::Sender<bool>,
}

impl<T: TypeConfig> ServerCore<T> {
    pub fn new(
        id: PeerId,
        group: RaftGroup,
        raft_log: Arc<ROF<T>>,
        state_machine: Arc<SMOF<T>>,
        transport: Arc<TROF<T>>,
        metadata_store: Arc<MSOF<T>>,
        node_config: Arc<ServerConfig>,
    ) -> Result<Arc<Self>> {
        node_config.validate()?;
        info!("[{}] new consensus core for group {}", id, group.group_id);

        transport.add_peers(group.peers.clone());
        let conf = RaftConfiguration::new(group.peers);
        let state = ServerState::new(
            id.clone(),
            group.group_id.clone(),
            conf,
            raft_log.clone(),
            state_machine.clone(),
            metadata_store,
        )?;

        let last_applied = state_machine.last_applied().max(state.snapshot_index());
        let (shutdown_tx, _) = watch::channel(false);
        let retry_cache = RetryCache::new(
            node_config.retry_cache.expiry(),
            node_config.retry_cache.capacity,
        );

        Ok(Arc::new(Self {
            lifecycle: LifeCycle::new(id.as_str()),
            id,
            group_id: group.group_id,
            node_config,
            inner: Mutex::new(CoreMutable {
                state,
                role: RaftRole::Follower(FollowerState::new()),
            }),
            raft_log,
            state_machine,
            transport,
            retry_cache,
            commit_info_cache: CommitInfoCache::new(),
            in_progress_install_snapshot: Mutex::new(None),
            apply_notify: Arc::new(Notify::new()),
            last_applied: AtomicU64::new(last_applied),
            shutdown_tx,
        }))
    }

    /// NEW → STARTING → RUNNING. A peer that is part of the configuration
    /// starts as a monitored follower; a peer outside it stays in STARTING
    /// until the leader's first non-initializing AppendEntries arrives.
    /// Returns false on duplicate start.
    pub fn start(self: &Arc<Self>) -> Result<bool> {
        if !self
            .lifecycle
            .compare_and_transition(LifeCycleState::New, LifeCycleState::Starting)
        {
            return Ok(false);
        }
        info!("[{}] start group {}", self.id, self.group_id);

        let in_conf = {
            let inner = self.lock_inner();
            inner.state.conf().contains(&self.id)
        };

        if in_conf {
            debug!("[{}] starts as a follower", self.id);
            let follower = self.new_follower_state(true);
            {
                let mut inner = self.lock_inner();
                inner.role = RaftRole::Follower(follower);
            }
            self.lifecycle
                .compare_and_transition(LifeCycleState::Starting, LifeCycleState::Running);
        } else {
            debug!("[{}] starts with initializing state", self.id);
            let mut inner = self.lock_inner();
            inner.role = RaftRole::Follower(FollowerState::new());
        }
        self.record_role_metrics(RaftRoleName::Follower);

        // apply loop lives for the whole core lifetime
        let weak = Arc::downgrade(self);
        let notify = self.apply_notify.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(apply::run_apply_loop(weak, notify, shutdown_rx));

        Ok(true)
    }

    /// RUNNING → CLOSING → CLOSED. Workers stop at their next safe point;
    /// outstanding pending requests resolve with NotLeader before the
    /// leader state is dropped.
    pub fn shutdown(&self) {
        let current = self.lifecycle.current();
        if current == LifeCycleState::New {
            let _ = self.lifecycle.transition(LifeCycleState::Closed);
            return;
        }
        if current.is_closing_or_closed() {
            return;
        }
        if self.lifecycle.transition(LifeCycleState::Closing).is_err() {
            return;
        }
        info!("[{}] shutdown group {}", self.id, self.group_id);

        {
            let mut inner = self.lock_inner();
            inner.role.stop_workers();
            self.fail_leader_bookkeeping_locked(&mut inner);
            if let Err(e) = inner.state.persist_metadata() {
                warn!("[{}] metadata persist on shutdown failed: {:?}", self.id, e);
            }
        }
        let _ = self.shutdown_tx.send(true);
        self.apply_notify.notify_waiters();

        if let Err(e) = self.raft_log.flush() {
            error!("[{}] flush raft log failed: {:?}", self.id, e);
        }
        let _ = self.lifecycle.transition(LifeCycleState::Closed);
    }

    pub fn is_alive(&self) -> bool {
        !self.lifecycle.current().is_closing_or_closed()
    }

    pub fn is_leader(&self) -> bool {
        self.lock_inner().role.is_leader()
    }

    pub fn is_follower(&self) -> bool {
        self.lock_inner().role.is_follower()
    }

    pub fn current_term(&self) -> Term {
        self.lock_inner().state.current_term()
    }

    pub fn leader_id(&self) -> Option<PeerId> {
        self.lock_inner().state.leader_id().cloned()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.raft_log.last_committed_index()
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, CoreMutable<T>> {
        self.inner.lock().expect("peer mutex poisoned")
    }

    fn assert_group(&self, requested: &GroupId) -> std::result::Result<(), ClientError> {
        if requested != &self.group_id {
            return Err(ClientError::GroupMismatch {
                requested: requested.to_string(),
                local: self.group_id.to_string(),
            });
        }
        Ok(())
    }

    fn record_role_metrics(&self, role: RaftRoleName) {
        let value = match role {
            RaftRoleName::Follower => 0.0,
            RaftRoleName::Candidate => 1.0,
            RaftRoleName::Leader => 2.0,
        };
        SERVER_ROLE_METRIC.with_label_values(&[self.id.as_str()]).set(value);
        ROLE_TRANSITIONS_METRIC
            .with_label_values(&[self.id.as_str(), role.as_str()])
            .inc();
    }

    //----------------------------------------------------------------------
    // Role transitions (all under the peer mutex)
    //----------------------------------------------------------------------

    fn new_follower_state(self: &Arc<Self>, with_monitor: bool) -> FollowerState {
        let mut follower = FollowerState::new();
        if with_monitor {
            let weak = Arc::downgrade(self);
            let shared = follower.shared();
            let stop_rx = follower.stop_rx();
            let range = (
                self.node_config.raft.election_timeout_min_ms,
                self.node_config.raft.election_timeout_max_ms,
            );
            follower.attach_monitor(tokio::spawn(run_follower_monitor(weak, shared, stop_rx, range)));
        }
        follower
    }

    /// Change to Follower if this peer is in a different role or `force`.
    /// Returns whether term/votedFor changed and must be persisted.
    fn change_to_follower_locked(
        self: &Arc<Self>,
        inner: &mut CoreMutable<T>,
        new_term: Term,
        force: bool,
        reason: &str,
    ) -> bool {
        let old_role = inner.role.name();
        let metadata_updated = inner.state.update_current_term(new_term);

        if old_role != RaftRoleName::Follower || force {
            info!(
                "[{}:{}] changes role from {} to FOLLOWER at term {} for {}",
                self.id,
                self.group_id,
                old_role,
                inner.state.current_term(),
                reason
            );
            inner.role.stop_workers();
            if old_role == RaftRoleName::Leader {
                self.fail_leader_bookkeeping_locked(inner);
            }
            let with_monitor = self.lifecycle.is_running();
            inner.role = RaftRole::Follower(self.new_follower_state(with_monitor));
            self.record_role_metrics(RaftRoleName::Follower);
        }
        metadata_updated
    }

    fn change_to_follower_and_persist_locked(
        self: &Arc<Self>,
        inner: &mut CoreMutable<T>,
        new_term: Term,
        reason: &str,
    ) -> Result<()> {
        if self.change_to_follower_locked(inner, new_term, false, reason) {
            self.persist_metadata_or_close(inner)?;
        }
        Ok(())
    }

    /// Metadata-persist failures are fatal to the current term; the peer
    /// returns to CLOSING.
    fn persist_metadata_or_close(&self, inner: &CoreMutable<T>) -> Result<()> {
        if let Err(e) = inner.state.persist_metadata() {
            error!("[{}] metadata persist failed, closing: {:?}", self.id, e);
            let _ = self.lifecycle.transition(LifeCycleState::Closing);
            let _ = self.shutdown_tx.send(true);
            return Err(e);
        }
        Ok(())
    }

    /// Fails pending requests, watches and staging with NotLeader; called
    /// when leadership is lost or the core closes.
    fn fail_leader_bookkeeping_locked(&self, inner: &mut CoreMutable<T>) {
        let exception = self.not_leader_exception_locked(inner);
        let commit_infos = self.commit_infos_locked(inner);
        if let Some(leader) = inner.role.leader_mut() {
            leader.fail_pending_requests(|index, request| {
                let reply = ClientReply::failure(
                    request.client_id.clone(),
                    request.call_id,
                    exception.clone(),
                    index,
                    commit_infos.clone(),
                );
                // the reservation must fail too, or a retry of this key
                // would replay a reply that never comes
                if let Some(entry) = self.retry_cache.get(&request.client_id, request.call_id) {
                    entry.fail_with_reply(reply.clone());
                }
                reply
            });
            for watch in leader.take_all_watches() {
                let reply = ClientReply::failure(
                    watch.request.client_id.clone(),
                    watch.request.call_id,
                    exception.clone(),
                    watch.index,
                    commit_infos.clone(),
                );
                let _ = watch.reply_tx.send(reply);
            }
            if let Some(staging) = leader.staging.take() {
                let reply = ClientReply::failure(
                    staging.request.client_id.clone(),
                    staging.request.call_id,
                    exception.clone(),
                    0,
                    commit_infos.clone(),
                );
                let _ = staging.reply_tx.send(reply);
            }
        }
    }

    /// Called by the follower monitor on election timeout. Returns false
    /// when the transition is no longer valid, in which case the monitor
    /// keeps watching.
    pub(crate) fn on_election_timeout(self: &Arc<Self>) -> bool {
        let notify_no_leader = {
            let mut inner = self.lock_inner();
            if !self.lifecycle.is_running() || !inner.role.is_follower() {
                return false;
            }
            self.change_to_candidate_locked(&mut inner);
            inner
                .state
                .check_for_extended_no_leader(self.node_config.raft.no_leader_timeout())
        };
        if notify_no_leader {
            self.state_machine
                .notify_extended_no_leader(&self.group_id, RaftRoleName::Candidate);
        }
        true
    }

    fn change_to_candidate_locked(self: &Arc<Self>, inner: &mut CoreMutable<T>) {
        info!(
            "[{}:{}] changes role from FOLLOWER to CANDIDATE at term {}",
            self.id,
            self.group_id,
            inner.state.current_term()
        );
        inner.role.stop_workers();

        let mut candidate = CandidateState::new();
        let weak = Arc::downgrade(self);
        let stop_rx = candidate.stop_rx();
        candidate.attach_election(tokio::spawn(run_election(weak, stop_rx)));
        inner.role = RaftRole::Candidate(candidate);
        self.record_role_metrics(RaftRoleName::Candidate);
    }

    /// One election round: bump the term, vote for self, persist, snapshot
    /// the request to broadcast. `None` when this peer is no longer a
    /// running candidate.
    fn prepare_election_round(self: &Arc<Self>) -> Option<ElectionRound> {
        let mut inner = self.lock_inner();
        if !self.lifecycle.is_running() || !inner.role.is_candidate() {
            return None;
        }

        let new_term = inner.state.current_term() + 1;
        inner.state.update_current_term(new_term);
        inner.state.grant_vote(&self.id);
        inner.state.set_leader(None, "startElection");
        if self.persist_metadata_or_close(&inner).is_err() {
            return None;
        }

        let last_entry = inner.state.last_entry().unwrap_or(TermIndex::ZERO);
        let conf = inner.state.conf().clone();
        let peers = conf.other_peers(&self.id);
        debug!("[{}] starts election at term {}", self.id, new_term);

        Some(ElectionRound {
            term: new_term,
            request: RequestVoteRequest {
                candidate_id: self.id.clone(),
                group_id: self.group_id.clone(),
                candidate_term: new_term,
                candidate_last_entry: last_entry,
            },
            peers,
            conf,
        })
    }

    /// Promote to Leader iff still a running candidate at `term`.
    fn change_to_leader_if_term(self: &Arc<Self>, term: Term) -> bool {
        let mut inner = self.lock_inner();
        if !self.lifecycle.is_running()
            || !inner.role.is_candidate()
            || inner.state.current_term() != term
        {
            return false;
        }

        info!(
            "[{}:{}] changes role from CANDIDATE to LEADER at term {}",
            self.id, self.group_id, term
        );
        inner.role.stop_workers();

        // The no-op entry of the new term; committing it establishes
        // leader completeness and flips the readiness flag.
        let noop_index = self.raft_log.next_index();
        let _ = self.raft_log.append(vec![LogEntry {
            term,
            index: noop_index,
            payload: EntryPayload::Metadata,
        }]);

        let mut leader = LeaderState::new(noop_index);
        let next_index = self.raft_log.next_index();
        for peer in inner.state.conf().other_peers(&self.id) {
            self.spawn_appender_on(&mut leader, peer, next_index, true);
        }
        inner.state.set_leader(Some(self.id.clone()), "changeToLeader");
        inner.role = RaftRole::Leader(leader);
        self.record_role_metrics(RaftRoleName::Leader);

        // a single-peer group commits the no-op by itself
        self.leader_try_advance_commit_locked(&mut inner);
        true
    }

    /// Higher term observed on the wire; step down and persist.
    pub(crate) fn step_down_to_term(self: &Arc<Self>, term: Term) {
        let mut inner = self.lock_inner();
        let _ = self.change_to_follower_and_persist_locked(&mut inner, term, "higherTerm");
    }

    //----------------------------------------------------------------------
    // Inbound RPC: RequestVote
    //----------------------------------------------------------------------

    pub async fn handle_request_vote(self: &Arc<Self>, request: RequestVoteRequest) -> Result<RequestVoteReply> {
        trace!("[{}] receive requestVote({:?})", self.id, request);
        self.lifecycle.assert_state(&[LifeCycleState::Running])?;
        self.assert_group(&request.group_id).map_err(Error::from)?;

        let mut inner = self.lock_inner();
        let mut vote_granted = false;
        let mut should_shutdown = false;

        if self.should_withhold_votes_locked(&inner, request.candidate_term) {
            info!(
                "[{}-{}] withholds vote from candidate {} with term {} (leader={:?}, term={})",
                self.id,
                inner.role.name(),
                request.candidate_id,
                request.candidate_term,
                inner.state.leader_id(),
                inner.state.current_term(),
            );
        } else if inner
            .state
            .recognize_candidate(&request.candidate_id, request.candidate_term)
        {
            // force=true restarts the follower timer even if already follower
            let term_updated = self.change_to_follower_locked(
                &mut inner,
                request.candidate_term,
                true,
                "recognizeCandidate",
            );
            // Section 5.4.1 election restriction
            if inner.state.is_log_up_to_date(request.candidate_last_entry) {
                if let Some(follower) = inner.role.follower() {
                    follower.update_last_rpc_time(LastRpcUpdate::RequestVote);
                }
                inner.state.grant_vote(&request.candidate_id);
                vote_granted = true;
                VOTES_GRANTED_METRIC.with_label_values(&[self.id.as_str()]).inc();
            }
            if term_updated || vote_granted {
                self.persist_metadata_or_close(&inner)?;
            }
        }

        if !vote_granted && self.should_send_shutdown_locked(&inner, &request.candidate_id, request.candidate_last_entry) {
            should_shutdown = true;
        }

        let reply = RequestVoteReply {
            id: self.id.clone(),
            term: inner.state.current_term(),
            vote_granted,
            should_shutdown,
        };
        debug!("[{}] replies to vote request: {:?}", self.id, reply);
        Ok(reply)
    }

    fn should_withhold_votes_locked(&self, inner: &CoreMutable<T>, candidate_term: Term) -> bool {
        if inner.state.current_term() < candidate_term {
            false
        } else if inner.role.is_leader() {
            true
        } else {
            // following a leader and not yet timed out
            inner.role.is_follower()
                && inner.state.has_leader()
                && inner
                    .role
                    .follower()
                    .map(|f| f.should_withhold_votes(self.node_config.raft.election_timeout_min()))
                    .unwrap_or(false)
        }
    }

    /// A stale peer outside the committed stable conf whose log predates
    /// the conf entry is hinted to shut down.
    fn should_send_shutdown_locked(
        &self,
        inner: &CoreMutable<T>,
        candidate_id: &PeerId,
        candidate_last_entry: TermIndex,
    ) -> bool {
        inner.role.is_leader()
            && inner.state.conf().is_stable()
            && inner.state.is_conf_committed()
            && !inner.state.conf().contains(candidate_id)
            && candidate_last_entry.index < inner.state.conf().log_entry_index()
            && inner
                .role
                .leader()
                .map(|l| !l.is_bootstrapping_peer(candidate_id))
                .unwrap_or(false)
    }

    //----------------------------------------------------------------------
    // Inbound RPC: AppendEntries
    //----------------------------------------------------------------------

    pub async fn handle_append_entries(
        self: &Arc<Self>,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply> {
        self.lifecycle
            .assert_state(&[LifeCycleState::Starting, LifeCycleState::Running])?;
        self.assert_group(&request.group_id).map_err(Error::from)?;
        Self::validate_entries(&request)?;

        let is_heartbeat = request.is_heartbeat();
        if is_heartbeat {
            trace!("[{}] receive heartbeat from {}", self.id, request.leader_id);
        } else {
            debug!(
                "[{}] receive appendEntries({}, term={}, previous={:?}, commit={}, entries: {:?})",
                self.id,
                request.leader_id,
                request.leader_term,
                request.previous,
                request.leader_commit,
                crate::utils::cluster::collect_indices(&request.entries)
            );
        }

        let (current_term, receipts, follower_shared) = {
            let mut inner = self.lock_inner();
            let follower_commit = self.raft_log.last_committed_index();
            let next_index = self.raft_log.next_index();

            if !inner.state.recognize_leader(&request.leader_id, request.leader_term) {
                let reply = AppendEntriesReply::not_leader(
                    self.id.clone(),
                    inner.state.current_term(),
                    follower_commit,
                    next_index,
                );
                debug!(
                    "[{}] does not recognize {} (term={}) as leader, reply: {:?}",
                    self.id, request.leader_id, request.leader_term, reply
                );
                return Ok(reply);
            }

            self.change_to_follower_and_persist_locked(&mut inner, request.leader_term, "appendEntries")?;
            inner.state.set_leader(Some(request.leader_id.clone()), "appendEntries");

            if !request.initializing
                && self
                    .lifecycle
                    .compare_and_transition(LifeCycleState::Starting, LifeCycleState::Running)
            {
                // the peer finished bootstrapping; arm the election timer
                inner.role = RaftRole::Follower(self.new_follower_state(true));
            }

            let follower_shared = inner.role.follower().map(|f| f.shared());
            if let Some(shared) = &follower_shared {
                shared.update_last_rpc_time(LastRpcUpdate::AppendStart);
            }

            if let Some(reply_next_index) = self.check_inconsistent_append_locked(&inner, &request) {
                if let Some(shared) = &follower_shared {
                    shared.update_last_rpc_time(LastRpcUpdate::AppendComplete);
                }
                let reply = AppendEntriesReply::inconsistency(
                    self.id.clone(),
                    inner.state.current_term(),
                    follower_commit,
                    reply_next_index,
                );
                debug!("[{}] inconsistent entries, reply: {:?}", self.id, reply);
                return Ok(reply);
            }

            inner.state.update_configuration(&request.entries);

            let receipts = if is_heartbeat {
                Vec::new()
            } else {
                self.raft_log.append(request.entries.clone())
            };
            (inner.state.current_term(), receipts, follower_shared)
        };

        self.commit_info_cache.fold(&request.commit_infos);

        // await durability outside the mutex
        for receipt in receipts {
            match receipt.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(crate::TransportError::ChannelClosed(e.to_string()).into()),
            }
        }
        if let Some(shared) = &follower_shared {
            shared.update_last_rpc_time(LastRpcUpdate::AppendComplete);
        }

        let reply = {
            let mut inner = self.lock_inner();
            if inner
                .state
                .update_state_machine(request.leader_commit, current_term)?
                .is_some()
            {
                self.apply_notify.notify_one();
            }
            let next = if is_heartbeat {
                self.raft_log.next_index()
            } else {
                request.entries.last().map(|e| e.index + 1).unwrap_or(1)
            };
            AppendEntriesReply::success(
                self.id.clone(),
                current_term,
                inner.state.commit_index(),
                next,
            )
        };
        if !is_heartbeat {
            debug!("[{}] succeeded to handle AppendEntries, reply: {:?}", self.id, reply);
        }
        Ok(reply)
    }

    /// Entry sequence sanity: contiguous indices from `previous.index + 1`,
    /// terms bounded by the leader's term.
    fn validate_entries(request: &AppendEntriesRequest) -> Result<()> {
        if request.entries.is_empty() {
            return Ok(());
        }
        let first = request.entries[0].index;
        let expected_first = request.previous.map(|p| p.index + 1).unwrap_or(1);
        if first != expected_first {
            return Err(ReplicationError::InvalidEntries(format!(
                "entries[0].index={} but previous is {:?}",
                first, request.previous
            ))
            .into());
        }
        for (i, entry) in request.entries.iter().enumerate() {
            if entry.term > request.leader_term {
                return Err(ReplicationError::InvalidEntries(format!(
                    "entries[{}].term={} exceeds leader term {}",
                    i, entry.term, request.leader_term
                ))
                .into());
            }
            if entry.index != first + i as u64 {
                return Err(ReplicationError::InvalidEntries(format!(
                    "entries[{}].index={} but entries[0].index={}",
                    i, entry.index, first
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Three inconsistency shapes: an install in progress, entries already
    /// covered by the snapshot, or a gap before `previous`. Returns the
    /// next index to report to the leader.
    fn check_inconsistent_append_locked(
        &self,
        inner: &CoreMutable<T>,
        request: &AppendEntriesRequest,
    ) -> Option<LogIndex> {
        let next_index = self.raft_log.next_index();
        let prev_index = request.previous.map(|p| p.index).unwrap_or(0);

        if self
            .in_progress_install_snapshot
            .lock()
            .expect("snapshot flag poisoned")
            .is_some()
        {
            let reply_next = next_index.min(prev_index).max(1);
            debug!(
                "[{}] cannot append entries: snapshot installation in progress, next={}",
                self.id, reply_next
            );
            return Some(reply_next);
        }

        let snapshot_index = inner.state.snapshot_index();
        if snapshot_index > 0 {
            if let Some(first) = request.entries.first() {
                if first.index <= snapshot_index {
                    debug!(
                        "[{}] cannot append entries: snapshot at {} already covers first entry {}",
                        self.id, snapshot_index, first.index
                    );
                    return Some(snapshot_index + 1);
                }
            }
        }

        if let Some(previous) = request.previous {
            if !self.contains_previous_locked(inner, previous) {
                let reply_next = next_index.min(previous.index).max(1);
                debug!(
                    "[{}] cannot append entries: gap before previous {}, next={}",
                    self.id, previous, reply_next
                );
                return Some(reply_next);
            }
        }
        None
    }

    fn contains_previous_locked(&self, inner: &CoreMutable<T>, previous: TermIndex) -> bool {
        self.raft_log.contains(previous)
            || inner.state.latest_snapshot() == Some(previous)
            || inner.state.latest_installed_snapshot() == Some(previous)
    }

    //----------------------------------------------------------------------
    // Inbound RPC: InstallSnapshot
    //----------------------------------------------------------------------

    pub async fn handle_install_snapshot(
        self: &Arc<Self>,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotReply> {
        debug!("[{}] receive installSnapshot({:?})", self.id, request);
        self.lifecycle
            .assert_state(&[LifeCycleState::Starting, LifeCycleState::Running])?;
        self.assert_group(&request.group_id).map_err(Error::from)?;

        match (&request.kind, self.node_config.raft.install_snapshot_enabled) {
            (SnapshotRequestKind::Chunk(chunk), true) => {
                let chunk = chunk.clone();
                self.check_and_install_snapshot(&request, chunk)
            }
            (SnapshotRequestKind::Notification { first_available }, false) => {
                let first_available = *first_available;
                self.notify_state_machine_to_install_snapshot(&request, first_available)
            }
            _ => {
                error!(
                    "[{}] install-snapshot configuration mismatch: leader {} sent chunk={}, local flag is {}",
                    self.id,
                    request.leader_id,
                    matches!(request.kind, SnapshotRequestKind::Chunk(_)),
                    self.node_config.raft.install_snapshot_enabled
                );
                let term = self.lock_inner().state.current_term();
                Ok(InstallSnapshotReply {
                    id: self.id.clone(),
                    term,
                    result: InstallSnapshotResult::ConfMismatch,
                })
            }
        }
    }

    fn check_and_install_snapshot(
        self: &Arc<Self>,
        request: &InstallSnapshotRequest,
        chunk: SnapshotChunk,
    ) -> Result<InstallSnapshotReply> {
        let last_included = chunk.term_index;
        let mut inner = self.lock_inner();

        if !inner.state.recognize_leader(&request.leader_id, request.leader_term) {
            return Ok(InstallSnapshotReply {
                id: self.id.clone(),
                term: inner.state.current_term(),
                result: InstallSnapshotResult::NotLeader,
            });
        }
        self.change_to_follower_and_persist_locked(&mut inner, request.leader_term, "installSnapshot")?;
        inner.state.set_leader(Some(request.leader_id.clone()), "installSnapshot");

        let follower_shared = inner.role.follower().map(|f| f.shared());
        if let Some(shared) = &follower_shared {
            shared.update_last_rpc_time(LastRpcUpdate::InstallSnapshotStart);
        }

        let next_index = self.raft_log.next_index();
        if next_index > last_included.index {
            return Err(SnapshotError::ChunkOverlap {
                next_index,
                last_included: last_included.index,
            }
            .into());
        }

        inner.state.install_snapshot(&chunk)?;

        if chunk.done {
            self.state_machine.pause();
            inner.state.reload_state_machine(last_included)?;
            self.last_applied.fetch_max(last_included.index, Ordering::AcqRel);
            info!(
                "[{}:{}] successfully installed the whole snapshot-{}",
                self.id, self.group_id, last_included.index
            );
        }
        if let Some(shared) = &follower_shared {
            shared.update_last_rpc_time(LastRpcUpdate::InstallSnapshotComplete);
        }

        Ok(InstallSnapshotReply {
            id: self.id.clone(),
            term: inner.state.current_term(),
            result: InstallSnapshotResult::Success {
                chunk_index: chunk.request_index as i64,
            },
        })
    }

    fn notify_state_machine_to_install_snapshot(
        self: &Arc<Self>,
        request: &InstallSnapshotRequest,
        first_available: TermIndex,
    ) -> Result<InstallSnapshotReply> {
        let mut inner = self.lock_inner();

        if !inner.state.recognize_leader(&request.leader_id, request.leader_term) {
            return Ok(InstallSnapshotReply {
                id: self.id.clone(),
                term: inner.state.current_term(),
                result: InstallSnapshotResult::NotLeader,
            });
        }
        self.change_to_follower_and_persist_locked(&mut inner, request.leader_term, "installSnapshot")?;
        inner.state.set_leader(Some(request.leader_id.clone()), "installSnapshot");

        if let Some(follower) = inner.role.follower() {
            follower.update_last_rpc_time(LastRpcUpdate::InstallSnapshotNotification);
        }
        let current_term = inner.state.current_term();

        let mut in_progress = self
            .in_progress_install_snapshot
            .lock()
            .expect("snapshot flag poisoned");
        if in_progress.is_some() {
            debug!(
                "[{}] state machine snapshot installation already in progress: {:?}",
                self.id, *in_progress
            );
            return Ok(InstallSnapshotReply {
                id: self.id.clone(),
                term: current_term,
                result: InstallSnapshotResult::InProgress,
            });
        }

        let snapshot_index = inner.state.snapshot_index();
        if snapshot_index + 1 >= first_available.index {
            // already at par with the leader's first available index
            info!(
                "[{}] state machine latest installed snapshot index: {}",
                self.id, snapshot_index
            );
            return Ok(InstallSnapshotReply {
                id: self.id.clone(),
                term: current_term,
                result: InstallSnapshotResult::AlreadyInstalled { snapshot_index },
            });
        }

        *in_progress = Some(first_available);
        drop(in_progress);
        drop(inner);

        debug!(
            "[{}] notifying state machine to install snapshot; leader's first available index is {}",
            self.id, first_available.index
        );
        let core = Arc::downgrade(self);
        let install_timeout = self.node_config.raft.install_snapshot_timeout();
        tokio::spawn(async move {
            let Some(core) = core.upgrade() else { return };
            let result = timeout(
                install_timeout,
                core.state_machine.notify_install_snapshot_from_leader(first_available),
            )
            .await;
            match result {
                Ok(Ok(installed)) => {
                    // pause before reload so no apply work interleaves
                    core.state_machine.pause();
                    let mut inner = core.lock_inner();
                    if let Err(e) = inner.state.reload_state_machine(installed) {
                        error!("[{}] state machine reload after install failed: {:?}", core.id, e);
                    } else {
                        inner.state.update_installed_snapshot(installed);
                        core.last_applied.fetch_max(installed.index, Ordering::AcqRel);
                        info!("[{}] state machine installed snapshot {}", core.id, installed);
                    }
                }
                Ok(Err(e)) => {
                    error!("[{}] state machine failed to install snapshot: {:?}", core.id, e);
                }
                Err(_) => {
                    error!(
                        "[{}] state machine snapshot install timed out after {:?}",
                        core.id, install_timeout
                    );
                }
            }
            // the flag clears on every completion path so the leader can retry
            *core
                .in_progress_install_snapshot
                .lock()
                .expect("snapshot flag poisoned") = None;
        });

        Ok(InstallSnapshotReply {
            id: self.id.clone(),
            term: current_term,
            result: InstallSnapshotResult::Success {
                chunk_index: ASYNC_INSTALL_CHUNK_INDEX,
            },
        })
    }

    //----------------------------------------------------------------------
    // Client path
    //----------------------------------------------------------------------

    /// Client-facing failures come back inside the reply; `Err` is
    /// reserved for infrastructure breakage.
    ///
    /// A READ is served if this peer believes itself a ready leader at
    /// entry; leadership may be lost while the query runs, so reads are
    /// not linearizable across leader changes.
    pub async fn submit_client_request_async(self: &Arc<Self>, request: ClientRequest) -> Result<ClientReply> {
        if self.lifecycle.assert_state(&[LifeCycleState::Running]).is_err() {
            return Ok(self.reply_failure(&request, ReplyException::NotReady, 0));
        }
        debug!("[{}] receive client request({:?})", self.id, request);

        match request.kind.clone() {
            RequestKind::StaleRead { min_index, query } => self.stale_read_async(&request, min_index, query).await,
            RequestKind::Read { query } => {
                let short_circuit = {
                    let inner = self.lock_inner();
                    self.check_leader_state_locked(&inner, &request, None)
                };
                if let Some(reply) = short_circuit {
                    return Ok(reply);
                }
                self.process_query(&request, self.state_machine.query(query).await)
            }
            RequestKind::Watch { index, level } => self.watch_async(&request, index, level).await,
            RequestKind::Write { .. } => self.write_async(request).await,
        }
    }

    /// Synchronous-shaped variant; identical semantics.
    pub async fn submit_client_request(self: &Arc<Self>, request: ClientRequest) -> Result<ClientReply> {
        self.submit_client_request_async(request).await
    }

    async fn stale_read_async(
        self: &Arc<Self>,
        request: &ClientRequest,
        min_index: LogIndex,
        query: Vec<u8>,
    ) -> Result<ClientReply> {
        let commit_index = self.raft_log.last_committed_index();
        debug!("[{}] stale read: min_index={}, commit_index={}", self.id, min_index, commit_index);
        if commit_index < min_index {
            return Ok(self.reply_failure(
                request,
                ReplyException::StaleRead {
                    commit_index,
                    min_index,
                },
                0,
            ));
        }
        self.process_query(request, self.state_machine.query_stale(query, min_index).await)
    }

    fn process_query(&self, request: &ClientRequest, result: Result<Vec<u8>>) -> Result<ClientReply> {
        match result {
            Ok(message) => Ok(ClientReply::success(
                request.client_id.clone(),
                request.call_id,
                Some(message),
                0,
                self.commit_infos(),
            )),
            Err(e) => Ok(self.reply_failure(request, ReplyException::StateMachine(e.to_string()), 0)),
        }
    }

    async fn watch_async(
        self: &Arc<Self>,
        request: &ClientRequest,
        index: LogIndex,
        level: ReplicationLevel,
    ) -> Result<ClientReply> {
        let reply_rx = {
            let mut inner = self.lock_inner();
            if let Some(reply) = self.check_leader_state_locked(&inner, request, None) {
                return Ok(reply);
            }
            if self.watch_satisfied_locked(&inner, index, level) {
                let commit_infos = self.commit_infos_locked(&inner);
                return Ok(ClientReply::success(
                    request.client_id.clone(),
                    request.call_id,
                    None,
                    index,
                    commit_infos,
                ));
            }
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            let leader = inner.role.leader_mut().expect("checked leader above");
            leader.add_watch(WatchRequest {
                request: request.clone(),
                index,
                level,
                reply_tx,
            });
            reply_rx
        };
        match reply_rx.await {
            Ok(reply) => Ok(reply),
            Err(_) => Ok(self.reply_failure(request, ReplyException::NotReady, index)),
        }
    }

    async fn write_async(self: &Arc<Self>, request: ClientRequest) -> Result<ClientReply> {
        // check the leader state first
        let short_circuit = {
            let inner = self.lock_inner();
            self.check_leader_state_locked(&inner, &request, None)
        };
        if let Some(reply) = short_circuit {
            return Ok(reply);
        }

        // at-most-once: a pending or completed-OK attempt is replayed
        let query = self.retry_cache.query(request.client_id.clone(), request.call_id);
        if query.is_retry {
            debug!(
                "[{}] retry cache hit for ({}, {})",
                self.id, request.client_id, request.call_id
            );
            RETRY_CACHE_HITS_METRIC.with_label_values(&[self.id.as_str()]).inc();
            return query.entry.reply().await;
        }
        let cache_entry = query.entry;

        // a staging refusal is replied here; an exception carried into the
        // pre-append stage is handled by append_transaction's fence
        let ctx = match self.state_machine.start_transaction(&request) {
            Ok(ctx) => ctx,
            Err(e) => {
                let reply = self.reply_failure(&request, ReplyException::StateMachine(e.to_string()), 0);
                cache_entry.fail_with_reply(reply.clone());
                return Ok(reply);
            }
        };

        self.append_transaction(request, ctx, cache_entry).await
    }

    async fn append_transaction(
        self: &Arc<Self>,
        request: ClientRequest,
        mut ctx: TransactionContext,
        cache_entry: CacheEntry,
    ) -> Result<ClientReply> {
        let reply_rx = {
            let mut inner = self.lock_inner();
            if let Some(reply) = self.check_leader_state_locked(&inner, &request, Some(&cache_entry)) {
                return Ok(reply);
            }

            match inner.state.append_log(&mut ctx) {
                Err(e) => {
                    // a state machine that refuses pre-append may be in an
                    // inconsistent state; fence by stepping down
                    let reply = self.reply_failure_locked(
                        &inner,
                        &request,
                        ReplyException::StateMachine(e.to_string()),
                        0,
                    );
                    cache_entry.fail_with_reply(reply.clone());
                    if inner.role.is_leader() {
                        warn!("[{}] state machine rejected pre-append; stepping down", self.id);
                        let term = inner.state.current_term();
                        self.change_to_follower_locked(&mut inner, term, true, "stateMachineRejectedAppend");
                    }
                    return Ok(reply);
                }
                Ok(index) => {
                    let leader = inner.role.leader_mut().expect("checked leader above");
                    let reply_rx = leader.add_pending_request(index, request.clone(), ctx);
                    leader.notify_senders();
                    // a single-peer group commits immediately
                    self.leader_try_advance_commit_locked(&mut inner);
                    reply_rx
                }
            }
        };

        match reply_rx.await {
            Ok(reply) => Ok(reply),
            Err(_) => Ok(self.reply_failure(&request, ReplyException::NotReady, 0)),
        }
    }

    /// Short-circuits a client request that cannot be served here. `None`
    /// means this peer is a ready leader.
    fn check_leader_state_locked(
        &self,
        inner: &CoreMutable<T>,
        request: &ClientRequest,
        cache_entry: Option<&CacheEntry>,
    ) -> Option<ClientReply> {
        if !self.lifecycle.is_running() {
            let reply = self.reply_failure_locked(inner, request, ReplyException::NotReady, 0);
            if let Some(entry) = cache_entry {
                entry.fail_with_reply(reply.clone());
            }
            return Some(reply);
        }
        if self.assert_group(&request.group_id).is_err() {
            let reply = self.reply_failure_locked(inner, request, ReplyException::GroupMismatch, 0);
            if let Some(entry) = cache_entry {
                entry.fail_with_reply(reply.clone());
            }
            return Some(reply);
        }
        if !inner.role.is_leader() {
            let exception = self.not_leader_exception_locked(inner);
            let reply = self.reply_failure_locked(inner, request, exception, 0);
            if let Some(entry) = cache_entry {
                entry.fail_with_reply(reply.clone());
            }
            return Some(reply);
        }
        let leader = inner.role.leader().expect("leader checked above");
        if !leader.is_ready() {
            // a completed-OK response survives leader restarts via the cache
            if let Some(cached) = self.retry_cache.get(&request.client_id, request.call_id) {
                if cached.is_completed_ok() {
                    if let Some(reply) = cached.completed_reply() {
                        return Some(reply);
                    }
                }
            }
            let reply = self.reply_failure_locked(
                inner,
                request,
                ReplyException::LeaderNotReady,
                0,
            );
            if let Some(entry) = cache_entry {
                entry.fail_with_reply(reply.clone());
            }
            return Some(reply);
        }
        None
    }

    fn not_leader_exception_locked(&self, inner: &CoreMutable<T>) -> ReplyException {
        if !self.lifecycle.is_running() {
            return ReplyException::NotLeader {
                leader_hint: None,
                peers: Vec::new(),
            };
        }
        let conf = inner.state.conf();
        let hint = match inner.state.leader_id() {
            Some(leader) if leader != &self.id => conf.get_peer(leader).cloned(),
            // no idea who leads, or this peer is about to step down
            _ => conf.random_peer(&self.id),
        };
        ReplyException::NotLeader {
            leader_hint: hint,
            peers: conf.all_peers(),
        }
    }

    fn reply_failure(&self, request: &ClientRequest, exception: ReplyException, log_index: LogIndex) -> ClientReply {
        ClientReply::failure(
            request.client_id.clone(),
            request.call_id,
            exception,
            log_index,
            self.commit_infos(),
        )
    }

    fn reply_failure_locked(
        &self,
        inner: &CoreMutable<T>,
        request: &ClientRequest,
        exception: ReplyException,
        log_index: LogIndex,
    ) -> ClientReply {
        ClientReply::failure(
            request.client_id.clone(),
            request.call_id,
            exception,
            log_index,
            self.commit_infos_locked(inner),
        )
    }

    //----------------------------------------------------------------------
    // Configuration change
    //----------------------------------------------------------------------

    pub async fn set_configuration(self: &Arc<Self>, request: SetConfigurationRequest) -> Result<ClientReply> {
        debug!("[{}] receive setConfiguration({:?})", self.id, request);
        let pseudo = ClientRequest {
            client_id: request.client_id.clone(),
            call_id: request.call_id,
            group_id: request.group_id.clone(),
            kind: RequestKind::Write { data: Vec::new() },
        };
        if self.lifecycle.assert_state(&[LifeCycleState::Running]).is_err() {
            return Ok(self.reply_failure(&pseudo, ReplyException::NotReady, 0));
        }

        let reply_rx = {
            let mut inner = self.lock_inner();
            if let Some(reply) = self.check_leader_state_locked(&inner, &pseudo, None) {
                return Ok(reply);
            }

            let conf = inner.state.conf();
            let staging_in_progress = inner
                .role
                .leader()
                .map(|l| l.staging.is_some())
                .unwrap_or(false);
            if !conf.is_stable() || staging_in_progress || !inner.state.is_conf_committed() {
                let reply = self.reply_failure_locked(
                    &inner,
                    &pseudo,
                    ReplyException::ReconfigurationInProgress(format!(
                        "configuration change pending at index {}",
                        conf.log_entry_index()
                    )),
                    0,
                );
                return Ok(reply);
            }

            if conf.has_no_change(&request.peers) {
                let commit_infos = self.commit_infos_locked(&inner);
                return Ok(ClientReply::success(
                    request.client_id.clone(),
                    request.call_id,
                    None,
                    conf.log_entry_index(),
                    commit_infos,
                ));
            }

            // make the new peers addressable, then stage a catch-up round
            // for the ones not yet in the conf
            self.transport.add_peers(request.peers.clone());
            let start_index = self.raft_log.last_entry().map(|e| e.index).unwrap_or(0);
            let current_conf = conf.clone();
            let new_peers = request.peers.clone();
            let next_index = self.raft_log.next_index();

            let mut to_bootstrap = Vec::new();
            for peer in &new_peers {
                if peer.id != self.id && !current_conf.contains(&peer.id) {
                    to_bootstrap.push(peer.clone());
                }
            }
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            {
                let leader = inner.role.leader_mut().expect("checked leader above");
                leader.staging = Some(StagingState {
                    request: request.clone(),
                    new_peers,
                    start_index,
                    phase: StagingPhase::CatchingUp,
                    reply_tx,
                });
            }
            for peer in to_bootstrap {
                let leader = inner.role.leader_mut().expect("checked leader above");
                self.spawn_appender_on(leader, peer, next_index, false);
            }
            // a pure-removal change has nothing to catch up
            self.check_staging_locked(&mut inner);
            reply_rx
        };

        match reply_rx.await {
            Ok(reply) => Ok(reply),
            Err(_) => Ok(self.reply_failure(&pseudo, ReplyException::NotReady, 0)),
        }
    }

    fn spawn_appender_on(
        self: &Arc<Self>,
        leader: &mut LeaderState,
        peer: RaftPeer,
        next_index: LogIndex,
        attend_vote: bool,
    ) {
        let progress = Arc::new(FollowerProgress::new(peer, next_index, attend_vote));
        let weak = Arc::downgrade(self);
        let notify = leader.replicate_notify();
        let stop_rx = leader.stop_rx();
        let handle = tokio::spawn(run_appender(weak, progress.clone(), notify, stop_rx));
        leader.add_follower(progress, handle);
    }

    /// Drives the staging state machine: catch-up → joint entry → new-conf
    /// entry → reply.
    fn check_staging_locked(self: &Arc<Self>, inner: &mut CoreMutable<T>) {
        let commit_index = self.raft_log.last_committed_index();
        let current_term = inner.state.current_term();
        let conf = inner.state.conf().clone();

        let (phase, start_index, new_peers) = {
            let Some(leader) = inner.role.leader() else { return };
            let Some(staging) = leader.staging.as_ref() else { return };
            (staging.phase, staging.start_index, staging.new_peers.clone())
        };

        match phase {
            StagingPhase::CatchingUp => {
                let caught_up = {
                    let leader = inner.role.leader().expect("leader checked above");
                    new_peers.iter().all(|peer| {
                        peer.id == self.id
                            || conf.contains(&peer.id)
                            || leader
                                .progress(&peer.id)
                                .map(|p| p.match_index() >= start_index)
                                .unwrap_or(false)
                    })
                };
                if !caught_up {
                    return;
                }
                // propose the joint (old + new) configuration
                let payload = ConfPayload {
                    peers: new_peers.clone(),
                    old_peers: conf.conf_peers(),
                };
                let index = self.raft_log.next_index();
                let entry = LogEntry {
                    term: current_term,
                    index,
                    payload: EntryPayload::Configuration(payload),
                };
                info!("[{}] proposing joint configuration at index {}", self.id, index);
                let _ = self.raft_log.append(vec![entry.clone()]);
                {
                    let leader = inner.role.leader_mut().expect("leader checked above");
                    if let Some(staging) = leader.staging.as_mut() {
                        staging.phase = StagingPhase::Joint { joint_index: index };
                    }
                    for peer in &new_peers {
                        if let Some(progress) = leader.progress(&peer.id) {
                            progress.promote_to_voting();
                        }
                    }
                    leader.notify_senders();
                }
                inner.state.update_configuration(&[entry]);
                self.leader_try_advance_commit_locked(inner);
            }
            StagingPhase::Joint { joint_index } => {
                if commit_index < joint_index {
                    return;
                }
                // joint committed; propose the final configuration
                let payload = ConfPayload {
                    peers: new_peers,
                    old_peers: Vec::new(),
                };
                let index = self.raft_log.next_index();
                let entry = LogEntry {
                    term: current_term,
                    index,
                    payload: EntryPayload::Configuration(payload),
                };
                info!("[{}] proposing final configuration at index {}", self.id, index);
                let _ = self.raft_log.append(vec![entry.clone()]);
                {
                    let leader = inner.role.leader_mut().expect("leader checked above");
                    if let Some(staging) = leader.staging.as_mut() {
                        staging.phase = StagingPhase::NewConf { conf_index: index };
                    }
                    leader.notify_senders();
                }
                inner.state.update_configuration(&[entry]);
                self.leader_try_advance_commit_locked(inner);
            }
            StagingPhase::NewConf { conf_index } => {
                if commit_index < conf_index {
                    return;
                }
                info!("[{}] configuration change committed at index {}", self.id, conf_index);
                let staging = {
                    let leader = inner.role.leader_mut().expect("leader checked above");
                    let Some(staging) = leader.staging.take() else { return };
                    // retire appenders for peers no longer in the conf
                    for id in leader.follower_ids() {
                        if !conf.contains(&id) {
                            leader.remove_follower(&id);
                        }
                    }
                    staging
                };
                let commit_infos = self.commit_infos_locked(inner);
                let _ = staging.reply_tx.send(ClientReply::success(
                    staging.request.client_id.clone(),
                    staging.request.call_id,
                    None,
                    conf_index,
                    commit_infos,
                ));
            }
        }
    }

    //----------------------------------------------------------------------
    // Leader-side replication plumbing
    //----------------------------------------------------------------------

    /// Builds the next request for one follower. `None` ends its appender:
    /// leadership was lost or the follower was removed.
    pub(crate) fn prepare_replication(&self, progress: &Arc<FollowerProgress>) -> Option<ReplicationAction> {
        let inner = self.lock_inner();
        if !self.lifecycle.is_running() || !inner.role.is_leader() {
            return None;
        }
        let leader = inner.role.leader().expect("leader checked above");
        leader.progress(&progress.peer.id)?;

        let term = inner.state.current_term();
        let next = progress.next_index();
        let initializing = !progress.attend_vote();

        // behind the compacted log: ship a snapshot instead
        if next < self.raft_log.start_index() {
            let kind = if self.node_config.raft.install_snapshot_enabled {
                let snapshot = inner.state.latest_snapshot()?;
                // chunking of snapshot bytes is owned by the storage and
                // transport integration; the core drives a single final
                // chunk carrying the snapshot identity
                SnapshotRequestKind::Chunk(SnapshotChunk {
                    term_index: snapshot,
                    request_index: 0,
                    data: Vec::new(),
                    done: true,
                })
            } else {
                let snapshot = inner.state.latest_snapshot()?;
                SnapshotRequestKind::Notification {
                    first_available: snapshot,
                }
            };
            return Some(ReplicationAction::Snapshot(InstallSnapshotRequest {
                leader_id: self.id.clone(),
                group_id: self.group_id.clone(),
                leader_term: term,
                kind,
            }));
        }

        let previous = if next <= 1 {
            None
        } else {
            let prev_index = next - 1;
            let prev_term = self
                .raft_log
                .term_at(prev_index)
                .or_else(|| {
                    inner
                        .state
                        .latest_snapshot()
                        .filter(|s| s.index == prev_index)
                        .map(|s| s.term)
                })
                .or_else(|| {
                    inner
                        .state
                        .latest_installed_snapshot()
                        .filter(|s| s.index == prev_index)
                        .map(|s| s.term)
                });
            match prev_term {
                Some(t) => Some(TermIndex::new(t, prev_index)),
                // the previous entry is gone; fall back to a snapshot
                None => {
                    let snapshot = inner.state.latest_snapshot()?;
                    let kind = if self.node_config.raft.install_snapshot_enabled {
                        SnapshotRequestKind::Chunk(SnapshotChunk {
                            term_index: snapshot,
                            request_index: 0,
                            data: Vec::new(),
                            done: true,
                        })
                    } else {
                        SnapshotRequestKind::Notification {
                            first_available: snapshot,
                        }
                    };
                    return Some(ReplicationAction::Snapshot(InstallSnapshotRequest {
                        leader_id: self.id.clone(),
                        group_id: self.group_id.clone(),
                        leader_term: term,
                        kind,
                    }));
                }
            }
        };

        let last = self.raft_log.last_entry().map(|e| e.index).unwrap_or(0);
        let entries = if last >= next {
            let until = last.min(next + self.node_config.raft.max_entries_per_append - 1);
            self.raft_log.get_range(next..=until)
        } else {
            Vec::new()
        };

        Some(ReplicationAction::Append(AppendEntriesRequest {
            leader_id: self.id.clone(),
            group_id: self.group_id.clone(),
            leader_term: term,
            previous,
            leader_commit: self.raft_log.last_committed_index(),
            initializing,
            commit_infos: self.commit_infos_locked(&inner),
            entries,
        }))
    }

    /// Folds one append reply into the follower's progress. Returns false
    /// when the appender must exit (leadership lost).
    pub(crate) fn process_append_reply(
        self: &Arc<Self>,
        progress: &Arc<FollowerProgress>,
        reply: AppendEntriesReply,
    ) -> bool {
        self.commit_info_cache
            .update(reply.id.clone(), reply.follower_commit);

        match reply.result {
            AppendResult::Success => {
                progress.set_next_index(reply.next_index);
                progress.update_match_index(reply.next_index.saturating_sub(1));
                self.leader_on_progress();
                true
            }
            AppendResult::Inconsistency => {
                debug!(
                    "[{}] follower {} reports inconsistency, walking next index down to {}",
                    self.id, reply.id, reply.next_index
                );
                progress.set_next_index(reply.next_index);
                true
            }
            AppendResult::NotLeader => {
                let current_term = self.current_term();
                if reply.term > current_term {
                    info!(
                        "[{}] follower {} has higher term {}, stepping down",
                        self.id, reply.id, reply.term
                    );
                    self.step_down_to_term(reply.term);
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Folds one install-snapshot reply. Returns false when the appender
    /// must exit.
    pub(crate) fn process_snapshot_reply(
        self: &Arc<Self>,
        progress: &Arc<FollowerProgress>,
        reply: InstallSnapshotReply,
    ) -> bool {
        match reply.result {
            InstallSnapshotResult::Success { .. } => {
                // chunk mode completes synchronously; notification mode
                // reports progress through later AppendEntries replies
                if self.node_config.raft.install_snapshot_enabled {
                    let snapshot = {
                        let inner = self.lock_inner();
                        inner.state.latest_snapshot()
                    };
                    if let Some(snapshot) = snapshot {
                        progress.set_next_index(snapshot.index + 1);
                        progress.update_match_index(snapshot.index);
                        self.leader_on_progress();
                    }
                }
                true
            }
            InstallSnapshotResult::AlreadyInstalled { snapshot_index } => {
                progress.set_next_index(snapshot_index + 1);
                progress.update_match_index(snapshot_index);
                self.leader_on_progress();
                true
            }
            InstallSnapshotResult::InProgress => true,
            InstallSnapshotResult::ConfMismatch => {
                error!(
                    "[{}] install-snapshot configuration mismatch with follower {}",
                    self.id, reply.id
                );
                true
            }
            InstallSnapshotResult::NotLeader => {
                let current_term = self.current_term();
                if reply.term > current_term {
                    self.step_down_to_term(reply.term);
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Replication advanced somewhere; recompute commit, readiness,
    /// watches and staging.
    pub(crate) fn leader_on_progress(self: &Arc<Self>) {
        let mut inner = self.lock_inner();
        if !inner.role.is_leader() {
            return;
        }
        self.leader_try_advance_commit_locked(&mut inner);
        self.complete_watches_locked(&mut inner);
        self.check_staging_locked(&mut inner);
    }

    /// Advances the commit index to the highest index replicated on a
    /// majority, commitable only through an entry of the current term
    /// (leader completeness).
    fn leader_try_advance_commit_locked(self: &Arc<Self>, inner: &mut CoreMutable<T>) {
        let Some(leader) = inner.role.leader() else { return };
        let self_last = self.raft_log.last_entry().map(|e| e.index).unwrap_or(0);
        let candidate = inner.state.conf().majority_replicated_index(|id| {
            if id == &self.id {
                self_last
            } else {
                leader.match_index_of(id)
            }
        });
        let candidate = candidate.min(self_last);
        let current_commit = self.raft_log.last_committed_index();
        if candidate <= current_commit {
            return;
        }
        // within a term the leader never commits another term's entry
        // by counting replicas (Section 5.4.2 Raft paper)
        if self.raft_log.term_at(candidate) != Some(inner.state.current_term()) {
            return;
        }
        if let Err(e) = self.raft_log.update_last_committed_index(candidate) {
            error!("[{}] persist commit index failed: {:?}", self.id, e);
            return;
        }
        debug!("[{}] commit index advances to {}", self.id, candidate);
        crate::metrics::COMMIT_INDEX_METRIC
            .with_label_values(&[self.id.as_str()])
            .set(candidate as f64);
        self.apply_notify.notify_one();

        if let Some(leader) = inner.role.leader() {
            if candidate >= leader.noop_index() && !leader.is_ready() {
                info!("[{}] leader is ready at term {}", self.id, inner.state.current_term());
                leader.mark_ready();
            }
        }
        self.complete_watches_locked(inner);
        self.check_staging_locked(inner);
    }

    fn watch_satisfied_locked(&self, inner: &CoreMutable<T>, index: LogIndex, level: ReplicationLevel) -> bool {
        let commit = self.raft_log.last_committed_index();
        let Some(leader) = inner.role.leader() else { return false };
        let self_last = self.raft_log.last_entry().map(|e| e.index).unwrap_or(0);
        match level {
            ReplicationLevel::Committed => commit >= index,
            ReplicationLevel::Majority => {
                inner.state.conf().majority_replicated_index(|id| {
                    if id == &self.id {
                        self_last
                    } else {
                        leader.match_index_of(id)
                    }
                }) >= index
            }
            ReplicationLevel::All => {
                self_last >= index && leader.followers().all(|f| f.match_index() >= index)
            }
        }
    }

    fn complete_watches_locked(&self, inner: &mut CoreMutable<T>) {
        let pending: Vec<(LogIndex, ReplicationLevel)> = match inner.role.leader() {
            Some(leader) => leader.watches_snapshot(),
            None => return,
        };
        if pending.is_empty() {
            return;
        }

        let satisfied_keys: Vec<(LogIndex, ReplicationLevel)> = pending
            .into_iter()
            .filter(|(index, level)| self.watch_satisfied_locked(inner, *index, *level))
            .collect();
        if satisfied_keys.is_empty() {
            return;
        }

        let commit_infos = self.commit_infos_locked(inner);
        let Some(leader) = inner.role.leader_mut() else { return };
        let satisfied = leader.take_watches_where(|w| {
            satisfied_keys
                .iter()
                .any(|(index, level)| *index == w.index && *level == w.level)
        });
        for watch in satisfied {
            let reply = ClientReply::success(
                watch.request.client_id.clone(),
                watch.request.call_id,
                None,
                watch.index,
                commit_infos.clone(),
            );
            let _ = watch.reply_tx.send(reply);
        }
    }

    //----------------------------------------------------------------------
    // Introspection
    //----------------------------------------------------------------------

    /// This peer's commit info plus everything known about the others.
    pub fn commit_infos(&self) -> Vec<CommitInfo> {
        let inner = self.lock_inner();
        self.commit_infos_locked(&inner)
    }

    fn commit_infos_locked(&self, inner: &CoreMutable<T>) -> Vec<CommitInfo> {
        let mut infos = vec![self
            .commit_info_cache
            .update(self.id.clone(), self.raft_log.last_committed_index())];
        for peer in inner.state.conf().all_peers() {
            if peer.id == self.id {
                continue;
            }
            if let Some(info) = self.commit_info_cache.get(&peer.id) {
                infos.push(info);
            }
        }
        infos
    }

    pub fn get_group_info(&self) -> GroupInfo {
        let inner = self.lock_inner();
        GroupInfo {
            id: self.id.clone(),
            group_id: self.group_id.clone(),
            role: inner.role.name(),
            current_term: inner.state.current_term(),
            leader_id: inner.state.leader_id().cloned(),
            commit_infos: self.commit_infos_locked(&inner),
            peers: inner.state.conf().all_peers(),
            followers: inner
                .role
                .leader()
                .map(|l| l.follower_ids())
                .unwrap_or_default(),
        }
    }
}

pub(crate) enum ReplicationAction {
    Append(AppendEntriesRequest),
    Snapshot(InstallSnapshotRequest),
}

struct ElectionRound {
    term: Term,
    request: RequestVoteRequest,
    peers: Vec<RaftPeer>,
    conf: RaftConfiguration,
}

//--------------------------------------------------------------------------
// Background workers. Each holds a non-owning back-reference and stops when
// the core is gone, its stop flag flips, or its role validation fails.
//--------------------------------------------------------------------------

/// Follower election monitor: fires a role change once no valid leader RPC
/// arrived within a randomized timeout.
async fn run_follower_monitor<T: TypeConfig>(
    core: Weak<ServerCore<T>>,
    shared: Arc<FollowerShared>,
    mut stop_rx: watch::Receiver<bool>,
    timeout_range: (u64, u64),
) {
    let mut timer = ElectionTimer::new(timeout_range);
    let mut last_seen = shared.last_rpc_time();

    loop {
        if *stop_rx.borrow() {
            return;
        }
        tokio::select! {
            _ = sleep_until(timer.next_deadline()) => {
                let last = shared.last_rpc_time();
                if last > last_seen {
                    // heard from a leader; redraw the timeout
                    last_seen = last;
                    timer.reset();
                    continue;
                }
                let Some(core) = core.upgrade() else { return };
                trace!("[{}] follower election timeout", core.id);
                if core.on_election_timeout() {
                    return;
                }
                timer.reset();
            }
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// Candidate election rounds: new term, parallel vote requests, majority
/// tally; a higher term steps down, a timeout starts the next round.
async fn run_election<T: TypeConfig>(core: Weak<ServerCore<T>>, mut stop_rx: watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            return;
        }
        let Some(strong) = core.upgrade() else { return };
        let Some(round) = strong.prepare_election_round() else { return };

        let rpc_timeout = strong.node_config.raft.rpc_timeout();
        let transport = strong.transport.clone();
        let mut tasks = Vec::new();
        for peer in round.peers.clone() {
            let transport = transport.clone();
            let request = round.request.clone();
            tasks.push(tokio::spawn(async move {
                let reply = timeout(rpc_timeout, transport.send_request_vote(&peer, request)).await;
                (peer.id, reply)
            }));
        }

        let mut acks: HashSet<PeerId> = HashSet::new();
        acks.insert(strong.id.clone());
        let mut higher_term = None;

        for task in tasks {
            match task.await {
                Ok((peer_id, Ok(Ok(reply)))) => {
                    if reply.term > round.term {
                        higher_term = Some(reply.term);
                    } else if reply.vote_granted {
                        debug!("[{}] vote granted by {}", strong.id, peer_id);
                        acks.insert(peer_id.clone());
                    }
                    if reply.should_shutdown {
                        warn!(
                            "[{}] hinted to shut down by {}; peer is outside the committed configuration",
                            strong.id, peer_id
                        );
                    }
                }
                Ok((peer_id, Ok(Err(e)))) => {
                    debug!("[{}] vote request to {} failed: {:?}", strong.id, peer_id, e);
                }
                Ok((peer_id, Err(_))) => {
                    debug!("[{}] vote request to {} timed out", strong.id, peer_id);
                }
                Err(e) => {
                    error!("[{}] vote task failed: {:?}", strong.id, e);
                }
            }
        }

        if let Some(term) = higher_term {
            info!("[{}] found higher term {} during election", strong.id, term);
            strong.step_down_to_term(term);
            return;
        }
        if round.conf.has_majority(&acks) {
            if strong.change_to_leader_if_term(round.term) {
                return;
            }
            // the role moved under us; stop quietly
            return;
        }
        debug!(
            "[{}] election round at term {} failed ({} acks)",
            strong.id,
            round.term,
            acks.len()
        );

        let retry_in = ElectionTimer::random_duration(
            strong.node_config.raft.election_timeout_min_ms,
            strong.node_config.raft.election_timeout_max_ms,
        );
        drop(strong);
        tokio::select! {
            _ = sleep(retry_in) => {}
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// One appender per follower: streams AppendEntries, walks the next index
/// down on inconsistency, falls back to snapshot installation, and paces
/// with heartbeats when idle.
async fn run_appender<T: TypeConfig>(
    core: Weak<ServerCore<T>>,
    progress: Arc<FollowerProgress>,
    notify: Arc<Notify>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        if *stop_rx.borrow() {
            return;
        }
        let Some(strong) = core.upgrade() else { return };
        let Some(action) = strong.prepare_replication(&progress) else { return };

        let rpc_timeout = strong.node_config.raft.rpc_timeout();
        let heartbeat = strong.node_config.raft.heartbeat_interval();
        let slowness = strong.node_config.raft.rpc_slowness_timeout();
        let target = progress.peer.clone();
        let mut immediate = false;

        match action {
            ReplicationAction::Append(request) => {
                let sent_entries = !request.entries.is_empty();
                match timeout(rpc_timeout, strong.transport.send_append_entries(&target, request)).await {
                    Ok(Ok(reply)) => {
                        progress.record_response();
                        let success = reply.result == AppendResult::Success;
                        if !strong.process_append_reply(&progress, reply) {
                            return;
                        }
                        // keep streaming while the follower lags
                        if (success && sent_entries || !success)
                            && strong.raft_log.next_index() > progress.next_index()
                        {
                            immediate = true;
                        }
                    }
                    Ok(Err(e)) => {
                        trace!("[{}] append to {} failed: {:?}", strong.id, target.id, e);
                    }
                    Err(_) => {
                        if progress.is_slow(slowness) {
                            warn!(
                                "[{}] follower {} has been unresponsive for over {:?}",
                                strong.id, target.id, slowness
                            );
                        }
                    }
                }
            }
            ReplicationAction::Snapshot(request) => {
                match timeout(rpc_timeout, strong.transport.send_install_snapshot(&target, request)).await {
                    Ok(Ok(reply)) => {
                        progress.record_response();
                        if !strong.process_snapshot_reply(&progress, reply) {
                            return;
                        }
                    }
                    Ok(Err(e)) => {
                        trace!("[{}] install snapshot to {} failed: {:?}", strong.id, target.id, e);
                    }
                    Err(_) => {
                        trace!("[{}] install snapshot to {} timed out", strong.id, target.id);
                    }
                }
            }
        }
        drop(strong);

        if immediate {
            continue;
        }
        tokio::select! {
            _ = notify.notified() => {}
            _ = sleep(heartbeat) => {}
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return;
                }
            }
        }
    }
}
