//! Mutable per-peer state: persisted election metadata, leader identity,
//! the configuration view and the snapshot pointers, plus the decision
//! rules (recognize leader/candidate, §5.4.1 up-to-date check) built on
//! them.
//!
//! Every method here is called with the peer mutex held; the struct itself
//! carries no locking.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::alias::MSOF;
use crate::alias::ROF;
use crate::alias::SMOF;
use crate::membership::RaftConfiguration;
use crate::metrics::COMMIT_INDEX_METRIC;
use crate::metrics::CURRENT_TERM_METRIC;
use crate::protocol::EntryPayload;
use crate::protocol::GroupId;
use crate::protocol::LogEntry;
use crate::protocol::LogIndex;
use crate::protocol::PeerId;
use crate::protocol::SnapshotChunk;
use crate::protocol::StateMachineEntry;
use crate::protocol::Term;
use crate::protocol::TermIndex;
use crate::storage::MetadataStore;
use crate::storage::PersistedMetadata;
use crate::storage::RaftLog;
use crate::storage::StateMachine;
use crate::storage::TransactionContext;
use crate::Result;
use crate::StateMachineError;
use crate::TypeConfig;

pub struct ServerState<T: TypeConfig> {
    id: PeerId,
    group_id: GroupId,

    current_term: Term,
    voted_for: Option<PeerId>,
    leader_id: Option<PeerId>,
    conf: RaftConfiguration,
    latest_installed_snapshot: Option<TermIndex>,
    /// Last moment a leader was known; drives the extended-no-leader
    /// notification.
    last_leader_contact: Instant,

    raft_log: Arc<ROF<T>>,
    state_machine: Arc<SMOF<T>>,
    metadata_store: Arc<MSOF<T>>,
}

impl<T: TypeConfig> ServerState<T> {
    /// Builds the state from persisted metadata plus a scan of the log for
    /// configuration entries newer than the bootstrap conf.
    pub fn new(
        id: PeerId,
        group_id: GroupId,
        initial_conf: RaftConfiguration,
        raft_log: Arc<ROF<T>>,
        state_machine: Arc<SMOF<T>>,
        metadata_store: Arc<MSOF<T>>,
    ) -> Result<Self> {
        let metadata = metadata_store.load()?.unwrap_or_default();
        debug!(%id, ?metadata, "server state loaded");

        let mut state = Self {
            id,
            group_id,
            current_term: metadata.current_term,
            voted_for: metadata.voted_for,
            leader_id: None,
            conf: initial_conf,
            latest_installed_snapshot: None,
            last_leader_contact: Instant::now(),
            raft_log,
            state_machine,
            metadata_store,
        };
        state.scan_log_for_configuration();
        Ok(state)
    }

    fn scan_log_for_configuration(&mut self) {
        let start = self.raft_log.start_index();
        let last = self.raft_log.last_entry().map(|e| e.index).unwrap_or(0);
        for index in start..=last {
            if let Some(entry) = self.raft_log.get(index) {
                if let EntryPayload::Configuration(payload) = &entry.payload {
                    self.conf = RaftConfiguration::from_entry(index, payload);
                }
            }
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.id
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&PeerId> {
        self.voted_for.as_ref()
    }

    pub fn leader_id(&self) -> Option<&PeerId> {
        self.leader_id.as_ref()
    }

    pub fn has_leader(&self) -> bool {
        self.leader_id.is_some()
    }

    pub fn conf(&self) -> &RaftConfiguration {
        &self.conf
    }

    /// Raises the current term; a raise resets the vote. Returns whether
    /// the persisted metadata changed.
    pub fn update_current_term(&mut self, new_term: Term) -> bool {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = None;
            CURRENT_TERM_METRIC
                .with_label_values(&[self.id.as_str()])
                .set(new_term as f64);
            true
        } else {
            false
        }
    }

    pub fn grant_vote(&mut self, candidate: &PeerId) {
        debug!("[{}] grants vote to {} at term {}", self.id, candidate, self.current_term);
        self.voted_for = Some(candidate.clone());
    }

    pub fn set_leader(&mut self, leader: Option<PeerId>, reason: &str) {
        if self.leader_id != leader {
            info!(
                "[{}] leader changes from {:?} to {:?} at term {} for {}",
                self.id, self.leader_id, leader, self.current_term, reason
            );
            self.leader_id = leader;
        }
        if self.leader_id.is_some() {
            self.last_leader_contact = Instant::now();
        }
    }

    /// Accept a claimed leader iff its term is current-or-newer and does
    /// not contradict a leader already recognized for this term.
    pub fn recognize_leader(&self, id: &PeerId, term: Term) -> bool {
        if term < self.current_term {
            return false;
        }
        term > self.current_term || self.leader_id.is_none() || self.leader_id.as_ref() == Some(id)
    }

    /// Accept a candidacy iff its term is current-or-newer and does not
    /// contradict a vote already granted for this term.
    pub fn recognize_candidate(&self, candidate: &PeerId, term: Term) -> bool {
        if term < self.current_term {
            return false;
        }
        term > self.current_term || self.voted_for.is_none() || self.voted_for.as_ref() == Some(candidate)
    }

    /// Last (term, index) this peer holds, from the log or, when the log
    /// was fully compacted, from the latest snapshot.
    pub fn last_entry(&self) -> Option<TermIndex> {
        self.raft_log
            .last_entry()
            .or_else(|| self.latest_snapshot())
            .or(self.latest_installed_snapshot)
    }

    /// Section 5.4.1 election restriction.
    pub fn is_log_up_to_date(&self, candidate_last: TermIndex) -> bool {
        let local_last = self.last_entry().unwrap_or(TermIndex::ZERO);
        candidate_last.term > local_last.term
            || (candidate_last.term == local_last.term && candidate_last.index >= local_last.index)
    }

    /// Durably flushes (current_term, voted_for); failures here are fatal
    /// to the current term.
    pub fn persist_metadata(&self) -> Result<()> {
        self.metadata_store.save(&PersistedMetadata {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        })
    }

    pub fn latest_snapshot(&self) -> Option<TermIndex> {
        self.state_machine.latest_snapshot()
    }

    pub fn latest_installed_snapshot(&self) -> Option<TermIndex> {
        self.latest_installed_snapshot
    }

    pub fn update_installed_snapshot(&mut self, installed: TermIndex) {
        self.latest_installed_snapshot = Some(installed);
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.latest_snapshot().map(|s| s.index).unwrap_or(0)
    }

    pub fn commit_index(&self) -> LogIndex {
        self.raft_log.last_committed_index()
    }

    /// True iff the latest configuration entry is committed.
    pub fn is_conf_committed(&self) -> bool {
        self.conf.log_entry_index() <= self.commit_index()
    }

    /// Folds configuration entries into the view; the view stays
    /// uncommitted until the commit index passes the entry.
    pub fn update_configuration(&mut self, entries: &[LogEntry]) {
        for entry in entries {
            if let EntryPayload::Configuration(payload) = &entry.payload {
                info!("[{}] folding configuration entry at index {}", self.id, entry.index);
                self.conf = RaftConfiguration::from_entry(entry.index, payload);
            }
        }
    }

    /// Durably stores one snapshot chunk.
    pub fn install_snapshot(&self, chunk: &SnapshotChunk) -> Result<()> {
        self.state_machine.install_snapshot_chunk(chunk)
    }

    /// Swaps the state machine onto `snapshot` and resets the log behind
    /// it. The caller pauses the machine first.
    pub fn reload_state_machine(&mut self, snapshot: TermIndex) -> Result<()> {
        info!("[{}] reloading state machine at {}", self.id, snapshot);
        self.state_machine.reload(snapshot)?;
        self.raft_log.reset_to_snapshot(snapshot)?;
        if snapshot.index > self.raft_log.last_committed_index() {
            self.raft_log.update_last_committed_index(snapshot.index)?;
            COMMIT_INDEX_METRIC
                .with_label_values(&[self.id.as_str()])
                .set(snapshot.index as f64);
        }
        Ok(())
    }

    /// Appends a staged client transaction to the log at the next index and
    /// returns that index. A context carrying a staging exception must not
    /// reach the log.
    pub fn append_log(&mut self, ctx: &mut TransactionContext) -> Result<LogIndex> {
        if let Some(exception) = &ctx.exception {
            warn!("[{}] refusing to append rejected transaction: {}", self.id, exception);
            return Err(StateMachineError::TransactionRejected(exception.clone()).into());
        }

        let index = self.raft_log.next_index();
        let entry = LogEntry {
            term: self.current_term,
            index,
            payload: EntryPayload::StateMachine(StateMachineEntry {
                client_id: ctx.client_id.clone(),
                call_id: ctx.call_id,
                data: ctx.data.clone(),
            }),
        };
        ctx.log_entry = Some(entry.clone());
        // Durability is tracked by the appenders' quorum; the receipts are
        // the log's own flush bookkeeping.
        let _ = self.raft_log.append(vec![entry]);
        Ok(index)
    }

    /// Advances the commit index to `min(leader_commit, last local index)`.
    /// Returns the new commit index when it moved.
    pub fn update_state_machine(&mut self, leader_commit: LogIndex, _my_term: Term) -> Result<Option<LogIndex>> {
        let last_index = self.last_entry().map(|e| e.index).unwrap_or(0);
        let new_commit = leader_commit.min(last_index);
        if new_commit > self.raft_log.last_committed_index() {
            self.raft_log.update_last_committed_index(new_commit)?;
            COMMIT_INDEX_METRIC
                .with_label_values(&[self.id.as_str()])
                .set(new_commit as f64);
            return Ok(Some(new_commit));
        }
        Ok(None)
    }

    /// True when no leader has been heard from for `timeout`.
    pub fn check_for_extended_no_leader(&self, timeout: tokio::time::Duration) -> bool {
        self.last_leader_contact.elapsed() >= timeout
    }
}
