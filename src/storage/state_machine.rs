//! Core model in Raft: the user state machine, consumed through this trait.
//!
//! The apply loop is the only caller of the transaction methods, so the
//! state machine observes committed entries strictly in log-index order.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::protocol::ClientId;
use crate::protocol::ClientRequest;
use crate::protocol::GroupId;
use crate::protocol::LogEntry;
use crate::protocol::LogIndex;
use crate::protocol::RaftRoleName;
use crate::protocol::SnapshotChunk;
use crate::protocol::StateMachineEntry;
use crate::protocol::Term;
use crate::protocol::TermIndex;
use crate::Result;

/// Carries one client write from staging through append to apply.
///
/// The leader creates a context via [`StateMachine::start_transaction`] and
/// keeps it until the entry commits; followers synthesize one from the log
/// entry instead.
#[derive(Clone, Debug)]
pub struct TransactionContext {
    pub client_id: ClientId,
    pub call_id: u64,
    /// Payload the state machine staged for replication.
    pub data: Vec<u8>,
    /// Filled in once the entry is appended to the log.
    pub log_entry: Option<LogEntry>,
    /// Set by the state machine when staging failed; such a context must
    /// never be appended.
    pub exception: Option<String>,
}

impl TransactionContext {
    pub fn new(client_id: ClientId, call_id: u64, data: Vec<u8>) -> Self {
        Self {
            client_id,
            call_id,
            data,
            log_entry: None,
            exception: None,
        }
    }

    /// Follower-side context, synthesized from a committed entry.
    pub fn from_entry(entry: &LogEntry, sm_entry: &StateMachineEntry) -> Self {
        Self {
            client_id: sm_entry.client_id.clone(),
            call_id: sm_entry.call_id,
            data: sm_entry.data.clone(),
            log_entry: Some(entry.clone()),
            exception: None,
        }
    }

    pub fn log_index(&self) -> LogIndex {
        self.log_entry.as_ref().map(|e| e.index).unwrap_or(0)
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Stages a client write and returns the context to replicate. A
    /// rejected transaction is reported through the context's `exception`
    /// or an error; neither may reach the log.
    fn start_transaction(&self, request: &ClientRequest) -> Result<TransactionContext>;

    /// Hook for strictly ordered side effects, invoked before
    /// `apply_transaction` for every committed entry.
    fn apply_transaction_serial(&self, ctx: TransactionContext) -> Result<TransactionContext>;

    /// Applies one committed transaction; the returned message becomes the
    /// client reply payload.
    async fn apply_transaction(&self, ctx: TransactionContext) -> Result<Vec<u8>>;

    /// Read-only query against current state.
    async fn query(&self, query: Vec<u8>) -> Result<Vec<u8>>;

    /// Read-only query tolerating staleness up to `min_index`.
    async fn query_stale(&self, query: Vec<u8>, min_index: LogIndex) -> Result<Vec<u8>>;

    /// A committed entry carried no state-machine payload (no-op or
    /// configuration); lets the state machine track the applied frontier.
    fn notify_index_update(&self, term: Term, index: LogIndex);

    /// The leader asked this peer to obtain a snapshot out of band; the
    /// returned (term, index) is the snapshot the machine installed.
    async fn notify_install_snapshot_from_leader(&self, first_available: TermIndex) -> Result<TermIndex>;

    /// Durably stores one chunk of a leader-streamed snapshot.
    fn install_snapshot_chunk(&self, chunk: &SnapshotChunk) -> Result<()>;

    /// No leader has been heard from for an extended period.
    fn notify_extended_no_leader(&self, group_id: &GroupId, role: RaftRoleName);

    /// Stops applying; required before a snapshot swap.
    fn pause(&self);

    /// Re-initializes state from the given snapshot.
    fn reload(&self, snapshot: TermIndex) -> Result<()>;

    fn latest_snapshot(&self) -> Option<TermIndex>;

    fn last_applied(&self) -> LogIndex;
}
