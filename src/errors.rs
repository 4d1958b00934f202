//! Error hierarchy for the consensus core.
//!
//! Errors are grouped by concern and lifted into the crate-level [`Error`]
//! with `From` conversions, so call sites can use `?` regardless of which
//! layer produced the failure. Client-facing failures are additionally
//! mirrored into reply objects (see `ReplyException` in the protocol
//! module); the variants here are what flows through `Result` internally.

use std::path::PathBuf;
use std::time::Duration;

use config::ConfigError;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Lifecycle gate violations (operation arrived in the wrong state)
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Client-path failures that become reply exceptions
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Leader election failures (Section 5.2 Raft paper)
    #[error(transparent)]
    Election(#[from] ElectionError),

    /// Log replication failures (Section 5.3 Raft paper)
    #[error(transparent)]
    Replication(#[from] ReplicationError),

    /// Membership change failures (Section 6 Raft paper)
    #[error(transparent)]
    Membership(#[from] MembershipError),

    /// Snapshot installation failures
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// User state machine failures
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    /// Log / metadata storage failures
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// RPC transport failures
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Configuration loading failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Configuration validation failures
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unrecoverable failures; the peer transitions to CLOSING
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Server {server} is not ready: current state is {current}")]
    NotReady {
        server: String,
        current: &'static str,
    },

    #[error("Illegal lifecycle transition {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("Server {0} has already been started")]
    AlreadyStarted(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The group of the request does not match the group of this peer
    #[error("Group {requested} does not match the group {local} of this server")]
    GroupMismatch { requested: String, local: String },

    /// This peer is not the leader; the hint names a better target if known
    #[error("Server is not the leader (suggested: {leader_hint:?})")]
    NotLeader { leader_hint: Option<String> },

    /// A leader was elected but has not yet completed its first round
    #[error("Leader {0} is not ready to serve requests")]
    LeaderNotReady(String),

    /// Stale read cannot be served at the requested minimum index
    #[error("Unable to serve stale-read: commit index {commit_index} < min index {min_index}")]
    StaleRead { commit_index: u64, min_index: u64 },

    /// Another reconfiguration has not yet committed
    #[error("Reconfiguration is already in progress: {0}")]
    ReconfigurationInProgress(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("Election failed: {0}")]
    Failed(String),

    /// Stale term detection (Section 5.1 Raft paper)
    #[error("Found higher term(={0}) during election")]
    HigherTerm(u64),

    /// Quorum not achieved (Section 5.2 Raft paper)
    #[error("Quorum not reached (required: {required}, succeeded: {succeeded})")]
    QuorumFailure { required: usize, succeeded: usize },

    #[error("No voting member found for candidate {0}")]
    NoVotingMemberFound(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// Stale leader detected during AppendEntries
    #[error("Found higher term(={0}) during replication")]
    HigherTerm(u64),

    /// Entry sequence failed validation before the decision section
    #[error("Invalid entry sequence: {0}")]
    InvalidEntries(String),

    /// Inter-peer only; never surfaced to clients
    #[error("Log inconsistency, follower next index is {next_index}")]
    Inconsistency { next_index: u64 },

    #[error("Replication requires the leader role")]
    NotLeader,
}

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("Membership changes require the leader role")]
    NotLeader,

    #[error("Peer {0} is not part of the group configuration")]
    UnknownPeer(String),

    #[error("Invalid membership change request: {0}")]
    InvalidChangeRequest(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Chunk-mode request overlaps entries the log still owns
    #[error("Log next index {next_index} is beyond snapshot last included index {last_included}")]
    ChunkOverlap { next_index: u64, last_included: u64 },

    #[error("Snapshot installation already in progress: {0}")]
    InProgress(String),

    #[error("Snapshot installation failed: {0}")]
    InstallFailed(String),

    #[error("Snapshot installation timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    /// The state machine rejected a transaction at the staging stage
    #[error("State machine rejected transaction: {0}")]
    TransactionRejected(String),

    /// The state machine failed while applying a committed entry
    #[error("State machine apply failed: {0}")]
    ApplyFailed(String),

    #[error("State machine query failed: {0}")]
    QueryFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Error occurred at path: {path}")]
    Path {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Serialization failures for persisted data
    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    /// Metadata file failures are fatal to the current term
    #[error("Metadata persistence failed: {0}")]
    Metadata(String),

    #[error("Log storage failure: {0}")]
    Log(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection timeout to {peer} after {duration:?}")]
    Timeout { peer: String, duration: Duration },

    #[error("Peer {0} is unreachable")]
    Unreachable(String),

    #[error("Failed to send {request_type} request: {reason}")]
    SendFailure {
        request_type: &'static str,
        reason: String,
    },

    #[error("Reply channel closed: {0}")]
    ChannelClosed(String),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),
}

impl Error {
    /// True when the failure indicates a stale term observed on the wire.
    pub fn is_higher_term(&self) -> bool {
        matches!(
            self,
            Error::Election(ElectionError::HigherTerm(_))
                | Error::Replication(ReplicationError::HigherTerm(_))
        )
    }
}
