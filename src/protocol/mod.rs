//! Wire-facing data model: identifiers, log entries and the request/reply
//! shapes exchanged between peers and with clients.
//!
//! The transport owns addressing, framing and serialization; these structs
//! are what the core produces and consumes. All of them are serde-friendly
//! so a transport can encode them however it likes.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

pub type Term = u64;
/// Log indices start at 1; 0 means "no entry".
pub type LogIndex = u64;

/// Stable identifier of one peer, totally ordered by byte comparison.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one Raft group; a peer belongs to exactly one group per
/// core instance.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Client identity used for at-most-once bookkeeping.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A peer with the address its transport connects to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftPeer {
    pub id: PeerId,
    pub address: String,
}

impl RaftPeer {
    pub fn new(id: impl Into<PeerId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// A (term, index) pair; total order is lexicographic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TermIndex {
    pub term: Term,
    pub index: LogIndex,
}

impl TermIndex {
    pub const ZERO: TermIndex = TermIndex { term: 0, index: 0 };

    pub fn new(term: Term, index: LogIndex) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for TermIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(t:{}, i:{})", self.term, self.index)
    }
}

impl fmt::Debug for TermIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One replicated log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn term_index(&self) -> TermIndex {
        TermIndex::new(self.term, self.index)
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self.payload, EntryPayload::Configuration(_))
    }

    pub fn is_state_machine(&self) -> bool {
        matches!(self.payload, EntryPayload::StateMachine(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Group membership change; carries the new (and, while joint, the old)
    /// peer sets.
    Configuration(ConfPayload),
    /// A client write staged through the state machine.
    StateMachine(StateMachineEntry),
    /// Leader no-op; marks leader completeness for the new term.
    Metadata,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfPayload {
    pub peers: Vec<RaftPeer>,
    /// Empty unless this is a joint (transitional) configuration.
    pub old_peers: Vec<RaftPeer>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateMachineEntry {
    pub client_id: ClientId,
    pub call_id: u64,
    pub data: Vec<u8>,
}

/// Last committed index a peer has acknowledged; only ever advances.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub peer: PeerId,
    pub committed_index: LogIndex,
}

//--------------------------------------------------------------------------
// Inter-peer RPCs
//--------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub candidate_id: PeerId,
    pub group_id: GroupId,
    pub candidate_term: Term,
    pub candidate_last_entry: TermIndex,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub id: PeerId,
    pub term: Term,
    pub vote_granted: bool,
    /// Hint to a stale peer that is no longer part of the committed
    /// configuration.
    pub should_shutdown: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub leader_id: PeerId,
    pub group_id: GroupId,
    pub leader_term: Term,
    /// The entry immediately preceding `entries`; `None` when the stream
    /// starts at index 1.
    pub previous: Option<TermIndex>,
    pub leader_commit: LogIndex,
    /// Set while the target peer is bootstrapping outside the conf; keeps
    /// its lifecycle in STARTING.
    pub initializing: bool,
    pub commit_infos: Vec<CommitInfo>,
    pub entries: Vec<LogEntry>,
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppendResult {
    Success,
    NotLeader,
    /// The follower cannot accept the entries at this position; the reply's
    /// `next_index` tells the leader where to resume.
    Inconsistency,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub id: PeerId,
    pub term: Term,
    pub result: AppendResult,
    pub follower_commit: LogIndex,
    pub next_index: LogIndex,
}

impl AppendEntriesReply {
    pub fn success(id: PeerId, term: Term, follower_commit: LogIndex, next_index: LogIndex) -> Self {
        Self {
            id,
            term,
            result: AppendResult::Success,
            follower_commit,
            next_index,
        }
    }

    pub fn not_leader(id: PeerId, term: Term, follower_commit: LogIndex, next_index: LogIndex) -> Self {
        Self {
            id,
            term,
            result: AppendResult::NotLeader,
            follower_commit,
            next_index,
        }
    }

    pub fn inconsistency(id: PeerId, term: Term, follower_commit: LogIndex, next_index: LogIndex) -> Self {
        Self {
            id,
            term,
            result: AppendResult::Inconsistency,
            follower_commit,
            next_index,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    /// Last (term, index) covered by the snapshot being installed.
    pub term_index: TermIndex,
    /// Sequence number of this chunk within the transfer.
    pub request_index: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SnapshotRequestKind {
    /// Leader streams snapshot bytes (install_snapshot_enabled = true).
    Chunk(SnapshotChunk),
    /// Leader only notifies; the state machine fetches the snapshot itself
    /// (install_snapshot_enabled = false).
    Notification { first_available: TermIndex },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub leader_id: PeerId,
    pub group_id: GroupId,
    pub leader_term: Term,
    pub kind: SnapshotRequestKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallSnapshotResult {
    /// `chunk_index` echoes the chunk sequence number, or -1 for the
    /// asynchronous notification path.
    Success { chunk_index: i64 },
    NotLeader,
    InProgress,
    AlreadyInstalled { snapshot_index: LogIndex },
    ConfMismatch,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub id: PeerId,
    pub term: Term,
    pub result: InstallSnapshotResult,
}

//--------------------------------------------------------------------------
// Client API
//--------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationLevel {
    /// The watched index is committed on the leader.
    Committed,
    /// The watched index is replicated on a majority of the group.
    Majority,
    /// The watched index is replicated on every peer.
    All,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RequestKind {
    Write { data: Vec<u8> },
    Read { query: Vec<u8> },
    StaleRead { min_index: LogIndex, query: Vec<u8> },
    Watch { index: LogIndex, level: ReplicationLevel },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub client_id: ClientId,
    pub call_id: u64,
    pub group_id: GroupId,
    pub kind: RequestKind,
}

impl ClientRequest {
    pub fn write(
        client_id: impl Into<ClientId>,
        call_id: u64,
        group_id: impl Into<GroupId>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            call_id,
            group_id: group_id.into(),
            kind: RequestKind::Write { data },
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self.kind, RequestKind::Write { .. })
    }
}

/// Client-visible failure kinds, carried inside a reply rather than as a
/// bare error so the client library can uniformly inspect results.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReplyException {
    NotReady,
    GroupMismatch,
    NotLeader {
        leader_hint: Option<RaftPeer>,
        peers: Vec<RaftPeer>,
    },
    LeaderNotReady,
    StaleRead {
        commit_index: LogIndex,
        min_index: LogIndex,
    },
    StateMachine(String),
    ReconfigurationInProgress(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientReply {
    pub client_id: ClientId,
    pub call_id: u64,
    pub success: bool,
    pub message: Option<Vec<u8>>,
    pub exception: Option<ReplyException>,
    /// Index the write landed at; 0 for reads and failures before append.
    pub log_index: LogIndex,
    pub commit_infos: Vec<CommitInfo>,
}

impl ClientReply {
    pub fn success(
        client_id: ClientId,
        call_id: u64,
        message: Option<Vec<u8>>,
        log_index: LogIndex,
        commit_infos: Vec<CommitInfo>,
    ) -> Self {
        Self {
            client_id,
            call_id,
            success: true,
            message,
            exception: None,
            log_index,
            commit_infos,
        }
    }

    pub fn failure(
        client_id: ClientId,
        call_id: u64,
        exception: ReplyException,
        log_index: LogIndex,
        commit_infos: Vec<CommitInfo>,
    ) -> Self {
        Self {
            client_id,
            call_id,
            success: false,
            message: None,
            exception: Some(exception),
            log_index,
            commit_infos,
        }
    }
}

/// Leader-only request replacing the group configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetConfigurationRequest {
    pub client_id: ClientId,
    pub call_id: u64,
    pub group_id: GroupId,
    pub peers: Vec<RaftPeer>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRoleName {
    Follower,
    Candidate,
    Leader,
}

impl RaftRoleName {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaftRoleName::Follower => "FOLLOWER",
            RaftRoleName::Candidate => "CANDIDATE",
            RaftRoleName::Leader => "LEADER",
        }
    }
}

impl fmt::Display for RaftRoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one peer's view of itself and the group, used by the
/// metrics surface and `get_group_info`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: PeerId,
    pub group_id: GroupId,
    pub role: RaftRoleName,
    pub current_term: Term,
    pub leader_id: Option<PeerId>,
    pub commit_infos: Vec<CommitInfo>,
    pub peers: Vec<RaftPeer>,
    /// Present only on the leader.
    pub followers: Vec<PeerId>,
}
