//! Core model in Raft: the replicated log, consumed through this trait.
//!
//! The storage implementation owns durability and conflict truncation: an
//! `append` that overlaps existing entries with a different term must
//! delete the existing entry and all that follow it before appending
//! (Section 5.3 Raft paper). The commit index is maintained by the core and
//! pushed to storage on every advance.

use std::ops::RangeInclusive;

#[cfg(test)]
use mockall::automock;
use tokio::sync::oneshot;

use crate::protocol::LogEntry;
use crate::protocol::LogIndex;
use crate::protocol::Term;
use crate::protocol::TermIndex;
use crate::Result;

/// Resolves once the corresponding entry is durable.
pub type AppendReceipt = oneshot::Receiver<Result<()>>;

#[cfg_attr(test, automock)]
pub trait RaftLog: Send + Sync + 'static {
    /// First index still held by the log; entries below it live only in a
    /// snapshot.
    fn start_index(&self) -> LogIndex;

    /// Index the next appended entry will take.
    fn next_index(&self) -> LogIndex;

    fn last_entry(&self) -> Option<TermIndex>;

    fn get(&self, index: LogIndex) -> Option<LogEntry>;

    fn get_range(&self, range: RangeInclusive<LogIndex>) -> Vec<LogEntry>;

    /// True iff the log holds exactly this (term, index).
    fn contains(&self, term_index: TermIndex) -> bool;

    fn term_at(&self, index: LogIndex) -> Option<Term>;

    /// Appends entries, truncating conflicting suffixes first, and returns
    /// one durability receipt per entry.
    fn append(&self, entries: Vec<LogEntry>) -> Vec<AppendReceipt>;

    fn last_committed_index(&self) -> LogIndex;

    /// Persists a commit-index advance; the index only ever grows.
    fn update_last_committed_index(&self, index: LogIndex) -> Result<()>;

    /// Drops all entries and resets the log to start after an installed
    /// snapshot.
    fn reset_to_snapshot(&self, snapshot: TermIndex) -> Result<()>;

    fn flush(&self) -> Result<()>;
}
