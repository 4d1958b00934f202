//! RPC transport seam. Serialization, addressing and framing live behind
//! this trait; the core only sees typed requests and replies.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::protocol::AppendEntriesReply;
use crate::protocol::AppendEntriesRequest;
use crate::protocol::InstallSnapshotReply;
use crate::protocol::InstallSnapshotRequest;
use crate::protocol::RaftPeer;
use crate::protocol::RequestVoteReply;
use crate::protocol::RequestVoteRequest;
use crate::Result;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_request_vote(&self, target: &RaftPeer, request: RequestVoteRequest)
        -> Result<RequestVoteReply>;

    async fn send_append_entries(
        &self,
        target: &RaftPeer,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply>;

    async fn send_install_snapshot(
        &self,
        target: &RaftPeer,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotReply>;

    /// Makes new peers addressable before a configuration change stages
    /// them.
    fn add_peers(&self, peers: Vec<RaftPeer>);

    fn local_address(&self) -> String;
}
