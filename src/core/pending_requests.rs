//! Leader-side bookkeeping for client writes awaiting commit and apply,
//! keyed by the log index the write landed at.

use std::collections::BTreeMap;

use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::ClientReply;
use crate::protocol::ClientRequest;
use crate::protocol::LogIndex;

pub struct PendingRequest {
    pub request: ClientRequest,
    reply_tx: oneshot::Sender<ClientReply>,
}

#[derive(Default)]
pub struct PendingRequests {
    requests: BTreeMap<LogIndex, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request at `index` and returns the receiver its reply
    /// will arrive on.
    pub fn add(&mut self, index: LogIndex, request: ClientRequest) -> oneshot::Receiver<ClientReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests.insert(index, PendingRequest { request, reply_tx });
        reply_rx
    }

    /// Resolves the request at `index`, if this leader still tracks it.
    pub fn reply(&mut self, index: LogIndex, reply: ClientReply) {
        if let Some(pending) = self.requests.remove(&index) {
            if pending.reply_tx.send(reply).is_err() {
                debug!("pending request at index {} no longer awaited", index);
            }
        }
    }

    /// Fails every outstanding request, e.g. on leadership loss.
    pub fn fail_all(&mut self, mut make_reply: impl FnMut(LogIndex, &ClientRequest) -> ClientReply) {
        for (index, pending) in std::mem::take(&mut self.requests) {
            let reply = make_reply(index, &pending.request);
            let _ = pending.reply_tx.send(reply);
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
