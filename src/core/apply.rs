//! The apply loop: a single worker draining committed entries in log-index
//! order into the state machine, resolving pending client requests and the
//! retry cache as results arrive.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use tokio::sync::watch;
use tokio::sync::Notify;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::constants::APPLY_BATCH_LIMIT;
use crate::core::server_core::ServerCore;
use crate::metrics::APPLIED_ENTRIES_METRIC;
use crate::protocol::ClientReply;
use crate::protocol::EntryPayload;
use crate::protocol::LogEntry;
use crate::protocol::ReplyException;
use crate::storage::RaftLog;
use crate::storage::StateMachine;
use crate::storage::TransactionContext;
use crate::TypeConfig;

pub(crate) async fn run_apply_loop<T: TypeConfig>(
    core: Weak<ServerCore<T>>,
    notify: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        {
            let Some(core) = core.upgrade() else { return };
            if core.lifecycle.current().is_closing_or_closed() {
                debug!("[{}] apply loop stops", core.id);
                return;
            }
            apply_committed_entries(&core).await;
        }
        tokio::select! {
            _ = notify.notified() => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

async fn apply_committed_entries<T: TypeConfig>(core: &Arc<ServerCore<T>>) {
    let mut budget = APPLY_BATCH_LIMIT;

    while budget > 0 {
        let applied = core.last_applied.load(Ordering::Acquire);
        if applied >= core.raft_log.last_committed_index() {
            return;
        }
        let next_index = applied + 1;

        // entries behind a freshly installed snapshot are gone; jump the
        // frontier to the snapshot
        if next_index < core.raft_log.start_index() {
            let snapshot_index = core.raft_log.start_index() - 1;
            core.last_applied.fetch_max(snapshot_index, Ordering::AcqRel);
            continue;
        }

        let Some(entry) = core.raft_log.get(next_index) else {
            warn!(
                "[{}] committed entry {} not readable yet; apply loop waits",
                core.id, next_index
            );
            return;
        };

        apply_one(core, &entry).await;
        core.last_applied.store(next_index, Ordering::Release);
        budget -= 1;
    }
    // over budget; reschedule ourselves
    core.apply_notify.notify_one();
}

async fn apply_one<T: TypeConfig>(core: &Arc<ServerCore<T>>, entry: &LogEntry) {
    match &entry.payload {
        EntryPayload::Metadata => {
            core.state_machine.notify_index_update(entry.term, entry.index);
        }
        EntryPayload::Configuration(_) => {
            // the conf view was folded at append time; commit-ness now
            // follows from the commit index having passed the entry
            core.state_machine.notify_index_update(entry.term, entry.index);
            debug!("[{}] configuration entry {} committed", core.id, entry.index);
        }
        EntryPayload::StateMachine(sm_entry) => {
            // reuse the leader-side context if this peer originated the
            // entry, else synthesize one from the log
            let ctx = {
                let mut inner = core.lock_inner();
                inner
                    .role
                    .leader_mut()
                    .and_then(|l| l.take_transaction(entry.index))
            }
            .unwrap_or_else(|| TransactionContext::from_entry(entry, sm_entry));

            let reply = apply_transaction(core, entry, ctx).await;

            // update the retry cache first so a racing retry replays the
            // final reply
            let cache_entry = core
                .retry_cache
                .get_or_create(sm_entry.client_id.clone(), sm_entry.call_id);
            cache_entry.update_result(reply.clone());

            let mut inner = core.lock_inner();
            if inner.role.is_leader() {
                if let Some(leader) = inner.role.leader_mut() {
                    leader.reply_pending_request(entry.index, reply);
                }
            }
            APPLIED_ENTRIES_METRIC
                .with_label_values(&[core.id.as_str()])
                .inc();
        }
    }
}

/// State-machine failures never escape the apply loop; they ride back in
/// the reply.
async fn apply_transaction<T: TypeConfig>(
    core: &Arc<ServerCore<T>>,
    entry: &LogEntry,
    ctx: TransactionContext,
) -> ClientReply {
    let client_id = ctx.client_id.clone();
    let call_id = ctx.call_id;

    let serial = match core.state_machine.apply_transaction_serial(ctx) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(
                "[{}] applyTransactionSerial failed for index {}: {:?}",
                core.id, entry.index, e
            );
            return ClientReply::failure(
                client_id,
                call_id,
                ReplyException::StateMachine(e.to_string()),
                entry.index,
                core.commit_infos(),
            );
        }
    };

    match core.state_machine.apply_transaction(serial).await {
        Ok(message) => ClientReply::success(
            client_id,
            call_id,
            Some(message),
            entry.index,
            core.commit_infos(),
        ),
        Err(e) => {
            error!(
                "[{}] applyTransaction failed for index {}: {:?}",
                core.id, entry.index, e
            );
            ClientReply::failure(
                client_id,
                call_id,
                ReplyException::StateMachine(e.to_string()),
                entry.index,
                core.commit_infos(),
            )
        }
    }
}
