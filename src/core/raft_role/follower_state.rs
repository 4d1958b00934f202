//! Follower-side state: the election-timeout monitor and the record of
//! when a valid leader was last heard.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Which RPC refreshed the follower's leader-contact clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LastRpcUpdate {
    RequestVote,
    AppendStart,
    AppendComplete,
    InstallSnapshotStart,
    InstallSnapshotComplete,
    InstallSnapshotNotification,
}

/// Shared between the follower state (behind the peer mutex) and its
/// monitor task.
pub struct FollowerShared {
    last_rpc_time: Mutex<Instant>,
}

impl FollowerShared {
    fn new() -> Self {
        Self {
            last_rpc_time: Mutex::new(Instant::now()),
        }
    }

    pub fn update_last_rpc_time(&self, update: LastRpcUpdate) {
        trace!(?update, "follower last rpc time updated");
        *self.last_rpc_time.lock().expect("follower clock poisoned") = Instant::now();
    }

    pub fn last_rpc_time(&self) -> Instant {
        *self.last_rpc_time.lock().expect("follower clock poisoned")
    }

    pub fn last_rpc_elapsed(&self) -> Duration {
        self.last_rpc_time().elapsed()
    }
}

pub struct FollowerState {
    shared: Arc<FollowerShared>,
    stop_tx: watch::Sender<bool>,
    monitor: Option<JoinHandle<()>>,
    since: Instant,
}

impl FollowerState {
    /// A follower without a monitor; used while the peer bootstraps
    /// outside the configuration.
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(FollowerShared::new()),
            stop_tx,
            monitor: None,
            since: Instant::now(),
        }
    }

    pub fn shared(&self) -> Arc<FollowerShared> {
        self.shared.clone()
    }

    pub fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn attach_monitor(&mut self, handle: JoinHandle<()>) {
        self.monitor = Some(handle);
    }

    pub fn has_monitor(&self) -> bool {
        self.monitor.is_some()
    }

    pub fn update_last_rpc_time(&self, update: LastRpcUpdate) {
        self.shared.update_last_rpc_time(update);
    }

    /// A vote is withheld while a valid leader was heard within the
    /// minimum election timeout.
    pub fn should_withhold_votes(&self, min_timeout: Duration) -> bool {
        self.shared.last_rpc_elapsed() < min_timeout
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn since(&self) -> Instant {
        self.since
    }
}

impl Default for FollowerState {
    fn default() -> Self {
        Self::new()
    }
}
