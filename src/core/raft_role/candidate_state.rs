//! Candidate-side state: a handle on the election task. The election
//! rounds themselves run in the core, which owns the term bookkeeping.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub struct CandidateState {
    stop_tx: watch::Sender<bool>,
    election: Option<JoinHandle<()>>,
    since: Instant,
}

impl CandidateState {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            election: None,
            since: Instant::now(),
        }
    }

    pub fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn attach_election(&mut self, handle: JoinHandle<()>) {
        self.election = Some(handle);
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn since(&self) -> Instant {
        self.since
    }
}

impl Default for CandidateState {
    fn default() -> Self {
        Self::new()
    }
}
