use rand::Rng;
use tokio::time::Duration;
use tokio::time::Instant;

/// Follower election deadline with a fresh uniform-random timeout drawn on
/// every reset.
#[derive(Clone, Debug)]
pub struct ElectionTimer {
    next_deadline: Instant,
    timeout_range: (u64, u64),
}

impl ElectionTimer {
    /// `timeout_range`: (election_timeout_min_ms, election_timeout_max_ms)
    pub fn new(timeout_range: (u64, u64)) -> Self {
        let (min, max) = timeout_range;
        Self {
            next_deadline: Instant::now() + Self::random_duration(min, max),
            timeout_range,
        }
    }

    pub fn reset(&mut self) {
        let (min, max) = self.timeout_range;
        self.next_deadline = Instant::now() + Self::random_duration(min, max);
    }

    /// Uniform random duration in `[min, max]` milliseconds.
    pub fn random_duration(min: u64, max: u64) -> Duration {
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(min..=max))
    }

    pub fn next_deadline(&self) -> Instant {
        self.next_deadline
    }

    pub fn is_expired(&self) -> bool {
        self.next_deadline <= Instant::now()
    }

    pub fn remaining(&self) -> Duration {
        self.next_deadline.saturating_duration_since(Instant::now())
    }
}
