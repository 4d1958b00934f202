//! Role state as a tagged union. Transitions replace the whole variant
//! under the peer mutex; the outgoing variant's workers are signalled to
//! stop before the incoming variant's are spawned, which keeps worker
//! lifetimes reasoned about in one place.

pub mod candidate_state;
pub mod follower_state;
pub mod leader_state;


pub use candidate_state::CandidateState;
pub use follower_state::FollowerShared;
pub use follower_state::FollowerState;
pub use follower_state::LastRpcUpdate;
pub use leader_state::FollowerProgress;
pub use leader_state::LeaderState;
pub use leader_state::StagingPhase;
pub use leader_state::StagingState;
pub use leader_state::WatchRequest;

use tokio::time::Instant;

use crate::protocol::RaftRoleName;

pub enum RaftRole {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl RaftRole {
    pub fn name(&self) -> RaftRoleName {
        match self {
            RaftRole::Follower(_) => RaftRoleName::Follower,
            RaftRole::Candidate(_) => RaftRoleName::Candidate,
            RaftRole::Leader(_) => RaftRoleName::Leader,
        }
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, RaftRole::Follower(_))
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, RaftRole::Candidate(_))
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, RaftRole::Leader(_))
    }

    pub fn follower(&self) -> Option<&FollowerState> {
        match self {
            RaftRole::Follower(state) => Some(state),
            _ => None,
        }
    }

    pub fn follower_mut(&mut self) -> Option<&mut FollowerState> {
        match self {
            RaftRole::Follower(state) => Some(state),
            _ => None,
        }
    }

    pub fn candidate(&self) -> Option<&CandidateState> {
        match self {
            RaftRole::Candidate(state) => Some(state),
            _ => None,
        }
    }

    pub fn leader(&self) -> Option<&LeaderState> {
        match self {
            RaftRole::Leader(state) => Some(state),
            _ => None,
        }
    }

    pub fn leader_mut(&mut self) -> Option<&mut LeaderState> {
        match self {
            RaftRole::Leader(state) => Some(state),
            _ => None,
        }
    }

    /// Signals the current variant's background workers to stop at their
    /// next safe point.
    pub fn stop_workers(&self) {
        match self {
            RaftRole::Follower(state) => state.stop(),
            RaftRole::Candidate(state) => state.stop(),
            RaftRole::Leader(state) => state.stop(),
        }
    }

    pub fn since(&self) -> Instant {
        match self {
            RaftRole::Follower(state) => state.since(),
            RaftRole::Candidate(state) => state.since(),
            RaftRole::Leader(state) => state.since(),
        }
    }
}
