//! Process-state gate for one core: NEW → STARTING → RUNNING → CLOSING →
//! CLOSED, plus NEW → CLOSED for a peer that never started.

use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use tracing::info;

use crate::LifecycleError;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifeCycleState {
    New = 0,
    Starting = 1,
    Running = 2,
    Closing = 3,
    Closed = 4,
}

impl LifeCycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifeCycleState::New => "NEW",
            LifeCycleState::Starting => "STARTING",
            LifeCycleState::Running => "RUNNING",
            LifeCycleState::Closing => "CLOSING",
            LifeCycleState::Closed => "CLOSED",
        }
    }

    pub fn is_closing_or_closed(&self) -> bool {
        matches!(self, LifeCycleState::Closing | LifeCycleState::Closed)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LifeCycleState::New,
            1 => LifeCycleState::Starting,
            2 => LifeCycleState::Running,
            3 => LifeCycleState::Closing,
            _ => LifeCycleState::Closed,
        }
    }

    fn is_legal_transition(from: LifeCycleState, to: LifeCycleState) -> bool {
        use LifeCycleState::*;
        matches!(
            (from, to),
            (New, Starting) | (Starting, Running) | (Running, Closing) | (Closing, Closed)
                | (New, Closed)
                // a start that fails midway still has to close
                | (Starting, Closing)
        )
    }
}

pub struct LifeCycle {
    name: String,
    state: AtomicU8,
}

impl LifeCycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(LifeCycleState::New as u8),
        }
    }

    pub fn current(&self) -> LifeCycleState {
        LifeCycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically moves `from` → `to`; false when the current state is not
    /// `from`.
    pub fn compare_and_transition(&self, from: LifeCycleState, to: LifeCycleState) -> bool {
        debug_assert!(LifeCycleState::is_legal_transition(from, to));
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            info!("[{}] lifecycle {} -> {}", self.name, from.as_str(), to.as_str());
        }
        swapped
    }

    /// Unconditional transition; fails when not legal from the current
    /// state.
    pub fn transition(&self, to: LifeCycleState) -> Result<()> {
        loop {
            let current = self.current();
            if !LifeCycleState::is_legal_transition(current, to) {
                return Err(LifecycleError::InvalidTransition {
                    from: current.as_str(),
                    to: to.as_str(),
                }
                .into());
            }
            if self.compare_and_transition(current, to) {
                return Ok(());
            }
        }
    }

    /// Fails with NotReady unless the current state is one of `expected`.
    pub fn assert_state(&self, expected: &[LifeCycleState]) -> Result<LifeCycleState> {
        let current = self.current();
        if expected.contains(&current) {
            Ok(current)
        } else {
            Err(LifecycleError::NotReady {
                server: self.name.clone(),
                current: current.as_str(),
            }
            .into())
        }
    }

    pub fn is_running(&self) -> bool {
        self.current() == LifeCycleState::Running
    }
}
