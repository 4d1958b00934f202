pub mod metadata;
pub mod raft_log;
pub mod state_machine;

#[cfg(test)]
mod metadata_test;

pub use metadata::*;
pub use raft_log::*;
pub use state_machine::*;
