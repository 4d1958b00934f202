//! # raftcell
//!
//! The consensus core of one Raft group participant: leader election, log
//! replication, snapshot installation and client-request acknowledgement,
//! with every collaborator (RPC transport, durable log, state machine,
//! metadata store) consumed through a trait.
//!
//! ## Features
//! - **Safety first**: election safety, log matching, leader completeness
//!   and at-most-once client semantics under concurrent RPCs
//! - **Pluggable collaborators**: bring your own transport, log storage and
//!   state machine via [`TypeConfig`]
//! - **Observability**: structured tracing plus a prometheus registry
//! - **Runtime**: built for `tokio`
//!
//! ## Quick Start
//! ```no_run
//! # use std::sync::Arc;
//! # async fn example<C: raftcell::TypeConfig>(
//! #     raft_log: Arc<C::R>,
//! #     state_machine: Arc<C::SM>,
//! #     transport: Arc<C::TR>,
//! #     metadata_store: Arc<C::MS>,
//! # ) -> raftcell::Result<()> {
//! use raftcell::protocol::{PeerId, RaftPeer};
//! use raftcell::{RaftGroup, ServerConfig, ServerCore};
//!
//! let group = RaftGroup {
//!     group_id: "demo-group".into(),
//!     peers: vec![RaftPeer::new("n1", "127.0.0.1:7001")],
//! };
//! let core = ServerCore::<C>::new(
//!     PeerId::new("n1"),
//!     group,
//!     raft_log,
//!     state_machine,
//!     transport,
//!     metadata_store,
//!     Arc::new(ServerConfig::default()),
//! )?;
//! core.start()?;
//! # Ok(())
//! # }
//! ```
//!
//! For production deployments, a minimum group size of **3 peers** is
//! required.

pub mod config;
pub mod membership;
pub mod protocol;
pub mod storage;

#[doc(hidden)]
pub use config::*;

mod constants;
mod core;
mod errors;
mod metrics;
mod network;
mod type_config;

#[doc(hidden)]
pub use core::*;

pub use errors::*;
pub use metrics::register_custom_metrics;
pub use metrics::CUSTOM_REGISTRY;
pub use network::*;
#[doc(hidden)]
pub use storage::*;
#[doc(hidden)]
pub mod utils;
#[doc(hidden)]
pub use type_config::*;

//-----------------------------------------------------------
// Test utils
#[cfg(test)]
#[doc(hidden)]
pub mod test_utils;
