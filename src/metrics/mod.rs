//! Prometheus metrics for the consensus core.
//!
//! Registered into a crate-owned registry; the embedding process decides
//! how to export it.

use lazy_static::lazy_static;
use prometheus::GaugeVec;
use prometheus::IntCounterVec;
use prometheus::Opts;
use prometheus::Registry;

lazy_static! {
    pub static ref CURRENT_TERM_METRIC: GaugeVec = GaugeVec::new(
        Opts::new("current_term", "Current Raft term of this peer"),
        &["id"]
    )
    .expect("metric can not be created");
    pub static ref COMMIT_INDEX_METRIC: GaugeVec = GaugeVec::new(
        Opts::new("commit_index", "Last committed log index of this peer"),
        &["id"]
    )
    .expect("metric can not be created");
    pub static ref SERVER_ROLE_METRIC: GaugeVec = GaugeVec::new(
        Opts::new("server_role", "Role of this peer (0=follower, 1=candidate, 2=leader)"),
        &["id"]
    )
    .expect("metric can not be created");
    pub static ref VOTES_GRANTED_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("votes_granted", "RequestVote RPCs this peer granted"),
        &["id"]
    )
    .expect("metric can not be created");
    pub static ref ROLE_TRANSITIONS_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("role_transitions", "Role transitions by target role"),
        &["id", "role"]
    )
    .expect("metric can not be created");
    pub static ref APPLIED_ENTRIES_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("applied_entries", "Committed entries applied to the state machine"),
        &["id"]
    )
    .expect("metric can not be created");
    pub static ref RETRY_CACHE_HITS_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("retry_cache_hits", "Client submissions answered from the retry cache"),
        &["id"]
    )
    .expect("metric can not be created");
    pub static ref CUSTOM_REGISTRY: Registry =
        Registry::new_custom(Some("raftcell".to_string()), None).unwrap();
}

pub fn register_custom_metrics(registry: &Registry) {
    registry
        .register(Box::new(CURRENT_TERM_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(COMMIT_INDEX_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(SERVER_ROLE_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(VOTES_GRANTED_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(ROLE_TRANSITIONS_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(APPLIED_ENTRIES_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(RETRY_CACHE_HITS_METRIC.clone()))
        .expect("collector can be registered");
}
