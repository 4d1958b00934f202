use std::sync::Arc;

use tokio::time::sleep;
use tokio::time::Duration;

use crate::protocol::AppendEntriesRequest;
use crate::protocol::AppendResult;
use crate::protocol::ClientRequest;
use crate::protocol::EntryPayload;
use crate::protocol::GroupId;
use crate::protocol::InstallSnapshotRequest;
use crate::protocol::InstallSnapshotResult;
use crate::protocol::LogEntry;
use crate::protocol::PeerId;
use crate::protocol::RaftRoleName;
use crate::protocol::ReplyException;
use crate::protocol::RequestKind;
use crate::protocol::RequestVoteRequest;
use crate::protocol::SetConfigurationRequest;
use crate::protocol::SnapshotRequestKind;
use crate::protocol::TermIndex;
use crate::storage::metadata::MetadataStore;
use crate::storage::state_machine::StateMachine;
use crate::storage::RaftLog;
use crate::test_utils::build_node;
use crate::test_utils::build_node_with;
use crate::test_utils::slow_config;
use crate::test_utils::test_config;
use crate::test_utils::test_peers;
use crate::test_utils::wait_for_leader;
use crate::test_utils::wait_until;
use crate::test_utils::write_request;
use crate::test_utils::LoopbackHub;
use crate::test_utils::MemRaftLog;
use crate::test_utils::MemStateMachine;
use crate::test_utils::TestNode;
use crate::test_utils::TEST_GROUP;

const DEADLINE: Duration = Duration::from_secs(5);

fn node<'a>(nodes: &'a [TestNode], id: &PeerId) -> &'a TestNode {
    nodes.iter().find(|n| &n.id == id).expect("node exists")
}

fn start_cluster(ids: &[&str]) -> (Arc<LoopbackHub>, Vec<TestNode>) {
    let hub = LoopbackHub::new();
    let nodes: Vec<TestNode> = ids.iter().map(|id| build_node(id, ids, &hub, test_config())).collect();
    for n in &nodes {
        assert!(n.core.start().unwrap());
    }
    (hub, nodes)
}

async fn elect(nodes: &[TestNode]) -> PeerId {
    wait_for_leader(nodes, DEADLINE).await.expect("a leader emerges")
}

async fn wait_ready(leader: &TestNode) {
    // the no-op of the term has to commit before the leader serves
    assert!(
        wait_until(DEADLINE, || {
            leader.core.commit_index() >= 1 && leader.core.is_leader()
        })
        .await
    );
}

//--------------------------------------------------------------------------
// Scenario 1: happy-path election
//--------------------------------------------------------------------------

/// Start {A,B,C} fully connected; exactly one leader emerges and the other
/// two follow it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_happy_path_election() {
    let (_hub, nodes) = start_cluster(&["A", "B", "C"]);
    let leader_id = elect(&nodes).await;

    let leader = node(&nodes, &leader_id);
    assert!(leader.core.current_term() >= 1);

    // both followers converge on the elected leader
    assert!(
        wait_until(DEADLINE, || {
            nodes
                .iter()
                .filter(|n| n.id != leader_id)
                .all(|n| n.core.is_follower() && n.core.leader_id() == Some(leader_id.clone()))
        })
        .await
    );

    // election safety held along the way
    assert_eq!(nodes.iter().filter(|n| n.core.is_leader()).count(), 1);

    for n in &nodes {
        n.core.shutdown();
    }
}

//--------------------------------------------------------------------------
// Scenario 2: write + commit
//--------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_and_commit() {
    let (_hub, nodes) = start_cluster(&["A", "B", "C"]);
    let leader_id = elect(&nodes).await;
    let leader = node(&nodes, &leader_id);
    wait_ready(leader).await;

    let reply = leader
        .core
        .submit_client_request_async(write_request("X", 7, b"put k=1"))
        .await
        .unwrap();
    assert!(reply.success, "unexpected exception: {:?}", reply.exception);
    assert!(reply.log_index >= 1);

    // every peer applies exactly one transaction for (X, 7)
    assert!(
        wait_until(DEADLINE, || {
            nodes
                .iter()
                .all(|n| n.state_machine.apply_count_for(&"X".into(), 7) == 1)
        })
        .await
    );

    // the leader's retry cache holds COMPLETED_OK for (X, 7)
    let cached = leader.core.retry_cache.get(&"X".into(), 7).unwrap();
    assert!(cached.is_completed_ok());

    for n in &nodes {
        n.core.shutdown();
    }
}

//--------------------------------------------------------------------------
// Scenario 3: retry dedup
//--------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_returns_cached_reply_without_reexecution() {
    let (_hub, nodes) = start_cluster(&["A", "B", "C"]);
    let leader_id = elect(&nodes).await;
    let leader = node(&nodes, &leader_id);
    wait_ready(leader).await;

    let request = write_request("X", 7, b"put k=1");
    let first = leader
        .core
        .submit_client_request_async(request.clone())
        .await
        .unwrap();
    assert!(first.success);

    let log_next_before = leader.raft_log.next_index();
    let applied_before = leader.state_machine.apply_count();

    let second = leader.core.submit_client_request_async(request).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(leader.raft_log.next_index(), log_next_before);
    assert_eq!(leader.state_machine.apply_count(), applied_before);

    for n in &nodes {
        n.core.shutdown();
    }
}

//--------------------------------------------------------------------------
// Scenario 4: inconsistency recovery
//--------------------------------------------------------------------------

/// Isolate one follower, advance the rest, heal; the appender walks the
/// follower's next index down and catches it up to the leader's commit.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lagging_follower_catches_up() {
    let (hub, nodes) = start_cluster(&["A", "B", "C"]);
    let leader_id = elect(&nodes).await;
    let leader = node(&nodes, &leader_id);
    wait_ready(leader).await;

    for call_id in 0..5 {
        let reply = leader
            .core
            .submit_client_request_async(write_request("X", call_id, b"warm"))
            .await
            .unwrap();
        assert!(reply.success);
    }

    let lagging_id = nodes.iter().map(|n| n.id.clone()).find(|id| id != &leader_id).unwrap();
    let lagging = node(&nodes, &lagging_id);
    assert!(
        wait_until(DEADLINE, || {
            lagging.core.commit_index() >= leader.core.commit_index()
        })
        .await
    );

    hub.block(&lagging_id);
    for call_id in 5..15 {
        let reply = leader
            .core
            .submit_client_request_async(write_request("X", call_id, b"ahead"))
            .await
            .unwrap();
        // the two connected peers still form a majority
        assert!(reply.success);
    }
    let target_commit = leader.core.commit_index();
    assert!(lagging.core.commit_index() < target_commit);

    hub.unblock(&lagging_id);
    assert!(
        wait_until(DEADLINE, || lagging.core.commit_index() >= target_commit).await,
        "lagging follower never caught up: {} < {}",
        lagging.core.commit_index(),
        target_commit
    );
    // log matching: identical entries up to the leader's commit
    let leader_entries = leader.raft_log.all_entries();
    let lagging_entries = lagging.raft_log.all_entries();
    for index in 1..=target_commit {
        let l = leader_entries.iter().find(|e| e.index == index).unwrap();
        let f = lagging_entries.iter().find(|e| e.index == index).unwrap();
        assert_eq!(l, f);
    }

    for n in &nodes {
        n.core.shutdown();
    }
}

//--------------------------------------------------------------------------
// Scenario 5: stale-peer shutdown hint
//--------------------------------------------------------------------------

/// After committing a conf change that removes a never-started peer, that
/// peer's vote request earns `should_shutdown`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_peer_receives_shutdown_hint() {
    let ids = ["A", "B", "C", "D"];
    let hub = LoopbackHub::new();
    // D is part of the initial conf but never starts
    let nodes: Vec<TestNode> = ["A", "B", "C"]
        .iter()
        .map(|id| build_node(id, &ids, &hub, test_config()))
        .collect();
    for n in &nodes {
        assert!(n.core.start().unwrap());
    }
    let leader_id = elect(&nodes).await;
    let leader = node(&nodes, &leader_id);
    wait_ready(leader).await;

    let reply = leader
        .core
        .set_configuration(SetConfigurationRequest {
            client_id: "admin".into(),
            call_id: 1,
            group_id: GroupId::new(TEST_GROUP),
            peers: test_peers(&["A", "B", "C"]),
        })
        .await
        .unwrap();
    assert!(reply.success, "conf change failed: {:?}", reply.exception);

    // wait until the final conf entry is committed on the leader
    assert!(
        wait_until(DEADLINE, || {
            let info = leader.core.get_group_info();
            info.peers.len() == 3 && info.role == RaftRoleName::Leader
        })
        .await
    );

    let vote_reply = leader
        .core
        .handle_request_vote(RequestVoteRequest {
            candidate_id: PeerId::new("D"),
            group_id: GroupId::new(TEST_GROUP),
            candidate_term: 1,
            candidate_last_entry: TermIndex::ZERO,
        })
        .await
        .unwrap();
    assert!(!vote_reply.vote_granted);
    assert!(vote_reply.should_shutdown);

    for n in &nodes {
        n.core.shutdown();
    }
}

//--------------------------------------------------------------------------
// Scenario 6: snapshot install, notify mode
//--------------------------------------------------------------------------

/// A leader whose log starts after a snapshot notifies an empty follower;
/// the follower's state machine installs the snapshot exactly once and
/// replication resumes at the next index.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshot_install_notify_mode() {
    let snapshot = TermIndex::new(1, 1000);
    let hub = LoopbackHub::new();
    let mut config = test_config();
    config.raft.install_snapshot_enabled = false;

    let ids = ["A", "B"];
    let a = build_node_with(
        "A",
        &ids,
        &hub,
        config.clone(),
        Arc::new(MemRaftLog::compacted_at(snapshot.index)),
        Arc::new(MemStateMachine::with_snapshot(snapshot)),
    );
    let b = build_node("B", &ids, &hub, config);
    assert!(a.core.start().unwrap());
    assert!(b.core.start().unwrap());

    let nodes = [a, b];
    // only A can win: B's empty log is not up to date
    let leader_id = wait_for_leader(&nodes, DEADLINE).await.expect("leader");
    assert_eq!(leader_id, PeerId::new("A"));
    let (a, b) = (&nodes[0], &nodes[1]);

    // B's state machine is told exactly once and installs the snapshot
    assert!(
        wait_until(DEADLINE, || {
            b.state_machine.latest_snapshot() == Some(snapshot)
        })
        .await
    );
    assert_eq!(b.state_machine.install_notification_count(), 1);
    assert!(
        wait_until(DEADLINE, || b.core.commit_index() >= snapshot.index).await,
        "follower commit {} never reached snapshot index",
        b.core.commit_index()
    );

    // replication resumes with entries after the snapshot
    assert!(wait_until(DEADLINE, || a.core.is_leader() && a.core.commit_index() > snapshot.index).await);
    let reply = a
        .core
        .submit_client_request_async(write_request("X", 1, b"after-snapshot"))
        .await
        .unwrap();
    assert!(reply.success);
    assert!(reply.log_index > snapshot.index);
    assert!(
        wait_until(DEADLINE, || {
            b.state_machine.apply_count_for(&"X".into(), 1) == 1
        })
        .await
    );

    for n in &nodes {
        n.core.shutdown();
    }
}

//--------------------------------------------------------------------------
// Handler-level cases
//--------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_vote_granted_once_per_term() {
    let hub = LoopbackHub::new();
    let a = build_node("A", &["A", "B", "C"], &hub, slow_config());
    assert!(a.core.start().unwrap());

    let request = |candidate: &str| RequestVoteRequest {
        candidate_id: PeerId::new(candidate),
        group_id: GroupId::new(TEST_GROUP),
        candidate_term: 5,
        candidate_last_entry: TermIndex::ZERO,
    };

    let first = a.core.handle_request_vote(request("B")).await.unwrap();
    assert!(first.vote_granted);
    assert_eq!(first.term, 5);
    // the vote is durable before the reply goes out
    assert_eq!(a.metadata.load().unwrap().unwrap().voted_for, Some(PeerId::new("B")));

    // same term, different candidate: the vote is not granted twice
    let second = a.core.handle_request_vote(request("C")).await.unwrap();
    assert!(!second.vote_granted);

    // same term, same candidate: re-granted idempotently
    let replay = a.core.handle_request_vote(request("B")).await.unwrap();
    assert!(replay.vote_granted);

    a.core.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_append_entries_from_stale_leader_rejected() {
    let hub = LoopbackHub::new();
    let a = build_node("A", &["A", "B", "C"], &hub, slow_config());
    assert!(a.core.start().unwrap());

    // raise A's term through a vote first
    a.core
        .handle_request_vote(RequestVoteRequest {
            candidate_id: PeerId::new("B"),
            group_id: GroupId::new(TEST_GROUP),
            candidate_term: 5,
            candidate_last_entry: TermIndex::ZERO,
        })
        .await
        .unwrap();

    let reply = a
        .core
        .handle_append_entries(AppendEntriesRequest {
            leader_id: PeerId::new("C"),
            group_id: GroupId::new(TEST_GROUP),
            leader_term: 3,
            previous: None,
            leader_commit: 0,
            initializing: false,
            commit_infos: vec![],
            entries: vec![],
        })
        .await
        .unwrap();
    assert_eq!(reply.result, AppendResult::NotLeader);
    assert_eq!(reply.term, 5);

    a.core.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_append_entries_appends_and_commits() {
    let hub = LoopbackHub::new();
    let a = build_node("A", &["A", "B", "C"], &hub, slow_config());
    assert!(a.core.start().unwrap());

    let entries = vec![
        LogEntry {
            term: 1,
            index: 1,
            payload: EntryPayload::Metadata,
        },
        LogEntry {
            term: 1,
            index: 2,
            payload: EntryPayload::StateMachine(crate::protocol::StateMachineEntry {
                client_id: "X".into(),
                call_id: 1,
                data: b"v".to_vec(),
            }),
        },
    ];
    let reply = a
        .core
        .handle_append_entries(AppendEntriesRequest {
            leader_id: PeerId::new("B"),
            group_id: GroupId::new(TEST_GROUP),
            leader_term: 1,
            previous: None,
            leader_commit: 2,
            initializing: false,
            commit_infos: vec![],
            entries,
        })
        .await
        .unwrap();
    assert_eq!(reply.result, AppendResult::Success);
    assert_eq!(reply.next_index, 3);
    assert_eq!(reply.follower_commit, 2);
    assert_eq!(a.core.leader_id(), Some(PeerId::new("B")));

    // the apply loop reaches the state machine
    assert!(wait_until(DEADLINE, || a.state_machine.apply_count() == 1).await);

    a.core.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_append_entries_with_gap_reports_inconsistency() {
    let hub = LoopbackHub::new();
    let a = build_node("A", &["A", "B", "C"], &hub, slow_config());
    assert!(a.core.start().unwrap());

    let reply = a
        .core
        .handle_append_entries(AppendEntriesRequest {
            leader_id: PeerId::new("B"),
            group_id: GroupId::new(TEST_GROUP),
            leader_term: 1,
            previous: Some(TermIndex::new(1, 10)),
            leader_commit: 10,
            initializing: false,
            commit_infos: vec![],
            entries: vec![LogEntry {
                term: 1,
                index: 11,
                payload: EntryPayload::Metadata,
            }],
        })
        .await
        .unwrap();
    assert_eq!(reply.result, AppendResult::Inconsistency);
    // empty local log: the leader must restart from index 1
    assert_eq!(reply.next_index, 1);

    a.core.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_entry_sequence_is_an_error() {
    let hub = LoopbackHub::new();
    let a = build_node("A", &["A", "B", "C"], &hub, slow_config());
    assert!(a.core.start().unwrap());

    // non-contiguous indices
    let result = a
        .core
        .handle_append_entries(AppendEntriesRequest {
            leader_id: PeerId::new("B"),
            group_id: GroupId::new(TEST_GROUP),
            leader_term: 1,
            previous: None,
            leader_commit: 0,
            initializing: false,
            commit_infos: vec![],
            entries: vec![
                LogEntry {
                    term: 1,
                    index: 1,
                    payload: EntryPayload::Metadata,
                },
                LogEntry {
                    term: 1,
                    index: 3,
                    payload: EntryPayload::Metadata,
                },
            ],
        })
        .await;
    assert!(result.is_err());

    // entry term beyond the leader's term
    let result = a
        .core
        .handle_append_entries(AppendEntriesRequest {
            leader_id: PeerId::new("B"),
            group_id: GroupId::new(TEST_GROUP),
            leader_term: 1,
            previous: None,
            leader_commit: 0,
            initializing: false,
            commit_infos: vec![],
            entries: vec![LogEntry {
                term: 2,
                index: 1,
                payload: EntryPayload::Metadata,
            }],
        })
        .await;
    assert!(result.is_err());

    a.core.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_group_mismatch_is_rejected() {
    let hub = LoopbackHub::new();
    let a = build_node("A", &["A", "B", "C"], &hub, slow_config());
    assert!(a.core.start().unwrap());

    let result = a
        .core
        .handle_request_vote(RequestVoteRequest {
            candidate_id: PeerId::new("B"),
            group_id: GroupId::new("other-group"),
            candidate_term: 1,
            candidate_last_entry: TermIndex::ZERO,
        })
        .await;
    assert!(result.is_err());

    // the client path wraps the mismatch into the reply
    let reply = a
        .core
        .submit_client_request_async(ClientRequest::write("X", 1, "other-group", b"v".to_vec()))
        .await
        .unwrap();
    assert!(!reply.success);
    assert_eq!(reply.exception, Some(ReplyException::GroupMismatch));

    a.core.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_on_follower_returns_not_leader_hint() {
    let (_hub, nodes) = start_cluster(&["A", "B", "C"]);
    let leader_id = elect(&nodes).await;
    let follower = nodes.iter().find(|n| n.id != leader_id).unwrap();
    assert!(
        wait_until(DEADLINE, || follower.core.leader_id() == Some(leader_id.clone())).await
    );

    let reply = follower
        .core
        .submit_client_request_async(write_request("X", 1, b"v"))
        .await
        .unwrap();
    assert!(!reply.success);
    match reply.exception {
        Some(ReplyException::NotLeader { leader_hint, peers }) => {
            assert_eq!(leader_hint.map(|p| p.id), Some(leader_id.clone()));
            assert_eq!(peers.len(), 3);
        }
        other => panic!("expected NotLeader, got {:?}", other),
    }

    for n in &nodes {
        n.core.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_install_snapshot_shape_mismatch_replies_conf_mismatch() {
    let hub = LoopbackHub::new();
    // chunk mode enabled locally, notification arrives
    let a = build_node("A", &["A", "B"], &hub, slow_config());
    assert!(a.core.start().unwrap());

    let reply = a
        .core
        .handle_install_snapshot(InstallSnapshotRequest {
            leader_id: PeerId::new("B"),
            group_id: GroupId::new(TEST_GROUP),
            leader_term: 1,
            kind: SnapshotRequestKind::Notification {
                first_available: TermIndex::new(1, 100),
            },
        })
        .await
        .unwrap();
    assert_eq!(reply.result, InstallSnapshotResult::ConfMismatch);

    a.core.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_peer_group_elects_and_commits_alone() {
    let hub = LoopbackHub::new();
    let a = build_node("A", &["A"], &hub, test_config());
    assert!(a.core.start().unwrap());

    assert!(wait_until(DEADLINE, || a.core.is_leader()).await);
    let reply = a
        .core
        .submit_client_request_async(write_request("X", 1, b"solo"))
        .await
        .unwrap();
    assert!(reply.success);
    assert!(wait_until(DEADLINE, || a.state_machine.apply_count() == 1).await);

    a.core.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pre_append_rejection_steps_leader_down() {
    let hub = LoopbackHub::new();
    let a = build_node("A", &["A"], &hub, test_config());
    assert!(a.core.start().unwrap());
    assert!(wait_until(DEADLINE, || a.core.is_leader()).await);

    a.state_machine.stage_exception_with("inconsistent state");
    let reply = a
        .core
        .submit_client_request_async(write_request("X", 1, b"v"))
        .await
        .unwrap();
    assert!(!reply.success);
    assert!(matches!(reply.exception, Some(ReplyException::StateMachine(_))));
    // the safety fence drops leadership
    assert!(!a.core.is_leader());

    a.core.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_requests_after_shutdown_are_not_ready() {
    let hub = LoopbackHub::new();
    let a = build_node("A", &["A"], &hub, test_config());
    assert!(a.core.start().unwrap());
    assert!(wait_until(DEADLINE, || a.core.is_leader()).await);
    a.core.shutdown();
    assert!(!a.core.is_alive());

    let reply = a
        .core
        .submit_client_request_async(write_request("X", 9, b"late"))
        .await
        .unwrap();
    assert!(!reply.success);
    assert_eq!(reply.exception, Some(ReplyException::NotReady));

    let vote = a
        .core
        .handle_request_vote(RequestVoteRequest {
            candidate_id: PeerId::new("B"),
            group_id: GroupId::new(TEST_GROUP),
            candidate_term: 99,
            candidate_last_entry: TermIndex::ZERO,
        })
        .await;
    assert!(vote.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_read_below_min_index() {
    let (_hub, nodes) = start_cluster(&["A", "B", "C"]);
    let leader_id = elect(&nodes).await;
    let leader = node(&nodes, &leader_id);
    wait_ready(leader).await;

    let reply = leader
        .core
        .submit_client_request_async(ClientRequest {
            client_id: "X".into(),
            call_id: 1,
            group_id: GroupId::new(TEST_GROUP),
            kind: RequestKind::StaleRead {
                min_index: 1_000_000,
                query: b"q".to_vec(),
            },
        })
        .await
        .unwrap();
    assert!(!reply.success);
    assert!(matches!(reply.exception, Some(ReplyException::StaleRead { .. })));

    // a satisfiable stale read goes through the state machine
    let reply = leader
        .core
        .submit_client_request_async(ClientRequest {
            client_id: "X".into(),
            call_id: 2,
            group_id: GroupId::new(TEST_GROUP),
            kind: RequestKind::StaleRead {
                min_index: 0,
                query: b"q".to_vec(),
            },
        })
        .await
        .unwrap();
    assert!(reply.success);
    assert_eq!(reply.message, Some(b"q".to_vec()));

    for n in &nodes {
        n.core.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_watch_resolves_when_index_commits() {
    let (_hub, nodes) = start_cluster(&["A", "B", "C"]);
    let leader_id = elect(&nodes).await;
    let leader = node(&nodes, &leader_id);
    wait_ready(leader).await;

    let watch_core = leader.core.clone();
    let watch = tokio::spawn(async move {
        watch_core
            .submit_client_request_async(ClientRequest {
                client_id: "W".into(),
                call_id: 1,
                group_id: GroupId::new(TEST_GROUP),
                kind: RequestKind::Watch {
                    index: 2,
                    level: crate::protocol::ReplicationLevel::Committed,
                },
            })
            .await
    });
    // give the watch a moment to register before the write commits
    sleep(Duration::from_millis(50)).await;

    let write = leader
        .core
        .submit_client_request_async(write_request("X", 1, b"v"))
        .await
        .unwrap();
    assert!(write.success);

    let reply = watch.await.unwrap().unwrap();
    assert!(reply.success);
    assert_eq!(reply.log_index, 2);

    for n in &nodes {
        n.core.shutdown();
    }
}

//--------------------------------------------------------------------------
// Universal invariants
//--------------------------------------------------------------------------

/// Terms and commit indices only move forward, across an election, a batch
/// of writes and a leadership disturbance.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_term_and_commit_are_monotonic() {
    let (hub, nodes) = start_cluster(&["A", "B", "C"]);
    let leader_id = elect(&nodes).await;
    let leader = node(&nodes, &leader_id);
    wait_ready(leader).await;

    let mut observed: Vec<(u64, u64)> = nodes
        .iter()
        .map(|n| (n.core.current_term(), n.core.commit_index()))
        .collect();

    for call_id in 0..5 {
        let _ = leader
            .core
            .submit_client_request_async(write_request("X", call_id, b"v"))
            .await
            .unwrap();
        for (i, n) in nodes.iter().enumerate() {
            let term = n.core.current_term();
            let commit = n.core.commit_index();
            assert!(term >= observed[i].0, "term went backwards on {}", n.id);
            assert!(commit >= observed[i].1, "commit went backwards on {}", n.id);
            observed[i] = (term, commit);
        }
    }

    // disturb leadership by isolating the leader briefly
    hub.block(&leader_id);
    sleep(Duration::from_millis(600)).await;
    hub.unblock(&leader_id);
    assert!(wait_for_leader(&nodes, DEADLINE).await.is_some());

    for (i, n) in nodes.iter().enumerate() {
        assert!(n.core.current_term() >= observed[i].0);
        assert!(n.core.commit_index() >= observed[i].1);
    }

    for n in &nodes {
        n.core.shutdown();
    }
}
