//! # comprehensive runtime tests
//!
//! why: verify whole clusters elect, replicate and recover under a simulated network
//! relations: drives raft-runtime replicas over LocalNetwork with raft-core and raft-storage stores
//! what: quorum combinator, transport faults, elections, replication, client sessions, restarts, halts

use raft_core::{
    Command, KvStateMachine, Log, LogEntry, MemoryLog, MemoryMetaStore, MetaStore, NodeId,
    NodeState, PersistentState, RaftConfig, RaftNode, RequestId, Response, StorageError,
};
use raft_runtime::{
    quorum, Client, ClientError, LocalNetwork, QuorumError, Replica, RpcError, Verdict, Vote,
};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const RTT_MS: u64 = 50;
const LATENCY: Duration = Duration::from_millis(5);

fn names(size: usize) -> Vec<NodeId> {
    (1..=size).map(|i| format!("n{i}")).collect()
}

struct TestCluster {
    network: LocalNetwork,
    config: RaftConfig,
    members: Vec<NodeId>,
    replicas: BTreeMap<NodeId, Replica>,
}

impl TestCluster {
    fn new(size: usize) -> Self {
        Self::with_config(size, RaftConfig::with_rtt(RTT_MS))
    }

    fn with_config(size: usize, config: RaftConfig) -> Self {
        let mut cluster = Self::empty(size, config);
        for id in cluster.members.clone() {
            cluster.start_node(&id, Box::new(MemoryLog::new()), Box::new(MemoryMetaStore::new()));
        }
        cluster
    }

    fn empty(size: usize, config: RaftConfig) -> Self {
        Self {
            network: LocalNetwork::new(LATENCY),
            config,
            members: names(size),
            replicas: BTreeMap::new(),
        }
    }

    fn start_node(&mut self, id: &str, log: Box<dyn Log>, meta: Box<dyn MetaStore>) -> Replica {
        let raft = RaftNode::new(id, self.members.clone(), log, meta).unwrap();
        let replica = Replica::start(
            raft,
            self.config.clone(),
            Box::new(KvStateMachine::new()),
            self.network.transport(id),
        );
        self.network.register(replica.clone());
        self.replicas.insert(id.to_string(), replica.clone());
        replica
    }

    fn start_from_disk(&mut self, id: &str, root: &Path) -> Replica {
        let (meta, log) = raft_storage::open(root.join(id)).unwrap();
        self.start_node(id, Box::new(log), Box::new(meta))
    }

    fn get(&self, id: &str) -> &Replica {
        &self.replicas[id]
    }

    fn client(&self) -> Client {
        Client::new("client", self.replicas.values().cloned())
            .with_retry(Duration::from_millis(20), 200)
            .with_attempt_timeout(Duration::from_millis(300))
    }

    /// The leader of the highest term seen among running nodes outside `exclude`.
    fn current_leader(&self, exclude: &[&str]) -> Option<(NodeId, u64)> {
        let statuses: Vec<_> = self
            .replicas
            .values()
            .filter(|r| r.is_running() && !exclude.contains(&r.id().as_str()))
            .map(Replica::status)
            .collect();
        let top_term = statuses.iter().map(|s| s.term).max()?;
        statuses
            .into_iter()
            .find(|s| s.role == NodeState::Leader && s.term == top_term)
            .map(|s| (s.id, s.term))
    }

    async fn wait_for_leader(&self, exclude: &[&str]) -> (NodeId, u64) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(leader) = self.current_leader(exclude) {
                return leader;
            }
            assert!(Instant::now() < deadline, "no leader elected");
            sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_for_commit(&self, index: u64) {
        let reached = wait_until(Duration::from_secs(5), || {
            self.replicas
                .values()
                .filter(|r| r.is_running())
                .all(|r| r.status().last_applied >= index)
        })
        .await;
        assert!(reached, "not every replica applied index {index}");
    }

    fn shutdown(&self) {
        for replica in self.replicas.values() {
            replica.shutdown();
        }
    }
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    check()
}

fn committed(replica: &Replica) -> Vec<LogEntry> {
    replica.committed_entries().unwrap()
}

/// Committed logs of all replicas agree on their common prefix.
fn assert_state_machine_safety(cluster: &TestCluster) {
    let logs: Vec<_> = cluster.replicas.values().map(committed).collect();
    for a in &logs {
        for b in &logs {
            let n = a.len().min(b.len());
            assert_eq!(a[..n], b[..n]);
        }
    }
}

fn command(client: &str, index: u64, op: &str) -> Command {
    Command::new(RequestId::new(client, index), op)
}

/// A metadata store that starts failing once `failing` is set.
#[derive(Clone, Default)]
struct FlakyMetaStore {
    inner: MemoryMetaStore,
    failing: Arc<AtomicBool>,
}

impl MetaStore for FlakyMetaStore {
    fn load(&self) -> Result<PersistentState, StorageError> {
        self.inner.load()
    }

    fn save(&mut self, state: &PersistentState) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk unplugged",
            )));
        }
        self.inner.save(state)
    }
}

// =============================================================================
// 1. quorum combinator
// =============================================================================

type Reply = Result<Vote<u32, u64>, RpcError>;

async fn reply(delay_ms: u64, outcome: Reply) -> Reply {
    sleep(Duration::from_millis(delay_ms)).await;
    outcome
}

fn timeout(peer: &str) -> Reply {
    Err(RpcError::Timeout {
        peer: peer.to_string(),
    })
}

#[tokio::test(start_paused = true)]
async fn test_quorum_accepts_at_threshold_acks() {
    let start = Instant::now();
    let calls = vec![
        reply(10, Ok(Vote::Ack(1))),
        reply(20, Ok(Vote::Ack(2))),
        reply(30, Ok(Vote::Ack(3))),
        reply(40, Ok(Vote::Nack(9))),
        reply(50, Ok(Vote::Ack(5))),
    ];

    let result = quorum(calls, 3).await.unwrap();

    assert_eq!(result, Verdict::Accepted(vec![1, 2, 3]));
    assert!(start.elapsed() < Duration::from_millis(40));
}

#[tokio::test(start_paused = true)]
async fn test_quorum_rejects_with_highest_advice() {
    let calls = vec![
        reply(10, Ok(Vote::Nack(4))),
        reply(20, Ok(Vote::Ack(2))),
        reply(30, Ok(Vote::Nack(7))),
        reply(40, Ok(Vote::Nack(5))),
        reply(50, Ok(Vote::Ack(5))),
    ];

    assert_eq!(quorum(calls, 3).await.unwrap(), Verdict::Rejected(7));
}

#[tokio::test(start_paused = true)]
async fn test_quorum_fails_with_last_error_without_nacks() {
    let calls = vec![
        reply(10, timeout("n1")),
        reply(20, timeout("n2")),
        reply(30, timeout("n3")),
        reply(40, Ok(Vote::Ack(4))),
        reply(50, Ok(Vote::Ack(5))),
    ];

    match quorum(calls, 3).await {
        Err(QuorumError::Failed(RpcError::Timeout { peer })) => assert_eq!(peer, "n3"),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_quorum_prefers_rejection_over_errors() {
    let calls = vec![
        reply(10, timeout("n1")),
        reply(20, Ok(Vote::Nack(3))),
        reply(30, timeout("n3")),
        reply(1_000, Ok(Vote::Ack(4))),
        reply(1_000, Ok(Vote::Ack(5))),
    ];

    assert_eq!(quorum(calls, 3).await.unwrap(), Verdict::Rejected(3));
}

#[tokio::test(start_paused = true)]
async fn test_quorum_zero_threshold_and_too_few_inputs() {
    let none: Vec<std::future::Ready<Reply>> = Vec::new();
    assert_eq!(quorum(none, 0).await.unwrap(), Verdict::Accepted(vec![]));

    let two = vec![reply(10, Ok(Vote::Ack(1))), reply(10, Ok(Vote::Ack(2)))];
    assert!(matches!(
        quorum(two, 3).await,
        Err(QuorumError::NotEnoughInputs {
            inputs: 2,
            threshold: 3
        })
    ));
}

// =============================================================================
// 2. local network
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_network_partitions_and_heals() {
    let cluster = TestCluster::new(3);
    let transport = cluster.network.transport("n1");
    let n2 = "n2".to_string();
    let n3 = "n3".to_string();

    assert_eq!(transport.reply_success(&n2).await, Ok(true));

    cluster.network.isolate(&n2);
    assert_eq!(
        transport.reply_success(&n2).await,
        Err(RpcError::Unreachable { peer: n2.clone() })
    );
    assert_eq!(transport.reply_success(&n3).await, Ok(true));

    cluster.network.heal();
    cluster.network.disconnect(&"n1".to_string(), &n3);
    assert_eq!(transport.reply_success(&n2).await, Ok(true));
    assert!(transport.reply_success(&n3).await.is_err());
    // links are cut in both directions
    assert!(cluster
        .network
        .transport("n3")
        .reply_success(&"n1".to_string())
        .await
        .is_err());

    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_network_unknown_peer_and_timeout() {
    let network = LocalNetwork::new(Duration::from_millis(100))
        .with_rpc_timeout(Duration::from_millis(50));
    let transport = network.transport("n1");

    assert!(matches!(
        transport.reply_success(&"ghost".to_string()).await,
        Err(RpcError::Unreachable { .. })
    ));

    let raft = RaftNode::new(
        "n2",
        names(2),
        Box::new(MemoryLog::new()),
        Box::new(MemoryMetaStore::new()),
    )
    .unwrap();
    let replica = Replica::start(
        raft,
        RaftConfig::with_rtt(RTT_MS),
        Box::new(KvStateMachine::new()),
        network.transport("n2"),
    );
    network.register(replica.clone());

    assert_eq!(
        transport.reply_success(&"n2".to_string()).await,
        Err(RpcError::Timeout {
            peer: "n2".to_string()
        })
    );
    replica.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_stopped_replica_fails_liveness_probe() {
    let cluster = TestCluster::new(3);
    cluster.get("n2").shutdown();

    let transport = cluster.network.transport("n1");
    assert_eq!(transport.reply_success(&"n2".to_string()).await, Ok(false));
    cluster.shutdown();
}

// =============================================================================
// 3. elections
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_cluster_elects_single_leader() {
    let cluster = TestCluster::new(3);
    let (leader, term) = cluster.wait_for_leader(&[]).await;

    // followers learn the leader from its heartbeats
    let informed = wait_until(Duration::from_secs(1), || {
        cluster
            .replicas
            .values()
            .all(|r| r.status().leader.as_ref() == Some(&leader) && r.status().term == term)
    })
    .await;
    assert!(informed);

    let leaders = cluster
        .replicas
        .values()
        .filter(|r| r.status().role == NodeState::Leader)
        .count();
    assert_eq!(leaders, 1);
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_leader_per_term() {
    let cluster = TestCluster::new(5);
    let mut leaders: HashMap<u64, NodeId> = HashMap::new();
    let start = Instant::now();

    while start.elapsed() < Duration::from_secs(3) {
        let elapsed = start.elapsed();
        if elapsed > Duration::from_secs(1) && elapsed < Duration::from_secs(2) {
            if let Some((leader, _)) = cluster.current_leader(&[]) {
                cluster.network.isolate(&leader);
            }
        } else if elapsed >= Duration::from_secs(2) {
            cluster.network.heal();
        }

        for status in cluster.replicas.values().map(Replica::status) {
            if status.role == NodeState::Leader {
                let previous = leaders.entry(status.term).or_insert(status.id.clone());
                assert_eq!(previous, &status.id, "two leaders in term {}", status.term);
            }
        }
        sleep(Duration::from_millis(5)).await;
    }

    assert!(leaders.len() >= 2, "the isolated leaders should have been replaced");
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_election_without_pre_vote() {
    let config = RaftConfig {
        pre_vote: false,
        ..RaftConfig::with_rtt(RTT_MS)
    };
    let cluster = TestCluster::with_config(3, config);
    cluster.wait_for_leader(&[]).await;

    let mut client = cluster.client();
    assert_eq!(client.execute("set a 1").await.unwrap(), b"OK");
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_single_node_cluster_leads_and_commits() {
    let cluster = TestCluster::new(1);
    let (leader, _) = cluster.wait_for_leader(&[]).await;
    assert_eq!(leader, "n1");

    let mut client = cluster.client();
    assert_eq!(client.execute("set a 1").await.unwrap(), b"OK");
    assert_eq!(client.execute("get a").await.unwrap(), b"1");
    assert_eq!(cluster.get("n1").status().commit_index, 2);
    cluster.shutdown();
}

// =============================================================================
// 4. replication
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_commands_replicate_to_every_node() {
    let cluster = TestCluster::new(5);
    cluster.wait_for_leader(&[]).await;
    let mut client = cluster.client();

    for i in 0..10 {
        let output = client.execute(format!("set k{i} v{i}")).await.unwrap();
        assert_eq!(output, b"OK");
    }
    assert_eq!(client.execute("get k7").await.unwrap(), b"v7");

    cluster.wait_for_commit(11).await;
    for replica in cluster.replicas.values() {
        let entries = committed(replica);
        assert_eq!(entries.len(), 11);
        assert_eq!(entries[0].command.payload, b"set k0 v0");
    }
    assert_state_machine_safety(&cluster);
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_follower_redirects_to_leader() {
    let cluster = TestCluster::new(3);
    let (leader, _) = cluster.wait_for_leader(&[]).await;
    let follower = cluster
        .replicas
        .values()
        .find(|r| r.id() != &leader)
        .unwrap()
        .clone();

    let knows_leader = wait_until(Duration::from_secs(1), || {
        follower.status().leader.as_ref() == Some(&leader)
    })
    .await;
    assert!(knows_leader);

    let response = follower.execute(command("c", 1, "set a 1")).await;
    assert_eq!(response, Response::RedirectToLeader(leader));
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_lagging_follower_catches_up_after_heal() {
    let cluster = TestCluster::new(3);
    let (leader, _) = cluster.wait_for_leader(&[]).await;
    let lagging = cluster
        .replicas
        .keys()
        .find(|id| **id != leader)
        .unwrap()
        .clone();
    // fully cut off, so its pre-vote keeps failing and it never bumps the term
    cluster.network.isolate(&lagging);

    let mut client = cluster.client();
    for i in 0..5 {
        client.execute(format!("set k{i} v{i}")).await.unwrap();
    }

    cluster.network.heal();
    let last = cluster.get(&leader).status().commit_index;
    cluster.wait_for_commit(last).await;
    assert_state_machine_safety(&cluster);
    cluster.shutdown();
}

// =============================================================================
// 5. client sessions
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_retried_request_applies_once() {
    let cluster = TestCluster::new(3);
    cluster.wait_for_leader(&[]).await;
    let mut client = cluster.client();

    let request = Command::new(client.next_request_id(), "append k x");
    assert_eq!(client.execute_as(request.clone()).await.unwrap(), b"x");
    // same id again: the cached answer, not "xx"
    assert_eq!(client.execute_as(request).await.unwrap(), b"x");
    assert_eq!(client.execute("get k").await.unwrap(), b"x");
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_client_without_replicas() {
    let mut client = Client::new("lonely", Vec::<Replica>::new());
    assert_eq!(client.execute("get a").await, Err(ClientError::NoReplicas));
}

#[tokio::test(start_paused = true)]
async fn test_client_gives_up_without_leader() {
    let cluster = TestCluster::new(3);
    cluster.shutdown();

    let mut client = cluster.client().with_retry(Duration::from_millis(10), 3);
    let err = client.execute("set a 1").await.unwrap_err();
    assert!(matches!(err, ClientError::NoLeader { attempts: 3, .. }));
}

// =============================================================================
// 6. failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_partitioned_leader_is_replaced() {
    let cluster = TestCluster::new(3);
    let (old_leader, old_term) = cluster.wait_for_leader(&[]).await;
    let mut client = cluster.client();
    client.execute("set before 1").await.unwrap();

    cluster.network.isolate(&old_leader);
    let started = Instant::now();
    let (new_leader, new_term) = cluster.wait_for_leader(&[old_leader.as_str()]).await;
    assert_ne!(new_leader, old_leader);
    assert!(new_term > old_term);
    assert!(started.elapsed() < reelection_bound(&cluster.config) * 4);

    assert_eq!(client.execute("set after 2").await.unwrap(), b"OK");
    assert_eq!(client.leader(), Some(&new_leader));

    cluster.network.heal();
    let stepped_down = wait_until(Duration::from_secs(2), || {
        let status = cluster.get(&old_leader).status();
        status.role == NodeState::Follower && status.term >= new_term
    })
    .await;
    assert!(stepped_down);

    let last = cluster.get(&new_leader).status().commit_index;
    cluster.wait_for_commit(last).await;
    assert_state_machine_safety(&cluster);
    assert_eq!(client.execute("get before").await.unwrap(), b"1");
    cluster.shutdown();
}

/// Time for the survivors to elect a leader once the old one is cut off:
/// the longest election timeout, one check period, then the pre-vote and
/// vote round trips, plus one polling step of `wait_for_leader`.
fn reelection_bound(config: &RaftConfig) -> Duration {
    *config.election_timeout_range().end()
        + config.election_check_interval()
        + LATENCY * 4
        + Duration::from_millis(5)
}

#[tokio::test(start_paused = true)]
async fn test_reelection_within_five_rtt() {
    const RUNS: usize = 40;
    let config = RaftConfig::with_rtt(RTT_MS);
    let bound = reelection_bound(&config);
    let mut within = 0;

    for _ in 0..RUNS {
        let cluster = TestCluster::with_config(3, config.clone());
        let (old_leader, old_term) = cluster.wait_for_leader(&[]).await;

        cluster.network.isolate(&old_leader);
        let started = Instant::now();
        let (new_leader, new_term) = cluster.wait_for_leader(&[old_leader.as_str()]).await;
        let elapsed = started.elapsed();

        assert_ne!(new_leader, old_leader);
        assert!(new_term > old_term);
        // each split vote costs at most one more timeout
        assert!(elapsed < bound * 4, "re-election took {elapsed:?}");
        if elapsed <= bound {
            within += 1;
        }
        cluster.shutdown();
    }

    // only split votes between the two survivors overshoot
    assert!(within * 10 >= RUNS * 8, "{within}/{RUNS} re-elections within {bound:?}");
}

#[tokio::test(start_paused = true)]
async fn test_pending_call_fails_when_leadership_is_lost() {
    let cluster = TestCluster::new(3);
    let (leader, _) = cluster.wait_for_leader(&[]).await;
    let old = cluster.get(&leader).clone();

    cluster.network.isolate(&leader);
    let pending = tokio::spawn(async move { old.execute(command("c", 1, "set a 1")).await });

    cluster.wait_for_leader(&[leader.as_str()]).await;
    cluster.network.heal();

    assert_eq!(pending.await.unwrap(), Response::NotALeader);
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_persistence_failure_halts_replica() {
    let mut cluster = TestCluster::empty(3, RaftConfig::with_rtt(RTT_MS));
    let flaky = FlakyMetaStore::default();
    flaky.failing.store(true, Ordering::SeqCst);

    cluster.start_node("n1", Box::new(MemoryLog::new()), Box::new(MemoryMetaStore::new()));
    cluster.start_node("n2", Box::new(MemoryLog::new()), Box::new(MemoryMetaStore::new()));
    let broken = cluster.start_node("n3", Box::new(MemoryLog::new()), Box::new(flaky.clone()));

    let halted = wait_until(Duration::from_secs(5), || !broken.is_running()).await;
    assert!(halted, "a failed save must stop the replica");
    assert_eq!(flaky.inner.get(), PersistentState::default());

    // the remaining majority carries on
    let (leader, _) = cluster.wait_for_leader(&["n3"]).await;
    assert_ne!(leader, "n3");
    let mut client = cluster.client();
    client.execute("set a 1").await.unwrap();

    assert_eq!(
        broken.execute(command("c", 9, "set b 2")).await,
        Response::NotALeader
    );
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_leader_is_replaced() {
    let cluster = TestCluster::new(3);
    let (leader, _) = cluster.wait_for_leader(&[]).await;
    let old = cluster.get(&leader);

    old.shutdown();
    assert!(!old.is_running());
    assert_eq!(old.execute(command("c", 1, "set a 1")).await, Response::NotALeader);

    let (new_leader, _) = cluster.wait_for_leader(&[leader.as_str()]).await;
    assert_ne!(new_leader, leader);
    cluster.shutdown();
}

// =============================================================================
// 7. restarts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_restart_from_disk_keeps_term_vote_and_log() {
    let dir = tempfile::tempdir().unwrap();
    let mut cluster = TestCluster::empty(3, RaftConfig::with_rtt(RTT_MS));
    for id in names(3) {
        cluster.start_from_disk(&id, dir.path());
    }

    cluster.wait_for_leader(&[]).await;
    let mut client = cluster.client();
    for i in 0..3 {
        client.execute(format!("set k{i} v{i}")).await.unwrap();
    }
    cluster.wait_for_commit(3).await;
    let before: BTreeMap<NodeId, _> = cluster
        .replicas
        .values()
        .map(|r| (r.id().clone(), r.status()))
        .collect();

    cluster.shutdown();
    for id in names(3) {
        cluster.network.deregister(&id);
    }

    for id in names(3) {
        let (meta, log) = raft_storage::open(dir.path().join(&id)).unwrap();
        let restored = RaftNode::new(id.as_str(), names(3), Box::new(log), Box::new(meta)).unwrap();
        assert_eq!(restored.current_term, before[&id].term);
        assert_eq!(restored.log.len(), before[&id].log_length);
        if before[&id].role == NodeState::Leader {
            assert_eq!(restored.voted_for.as_ref(), Some(&id));
        }
    }

    for id in names(3) {
        let replica = cluster.start_from_disk(&id, dir.path());
        client.replace(replica);
    }

    cluster.wait_for_leader(&[]).await;
    // committing in the new term commits the restored entries too
    assert_eq!(client.execute("get k1").await.unwrap(), b"v1");
    cluster.wait_for_commit(4).await;
    for replica in cluster.replicas.values() {
        assert_eq!(committed(replica)[2].command.payload, b"set k2 v2");
    }
    assert_state_machine_safety(&cluster);
    cluster.shutdown();
}
