//! # network
//!
//! why: run whole clusters inside one process for the simulator and tests
//! relations: implements transport.rs over registered replica.rs handles
//! what: LocalNetwork registry with latency, rpc timeout and partition controls

use async_trait::async_trait;
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, RequestVoteRequest, RequestVoteResponse,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, trace};

use crate::{Replica, RpcError, Transport};

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Default)]
struct Topology {
    replicas: HashMap<NodeId, Replica>,
    isolated: BTreeSet<NodeId>,
    /// severed links, stored with the smaller id first
    cut: BTreeSet<(NodeId, NodeId)>,
}

impl Topology {
    fn connected(&self, a: &NodeId, b: &NodeId) -> bool {
        !self.isolated.contains(a) && !self.isolated.contains(b) && !self.cut.contains(&link(a, b))
    }
}

fn link(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

struct NetworkInner {
    latency: Duration,
    rpc_timeout: Duration,
    topology: Mutex<Topology>,
}

/// In-process network between registered replicas.
///
/// Each call sleeps `latency` on the way out and on the way back. A partition
/// in place at either moment loses the call, which the caller sees as
/// [`RpcError::Unreachable`].
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

impl LocalNetwork {
    pub fn new(latency: Duration) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                latency,
                rpc_timeout: DEFAULT_RPC_TIMEOUT,
                topology: Mutex::new(Topology::default()),
            }),
        }
    }

    /// Must be called before any transport is handed out.
    pub fn with_rpc_timeout(self, rpc_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                latency: self.inner.latency,
                rpc_timeout,
                topology: Mutex::new(Topology::default()),
            }),
        }
    }

    fn topology(&self) -> MutexGuard<'_, Topology> {
        self.inner
            .topology
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make `replica` reachable under its id, replacing an earlier instance.
    pub fn register(&self, replica: Replica) {
        self.topology().replicas.insert(replica.id().clone(), replica);
    }

    /// Take a replica off the network, as if its process died.
    pub fn deregister(&self, id: &NodeId) -> Option<Replica> {
        self.topology().replicas.remove(id)
    }

    pub fn transport(&self, from: impl Into<NodeId>) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            from: from.into(),
            network: self.clone(),
        })
    }

    /// Cut `node` off from every other node.
    pub fn isolate(&self, node: &NodeId) {
        info!(%node, "isolating node");
        self.topology().isolated.insert(node.clone());
    }

    /// Sever the link between `a` and `b` in both directions.
    pub fn disconnect(&self, a: &NodeId, b: &NodeId) {
        info!(%a, %b, "disconnecting link");
        self.topology().cut.insert(link(a, b));
    }

    /// Restore every isolated node and severed link.
    pub fn heal(&self) {
        info!("healing network");
        let mut topology = self.topology();
        topology.isolated.clear();
        topology.cut.clear();
    }

    fn route(&self, from: &NodeId, to: &NodeId) -> Result<Replica, RpcError> {
        let topology = self.topology();
        let lost = || RpcError::Unreachable { peer: to.clone() };
        if !topology.connected(from, to) {
            return Err(lost());
        }
        topology.replicas.get(to).cloned().ok_or_else(lost)
    }
}

struct LocalTransport {
    from: NodeId,
    network: LocalNetwork,
}

impl LocalTransport {
    async fn call<R>(
        &self,
        peer: &NodeId,
        handler: impl FnOnce(&Replica) -> raft_core::Result<R> + Send,
    ) -> Result<R, RpcError> {
        let deliver = async {
            let replica = self.network.route(&self.from, peer)?;
            tokio::time::sleep(self.network.inner.latency).await;
            let reply = handler(&replica).map_err(|err| RpcError::Remote(err.to_string()))?;
            tokio::time::sleep(self.network.inner.latency).await;
            // the reply is lost if the link went down meanwhile
            self.network.route(&self.from, peer)?;
            Ok::<_, RpcError>(reply)
        };

        match tokio::time::timeout(self.network.inner.rpc_timeout, deliver).await {
            Ok(result) => {
                if let Err(err) = &result {
                    trace!(from = %self.from, %peer, error = %err, "rpc failed");
                }
                result
            }
            Err(_) => Err(RpcError::Timeout { peer: peer.clone() }),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        peer: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RpcError> {
        self.call(peer, move |replica| replica.handle_request_vote(&request))
            .await
    }

    async fn append_entries(
        &self,
        peer: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RpcError> {
        self.call(peer, move |replica| replica.handle_append_entries(&request))
            .await
    }

    async fn reply_success(&self, peer: &NodeId) -> Result<bool, RpcError> {
        self.call(peer, |replica| Ok(replica.reply_success())).await
    }
}
