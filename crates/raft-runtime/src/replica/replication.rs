//! # replication
//!
//! why: a leader keeps its authority and pushes its log with periodic AppendEntries rounds
//! relations: spawned from replica/mod.rs on BecameLeader; uses ticker.rs and quorum.rs
//! what: heartbeat loop, per-round fan-out, per-peer reply handling

use raft_core::{AppendEntriesRequest, NodeId};
use tracing::{debug, trace};

use super::Replica;
use crate::{quorum, RpcError, Ticker, Verdict, Vote};

impl Replica {
    pub(super) fn spawn_heartbeat(&self, term: u64) {
        let replica = self.clone();
        tokio::spawn(async move { replica.run_heartbeat(term).await });
    }

    /// Send a round right away, then every heartbeat interval or whenever
    /// a client submits. Exits once no longer leader of `term`.
    async fn run_heartbeat(self, term: u64) {
        let mut ticker = Ticker::new(self.inner.config.heartbeat_interval());
        let mut shutdown = self.inner.shutdown.subscribe();

        while self.replicate_round(term) {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.inner.submit.notified() => ticker.reset(),
                _ = shutdown.changed() => break,
            }
        }
        debug!(node = %self.inner.id, term, "heartbeat loop exiting");
    }

    /// Fan out one AppendEntries per peer. Returns false when this node is no
    /// longer leader of `term`.
    fn replicate_round(&self, term: u64) -> bool {
        let round = self.with_state(|state| {
            if !state.raft.is_leader() || state.raft.current_term != term {
                return Ok(None);
            }
            let peers: Vec<NodeId> = state.raft.peers().cloned().collect();
            let mut requests = Vec::with_capacity(peers.len());
            for peer in peers {
                if let Some(request) = state.raft.create_append_entries(&peer)? {
                    requests.push((peer, request));
                }
            }
            Ok(Some((requests, state.raft.quorum_size() - 1)))
        });

        let Ok(Some((requests, threshold))) = round else {
            return false;
        };

        let calls: Vec<_> = requests
            .into_iter()
            .map(|(peer, request)| {
                let replica = self.clone();
                async move { replica.append_entries(peer, request).await }
            })
            .collect();

        let node = self.inner.id.clone();
        tokio::spawn(async move {
            match quorum(calls, threshold).await {
                Ok(Verdict::Accepted(acks)) => trace!(%node, term, ?acks, "round acknowledged"),
                Ok(Verdict::Rejected(seen)) => {
                    debug!(%node, term, highest_term = seen, "round rejected by a majority")
                }
                Err(err) => debug!(%node, term, error = %err, "round failed"),
            }
        });
        true
    }

    /// Send `request` to `peer` and fold the reply into the leader's cursors.
    /// A rejection carries the peer's term as advice.
    async fn append_entries(
        self,
        peer: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<Vote<NodeId, u64>, RpcError> {
        let response = self
            .inner
            .transport
            .append_entries(&peer, request.clone())
            .await?;

        // errors already halted the replica
        let _ = self.with_state(|state| {
            state
                .raft
                .handle_append_entries_response(&peer, &request, response)
        });

        if response.success {
            Ok(Vote::Ack(peer))
        } else {
            Ok(Vote::Nack(response.term))
        }
    }
}
