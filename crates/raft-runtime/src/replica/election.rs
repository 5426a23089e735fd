//! # election
//!
//! why: followers and candidates must notice a silent leader and campaign
//! relations: spawned from replica/mod.rs on start and role changes; uses ticker.rs and quorum.rs
//! what: election timer task, pre-vote probe, candidacy, RequestVote fan-out

use rand::Rng;
use raft_core::{NodeId, RaftConfig, RequestVoteRequest};
use std::time::Duration;
use tracing::{debug, info};

use super::Replica;
use crate::{quorum, Ticker, Verdict, Vote};

/// A fresh timeout drawn uniformly from `[rtt, 5 * rtt]`.
fn election_timeout(config: &RaftConfig) -> Duration {
    rand::thread_rng().gen_range(config.election_timeout_range())
}

impl Replica {
    pub(super) fn spawn_election_timer(&self, term: u64) {
        let replica = self.clone();
        tokio::spawn(async move { replica.run_election_timer(term).await });
    }

    /// Watch for a missing leader during `term`. Exits once the node leads,
    /// moves to another term or stops.
    async fn run_election_timer(self, term: u64) {
        let mut ticker = Ticker::new(self.inner.config.election_check_interval());
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut timeout = election_timeout(&self.inner.config);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            let elapsed = {
                let state = self.lock();
                if state.halted || state.raft.current_term != term || state.raft.is_leader() {
                    debug!(node = %self.inner.id, term, "election timer exiting");
                    return;
                }
                state.election_reset.elapsed()
            };
            if elapsed < timeout {
                continue;
            }

            if self.inner.config.pre_vote && !self.pre_vote().await {
                debug!(node = %self.inner.id, term, "pre-vote found no reachable majority");
                timeout = election_timeout(&self.inner.config);
                self.lock().election_reset = tokio::time::Instant::now();
                continue;
            }

            if self.campaign(term, timeout) {
                return;
            }
        }
    }

    /// Ask every peer whether it is reachable; succeeds once a majority
    /// (counting this node) answers.
    async fn pre_vote(&self) -> bool {
        let (peers, threshold) = {
            let state = self.lock();
            let peers: Vec<NodeId> = state.raft.peers().cloned().collect();
            (peers, state.raft.quorum_size() - 1)
        };

        let calls: Vec<_> = peers
            .into_iter()
            .map(|peer| {
                let transport = self.inner.transport.clone();
                async move {
                    match transport.reply_success(&peer).await {
                        Ok(true) => Ok(Vote::Ack(peer)),
                        Ok(false) => Ok(Vote::Nack(())),
                        Err(err) => Err(err),
                    }
                }
            })
            .collect();

        matches!(quorum(calls, threshold).await, Ok(Verdict::Accepted(_)))
    }

    /// Become candidate for `timer_term + 1` unless something changed while
    /// the pre-vote was in flight. Returns true when the timer should exit.
    fn campaign(&self, timer_term: u64, timeout: Duration) -> bool {
        let started = self.with_state(|state| {
            if state.raft.current_term != timer_term || state.raft.is_leader() {
                return Ok(None);
            }
            // a heartbeat or vote grant may have landed during the pre-vote
            if state.election_reset.elapsed() < timeout {
                return Ok(None);
            }

            let request = state.raft.start_election()?;
            if state.raft.has_quorum() {
                state.raft.become_leader();
            }
            let peers: Vec<NodeId> = state.raft.peers().cloned().collect();
            Ok(Some((request, peers)))
        });

        let (request, peers) = match started {
            Ok(Some(started)) => started,
            Ok(None) => {
                let state = self.lock();
                return state.halted
                    || state.raft.current_term != timer_term
                    || state.raft.is_leader();
            }
            Err(_) => return true,
        };

        info!(
            node = %self.inner.id,
            term = request.term,
            peers = peers.len(),
            "starting election"
        );
        for peer in peers {
            let replica = self.clone();
            let request = request.clone();
            tokio::spawn(async move { replica.request_vote(peer, request).await });
        }
        true
    }

    async fn request_vote(self, peer: NodeId, request: RequestVoteRequest) {
        let term = request.term;
        let response = match self.inner.transport.request_vote(&peer, request).await {
            Ok(response) => response,
            Err(err) => {
                debug!(node = %self.inner.id, %peer, term, error = %err, "vote request failed");
                return;
            }
        };
        // errors already halted the replica
        let _ = self.with_state(|state| state.raft.handle_vote_response(&peer, term, response));
    }
}
