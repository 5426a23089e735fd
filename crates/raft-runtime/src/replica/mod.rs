//! # replica
//!
//! why: turn the synchronous raft node into a running cluster member
//! relations: wraps raft_core::RaftNode + ExactlyOnceApplier, talks to peers through transport.rs
//! what: Replica handle, shared locked state, event dispatch, rpc handlers, client execute
//!
//! All mutable state sits behind one mutex that is never held across an
//! `.await`. Background tasks (election timer, heartbeat loop, apply loop)
//! hold a clone of the handle, take the lock for each synchronous step and
//! re-check role and term after every network round trip.

mod apply;
mod election;
mod replication;

use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, Command, Event, ExactlyOnceApplier, LogEntry,
    NodeId, NodeState, RaftConfig, RaftError, RaftNode, RequestId, RequestVoteRequest,
    RequestVoteResponse, Response, StateMachine,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::Transport;

/// Point-in-time view of a replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaStatus {
    pub id: NodeId,
    pub role: NodeState,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub log_length: u64,
}

struct State {
    raft: RaftNode,
    applier: ExactlyOnceApplier,
    /// Leader only: callers waiting for their command to commit
    pending: HashMap<RequestId, Vec<oneshot::Sender<Response>>>,
    /// Last time liveness was observed (leader contact or vote granted)
    election_reset: Instant,
    /// Set on shutdown or a persistence failure; the replica stops participating
    halted: bool,
}

impl State {
    fn fail_pending(&mut self) {
        for (_, waiters) in self.pending.drain() {
            for waiter in waiters {
                let _ = waiter.send(Response::NotALeader);
            }
        }
    }
}

struct Inner {
    id: NodeId,
    config: RaftConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<State>,
    /// commit_index moved; wakes the apply loop
    new_commits: Notify,
    /// the leader has something to send now; wakes the heartbeat loop
    submit: Notify,
    shutdown: watch::Sender<bool>,
}

/// Handle to a running replica. Clones share the same replica.
#[derive(Clone)]
pub struct Replica {
    inner: Arc<Inner>,
}

impl Replica {
    /// Start a replica around `raft`, whose term and vote were loaded from
    /// its store. The state machine is reset: commit and apply progress are
    /// volatile and get rebuilt from the log as the leader's commit index is
    /// learned.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        raft: RaftNode,
        config: RaftConfig,
        machine: Box<dyn StateMachine>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let mut applier = ExactlyOnceApplier::new(machine);
        applier.reset();

        let id = raft.id.clone();
        let term = raft.current_term;
        let (shutdown, _) = watch::channel(false);
        let replica = Self {
            inner: Arc::new(Inner {
                id,
                config,
                transport,
                state: Mutex::new(State {
                    raft,
                    applier,
                    pending: HashMap::new(),
                    election_reset: Instant::now(),
                    halted: false,
                }),
                new_commits: Notify::new(),
                submit: Notify::new(),
                shutdown,
            }),
        };

        info!(node = %replica.inner.id, term, "replica started");
        replica.spawn_election_timer(term);
        replica.spawn_apply_loop();
        replica
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ReplicaStatus {
        let state = self.lock();
        ReplicaStatus {
            id: self.inner.id.clone(),
            role: state.raft.state,
            term: state.raft.current_term,
            leader: state.raft.leader.clone(),
            commit_index: state.raft.commit_index,
            last_applied: state.raft.last_applied,
            log_length: state.raft.log.len(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.lock().halted
    }

    /// Every entry this replica knows to be committed, in log order.
    pub fn committed_entries(&self) -> raft_core::Result<Vec<LogEntry>> {
        let state = self.lock();
        let mut entries = state.raft.log.read_from(1)?;
        entries.truncate(state.raft.commit_index as usize);
        Ok(entries)
    }

    /// Stop every background task. Waiting clients get `NotALeader` and
    /// later rpcs fail with [`RaftError::Halted`].
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.halted {
            return;
        }
        state.halted = true;
        state.fail_pending();
        info!(node = %self.inner.id, term = state.raft.current_term, "replica shut down");
        self.inner.shutdown.send_replace(true);
    }

    // -- rpc handlers --

    pub fn handle_request_vote(
        &self,
        request: &RequestVoteRequest,
    ) -> raft_core::Result<RequestVoteResponse> {
        self.with_state(|state| Ok(state.raft.handle_request_vote(request)?.0))
    }

    pub fn handle_append_entries(
        &self,
        request: &AppendEntriesRequest,
    ) -> raft_core::Result<AppendEntriesResponse> {
        self.with_state(|state| Ok(state.raft.handle_append_entries(request)?.0))
    }

    /// Pre-vote liveness probe
    pub fn reply_success(&self) -> bool {
        self.is_running()
    }

    // -- client entry point --

    /// Replicate and apply `command`.
    ///
    /// On a leader this waits until the command commits, or until leadership
    /// is lost (`NotALeader`). A follower that knows the leader redirects.
    pub async fn execute(&self, command: Command) -> Response {
        let submitted = self.with_state(|state| {
            if !state.raft.is_leader() {
                return Ok(Err(match &state.raft.leader {
                    Some(leader) => Response::RedirectToLeader(leader.clone()),
                    None => Response::NotALeader,
                }));
            }
            let request_id = command.request_id.clone();
            let (waiter, response) = oneshot::channel();
            state.pending.entry(request_id).or_default().push(waiter);
            state.raft.append_entry(command)?;
            Ok(Ok(response))
        });

        match submitted {
            Ok(Ok(response)) => {
                self.inner.submit.notify_one();
                response.await.unwrap_or(Response::NotALeader)
            }
            Ok(Err(redirect)) => redirect,
            Err(_) => Response::NotALeader,
        }
    }

    // -- shared state --

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run one synchronous step against the locked state, then react to the
    /// events it queued. Any error halts the replica.
    fn with_state<R>(
        &self,
        step: impl FnOnce(&mut State) -> raft_core::Result<R>,
    ) -> raft_core::Result<R> {
        let mut state = self.lock();
        if state.halted {
            return Err(RaftError::Halted);
        }
        let result = step(&mut *state);
        let events = state.raft.take_events();
        match result {
            Ok(value) => {
                self.dispatch(&mut *state, events);
                Ok(value)
            }
            Err(err) => {
                self.halt(&mut *state, &err);
                Err(err)
            }
        }
    }

    fn dispatch(&self, state: &mut State, events: Vec<Event>) {
        for event in events {
            match event {
                Event::BecameFollower {
                    term,
                    previous,
                    term_advanced,
                } => {
                    state.fail_pending();
                    // a timer for this term is already running otherwise
                    if term_advanced || previous == NodeState::Leader {
                        self.spawn_election_timer(term);
                    }
                }
                Event::BecameCandidate { term } => self.spawn_election_timer(term),
                Event::BecameLeader { term } => self.spawn_heartbeat(term),
                Event::ResetElectionTimer => state.election_reset = Instant::now(),
                Event::Committed { commit_index } => {
                    debug!(node = %self.inner.id, commit_index, "new commits");
                    self.inner.new_commits.notify_one();
                    if state.raft.is_leader() {
                        // let followers learn the new commit index promptly
                        self.inner.submit.notify_one();
                    }
                }
            }
        }
    }

    /// A persistence failure: the term, vote or log on disk can no longer be
    /// trusted, so stop taking part instead of risking a double vote.
    fn halt(&self, state: &mut State, err: &RaftError) {
        if state.halted {
            return;
        }
        error!(node = %self.inner.id, term = state.raft.current_term, error = %err, "halting replica");
        state.halted = true;
        state.fail_pending();
        self.inner.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}
