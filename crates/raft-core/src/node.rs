//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entries, storage.rs for term/vote
//! what: NodeState enum, RaftNode struct, vote/append handlers, commit detection
//!
//! The node does no i/o beyond its log and metadata store. Everything the
//! surrounding runtime has to react to (timer resets, role changes, new
//! commits) is queued as an [`Event`] and drained with [`RaftNode::take_events`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::{Command, Log, LogEntry, MetaStore, NodeId, PersistentState, Result, StorageError};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// Something the runtime driving the node must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The node is (now) a follower. `term_advanced` is false when a candidate
    /// yields to a leader of its own term.
    BecameFollower {
        term: u64,
        previous: NodeState,
        term_advanced: bool,
    },
    BecameCandidate { term: u64 },
    BecameLeader { term: u64 },
    /// Liveness was observed; restart the election timeout.
    ResetElectionTimer,
    /// `commit_index` moved forward.
    Committed { commit_index: u64 },
}

/// A single Raft node in the cluster
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Every member of the cluster, this node included
    pub cluster_nodes: Vec<NodeId>,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node that received our vote in current term (if any)
    pub voted_for: Option<NodeId>,
    /// Leader of the current term, when known
    pub leader: Option<NodeId>,
    pub log: Box<dyn Log>,
    meta: Box<dyn MetaStore>,
    /// Highest index known to be replicated on a majority
    pub commit_index: u64,
    /// Highest index handed to the state machine
    pub last_applied: u64,
    /// Candidate only: who granted us a vote this term
    pub votes_received: BTreeSet<NodeId>,
    /// Leader only: next index to send to each peer
    pub next_index: BTreeMap<NodeId, u64>,
    /// Leader only: highest index known to be stored on each peer
    pub match_index: BTreeMap<NodeId, u64>,
    events: Vec<Event>,
}

impl RaftNode {
    /// Create a follower, restoring term and vote from `meta`
    pub fn new(
        id: impl Into<NodeId>,
        cluster_nodes: Vec<NodeId>,
        log: Box<dyn Log>,
        meta: Box<dyn MetaStore>,
    ) -> Result<Self> {
        let PersistentState { term, voted_for } = meta.load()?;
        Ok(Self {
            id: id.into(),
            cluster_nodes,
            state: NodeState::Follower,
            current_term: term,
            voted_for,
            leader: None,
            log,
            meta,
            commit_index: 0,
            last_applied: 0,
            votes_received: BTreeSet::new(),
            next_index: BTreeMap::new(),
            match_index: BTreeMap::new(),
            events: Vec::new(),
        })
    }

    // -- membership --

    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.cluster_nodes.iter().filter(move |n| **n != self.id)
    }

    pub fn node_count(&self) -> usize {
        self.cluster_nodes.len().max(1)
    }

    /// floor(N/2) + 1
    pub fn quorum_size(&self) -> usize {
        self.node_count() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    // -- log helpers --

    pub fn last_log_index(&self) -> u64 {
        self.log.len()
    }

    pub fn last_log_term(&self) -> Result<u64> {
        Ok(self.log.last_log_term()?)
    }

    /// Term at `index`, or `None` when the entry has been compacted away.
    /// Compacted entries are committed, hence identical on every log.
    fn term_if_retained(&self, index: u64) -> Result<Option<u64>> {
        match self.log.term(index) {
            Ok(term) => Ok(Some(term)),
            Err(StorageError::Compacted { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    fn persist(&mut self) -> Result<()> {
        let state = PersistentState {
            term: self.current_term,
            voted_for: self.voted_for.clone(),
        };
        self.meta.save(&state)?;
        Ok(())
    }

    // -- state transitions --

    /// Step down to follower. A higher `term` is adopted and clears the vote;
    /// the same term keeps it, so a yielding candidate can't vote twice.
    pub fn become_follower(&mut self, term: u64) -> Result<()> {
        let previous = self.state;
        let term_advanced = term > self.current_term;
        if term_advanced {
            self.current_term = term;
            self.voted_for = None;
        }
        self.state = NodeState::Follower;
        self.leader = None;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();

        self.persist()?;

        info!(node = %self.id, term = self.current_term, ?previous, "became follower");
        self.events.push(Event::BecameFollower {
            term: self.current_term,
            previous,
            term_advanced,
        });
        self.events.push(Event::ResetElectionTimer);
        Ok(())
    }

    /// Start an election: next term, vote for self, persist.
    /// Returns the request to fan out to every peer.
    pub fn start_election(&mut self) -> Result<RequestVoteRequest> {
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.votes_received = BTreeSet::from([self.id.clone()]);
        self.leader = None;

        self.persist()?;

        info!(node = %self.id, term = self.current_term, "became candidate");
        self.events.push(Event::BecameCandidate {
            term: self.current_term,
        });
        self.events.push(Event::ResetElectionTimer);

        Ok(RequestVoteRequest {
            term: self.current_term,
            candidate: self.id.clone(),
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term()?,
        })
    }

    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader = Some(self.id.clone());
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        let peers: Vec<NodeId> = self.peers().cloned().collect();
        self.next_index = peers.iter().map(|p| (p.clone(), next)).collect();
        self.match_index = peers.into_iter().map(|p| (p, 0)).collect();

        info!(node = %self.id, term = self.current_term, "became leader");
        self.events.push(Event::BecameLeader {
            term: self.current_term,
        });
    }

    // -- leader election --

    /// Handle a vote reply for the election started in `request_term`.
    /// Returns true when this reply made us leader.
    pub fn handle_vote_response(
        &mut self,
        from: &NodeId,
        request_term: u64,
        response: RequestVoteResponse,
    ) -> Result<bool> {
        if response.term > self.current_term {
            info!(node = %self.id, term = response.term, "term out of date in vote reply");
            self.become_follower(response.term)?;
            return Ok(false);
        }

        if self.state != NodeState::Candidate
            || request_term != self.current_term
            || response.term != self.current_term
        {
            return Ok(false);
        }

        if response.vote_granted {
            self.votes_received.insert(from.clone());
            if self.has_quorum() {
                info!(
                    node = %self.id,
                    term = self.current_term,
                    votes = self.votes_received.len(),
                    "won election"
                );
                self.become_leader();
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns the response and whether the election timer should be reset.
    pub fn handle_request_vote(
        &mut self,
        request: &RequestVoteRequest,
    ) -> Result<(RequestVoteResponse, bool)> {
        if request.term > self.current_term {
            self.become_follower(request.term)?;
        }

        let last_log_index = self.last_log_index();
        let last_log_term = self.last_log_term()?;
        let log_ok =
            (request.last_log_term, request.last_log_index) >= (last_log_term, last_log_index);
        let can_vote = match &self.voted_for {
            None => true,
            Some(candidate) => *candidate == request.candidate,
        };

        let vote_granted = request.term == self.current_term && can_vote && log_ok;
        if vote_granted {
            self.voted_for = Some(request.candidate.clone());
            self.persist()?;
            self.events.push(Event::ResetElectionTimer);
            debug!(node = %self.id, candidate = %request.candidate, term = self.current_term, "granted vote");
        }

        let response = RequestVoteResponse {
            term: self.current_term,
            vote_granted,
        };
        Ok((response, vote_granted))
    }

    // -- replication (follower side) --

    /// Returns the response and whether the election timer should be reset.
    pub fn handle_append_entries(
        &mut self,
        request: &AppendEntriesRequest,
    ) -> Result<(AppendEntriesResponse, bool)> {
        if request.term < self.current_term {
            let response = AppendEntriesResponse {
                term: self.current_term,
                ..Default::default()
            };
            return Ok((response, false));
        }

        if request.term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(request.term)?;
        }
        self.leader = Some(request.leader.clone());
        self.events.push(Event::ResetElectionTimer);

        let length = self.log.len();
        let mut response = AppendEntriesResponse {
            term: self.current_term,
            ..Default::default()
        };

        if request.prev_log_index > length {
            response.conflict_index = length + 1;
            response.conflict_term = 0;
            return Ok((response, true));
        }

        if let Some(term) = self.term_if_retained(request.prev_log_index)? {
            if request.prev_log_index > 0 && term != request.prev_log_term {
                response.conflict_term = term;
                response.conflict_index = self.first_index_of_term(request.prev_log_index, term)?;
                debug!(
                    node = %self.id,
                    prev_log_index = request.prev_log_index,
                    conflict_index = response.conflict_index,
                    conflict_term = term,
                    "rejected append entries"
                );
                return Ok((response, true));
            }
        }

        response.success = true;

        // skip the prefix we already hold
        let mut insert_index = request.prev_log_index + 1;
        let mut offset = 0;
        while insert_index <= length && offset < request.entries.len() {
            match self.term_if_retained(insert_index)? {
                Some(term) if term != request.entries[offset].term => break,
                _ => {}
            }
            insert_index += 1;
            offset += 1;
        }

        if offset < request.entries.len() {
            if insert_index <= length {
                warn!(node = %self.id, from = insert_index, "truncating conflicting suffix");
                self.log.truncate_suffix(insert_index)?;
            }
            debug!(
                node = %self.id,
                from = insert_index,
                count = request.entries.len() - offset,
                "inserting entries"
            );
            self.log.append(&request.entries, offset)?;
        }

        if request.leader_commit_index > self.commit_index {
            let commit_index = request.leader_commit_index.min(self.log.len());
            if commit_index > self.commit_index {
                self.commit_index = commit_index;
                debug!(node = %self.id, commit_index, "follower advanced commit index");
                self.events.push(Event::Committed { commit_index });
            }
        }

        Ok((response, true))
    }

    /// Walk back from `index` to the first entry carrying `term`.
    fn first_index_of_term(&self, index: u64, term: u64) -> Result<u64> {
        let mut first = index;
        while first > 1 {
            match self.term_if_retained(first - 1)? {
                Some(t) if t == term => first -= 1,
                _ => break,
            }
        }
        Ok(first)
    }

    // -- replication (leader side) --

    /// Append a client command to the leader's log. `None` when not leader.
    pub fn append_entry(&mut self, command: Command) -> Result<Option<u64>> {
        if !self.is_leader() {
            return Ok(None);
        }
        let entry = LogEntry::new(self.current_term, command);
        self.log.append(std::slice::from_ref(&entry), 0)?;
        let index = self.log.len();
        debug!(node = %self.id, index, term = self.current_term, "appended entry");

        // a cluster of one commits on append
        self.advance_commit_index()?;
        Ok(Some(index))
    }

    /// Build the AppendEntries carrying everything from `next_index[peer]` on.
    pub fn create_append_entries(&self, peer: &NodeId) -> Result<Option<AppendEntriesRequest>> {
        if !self.is_leader() {
            return Ok(None);
        }
        let Some(&next_index) = self.next_index.get(peer) else {
            return Ok(None);
        };

        let prev_log_index = next_index - 1;
        let Some(prev_log_term) = self.term_if_retained(prev_log_index)? else {
            warn!(node = %self.id, %peer, prev_log_index, "peer is behind the compacted prefix");
            return Ok(None);
        };

        Ok(Some(AppendEntriesRequest {
            term: self.current_term,
            leader: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries: self.log.read_from(next_index)?,
            leader_commit_index: self.commit_index,
        }))
    }

    /// Handle a peer's reply to `request`. Returns true when the commit index moved.
    pub fn handle_append_entries_response(
        &mut self,
        peer: &NodeId,
        request: &AppendEntriesRequest,
        response: AppendEntriesResponse,
    ) -> Result<bool> {
        if response.term > self.current_term {
            info!(node = %self.id, term = response.term, "term out of date in append entries reply");
            self.become_follower(response.term)?;
            return Ok(false);
        }

        if self.state != NodeState::Leader
            || request.term != self.current_term
            || response.term != self.current_term
        {
            return Ok(false);
        }

        let sent_next = request.prev_log_index + 1;
        if response.success {
            let next = sent_next + request.entries.len() as u64;
            self.next_index.insert(peer.clone(), next);
            let matched = self.match_index.entry(peer.clone()).or_insert(0);
            *matched = (*matched).max(next - 1);
            debug!(node = %self.id, %peer, next_index = next, match_index = *matched, "append entries accepted");
            return self.advance_commit_index();
        }

        let mut next = response.conflict_index.max(1);
        if response.conflict_term > 0 {
            let mut index = self.log.len();
            while index > 0 {
                match self.term_if_retained(index)? {
                    Some(term) if term == response.conflict_term => {
                        next = index + 1;
                        break;
                    }
                    Some(_) => index -= 1,
                    None => break,
                }
            }
        }
        let next = next.min(self.log.len() + 1);
        self.next_index.insert(peer.clone(), next);
        debug!(node = %self.id, %peer, next_index = next, "append entries rejected, backing off");
        Ok(false)
    }

    /// Commit the highest current-term index stored on a majority.
    /// Earlier-term entries commit only underneath such an index.
    pub fn advance_commit_index(&mut self) -> Result<bool> {
        if !self.is_leader() {
            return Ok(false);
        }
        let quorum = self.quorum_size();
        let previous = self.commit_index;

        let mut index = self.log.len();
        while index > self.commit_index {
            match self.term_if_retained(index)? {
                Some(term) if term == self.current_term => {
                    let replicas =
                        1 + self.match_index.values().filter(|m| **m >= index).count();
                    if replicas >= quorum {
                        self.commit_index = index;
                        break;
                    }
                }
                // terms never increase walking backwards
                _ => break,
            }
            index -= 1;
        }

        if self.commit_index != previous {
            info!(node = %self.id, commit_index = self.commit_index, "leader advanced commit index");
            self.events.push(Event::Committed {
                commit_index: self.commit_index,
            });
            return Ok(true);
        }
        Ok(false)
    }

    // -- state machine application --

    /// Committed entries not yet applied; marks them applied.
    pub fn entries_to_apply(&mut self) -> Result<Vec<(u64, LogEntry)>> {
        let mut entries = Vec::new();
        for index in (self.last_applied + 1)..=self.commit_index {
            entries.push((index, self.log.read(index)?));
        }
        self.last_applied = self.last_applied.max(self.commit_index);
        Ok(entries)
    }
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("current_term", &self.current_term)
            .field("voted_for", &self.voted_for)
            .field("leader", &self.leader)
            .field("log_length", &self.log.len())
            .field("commit_index", &self.commit_index)
            .field("last_applied", &self.last_applied)
            .finish()
    }
}
