//! # client
//!
//! why: callers should not have to chase leaders or worry about duplicate retries
//! relations: drives Replica::execute on replica.rs handles; used by the simulator and cluster tests
//! what: Client with leader tracking, redirect following and same-id retries

use raft_core::{Command, NodeId, RequestId, Response};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::Replica;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("no leader accepted request {request} after {attempts} attempts")]
    NoLeader { request: RequestId, attempts: usize },

    #[error("client has no replicas to talk to")]
    NoReplicas,
}

/// A client session. Every command gets the next request index; retries of
/// one command reuse its id, so the cluster applies it at most once.
pub struct Client {
    id: String,
    next_index: u64,
    replicas: BTreeMap<NodeId, Replica>,
    leader: Option<NodeId>,
    retry_delay: Duration,
    attempt_timeout: Duration,
    max_attempts: usize,
}

impl Client {
    pub fn new(id: impl Into<String>, replicas: impl IntoIterator<Item = Replica>) -> Self {
        Self {
            id: id.into(),
            next_index: 1,
            replicas: replicas
                .into_iter()
                .map(|replica| (replica.id().clone(), replica))
                .collect(),
            leader: None,
            retry_delay: Duration::from_millis(50),
            attempt_timeout: Duration::from_secs(1),
            max_attempts: 50,
        }
    }

    pub fn with_retry(mut self, retry_delay: Duration, max_attempts: usize) -> Self {
        self.retry_delay = retry_delay;
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// How long to wait on one replica before trying another. A leader cut
    /// off from its majority keeps the call pending until it steps down.
    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// Swap in a restarted replica under the same id.
    pub fn replace(&mut self, replica: Replica) {
        self.replicas.insert(replica.id().clone(), replica);
    }

    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    /// Allocate the next request id of this session.
    pub fn next_request_id(&mut self) -> RequestId {
        let request_id = RequestId::new(self.id.clone(), self.next_index);
        self.next_index += 1;
        request_id
    }

    /// Submit `payload` under a fresh request id.
    pub async fn execute(&mut self, payload: impl Into<Vec<u8>>) -> Result<Vec<u8>, ClientError> {
        let request_id = self.next_request_id();
        self.execute_as(Command::new(request_id, payload)).await
    }

    /// Submit `command` as is, retrying until some leader acknowledges it.
    pub async fn execute_as(&mut self, command: Command) -> Result<Vec<u8>, ClientError> {
        if self.replicas.is_empty() {
            return Err(ClientError::NoReplicas);
        }
        let order: Vec<NodeId> = self.replicas.keys().cloned().collect();
        let mut next_guess = 0;

        for attempt in 1..=self.max_attempts {
            let target = match self.leader.clone() {
                Some(leader) if self.replicas.contains_key(&leader) => leader,
                _ => {
                    let guess = order[next_guess % order.len()].clone();
                    next_guess += 1;
                    guess
                }
            };
            let Some(replica) = self.replicas.get(&target) else {
                continue;
            };

            let response =
                tokio::time::timeout(self.attempt_timeout, replica.execute(command.clone())).await;
            match response.unwrap_or(Response::NotALeader) {
                Response::Ack(output) => {
                    self.leader = Some(target);
                    return Ok(output);
                }
                Response::RedirectToLeader(leader) => {
                    debug!(client = %self.id, attempt, %target, %leader, "redirected");
                    // follow the redirect right away unless it points back here
                    let retry_now = leader != target;
                    self.leader = Some(leader);
                    if retry_now {
                        continue;
                    }
                }
                Response::NotALeader => {
                    debug!(client = %self.id, attempt, %target, "not a leader");
                    self.leader = None;
                }
            }
            tokio::time::sleep(self.retry_delay).await;
        }

        Err(ClientError::NoLeader {
            request: command.request_id,
            attempts: self.max_attempts,
        })
    }
}
