//! # quorum
//!
//! why: elections, pre-votes and replication rounds all wait for "enough" peers out of many
//! relations: used by replica's pre-vote and heartbeat rounds
//! what: Vote/Verdict outcomes, QuorumCombinator, async `quorum` over spawned calls
//!
//! A combinator over N calls and a threshold T resolves:
//! - with the first T acks, as soon as the T-th ack arrives
//! - early, once `errors + nacks + T > N` makes T acks impossible: with the
//!   largest advice carried by any nack, or the last error when no nack came
//!
//! Exactly one resolution is published; later completions are discarded.

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::QuorumError;

/// One call's answer: it agreed (`Ack`) or refused with some advice (`Nack`),
/// e.g. the higher term a peer reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vote<T, A> {
    Ack(T),
    Nack(A),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict<T, A> {
    /// Threshold reached; exactly T values in arrival order
    Accepted(Vec<T>),
    /// Threshold unreachable; the largest advice seen
    Rejected(A),
}

pub type QuorumResult<T, A, E> = Result<Verdict<T, A>, QuorumError<E>>;

struct Tally<T, A, E> {
    acks: Vec<T>,
    nacks: usize,
    errors: usize,
    best_advice: Option<A>,
    last_error: Option<E>,
    resolver: Option<oneshot::Sender<QuorumResult<T, A, E>>>,
}

impl<T, A, E> Tally<T, A, E> {
    fn publish(&mut self, result: QuorumResult<T, A, E>) -> bool {
        match self.resolver.take() {
            Some(resolver) => {
                // the waiter may be gone; the resolution still counts as published
                let _ = resolver.send(result);
                true
            }
            None => false,
        }
    }
}

/// Collects completions of `inputs` concurrent calls until the outcome is known.
pub struct QuorumCombinator<T, A, E> {
    inputs: usize,
    threshold: usize,
    tally: Mutex<Tally<T, A, E>>,
}

impl<T, A: Ord, E> QuorumCombinator<T, A, E> {
    /// Returns the combinator and the receiver its single resolution goes to.
    /// A zero threshold, or one above `inputs`, resolves right away.
    pub fn new(inputs: usize, threshold: usize) -> (Self, oneshot::Receiver<QuorumResult<T, A, E>>) {
        let (resolver, resolution) = oneshot::channel();
        let combinator = Self {
            inputs,
            threshold,
            tally: Mutex::new(Tally {
                acks: Vec::with_capacity(threshold.min(inputs)),
                nacks: 0,
                errors: 0,
                best_advice: None,
                last_error: None,
                resolver: Some(resolver),
            }),
        };

        {
            let mut tally = combinator.lock();
            if threshold == 0 {
                tally.publish(Ok(Verdict::Accepted(Vec::new())));
            } else if inputs < threshold {
                tally.publish(Err(QuorumError::NotEnoughInputs { inputs, threshold }));
            }
        }
        (combinator, resolution)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tally<T, A, E>> {
        self.tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record one completion. Returns true when it published the resolution.
    pub fn record(&self, completion: Result<Vote<T, A>, E>) -> bool {
        let mut tally = self.lock();
        if tally.resolver.is_none() {
            return false;
        }

        match completion {
            Ok(Vote::Ack(value)) => {
                tally.acks.push(value);
                if tally.acks.len() >= self.threshold {
                    let acks = std::mem::take(&mut tally.acks);
                    return tally.publish(Ok(Verdict::Accepted(acks)));
                }
                return false;
            }
            Ok(Vote::Nack(advice)) => {
                tally.nacks += 1;
                tally.best_advice = match tally.best_advice.take() {
                    Some(best) => Some(best.max(advice)),
                    None => Some(advice),
                };
            }
            Err(err) => {
                tally.errors += 1;
                tally.last_error = Some(err);
            }
        }

        if tally.errors + tally.nacks + self.threshold <= self.inputs {
            return false;
        }
        let result = match (tally.best_advice.take(), tally.last_error.take()) {
            (Some(advice), _) => Ok(Verdict::Rejected(advice)),
            (None, Some(err)) => Err(QuorumError::Failed(err)),
            (None, None) => return false,
        };
        tally.publish(result)
    }

    pub fn is_resolved(&self) -> bool {
        self.lock().resolver.is_none()
    }
}

/// Run every call concurrently and resolve per [`QuorumCombinator`].
///
/// Calls still in flight after the resolution keep running to completion;
/// their results are dropped.
pub async fn quorum<T, A, E, F>(calls: Vec<F>, threshold: usize) -> QuorumResult<T, A, E>
where
    F: Future<Output = Result<Vote<T, A>, E>> + Send + 'static,
    T: Send + 'static,
    A: Ord + Send + 'static,
    E: Send + 'static,
{
    let (combinator, resolution) = QuorumCombinator::new(calls.len(), threshold);
    if !combinator.is_resolved() {
        let combinator = Arc::new(combinator);
        for call in calls {
            let combinator = Arc::clone(&combinator);
            tokio::spawn(async move {
                combinator.record(call.await);
            });
        }
    }
    resolution.await.unwrap_or(Err(QuorumError::Abandoned))
}
