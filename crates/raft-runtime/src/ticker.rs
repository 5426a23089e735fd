//! # ticker
//!
//! why: election checks and heartbeats both need a periodic signal that can be restarted
//! relations: used by replica's election timer and heartbeat loop
//! what: Ticker over a capacity-1 channel fed by a background task

use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Resettable periodic signal.
///
/// Ticks land in a channel of capacity one, so a slow consumer sees at most
/// one pending tick instead of a backlog. The background task stops when the
/// ticker is dropped.
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    tx: mpsc::Sender<()>,
    rx: mpsc::Receiver<()>,
    task: JoinHandle<()>,
}

impl Ticker {
    /// Start ticking every `period`; the first tick fires one period from now.
    pub fn new(period: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let task = spawn_ticks(period, tx.clone());
        Self {
            period,
            tx,
            rx,
            task,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next tick.
    pub async fn tick(&mut self) {
        // self.tx keeps the channel open, so recv never yields None
        let _ = self.rx.recv().await;
    }

    /// Restart the interval from now, discarding a pending tick.
    pub fn reset(&mut self) {
        self.task.abort();
        while self.rx.try_recv().is_ok() {}
        self.task = spawn_ticks(self.period, self.tx.clone());
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn spawn_ticks(period: Duration, tx: mpsc::Sender<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match tx.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Closed(())) => return,
            }
        }
    })
}
