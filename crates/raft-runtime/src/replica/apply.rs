//! # apply
//!
//! why: committed entries reach the state machine exactly once, in log order
//! relations: woken by replica/mod.rs on Committed events; feeds the ExactlyOnceApplier
//! what: apply loop, resolution of the leader's pending client calls

use raft_core::Response;
use tracing::trace;

use super::Replica;

impl Replica {
    pub(super) fn spawn_apply_loop(&self) {
        let replica = self.clone();
        tokio::spawn(async move { replica.run_apply_loop().await });
    }

    async fn run_apply_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = self.inner.new_commits.notified() => {}
                _ = shutdown.changed() => return,
            }
            if self.apply_committed().is_err() {
                return;
            }
        }
    }

    fn apply_committed(&self) -> raft_core::Result<()> {
        self.with_state(|state| {
            let entries = state.raft.entries_to_apply()?;
            let leading = state.raft.is_leader();
            let term = state.raft.current_term;

            for (index, entry) in entries {
                let output = state.applier.apply(&entry.command);
                trace!(
                    node = %self.inner.id,
                    index,
                    request = %entry.command.request_id,
                    "applied entry"
                );

                // entries from earlier terms had their waiters failed on step-down
                if !leading || entry.term != term {
                    continue;
                }
                if let Some(waiters) = state.pending.remove(&entry.command.request_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Response::Ack(output.clone()));
                    }
                }
            }
            Ok(())
        })
    }
}
