//! Timer-driven background tasks
//!
//! The election timer starts elections when the leader goes quiet; the
//! heartbeat ticker keeps followers replicated while we lead.

use crate::raft::RaftCore;
use raftkv_core::Role;
use std::sync::Arc;
use tokio::time::{sleep, sleep_until, Instant};

pub(crate) async fn run_election_timer(core: Arc<RaftCore>) {
    let mut shutdown = core.shutdown_signal();

    loop {
        let deadline = core.context().election_deadline();
        tokio::select! {
            _ = sleep_until(deadline) => {}
            _ = shutdown.changed() => return,
        }

        if core.context().is_leader() || !core.is_member() {
            core.context().reset_election_deadline();
            continue;
        }
        // The deadline moves whenever we hear from a leader or grant a vote.
        if Instant::now() < core.context().election_deadline() {
            continue;
        }

        tracing::debug!(term = core.context().current_term(), "election timeout");
        core.start_election();
    }
}

pub(crate) async fn run_heartbeat(core: Arc<RaftCore>) {
    let mut shutdown = core.shutdown_signal();
    let interval = core.config().heartbeat_interval;

    loop {
        tokio::select! {
            _ = sleep(interval) => {}
            _ = core.replicate_notified().notified() => {}
            _ = shutdown.changed() => return,
        }

        let view = core.context().view();
        if view.role == Role::Leader {
            core.replicate_all(view.current_term);
        }
    }
}
