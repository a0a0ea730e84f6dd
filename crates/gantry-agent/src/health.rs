//! Periodic container state reconciliation.
//!
//! Every interval the loop re-reads each supervised server's engine state
//! into its registry entry. A failure on one server is logged and skipped
//! so a wedged container never blocks the sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::supervisor::Supervisor;

/// Default sweep interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// One sweep over all supervised servers. Returns how many probes failed.
pub async fn health_pass(supervisor: &Supervisor) -> usize {
    let ids = supervisor.server_ids().await;
    let mut failures = 0;
    for id in ids {
        match supervisor.refresh_state(&id).await {
            Ok(status) => debug!(server_id = %id, ?status, "health probe"),
            Err(err) => {
                warn!(server_id = %id, %err, "health probe failed");
                failures += 1;
            }
        }
    }
    failures
}

/// Run the health loop until `shutdown` flips to true.
pub async fn run(
    supervisor: Arc<Supervisor>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(?interval, "health loop started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                health_pass(&supervisor).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("health loop stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ContainerState;
    use crate::supervisor::tests::{test_spec, test_supervisor};
    use gantry_state::ServerStatus;

    #[tokio::test]
    async fn pass_refreshes_every_server() {
        let (engine, supervisor, _dir) = test_supervisor();
        let c1 = supervisor.create_server(test_spec("s1")).await.unwrap();
        supervisor.create_server(test_spec("s2")).await.unwrap();
        engine
            .states
            .lock()
            .unwrap()
            .insert(c1, ContainerState::Running);

        assert_eq!(health_pass(&supervisor).await, 0);
        let e1 = supervisor.entry_snapshot("s1").await.unwrap();
        let e2 = supervisor.entry_snapshot("s2").await.unwrap();
        assert_eq!(e1.status, ServerStatus::Running);
        assert_eq!(e2.status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn one_failing_probe_does_not_block_the_rest() {
        let (engine, supervisor, _dir) = test_supervisor();
        let c1 = supervisor.create_server(test_spec("s1")).await.unwrap();
        let c2 = supervisor.create_server(test_spec("s2")).await.unwrap();
        supervisor.start_server("s1").await.unwrap();

        // s1's probe errors at the engine level; s2's container is found
        // running, so its entry must still flip in the same pass.
        engine
            .states
            .lock()
            .unwrap()
            .insert(c1.clone(), ContainerState::Exited);
        engine.fail_for(&c1, "container_state");
        engine
            .states
            .lock()
            .unwrap()
            .insert(c2.clone(), ContainerState::Running);

        assert_eq!(health_pass(&supervisor).await, 1);
        let e1 = supervisor.entry_snapshot("s1").await.unwrap();
        let e2 = supervisor.entry_snapshot("s2").await.unwrap();
        // Failed probe leaves s1's last known status untouched.
        assert_eq!(e1.status, ServerStatus::Running);
        assert_eq!(e2.status, ServerStatus::Running);

        // Once the engine recovers, the next pass catches s1 up.
        engine.failing_for.lock().unwrap().clear();
        assert_eq!(health_pass(&supervisor).await, 0);
        let e1 = supervisor.entry_snapshot("s1").await.unwrap();
        assert_eq!(e1.status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn loop_exits_on_shutdown() {
        let (_engine, supervisor, _dir) = test_supervisor();
        let supervisor = Arc::new(supervisor);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run(supervisor, Duration::from_secs(3600), rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should exit promptly")
            .unwrap();
    }
}
