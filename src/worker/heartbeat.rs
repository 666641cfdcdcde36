use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorError;
use crate::worker::runtime::{ControlPlane, RunningJobs, WorkerRegistration};

/// Sends heartbeats on a fixed interval, independent of job execution.
///
/// Each response may name dispatches whose executions were cancelled; their
/// cancellation tokens are fired so the handlers abort.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
        }
    }

    pub(crate) async fn run(
        &self,
        control: Arc<dyn ControlPlane>,
        registration: WorkerRegistration,
        running: RunningJobs,
        load: Arc<AtomicU32>,
        stop: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately; registration just happened
        interval.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {}
            }

            let current_load = load.load(Ordering::SeqCst);
            match control.heartbeat(&registration.worker_id, current_load).await {
                Ok(cancelled) => {
                    if cancelled.is_empty() {
                        continue;
                    }
                    let running = running.read().await;
                    for token in cancelled {
                        if let Some(cancel) = running.get(&token) {
                            tracing::info!(worker_id = %registration.worker_id, token = %token, "Aborting cancelled dispatch");
                            cancel.cancel();
                        }
                    }
                }
                // Record expired (e.g. after a long pause); register again
                Err(OrchestratorError::WorkerNotFound(_)) => {
                    tracing::warn!(worker_id = %registration.worker_id, "Heartbeat rejected, re-registering");
                    if let Err(e) = control.register(&registration).await {
                        tracing::warn!(worker_id = %registration.worker_id, error = %e, "Re-registration failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(worker_id = %registration.worker_id, error = %e, "Heartbeat failed");
                }
            }
        }
    }
}
