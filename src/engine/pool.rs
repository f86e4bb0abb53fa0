//! Worker pool: claims ready units, runs their executables, reports outcomes.

use opentelemetry::KeyValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, error, info, warn};

use super::{Claim, Scheduler};
use crate::error::Result;
use crate::executable::ExecResult;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_work_span};

/// The dispatch loop. Clones share the same shutdown signal and counters.
#[derive(Clone)]
pub struct WorkerPool {
    scheduler: Scheduler,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            shutdown: CancellationToken::new(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Signal the pool to stop claiming work and drain.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Number of executables running right now.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Run the dispatch loop until [`WorkerPool::shutdown`], then wait up to
    /// the drain timeout for running executables.
    pub async fn run(&self) -> Result<()> {
        let config = self.scheduler.config().clone();
        let workers = config.workers.max(1);
        let mut tasks = JoinSet::new();

        info!(workers, "worker pool started");

        loop {
            if let Err(e) = self.dispatch(&mut tasks, workers).await {
                error!("dispatch error: {e}");
            }

            let wait = self.idle_wait(config.poll_interval);
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("worker pool shutting down");
                    break;
                }
                _ = self.scheduler.woken() => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("worker task ended abnormally: {e}");
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let drained = tokio::time::timeout(config.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            // Units aborted here stay Running and are recovered on next open.
            let signalled = self.scheduler.signal_running();
            warn!(
                remaining = tasks.len(),
                signalled, "drain timeout, cancelling and aborting running executables"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        info!("worker pool stopped");
        Ok(())
    }

    /// How long to sleep when nothing else wakes the loop. Units already
    /// due but unclaimed are waiting on a slot or on constraints, so they
    /// do not shorten the wait.
    fn idle_wait(&self, poll: std::time::Duration) -> std::time::Duration {
        match self.scheduler.next_due() {
            Ok(Some(due)) => (due - chrono::Utc::now())
                .to_std()
                .ok()
                .filter(|d| !d.is_zero())
                .map_or(poll, |d| d.min(poll)),
            _ => poll,
        }
    }

    async fn dispatch(&self, tasks: &mut JoinSet<()>, workers: usize) -> Result<()> {
        let free = workers.saturating_sub(tasks.len());
        if free == 0 {
            return Ok(());
        }

        let scheduler = self.scheduler.clone();
        let claims = tokio::task::spawn_blocking(move || scheduler.claim_ready(free))
            .await
            .map_err(|e| crate::error::Error::Other(format!("claim task failed: {e}")))??;

        for claim in claims {
            debug!(work.id = %claim.id(), kind = %claim.context.kind, "dispatching");
            tasks.spawn(execute(self.scheduler.clone(), Arc::clone(&self.active), claim));
        }
        Ok(())
    }
}

/// Run one claimed unit inside its work span and record the outcome.
async fn execute(scheduler: Scheduler, active: Arc<AtomicUsize>, claim: Claim) {
    let id = claim.id();
    let kind = claim.context.kind.clone();
    let span = start_work_span(&kind, &id, claim.context.attempt);

    async {
        let slot = ActiveSlot::take(active);
        let started = Instant::now();

        // A panicking executable must not take the pool down with it. The
        // handle aborts the executable if this task is aborted.
        let result = match AbortOnDropHandle::new(tokio::spawn(claim.run())).await {
            Ok(result) => result,
            Err(e) => ExecResult::failure(format!("executable panicked: {e}")),
        };

        drop(slot);
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::execution_duration_ms().record(
            duration_ms,
            &[
                KeyValue::new("kind", kind.clone()),
                KeyValue::new("result", result.label()),
            ],
        );

        let completion = tokio::task::spawn_blocking(move || scheduler.complete(id, result)).await;
        match completion {
            Ok(Ok(state)) => {
                record_state_transition(&span, "running", &state.to_string());
                info!(work.id = %id, kind = %kind, %state, duration_ms, "execution finished");
            }
            Ok(Err(e)) => error!(work.id = %id, "failed to record outcome: {e}"),
            Err(e) => error!(work.id = %id, "completion task failed: {e}"),
        }
    }
    .instrument(span.clone())
    .await
}

/// Counts one running executable for as long as it is held.
struct ActiveSlot(Arc<AtomicUsize>);

impl ActiveSlot {
    fn take(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self(active)
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
