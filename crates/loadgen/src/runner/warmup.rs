//! Pre-run actor creation.
//!
//! Account creation is expensive compared to the other actions, so building
//! the initial population before dispatch starts keeps that cost out of the
//! steady-state measurement.

use crate::workloads::Workload;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pause after a failed creation before the worker tries again.
const FAILURE_BACKOFF: Duration = Duration::from_millis(100);

/// Outcome of a warmup phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WarmupReport {
    /// Actors created during warmup.
    pub created: u64,
    /// Failed creation attempts.
    pub failures: u64,
    /// Population when warmup finished.
    pub population: usize,
}

/// Fixed pool of workers that create actors until a target population.
#[derive(Clone, Debug)]
pub struct WarmupSupervisor {
    target: usize,
    workers: usize,
    progress_interval: Duration,
}

impl WarmupSupervisor {
    pub fn new(target: usize, workers: usize) -> Self {
        Self {
            target,
            workers: workers.max(1),
            progress_interval: Duration::from_secs(1),
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Whether warmup has anything to do for the given population.
    pub fn is_needed(&self, population: usize) -> bool {
        population < self.target
    }

    /// Create actors until the population reaches the target, the workload
    /// reports its cap, or `cancel` fires.
    pub async fn run<W: Workload>(
        &self,
        workload: Arc<W>,
        cancel: CancellationToken,
    ) -> WarmupReport {
        let start = Instant::now();
        println!(
            "Beginning warmup, generating ~{} actors with {} workers",
            self.target, self.workers
        );

        let created = Arc::new(AtomicU64::new(0));
        let failures = Arc::new(AtomicU64::new(0));

        let progress_cancel = cancel.child_token();
        let progress = tokio::spawn(report_progress(
            Arc::clone(&workload),
            self.target,
            self.progress_interval,
            progress_cancel.clone(),
        ));

        let workers = (0..self.workers).map(|worker_id| {
            let workload = Arc::clone(&workload);
            let created = Arc::clone(&created);
            let failures = Arc::clone(&failures);
            let cancel = cancel.clone();
            let target = self.target;
            tokio::spawn(async move {
                while !cancel.is_cancelled() && workload.population() < target {
                    match workload.create_actor().await {
                        Ok(true) => {
                            created.fetch_add(1, Ordering::Relaxed);
                        }
                        // Population cap reached.
                        Ok(false) => break,
                        Err(e) => {
                            failures.fetch_add(1, Ordering::Relaxed);
                            debug!(worker = worker_id, error = %e, "Warmup actor creation failed");
                            tokio::time::sleep(FAILURE_BACKOFF).await;
                        }
                    }
                }
            })
        });
        join_all(workers).await;

        progress_cancel.cancel();
        let _ = progress.await;

        let report = WarmupReport {
            created: created.load(Ordering::Relaxed),
            failures: failures.load(Ordering::Relaxed),
            population: workload.population(),
        };
        println!("Finished warming up");
        info!(
            created = report.created,
            failures = report.failures,
            population = report.population,
            elapsed_ms = start.elapsed().as_millis(),
            "Warmup complete"
        );
        report
    }
}

async fn report_progress<W: Workload>(
    workload: Arc<W>,
    target: usize,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                println!("{}/{} actors generated", workload.population(), target);
            }
            _ = cancel.cancelled() => return,
        }
    }
}
