//! Load generator runner that paces and dispatches protocol actions.
//!
//! A run goes through four states:
//!
//! ```text
//! Idle -> Dispatching -> Draining -> Stopped
//! ```
//!
//! Before dispatching, the runner optionally warms the actor population up,
//! starts the challenge responder, and starts the run plan. While
//! dispatching, each tick spawns one independent action task and then sleeps
//! for `1 / rate`. When the runtime elapses (or the run is cancelled) no new
//! actions are spawned; in-flight actions are awaited, never cancelled.

mod rate;
#[cfg(test)]
mod stub;
mod warmup;

pub use rate::{execute_plan, spawn_plan, RateController};
pub use warmup::{WarmupReport, WarmupSupervisor};

use crate::actors::{ActorStore, SnapshotError};
use crate::client::{AcmeClient, ClientError};
use crate::config::{ConfigError, LoadgenConfig, RatePeriod};
use crate::latency::LatencyRecorder;
use crate::nonce::NoncePool;
use crate::process::{ChallengeServerProcess, ManagedProcess, NoopProcess, ProcessError};
use crate::workloads::{AcmeWorkload, ActionError, ActionKind, ActionOutcome, Workload};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Lifecycle of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Dispatching,
    Draining,
    Stopped,
}

/// Counters updated by action tasks.
#[derive(Default)]
pub struct DispatchStats {
    /// Action tasks spawned.
    pub dispatched: AtomicU64,
    /// Actions that completed.
    pub completed: AtomicU64,
    /// Actions that failed.
    pub failed: AtomicU64,
    /// Ticks where no action was eligible.
    pub idle: AtomicU64,
    per_action: DashMap<ActionKind, u64>,
}

impl DispatchStats {
    fn record(&self, outcome: ActionOutcome) {
        match outcome {
            ActionOutcome::Idle => {
                self.idle.fetch_add(1, Ordering::SeqCst);
            }
            ActionOutcome::Completed(kind) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
                *self.per_action.entry(kind).or_default() += 1;
            }
            ActionOutcome::Failed(kind, e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                debug!(action = %kind, error = %e, "Action failed");
            }
        }
    }

    /// Completed actions, by kind.
    pub fn per_action(&self) -> BTreeMap<ActionKind, u64> {
        self.per_action
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Dispatches per second since `start`.
    pub fn rate(&self, start: Instant) -> f64 {
        let elapsed = start.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.dispatched.load(Ordering::SeqCst) as f64 / elapsed
        } else {
            0.0
        }
    }
}

/// Drives a [`Workload`] at the target rate for the configured runtime.
pub struct LoadGenerator<W: Workload> {
    workload: Arc<W>,
    rate: Arc<RateController>,
    run_plan: Vec<RatePeriod>,
    runtime: Duration,
    warmup: Option<WarmupSupervisor>,
    process: Box<dyn ManagedProcess>,
    latency: Option<Arc<LatencyRecorder>>,
    progress_interval: Duration,
    stats: Arc<DispatchStats>,
    state: Arc<RwLock<RunState>>,
}

impl<W: Workload> LoadGenerator<W> {
    /// Create a runner dispatching `workload` at `rate` actions per second.
    pub fn new(workload: Arc<W>, rate: u64) -> Self {
        Self {
            workload,
            rate: Arc::new(RateController::new(rate)),
            run_plan: Vec::new(),
            runtime: Duration::from_secs(60),
            warmup: None,
            process: Box::new(NoopProcess),
            latency: None,
            progress_interval: Duration::from_secs(10),
            stats: Arc::new(DispatchStats::default()),
            state: Arc::new(RwLock::new(RunState::Idle)),
        }
    }

    pub fn with_run_plan(mut self, plan: Vec<RatePeriod>) -> Self {
        self.run_plan = plan;
        self
    }

    pub fn with_runtime(mut self, runtime: Duration) -> Self {
        self.runtime = runtime;
        self
    }

    /// Warm up to `target` actors with `workers` workers before dispatching.
    pub fn with_warmup(mut self, target: usize, workers: usize) -> Self {
        self.warmup = (target > 0).then(|| {
            WarmupSupervisor::new(target, workers).with_progress_interval(self.progress_interval)
        });
        self
    }

    pub fn with_process(mut self, process: Box<dyn ManagedProcess>) -> Self {
        self.process = process;
        self
    }

    pub fn with_latency(mut self, latency: Arc<LatencyRecorder>) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Interval between progress lines, during warmup and dispatch.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self.warmup = self
            .warmup
            .map(|warmup| warmup.with_progress_interval(interval));
        self
    }

    pub fn workload(&self) -> &Arc<W> {
        &self.workload
    }

    pub fn rate(&self) -> &Arc<RateController> {
        &self.rate
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn state(&self) -> RunState {
        *self.state.read()
    }

    fn set_state(&self, state: RunState) {
        *self.state.write() = state;
        debug!(state = ?state, "Run state changed");
    }

    /// Run for the configured runtime.
    pub async fn run(&mut self) -> Result<RunReport, EngineError> {
        self.run_until_cancelled(CancellationToken::new()).await
    }

    /// Run for the configured runtime, or until `cancel` fires.
    ///
    /// The only fatal error is a failure to start the auxiliary process.
    pub async fn run_until_cancelled(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<RunReport, EngineError> {
        if let Some(latency) = &self.latency {
            latency.mark_started();
        }

        if let Some(warmup) = &self.warmup {
            if warmup.is_needed(self.workload.population()) {
                debug!(warmup_target = warmup.target(), "Warming up");
                warmup.run(Arc::clone(&self.workload), cancel.clone()).await;
            }
        }

        // Stopped during warmup, or before the run began.
        if cancel.is_cancelled() {
            info!("Stop requested before dispatch, nothing dispatched");
            self.set_state(RunState::Draining);
            return Ok(self.finish(Instant::now()));
        }

        self.process.start().await?;

        let start = Instant::now();
        let stop = cancel.child_token();
        // The first segment applies from the first tick.
        if let Some(first) = self.run_plan.first() {
            self.rate.set_rate(first.rate);
        }
        let plan_handle = (!self.run_plan.is_empty()).then(|| {
            spawn_plan(Arc::clone(&self.rate), self.run_plan.clone(), stop.clone())
        });
        let progress_handle = tokio::spawn(report_progress(
            Arc::clone(&self.stats),
            Arc::clone(&self.rate),
            Arc::clone(&self.workload),
            start,
            self.progress_interval,
            stop.clone(),
        ));

        info!(
            rate = self.rate.current_rate(),
            runtime_secs = self.runtime.as_secs(),
            plan_segments = self.run_plan.len(),
            population = self.workload.population(),
            "Starting dispatch"
        );
        self.set_state(RunState::Dispatching);

        let tracker = TaskTracker::new();
        self.dispatch(&tracker, &stop).await;

        self.set_state(RunState::Draining);
        stop.cancel();
        tracker.close();
        info!(in_flight = tracker.len(), "Dispatch stopped, draining in-flight actions");
        tracker.wait().await;

        if let Some(handle) = plan_handle {
            let _ = handle.await;
        }
        let _ = progress_handle.await;

        if let Err(e) = self.process.stop().await {
            warn!(error = %e, "Failed to stop challenge server");
        }
        Ok(self.finish(start))
    }

    fn finish(&self, start: Instant) -> RunReport {
        if let Some(latency) = &self.latency {
            latency.mark_stopped();
        }
        self.set_state(RunState::Stopped);

        print_progress(&self.stats, &self.rate, self.workload.population(), start);
        self.report(start)
    }

    /// Spawn one action per interval until the runtime elapses or `stop` fires.
    async fn dispatch(&self, tracker: &TaskTracker, stop: &CancellationToken) {
        let deadline = tokio::time::sleep(self.runtime);
        tokio::pin!(deadline);

        loop {
            if stop.is_cancelled() {
                break;
            }
            let workload = Arc::clone(&self.workload);
            let stats = Arc::clone(&self.stats);
            stats.dispatched.fetch_add(1, Ordering::SeqCst);
            tracker.spawn(async move {
                let outcome = workload.execute_one().await;
                stats.record(outcome);
            });

            // Re-read every tick so rate changes apply within one interval.
            let interval = self.rate.interval();
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = &mut deadline => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    fn report(&self, start: Instant) -> RunReport {
        RunReport {
            duration: start.elapsed(),
            dispatched: self.stats.dispatched.load(Ordering::SeqCst),
            completed: self.stats.completed.load(Ordering::SeqCst),
            failed: self.stats.failed.load(Ordering::SeqCst),
            idle: self.stats.idle.load(Ordering::SeqCst),
            per_action: self.stats.per_action(),
            population: self.workload.population(),
            avg_rate: self.stats.rate(start),
        }
    }
}

impl LoadGenerator<AcmeWorkload> {
    /// Build the full ACME stack described by `config` over `actors`.
    ///
    /// `actors` is passed in so callers can restore a snapshot into it first
    /// and save it after the run.
    pub fn from_config(
        config: &LoadgenConfig,
        actors: Arc<ActorStore>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let latency = Arc::new(LatencyRecorder::new(format!(
            "WFE -- {:?} test at {} base actions / second",
            config.runtime(),
            config.rate
        )));
        let nonces = Arc::new(NoncePool::new());
        let client = Arc::new(AcmeClient::new(config, nonces, Arc::clone(&latency))?);
        let workload = Arc::new(AcmeWorkload::new(config, client, actors)?);

        let process: Box<dyn ManagedProcess> = if config.challenge.skip {
            Box::new(NoopProcess)
        } else {
            Box::new(ChallengeServerProcess::from_config(&config.challenge)?)
        };

        Ok(Self::new(workload, config.rate)
            .with_run_plan(config.run_plan.clone())
            .with_runtime(config.runtime())
            .with_warmup(config.effective_warmup_target(), config.warmup_workers)
            .with_process(process)
            .with_latency(latency)
            .with_progress_interval(config.progress_interval()))
    }

    /// The latency recorder, when built from config.
    pub fn latency(&self) -> Option<&Arc<LatencyRecorder>> {
        self.latency.as_ref()
    }
}

async fn report_progress<W: Workload>(
    stats: Arc<DispatchStats>,
    rate: Arc<RateController>,
    workload: Arc<W>,
    start: Instant,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                print_progress(&stats, &rate, workload.population(), start);
            }
            _ = cancel.cancelled() => return,
        }
    }
}

fn print_progress(stats: &DispatchStats, rate: &RateController, population: usize, start: Instant) {
    println!(
        "[{:>3}s] dispatched: {} | completed: {} | failed: {} | idle: {} | target: {}/s | actual: {:.1}/s | actors: {}",
        start.elapsed().as_secs(),
        stats.dispatched.load(Ordering::SeqCst),
        stats.completed.load(Ordering::SeqCst),
        stats.failed.load(Ordering::SeqCst),
        stats.idle.load(Ordering::SeqCst),
        rate.current_rate(),
        stats.rate(start),
        population,
    );
}

/// Report generated after a run.
#[derive(Clone, Debug)]
pub struct RunReport {
    /// Dispatch duration, including the drain.
    pub duration: Duration,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    /// Ticks where no action was eligible.
    pub idle: u64,
    /// Completed actions, by kind.
    pub per_action: BTreeMap<ActionKind, u64>,
    /// Actor population at the end of the run.
    pub population: usize,
    /// Average dispatches per second.
    pub avg_rate: f64,
}

impl RunReport {
    /// Print the report to stdout.
    pub fn print(&self) {
        println!("\n=== Load Generator Report ===");
        println!("Duration: {:?}", self.duration);
        println!("Dispatched: {}", self.dispatched);
        println!("Completed: {}", self.completed);
        println!("Failed: {}", self.failed);
        println!("Idle: {}", self.idle);
        println!("Avg rate: {:.2}/s", self.avg_rate);
        println!("Actors: {}", self.population);
        for (kind, count) in &self.per_action {
            println!("  {:<20} {}", kind.as_str(), count);
        }
    }
}

/// Errors that abort a run or its setup.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Workload setup failed: {0}")]
    Workload(#[from] ActionError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}
