//! Target dispatch rate and the run plan that changes it over time.

use crate::config::RatePeriod;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Current target rate in base actions per second.
///
/// Readers may see a stale value for at most one dispatch interval.
#[derive(Debug)]
pub struct RateController {
    rate: AtomicU64,
}

impl RateController {
    pub fn new(rate: u64) -> Self {
        Self {
            rate: AtomicU64::new(rate.max(1)),
        }
    }

    /// Set a new target rate. Zero is treated as one.
    pub fn set_rate(&self, rate: u64) {
        self.rate.store(rate.max(1), Ordering::Relaxed);
    }

    pub fn current_rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Time between dispatches at the current rate.
    pub fn interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.current_rate())
    }
}

/// Apply each plan segment in order, holding each for its duration.
///
/// Returns when the plan is exhausted (the last rate stays in effect) or when
/// `cancel` fires.
pub async fn execute_plan(
    controller: Arc<RateController>,
    plan: Vec<RatePeriod>,
    cancel: CancellationToken,
) {
    for period in plan {
        controller.set_rate(period.rate);
        println!(
            "Set base action rate to {}/s for {:?}",
            period.rate,
            period.duration()
        );
        tokio::select! {
            _ = tokio::time::sleep(period.duration()) => {}
            _ = cancel.cancelled() => {
                debug!("Run plan cancelled");
                return;
            }
        }
    }
    debug!(rate = controller.current_rate(), "Run plan finished");
}

/// Spawn [`execute_plan`] as an independent task.
pub fn spawn_plan(
    controller: Arc<RateController>,
    plan: Vec<RatePeriod>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(execute_plan(controller, plan, cancel))
}
