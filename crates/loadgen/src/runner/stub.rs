//! In-memory workload for exercising the runner without a network.

use crate::actors::{Actor, ActorStore};
use crate::client::jws::AccountSigner;
use crate::workloads::{ActionError, ActionKind, ActionOutcome, Workload};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub(crate) struct StubWorkload {
    actors: ActorStore,
    action_time: Duration,
    fail_creates: bool,
    idle: bool,
    started_at: Instant,
    /// Offsets from construction at which each action started.
    starts: Mutex<Vec<Duration>>,
    completed: AtomicU64,
}

impl StubWorkload {
    pub(crate) fn new(max_actors: usize) -> Self {
        Self {
            actors: ActorStore::new(max_actors),
            action_time: Duration::ZERO,
            fail_creates: false,
            idle: false,
            started_at: Instant::now(),
            starts: Mutex::new(Vec::new()),
            completed: AtomicU64::new(0),
        }
    }

    pub(crate) fn with_action_time(mut self, action_time: Duration) -> Self {
        self.action_time = action_time;
        self
    }

    pub(crate) fn failing_creates(mut self) -> Self {
        self.fail_creates = true;
        self
    }

    pub(crate) fn always_idle(mut self) -> Self {
        self.idle = true;
        self
    }

    pub(crate) fn started(&self) -> usize {
        self.starts.lock().len()
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Actions started within `[from, to)` of construction.
    pub(crate) fn started_between(&self, from: Duration, to: Duration) -> usize {
        self.starts
            .lock()
            .iter()
            .filter(|t| **t >= from && **t < to)
            .count()
    }

    async fn work(&self) {
        if !self.action_time.is_zero() {
            tokio::time::sleep(self.action_time).await;
        }
    }
}

#[async_trait]
impl Workload for StubWorkload {
    fn population(&self) -> usize {
        self.actors.len()
    }

    async fn create_actor(&self) -> Result<bool, ActionError> {
        self.work().await;
        if self.fail_creates {
            return Err(ActionError::NothingToDo);
        }
        Ok(self
            .actors
            .try_insert(Actor::new(AccountSigner::generate()))
            .is_ok())
    }

    async fn execute_one(&self) -> ActionOutcome {
        if self.idle {
            return ActionOutcome::Idle;
        }
        self.starts.lock().push(self.started_at.elapsed());
        self.work().await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        ActionOutcome::Completed(ActionKind::NewAuthorization)
    }
}
