// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Saga scheduler.
//!
//! Every submitted saga lives in its own tokio task that repeatedly calls
//! [`SagaTask::run_once`]. A semaphore bounds how many invocations execute at
//! the same time; `Restart` delays are slept without holding a permit. The
//! registry is keyed by operation id, so a second submission of a live
//! operation is ignored.
//!
//! Shutdown stops re-invocation. Invocations already in flight run to their
//! end; sagas that did not finish are picked up by restore on the next start.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, watch};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::runner::{BoxedTask, RunOutcome, RunnerState};
use crate::step::DEFAULT_RESTART_DELAY;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of saga invocations executing at once.
    pub max_concurrent_sagas: usize,
    /// How many terminal states are kept for [`SagaScheduler::finished_state`].
    pub retain_finished: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sagas: 32,
            retain_finished: 1024,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    description: String,
    state: RunnerState,
}

#[derive(Default)]
struct Registry {
    live: HashMap<String, Entry>,
    finished: HashMap<String, RunnerState>,
    finished_order: VecDeque<String>,
    submitted: u64,
}

struct Inner {
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    registry: Mutex<Registry>,
    changed: Notify,
    shutdown_tx: watch::Sender<bool>,
}

/// Bounded-concurrency executor for sagas.
#[derive(Clone)]
pub struct SagaScheduler {
    inner: Arc<Inner>,
}

impl SagaScheduler {
    /// Create a scheduler.
    pub fn new(config: SchedulerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_sagas.max(1)));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                permits,
                registry: Mutex::new(Registry::default()),
                changed: Notify::new(),
                shutdown_tx,
            }),
        }
    }

    /// Submit a saga. Returns `false` if the operation already has a live saga
    /// or the scheduler is shut down.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, task: BoxedTask) -> bool {
        Inner::spawn_task(&self.inner, task)
    }

    /// Submit several sagas, returning how many were accepted.
    pub fn submit_all(&self, tasks: impl IntoIterator<Item = BoxedTask>) -> usize {
        tasks
            .into_iter()
            .map(|task| self.submit(task))
            .filter(|accepted| *accepted)
            .count()
    }

    /// Whether a saga for `operation_id` is live.
    pub fn is_live(&self, operation_id: &str) -> bool {
        self.inner.lock().live.contains_key(operation_id)
    }

    /// Current state of a live saga.
    pub fn state(&self, operation_id: &str) -> Option<RunnerState> {
        self.inner.lock().live.get(operation_id).map(|e| e.state)
    }

    /// Terminal state of a recently finished saga.
    pub fn finished_state(&self, operation_id: &str) -> Option<RunnerState> {
        self.inner.lock().finished.get(operation_id).copied()
    }

    /// Number of live sagas.
    pub fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Descriptions of live sagas, sorted.
    pub fn live_descriptions(&self) -> Vec<String> {
        let mut out: Vec<_> = self
            .inner
            .lock()
            .live
            .values()
            .map(|e| e.description.clone())
            .collect();
        out.sort();
        out
    }

    /// Total accepted submissions.
    pub fn submitted_count(&self) -> u64 {
        self.inner.lock().submitted
    }

    /// Wait until the saga for `operation_id` reaches a terminal state.
    pub async fn wait_for(&self, operation_id: &str) -> RunnerState {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let registry = self.inner.lock();
                if !registry.live.contains_key(operation_id) {
                    if let Some(state) = registry.finished.get(operation_id) {
                        return *state;
                    }
                }
            }
            notified.await;
        }
    }

    /// Wait until the saga for `operation_id` finishes, bounded by `timeout`.
    pub async fn wait_for_timeout(
        &self,
        operation_id: &str,
        timeout: Duration,
    ) -> Option<RunnerState> {
        tokio::time::timeout(timeout, self.wait_for(operation_id))
            .await
            .ok()
    }

    /// Wait until no saga is live.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.lock().live.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stop re-invoking sagas and wait for in-flight invocations to end.
    pub async fn shutdown(&self) {
        info!(live = self.live_count(), "Saga scheduler shutting down");
        self.inner.shutdown_tx.send_replace(true);
        self.wait_idle().await;
        info!("Saga scheduler stopped");
    }

    /// Whether [`SagaScheduler::shutdown`] was called.
    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }
}

impl Default for SagaScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_task(this: &Arc<Self>, task: BoxedTask) -> bool {
        if *this.shutdown_tx.borrow() {
            warn!(saga = %task.description(), "Scheduler is shut down, saga not accepted");
            return false;
        }

        let operation_id = task.operation_id().to_string();
        {
            let mut registry = this.lock();
            if registry.live.contains_key(&operation_id) {
                debug!(operation_id = %operation_id, "Saga already live, submission ignored");
                return false;
            }
            registry.live.insert(
                operation_id.clone(),
                Entry {
                    description: task.description().to_string(),
                    state: task.state(),
                },
            );
            registry.submitted += 1;
        }

        let span = info_span!("saga", name = %task.description());
        tokio::spawn(Self::drive(this.clone(), task).instrument(span));
        true
    }

    fn set_state(&self, operation_id: &str, state: RunnerState) {
        if let Some(entry) = self.lock().live.get_mut(operation_id) {
            entry.state = state;
        }
        self.changed.notify_waiters();
    }

    fn retire(&self, operation_id: &str, state: Option<RunnerState>) {
        {
            let mut registry = self.lock();
            registry.live.remove(operation_id);
            if let Some(state) = state {
                if registry
                    .finished
                    .insert(operation_id.to_string(), state)
                    .is_none()
                {
                    registry.finished_order.push_back(operation_id.to_string());
                }
                while registry.finished_order.len() > self.config.retain_finished {
                    if let Some(old) = registry.finished_order.pop_front() {
                        registry.finished.remove(&old);
                    }
                }
            }
        }
        self.changed.notify_waiters();
    }

    fn drive(this: Arc<Self>, mut task: BoxedTask) -> BoxFuture<'static, ()> {
        async move {
            let operation_id = task.operation_id().to_string();
            let mut shutdown = this.shutdown_tx.subscribe();
            let mut final_state = None;

            loop {
                if *shutdown.borrow() {
                    break;
                }

                let permit = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    permit = this.permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                this.set_state(&operation_id, RunnerState::Running);
                let outcome = match AssertUnwindSafe(task.run_once()).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        error!(operation_id = %operation_id, "Saga step panicked, restarting");
                        RunOutcome::Reschedule {
                            delay: DEFAULT_RESTART_DELAY,
                            spawned: Vec::new(),
                        }
                    }
                };
                drop(permit);

                match outcome {
                    RunOutcome::Reschedule { delay, spawned } => {
                        for child in spawned {
                            Self::spawn_task(&this, child);
                        }
                        this.set_state(&operation_id, RunnerState::Waiting);
                        tokio::select! {
                            biased;
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    RunOutcome::Finished { state, spawned } => {
                        for child in spawned {
                            Self::spawn_task(&this, child);
                        }
                        final_state = Some(state);
                        break;
                    }
                    RunOutcome::Crashed(reason) => {
                        warn!(operation_id = %operation_id, reason = %reason, "Saga crashed");
                        final_state = Some(RunnerState::Crashed);
                        break;
                    }
                }
            }

            if final_state.is_none() {
                debug!(operation_id = %operation_id, "Saga left unfinished at shutdown");
            }
            this.retire(&operation_id, final_state);
        }
        .boxed()
    }
}
