// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resumable step runner.
//!
//! A [`Saga`] declares an ordered list of steps and the hooks called on
//! expiration, external completion and finish. [`OperationRunner`] drives one
//! saga against its persisted [`Operation`]:
//!
//! ```text
//!            run_once()
//!                │
//!                ▼
//!      ┌──────────────────┐  missing   ┌──────────────┐
//!      │  load operation  │───────────►│ on_not_found │──► finish
//!      └──────────────────┘            └──────────────┘
//!                │ done               ┌──────────────────────┐
//!                ├───────────────────►│ on_completed_outside │──► finish
//!                │                    └──────────────────────┘
//!                │ deadline passed    ┌──────────────────────────────────┐
//!                ├───────────────────►│ fail(DEADLINE_EXCEEDED),         │──► finish
//!                │                    │ on_expired, notify_expired       │
//!                ▼                    └──────────────────────────────────┘
//!      ┌──────────────────┐
//!      │ steps[0..n]      │  AlreadyDone / Continue ─► next step
//!      │                  │  Restart(d)             ─► reschedule after d
//!      │                  │  Finish                 ─► finish
//!      └──────────────────┘
//! ```
//!
//! Every invocation starts again at the first step. Steps detect their own
//! completion from persisted state and answer [`StepResult::AlreadyDone`].
//!
//! Finishing calls [`Saga::notify_finished`], whose return value is the
//! compensating saga to submit, if any.

use async_trait::async_trait;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{SagaError, StoreError};
use crate::failpoints::FailPoints;
use crate::operation::{Operation, OperationStatus};
use crate::persistence::OperationStore;
use crate::step::{DEFAULT_RESTART_DELAY, StepResult};

/// A saga as seen by the scheduler.
pub type BoxedTask = Box<dyn SagaTask>;

/// Lifecycle state of one runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerState {
    /// Submitted, never run.
    Pending,
    /// A step is executing.
    Running,
    /// Sleeping until the next invocation.
    Waiting,
    /// Finished successfully.
    Done,
    /// The operation deadline passed.
    Expired,
    /// Finished with the operation failed.
    Failed,
    /// Stopped by an injected failure; the operation is left as is.
    Crashed,
}

impl RunnerState {
    /// Whether the runner will never be invoked again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Expired | Self::Failed | Self::Crashed)
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Done => "done",
            Self::Expired => "expired",
            Self::Failed => "failed",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Result of one [`SagaTask::run_once`] invocation.
pub enum RunOutcome {
    /// Invoke again after `delay`.
    Reschedule {
        /// Delay before the next invocation.
        delay: Duration,
        /// Sagas started by this invocation.
        spawned: Vec<BoxedTask>,
    },
    /// The runner reached a terminal state.
    Finished {
        /// Terminal state (Done, Expired or Failed).
        state: RunnerState,
        /// Sagas started by this invocation, including the compensation.
        spawned: Vec<BoxedTask>,
    },
    /// An injected failure stopped the runner.
    Crashed(String),
}

impl fmt::Debug for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reschedule { delay, spawned } => f
                .debug_struct("Reschedule")
                .field("delay", delay)
                .field("spawned", &spawned.len())
                .finish(),
            Self::Finished { state, spawned } => f
                .debug_struct("Finished")
                .field("state", state)
                .field("spawned", &spawned.len())
                .finish(),
            Self::Crashed(reason) => f.debug_tuple("Crashed").field(reason).finish(),
        }
    }
}

impl RunOutcome {
    /// Sagas handed over by the invocation.
    pub fn into_spawned(self) -> Vec<BoxedTask> {
        match self {
            Self::Reschedule { spawned, .. } | Self::Finished { spawned, .. } => spawned,
            Self::Crashed(_) => Vec::new(),
        }
    }
}

/// Object-safe view of a runner, used by the scheduler.
#[async_trait]
pub trait SagaTask: Send {
    /// ID of the driven operation.
    fn operation_id(&self) -> &str;

    /// Short description used in logs.
    fn description(&self) -> &str;

    /// Current state.
    fn state(&self) -> RunnerState;

    /// Run steps until one suspends or the saga finishes.
    async fn run_once(&mut self) -> RunOutcome;
}

/// Domain logic of one saga.
#[async_trait]
pub trait Saga: Send + 'static {
    /// Step identifier.
    type Step: Copy + fmt::Debug + Send + Sync + 'static;

    /// Saga kind, e.g. `allocate-vm`.
    fn name(&self) -> &'static str;

    /// Steps in execution order.
    fn steps(&self) -> &'static [Self::Step];

    /// Execute one step.
    async fn run_step(&mut self, step: Self::Step) -> Result<StepResult, SagaError>;

    /// Called once after the operation was failed with `DEADLINE_EXCEEDED`.
    async fn on_expired(&mut self) -> Result<(), SagaError> {
        Ok(())
    }

    /// Called when the operation row no longer exists.
    async fn on_not_found(&mut self) {}

    /// Called when the operation was completed by someone else.
    async fn on_completed_outside(&mut self, _operation: &Operation) -> Result<(), SagaError> {
        Ok(())
    }

    /// Called after [`Saga::on_expired`].
    fn notify_expired(&mut self) {}

    /// Called when the saga finishes. Returns the compensating saga, if any.
    ///
    /// May be called again if finalization is retried; implementations hand out
    /// their compensation at most once.
    fn notify_finished(&mut self) -> Option<BoxedTask> {
        None
    }

    /// Sagas started by the last step, drained after every step.
    fn take_spawned(&mut self) -> Vec<BoxedTask> {
        Vec::new()
    }

    /// Whether the saga failed its operation.
    fn is_failed(&self) -> bool {
        false
    }
}

enum Flow {
    Reschedule(Duration),
    Finish(RunnerState),
    Crash(String),
}

/// Drives a [`Saga`] against its operation.
pub struct OperationRunner<S: Saga> {
    operation_id: String,
    description: String,
    store: Arc<dyn OperationStore>,
    fail_points: Option<Arc<FailPoints>>,
    saga: S,
    state: RunnerState,
}

impl<S: Saga> OperationRunner<S> {
    /// Create a runner for `operation_id`.
    pub fn new(operation_id: impl Into<String>, store: Arc<dyn OperationStore>, saga: S) -> Self {
        let operation_id = operation_id.into();
        let description = format!("{}:{}", saga.name(), operation_id);
        Self {
            operation_id,
            description,
            store,
            fail_points: None,
            saga,
            state: RunnerState::Pending,
        }
    }

    /// Enable step-boundary fault injection.
    pub fn with_fail_points(mut self, fail_points: Option<Arc<FailPoints>>) -> Self {
        self.fail_points = fail_points;
        self
    }

    /// Box the runner for submission.
    pub fn boxed(self) -> BoxedTask {
        Box::new(self)
    }

    /// The driven saga.
    pub fn saga(&self) -> &S {
        &self.saga
    }

    /// Mutable access to the driven saga.
    pub fn saga_mut(&mut self) -> &mut S {
        &mut self.saga
    }

    async fn drive(&mut self, spawned: &mut Vec<BoxedTask>) -> Flow {
        let operation = match self.store.get_operation(&self.operation_id).await {
            Ok(Some(op)) => op,
            Ok(None) => return self.not_found().await,
            Err(e) => {
                warn!(operation_id = %self.operation_id, error = %e, "Cannot load operation, retrying");
                return Flow::Reschedule(DEFAULT_RESTART_DELAY);
            }
        };

        if operation.done {
            return self.completed_outside(&operation).await;
        }

        for &step in self.saga.steps() {
            if operation.is_expired_at(Utc::now()) {
                return self.expire().await;
            }

            debug!(operation_id = %self.operation_id, step = ?step, "Running step");
            let result = self.saga.run_step(step).await;
            spawned.extend(self.saga.take_spawned());

            let result = match result {
                Ok(result) => result,
                Err(e) if e.is_injected() => return Flow::Crash(e.to_string()),
                Err(e) => {
                    error!(
                        operation_id = %self.operation_id,
                        step = ?step,
                        error = %e,
                        "Step failed unexpectedly, restarting"
                    );
                    return Flow::Reschedule(DEFAULT_RESTART_DELAY);
                }
            };

            match result {
                StepResult::AlreadyDone => {
                    debug!(operation_id = %self.operation_id, step = ?step, "Step already done");
                }
                StepResult::Continue => {
                    if let Some(flow) = self.record_progress().await {
                        return flow;
                    }
                }
                StepResult::Restart(delay) => {
                    debug!(
                        operation_id = %self.operation_id,
                        step = ?step,
                        delay_ms = delay.as_millis() as u64,
                        "Step restarts"
                    );
                    return Flow::Reschedule(delay);
                }
                StepResult::Finish => {
                    let state = if self.saga.is_failed() {
                        RunnerState::Failed
                    } else {
                        RunnerState::Done
                    };
                    return Flow::Finish(state);
                }
            }

            if let Some(fp) = &self.fail_points {
                let point = format!("{}/{:?}", self.saga.name(), step);
                if let Err(e) = fp.check(&point) {
                    return Flow::Crash(e.to_string());
                }
            }
        }

        // The last step of every saga either finishes or restarts.
        warn!(operation_id = %self.operation_id, "Steps exhausted without finish");
        Flow::Finish(if self.saga.is_failed() {
            RunnerState::Failed
        } else {
            RunnerState::Done
        })
    }

    async fn record_progress(&mut self) -> Option<Flow> {
        match self.store.update_progress(&self.operation_id).await {
            Ok(()) => None,
            Err(StoreError::AlreadyCompleted(_)) => match self.reload().await {
                Ok(Some(op)) => Some(self.completed_outside(&op).await),
                Ok(None) => Some(self.not_found().await),
                Err(e) => {
                    warn!(operation_id = %self.operation_id, error = %e, "Cannot reload operation");
                    Some(Flow::Reschedule(DEFAULT_RESTART_DELAY))
                }
            },
            Err(e) if e.is_not_found() => Some(self.not_found().await),
            Err(e) => {
                warn!(operation_id = %self.operation_id, error = %e, "Cannot update operation progress");
                Some(Flow::Reschedule(DEFAULT_RESTART_DELAY))
            }
        }
    }

    async fn reload(&mut self) -> Result<Option<Operation>, StoreError> {
        self.store.get_operation(&self.operation_id).await
    }

    async fn not_found(&mut self) -> Flow {
        error!(operation_id = %self.operation_id, "Operation not found");
        self.saga.on_not_found().await;
        Flow::Finish(RunnerState::Failed)
    }

    async fn completed_outside(&mut self, operation: &Operation) -> Flow {
        info!(
            operation_id = %self.operation_id,
            failed = operation.is_failed(),
            "Operation completed outside of the saga"
        );
        if let Err(e) = self.saga.on_completed_outside(operation).await {
            if e.is_injected() {
                return Flow::Crash(e.to_string());
            }
            warn!(operation_id = %self.operation_id, error = %e, "Completed-outside hook failed, retrying");
            return Flow::Reschedule(DEFAULT_RESTART_DELAY);
        }
        if operation.is_failed() {
            Flow::Finish(RunnerState::Failed)
        } else {
            Flow::Finish(RunnerState::Done)
        }
    }

    async fn expire(&mut self) -> Flow {
        warn!(operation_id = %self.operation_id, "Operation deadline exceeded");
        let status = OperationStatus::deadline_exceeded();
        match self.store.fail_operation(&self.operation_id, &status).await {
            Ok(()) => {}
            Err(StoreError::AlreadyCompleted(_)) => {
                return match self.reload().await {
                    Ok(Some(op)) => self.completed_outside(&op).await,
                    Ok(None) => self.not_found().await,
                    Err(_) => Flow::Reschedule(DEFAULT_RESTART_DELAY),
                };
            }
            Err(e) if e.is_not_found() => return self.not_found().await,
            Err(e) => {
                warn!(operation_id = %self.operation_id, error = %e, "Cannot fail expired operation");
                return Flow::Reschedule(DEFAULT_RESTART_DELAY);
            }
        }

        // The operation is failed now; if the hook errors, the next invocation
        // takes the completed-outside path.
        if let Err(e) = self.saga.on_expired().await {
            if e.is_injected() {
                return Flow::Crash(e.to_string());
            }
            warn!(operation_id = %self.operation_id, error = %e, "Expiration hook failed");
            return Flow::Reschedule(DEFAULT_RESTART_DELAY);
        }
        self.saga.notify_expired();
        Flow::Finish(RunnerState::Expired)
    }
}

#[async_trait]
impl<S: Saga> SagaTask for OperationRunner<S> {
    fn operation_id(&self) -> &str {
        &self.operation_id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn state(&self) -> RunnerState {
        self.state
    }

    async fn run_once(&mut self) -> RunOutcome {
        self.state = RunnerState::Running;
        let mut spawned = Vec::new();

        match self.drive(&mut spawned).await {
            Flow::Reschedule(delay) => {
                self.state = RunnerState::Waiting;
                RunOutcome::Reschedule { delay, spawned }
            }
            Flow::Finish(state) => {
                self.state = state;
                if let Some(compensation) = self.saga.notify_finished() {
                    info!(
                        operation_id = %self.operation_id,
                        compensation = %compensation.description(),
                        "Submitting compensation"
                    );
                    spawned.push(compensation);
                }
                info!(operation_id = %self.operation_id, state = %state, "Saga finished");
                RunOutcome::Finished { state, spawned }
            }
            Flow::Crash(reason) => {
                self.state = RunnerState::Crashed;
                warn!(operation_id = %self.operation_id, reason = %reason, "Saga stopped by injected failure");
                RunOutcome::Crashed(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::InMemoryOperationStore;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        First,
        Second,
    }

    /// Counts step invocations; `second_restarts` Restart results before finishing.
    struct CountingSaga {
        first_calls: u32,
        second_calls: u32,
        second_restarts: u32,
        expired: u32,
        finished: u32,
    }

    impl CountingSaga {
        fn new(second_restarts: u32) -> Self {
            Self {
                first_calls: 0,
                second_calls: 0,
                second_restarts,
                expired: 0,
                finished: 0,
            }
        }
    }

    #[async_trait]
    impl Saga for CountingSaga {
        type Step = Step;

        fn name(&self) -> &'static str {
            "counting"
        }

        fn steps(&self) -> &'static [Step] {
            &[Step::First, Step::Second]
        }

        async fn run_step(&mut self, step: Step) -> Result<StepResult, SagaError> {
            match step {
                Step::First => {
                    self.first_calls += 1;
                    if self.first_calls > 1 {
                        Ok(StepResult::AlreadyDone)
                    } else {
                        Ok(StepResult::Continue)
                    }
                }
                Step::Second => {
                    self.second_calls += 1;
                    if self.second_calls <= self.second_restarts {
                        Ok(StepResult::Restart(Duration::from_millis(10)))
                    } else {
                        Ok(StepResult::Finish)
                    }
                }
            }
        }

        async fn on_expired(&mut self) -> Result<(), SagaError> {
            self.expired += 1;
            Ok(())
        }

        fn notify_finished(&mut self) -> Option<BoxedTask> {
            self.finished += 1;
            None
        }
    }

    async fn store_with_op(deadline: Option<chrono::DateTime<Utc>>) -> (Arc<InMemoryOperationStore>, String) {
        let store = Arc::new(InMemoryOperationStore::new());
        let op = Operation::create("test", "counting", deadline, None);
        let id = op.id.clone();
        store.create_operation(&op).await.unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_restart_then_finish() {
        let (store, id) = store_with_op(None).await;
        let mut runner = OperationRunner::new(&id, store.clone(), CountingSaga::new(1));
        assert_eq!(runner.state(), RunnerState::Pending);

        let outcome = runner.run_once().await;
        assert!(matches!(outcome, RunOutcome::Reschedule { delay, .. } if delay == Duration::from_millis(10)));
        assert_eq!(runner.state(), RunnerState::Waiting);

        let outcome = runner.run_once().await;
        assert!(matches!(outcome, RunOutcome::Finished { state: RunnerState::Done, .. }));
        assert_eq!(runner.saga().first_calls, 2);
        assert_eq!(runner.saga().second_calls, 2);
        assert_eq!(runner.saga().finished, 1);
    }

    #[tokio::test]
    async fn test_expired_operation_runs_no_steps() {
        let past = Utc::now() - chrono::Duration::seconds(5);
        let (store, id) = store_with_op(Some(past)).await;
        let mut runner = OperationRunner::new(&id, store.clone(), CountingSaga::new(0));

        let outcome = runner.run_once().await;
        assert!(matches!(outcome, RunOutcome::Finished { state: RunnerState::Expired, .. }));
        assert_eq!(runner.saga().first_calls, 0);
        assert_eq!(runner.saga().expired, 1);

        let op = store.get_operation(&id).await.unwrap().unwrap();
        assert!(op.done);
        assert_eq!(
            op.error.map(|e| e.code),
            Some(crate::operation::StatusCode::DeadlineExceeded)
        );

        // A second invocation sees the done operation and does not expire again.
        let outcome = runner.run_once().await;
        assert!(matches!(outcome, RunOutcome::Finished { state: RunnerState::Failed, .. }));
        assert_eq!(runner.saga().expired, 1);
    }

    #[tokio::test]
    async fn test_missing_operation_finishes() {
        let store = Arc::new(InMemoryOperationStore::new());
        let mut runner = OperationRunner::new("missing", store, CountingSaga::new(0));
        let outcome = runner.run_once().await;
        assert!(matches!(outcome, RunOutcome::Finished { state: RunnerState::Failed, .. }));
        assert_eq!(runner.saga().first_calls, 0);
    }

    #[tokio::test]
    async fn test_step_boundary_fail_point() {
        let (store, id) = store_with_op(None).await;
        let fp = Arc::new(FailPoints::new());
        fp.arm("counting/First");

        let mut runner = OperationRunner::new(&id, store.clone(), CountingSaga::new(0))
            .with_fail_points(Some(fp.clone()));
        let outcome = runner.run_once().await;
        assert!(matches!(outcome, RunOutcome::Crashed(_)));
        assert_eq!(runner.state(), RunnerState::Crashed);
        assert_eq!(runner.saga().second_calls, 0);
        assert_eq!(runner.saga().finished, 0);

        let op = store.get_operation(&id).await.unwrap().unwrap();
        assert!(!op.done);
    }

    #[tokio::test]
    async fn test_store_unavailable_reschedules() {
        let (store, id) = store_with_op(None).await;
        store.inject_unavailable(1);
        let mut runner = OperationRunner::new(&id, store.clone(), CountingSaga::new(0));

        let outcome = runner.run_once().await;
        assert!(matches!(outcome, RunOutcome::Reschedule { delay, .. } if delay == DEFAULT_RESTART_DELAY));
        assert_eq!(runner.saga().first_calls, 0);

        let outcome = runner.run_once().await;
        assert!(matches!(outcome, RunOutcome::Finished { state: RunnerState::Done, .. }));
    }
}
