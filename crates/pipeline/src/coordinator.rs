//! Submission coordinator.
//!
//! Resolves a job path, creates its execution and drives it on a background
//! task: `Pending -> Running`, hand the definition to the [`JobRunner`],
//! then record the outcome. Submitters get the workflow id back before the
//! run makes any progress.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tumbler_core::definition::Definition;
use tumbler_core::error::CoreError;
use tumbler_core::path::JobPath;
use tumbler_core::state::StateEvent;
use tumbler_core::types::WorkflowId;

use crate::execution::ExecutionHandle;
use crate::registry::PathRegistry;
use crate::runner::{JobRunner, RunContext, RunnerError};
use crate::store::ExecutionStore;

/// Payload reason for a cancel requested by a client.
pub const REASON_CANCELLED: &str = "cancelled";
/// Payload reason for executions cut short by process shutdown.
pub const REASON_SHUTDOWN: &str = "shutdown";

struct InFlight {
    handle: Arc<ExecutionHandle>,
    cancel: CancellationToken,
}

type InFlightTable = Arc<Mutex<HashMap<WorkflowId, InFlight>>>;

fn lock(table: &InFlightTable) -> MutexGuard<'_, HashMap<WorkflowId, InFlight>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SubmissionCoordinator {
    registry: Arc<PathRegistry>,
    store: Arc<ExecutionStore>,
    runner: Arc<dyn JobRunner>,
    runner_timeout: Option<Duration>,
    in_flight: InFlightTable,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl SubmissionCoordinator {
    pub fn new(
        registry: Arc<PathRegistry>,
        store: Arc<ExecutionStore>,
        runner: Arc<dyn JobRunner>,
        runner_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            store,
            runner,
            runner_timeout,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Submit a job path for execution.
    ///
    /// Returns the new workflow id as soon as the execution exists; the run
    /// itself proceeds in the background.
    pub async fn submit(&self, job_path: &JobPath) -> Result<WorkflowId, CoreError> {
        if self.shutdown.is_cancelled() {
            return Err(CoreError::Conflict("Tracker is shutting down".into()));
        }
        if job_path.is_wildcard() {
            return Err(CoreError::Validation(format!(
                "Cannot submit wildcard path '{job_path}'"
            )));
        }

        let definition = self.registry.resolve(job_path).await?;
        if definition.disabled {
            return Err(CoreError::Validation(format!(
                "Definition '{}' is disabled",
                definition.path
            )));
        }
        self.runner.validate(&definition).map_err(|e| {
            CoreError::Validation(format!("Definition '{}' cannot run: {e}", definition.path))
        })?;

        let handle = self.store.create(job_path.clone()).await;
        let workflow_id = handle.workflow_id();
        let cancel = self.shutdown.child_token();

        lock(&self.in_flight).insert(
            workflow_id,
            InFlight {
                handle: Arc::clone(&handle),
                cancel: cancel.clone(),
            },
        );

        tracing::info!(
            %workflow_id,
            path = %job_path,
            definition = %definition.path,
            kind = %definition.kind,
            "Execution submitted",
        );

        self.tasks.spawn(drive(
            handle,
            definition,
            Arc::clone(&self.runner),
            self.runner_timeout,
            cancel,
            Arc::clone(&self.in_flight),
        ));

        Ok(workflow_id)
    }

    /// Cancel an execution and stop its runner.
    ///
    /// A terminal execution yields `AlreadyTerminal`.
    pub async fn cancel(&self, workflow_id: &WorkflowId) -> Result<StateEvent, CoreError> {
        let handle = self.store.handle(workflow_id).await?;
        let event = handle.cancel(json!({ "reason": REASON_CANCELLED }))?;

        if let Some(in_flight) = lock(&self.in_flight).get(workflow_id) {
            in_flight.cancel.cancel();
        }
        Ok(event)
    }

    /// Number of executions whose driver task has not finished.
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Refuse new submissions, cancel every in-flight execution and wait up
    /// to `grace` for the driver tasks to wind down.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.tasks.close();

        let handles: Vec<Arc<ExecutionHandle>> = lock(&self.in_flight)
            .values()
            .map(|f| Arc::clone(&f.handle))
            .collect();
        let mut cancelled = 0usize;
        for handle in handles {
            if handle.cancel(json!({ "reason": REASON_SHUTDOWN })).is_ok() {
                cancelled += 1;
            }
        }

        tracing::info!(cancelled, "Coordinator shutting down");

        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.in_flight_count(),
                "Driver tasks did not finish within the shutdown grace period",
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

async fn drive(
    handle: Arc<ExecutionHandle>,
    definition: Arc<Definition>,
    runner: Arc<dyn JobRunner>,
    runner_timeout: Option<Duration>,
    cancel: CancellationToken,
    in_flight: InFlightTable,
) {
    let workflow_id = handle.workflow_id();

    if cancel.is_cancelled() {
        let _ = handle.cancel(json!({ "reason": REASON_SHUTDOWN }));
    }

    if handle.start().is_ok() {
        let ctx = RunContext::new(Arc::clone(&handle));
        let run = tokio::spawn(async move { runner.run(definition, ctx).await });
        let abort = run.abort_handle();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = await_runner(run, runner_timeout) => Some(result),
        };

        let recorded = match outcome {
            None => {
                abort.abort();
                if handle.is_terminal() {
                    Ok(())
                } else {
                    handle
                        .cancel(json!({ "reason": REASON_SHUTDOWN }))
                        .map(|_| ())
                }
            }
            Some(Ok(result)) => handle.succeed(json!({ "result": result })).map(|_| ()),
            Some(Err(e)) => {
                tracing::warn!(%workflow_id, error = %e, "Runner failed");
                handle.fail(json!({ "error": e.to_string() })).map(|_| ())
            }
        };

        if let Err(e) = recorded {
            // Lost a race with a cancel; the execution is already terminal.
            tracing::debug!(%workflow_id, error = %e, "Runner outcome not recorded");
        }
    }

    lock(&in_flight).remove(&workflow_id);
}

async fn await_runner(
    run: JoinHandle<Result<serde_json::Value, RunnerError>>,
    timeout: Option<Duration>,
) -> Result<serde_json::Value, RunnerError> {
    let abort = run.abort_handle();
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(joined) => joined,
            Err(_) => {
                abort.abort();
                return Err(RunnerError::Timeout(limit));
            }
        },
        None => run.await,
    };

    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(RunnerError::Panicked(panic_message(e.into_panic()))),
        Err(e) => Err(RunnerError::Other(e.to_string())),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use futures::StreamExt;
    use tumbler_core::definition::DefinitionKind;
    use tumbler_core::state::ExecutionState;
    use tumbler_events::EventBus;

    use super::*;
    use crate::shell::ShellRunner;

    struct Echo;

    #[async_trait]
    impl JobRunner for Echo {
        async fn run(
            &self,
            definition: Arc<Definition>,
            ctx: RunContext,
        ) -> Result<serde_json::Value, RunnerError> {
            ctx.emit_output(format!("building {}", definition.path));
            Ok(json!("ok"))
        }
    }

    struct Failing;

    #[async_trait]
    impl JobRunner for Failing {
        async fn run(
            &self,
            _definition: Arc<Definition>,
            _ctx: RunContext,
        ) -> Result<serde_json::Value, RunnerError> {
            Err(RunnerError::Other("compiler exploded".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl JobRunner for Panicking {
        async fn run(
            &self,
            _definition: Arc<Definition>,
            _ctx: RunContext,
        ) -> Result<serde_json::Value, RunnerError> {
            panic!("runner bug");
        }
    }

    struct Hanging;

    #[async_trait]
    impl JobRunner for Hanging {
        async fn run(
            &self,
            _definition: Arc<Definition>,
            _ctx: RunContext,
        ) -> Result<serde_json::Value, RunnerError> {
            std::future::pending().await
        }
    }

    struct Setup {
        bus: Arc<EventBus>,
        store: Arc<ExecutionStore>,
        coordinator: SubmissionCoordinator,
    }

    fn path(raw: &str) -> JobPath {
        JobPath::parse(raw).unwrap()
    }

    fn setup(runner: impl JobRunner, timeout: Option<Duration>) -> Setup {
        let registry = PathRegistry::from_definitions([
            Definition::new(path("team/build"), DefinitionKind::Job, "make"),
            Definition::new(path("team/service/*"), DefinitionKind::Pipeline, "sh 'make'"),
            Definition::new(path("team/old"), DefinitionKind::Job, "make").disabled(),
        ])
        .unwrap();
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(ExecutionStore::new(Arc::clone(&bus)));
        let coordinator = SubmissionCoordinator::new(
            Arc::new(registry),
            Arc::clone(&store),
            Arc::new(runner),
            timeout,
        );
        Setup {
            bus,
            store,
            coordinator,
        }
    }

    async fn events(bus: &EventBus, id: WorkflowId) -> Vec<StateEvent> {
        let subscription = bus.subscribe(id, 0).unwrap();
        tokio::time::timeout(Duration::from_secs(5), subscription.collect())
            .await
            .expect("workflow should finish")
    }

    async fn wait_running(store: &ExecutionStore, id: &WorkflowId) {
        for _ in 0..500 {
            if store.get(id).await.unwrap().state == ExecutionState::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("execution never started");
    }

    #[tokio::test]
    async fn successful_run_publishes_full_lifecycle() {
        let s = setup(Echo, None);
        let id = s.coordinator.submit(&path("team/build")).await.unwrap();

        let events = events(&s.bus, id).await;
        let states: Vec<_> = events.iter().map(|e| (e.from_state, e.to_state)).collect();
        assert_eq!(
            states,
            vec![
                (ExecutionState::Pending, ExecutionState::Running),
                (ExecutionState::Running, ExecutionState::Running),
                (ExecutionState::Running, ExecutionState::Succeeded),
            ]
        );
        assert_eq!(events[1].payload["line"], "building team/build");
        assert_eq!(events[2].payload["result"], "ok");
        assert_eq!(s.store.get(&id).await.unwrap().history, events);
    }

    #[tokio::test]
    async fn wildcard_definition_runs_under_requested_path() {
        let s = setup(Echo, None);
        let id = s
            .coordinator
            .submit(&path("team/service/main"))
            .await
            .unwrap();
        events(&s.bus, id).await;

        let execution = s.store.get(&id).await.unwrap();
        assert_eq!(execution.job_path, path("team/service/main"));
        assert_eq!(execution.state, ExecutionState::Succeeded);
    }

    #[tokio::test]
    async fn rejected_submissions_create_nothing() {
        let s = setup(Echo, None);
        assert_matches!(
            s.coordinator.submit(&path("team/missing")).await,
            Err(CoreError::NotFound { .. })
        );
        assert_matches!(
            s.coordinator.submit(&path("team/service/*")).await,
            Err(CoreError::Validation(_))
        );
        assert_matches!(
            s.coordinator.submit(&path("team/old")).await,
            Err(CoreError::Validation(_))
        );
        assert!(s.store.is_empty().await);
        assert_eq!(s.bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn unparseable_pipeline_is_rejected_before_creation() {
        // The fixture pipeline `sh 'make'` lacks the `pipeline { .. }` frame.
        let s = setup(ShellRunner::default(), None);
        let err = s
            .coordinator
            .submit(&path("team/service/main"))
            .await
            .unwrap_err();

        assert_matches!(&err, CoreError::Validation(msg) if msg.contains("cannot run"));
        assert!(s.store.is_empty().await);
        assert_eq!(s.bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn runner_error_fails_execution() {
        let s = setup(Failing, None);
        let id = s.coordinator.submit(&path("team/build")).await.unwrap();

        let last = events(&s.bus, id).await.pop().unwrap();
        assert_eq!(last.to_state, ExecutionState::Failed);
        assert_eq!(last.payload["error"], "compiler exploded");
    }

    #[tokio::test]
    async fn runner_panic_fails_execution() {
        let s = setup(Panicking, None);
        let id = s.coordinator.submit(&path("team/build")).await.unwrap();

        let last = events(&s.bus, id).await.pop().unwrap();
        assert_eq!(last.to_state, ExecutionState::Failed);
        assert!(last.payload["error"]
            .as_str()
            .unwrap()
            .contains("runner bug"));
    }

    #[tokio::test]
    async fn runner_timeout_fails_execution() {
        let s = setup(Hanging, Some(Duration::from_millis(50)));
        let id = s.coordinator.submit(&path("team/build")).await.unwrap();

        let last = events(&s.bus, id).await.pop().unwrap();
        assert_eq!(last.to_state, ExecutionState::Failed);
        assert!(last.payload["error"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn cancel_stops_running_execution() {
        let s = setup(Hanging, None);
        let id = s.coordinator.submit(&path("team/build")).await.unwrap();
        wait_running(&s.store, &id).await;

        let event = s.coordinator.cancel(&id).await.unwrap();
        assert_eq!(event.to_state, ExecutionState::Cancelled);
        assert_eq!(event.payload["reason"], REASON_CANCELLED);

        let events = events(&s.bus, id).await;
        assert_eq!(events.len(), 2);

        assert_matches!(
            s.coordinator.cancel(&id).await,
            Err(CoreError::AlreadyTerminal {
                state: ExecutionState::Cancelled
            })
        );
        assert_matches!(
            s.coordinator.cancel(&WorkflowId::new()).await,
            Err(CoreError::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_and_refuses_new_work() {
        let s = setup(Hanging, None);
        let id = s.coordinator.submit(&path("team/build")).await.unwrap();
        wait_running(&s.store, &id).await;

        s.coordinator.shutdown(Duration::from_secs(5)).await;

        let execution = s.store.get(&id).await.unwrap();
        assert_eq!(execution.state, ExecutionState::Cancelled);
        let last = execution.history.last().unwrap();
        assert_eq!(last.payload["reason"], REASON_SHUTDOWN);
        assert_eq!(s.coordinator.in_flight_count(), 0);

        assert_matches!(
            s.coordinator.submit(&path("team/build")).await,
            Err(CoreError::Conflict(_))
        );
    }
}
