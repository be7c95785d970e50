//! Per-task execution shared by the pull and push loops.

use crate::error::EngineError;
use chrono::Utc;
use futures::FutureExt;
use kumihimo_core::{
    update_workflow_state, HookPoint, OnStepCompleted, OnStepError, OnStepSkipped,
    OnWorkflowCompleted, OnWorkflowFailed, OnWorkflowStopped, Payload, StateWriter, Step,
    StepContext, StepErrorEvent, StepEvent, StepResult, TaskStatus, Workflow,
    WorkflowCompletedEvent, WorkflowError, WorkflowFailedEvent, WorkflowState, WorkflowStatus,
    WorkflowStoppedEvent, Write,
};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Callback receiving errors raised inside a running engine.
pub type ErrorHook = Arc<dyn Fn(&EngineError) + Send + Sync>;

/// The `onError` hooks of one engine.
#[derive(Clone, Default)]
pub(crate) struct ErrorHooks {
    hooks: Arc<RwLock<Vec<ErrorHook>>>,
}

impl ErrorHooks {
    pub(crate) fn add<F>(&self, hook: F)
    where
        F: Fn(&EngineError) + Send + Sync + 'static,
    {
        self.hooks.write().push(Arc::new(hook));
    }

    /// Logs `err` and hands it to every hook. With no hooks the error is dropped.
    pub(crate) fn emit(&self, err: &EngineError) {
        warn!(error = %err, "Engine error");
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| hook(err))) {
                warn!(panic = %panic_message(&*panic), "onError hook panicked");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked".to_string()
    }
}

/// Runs tasks of a fixed set of readied workflows.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    workflows: Arc<HashMap<String, Workflow>>,
    errors: ErrorHooks,
}

impl Dispatcher {
    /// Readies every workflow and indexes it by name.
    pub(crate) fn new(workflows: &[Workflow], errors: ErrorHooks) -> Result<Self, WorkflowError> {
        let mut by_name = HashMap::with_capacity(workflows.len());
        for workflow in workflows {
            let workflow = workflow.ready()?;
            by_name.insert(workflow.name(), workflow);
        }
        Ok(Self {
            workflows: Arc::new(by_name),
            errors,
        })
    }

    pub(crate) fn workflows(&self) -> Vec<Workflow> {
        self.workflows.values().cloned().collect()
    }

    pub(crate) fn report(&self, err: EngineError) {
        self.errors.emit(&err);
    }

    /// Executes the pending step of `state`, persists the outcome through
    /// `writer` and fires lifecycle hooks.
    ///
    /// Returns `Ok(None)` when the task is not for this engine. Errors are
    /// reported to the `onError` hooks before being returned, so callers only
    /// use them to decide on acknowledgement. Hooks fire even when the
    /// update could not be written.
    pub(crate) async fn dispatch<W>(
        &self,
        writer: &W,
        state: WorkflowState,
    ) -> Result<Option<WorkflowState>, EngineError>
    where
        W: StateWriter + ?Sized,
    {
        let Some(workflow) = self.workflows.get(&state.name) else {
            debug!(workflow = %state.name, id = %state.id, "Skipping task of unknown workflow");
            return Ok(None);
        };
        if state.is_terminal() || state.to_execute.status == TaskStatus::Done {
            debug!(id = %state.id, "Skipping task that is not pending");
            return Ok(None);
        }
        let Some((step, scope)) = workflow.get_step_by_name(state.to_execute.step.as_str()) else {
            debug!(id = %state.id, step = %state.to_execute.step, "Skipping task of unknown step");
            return Ok(None);
        };

        let ctx = StepContext {
            step: step.name().clone(),
            state: state.to_execute.state.clone(),
            workflow: scope,
            attempt: state.to_execute.attempt,
        };
        let result = run_step(&step, ctx).await;
        if let StepResult::Failure { error } = &result {
            warn!(
                id = %state.id,
                step = %step.name(),
                attempt = state.to_execute.attempt,
                error = %error,
                "Step failed"
            );
        }

        let updated = match update_workflow_state(&state, &step, &result, workflow, Utc::now()) {
            Ok(updated) => updated,
            Err(err) => {
                let err = EngineError::Definition(err);
                self.errors.emit(&err);
                return Err(err);
            }
        };

        let persisted = writer
            .write(vec![Write::Update(updated.clone())], Default::default())
            .await
            .map_err(|source| EngineError::Persist {
                workflow_id: updated.id.clone(),
                source,
            });
        if let Err(err) = &persisted {
            self.errors.emit(err);
        }

        if updated.is_terminal() {
            info!(
                id = %updated.id,
                workflow = %updated.name,
                status = ?updated.status,
                "Workflow finished"
            );
        }

        self.fire_hooks(workflow, &state, &step, &result, &updated).await;
        persisted.map(|()| Some(updated))
    }

    async fn fire_hooks(
        &self,
        workflow: &Workflow,
        previous: &WorkflowState,
        step: &Step,
        result: &StepResult,
        updated: &WorkflowState,
    ) {
        let id = updated.id.as_str();
        let completed = || WorkflowCompletedEvent {
            instance: updated.clone(),
            result: updated.result.clone().unwrap_or(Payload::Null),
        };

        match result {
            StepResult::Stopped => {
                let event = WorkflowStoppedEvent {
                    instance: updated.clone(),
                    step: step.name().clone(),
                };
                self.fire::<OnWorkflowStopped>(workflow, id, event).await;
            }
            StepResult::Success { .. } | StepResult::Skipped => {
                let state = match result {
                    StepResult::Success { state } => state.clone(),
                    _ => previous.to_execute.state.clone(),
                };
                let event = StepEvent {
                    instance: updated.clone(),
                    step: step.name().clone(),
                    state,
                };
                if matches!(result, StepResult::Skipped) {
                    self.fire::<OnStepSkipped>(workflow, id, event.clone()).await;
                }
                self.fire::<OnStepCompleted>(workflow, id, event).await;
                if updated.status == WorkflowStatus::Successful {
                    self.fire::<OnWorkflowCompleted>(workflow, id, completed()).await;
                }
            }
            StepResult::Failure { error } => {
                let event = StepErrorEvent {
                    instance: updated.clone(),
                    step: step.name().clone(),
                    error: error.clone(),
                    attempt: previous.to_execute.attempt,
                };
                self.fire::<OnStepError>(workflow, id, event).await;
                match updated.status {
                    WorkflowStatus::Failed => {
                        let event = WorkflowFailedEvent {
                            instance: updated.clone(),
                            step: step.name().clone(),
                            error: error.clone(),
                        };
                        self.fire::<OnWorkflowFailed>(workflow, id, event).await;
                    }
                    WorkflowStatus::Successful => {
                        self.fire::<OnWorkflowCompleted>(workflow, id, completed()).await;
                    }
                    WorkflowStatus::InProgress | WorkflowStatus::Stopped => {}
                }
            }
        }
    }

    /// Runs every hook of kind `K` in declaration order, isolating failures.
    async fn fire<K: HookPoint>(&self, workflow: &Workflow, id: &str, event: K::Event) {
        for (hook, scope) in workflow.hooks::<K>() {
            let event = event.clone();
            let outcome = AssertUnwindSafe(async move { hook(event, scope).await })
                .catch_unwind()
                .await;
            let details = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(panic) => panic_message(&*panic),
            };
            self.errors.emit(&EngineError::Hook {
                hook: K::KIND,
                workflow_id: id.to_string(),
                details,
            });
        }
    }
}

/// Runs the handler of `step`, turning errors and panics into failures.
async fn run_step(step: &Step, ctx: StepContext) -> StepResult {
    let handler = step.handler();
    match AssertUnwindSafe(async move { handler.run(ctx).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(outcome)) => outcome.into_step_result(),
        Ok(Err(err)) => StepResult::Failure {
            error: err.to_string(),
        },
        Err(panic) => StepResult::Failure {
            error: panic_message(&*panic),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use kumihimo_core::{create_workflow_state, AttemptStatus, Storage};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_hooks() -> (ErrorHooks, Arc<AtomicUsize>) {
        let hooks = ErrorHooks::default();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        hooks.add(move |_: &EngineError| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (hooks, count)
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_failure() {
        let workflow = Workflow::new("w").step(Step::new("boom", |_ctx| async move {
            if true {
                panic!("handler exploded");
            }
            Ok(json!(null))
        }));
        let (errors, _) = counting_hooks();
        let dispatcher = Dispatcher::new(&[workflow.clone()], errors).expect("valid workflow");
        let storage = MemoryStorage::new();

        let state = create_workflow_state(&workflow, None, json!(1), "id-1", Utc::now())
            .expect("created");
        let updated = dispatcher
            .dispatch(&storage, state)
            .await
            .expect("dispatched")
            .expect("known workflow");

        assert_eq!(updated.status, WorkflowStatus::Failed);
        assert_eq!(updated.steps[0].attempts[0].status, AttemptStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_skipped() {
        let workflow = Workflow::new("known").step(Step::new("a", |ctx| async move { Ok(ctx.state) }));
        let other = Workflow::new("other").step(Step::new("a", |ctx| async move { Ok(ctx.state) }));
        let (errors, count) = counting_hooks();
        let dispatcher = Dispatcher::new(&[workflow], errors).expect("valid workflow");
        let storage = MemoryStorage::new();

        let state = create_workflow_state(&other.ready().expect("valid"), None, json!(1), "id", Utc::now())
            .expect("created");
        let outcome = dispatcher.dispatch(&storage, state).await.expect("no error");
        assert!(outcome.is_none());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_persist_failure_reports_and_still_fires_hooks() {
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&hook_calls);
        let workflow = Workflow::new("w")
            .step(Step::new("a", |ctx| async move { Ok(ctx.state) }))
            .on_step_completed(move |_, _| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        let (errors, count) = counting_hooks();
        let dispatcher = Dispatcher::new(&[workflow.clone()], errors).expect("valid workflow");
        let storage = MemoryStorage::new();
        storage.disconnect().await.expect("disconnects");

        let state = create_workflow_state(&workflow, None, json!(1), "id", Utc::now())
            .expect("created");
        let err = dispatcher.dispatch(&storage, state).await.unwrap_err();

        assert!(matches!(err, EngineError::Persist { .. }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_optional_last_step_completes_once() {
        let step_errors = Arc::new(AtomicUsize::new(0));
        let completions = Arc::new(AtomicUsize::new(0));
        let (errors_seen, completed_seen) = (Arc::clone(&step_errors), Arc::clone(&completions));
        let workflow = Workflow::new("w")
            .step(Step::new("add-1", |ctx| async move {
                Ok(json!(ctx.state.as_i64().unwrap_or_default() + 1))
            }))
            .step(
                Step::new("flaky", |_ctx| async move {
                    Err::<Payload, _>(anyhow::anyhow!("unavailable"))
                })
                .max_attempts(3)
                .optional(true),
            )
            .on_step_error(move |_, _| {
                let seen = Arc::clone(&errors_seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .on_workflow_completed(move |_, _| {
                let seen = Arc::clone(&completed_seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        let (errors, reported) = counting_hooks();
        let dispatcher = Dispatcher::new(&[workflow.clone()], errors).expect("valid workflow");
        let storage = MemoryStorage::new();

        let mut state = create_workflow_state(&workflow, None, json!(1), "id", Utc::now())
            .expect("created");
        let mut dispatches = 0;
        while !state.is_terminal() {
            assert!(dispatches < 10, "workflow never finished");
            dispatches += 1;
            state = dispatcher
                .dispatch(&storage, state)
                .await
                .expect("dispatched")
                .expect("known workflow");
        }

        assert_eq!(dispatches, 4);
        assert_eq!(state.status, WorkflowStatus::Successful);
        assert_eq!(state.result, Some(json!(2)));
        assert_eq!(step_errors.load(Ordering::SeqCst), 3);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(reported.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_error_hook_panic_is_contained() {
        let (errors, count) = counting_hooks();
        errors.add(|_: &EngineError| panic!("hook exploded"));
        let (_, later) = counting_hooks();
        let later_seen = Arc::clone(&later);
        errors.add(move |_: &EngineError| {
            later_seen.fetch_add(1, Ordering::SeqCst);
        });

        errors.emit(&EngineError::NotStarted);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(later.load(Ordering::SeqCst), 1);
    }
}
