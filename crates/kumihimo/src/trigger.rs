//! Starting workflow instances.

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use kumihimo_core::{create_workflow_state, Payload, StateWriter, Workflow, WorkflowState, Write};
use tracing::info;
use uuid::Uuid;

/// Overrides applied when triggering a workflow.
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions<O = ()> {
    /// Instance id; a random UUID when unset.
    pub id: Option<String>,
    /// Creation time; the current time when unset.
    pub now: Option<DateTime<Utc>>,
    /// Adapter-specific write options.
    pub write: O,
}

impl<O> TriggerOptions<O> {
    /// Sets the instance id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the creation time.
    #[must_use]
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    /// Sets the adapter write options.
    #[must_use]
    pub fn with_write<P>(self, write: P) -> TriggerOptions<P> {
        TriggerOptions {
            id: self.id,
            now: self.now,
            write,
        }
    }
}

/// Creates an instance of `workflow` starting at its first step and inserts it through `writer`.
///
/// Readies the workflow first, so definition errors surface here.
pub async fn trigger<W>(
    writer: &W,
    workflow: &Workflow,
    payload: impl Into<Payload>,
    options: TriggerOptions<W::WriteOptions>,
) -> Result<WorkflowState, EngineError>
where
    W: StateWriter + ?Sized,
{
    start(writer, workflow, None, payload.into(), options).await
}

/// Creates an instance of `workflow` starting at `step`.
///
/// Steps declared before `step` are recorded as skipped.
pub async fn trigger_from<W>(
    writer: &W,
    workflow: &Workflow,
    step: &str,
    payload: impl Into<Payload>,
    options: TriggerOptions<W::WriteOptions>,
) -> Result<WorkflowState, EngineError>
where
    W: StateWriter + ?Sized,
{
    start(writer, workflow, Some(step), payload.into(), options).await
}

async fn start<W>(
    writer: &W,
    workflow: &Workflow,
    entry: Option<&str>,
    payload: Payload,
    options: TriggerOptions<W::WriteOptions>,
) -> Result<WorkflowState, EngineError>
where
    W: StateWriter + ?Sized,
{
    let workflow = workflow.ready()?;
    let id = options.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = options.now.unwrap_or_else(Utc::now);
    let state = create_workflow_state(&workflow, entry, payload, id, now)?;

    writer
        .write(vec![Write::Insert(state.clone())], options.write)
        .await
        .map_err(|source| EngineError::Persist {
            workflow_id: state.id.clone(),
            source,
        })?;

    info!(
        id = %state.id,
        workflow = %state.name,
        step = %state.to_execute.step,
        "Workflow triggered"
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use kumihimo_core::{AttemptStatus, Step, WorkflowError};
    use serde_json::json;

    fn workflow() -> Workflow {
        Workflow::new("math")
            .step(Step::new("add-4", |ctx| async move { Ok(ctx.state) }))
            .step(Step::new("multiply-10", |ctx| async move { Ok(ctx.state) }))
    }

    #[tokio::test]
    async fn test_trigger_persists_new_instance() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let state = trigger(
            &storage,
            &workflow(),
            json!(4),
            TriggerOptions::default().with_id("fixed").with_now(now),
        )
        .await
        .expect("triggered");

        assert_eq!(state.id, "fixed");
        assert_eq!(state.last_modified, now);
        assert_eq!(storage.find("fixed"), Some(state));
    }

    #[tokio::test]
    async fn test_trigger_generates_ids() {
        let storage = MemoryStorage::new();
        let workflow = workflow();
        let a = trigger(&storage, &workflow, json!(1), TriggerOptions::default())
            .await
            .expect("triggered");
        let b = trigger(&storage, &workflow, json!(1), TriggerOptions::default())
            .await
            .expect("triggered");
        assert_ne!(a.id, b.id);
        assert_eq!(storage.len(), 2);
    }

    #[tokio::test]
    async fn test_trigger_from_skips_earlier_steps() {
        let storage = MemoryStorage::new();
        let state = trigger_from(
            &storage,
            &workflow(),
            "multiply-10",
            json!(4),
            TriggerOptions::default(),
        )
        .await
        .expect("triggered");

        assert_eq!(state.to_execute.step, "multiply-10");
        assert_eq!(
            state.find_step("add-4").map(|s| s.attempts[0].status),
            Some(AttemptStatus::Skipped)
        );
    }

    #[tokio::test]
    async fn test_trigger_from_unknown_step_fails() {
        let storage = MemoryStorage::new();
        let err = trigger_from(&storage, &workflow(), "nope", json!(4), TriggerOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Definition(WorkflowError::StepNotFound(_))
        ));
        assert!(storage.is_empty());
    }
}
