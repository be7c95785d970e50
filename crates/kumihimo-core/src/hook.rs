//! Lifecycle hooks fired by the engine after each step execution.

use crate::state::{Payload, WorkflowState};
use crate::step::StepName;
use crate::workflow::Workflow;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Boxed hook callback receiving an event and the context the hook was declared in.
pub type HookFn<E> = Arc<dyn Fn(E, Workflow) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Identifies a lifecycle hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// A step succeeded or was skipped.
    OnStepCompleted,
    /// A step attempt failed.
    OnStepError,
    /// A step was skipped by its handler.
    OnStepSkipped,
    /// The workflow finished successfully.
    OnWorkflowCompleted,
    /// A required step exhausted its attempts.
    OnWorkflowFailed,
    /// A step stopped the workflow.
    OnWorkflowStopped,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::OnStepCompleted => write!(f, "onStepCompleted"),
            HookKind::OnStepError => write!(f, "onStepError"),
            HookKind::OnStepSkipped => write!(f, "onStepSkipped"),
            HookKind::OnWorkflowCompleted => write!(f, "onWorkflowCompleted"),
            HookKind::OnWorkflowFailed => write!(f, "onWorkflowFailed"),
            HookKind::OnWorkflowStopped => write!(f, "onWorkflowStopped"),
        }
    }
}

/// Payload of `onStepCompleted` and `onStepSkipped`.
#[derive(Debug, Clone)]
pub struct StepEvent {
    /// The instance after the update was applied.
    pub instance: WorkflowState,
    /// The step that ran.
    pub step: StepName,
    /// Output of the step, or the unchanged payload when skipped.
    pub state: Payload,
}

/// Payload of `onStepError`.
#[derive(Debug, Clone)]
pub struct StepErrorEvent {
    /// The instance after the update was applied.
    pub instance: WorkflowState,
    /// The step that failed.
    pub step: StepName,
    /// Error reported by the handler.
    pub error: String,
    /// The attempt that failed.
    pub attempt: u32,
}

/// Payload of `onWorkflowCompleted`.
#[derive(Debug, Clone)]
pub struct WorkflowCompletedEvent {
    /// The finished instance.
    pub instance: WorkflowState,
    /// Final payload.
    pub result: Payload,
}

/// Payload of `onWorkflowFailed`.
#[derive(Debug, Clone)]
pub struct WorkflowFailedEvent {
    /// The failed instance.
    pub instance: WorkflowState,
    /// The step whose retries ran out.
    pub step: StepName,
    /// Last error reported by that step.
    pub error: String,
}

/// Payload of `onWorkflowStopped`.
#[derive(Debug, Clone)]
pub struct WorkflowStoppedEvent {
    /// The stopped instance.
    pub instance: WorkflowState,
    /// The step that stopped it.
    pub step: StepName,
}

/// A lifecycle hook, one variant per kind.
#[derive(Clone)]
pub enum Hook {
    /// See [`HookKind::OnStepCompleted`].
    StepCompleted(HookFn<StepEvent>),
    /// See [`HookKind::OnStepError`].
    StepError(HookFn<StepErrorEvent>),
    /// See [`HookKind::OnStepSkipped`].
    StepSkipped(HookFn<StepEvent>),
    /// See [`HookKind::OnWorkflowCompleted`].
    WorkflowCompleted(HookFn<WorkflowCompletedEvent>),
    /// See [`HookKind::OnWorkflowFailed`].
    WorkflowFailed(HookFn<WorkflowFailedEvent>),
    /// See [`HookKind::OnWorkflowStopped`].
    WorkflowStopped(HookFn<WorkflowStoppedEvent>),
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hook").field(&self.kind()).finish()
    }
}

fn boxed<E, F, Fut>(f: F) -> HookFn<E>
where
    E: Send + 'static,
    F: Fn(E, Workflow) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(
        move |event: E, workflow: Workflow| -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(f(event, workflow))
        },
    )
}

impl Hook {
    /// Returns which lifecycle point this hook listens on.
    pub fn kind(&self) -> HookKind {
        match self {
            Hook::StepCompleted(_) => HookKind::OnStepCompleted,
            Hook::StepError(_) => HookKind::OnStepError,
            Hook::StepSkipped(_) => HookKind::OnStepSkipped,
            Hook::WorkflowCompleted(_) => HookKind::OnWorkflowCompleted,
            Hook::WorkflowFailed(_) => HookKind::OnWorkflowFailed,
            Hook::WorkflowStopped(_) => HookKind::OnWorkflowStopped,
        }
    }

    /// Builds an `onStepCompleted` hook.
    pub fn on_step_completed<F, Fut>(f: F) -> Self
    where
        F: Fn(StepEvent, Workflow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Hook::StepCompleted(boxed(f))
    }

    /// Builds an `onStepError` hook.
    pub fn on_step_error<F, Fut>(f: F) -> Self
    where
        F: Fn(StepErrorEvent, Workflow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Hook::StepError(boxed(f))
    }

    /// Builds an `onStepSkipped` hook.
    pub fn on_step_skipped<F, Fut>(f: F) -> Self
    where
        F: Fn(StepEvent, Workflow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Hook::StepSkipped(boxed(f))
    }

    /// Builds an `onWorkflowCompleted` hook.
    pub fn on_workflow_completed<F, Fut>(f: F) -> Self
    where
        F: Fn(WorkflowCompletedEvent, Workflow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Hook::WorkflowCompleted(boxed(f))
    }

    /// Builds an `onWorkflowFailed` hook.
    pub fn on_workflow_failed<F, Fut>(f: F) -> Self
    where
        F: Fn(WorkflowFailedEvent, Workflow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Hook::WorkflowFailed(boxed(f))
    }

    /// Builds an `onWorkflowStopped` hook.
    pub fn on_workflow_stopped<F, Fut>(f: F) -> Self
    where
        F: Fn(WorkflowStoppedEvent, Workflow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Hook::WorkflowStopped(boxed(f))
    }
}

/// Typed selector for one hook kind, used by [`Workflow::hooks`].
pub trait HookPoint {
    /// Event handed to the callbacks of this kind.
    type Event: Clone + Send + 'static;

    /// The kind this selector matches.
    const KIND: HookKind;

    /// Extracts the callback if `hook` is of this kind.
    fn select(hook: &Hook) -> Option<HookFn<Self::Event>>;
}

macro_rules! hook_point {
    ($(#[$doc:meta])* $point:ident, $variant:ident, $event:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $point;

        impl HookPoint for $point {
            type Event = $event;
            const KIND: HookKind = HookKind::$point;

            fn select(hook: &Hook) -> Option<HookFn<Self::Event>> {
                match hook {
                    Hook::$variant(f) => Some(Arc::clone(f)),
                    _ => None,
                }
            }
        }
    };
}

hook_point!(
    /// Selects `onStepCompleted` hooks.
    OnStepCompleted,
    StepCompleted,
    StepEvent
);
hook_point!(
    /// Selects `onStepError` hooks.
    OnStepError,
    StepError,
    StepErrorEvent
);
hook_point!(
    /// Selects `onStepSkipped` hooks.
    OnStepSkipped,
    StepSkipped,
    StepEvent
);
hook_point!(
    /// Selects `onWorkflowCompleted` hooks.
    OnWorkflowCompleted,
    WorkflowCompleted,
    WorkflowCompletedEvent
);
hook_point!(
    /// Selects `onWorkflowFailed` hooks.
    OnWorkflowFailed,
    WorkflowFailed,
    WorkflowFailedEvent
);
hook_point!(
    /// Selects `onWorkflowStopped` hooks.
    OnWorkflowStopped,
    WorkflowStopped,
    WorkflowStoppedEvent
);
