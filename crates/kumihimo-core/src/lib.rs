//! Core types for the kumihimo workflow engine.
//!
//! This crate holds everything that does not need a runtime: the workflow
//! definition graph, the pure state machine advancing workflow instances,
//! and the adapter traits storage and queue backends implement.
//!
//! # Core Types
//!
//! - [`Workflow`] - Definition graph of steps, hooks and plugins
//! - [`Step`] - A named handler with its retry policy
//! - [`Plugin`] - Reusable extension registered on a workflow scope
//! - [`WorkflowState`] - Persisted record of one workflow instance
//! - [`WorkflowError`] - Definition and state machine errors
//!
//! # State Machine
//!
//! - [`create_workflow_state`] - Builds a new instance
//! - [`update_workflow_state`] - Applies one step result
//!
//! # Adapters
//!
//! - [`Storage`] - Pull-based backend
//! - [`Queue`] - Push-based backend

mod adapter;
mod decorator;
mod error;
mod hook;
pub mod list;
mod machine;
mod plugin;
mod state;
mod step;
mod workflow;

pub use adapter::{Consumption, MessageHandler, Queue, StateWriter, Storage, Write};
pub use decorator::{DecoratorKey, Decorators};
pub use error::{StorageError, WorkflowError};
pub use hook::{
    Hook, HookFn, HookKind, HookPoint, OnStepCompleted, OnStepError, OnStepSkipped,
    OnWorkflowCompleted, OnWorkflowFailed, OnWorkflowStopped, StepErrorEvent, StepEvent,
    WorkflowCompletedEvent, WorkflowFailedEvent, WorkflowStoppedEvent,
};
pub use machine::{create_workflow_state, next_task, update_workflow_state, Transition};
pub use plugin::{Plugin, PluginOptions};
pub use state::{
    Attempt, AttemptStatus, Payload, StepState, Task, TaskStatus, WorkflowState, WorkflowStatus,
};
pub use step::{
    HandlerOutcome, RetryDelay, RetryDelayError, Step, StepContext, StepHandler, StepName,
    StepResult,
};
pub use workflow::Workflow;
