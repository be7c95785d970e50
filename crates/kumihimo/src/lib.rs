//! A durable, step-based workflow engine for Rust.
//!
//! Workflows are declared once with [`Workflow`], instances are started with
//! [`trigger`] and persisted through an adapter, and a [`Worker`] (pull) or
//! [`Consumer`] (push) advances them one step at a time.
//!
//! # Example
//!
//! ```rust
//! use kumihimo::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let workflow = Workflow::new("math")
//!         .step(Step::new("add-3", |ctx| async move {
//!             Ok(json!(ctx.state.as_i64().unwrap_or_default() + 3))
//!         }))
//!         .on_workflow_completed(|event, _| async move {
//!             println!("result: {}", event.result);
//!             Ok(())
//!         });
//!
//!     let storage = Arc::new(MemoryStorage::new());
//!     trigger(storage.as_ref(), &workflow, json!(4), TriggerOptions::default())
//!         .await
//!         .expect("triggered");
//!
//!     let mut worker = Worker::new(storage);
//!     worker.start(&[workflow]).await.expect("started");
//!     worker.stop().await.expect("stopped");
//! }
//! ```

mod config;
mod consumer;
mod dispatch;
mod error;
mod memory;
mod trigger;
mod worker;

// Re-export core types
pub use kumihimo_core::*;

pub use config::WorkerConfig;
pub use consumer::Consumer;
pub use dispatch::ErrorHook;
pub use error::EngineError;
pub use memory::{MemoryQueue, MemoryStorage};
pub use trigger::{trigger, trigger_from, TriggerOptions};
pub use worker::Worker;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        trigger, trigger_from, Consumer, EngineError, HandlerOutcome, Hook, HookKind,
        MemoryQueue, MemoryStorage, Plugin, PluginOptions, Queue, RetryDelay, StateWriter, Step,
        StepContext, StepHandler, StepName, StepResult, Storage, TriggerOptions, Worker,
        WorkerConfig, Workflow, WorkflowError, WorkflowState, WorkflowStatus,
    };
}
