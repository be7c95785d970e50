//! Interfaces implemented by storage and queue backends.

use crate::error::StorageError;
use crate::state::WorkflowState;
use crate::workflow::Workflow;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

/// A single state mutation handed to an adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Upsert by id that only sets fields when the record is absent, so a
    /// concurrent insert of the same id is harmless.
    Insert(WorkflowState),
    /// Full replacement keyed by id.
    Update(WorkflowState),
}

impl Write {
    /// Returns the state carried by this write.
    pub fn state(&self) -> &WorkflowState {
        match self {
            Write::Insert(state) | Write::Update(state) => state,
        }
    }

    /// Consumes the write, returning its state.
    pub fn into_state(self) -> WorkflowState {
        match self {
            Write::Insert(state) | Write::Update(state) => state,
        }
    }
}

/// Anything workflow states can be written to.
#[async_trait]
pub trait StateWriter: Send + Sync {
    /// Backend-specific options, such as a transaction handle.
    type WriteOptions: Default + Send + Sync;

    /// Applies `writes` in order.
    async fn write(
        &self,
        writes: Vec<Write>,
        options: Self::WriteOptions,
    ) -> Result<(), StorageError>;
}

/// A pull-based backend polled by the worker.
#[async_trait]
pub trait Storage: StateWriter {
    /// Returns up to `limit` instances of `workflows` that are eligible now.
    ///
    /// Eligible means the task is `todo`, its attempt does not exceed the
    /// step's attempt limit, and `pick_after` is unset or already passed.
    async fn pull(
        &self,
        workflows: &[Workflow],
        limit: usize,
    ) -> Result<Vec<WorkflowState>, StorageError>;

    /// Looks an instance up by id.
    async fn find_by_id(&self, id: &str) -> Result<Option<WorkflowState>, StorageError>;

    /// Releases backend resources.
    async fn disconnect(&self) -> Result<(), StorageError>;
}

/// Callback invoked for each delivered message. Returning `Err` negatively
/// acknowledges the delivery.
pub type MessageHandler =
    Arc<dyn Fn(WorkflowState) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A running subscription returned by [`Queue::consume`].
#[async_trait]
pub trait Consumption: Send {
    /// Stops delivering new messages and waits for in-flight ones to settle.
    async fn stop(&mut self) -> Result<(), StorageError>;
}

/// A push-based backend delivering instances as they become ready.
///
/// Writes whose new status is terminal need not be delivered again.
#[async_trait]
pub trait Queue: StateWriter {
    /// Subscribes `handler` to the message stream.
    async fn consume(&self, handler: MessageHandler) -> Result<Box<dyn Consumption>, StorageError>;

    /// Releases backend resources.
    async fn disconnect(&self) -> Result<(), StorageError>;
}
