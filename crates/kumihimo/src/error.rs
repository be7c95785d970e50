//! Engine error types.

use kumihimo_core::{HookKind, StorageError, WorkflowError};
use thiserror::Error;

/// Errors raised by workers, consumers and trigger calls.
///
/// Runtime failures inside a running loop are not returned to the caller;
/// they are handed to the `on_error` hooks registered on the engine.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    /// The workflow definition is invalid.
    #[error(transparent)]
    Definition(#[from] WorkflowError),

    /// Pulling eligible tasks from storage failed.
    #[error("Failed to pull tasks: {0}")]
    Pull(#[source] StorageError),

    /// Writing a workflow state failed.
    #[error("Failed to persist workflow '{workflow_id}': {source}")]
    Persist {
        /// Instance whose state could not be written.
        workflow_id: String,
        /// Adapter error.
        #[source]
        source: StorageError,
    },

    /// A lifecycle hook returned an error or panicked.
    #[error("Hook '{hook}' failed for workflow '{workflow_id}': {details}")]
    Hook {
        /// Which hook failed.
        hook: HookKind,
        /// Instance the hook ran for.
        workflow_id: String,
        /// Error message or panic payload.
        details: String,
    },

    /// Subscribing to or stopping a queue failed.
    #[error("Failed to consume messages: {0}")]
    Consume(#[source] StorageError),

    /// Disconnecting the adapter failed.
    #[error("Failed to disconnect adapter: {0}")]
    Disconnect(#[source] StorageError),

    /// `start` was called on a running engine.
    #[error("Engine is already started")]
    AlreadyStarted,

    /// `stop` was called on an engine that is not running.
    #[error("Engine is not started")]
    NotStarted,
}
