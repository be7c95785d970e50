//! Error types.

use crate::decorator::DecoratorKey;
use crate::step::StepName;
use thiserror::Error;

/// Errors raised while declaring, readying or advancing a workflow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WorkflowError {
    /// The workflow declares no steps at all.
    #[error("Workflow '{0}' has no steps")]
    EmptyWorkflow(String),

    /// A referenced step was not found in the workflow.
    #[error("Step not found: {0}")]
    StepNotFound(StepName),

    /// Two steps share a name.
    #[error("Step declared more than once: {0}")]
    DuplicateStep(StepName),

    /// A decorator name was declared twice on the same context.
    #[error("Decorator already declared: {0}")]
    DuplicateDecorator(DecoratorKey),

    /// A plugin was registered before the plugins it depends on.
    #[error("Plugin '{plugin}' is missing dependencies: {}", missing.join(", "))]
    UnsatisfiedDependencies {
        /// The plugin whose dependencies are missing.
        plugin: String,
        /// Every dependency not registered before it.
        missing: Vec<String>,
    },

    /// A plugin body reported a failure.
    #[error("Plugin '{plugin}' failed: {details}")]
    Plugin {
        /// The failing plugin.
        plugin: String,
        /// Details about the failure.
        details: String,
    },

    /// Something was declared on a workflow that was already readied.
    #[error("Cannot declare {0} after the workflow is ready")]
    DeclaredAfterReady(String),

    /// A workflow state has no record for a step it tried to update.
    #[error("Workflow state has no entry for step: {0}")]
    StepStateMissing(StepName),

    /// The workflow configuration is invalid.
    #[error("Invalid workflow configuration: {0}")]
    Configuration(String),
}

/// Errors reported by storage and queue adapters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StorageError {
    /// No workflow state with the given id.
    #[error("Workflow state not found: {0}")]
    NotFound(String),
    /// A record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The adapter was already disconnected.
    #[error("Adapter is disconnected")]
    Disconnected,
    /// Backend-specific failure.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
