//! Persisted records describing workflow instances.

use crate::step::StepName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The value flowing from one step to the next.
pub type Payload = serde_json::Value;

/// Outcome recorded for one execution of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// The handler succeeded.
    Successful,
    /// The handler failed or panicked.
    Failed,
    /// The step was skipped, either by its handler or because the
    /// workflow was triggered from a later step.
    Skipped,
    /// The handler stopped the workflow.
    Stopped,
}

/// One entry in a step's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based sequence number local to the step.
    pub id: u32,
    /// What happened during this attempt.
    pub status: AttemptStatus,
}

/// Append-only execution history of a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    /// Step name.
    pub name: StepName,
    /// Attempts in execution order.
    pub attempts: Vec<Attempt>,
}

impl StepState {
    /// Creates an empty history for `name`.
    pub fn new(name: StepName) -> Self {
        Self {
            name,
            attempts: Vec::new(),
        }
    }

    /// Appends an attempt, numbering it after the existing ones.
    pub fn record(&mut self, status: AttemptStatus) -> &Attempt {
        let id = self.attempts.len() as u32 + 1;
        self.attempts.push(Attempt { id, status });
        &self.attempts[self.attempts.len() - 1]
    }
}

/// Whether the cursor still has work to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be executed.
    Todo,
    /// Nothing left to execute.
    Done,
}

/// The execution cursor of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Whether the task is pending.
    pub status: TaskStatus,
    /// Step to execute.
    pub step: StepName,
    /// Payload handed to the step.
    pub state: Payload,
    /// 1-based attempt counter for `step`.
    pub attempt: u32,
    /// Set once a required step ran out of attempts.
    pub are_retry_exhausted: bool,
    /// The task must not be picked before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pick_after: Option<DateTime<Utc>>,
}

impl Task {
    /// A fresh first attempt at `step`.
    pub fn first_attempt(step: StepName, state: Payload) -> Self {
        Self {
            status: TaskStatus::Todo,
            step,
            state,
            attempt: 1,
            are_retry_exhausted: false,
            pick_after: None,
        }
    }

    /// Returns `true` if the task may be picked at `now`.
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Todo && self.pick_after.map_or(true, |at| at <= now)
    }
}

/// Overall status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Steps remain to be executed.
    InProgress,
    /// Every step completed, or was skipped.
    Successful,
    /// A required step exhausted its attempts.
    Failed,
    /// A step stopped the workflow.
    Stopped,
}

impl WorkflowStatus {
    /// Returns `true` for every status other than `InProgress`.
    pub fn is_terminal(self) -> bool {
        self != WorkflowStatus::InProgress
    }
}

/// Full persisted record of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    /// Unique instance id.
    pub id: String,
    /// Name of the workflow this instance runs.
    pub name: String,
    /// Current cursor.
    pub to_execute: Task,
    /// Final payload, set once the workflow succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    /// Overall status.
    pub status: WorkflowStatus,
    /// One history per declared step, in declaration order.
    pub steps: Vec<StepState>,
    /// Time of the last mutation.
    pub last_modified: DateTime<Utc>,
}

impl WorkflowState {
    /// Returns the history of `name`.
    pub fn find_step(&self, name: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.name.as_str() == name)
    }

    /// Returns `true` once the instance left `InProgress`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
