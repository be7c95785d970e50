//! Pure state transitions for workflow instances.
//!
//! Nothing here performs I/O; engines feed step results in and persist
//! whatever comes out.

use crate::error::WorkflowError;
use crate::state::{AttemptStatus, Payload, StepState, Task, TaskStatus, WorkflowState, WorkflowStatus};
use crate::step::{Step, StepName, StepResult};
use crate::workflow::Workflow;
use chrono::{DateTime, Utc};

/// The cursor and status computed for the next state of an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Next task.
    pub task: Task,
    /// Overall status after the transition.
    pub status: WorkflowStatus,
}

/// Builds the initial state of a new instance.
///
/// `entry` selects the first step to run; `None` starts at the first
/// declared step. Steps declared before the entry step get one synthetic
/// skipped attempt.
pub fn create_workflow_state(
    workflow: &Workflow,
    entry: Option<&str>,
    payload: Payload,
    id: impl Into<String>,
    now: DateTime<Utc>,
) -> Result<WorkflowState, WorkflowError> {
    let names = workflow.step_names();
    if names.is_empty() {
        return Err(WorkflowError::EmptyWorkflow(workflow.name()));
    }

    let entry_index = match entry {
        None => 0,
        Some(entry) => names
            .iter()
            .position(|name| name == entry)
            .ok_or_else(|| WorkflowError::StepNotFound(StepName::new(entry)))?,
    };

    let steps = names
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let mut step = StepState::new(name.clone());
            if index < entry_index {
                step.record(AttemptStatus::Skipped);
            }
            step
        })
        .collect();

    Ok(WorkflowState {
        id: id.into(),
        name: workflow.name(),
        to_execute: Task::first_attempt(names[entry_index].clone(), payload),
        result: None,
        status: WorkflowStatus::InProgress,
        steps,
        last_modified: now,
    })
}

/// Records the outcome of one execution of `step` and advances the cursor.
///
/// Fails if `state` has no history for `step`, or if `step` is not part of
/// `workflow`.
pub fn update_workflow_state(
    state: &WorkflowState,
    step: &Step,
    result: &StepResult,
    workflow: &Workflow,
    now: DateTime<Utc>,
) -> Result<WorkflowState, WorkflowError> {
    let mut steps = state.steps.clone();
    let history = steps
        .iter_mut()
        .find(|s| &s.name == step.name())
        .ok_or_else(|| WorkflowError::StepStateMissing(step.name().clone()))?;
    history.record(attempt_status(result));

    let next = workflow.get_next_step(step.name().as_str())?;
    let Transition { task, status } = next_task(state, step, result, next.as_ref(), now);

    Ok(WorkflowState {
        id: state.id.clone(),
        name: state.name.clone(),
        result: (status == WorkflowStatus::Successful).then(|| task.state.clone()),
        to_execute: task,
        status,
        steps,
        last_modified: now,
    })
}

/// Computes the next cursor for `state` after `step` produced `result`.
///
/// `next` is the step declared right after `step`, if any.
pub fn next_task(
    state: &WorkflowState,
    step: &Step,
    result: &StepResult,
    next: Option<&Step>,
    now: DateTime<Utc>,
) -> Transition {
    let current = &state.to_execute;
    match result {
        StepResult::Success { state: output } => advance(current, output.clone(), next),
        StepResult::Skipped => advance(current, current.state.clone(), next),
        StepResult::Stopped => Transition {
            task: done(current),
            status: WorkflowStatus::Stopped,
        },
        StepResult::Failure { .. } => {
            let attempt = current.attempt.saturating_add(1);
            if attempt <= step.attempt_limit() {
                let delay = step.retry_delay().delay_for_attempt(attempt);
                let pick_after = if delay.is_zero() {
                    None
                } else {
                    chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|delay| now.checked_add_signed(delay))
                };
                Transition {
                    task: Task {
                        attempt,
                        are_retry_exhausted: false,
                        pick_after,
                        ..current.clone()
                    },
                    status: WorkflowStatus::InProgress,
                }
            } else if step.is_optional() {
                advance(current, current.state.clone(), next)
            } else {
                Transition {
                    task: Task {
                        are_retry_exhausted: true,
                        ..done(current)
                    },
                    status: WorkflowStatus::Failed,
                }
            }
        }
    }
}

fn advance(current: &Task, state: Payload, next: Option<&Step>) -> Transition {
    match next {
        Some(next) => Transition {
            task: Task::first_attempt(next.name().clone(), state),
            status: WorkflowStatus::InProgress,
        },
        None => Transition {
            task: Task {
                state,
                ..done(current)
            },
            status: WorkflowStatus::Successful,
        },
    }
}

fn done(current: &Task) -> Task {
    Task {
        status: TaskStatus::Done,
        ..current.clone()
    }
}

fn attempt_status(result: &StepResult) -> AttemptStatus {
    match result {
        StepResult::Success { .. } => AttemptStatus::Successful,
        StepResult::Failure { .. } => AttemptStatus::Failed,
        StepResult::Skipped => AttemptStatus::Skipped,
        StepResult::Stopped => AttemptStatus::Stopped,
    }
}
