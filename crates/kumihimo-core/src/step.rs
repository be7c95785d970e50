//! Step declarations, handlers and results.

use crate::state::Payload;
use crate::workflow::Workflow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Type-safe step name wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the step name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for StepName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for StepName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// What a step execution produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    /// The step succeeded; `state` is handed to the next step.
    Success {
        /// Output payload.
        state: Payload,
    },
    /// The step failed and may be retried.
    Failure {
        /// Error description.
        error: String,
    },
    /// The step chose not to run; the payload passes through unchanged.
    Skipped,
    /// The step halted the whole workflow.
    Stopped,
}

/// A handler's return value: either a bare payload or an explicit result.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// A raw output value, meaning success.
    Value(Payload),
    /// An explicit result.
    Result(StepResult),
}

impl HandlerOutcome {
    /// Normalizes the outcome into a [`StepResult`].
    pub fn into_step_result(self) -> StepResult {
        match self {
            HandlerOutcome::Value(state) => StepResult::Success { state },
            HandlerOutcome::Result(result) => result,
        }
    }
}

impl From<Payload> for HandlerOutcome {
    fn from(value: Payload) -> Self {
        HandlerOutcome::Value(value)
    }
}

impl From<StepResult> for HandlerOutcome {
    fn from(result: StepResult) -> Self {
        HandlerOutcome::Result(result)
    }
}

/// Everything a handler receives for one execution.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Name of the step being executed.
    pub step: StepName,
    /// Payload produced by the previous step (or the trigger).
    pub state: Payload,
    /// The context the step was declared in, for decorator lookups.
    pub workflow: Workflow,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl StepContext {
    /// Succeeds with `state`.
    pub fn ok(&self, state: impl Into<Payload>) -> StepResult {
        StepResult::Success {
            state: state.into(),
        }
    }

    /// Fails with `error`, letting the retry policy decide what happens next.
    pub fn err(&self, error: impl fmt::Display) -> StepResult {
        StepResult::Failure {
            error: error.to_string(),
        }
    }

    /// Skips this step, keeping the current payload.
    pub fn skip(&self) -> StepResult {
        StepResult::Skipped
    }

    /// Stops the workflow.
    pub fn stop(&self) -> StepResult {
        StepResult::Stopped
    }
}

/// The work a step performs.
///
/// Closures are accepted directly by [`Step::new`]; implement this trait
/// for handlers that carry their own state.
///
/// # Examples
///
/// ```
/// use kumihimo_core::{HandlerOutcome, StepContext, StepHandler};
/// use async_trait::async_trait;
///
/// struct Double;
///
/// #[async_trait]
/// impl StepHandler for Double {
///     async fn run(&self, ctx: StepContext) -> anyhow::Result<HandlerOutcome> {
///         let n = ctx.state.as_i64().unwrap_or_default();
///         Ok(ctx.ok(n * 2).into())
///     }
/// }
/// ```
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Executes the step.
    ///
    /// Returning `Err` is equivalent to returning [`StepResult::Failure`].
    async fn run(&self, ctx: StepContext) -> anyhow::Result<HandlerOutcome>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut, R> StepHandler for FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Into<HandlerOutcome> + 'static,
{
    async fn run(&self, ctx: StepContext) -> anyhow::Result<HandlerOutcome> {
        (self.0)(ctx).await.map(Into::into)
    }
}

/// Delay applied before a failed step is attempted again.
#[derive(Clone, Default)]
pub enum RetryDelay {
    /// Retry immediately.
    #[default]
    None,
    /// Same delay before every retry.
    Fixed(Duration),
    /// Delay growing geometrically from `initial`, capped at `max`.
    Exponential {
        /// Delay before the first retry.
        initial: Duration,
        /// Upper bound.
        max: Duration,
        /// Growth factor per retry.
        multiplier: u32,
    },
    /// Delay computed from the upcoming attempt number.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::None => write!(f, "None"),
            RetryDelay::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            RetryDelay::Exponential {
                initial,
                max,
                multiplier,
            } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("max", max)
                .field("multiplier", multiplier)
                .finish(),
            RetryDelay::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Error returned when [`RetryDelay`] configuration is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDelayError(pub &'static str);

impl fmt::Display for RetryDelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RetryDelayError {}

impl RetryDelay {
    /// Creates a fixed delay.
    pub fn fixed(delay: Duration) -> Self {
        RetryDelay::Fixed(delay)
    }

    /// Creates an exponential delay doubling each retry, capped at 60s.
    pub fn exponential(initial: Duration) -> Self {
        RetryDelay::Exponential {
            initial,
            max: Duration::from_secs(60),
            multiplier: 2,
        }
    }

    /// Creates an exponential delay with custom settings.
    pub fn exponential_backoff(
        initial: Duration,
        max: Duration,
        multiplier: u32,
    ) -> Result<Self, RetryDelayError> {
        if multiplier == 0 {
            return Err(RetryDelayError("multiplier must be greater than 0"));
        }
        if multiplier > 10 {
            return Err(RetryDelayError(
                "multiplier must be 10 or less to avoid overflow",
            ));
        }
        if max < initial {
            return Err(RetryDelayError("max must be >= initial"));
        }
        Ok(RetryDelay::Exponential {
            initial,
            max,
            multiplier,
        })
    }

    /// Creates a delay computed by `f` from the upcoming attempt number.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        RetryDelay::Custom(Arc::new(f))
    }

    /// Delay before `attempt` (the attempt about to be scheduled, so `>= 2`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            RetryDelay::None => Duration::ZERO,
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let retries = attempt.saturating_sub(2);
                let factor = u64::from(*multiplier).saturating_pow(retries);
                let delay = (initial.as_millis() as u64).saturating_mul(factor);
                Duration::from_millis(delay.min(max.as_millis() as u64))
            }
            RetryDelay::Custom(f) => f(attempt),
        }
    }
}

/// A declared unit of work: a handler plus its retry policy.
///
/// # Examples
///
/// ```
/// use kumihimo_core::{RetryDelay, Step};
/// use serde_json::json;
/// use std::time::Duration;
///
/// let step = Step::new("charge-card", |ctx| async move {
///     Ok(json!({ "charged": ctx.state }))
/// })
/// .max_attempts(3)
/// .delay(RetryDelay::fixed(Duration::from_secs(5)));
///
/// assert_eq!(step.name().as_str(), "charge-card");
/// ```
#[derive(Clone)]
pub struct Step {
    name: StepName,
    handler: Arc<dyn StepHandler>,
    max_attempts: u32,
    optional: bool,
    delay: RetryDelay,
}

impl Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("optional", &self.optional)
            .field("delay", &self.delay)
            .finish()
    }
}

impl Step {
    /// Declares a step backed by an async closure.
    ///
    /// The closure may return a bare payload (success) or a [`StepResult`].
    pub fn new<F, Fut, R>(name: impl Into<StepName>, handler: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<HandlerOutcome> + 'static,
    {
        Self::with_handler(name, FnHandler(handler))
    }

    /// Declares a step backed by a [`StepHandler`] implementation.
    pub fn with_handler(name: impl Into<StepName>, handler: impl StepHandler + 'static) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            max_attempts: 1,
            optional: false,
            delay: RetryDelay::None,
        }
    }

    /// Sets how many times the step may run before its retries are exhausted.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Marks the step optional: exhausting its retries moves on instead of failing.
    #[must_use]
    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    /// Sets the delay between attempts.
    #[must_use]
    pub fn delay(mut self, delay: RetryDelay) -> Self {
        self.delay = delay;
        self
    }

    /// Returns the step name.
    pub fn name(&self) -> &StepName {
        &self.name
    }

    /// Returns the attempt limit.
    pub fn attempt_limit(&self) -> u32 {
        self.max_attempts
    }

    /// Returns `true` if the step is optional.
    pub fn is_optional(&self) -> bool {
        self.optional
    }

    /// Returns the retry delay policy.
    pub fn retry_delay(&self) -> &RetryDelay {
        &self.delay
    }

    /// Returns the handler.
    pub fn handler(&self) -> Arc<dyn StepHandler> {
        Arc::clone(&self.handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_name() {
        let name = StepName::new("test");
        assert_eq!(name.as_str(), "test");

        let name: StepName = "test".into();
        assert_eq!(name, "test");
    }

    #[test]
    fn test_handler_outcome_normalizes() {
        assert_eq!(
            HandlerOutcome::from(json!(7)).into_step_result(),
            StepResult::Success { state: json!(7) }
        );
        assert_eq!(
            HandlerOutcome::from(StepResult::Skipped).into_step_result(),
            StepResult::Skipped
        );
    }

    #[test]
    fn test_retry_delay_fixed() {
        let delay = RetryDelay::fixed(Duration::from_secs(1));
        assert_eq!(delay.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(delay.delay_for_attempt(7), Duration::from_secs(1));
        assert_eq!(RetryDelay::None.delay_for_attempt(2), Duration::ZERO);
    }

    #[test]
    fn test_retry_delay_exponential() {
        let delay = RetryDelay::exponential(Duration::from_millis(100));
        assert_eq!(delay.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(delay.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(delay.delay_for_attempt(4), Duration::from_millis(400));
        assert_eq!(delay.delay_for_attempt(40), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_delay_custom() {
        let delay = RetryDelay::custom(|attempt| Duration::from_secs(u64::from(attempt) * 10));
        assert_eq!(delay.delay_for_attempt(3), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_delay_validation() {
        assert!(RetryDelay::exponential_backoff(
            Duration::from_millis(100),
            Duration::from_secs(10),
            0
        )
        .is_err());
        assert!(RetryDelay::exponential_backoff(
            Duration::from_secs(10),
            Duration::from_secs(1),
            2
        )
        .is_err());
    }

    #[test]
    fn test_step_defaults() {
        let step = Step::new("noop", |ctx| async move { Ok(ctx.state) });
        assert_eq!(step.attempt_limit(), 1);
        assert!(!step.is_optional());
        assert_eq!(step.retry_delay().delay_for_attempt(2), Duration::ZERO);
    }
}
