//! Worker configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

const DEFAULT_PULL_LIMIT: usize = 10;
const DEFAULT_EMPTY_PULL_DELAY: Duration = Duration::from_secs(1);

/// Settings for the pull loop of a [`Worker`](crate::Worker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Maximum number of tasks requested per pull.
    pub pull_limit: NonZeroUsize,
    /// Pause before the next pull when one returned nothing.
    pub empty_pull_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pull_limit: NonZeroUsize::new(DEFAULT_PULL_LIMIT).unwrap_or(NonZeroUsize::MIN),
            empty_pull_delay: DEFAULT_EMPTY_PULL_DELAY,
        }
    }
}

impl WorkerConfig {
    /// Sets the pull limit.
    #[must_use]
    pub fn with_pull_limit(mut self, pull_limit: NonZeroUsize) -> Self {
        self.pull_limit = pull_limit;
        self
    }

    /// Sets the delay applied after an empty pull.
    #[must_use]
    pub fn with_empty_pull_delay(mut self, delay: Duration) -> Self {
        self.empty_pull_delay = delay;
        self
    }
}
