//! Pull-based worker.

use crate::config::WorkerConfig;
use crate::dispatch::{Dispatcher, ErrorHooks};
use crate::error::EngineError;
use kumihimo_core::{Storage, Workflow};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Running {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Polls a [`Storage`] for eligible tasks and executes them.
///
/// # Examples
///
/// ```
/// use kumihimo::{MemoryStorage, Step, Worker, WorkerConfig, Workflow};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let workflow = Workflow::new("noop")
///     .step(Step::new("noop", |ctx| async move { Ok(ctx.state) }));
///
/// let mut worker = Worker::new(Arc::new(MemoryStorage::new()))
///     .with_config(WorkerConfig::default().with_empty_pull_delay(Duration::from_millis(10)));
/// worker.on_error(|err| eprintln!("{err}"));
///
/// worker.start(&[workflow]).await.expect("started");
/// worker.stop().await.expect("stopped");
/// # });
/// ```
pub struct Worker<S: Storage + 'static> {
    storage: Arc<S>,
    config: WorkerConfig,
    errors: ErrorHooks,
    running: Option<Running>,
}

impl<S: Storage + 'static> fmt::Debug for Worker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("running", &self.running.is_some())
            .finish()
    }
}

impl<S: Storage + 'static> Worker<S> {
    /// Creates a stopped worker over `storage`.
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            config: WorkerConfig::default(),
            errors: ErrorHooks::default(),
            running: None,
        }
    }

    /// Replaces the loop configuration.
    #[must_use]
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers an `onError` hook.
    pub fn on_error<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&EngineError) + Send + Sync + 'static,
    {
        self.errors.add(hook);
        self
    }

    /// Returns the storage this worker polls.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Returns `true` between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Readies `workflows` and spawns the pull loop.
    pub async fn start(&mut self, workflows: &[Workflow]) -> Result<(), EngineError> {
        if self.running.is_some() {
            return Err(EngineError::AlreadyStarted);
        }
        let dispatcher = Dispatcher::new(workflows, self.errors.clone())?;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(pull_loop(
            Arc::clone(&self.storage),
            dispatcher,
            self.config.clone(),
            shutdown.clone(),
        ));

        info!(
            workflows = workflows.len(),
            pull_limit = self.config.pull_limit.get(),
            "Worker started"
        );
        self.running = Some(Running { shutdown, handle });
        Ok(())
    }

    /// Stops pulling, waits for the in-flight pass, then disconnects the storage.
    pub async fn stop(&mut self) -> Result<(), EngineError> {
        let Running { shutdown, handle } = self.running.take().ok_or(EngineError::NotStarted)?;
        shutdown.cancel();
        if let Err(err) = handle.await {
            warn!(error = %err, "Pull loop ended abnormally");
        }
        self.storage
            .disconnect()
            .await
            .map_err(EngineError::Disconnect)?;
        info!("Worker stopped");
        Ok(())
    }
}

async fn pull_loop<S: Storage>(
    storage: Arc<S>,
    dispatcher: Dispatcher,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    let workflows = dispatcher.workflows();
    while !shutdown.is_cancelled() {
        let states = match storage.pull(&workflows, config.pull_limit.get()).await {
            Ok(states) => states,
            Err(err) => {
                dispatcher.report(EngineError::Pull(err));
                Vec::new()
            }
        };

        if states.is_empty() {
            debug!("No eligible tasks");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(config.empty_pull_delay) => {}
            }
            continue;
        }

        // A pulled pass always runs to completion, even if stop was requested.
        for state in states {
            let _ = dispatcher.dispatch(storage.as_ref(), state).await;
        }
    }
}
