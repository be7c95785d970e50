//! Push-based consumer.

use crate::dispatch::{Dispatcher, ErrorHooks};
use crate::error::EngineError;
use futures::future::BoxFuture;
use kumihimo_core::{Consumption, MessageHandler, Queue, Workflow, WorkflowState};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Executes tasks delivered by a [`Queue`].
///
/// Each delivery is dispatched as it arrives. A delivery is rejected, and
/// left to the queue to redeliver, when its outcome could not be persisted.
pub struct Consumer<Q: Queue + 'static> {
    queue: Arc<Q>,
    errors: ErrorHooks,
    consumption: Option<Box<dyn Consumption>>,
}

impl<Q: Queue + 'static> fmt::Debug for Consumer<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("running", &self.consumption.is_some())
            .finish()
    }
}

impl<Q: Queue + 'static> Consumer<Q> {
    /// Creates a stopped consumer over `queue`.
    pub fn new(queue: Arc<Q>) -> Self {
        Self {
            queue,
            errors: ErrorHooks::default(),
            consumption: None,
        }
    }

    /// Registers an `onError` hook.
    pub fn on_error<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&EngineError) + Send + Sync + 'static,
    {
        self.errors.add(hook);
        self
    }

    /// Returns the queue this consumer listens on.
    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    /// Returns `true` between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.consumption.is_some()
    }

    /// Readies `workflows` and subscribes to the queue.
    pub async fn start(&mut self, workflows: &[Workflow]) -> Result<(), EngineError> {
        if self.consumption.is_some() {
            return Err(EngineError::AlreadyStarted);
        }
        let dispatcher = Dispatcher::new(workflows, self.errors.clone())?;
        let queue = Arc::clone(&self.queue);
        let handler: MessageHandler = Arc::new(
            move |state: WorkflowState| -> BoxFuture<'static, anyhow::Result<()>> {
                let dispatcher = dispatcher.clone();
                let queue = Arc::clone(&queue);
                Box::pin(async move {
                    dispatcher.dispatch(queue.as_ref(), state).await?;
                    Ok(())
                })
            },
        );

        let consumption = self
            .queue
            .consume(handler)
            .await
            .map_err(EngineError::Consume)?;
        info!(workflows = workflows.len(), "Consumer started");
        self.consumption = Some(consumption);
        Ok(())
    }

    /// Stops taking deliveries, waits for in-flight ones, then disconnects the queue.
    pub async fn stop(&mut self) -> Result<(), EngineError> {
        let mut consumption = self.consumption.take().ok_or(EngineError::NotStarted)?;
        consumption.stop().await.map_err(EngineError::Consume)?;
        self.queue
            .disconnect()
            .await
            .map_err(EngineError::Disconnect)?;
        info!("Consumer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryQueue;
    use crate::trigger::{trigger, TriggerOptions};
    use kumihimo_core::Step;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let workflow = Workflow::new("w").step(Step::new("a", |ctx| async move { Ok(ctx.state) }));
        let mut consumer = Consumer::new(Arc::new(MemoryQueue::new()));

        assert!(matches!(consumer.stop().await, Err(EngineError::NotStarted)));
        assert_ok!(consumer.start(&[workflow.clone()]).await);
        assert!(matches!(
            consumer.start(&[workflow]).await,
            Err(EngineError::AlreadyStarted)
        ));
        assert_ok!(consumer.stop().await);
    }

    #[tokio::test]
    async fn test_delivered_tasks_advance() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let workflow = Workflow::new("w")
            .step(Step::new("a", |ctx| async move { Ok(ctx.state) }))
            .step(Step::new("b", |_ctx| async move { Ok(json!("done")) }))
            .on_workflow_completed(move |event, _| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event.result);
                    Ok(())
                }
            });

        let queue = Arc::new(MemoryQueue::new());
        let mut consumer = Consumer::new(Arc::clone(&queue));
        assert_ok!(consumer.start(&[workflow.clone()]).await);

        assert_ok!(trigger(queue.as_ref(), &workflow, json!(1), TriggerOptions::default()).await);
        assert_eq!(rx.recv().await, Some(json!("done")));
        assert_ok!(consumer.stop().await);
    }
}
