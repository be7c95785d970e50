//! Order fulfilment workflow driven by a pull worker.
//!
//! Demonstrates:
//! - Steps passing a JSON payload along
//! - Retries with exponential backoff and optional steps
//! - A plugin contributing a decorator, a step and a hook
//! - Lifecycle hooks and the engine's `on_error` hook

use kumihimo::prelude::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Inventory {
    stock: u64,
}

fn notifications(sender: &'static str) -> Plugin<String> {
    Plugin::new("notifications", move |scope: &Workflow, channel: String| {
        scope.decorate("channel", channel)?;
        scope
            .step(
                Step::new("notify-customer", move |ctx| async move {
                    let channel = ctx
                        .workflow
                        .decorator::<String>("channel")
                        .map(|c| c.to_string())
                        .unwrap_or_default();
                    println!("[{sender}] sending confirmation via {channel}");
                    Ok(ctx.state)
                })
                .optional(true),
            )
            .on_step_error(|event, _| async move {
                println!("notification attempt {} failed: {}", event.attempt, event.error);
                Ok(())
            });
        Ok(())
    })
}

fn order_workflow(payment_attempts: Arc<AtomicU32>) -> Result<Workflow, WorkflowError> {
    let workflow = Workflow::new("orders");
    workflow.decorate("inventory", Inventory { stock: 10 })?;

    workflow
        .step(Step::new("validate", |ctx| async move {
            let quantity = ctx.state["quantity"].as_u64().unwrap_or_default();
            if quantity == 0 {
                return Ok(ctx.stop());
            }
            Ok(ctx.ok(ctx.state.clone()))
        }))
        .step(Step::new("reserve-stock", |ctx| async move {
            let available = ctx
                .workflow
                .decorator::<Inventory>("inventory")
                .map_or(0, |inventory| inventory.stock);
            let quantity = ctx.state["quantity"].as_u64().unwrap_or_default();
            anyhow::ensure!(quantity <= available, "only {available} items in stock");

            let mut order = ctx.state;
            order["reserved"] = Value::Bool(true);
            Ok(order)
        }))
        .step(
            Step::new("charge-card", move |ctx| {
                let attempts = Arc::clone(&payment_attempts);
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Ok(ctx.err("payment gateway timeout"));
                    }
                    let mut order = ctx.state.clone();
                    order["charged"] = json!(ctx.attempt);
                    Ok(ctx.ok(order))
                }
            })
            .max_attempts(4)
            .delay(RetryDelay::exponential(Duration::from_millis(50))),
        );

    workflow.register(notifications("shop"), "email".to_string());

    Ok(workflow
        .on_step_error(|event, _| async move {
            println!("step '{}' failed (attempt {}): {}", event.step, event.attempt, event.error);
            Ok(())
        })
        .on_workflow_stopped(|event, _| async move {
            println!("order {} stopped at '{}'", event.instance.id, event.step);
            Ok(())
        }))
}

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    tracing_subscriber::fmt::init();

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let workflow = order_workflow(Arc::new(AtomicU32::new(0)))?.on_workflow_completed(
        move |event, _| {
            let done = done_tx.clone();
            async move {
                let _ = done.send(event.result);
                Ok(())
            }
        },
    );

    let storage = Arc::new(MemoryStorage::new());
    let mut worker = Worker::new(Arc::clone(&storage))
        .with_config(WorkerConfig::default().with_empty_pull_delay(Duration::from_millis(20)));
    worker.on_error(|err| eprintln!("engine error: {err}"));
    worker.start(&[workflow.clone()]).await?;

    let order = json!({ "id": "A-1001", "quantity": 3 });
    let state = trigger(storage.as_ref(), &workflow, order, TriggerOptions::default()).await?;
    println!("triggered order workflow {}", state.id);

    match tokio::time::timeout(Duration::from_secs(5), done_rx.recv()).await {
        Ok(Some(result)) => println!("order completed: {result}"),
        _ => println!("order did not complete in time"),
    }

    worker.stop().await?;

    if let Some(state) = storage.find(&state.id) {
        for step in &state.steps {
            let statuses: Vec<_> = step.attempts.iter().map(|a| a.status).collect();
            println!("{:>16}: {:?}", step.name.as_str(), statuses);
        }
    }
    Ok(())
}
