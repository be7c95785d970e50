//! In-memory adapters.
//!
//! Both adapters keep everything in process memory. They are meant for
//! tests and single-process deployments, and as a reference for backends
//! built on real databases or brokers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kumihimo_core::{
    Consumption, MessageHandler, Queue, StateWriter, Storage, StorageError, Workflow,
    WorkflowState, Write,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(30);
const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_millis(100);

struct Record {
    state: WorkflowState,
    claimed_until: Option<DateTime<Utc>>,
}

/// Storage keeping workflow states in a `HashMap`.
///
/// `pull` leases every task it returns for the claim TTL so that several
/// workers sharing one store never run the same task concurrently. Writing
/// an update releases the lease.
///
/// # Examples
///
/// ```
/// use kumihimo::{trigger, MemoryStorage, Step, TriggerOptions, Workflow};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let storage = MemoryStorage::new();
/// let workflow = Workflow::new("greet")
///     .step(Step::new("hello", |ctx| async move { Ok(ctx.state) }));
///
/// let state = trigger(&storage, &workflow, json!("world"), TriggerOptions::default())
///     .await
///     .expect("triggered");
/// assert!(storage.find(&state.id).is_some());
/// # });
/// ```
#[derive(Clone)]
pub struct MemoryStorage {
    records: Arc<RwLock<HashMap<String, Record>>>,
    claim_ttl: Duration,
    disconnected: Arc<AtomicBool>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            claim_ttl: DEFAULT_CLAIM_TTL,
            disconnected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets how long a pulled task stays leased.
    #[must_use]
    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    /// Returns a copy of the state stored under `id`.
    pub fn find(&self, id: &str) -> Option<WorkflowState> {
        self.records.read().get(id).map(|r| r.state.clone())
    }

    /// Returns a copy of every stored state.
    pub fn states(&self) -> Vec<WorkflowState> {
        self.records
            .read()
            .values()
            .map(|r| r.state.clone())
            .collect()
    }

    /// Returns the number of stored states.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn ensure_connected(&self) -> Result<(), StorageError> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(StorageError::Disconnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StateWriter for MemoryStorage {
    type WriteOptions = ();

    async fn write(&self, writes: Vec<Write>, _options: ()) -> Result<(), StorageError> {
        self.ensure_connected()?;
        let mut records = self.records.write();
        for write in writes {
            match write {
                Write::Insert(state) => {
                    records.entry(state.id.clone()).or_insert(Record {
                        state,
                        claimed_until: None,
                    });
                }
                Write::Update(state) => {
                    records.insert(
                        state.id.clone(),
                        Record {
                            state,
                            claimed_until: None,
                        },
                    );
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn pull(
        &self,
        workflows: &[Workflow],
        limit: usize,
    ) -> Result<Vec<WorkflowState>, StorageError> {
        self.ensure_connected()?;
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.claim_ttl)
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        let by_name: HashMap<String, &Workflow> =
            workflows.iter().map(|w| (w.name(), w)).collect();

        let mut records = self.records.write();
        let mut eligible: Vec<&mut Record> = records
            .values_mut()
            .filter(|record| {
                let state = &record.state;
                let Some(workflow) = by_name.get(&state.name) else {
                    return false;
                };
                let within_attempts = workflow
                    .get_step_by_name(state.to_execute.step.as_str())
                    .map_or(false, |(step, _)| state.to_execute.attempt <= step.attempt_limit());
                !state.is_terminal()
                    && state.to_execute.is_ready_at(now)
                    && within_attempts
                    && record.claimed_until.map_or(true, |until| until <= now)
            })
            .collect();
        eligible.sort_by_key(|record| record.state.last_modified);

        let pulled: Vec<WorkflowState> = eligible
            .into_iter()
            .take(limit)
            .map(|record| {
                record.claimed_until = Some(now + lease);
                record.state.clone()
            })
            .collect();
        trace!(count = pulled.len(), "Pulled tasks");
        Ok(pulled)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<WorkflowState>, StorageError> {
        self.ensure_connected()?;
        Ok(self.find(id))
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

type Receiver = mpsc::UnboundedReceiver<WorkflowState>;

/// Queue delivering workflow states over a tokio channel.
///
/// States whose task carries `pick_after` are delivered once that instant
/// passes. Terminal states are never delivered. A delivery whose handler
/// fails is redelivered after the redelivery delay.
#[derive(Clone)]
pub struct MemoryQueue {
    sender: mpsc::UnboundedSender<WorkflowState>,
    receiver: Arc<Mutex<Option<Receiver>>>,
    redelivery_delay: Duration,
    disconnected: Arc<AtomicBool>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(Some(receiver))),
            redelivery_delay: DEFAULT_REDELIVERY_DELAY,
            disconnected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the pause before a rejected message is delivered again.
    #[must_use]
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    fn publish(&self, state: WorkflowState) -> Result<(), StorageError> {
        let wait = state
            .to_execute
            .pick_after
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .filter(|wait| !wait.is_zero());

        match wait {
            None => self
                .sender
                .send(state)
                .map_err(|_| StorageError::Disconnected),
            Some(wait) => {
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    if sender.send(state).is_err() {
                        debug!("Queue closed before delayed delivery");
                    }
                });
                Ok(())
            }
        }
    }
}

#[async_trait]
impl StateWriter for MemoryQueue {
    type WriteOptions = ();

    async fn write(&self, writes: Vec<Write>, _options: ()) -> Result<(), StorageError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(StorageError::Disconnected);
        }
        for write in writes {
            let state = write.into_state();
            if state.is_terminal() {
                trace!(id = %state.id, "Dropping terminal state");
                continue;
            }
            self.publish(state)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn consume(&self, handler: MessageHandler) -> Result<Box<dyn Consumption>, StorageError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(StorageError::Disconnected);
        }
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| StorageError::Backend("queue is already being consumed".to_string()))?;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(deliver(
            receiver,
            self.sender.clone(),
            handler,
            self.redelivery_delay,
            shutdown.clone(),
        ));

        Ok(Box::new(MemoryConsumption {
            shutdown,
            handle: Some(handle),
            slot: Arc::clone(&self.receiver),
        }))
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

async fn deliver(
    mut receiver: Receiver,
    sender: mpsc::UnboundedSender<WorkflowState>,
    handler: MessageHandler,
    redelivery_delay: Duration,
    shutdown: CancellationToken,
) -> Receiver {
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            message = receiver.recv() => {
                let Some(state) = message else { break };
                let handler = Arc::clone(&handler);
                let sender = sender.clone();
                in_flight.spawn(async move {
                    if let Err(err) = handler(state.clone()).await {
                        warn!(id = %state.id, error = %err, "Message rejected, redelivering");
                        tokio::time::sleep(redelivery_delay).await;
                        if sender.send(state).is_err() {
                            debug!("Queue closed before redelivery");
                        }
                    }
                });
            }
        }
    }
    while in_flight.join_next().await.is_some() {}
    receiver
}

struct MemoryConsumption {
    shutdown: CancellationToken,
    handle: Option<JoinHandle<Receiver>>,
    slot: Arc<Mutex<Option<Receiver>>>,
}

#[async_trait]
impl Consumption for MemoryConsumption {
    async fn stop(&mut self) -> Result<(), StorageError> {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let receiver = handle
                .await
                .map_err(|err| StorageError::Backend(err.to_string()))?;
            // Undelivered messages stay queued for the next consumer.
            *self.slot.lock() = Some(receiver);
        }
        Ok(())
    }
}
