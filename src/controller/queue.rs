//! Deduplicating, rate-limited work queue for reconcile requests.
//!
//! Watchers enqueue network-change ids; the dispatcher fans them out to a
//! bounded worker pool. One id is reconciled by at most one worker at a time;
//! enqueues observed while an id is in flight mark it dirty and it is
//! re-dispatched once the in-flight call returns, so a single pending id
//! covers any number of unobserved updates.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

use super::Reconciler;
use crate::{error::ControllerResult, flow_control::RetryManager, types::NetworkChangeId};

/// Capacity of the dispatcher's message channel.
const QUEUE_CHANNEL_CAPACITY: usize = 256;

/// Tuning knobs for the work queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Workers reconciling distinct ids concurrently.
    pub max_concurrency: usize,
    /// Consecutive reconcile errors tolerated per id before it is dropped.
    /// A denied admission (`Ok(false)`) is not an error and retries forever.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_retries: 8,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }
}

enum QueueMessage {
    Enqueue(NetworkChangeId),
    Done {
        id: NetworkChangeId,
        outcome: ControllerResult<bool>,
    },
}

/// Cloneable producer side of the queue, handed to watchers.
#[derive(Clone)]
pub struct WorkQueueHandle {
    tx: mpsc::Sender<QueueMessage>,
}

impl WorkQueueHandle {
    /// Request reconciliation of a network change. A no-op once the queue has
    /// been stopped.
    pub async fn enqueue(&self, id: NetworkChangeId) {
        if self.tx.send(QueueMessage::Enqueue(id)).await.is_err() {
            debug!("work queue stopped; dropping reconcile request");
        }
    }
}

/// Factory for the queue dispatcher task.
pub struct WorkQueue;

impl WorkQueue {
    /// Spawn the dispatcher. It runs until `shutdown` fires or every handle
    /// is dropped; on shutdown the queue is drained.
    pub fn spawn(
        config: QueueConfig,
        reconciler: Arc<dyn Reconciler>,
        shutdown: watch::Receiver<()>,
    ) -> (WorkQueueHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CHANNEL_CAPACITY);
        let handle = WorkQueueHandle { tx: tx.clone() };
        let dispatcher = Dispatcher {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            reconciler,
            tx,
            worker_shutdown: shutdown.clone(),
            pending: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: HashSet::new(),
            dirty: HashSet::new(),
            retries: HashMap::new(),
        };
        let task = tokio::spawn(dispatcher.run(rx, shutdown));
        (handle, task)
    }
}

/// Per-id retry bookkeeping: backoff grows across every inconclusive attempt,
/// the error counter only across consecutive errors.
struct RetryState {
    backoff: RetryManager,
    errors: u32,
}

struct Dispatcher {
    config: QueueConfig,
    reconciler: Arc<dyn Reconciler>,
    tx: mpsc::Sender<QueueMessage>,
    worker_shutdown: watch::Receiver<()>,
    semaphore: Arc<Semaphore>,
    pending: VecDeque<NetworkChangeId>,
    queued: HashSet<NetworkChangeId>,
    in_flight: HashSet<NetworkChangeId>,
    dirty: HashSet<NetworkChangeId>,
    retries: HashMap<NetworkChangeId, RetryState>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<QueueMessage>,
        mut shutdown: watch::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(QueueMessage::Enqueue(id)) => {
                        self.enqueue(id);
                        self.dispatch_ready();
                    }
                    Some(QueueMessage::Done { id, outcome }) => {
                        self.complete(id, outcome);
                        self.dispatch_ready();
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    self.drain();
                    break;
                }
            }
        }
        debug!("work queue dispatcher stopped");
    }

    fn enqueue(&mut self, id: NetworkChangeId) {
        if self.in_flight.contains(&id) {
            self.dirty.insert(id);
            return;
        }
        if self.queued.insert(id.clone()) {
            self.pending.push_back(id);
        }
    }

    fn dispatch_ready(&mut self) {
        while !self.pending.is_empty() {
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };
            let id = self.pending.pop_front().expect("pending is non-empty");
            self.queued.remove(&id);
            self.in_flight.insert(id.clone());

            let reconciler = Arc::clone(&self.reconciler);
            let tx = self.tx.clone();
            let mut shutdown = self.worker_shutdown.clone();
            tokio::spawn(async move {
                // A shutdown mid-call cancels the reconciliation at its next
                // suspension point; whatever it already persisted is durable.
                tokio::select! {
                    outcome = reconciler.reconcile(&id) => {
                        let _ = tx.send(QueueMessage::Done { id, outcome }).await;
                    }
                    _ = shutdown.changed() => {}
                }
                drop(permit);
            });
        }
    }

    fn complete(&mut self, id: NetworkChangeId, outcome: ControllerResult<bool>) {
        self.in_flight.remove(&id);
        match outcome {
            Ok(true) => {
                self.retries.remove(&id);
                if self.dirty.remove(&id) {
                    self.enqueue(id);
                }
            }
            Ok(false) => {
                self.dirty.remove(&id);
                let retry = self.retries.entry(id.clone()).or_insert_with(|| RetryState {
                    backoff: RetryManager::new(self.config.base_delay, self.config.max_delay),
                    errors: 0,
                });
                retry.errors = 0;
                retry.backoff.record_attempt();
                let delay = retry.backoff.next_delay();
                debug!("reconcile of {} made no progress; requeueing in {:?}", id, delay);
                self.schedule(id, delay);
            }
            Err(e) => {
                self.dirty.remove(&id);
                let retry = self.retries.entry(id.clone()).or_insert_with(|| RetryState {
                    backoff: RetryManager::new(self.config.base_delay, self.config.max_delay),
                    errors: 0,
                });
                retry.errors += 1;
                retry.backoff.record_attempt();
                if retry.errors > self.config.max_retries {
                    error!(
                        "giving up on {} after {} consecutive errors: {}",
                        id, retry.errors, e
                    );
                    self.retries.remove(&id);
                    return;
                }
                let delay = retry.backoff.next_delay();
                warn!("reconcile of {} failed: {}; retrying in {:?}", id, e, delay);
                self.schedule(id, delay);
            }
        }
    }

    fn schedule(&self, id: NetworkChangeId, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(QueueMessage::Enqueue(id)).await;
        });
    }

    fn drain(&mut self) {
        let dropped = self.pending.len() + self.dirty.len();
        if dropped > 0 {
            debug!("draining work queue; {} pending requests dropped", dropped);
        }
        self.pending.clear();
        self.queued.clear();
        self.in_flight.clear();
        self.dirty.clear();
        self.retries.clear();
    }
}
