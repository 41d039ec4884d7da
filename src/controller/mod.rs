//! Controller framework: leadership-gated reconciliation loops.
//!
//! A [`Controller`] composes an activator, any number of watchers, and one
//! reconciler. While the activator reports this process as active (leader),
//! the watchers and the work queue run; when it reports inactive they are
//! quiesced and the queue is drained. Re-activation restarts the watchers
//! from store replay, never from a stale cursor.

mod queue;
mod watchers;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, info, instrument};

pub use queue::{QueueConfig, WorkQueue, WorkQueueHandle};
pub use watchers::{DeviceChangeWatcher, NetworkChangeWatcher};

use crate::{
    error::{ControllerError, ControllerResult},
    stores::LeadershipStore,
    types::NetworkChangeId,
};

// ============================================================================
// Capabilities
// ============================================================================

/// Gates the controller on some external activation condition.
#[async_trait]
pub trait Activator: Send {
    /// Begin publishing activation edges into `active`. The current value at
    /// return time is the snapshot.
    async fn start(&mut self, active: watch::Sender<bool>) -> ControllerResult<()>;

    async fn stop(&mut self);
}

/// Converts store events into reconcile requests on the queue.
#[async_trait]
pub trait Watcher: Send {
    async fn start(&mut self, queue: WorkQueueHandle) -> ControllerResult<()>;

    async fn stop(&mut self);
}

/// The reconciliation state machine.
///
/// `Ok(true)` means the request is settled for now, `Ok(false)` means retry
/// later without error (e.g. admission denied), `Err` means retry with a
/// bounded number of attempts. Implementations must be idempotent and
/// tolerate concurrent invocations for distinct ids.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, id: &NetworkChangeId) -> ControllerResult<bool>;
}

// ============================================================================
// Leadership Activator
// ============================================================================

/// Activates the controller while this process holds cluster leadership.
pub struct LeadershipActivator {
    store: Arc<dyn LeadershipStore>,
    task: Option<JoinHandle<()>>,
}

impl LeadershipActivator {
    pub fn new(store: Arc<dyn LeadershipStore>) -> Self {
        Self { store, task: None }
    }
}

#[async_trait]
impl Activator for LeadershipActivator {
    async fn start(&mut self, active: watch::Sender<bool>) -> ControllerResult<()> {
        let mut leadership = self.store.watch().await?;
        self.task = Some(tokio::spawn(async move {
            loop {
                let is_leader = *leadership.borrow_and_update();
                if active.send(is_leader).is_err() {
                    break;
                }
                if leadership.changed().await.is_err() {
                    debug!("leadership stream closed");
                    break;
                }
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

struct ActiveState {
    stop: watch::Sender<()>,
    dispatcher: JoinHandle<()>,
}

/// A leadership-gated reconciliation loop over one entity kind.
pub struct Controller {
    name: String,
    queue_config: QueueConfig,
    activator: Option<Box<dyn Activator>>,
    watchers: Vec<Box<dyn Watcher>>,
    reconciler: Option<Arc<dyn Reconciler>>,
}

impl Controller {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue_config: QueueConfig::default(),
            activator: None,
            watchers: Vec::new(),
            reconciler: None,
        }
    }

    pub fn with_queue_config(mut self, config: QueueConfig) -> Self {
        self.queue_config = config;
        self
    }

    /// Gate the controller on the given activator.
    pub fn activate(&mut self, activator: impl Activator + 'static) {
        self.activator = Some(Box::new(activator));
    }

    /// Add a watcher feeding the work queue.
    pub fn watch(&mut self, watcher: impl Watcher + 'static) {
        self.watchers.push(Box::new(watcher));
    }

    /// Set the reconciler driven by the work queue.
    pub fn reconcile(&mut self, reconciler: impl Reconciler + 'static) {
        self.reconciler = Some(Arc::new(reconciler));
    }

    /// Run the controller until `shutdown` fires. Activation and deactivation
    /// follow the activator's edges; both are idempotent.
    #[instrument(skip(self, shutdown), fields(name = %self.name))]
    pub async fn start(mut self, mut shutdown: watch::Receiver<()>) -> ControllerResult<()> {
        let mut activator = self
            .activator
            .take()
            .ok_or_else(|| ControllerError::NotConfigured("activator".to_string()))?;
        let reconciler = self
            .reconciler
            .take()
            .ok_or_else(|| ControllerError::NotConfigured("reconciler".to_string()))?;

        let (active_tx, mut active_rx) = watch::channel(false);
        activator.start(active_tx).await?;

        let mut active: Option<ActiveState> = None;
        loop {
            let is_active = *active_rx.borrow_and_update();
            if is_active && active.is_none() {
                info!("{} controller activating", self.name);
                active = Some(self.activate_loops(Arc::clone(&reconciler)).await?);
            } else if !is_active {
                if let Some(state) = active.take() {
                    info!("{} controller deactivating", self.name);
                    self.deactivate_loops(state).await;
                }
            }

            tokio::select! {
                changed = active_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        if let Some(state) = active.take() {
            self.deactivate_loops(state).await;
        }
        activator.stop().await;
        debug!("{} controller stopped", self.name);
        Ok(())
    }

    async fn activate_loops(
        &mut self,
        reconciler: Arc<dyn Reconciler>,
    ) -> ControllerResult<ActiveState> {
        let (stop_tx, stop_rx) = watch::channel(());
        let (handle, dispatcher) =
            WorkQueue::spawn(self.queue_config.clone(), reconciler, stop_rx);

        for i in 0..self.watchers.len() {
            if let Err(e) = self.watchers[i].start(handle.clone()).await {
                for started in &mut self.watchers[..i] {
                    started.stop().await;
                }
                let _ = stop_tx.send(());
                return Err(e);
            }
        }

        Ok(ActiveState {
            stop: stop_tx,
            dispatcher,
        })
    }

    async fn deactivate_loops(&mut self, state: ActiveState) {
        for watcher in &mut self.watchers {
            watcher.stop().await;
        }
        let _ = state.stop.send(());
        let _ = state.dispatcher.await;
    }
}
