use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::error::DiscoveryError;
use crate::state::{ClusterState, Transition};

/// Queue lane for a state update. Discovery updates always run urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Processed before any queued normal update.
    Urgent,
    /// Background lane.
    Normal,
}

type UpdateFn =
    Box<dyn FnOnce(&Arc<ClusterState>) -> Result<Arc<ClusterState>, DiscoveryError> + Send>;

struct UpdateTask {
    source: String,
    update: UpdateFn,
    done: oneshot::Sender<Result<Transition, DiscoveryError>>,
}

/// Single-writer cluster-state store.
///
/// Update functions run serially on a dedicated worker task, each observing
/// the latest accepted snapshot. An update either returns the current
/// snapshot unchanged (a no-op), a new snapshot with a strictly higher
/// version, or an error; proposals that move the version backwards are
/// rejected, which is what lets followers ignore publishes from a superseded
/// master.
pub struct ClusterStateStore {
    urgent_tx: mpsc::UnboundedSender<UpdateTask>,
    normal_tx: mpsc::UnboundedSender<UpdateTask>,
    current_rx: watch::Receiver<Arc<ClusterState>>,
}

impl ClusterStateStore {
    /// Creates the store and spawns its worker.
    #[must_use]
    pub fn new(initial: ClusterState) -> Arc<Self> {
        let (urgent_tx, urgent_rx) = mpsc::unbounded_channel();
        let (normal_tx, normal_rx) = mpsc::unbounded_channel();
        let (current_tx, current_rx) = watch::channel(Arc::new(initial));
        tokio::spawn(worker(current_tx, urgent_rx, normal_rx));
        Arc::new(Self {
            urgent_tx,
            normal_tx,
            current_rx,
        })
    }

    /// The latest accepted snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<ClusterState> {
        self.current_rx.borrow().clone()
    }

    /// Watches snapshot replacements.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.current_rx.clone()
    }

    /// Submits an update and waits for its outcome.
    pub async fn submit<F>(
        &self,
        source: &str,
        priority: Priority,
        update: F,
    ) -> Result<Transition, DiscoveryError>
    where
        F: FnOnce(&Arc<ClusterState>) -> Result<Arc<ClusterState>, DiscoveryError>
            + Send
            + 'static,
    {
        let (done, outcome) = oneshot::channel();
        let task = UpdateTask {
            source: source.to_string(),
            update: Box::new(update),
            done,
        };
        let lane = match priority {
            Priority::Urgent => &self.urgent_tx,
            Priority::Normal => &self.normal_tx,
        };
        lane.send(task).map_err(|_| {
            DiscoveryError::StateApplication("state store worker stopped".to_string())
        })?;
        outcome.await.map_err(|_| {
            DiscoveryError::StateApplication("state store worker stopped".to_string())
        })?
    }
}

async fn worker(
    current_tx: watch::Sender<Arc<ClusterState>>,
    mut urgent_rx: mpsc::UnboundedReceiver<UpdateTask>,
    mut normal_rx: mpsc::UnboundedReceiver<UpdateTask>,
) {
    loop {
        let task = tokio::select! {
            biased;
            task = urgent_rx.recv() => task,
            task = normal_rx.recv() => task,
        };
        let Some(task) = task else { break };
        apply(&current_tx, task);
    }
}

fn apply(current_tx: &watch::Sender<Arc<ClusterState>>, task: UpdateTask) {
    let current = current_tx.borrow().clone();
    let outcome = match (task.update)(&current) {
        Ok(new) => {
            if Arc::ptr_eq(&new, &current) {
                Ok(Transition {
                    source: task.source,
                    old: Arc::clone(&current),
                    new: current,
                })
            } else if new.version <= current.version {
                Err(DiscoveryError::StaleState {
                    current: current.version,
                    proposed: new.version,
                })
            } else {
                debug!(
                    source = %task.source,
                    version = new.version,
                    "applied cluster state update"
                );
                current_tx.send_replace(Arc::clone(&new));
                Ok(Transition {
                    source: task.source,
                    old: current,
                    new,
                })
            }
        }
        Err(err) => Err(err),
    };
    let _ = task.done.send(outcome);
}
