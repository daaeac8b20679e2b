use crate::signal::OneShot;
use crate::TaskStatus;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// Tasks carried by one status batch, in the order the supervisor sent them.
pub type TaskBatch = Vec<TaskStatus>;

#[derive(Debug, Default)]
struct TaskTable {
    tasks: HashMap<String, TaskStatus>,
    subscribers: Vec<mpsc::UnboundedSender<TaskBatch>>,
}

/// Authoritative task id -> status table.
///
/// Unlike [`crate::PortRegistry`], subscribers receive only the tasks of each
/// batch rather than a bare "changed" signal.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    table: Mutex<TaskTable>,
    first_batch: OneShot<TaskBatch>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts every task of the batch (last write wins) and publishes the batch.
    pub fn apply_update(&self, observed: TaskBatch) {
        let mut table = self.lock();
        for task in &observed {
            table.tasks.insert(task.id.clone(), task.clone());
        }
        table
            .subscribers
            .retain(|subscriber| subscriber.send(observed.clone()).is_ok());
        let count = observed.len();
        if self.first_batch.fire(observed) {
            debug!(event = "tasks_first_batch", count);
        }
        debug!(
            event = "tasks_update_applied",
            total = table.tasks.len(),
            count,
            subscribers = table.subscribers.len()
        );
    }

    /// Receives every batch applied after this call.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TaskBatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// The first batch ever applied. Resolves immediately once it has arrived.
    pub async fn first_batch(&self) -> TaskBatch {
        self.first_batch.wait().await
    }

    pub fn has_first_batch(&self) -> bool {
        self.first_batch.is_fired()
    }

    pub fn get(&self, id: &str) -> Option<TaskStatus> {
        self.lock().tasks.get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<TaskStatus> {
        let mut tasks: Vec<_> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().tasks.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, TaskTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
