//! Lookup table of live workers

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::worker::WorkerProcess;

/// Worker id to process handle. Written only by the coordinator; anyone may
/// read it.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<RwLock<HashMap<String, Arc<WorkerProcess>>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, worker: Arc<WorkerProcess>) {
        self.workers.write().insert(worker.id().to_string(), worker);
    }

    pub fn lookup(&self, worker_id: &str) -> Option<Arc<WorkerProcess>> {
        self.workers.read().get(worker_id).cloned()
    }

    /// All registered workers, ordered by id
    pub fn list(&self) -> Vec<Arc<WorkerProcess>> {
        let mut workers: Vec<_> = self.workers.read().values().cloned().collect();
        workers.sort_by(|a, b| a.id().cmp(b.id()));
        workers
    }

    pub fn deregister(&self, worker_id: &str) -> Option<Arc<WorkerProcess>> {
        self.workers.write().remove(worker_id)
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }
}
