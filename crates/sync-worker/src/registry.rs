use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use sync_core::{EventStream, SyncError, SyncErrorCategory, TransportChannel};
use tracing::{debug, info};

use crate::worker::{WorkerEnvironment, WorkerHandle, spawn_worker};

/// A fresh port onto a (possibly shared) session worker.
#[derive(Debug)]
pub struct WorkerConnection {
    pub worker_id: String,
    pub channel: TransportChannel,
    pub events: EventStream,
}

/// Owns sync worker lifecycles, one worker per session id.
///
/// Connecting twice for the same session attaches to the same live worker.
#[derive(Clone)]
pub struct WorkerRegistry {
    env: WorkerEnvironment,
    workers: Arc<Mutex<HashMap<String, WorkerHandle>>>,
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.lock().len())
            .finish_non_exhaustive()
    }
}

impl WorkerRegistry {
    pub fn new(env: WorkerEnvironment) -> Self {
        Self {
            env,
            workers: Arc::default(),
        }
    }

    pub fn worker_id(session_id: &str) -> String {
        format!("sync-{session_id}")
    }

    /// Open a port onto the worker for `session_id`, spawning it if needed.
    pub fn connect(&self, session_id: &str) -> Result<WorkerConnection, SyncError> {
        if session_id.trim().is_empty() {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "missing_session_id",
                "a session id is required to connect a sync worker",
            ));
        }

        let worker_id = Self::worker_id(session_id);
        let mut workers = self.lock();
        if workers.get(&worker_id).is_some_and(WorkerHandle::is_alive) {
            debug!(%worker_id, "attaching to running sync worker");
        } else {
            info!(%worker_id, "spawning sync worker");
            let handle = spawn_worker(&worker_id, self.env.clone());
            workers.insert(worker_id.clone(), handle);
        }
        let handle = &workers[&worker_id];

        Ok(WorkerConnection {
            channel: TransportChannel::connect(handle.worker_tx.clone()),
            events: handle.events.subscribe(),
            worker_id,
        })
    }

    /// Number of live workers; dead entries are pruned.
    pub fn live_workers(&self) -> usize {
        let mut workers = self.lock();
        workers.retain(|_, handle| handle.is_alive());
        workers.len()
    }

    /// Stop the worker for `session_id`. Returns whether one was registered.
    pub fn terminate(&self, session_id: &str) -> bool {
        let worker_id = Self::worker_id(session_id);
        match self.lock().remove(&worker_id) {
            Some(handle) => {
                info!(%worker_id, "terminating sync worker");
                handle.terminate();
                true
            }
            None => false,
        }
    }

    /// Terminate every worker and wait for them to exit.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.lock().drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            handle.join().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
