use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Cancellation handle for one in-flight external process.
///
/// The orchestrator that spawned the process owns the child; the handle only
/// asks it to terminate. Clones share the same signal.
#[derive(Debug, Clone, Default)]
pub struct ProcessHandle {
    token: CancellationToken,
}

impl ProcessHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn terminate(&self) {
        self.token.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Job id to process handle, for cancellation lookups.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<String, ProcessHandle>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_id: &str, handle: ProcessHandle) {
        if let Some(previous) = self.jobs.lock().insert(job_id.to_string(), handle) {
            tracing::debug!(task_id = job_id, terminated = previous.is_terminated(), "replaced job handle");
        }
    }

    pub fn lookup(&self, job_id: &str) -> Option<ProcessHandle> {
        self.jobs.lock().get(job_id).cloned()
    }

    pub fn unregister(&self, job_id: &str) -> Option<ProcessHandle> {
        self.jobs.lock().remove(job_id)
    }

    /// Terminates one job. Cleanup runs through the job's own failure path.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.lookup(job_id) {
            Some(handle) => {
                handle.terminate();
                true
            }
            None => false,
        }
    }

    /// Signals every live handle. Used on shutdown.
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<(String, ProcessHandle)> = self
            .jobs
            .lock()
            .iter()
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect();
        for (id, handle) in &handles {
            tracing::info!(task_id = %id, "stopping job");
            handle.terminate();
        }
        handles.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
