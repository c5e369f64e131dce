//! Tracking for background tasks (memory retains, skill generation).
//!
//! Handles stay in the live-set until their task completes so they cannot
//! be dropped mid-flight; everything is aborted on shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct TaskTracker {
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn a named task that removes itself from the tracker when done.
    /// A task with the same name aborts its predecessor.
    pub async fn spawn_tracked<F>(&self, name: String, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let tasks = self.tasks.clone();
        let cleanup_name = name.clone();
        let handle = tokio::spawn(async move {
            future.await;
            tasks.lock().await.remove(&cleanup_name);
            debug!(task = %cleanup_name, "tracked task finished");
        });

        let mut tasks = self.tasks.lock().await;
        if let Some(old) = tasks.insert(name.clone(), handle) {
            warn!(task = %name, "replacing in-flight task with the same name");
            old.abort();
        }
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Await every currently tracked task (shutdown and tests).
    pub async fn wait_all(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub async fn cancel_all(&self) {
        let handles: HashMap<String, JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().collect()
        };
        let count = handles.len();
        for (name, handle) in handles {
            handle.abort();
            debug!(task = %name, "task cancelled");
        }
        if count > 0 {
            info!(count, "cancelled tracked tasks");
        }
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}
