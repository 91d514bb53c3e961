/// Centralized tracking for long-running background loops.
///
/// Every loop (intake, IPC broker, scheduler, webhook server) registers
/// here under a stable name. Spawning under a name that is already live
/// aborts the previous task first, which doubles as the duplicate-start
/// guard required on every loop.
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

    /// Spawn a tracked background task under `name`.
    pub async fn spawn(&self, name: String, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        if let Some(old_handle) = tasks.remove(&name) {
            warn!("Aborting existing task '{}' before spawning new one", name);
            old_handle.abort();
        }
        tasks.insert(name, handle);
    }

    /// Spawn a tracked task that removes itself from the tracker on completion.
    pub async fn spawn_auto_cleanup<F>(&self, name: String, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let tasks = self.tasks.clone();
        let name_clone = name.clone();
        let handle = tokio::spawn(async move {
            future.await;
            tasks.lock().await.remove(&name_clone);
            debug!("Task '{}' completed and removed from tracker", name_clone);
        });

        let mut tasks_guard = self.tasks.lock().await;
        if let Some(old_handle) = tasks_guard.remove(&name) {
            warn!("Aborting existing task '{}' before spawning new one", name);
            old_handle.abort();
        }
        tasks_guard.insert(name, handle);
    }

    /// Whether a task with this name is currently tracked.
    pub async fn is_running(&self, name: &str) -> bool {
        self.tasks.lock().await.contains_key(name)
    }

    /// Cancel all tracked tasks.
    pub async fn cancel_all(&self) {
        let tasks: HashMap<String, JoinHandle<()>> = {
            let mut guard = self.tasks.lock().await;
            guard.drain().collect()
        };
        let count = tasks.len();
        for (name, handle) in tasks {
            handle.abort();
            debug!("Cancelled task '{}'", name);
        }
        if count > 0 {
            info!("Cancelled {} tracked tasks", count);
        }
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}
