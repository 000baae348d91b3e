//! Graceful shutdown of a node's background tasks.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the node's cancellation token and the tasks that watch it.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Token cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a task that shutdown will wait for. The task must stop on
    /// [`token`](Self::token).
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.tasks.lock().push((name, handle));
    }

    /// Cancel the token and wait up to `timeout` for tracked tasks; tasks
    /// still running after that are aborted.
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.token.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        info!(
            task_count = tasks.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for tasks to complete"
        );

        let deadline = tokio::time::Instant::now() + timeout;
        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => debug!(task = name, "task stopped"),
                Err(_) => {
                    warn!(task = name, "task did not stop within {timeout:?}, aborting");
                    handle.abort();
                }
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn cooperative_tasks_are_awaited() {
        let coord = ShutdownCoordinator::new();
        let stopped = Arc::new(AtomicBool::new(false));
        let token = coord.token();
        let flag = Arc::clone(&stopped);
        coord.spawn("watcher", async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(coord.tasks.lock().len(), 1);

        coord.graceful_shutdown(None).await;

        assert!(coord.token().is_cancelled());
        assert!(stopped.load(Ordering::SeqCst));
        assert!(coord.tasks.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_tasks_are_aborted_after_timeout() {
        let coord = ShutdownCoordinator::new();
        coord.spawn("stuck", async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });
        coord
            .graceful_shutdown(Some(Duration::from_millis(100)))
            .await;
        assert!(coord.token().is_cancelled());
        assert!(coord.tasks.lock().is_empty());
    }

    #[test]
    fn token_clones_observe_shutdown() {
        let coord = ShutdownCoordinator::default();
        let token = coord.token();
        assert!(!token.is_cancelled());
        coord.token.cancel();
        assert!(token.is_cancelled());
    }
}
