use tokio::task::JoinHandle;

use crate::utils::Mutex;

/// Tracks the tokio tasks spawned by the splitter and its mappers.
///
/// Every handle is kept so shutdown can either wait for the tasks or abort them.
#[derive(Debug, Default)]
pub struct TaskManager {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawns `fut` inside a span naming the caller's location.
    #[track_caller]
    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        use tracing::Instrument;
        let location = std::panic::Location::caller();
        let span = tracing::trace_span!(
            "task",
            file = location.file(),
            line = location.line(),
        );

        let handle = tokio::spawn(fut.instrument(span));
        self.tasks.super_safe_lock(|tasks| {
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
        });
    }

    /// Number of tracked tasks that have not finished yet.
    pub fn running(&self) -> usize {
        self.tasks
            .super_safe_lock(|tasks| tasks.iter().filter(|task| !task.is_finished()).count())
    }

    /// Waits for every tracked task to complete.
    pub async fn join_all(&self) {
        let handles = self.tasks.super_safe_lock(std::mem::take);

        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Cancels every tracked task without waiting for it.
    pub fn abort_all(&self) {
        self.tasks.super_safe_lock(|tasks| {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_join_all_waits_for_tasks() {
        let manager = TaskManager::new();
        let (tx, rx) = async_channel::unbounded();
        manager.spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(1u8).await;
        });

        manager.join_all().await;
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(manager.running(), 0);
    }

    #[tokio::test]
    async fn test_abort_all_cancels_pending_tasks() {
        let manager = TaskManager::new();
        manager.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(manager.running(), 1);

        manager.abort_all();
        manager.join_all().await;
        assert_eq!(manager.running(), 0);
    }
}
