//! Named background tasks sharing one cancellation token
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Scheduler                                                      │
//! │  ├── token: CancellationToken (parent of every task)            │
//! │  └── tasks: HashMap<name, JoinHandle>                           │
//! │      ├── "discovery"        periodic                            │
//! │      ├── "keepalive"        periodic                            │
//! │      ├── "queue-flush"      periodic                            │
//! │      ├── "processed-sweep"  periodic                            │
//! │      ├── "ack-check"        periodic                            │
//! │      ├── "recovery"         periodic, interval follows the tier │
//! │      ├── "sync"             periodic                            │
//! │      └── "pump:<transport>" one per driver                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Spawning a name that already exists replaces (and aborts) the old task.
//! Shutdown cancels the token, then aborts whatever is left. It may be
//! called any number of times.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Scheduler {
    token: CancellationToken,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Token cancelled on shutdown, for work spawned outside the scheduler
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Run a future until it completes or the scheduler shuts down
    pub fn spawn<F>(&self, name: impl Into<String>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.is_shut_down() {
            tracing::debug!(task = %name, "Scheduler shut down, not spawning");
            return;
        }
        let token = self.token.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::trace!(task = %task_name, "Task cancelled");
                }
                _ = fut => {}
            }
        });
        self.install(name, handle);
    }

    /// Run `job` every `interval()`; the interval is re-read before each wait
    pub fn spawn_periodic<I, J, Fut>(&self, name: impl Into<String>, interval: I, job: J)
    where
        I: Fn() -> Duration + Send + 'static,
        J: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.is_shut_down() {
            tracing::debug!(task = %name, "Scheduler shut down, not spawning");
            return;
        }
        let token = self.token.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval()) => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = job() => {}
                }
            }
            tracing::trace!(task = %task_name, "Periodic task stopped");
        });
        self.install(name, handle);
    }

    fn install(&self, name: String, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        if let Some(old) = tasks.insert(name.clone(), handle) {
            old.abort();
            tracing::debug!(task = %name, "Replaced running task");
        }
        // A shutdown that raced with this spawn must not leave it running
        if self.is_shut_down() {
            if let Some(handle) = tasks.remove(&name) {
                handle.abort();
            }
        }
    }

    /// Stop one task; false if it did not exist
    pub fn cancel(&self, name: &str) -> bool {
        match self.tasks.lock().remove(name) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a task with this name is still running
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .get(name)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Names of every registered task, sorted
    pub fn task_names(&self) -> Vec<String> {
        let mut names = self.tasks.lock().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Cancel every task; later calls are no-ops
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        let drained = self.tasks.lock().drain().collect::<Vec<_>>();
        let count = drained.len();
        for (_, handle) in drained {
            handle.abort();
        }
        tracing::debug!(tasks = count, "Scheduler shut down");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_periodic_task_runs_until_shutdown() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler.spawn_periodic(
            "tick",
            || Duration::from_millis(5),
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);
        assert!(scheduler.is_running("tick"));

        scheduler.shutdown();
        scheduler.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let after = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), after);
        assert!(scheduler.task_names().is_empty());
    }

    #[tokio::test]
    async fn test_respawn_replaces_task() {
        let scheduler = Scheduler::new();
        scheduler.spawn("pump", std::future::pending());
        scheduler.spawn("pump", std::future::pending());
        assert_eq!(scheduler.task_names(), vec!["pump".to_string()]);
        assert!(scheduler.cancel("pump"));
        assert!(!scheduler.cancel("pump"));
    }

    #[tokio::test]
    async fn test_spawn_after_shutdown_is_ignored() {
        let scheduler = Scheduler::new();
        let token = scheduler.child_token();
        scheduler.shutdown();
        assert!(token.is_cancelled());
        scheduler.spawn("late", async {});
        assert!(!scheduler.is_running("late"));
        assert!(scheduler.task_names().is_empty());
    }
}
