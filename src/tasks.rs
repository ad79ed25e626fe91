//! Background work
//!
//! Fire-and-forget tasks that must outlive the request that triggered them.
//! Tasks for the same key run one at a time; the server waits for in-flight
//! tasks on shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::task::TaskTracker;
use tracing::{debug, error};
use uuid::Uuid;

/// One async mutex per key, created on first use and dropped once the
/// last holder or waiter lets go
pub struct KeyedLocks<K> {
    locks: std::sync::Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, key: &K) -> KeyedGuard<'_, K> {
        let lock = self.map().entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        KeyedGuard {
            locks: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<K, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Every waiter holds a clone of the Arc, so a count of one is the map alone.
    fn release(&self, key: &K) {
        let mut locks = self.map();
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map().len()
    }
}

/// Held lock for one key; releasing it prunes the key when nobody else waits
pub struct KeyedGuard<'a, K: Eq + Hash + Clone> {
    locks: &'a KeyedLocks<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(&self.key);
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    locks: Arc<KeyedLocks<Uuid>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            locks: Arc::new(KeyedLocks::new()),
        }
    }

    /// Run `task` on the runtime, after any earlier task for `project_id`.
    /// Failures are logged; nobody awaits the result.
    pub fn spawn<F, E>(&self, project_id: Uuid, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let locks = self.locks.clone();
        self.tracker.spawn(async move {
            let _guard = locks.lock(&project_id).await;
            debug!("Background task '{}' started for project {}", name, project_id);
            match task.await {
                Ok(()) => debug!("Background task '{}' finished for project {}", name, project_id),
                Err(e) => error!("Background task '{}' failed for project {}: {}", name, project_id, e),
            }
        });
    }

    /// Stop accepting tasks and wait for the running ones
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_tasks_for_one_project_do_not_overlap() {
        let tasks = BackgroundTasks::new();
        let project = Uuid::new_v4();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let (running, peak) = (running.clone(), peak.clone());
            tasks.spawn(project, "job", async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), String>(())
            });
        }
        tasks.shutdown().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_task_outlives_dropped_caller() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));

        let caller = {
            let (tasks, done) = (tasks.clone(), done.clone());
            tokio::spawn(async move {
                tasks.spawn(Uuid::new_v4(), "job", async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), String>(())
                });
                std::future::pending::<()>().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        caller.abort();
        tasks.shutdown().await;

        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keyed_locks_are_independent_per_key() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(&1u32).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock(&2u32)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_keyed_locks_forget_released_keys() {
        let locks = KeyedLocks::new();
        for key in 0..100u32 {
            let _guard = locks.lock(&key).await;
        }
        assert_eq!(locks.len(), 0);

        let held = locks.lock(&7u32).await;
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_keyed_lock_survives_while_someone_waits() {
        let locks = Arc::new(KeyedLocks::new());
        let first = locks.lock(&1u32).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&1u32).await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(first);
        assert_eq!(locks.len(), 1);

        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }
}
