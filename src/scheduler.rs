//! Task scheduling: bounded workers, per-configuration locks, cancellation.
//!
//! Every build, diff, sync and publish runs as one task through
//! [`TaskScheduler::run`]. At most `max_workers` tasks execute at once;
//! further tasks wait for a permit. Builds additionally take a
//! [`ConfigGuard`] so two builds of the same configuration never run at the
//! same time; a second request is rejected with `HubError::Busy`.
//!
//! The scheduler is passed by reference to the pipeline components. There
//! is no process-wide registry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use biohub_core::cancel::CancelToken;
use biohub_core::{HubError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Build,
    Diff,
    Sync,
    Publish,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: u64,
    pub kind: TaskKind,
    pub label: String,
    pub started_at: DateTime<Utc>,
}

struct TaskEntry {
    info: TaskInfo,
    token: CancelToken,
}

#[derive(Clone)]
pub struct TaskScheduler {
    workers: Arc<Semaphore>,
    max_workers: usize,
    locks: Arc<Mutex<BTreeSet<String>>>,
    tasks: Arc<Mutex<BTreeMap<u64, TaskEntry>>>,
    next_id: Arc<AtomicU64>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive claim on one build configuration, released on drop.
pub struct ConfigGuard {
    name: String,
    locks: Arc<Mutex<BTreeSet<String>>>,
}

impl ConfigGuard {
    pub fn config(&self) -> &str {
        &self.name
    }
}

impl Drop for ConfigGuard {
    fn drop(&mut self) {
        guard(&self.locks).remove(&self.name);
        debug!(config = %self.name, "released configuration lock");
    }
}

/// Unregisters a task even when its future is dropped early.
struct Registration<'a> {
    id: u64,
    tasks: &'a Mutex<BTreeMap<u64, TaskEntry>>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        guard(self.tasks).remove(&self.id);
    }
}

impl TaskScheduler {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            locks: Arc::new(Mutex::new(BTreeSet::new())),
            tasks: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Claim `config` for a build, or fail with `Busy` if it is taken.
    pub fn try_lock_config(&self, config: &str) -> Result<ConfigGuard> {
        let mut locks = guard(&self.locks);
        if !locks.insert(config.to_string()) {
            return Err(HubError::Busy(config.to_string()));
        }
        debug!(config = %config, "acquired configuration lock");
        Ok(ConfigGuard {
            name: config.to_string(),
            locks: Arc::clone(&self.locks),
        })
    }

    pub fn is_locked(&self, config: &str) -> bool {
        guard(&self.locks).contains(config)
    }

    /// Run `task` once a worker permit is available. The task receives the
    /// cancellation token registered for it.
    pub async fn run<T, F, Fut>(&self, kind: TaskKind, label: &str, task: F) -> Result<T>
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_with_token(kind, label, CancelToken::new(), task).await
    }

    /// Like [`run`](Self::run), registering a token the caller also holds.
    pub async fn run_with_token<T, F, Fut>(
        &self,
        kind: TaskKind,
        label: &str,
        token: CancelToken,
        task: F,
    ) -> Result<T>
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        guard(&self.tasks).insert(
            id,
            TaskEntry {
                info: TaskInfo {
                    id,
                    kind,
                    label: label.to_string(),
                    started_at: Utc::now(),
                },
                token: token.clone(),
            },
        );
        let _registration = Registration {
            id,
            tasks: &self.tasks,
        };

        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| HubError::invalid_state("task scheduler is shut down"))?;
        token.check()?;

        info!(task = id, kind = ?kind, label = %label, "task started");
        let result = task(token).await;
        match &result {
            Ok(_) => info!(task = id, kind = ?kind, label = %label, "task finished"),
            Err(e) => info!(task = id, kind = ?kind, label = %label, error = %e, "task ended with error"),
        }
        result
    }

    /// Tasks currently registered (running or waiting for a worker).
    pub fn running(&self) -> Vec<TaskInfo> {
        guard(&self.tasks).values().map(|t| t.info.clone()).collect()
    }

    pub fn cancel(&self, id: u64) -> bool {
        match guard(&self.tasks).get(&id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let tasks = guard(&self.tasks);
        for entry in tasks.values() {
            entry.token.cancel();
        }
        tasks.len()
    }
}

/// Await a storage operation with an upper bound.
///
/// Backend failures become `HubError::Backend`; an elapsed deadline becomes
/// `HubError::Timeout`. Both are retryable during sync.
pub async fn timed<T, Fut>(operation: &str, limit: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        // A `HubError` raised inside the future keeps its kind.
        Ok(result) => result.map_err(|e| match e.downcast::<HubError>() {
            Ok(hub) => hub,
            Err(other) => HubError::from(other),
        }),
        Err(_) => Err(HubError::Timeout {
            operation: operation.to_string(),
            secs: limit.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_config_lock_is_exclusive_and_released_on_drop() {
        let scheduler = TaskScheduler::new(2);
        let first = scheduler.try_lock_config("genes").unwrap();
        assert_eq!(first.config(), "genes");
        let err = scheduler.try_lock_config("genes").err().unwrap();
        assert_eq!(err.kind(), "busy");
        assert!(scheduler.try_lock_config("variants").is_ok());
        drop(first);
        assert!(!scheduler.is_locked("genes"));
        assert!(scheduler.try_lock_config("genes").is_ok());
    }

    #[tokio::test]
    async fn test_worker_pool_bounds_concurrency() {
        let scheduler = TaskScheduler::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..6 {
            let scheduler = scheduler.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                scheduler
                    .run(TaskKind::Diff, &format!("t{i}"), |_| async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(scheduler.running().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_reaches_running_task() {
        let scheduler = TaskScheduler::new(1);
        let s2 = scheduler.clone();
        let handle = tokio::spawn(async move {
            s2.run(TaskKind::Build, "genes", |token| async move {
                for _ in 0..200 {
                    token.check()?;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.cancel_all(), 1);
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_timed_maps_timeout_and_backend_errors() {
        let err = timed("slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "timeout");

        let err = timed("broken", Duration::from_secs(1), async {
            Err::<(), _>(anyhow::anyhow!("io"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "backend");
        assert!(err.is_retryable());

        let err = timed("hook", Duration::from_secs(1), async {
            Err::<(), _>(anyhow::Error::new(HubError::Cancelled))
        })
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
    }
}
