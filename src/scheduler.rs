//! Timed background work
//!
//! One-shot and repeating callbacks run on their own tokio tasks. Every task
//! gets a [`TaskId`] that can cancel it; [`Scheduler::shutdown`] cancels
//! everything and waits for firings already in progress.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Handle to a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Runs one-shot and repeating callbacks
///
/// Cloning is cheap; clones share the same set of tasks.
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    tasks: Mutex<HashMap<TaskId, CancellationToken>>,
    root: CancellationToken,
    tracker: TaskTracker,
}

impl Inner {
    fn register(&self) -> Option<(TaskId, CancellationToken)> {
        if self.root.is_cancelled() {
            return None;
        }
        let id = TaskId::new();
        let token = self.root.child_token();
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, token.clone());
        Some((id, token))
    }

    fn forget(&self, id: TaskId) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

impl Scheduler {
    /// Create a scheduler with no tasks
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` once after `delay`
    ///
    /// Returns immediately. After [`shutdown`](Self::shutdown) the callback
    /// is dropped and the returned id refers to nothing.
    pub fn schedule<F, Fut>(&self, delay: Duration, callback: F) -> TaskId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let Some((id, token)) = self.inner.register() else {
            tracing::debug!("scheduler is shut down, dropping task");
            return TaskId::new();
        };

        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    fire(id, async move { callback().await }).await;
                }
            }
            inner.forget(id);
        });

        tracing::debug!(task = %id, ?delay, "scheduled task");
        id
    }

    /// Run `callback` now, then again `interval` after each run returns
    ///
    /// Firings never overlap. Errors and panics are logged and the next
    /// firing still happens.
    pub fn repeat<F, Fut>(&self, interval: Duration, mut callback: F) -> TaskId
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let Some((id, token)) = self.inner.register() else {
            tracing::debug!("scheduler is shut down, dropping repeating task");
            return TaskId::new();
        };

        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            loop {
                if token.is_cancelled() {
                    break;
                }
                fire(id, async { callback().await }).await;

                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            inner.forget(id);
        });

        tracing::debug!(task = %id, ?interval, "scheduled repeating task");
        id
    }

    /// Prevent further firings of `id`
    ///
    /// A firing already running is allowed to finish. Returns whether the
    /// task was still pending.
    pub fn cancel(&self, id: TaskId) -> bool {
        let token = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        token.is_some_and(|token| {
            token.cancel();
            tracing::debug!(task = %id, "cancelled task");
            true
        })
    }

    /// Number of tasks not yet finished or cancelled
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    /// Cancel every task and wait for in-flight firings to finish
    pub async fn shutdown(&self) {
        self.inner.root.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::debug!("scheduler shut down");
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

async fn fire<Fut>(id: TaskId, firing: Fut)
where
    Fut: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(firing).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(task = %id, error = %e, "scheduled task failed"),
        Err(_) => tracing::error!(task = %id, "scheduled task panicked"),
    }
}
