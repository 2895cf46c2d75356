//! Concurrent fan-out of one operation over many backends
//!
//! [`DispatchEngine::run`] starts one worker task per target backend. A
//! worker locks its backend, invokes the [`Operation`], and forwards every
//! produced item into a channel shared by the whole dispatch. A failing
//! worker records a [`CallError`](crate::CallError) and stops; its siblings
//! keep going.

mod handle;
mod method;

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use handle::{BlockingIter, Collected, DispatchHandle, DispatchState, Reply};
pub use method::MethodCall;

use crate::backend::{Backend, BackendInstance};
use crate::capabilities::Capability;
use crate::error::{CallError, Error};
use handle::Event;

/// Default capacity of a dispatch channel
pub const DEFAULT_BUFFER: usize = 64;

/// What an operation produced for one backend
pub enum Outcome<'a, T> {
    /// Nothing to forward
    Nothing,
    /// A single item
    Value(T),
    /// A lazy sequence, drained item by item while the backend stays locked
    Stream(BoxStream<'a, anyhow::Result<T>>),
}

impl<T> fmt::Debug for Outcome<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nothing => f.write_str("Nothing"),
            Self::Value(_) => f.write_str("Value(..)"),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Work run against each locked backend of a dispatch
pub trait Operation<T>: Send + Sync {
    /// Run against one backend
    ///
    /// # Errors
    ///
    /// Any error becomes a [`CallError`](crate::CallError) for this backend
    fn invoke<'a>(
        &'a self,
        backend: &'a mut dyn Backend,
    ) -> BoxFuture<'a, anyhow::Result<Outcome<'a, T>>>;

    /// Capability the operation needs, used to pick targets by default
    fn capability(&self) -> Option<Capability> {
        None
    }

    /// Short name for log records
    fn describe(&self) -> String {
        "<closure>".to_string()
    }
}

/// [`Operation`] backed by a closure, built by [`operation`]
pub struct FnOperation<F> {
    f: F,
    capability: Option<Capability>,
}

impl<F> FnOperation<F> {
    /// Declare the capability the closure relies on
    #[must_use]
    pub fn requires(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }
}

impl<T, F> Operation<T> for FnOperation<F>
where
    F: for<'a> Fn(&'a mut dyn Backend) -> BoxFuture<'a, anyhow::Result<Outcome<'a, T>>>
        + Send
        + Sync,
{
    fn invoke<'a>(
        &'a self,
        backend: &'a mut dyn Backend,
    ) -> BoxFuture<'a, anyhow::Result<Outcome<'a, T>>> {
        (self.f)(backend)
    }

    fn capability(&self) -> Option<Capability> {
        self.capability
    }
}

impl<F> fmt::Debug for FnOperation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation")
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

/// Wrap a closure taking the locked backend as an [`Operation`]
///
/// ```ignore
/// let op = operation(|backend: &mut dyn Backend| {
///     async move {
///         let bank = backend.as_bank().context("not a bank")?;
///         Ok(Outcome::Stream(bank.iter_accounts()))
///     }
///     .boxed()
/// })
/// .requires(Capability::Bank);
/// ```
pub fn operation<T, F>(f: F) -> FnOperation<F>
where
    F: for<'a> Fn(&'a mut dyn Backend) -> BoxFuture<'a, anyhow::Result<Outcome<'a, T>>>
        + Send
        + Sync,
{
    FnOperation {
        f,
        capability: None,
    }
}

/// Filter applied to every produced item before it is forwarded
pub type Condition<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// A dispatch target
#[derive(Clone)]
pub enum Target {
    /// A live instance, by name
    Name(String),
    /// A specific instance
    Instance(Arc<BackendInstance>),
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<Arc<BackendInstance>> for Target {
    fn from(instance: Arc<BackendInstance>) -> Self {
        Self::Instance(instance)
    }
}

impl From<&Arc<BackendInstance>> for Target {
    fn from(instance: &Arc<BackendInstance>) -> Self {
        Self::Instance(Arc::clone(instance))
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.debug_tuple("Name").field(name).finish(),
            Self::Instance(instance) => f.debug_tuple("Instance").field(&instance.name()).finish(),
        }
    }
}

/// Target selection and per-item filtering for one dispatch
pub struct DispatchOptions<T> {
    pub(crate) targets: Option<Vec<Target>>,
    pub(crate) capabilities: Option<Vec<Capability>>,
    condition: Option<Condition<T>>,
    limit: Option<usize>,
}

impl<T> Default for DispatchOptions<T> {
    fn default() -> Self {
        Self {
            targets: None,
            capabilities: None,
            condition: None,
            limit: None,
        }
    }
}

impl<T> DispatchOptions<T> {
    /// No explicit targets, no filter, no limit
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an explicit target
    ///
    /// With explicit targets, the operation's own capability no longer picks
    /// backends; a target lacking it fails with
    /// [`Error::Unsupported`](crate::Error::Unsupported).
    #[must_use]
    pub fn target(mut self, target: impl Into<Target>) -> Self {
        self.targets.get_or_insert_with(Vec::new).push(target.into());
        self
    }

    /// Add several explicit targets
    #[must_use]
    pub fn targets<I>(mut self, targets: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Target>,
    {
        self.targets
            .get_or_insert_with(Vec::new)
            .extend(targets.into_iter().map(Into::into));
        self
    }

    /// Only backends with `capability` take part
    #[must_use]
    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities
            .get_or_insert_with(Vec::new)
            .push(capability);
        self
    }

    /// Drop items for which `condition` returns false
    #[must_use]
    pub fn condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Forward at most `limit` items per backend
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl<T> fmt::Debug for DispatchOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchOptions")
            .field("targets", &self.targets)
            .field("capabilities", &self.capabilities)
            .field("condition", &self.condition.is_some())
            .field("limit", &self.limit)
            .finish()
    }
}

/// Starts dispatches over resolved backends
#[derive(Debug, Clone, Copy)]
pub struct DispatchEngine {
    buffer: usize,
}

impl Default for DispatchEngine {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl DispatchEngine {
    /// Engine whose dispatch channels hold `buffer` pending items
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }

    /// Run `operation` once on every backend in `targets`
    ///
    /// Duplicate targets are dispatched once. Only the condition and limit of
    /// `options` are used here; target selection happens in the caller.
    pub fn run<T, O>(
        &self,
        targets: Vec<Arc<BackendInstance>>,
        operation: O,
        options: DispatchOptions<T>,
    ) -> DispatchHandle<T>
    where
        T: Send + 'static,
        O: Operation<T> + 'static,
    {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.buffer);
        let operation: Arc<dyn Operation<T>> = Arc::new(operation);

        let mut seen = HashSet::new();
        let targets: Vec<_> = targets
            .into_iter()
            .filter(|instance| seen.insert(instance.name().to_string()))
            .collect();

        tracing::debug!(
            dispatch_id = %id,
            operation = %operation.describe(),
            backends = targets.len(),
            "starting dispatch"
        );

        for instance in targets {
            let worker = Worker {
                dispatch_id: id,
                instance,
                operation: Arc::clone(&operation),
                condition: options.condition.clone(),
                limit: options.limit,
                tx: tx.clone(),
                token: token.clone(),
            };
            tokio::spawn(worker.run());
        }

        DispatchHandle::new(id, rx, token)
    }
}

struct Worker<T> {
    dispatch_id: Uuid,
    instance: Arc<BackendInstance>,
    operation: Arc<dyn Operation<T>>,
    condition: Option<Condition<T>>,
    limit: Option<usize>,
    tx: mpsc::Sender<Event<T>>,
    token: CancellationToken,
}

impl<T: Send + 'static> Worker<T> {
    async fn run(self) {
        let result = AssertUnwindSafe(self.drive()).catch_unwind().await;
        let error = match result {
            Ok(Ok(forwarded)) => {
                tracing::debug!(
                    dispatch_id = %self.dispatch_id,
                    instance = %self.instance.name(),
                    forwarded,
                    "backend done"
                );
                return;
            }
            Ok(Err(e)) => e,
            Err(payload) => anyhow::anyhow!("operation panicked: {}", panic_message(&*payload)),
        };

        if self.token.is_cancelled() {
            tracing::debug!(
                dispatch_id = %self.dispatch_id,
                instance = %self.instance.name(),
                error = %error,
                "ignoring failure of cancelled dispatch"
            );
            return;
        }

        tracing::warn!(
            dispatch_id = %self.dispatch_id,
            instance = %self.instance.name(),
            error = %error,
            "backend call failed"
        );
        let event = Event::Error(CallError::new(self.instance.name(), error));
        tokio::select! {
            biased;
            () = self.token.cancelled() => {}
            _ = self.tx.send(event) => {}
        }
    }

    /// Returns the number of forwarded items
    async fn drive(&self) -> anyhow::Result<usize> {
        if let Some(capability) = self.operation.capability() {
            if !self.instance.has_capability(capability) {
                return Err(Error::Unsupported {
                    backend: self.instance.name().to_string(),
                    capability,
                }
                .into());
            }
        }

        let mut session = tokio::select! {
            biased;
            () = self.token.cancelled() => return Ok(0),
            () = self.instance.unloading() => anyhow::bail!("backend was unloaded"),
            session = self.instance.lock() => session,
        };
        anyhow::ensure!(!self.instance.is_retired(), "backend was unloaded");

        let mut forwarded = 0;
        let outcome = tokio::select! {
            biased;
            () = self.instance.unloading() => anyhow::bail!("backend was unloaded"),
            outcome = self.operation.invoke(&mut **session) => outcome?,
        };
        match outcome {
            Outcome::Nothing => {}
            Outcome::Value(item) => {
                if !self.forward(item, &mut forwarded).await {
                    anyhow::ensure!(!self.instance.is_unloading(), "backend was unloaded");
                }
            }
            Outcome::Stream(mut items) => loop {
                if self.limit.is_some_and(|limit| forwarded >= limit) {
                    break;
                }
                let next = tokio::select! {
                    biased;
                    () = self.token.cancelled() => break,
                    () = self.instance.unloading() => anyhow::bail!("backend was unloaded"),
                    next = items.next() => next,
                };
                let Some(item) = next else { break };
                if !self.forward(item?, &mut forwarded).await {
                    anyhow::ensure!(!self.instance.is_unloading(), "backend was unloaded");
                    break;
                }
            },
        }

        Ok(forwarded)
    }

    /// Send `item` unless filtered out; returns false when the worker should stop
    async fn forward(&self, item: T, forwarded: &mut usize) -> bool {
        if self.limit.is_some_and(|limit| *forwarded >= limit) {
            return false;
        }
        if let Some(condition) = &self.condition {
            if !condition(&item) {
                return true;
            }
        }

        let event = Event::Item(Arc::clone(&self.instance), item);
        let sent = tokio::select! {
            biased;
            () = self.token.cancelled() => false,
            () = self.instance.unloading() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        };
        if sent {
            *forwarded += 1;
        }
        sent
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::Context;
    use serde_json::Value;

    use super::*;
    use crate::testing;

    fn account_ids(replies: &[Reply<Value>], backend: &str) -> Vec<String> {
        replies
            .iter()
            .filter(|reply| reply.backend_name() == backend)
            .map(|reply| reply.item["id"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn failing_backend_does_not_stop_others() {
        let alpha = testing::bank("alpha", &[("login", "alpha")]).await;
        let beta = testing::bank("beta", &[("login", "beta"), ("fail_after", "0")]).await;

        let collected = DispatchEngine::default()
            .run(
                vec![alpha, beta],
                MethodCall::new("iter_accounts", Vec::<String>::new()),
                DispatchOptions::new(),
            )
            .collect()
            .await;

        assert_eq!(
            account_ids(&collected.replies, "alpha"),
            vec!["alpha-0", "alpha-1", "alpha-2"]
        );
        assert!(account_ids(&collected.replies, "beta").is_empty());
        assert_eq!(collected.errors.len(), 1);
        assert_eq!(collected.errors[0].backend, "beta");
        assert!(collected.errors[0].to_string().contains("invalid credentials"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn per_backend_order_is_preserved() {
        let slow = testing::bank("slow", &[("login", "slow"), ("accounts", "5"), ("delay_ms", "4")]).await;
        let fast = testing::bank("fast", &[("login", "fast"), ("accounts", "5"), ("delay_ms", "1")]).await;

        let replies = DispatchEngine::new(2)
            .run(
                vec![slow, fast],
                MethodCall::new("iter_accounts", Vec::<String>::new()),
                DispatchOptions::new(),
            )
            .collect()
            .await
            .into_result()
            .unwrap();

        for name in ["slow", "fast"] {
            let expected: Vec<String> = (0..5).map(|i| format!("{name}-{i}")).collect();
            assert_eq!(account_ids(&replies, name), expected);
        }
    }

    #[tokio::test]
    async fn condition_and_limit_filter_items() {
        let alpha = testing::bank("alpha", &[("login", "alpha"), ("accounts", "5")]).await;

        let items = DispatchEngine::default()
            .run(
                vec![Arc::clone(&alpha)],
                MethodCall::new("iter_accounts", Vec::<String>::new()),
                DispatchOptions::new().condition(|item: &Value| item["id"] != "alpha-0"),
            )
            .collect()
            .await
            .items();
        assert_eq!(items.len(), 4);

        let replies = DispatchEngine::default()
            .run(
                vec![alpha],
                MethodCall::new("iter_accounts", Vec::<String>::new()),
                DispatchOptions::new()
                    .condition(|item: &Value| item["id"] != "alpha-0")
                    .limit(2),
            )
            .collect()
            .await
            .into_result()
            .unwrap();
        assert_eq!(account_ids(&replies, "alpha"), vec!["alpha-1", "alpha-2"]);
    }

    #[tokio::test]
    async fn duplicate_targets_run_once() {
        let alpha = testing::bank("alpha", &[("login", "alpha")]).await;

        let items = DispatchEngine::default()
            .run(
                vec![Arc::clone(&alpha), alpha],
                MethodCall::new("iter_accounts", Vec::<String>::new()),
                DispatchOptions::new(),
            )
            .collect()
            .await
            .items();
        assert_eq!(items.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispatches_serialize_on_a_backend() {
        let alpha = testing::bank("alpha", &[("login", "alpha")]).await;
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let op = |active: Arc<AtomicUsize>, max_seen: Arc<AtomicUsize>| {
            operation(move |_backend| {
                let (active, max_seen) = (Arc::clone(&active), Arc::clone(&max_seen));
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    anyhow::Ok(Outcome::Value(now))
                }
                .boxed()
            })
        };

        let engine = DispatchEngine::default();
        let first = engine.run(
            vec![Arc::clone(&alpha)],
            op(Arc::clone(&active), Arc::clone(&max_seen)),
            DispatchOptions::new(),
        );
        let second = engine.run(
            vec![alpha],
            op(Arc::clone(&active), Arc::clone(&max_seen)),
            DispatchOptions::new(),
        );

        let (a, b) = tokio::join!(first.collect(), second.collect());
        assert_eq!(a.items(), vec![1]);
        assert_eq!(b.items(), vec![1]);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_operation_becomes_call_error() {
        let alpha = testing::bank("alpha", &[("login", "alpha")]).await;
        let beta = testing::bank("beta", &[("login", "beta")]).await;

        let op = operation(|backend| {
            async move {
                let bank = backend.as_bank().context("not a bank")?;
                let first = bank.iter_accounts().next().await.context("no account")??;
                assert!(!first.id.starts_with("beta"), "beta exploded");
                anyhow::Ok(Outcome::Value(first.id))
            }
            .boxed()
        })
        .requires(Capability::Bank);

        let collected = DispatchEngine::default()
            .run(vec![Arc::clone(&alpha), beta], op, DispatchOptions::new())
            .collect()
            .await;

        assert_eq!(collected.replies.len(), 1);
        assert_eq!(collected.errors.len(), 1);
        assert_eq!(collected.errors[0].backend, "beta");
        assert!(collected.errors[0].to_string().contains("beta exploded"));

        // the panicking worker released its lock
        tokio::time::timeout(Duration::from_secs(1), alpha.lock())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn aggregate_error_comes_last() {
        let alpha = testing::bank("alpha", &[("login", "alpha")]).await;
        let beta = testing::bank("beta", &[("login", "beta"), ("fail_after", "1")]).await;

        let mut handle = DispatchEngine::default().run(
            vec![alpha, beta],
            MethodCall::new("iter_accounts", Vec::<String>::new()),
            DispatchOptions::new(),
        );
        assert_eq!(handle.state(), DispatchState::Running);

        let mut items = 0;
        let mut aggregate = None;
        while let Some(result) = handle.next().await {
            assert!(aggregate.is_none(), "nothing may follow the aggregate error");
            match result {
                Ok(_) => items += 1,
                Err(errors) => aggregate = Some(errors),
            }
        }

        // alpha's three accounts and beta's first one
        assert_eq!(items, 4);
        let errors = aggregate.expect("aggregate error");
        assert_eq!(errors.backends().collect::<Vec<_>>(), vec!["beta"]);
        assert_eq!(handle.state(), DispatchState::Drained);
        assert!(handle.next().await.is_none());
    }

    #[tokio::test]
    async fn cancel_stops_workers_and_releases_locks() {
        let alpha = testing::bank(
            "alpha",
            &[("login", "alpha"), ("accounts", "1000"), ("delay_ms", "2")],
        )
        .await;

        let mut handle = DispatchEngine::new(1).run(
            vec![Arc::clone(&alpha)],
            MethodCall::new("iter_accounts", Vec::<String>::new()),
            DispatchOptions::new(),
        );
        assert!(handle.next().await.unwrap().is_ok());

        handle.cancel();
        assert_eq!(handle.state(), DispatchState::Cancelled);

        let mut rest = 0;
        while let Some(result) = handle.next().await {
            assert!(result.is_ok(), "cancelled dispatch must not raise");
            rest += 1;
        }
        assert!(rest < 10);

        tokio::time::timeout(Duration::from_secs(1), alpha.lock())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn callbacks_receive_items_errors_and_sentinel() {
        let alpha = testing::bank("alpha", &[("login", "alpha")]).await;
        let beta = testing::bank("beta", &[("login", "beta"), ("fail_after", "0")]).await;

        let items = Arc::new(std::sync::Mutex::new(Vec::new()));
        let errors = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (seen_items, seen_errors) = (Arc::clone(&items), Arc::clone(&errors));

        let task = DispatchEngine::default()
            .run(
                vec![alpha, beta],
                MethodCall::new("iter_accounts", Vec::<String>::new()),
                DispatchOptions::new(),
            )
            .callback(
                move |reply| {
                    seen_items
                        .lock()
                        .unwrap()
                        .push(reply.map(|reply| reply.backend_name().to_string()));
                },
                move |error| seen_errors.lock().unwrap().push(error.backend.clone()),
            );
        task.await.unwrap();

        let items = items.lock().unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items.last(), Some(&None));
        assert!(items[..3].iter().all(|item| item.as_deref() == Some("alpha")));
        assert_eq!(*errors.lock().unwrap(), vec!["beta".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_iterator_drains_outside_runtime() {
        let alpha = testing::bank("alpha", &[("login", "alpha")]).await;
        let handle = DispatchEngine::default().run(
            vec![alpha],
            MethodCall::new("iter_accounts", Vec::<String>::new()),
            DispatchOptions::new(),
        );

        let count = tokio::task::spawn_blocking(move || {
            handle.blocking_iter().filter(Result::is_ok).count()
        })
        .await
        .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_iterator_ends_with_aggregate_error() {
        let alpha = testing::bank("alpha", &[("login", "alpha")]).await;
        let beta = testing::bank("beta", &[("login", "beta"), ("fail_after", "1")]).await;
        let handle = DispatchEngine::default().run(
            vec![alpha, beta],
            MethodCall::new("iter_accounts", Vec::<String>::new()),
            DispatchOptions::new(),
        );

        let mut results =
            tokio::task::spawn_blocking(move || handle.blocking_iter().collect::<Vec<_>>())
                .await
                .unwrap();

        let errors = results.pop().unwrap().unwrap_err();
        assert_eq!(errors.backends().collect::<Vec<_>>(), vec!["beta"]);
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn stream_adapter_yields_items_then_aggregate_error() {
        let alpha = testing::bank("alpha", &[("login", "alpha")]).await;
        let beta = testing::bank("beta", &[("login", "beta"), ("fail_after", "0")]).await;

        let results: Vec<_> = DispatchEngine::default()
            .run(
                vec![alpha, beta],
                MethodCall::new("iter_accounts", Vec::<String>::new()),
                DispatchOptions::<Value>::new(),
            )
            .into_stream()
            .collect()
            .await;

        assert_eq!(results.len(), 4);
        assert!(
            results[..3]
                .iter()
                .all(|r| r.as_ref().is_ok_and(|reply| reply.backend_name() == "alpha"))
        );
        let errors = results[3].as_ref().unwrap_err();
        assert_eq!(errors.backends().collect::<Vec<_>>(), vec!["beta"]);
    }

    #[tokio::test]
    async fn cancelled_callbacks_end_with_marker_and_drop_late_failures() {
        let alpha = testing::bank("alpha", &[("login", "alpha")]).await;
        let beta = testing::bank("beta", &[("login", "beta")]).await;

        let op = operation(|backend| {
            async move {
                let bank = backend.as_bank().context("not a bank")?;
                let first = bank.iter_accounts().next().await.context("no account")??;
                if first.id.starts_with("beta") {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    anyhow::bail!("late failure");
                }
                anyhow::Ok(Outcome::Value(first.id))
            }
            .boxed()
        })
        .requires(Capability::Bank);

        let handle = DispatchEngine::default().run(vec![alpha, beta], op, DispatchOptions::new());
        let token = handle.cancellation();

        let items = Arc::new(std::sync::Mutex::new(Vec::new()));
        let errors = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (seen_items, seen_errors) = (Arc::clone(&items), Arc::clone(&errors));
        let task = handle.callback(
            move |reply: Option<Reply<String>>| {
                if reply.is_some() {
                    token.cancel();
                }
                seen_items.lock().unwrap().push(reply.map(|reply| reply.item));
            },
            move |error| seen_errors.lock().unwrap().push(error.backend.clone()),
        );
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*items.lock().unwrap(), vec![Some("alpha-0".to_string()), None]);
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn condition_applies_to_single_values() {
        let alpha = testing::bank("alpha", &[("login", "alpha")]).await;
        let engine = DispatchEngine::default();

        let rejected = engine
            .run(
                vec![Arc::clone(&alpha)],
                MethodCall::new("get_account", ["alpha-1"]),
                DispatchOptions::new().condition(|item: &Value| item["label"] != "Account 1"),
            )
            .collect()
            .await;
        assert!(rejected.replies.is_empty());
        assert!(rejected.errors.is_empty());

        let accepted = engine
            .run(
                vec![alpha],
                MethodCall::new("get_account", ["alpha-1"]),
                DispatchOptions::new().condition(|item: &Value| item["label"] == "Account 1"),
            )
            .collect()
            .await
            .items();
        assert_eq!(accepted.len(), 1);
    }

    #[tokio::test]
    async fn unknown_and_unsupported_methods_fail_per_backend() {
        let alpha = testing::bank("alpha", &[("login", "alpha")]).await;
        let inbox = testing::messages("inbox").await;

        let collected = DispatchEngine::default()
            .run(
                vec![Arc::clone(&alpha), Arc::clone(&inbox)],
                MethodCall::new("iter_weather", Vec::<String>::new()),
                DispatchOptions::new(),
            )
            .collect()
            .await;
        assert!(collected.replies.is_empty());
        assert_eq!(collected.errors.len(), 2);
        assert!(collected.errors.iter().all(|e| matches!(
            e.error.downcast_ref::<Error>(),
            Some(Error::UnknownMethod(name)) if name == "iter_weather"
        )));

        let collected = DispatchEngine::default()
            .run(
                vec![alpha, inbox],
                MethodCall::new("iter_threads", Vec::<String>::new()),
                DispatchOptions::new(),
            )
            .collect()
            .await;
        assert_eq!(collected.replies.len(), 1);
        assert_eq!(collected.replies[0].backend_name(), "inbox");
        assert!(matches!(
            collected.errors[0].error.downcast_ref::<Error>(),
            Some(Error::Unsupported { backend, capability: Capability::Messages }) if backend == "alpha"
        ));
    }

    #[tokio::test]
    async fn single_values_and_empty_results() {
        let alpha = testing::bank("alpha", &[("login", "alpha")]).await;
        let inbox = testing::messages("inbox").await;
        let engine = DispatchEngine::default();

        let found = engine
            .run(
                vec![Arc::clone(&alpha)],
                MethodCall::new("get_account", ["alpha-1"]),
                DispatchOptions::new(),
            )
            .collect()
            .await
            .items();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["label"], "Account 1");

        let missing = engine
            .run(
                vec![Arc::clone(&alpha)],
                MethodCall::new("get_account", ["nope"]),
                DispatchOptions::new(),
            )
            .collect()
            .await;
        assert!(missing.replies.is_empty());
        assert!(missing.errors.is_empty());

        let history = engine
            .run(
                vec![alpha],
                MethodCall::new("iter_history", ["alpha-0"]),
                DispatchOptions::new(),
            )
            .collect()
            .await
            .items();
        assert_eq!(history.len(), 2);

        let posted = engine
            .run(
                vec![Arc::clone(&inbox)],
                MethodCall::new("post_message", ["t1", "hi"]),
                DispatchOptions::new(),
            )
            .collect()
            .await;
        assert!(posted.replies.is_empty() && posted.errors.is_empty());

        let thread = engine
            .run(
                vec![inbox],
                MethodCall::new("get_thread", ["t1"]),
                DispatchOptions::new(),
            )
            .collect()
            .await
            .items();
        assert_eq!(thread[0]["messages"].as_array().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn missing_argument_is_reported() {
        let alpha = testing::bank("alpha", &[("login", "alpha")]).await;
        let collected = DispatchEngine::default()
            .run(
                vec![alpha],
                MethodCall::new("get_account", Vec::<String>::new()),
                DispatchOptions::new(),
            )
            .collect()
            .await;
        assert!(collected.errors[0].to_string().contains("expects argument #1"));
    }
}
