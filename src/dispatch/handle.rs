//! Consumer side of a dispatch
//!
//! Every worker pushes into one bounded channel. [`DispatchHandle`] drains
//! it in one of three ways: async pulls ([`DispatchHandle::next`] and
//! [`DispatchHandle::into_stream`]), a blocking [`Iterator`]
//! ([`DispatchHandle::blocking_iter`]), or callbacks run on a spawned task
//! ([`DispatchHandle::callback`]).

use std::fmt;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::BackendInstance;
use crate::error::{CallError, CallErrors};

/// Message from a worker to the consumer
pub(crate) enum Event<T> {
    Item(Arc<BackendInstance>, T),
    Error(CallError),
}

/// One item produced by one backend
#[derive(Debug)]
pub struct Reply<T> {
    /// Backend that produced the item
    pub backend: Arc<BackendInstance>,
    /// The item
    pub item: T,
}

impl<T> Reply<T> {
    /// Name of the producing backend
    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Split into backend and item
    pub fn into_parts(self) -> (Arc<BackendInstance>, T) {
        (self.backend, self.item)
    }
}

/// Lifecycle of a dispatch as seen by its consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Workers may still produce items
    Running,
    /// Every worker finished and the channel is consumed
    Drained,
    /// [`DispatchHandle::cancel`] was called
    Cancelled,
}

/// Everything a dispatch produced
#[derive(Debug)]
pub struct Collected<T> {
    /// Items in arrival order
    pub replies: Vec<Reply<T>>,
    /// Backend failures in arrival order
    pub errors: Vec<CallError>,
}

impl<T> Collected<T> {
    /// Items, or the aggregate error if any backend failed
    ///
    /// # Errors
    ///
    /// Returns every recorded [`CallError`] when there is at least one
    pub fn into_result(self) -> Result<Vec<Reply<T>>, CallErrors> {
        if self.errors.is_empty() {
            Ok(self.replies)
        } else {
            Err(CallErrors::new(self.errors))
        }
    }

    /// Items without their backends
    pub fn items(self) -> Vec<T> {
        self.replies.into_iter().map(|reply| reply.item).collect()
    }
}

/// Handle to a running dispatch
///
/// Items of one backend arrive in the order that backend produced them;
/// items of different backends interleave freely. When at least one backend
/// failed, the pull interfaces yield one aggregate [`CallErrors`] after the
/// last item.
///
/// Dropping the handle cancels the dispatch.
pub struct DispatchHandle<T> {
    id: Uuid,
    rx: mpsc::Receiver<Event<T>>,
    token: CancellationToken,
    errors: Vec<CallError>,
    closed: bool,
    finished: bool,
}

impl<T> DispatchHandle<T> {
    pub(crate) fn new(
        id: Uuid,
        rx: mpsc::Receiver<Event<T>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            rx,
            token,
            errors: Vec::new(),
            closed: false,
            finished: false,
        }
    }

    /// Identifier used in log records for this dispatch
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> DispatchState {
        if self.token.is_cancelled() {
            DispatchState::Cancelled
        } else if self.finished {
            DispatchState::Drained
        } else {
            DispatchState::Running
        }
    }

    /// Stop the dispatch
    ///
    /// Workers stop forwarding items at their next item boundary and release
    /// their backend. Items already in the channel are still delivered, and
    /// failures recorded before the call are still reported.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!(dispatch_id = %self.id, "cancelling dispatch");
            self.token.cancel();
        }
    }

    /// Token that cancels this dispatch, usable after the handle is consumed
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Failures received so far
    #[must_use]
    pub fn errors(&self) -> &[CallError] {
        &self.errors
    }

    /// Next item, then the aggregate error if any backend failed
    ///
    /// Returns `None` once everything was delivered.
    pub async fn next(&mut self) -> Option<Result<Reply<T>, CallErrors>> {
        loop {
            match self.recv_event().await {
                Some(Event::Item(backend, item)) => return Some(Ok(Reply { backend, item })),
                Some(Event::Error(error)) => self.errors.push(error),
                None => return self.finish(),
            }
        }
    }

    /// Drain everything, keeping items and failures apart
    pub async fn collect(mut self) -> Collected<T> {
        let mut replies = Vec::new();
        while let Some(event) = self.recv_event().await {
            match event {
                Event::Item(backend, item) => replies.push(Reply { backend, item }),
                Event::Error(error) => self.errors.push(error),
            }
        }
        self.mark_drained();
        Collected {
            replies,
            errors: std::mem::take(&mut self.errors),
        }
    }

    /// Adapt into a [`Stream`] with the same items as [`next`](Self::next)
    pub fn into_stream(self) -> impl Stream<Item = Result<Reply<T>, CallErrors>> {
        futures::stream::unfold(self, |mut handle| async move {
            handle.next().await.map(|item| (item, handle))
        })
    }

    /// Blocking iterator for callers outside the async runtime
    ///
    /// # Panics
    ///
    /// Iterating panics when called from within an async execution context
    pub fn blocking_iter(self) -> BlockingIter<T> {
        BlockingIter { handle: self }
    }

    /// Deliver items and failures to callbacks as they arrive
    ///
    /// Runs on a spawned task. `on_item` receives `None` once the whole
    /// dispatch is done; failures go to `on_error` interleaved with items.
    pub fn callback<I, E>(mut self, mut on_item: I, mut on_error: E) -> JoinHandle<()>
    where
        T: Send + 'static,
        I: FnMut(Option<Reply<T>>) + Send + 'static,
        E: FnMut(&CallError) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(event) = self.recv_event().await {
                match event {
                    Event::Item(backend, item) => on_item(Some(Reply { backend, item })),
                    Event::Error(error) => {
                        on_error(&error);
                        self.errors.push(error);
                    }
                }
            }
            self.mark_drained();
            on_item(None);
        })
    }

    async fn recv_event(&mut self) -> Option<Event<T>> {
        if self.finished {
            return None;
        }
        loop {
            self.close_if_cancelled();
            if self.closed {
                return self.rx.recv().await;
            }
            tokio::select! {
                biased;
                event = self.rx.recv() => return event,
                () = self.token.cancelled() => {}
            }
        }
    }

    fn blocking_next(&mut self) -> Option<Result<Reply<T>, CallErrors>> {
        if self.finished {
            return None;
        }
        loop {
            self.close_if_cancelled();
            match self.rx.blocking_recv() {
                Some(Event::Item(backend, item)) => return Some(Ok(Reply { backend, item })),
                Some(Event::Error(error)) => self.errors.push(error),
                None => return self.finish(),
            }
        }
    }

    fn close_if_cancelled(&mut self) {
        if self.token.is_cancelled() && !self.closed {
            self.rx.close();
            self.closed = true;
        }
    }

    fn mark_drained(&mut self) {
        self.finished = true;
        tracing::debug!(
            dispatch_id = %self.id,
            errors = self.errors.len(),
            cancelled = self.token.is_cancelled(),
            "dispatch drained"
        );
    }

    fn finish(&mut self) -> Option<Result<Reply<T>, CallErrors>> {
        if self.finished {
            return None;
        }
        self.mark_drained();
        if self.errors.is_empty() {
            None
        } else {
            Some(Err(CallErrors::new(std::mem::take(&mut self.errors))))
        }
    }
}

impl<T> Drop for DispatchHandle<T> {
    fn drop(&mut self) {
        if !self.finished {
            self.token.cancel();
        }
    }
}

impl<T> fmt::Debug for DispatchHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("errors", &self.errors.len())
            .finish_non_exhaustive()
    }
}

/// Blocking adapter returned by [`DispatchHandle::blocking_iter`]
pub struct BlockingIter<T> {
    handle: DispatchHandle<T>,
}

impl<T> BlockingIter<T> {
    /// Cancel the underlying dispatch
    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl<T> Iterator for BlockingIter<T> {
    type Item = Result<Reply<T>, CallErrors>;

    fn next(&mut self) -> Option<Self::Item> {
        self.handle.blocking_next()
    }
}

impl<T> fmt::Debug for BlockingIter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlockingIter").field(&self.handle).finish()
    }
}
