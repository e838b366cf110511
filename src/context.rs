//! Coordination state shared by every actor of a pipeline run.
//!
//! Actors never share memory directly: they communicate through the four
//! [`HandoffQueue`]s and observe the [`Flag`]s cooperatively. A
//! [`SharedContext`] is built once per session and handed to each actor
//! behind an `Arc`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::PipelineError;
use crate::payload::TracerResult;
use crate::types::TileProgress;

/// A boolean readable and settable from any actor.
#[derive(Debug, Default)]
pub struct Flag(AtomicBool);

impl Flag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Cancellation handle for one long-lived operation.
///
/// `cancel()` marks the token, wakes every `cancelled()` waiter and aborts
/// the task bound with [`CancelToken::bind`], so a call blocked inside that
/// task returns immediately instead of waiting out its own timeout.
#[derive(Debug)]
pub struct CancelToken {
    cancelled: AtomicBool,
    token: CancellationToken,
    bound: Mutex<Option<AbortHandle>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::with_token(CancellationToken::new())
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is also cancelled when `parent` is.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self::with_token(parent.child_token())
    }

    fn with_token(token: CancellationToken) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            token,
            bound: Mutex::new(None),
        }
    }

    /// Bind the task running the guarded operation. A token that is
    /// already cancelled aborts it right away.
    pub fn bind(&self, handle: AbortHandle) {
        if self.is_cancelled() {
            handle.abort();
            return;
        }
        *lock(&self.bound) = Some(handle);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.token.cancel();
        if let Some(handle) = lock(&self.bound).take() {
            handle.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.token.is_cancelled()
    }

    /// Resolves once the token (or its parent) is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    unfinished: usize,
}

/// Multi-producer multi-consumer FIFO with acknowledgement.
///
/// Every `put` adds one unfinished item; consumers call
/// [`task_done`](HandoffQueue::task_done) once they have handled what they
/// got, and [`join`](HandoffQueue::join) waits until nothing is unfinished.
pub struct HandoffQueue<T> {
    state: Mutex<QueueState<T>>,
    item_ready: Notify,
    drained: Notify,
}

impl<T> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                unfinished: 0,
            }),
            item_ready: Notify::new(),
            drained: Notify::new(),
        }
    }
}

impl<T> HandoffQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, item: T) {
        {
            let mut state = lock(&self.state);
            state.items.push_back(item);
            state.unfinished += 1;
        }
        self.item_ready.notify_one();
    }

    /// Return an item taken with `get_timeout` to the tail of the queue.
    /// It stays unfinished, so no `task_done` is due for it.
    pub fn requeue(&self, item: T) {
        lock(&self.state).items.push_back(item);
        self.item_ready.notify_one();
    }

    pub fn try_get(&self) -> Option<T> {
        lock(&self.state).items.pop_front()
    }

    /// Wait up to `timeout` for an item.
    ///
    /// Cancel-safe: an item is only removed in the poll that returns it.
    pub async fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_get() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, self.item_ready.notified())
                .await
                .is_err()
            {
                return self.try_get();
            }
        }
    }

    /// Acknowledge one item previously obtained from the queue.
    pub fn task_done(&self) {
        let finished = {
            let mut state = lock(&self.state);
            state.unfinished = state.unfinished.saturating_sub(1);
            state.unfinished == 0
        };
        if finished {
            self.drained.notify_waiters();
        }
    }

    /// Wait until every item put so far has been acknowledged.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.unfinished() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items put but not yet acknowledged, including those being handled.
    pub fn unfinished(&self) -> usize {
        lock(&self.state).unfinished
    }
}

/// Everything the actors of one session share.
pub struct SharedContext {
    pub session_id: String,

    /// Result ids the watcher should track.
    pub to_watch: HandoffQueue<String>,
    /// Result ids observed COMPLETED, waiting for download.
    pub to_retrieve: HandoffQueue<String>,
    /// Decoded passes waiting for the compositor.
    pub to_display: HandoffQueue<TracerResult>,
    /// One marker per retrieved pass, consumed by the progress reporter.
    pub finalized: HandoffQueue<TileProgress>,

    pub stop_watching: Flag,
    pub stop_retrieving: Flag,
    pub stop_display: Flag,
    pub reset_display: Flag,

    cancel: CancellationToken,
    failure: Mutex<Option<PipelineError>>,
}

impl SharedContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            to_watch: HandoffQueue::new(),
            to_retrieve: HandoffQueue::new(),
            to_display: HandoffQueue::new(),
            finalized: HandoffQueue::new(),
            stop_watching: Flag::new(),
            stop_retrieving: Flag::new(),
            stop_display: Flag::new(),
            reset_display: Flag::new(),
            cancel: CancellationToken::new(),
            failure: Mutex::new(None),
        }
    }

    /// Master token, cancelled when the run is aborted.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// A child token for one subscription or worker.
    pub fn child_token(&self) -> CancelToken {
        CancelToken::child_of(&self.cancel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the whole run because of `reason`.
    ///
    /// The first reason wins; later calls only re-raise the stop flags.
    /// Returns whether this call recorded the reason.
    pub fn abort(&self, reason: PipelineError) -> bool {
        let first = {
            let mut failure = lock(&self.failure);
            if failure.is_none() {
                tracing::warn!(session_id = %self.session_id, reason = %reason, "Aborting pipeline");
                *failure = Some(reason);
                true
            } else {
                false
            }
        };
        self.stop_all();
        self.cancel.cancel();
        first
    }

    pub fn is_aborted(&self) -> bool {
        lock(&self.failure).is_some()
    }

    /// Take the recorded abort reason, if any.
    pub fn take_failure(&self) -> Option<PipelineError> {
        lock(&self.failure).take()
    }

    pub fn stop_all(&self) {
        self.stop_watching.set();
        self.stop_retrieving.set();
        self.stop_display.set();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
