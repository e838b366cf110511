//! Result status tracking.
//!
//! The watcher merges two inputs: result ids other actors want watched
//! (`to_watch`) and status updates from a background source (event
//! subscription or polling). Results reaching COMPLETED are forwarded to
//! `to_retrieve` exactly once; ABORTED stops the whole run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::GridClient;
use crate::config::{PipelineConfig, ReconnectConfig, WatchMode};
use crate::context::SharedContext;
use crate::error::PipelineError;
use crate::progress::ProgressTracker;
use crate::types::{ResultEvent, ResultStatus};

/// What the watcher must do after a status book update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Hand the result to the retriever.
    Forward(String),
    /// The result was aborted by the grid.
    Abort(String),
}

#[derive(Debug, Clone)]
struct Entry {
    status: ResultStatus,
    tracked: bool,
    forwarded: bool,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            status: ResultStatus::Unspecified,
            tracked: false,
            forwarded: false,
        }
    }
}

/// Last known status of every result seen, tracked or not.
///
/// Statuses are monotonic: once terminal, later updates are ignored.
#[derive(Debug, Default)]
pub struct StatusBook {
    entries: HashMap<String, Entry>,
}

impl StatusBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching `result_id`. A result already known to be
    /// COMPLETED is forwarded now.
    pub fn track(&mut self, result_id: &str) -> Option<Transition> {
        let entry = self.entries.entry(result_id.to_string()).or_default();
        if entry.tracked {
            return None;
        }
        entry.tracked = true;
        Self::forward_if_ready(result_id, entry)
    }

    /// Apply a status update.
    pub fn observe(&mut self, result_id: &str, status: ResultStatus) -> Option<Transition> {
        let entry = self.entries.entry(result_id.to_string()).or_default();
        if entry.status.is_terminal() || entry.status == status {
            return None;
        }
        entry.status = status;

        match status {
            ResultStatus::Aborted => Some(Transition::Abort(result_id.to_string())),
            ResultStatus::Completed => Self::forward_if_ready(result_id, entry),
            _ => None,
        }
    }

    fn forward_if_ready(result_id: &str, entry: &mut Entry) -> Option<Transition> {
        if entry.tracked && !entry.forwarded && entry.status == ResultStatus::Completed {
            entry.forwarded = true;
            return Some(Transition::Forward(result_id.to_string()));
        }
        None
    }

    pub fn status(&self, result_id: &str) -> Option<ResultStatus> {
        self.entries.get(result_id).map(|e| e.status)
    }

    /// Tracked results still waiting for a terminal status.
    pub fn outstanding(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.tracked && !e.status.is_terminal())
            .count()
    }
}

/// Runs the status book against the configured update source.
pub struct StatusWatcher<G: GridClient> {
    client: Arc<G>,
    ctx: Arc<SharedContext>,
    tracker: Arc<ProgressTracker>,
    config: PipelineConfig,
    book: StatusBook,
}

impl<G: GridClient> StatusWatcher<G> {
    pub fn new(
        client: Arc<G>,
        ctx: Arc<SharedContext>,
        tracker: Arc<ProgressTracker>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            client,
            ctx,
            tracker,
            config,
            book: StatusBook::new(),
        }
    }

    /// Watch until `stop_watching` is set or the run is cancelled.
    pub async fn run(mut self) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let source_token = self.ctx.child_token();

        let client = self.client.clone();
        let session_id = self.ctx.session_id.clone();
        let token = source_token.token();
        let source = match self.config.watch_mode {
            WatchMode::Events => {
                let reconnect = self.config.reconnect.clone();
                let page_size = self.config.poll_page_size;
                tokio::spawn(async move {
                    event_source(client, session_id, tx, token, reconnect, page_size).await
                })
            }
            WatchMode::Polling => {
                let interval = self.config.poll_interval;
                let page_size = self.config.poll_page_size;
                tokio::spawn(async move {
                    poll_source(client, session_id, tx, token, interval, page_size).await
                })
            }
        };
        source_token.bind(source.abort_handle());

        tracing::info!(
            session_id = %self.ctx.session_id,
            mode = ?self.config.watch_mode,
            "Status watcher started"
        );

        let mut source_alive = true;
        while !self.ctx.stop_watching.is_set() {
            tokio::select! {
                _ = self.ctx.cancellation().cancelled() => break,
                id = self.ctx.to_watch.get_timeout(self.config.queue_timeout) => {
                    if let Some(id) = id {
                        let transition = self.book.track(&id);
                        self.ctx.to_watch.task_done();
                        self.apply(transition);
                    }
                }
                event = rx.recv(), if source_alive => match event {
                    Some(event) => {
                        let transition = self.book.observe(&event.result_id, event.status);
                        self.apply(transition);
                    }
                    None => {
                        tracing::error!("Status source stopped unexpectedly");
                        source_alive = false;
                    }
                },
            }
        }

        source_token.cancel();
        let _ = tokio::time::timeout(self.config.shutdown_timeout, source).await;
        tracing::info!(outstanding = self.book.outstanding(), "Status watcher stopped");
    }

    fn apply(&self, transition: Option<Transition>) {
        match transition {
            Some(Transition::Forward(id)) => {
                tracing::debug!(result_id = %id, "Result completed");
                self.tracker.record_available();
                self.ctx.to_retrieve.put(id);
            }
            Some(Transition::Abort(id)) => {
                tracing::error!(result_id = %id, "Result aborted by the grid");
                self.ctx.abort(PipelineError::Aborted { result_id: id });
            }
            None => {}
        }
    }
}

/// Forward terminal events from the subscription, resubscribing with
/// backoff on stream failure.
///
/// Every (re)subscription is followed by a full listing so that results
/// which turned terminal while no stream was open are not missed.
pub async fn event_source<G: GridClient>(
    client: Arc<G>,
    session_id: String,
    tx: mpsc::UnboundedSender<ResultEvent>,
    cancel: CancellationToken,
    reconnect: ReconnectConfig,
    page_size: usize,
) {
    let mut delay = reconnect.initial_delay;

    loop {
        let subscribed = tokio::select! {
            _ = cancel.cancelled() => return,
            s = client.subscribe_result_events(&session_id) => s,
        };

        match subscribed {
            Ok(mut stream) => {
                delay = reconnect.initial_delay;
                tracing::debug!(session_id = %session_id, "Subscribed to result events");

                if let Err(e) = list_terminal(client.as_ref(), &session_id, page_size, &tx, None).await {
                    tracing::warn!(error = %e, "Catch-up listing failed");
                }

                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(event)) if event.status.is_terminal() => {
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Result event stream failed");
                            break;
                        }
                        None => {
                            tracing::warn!("Result event stream ended");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Result event subscription failed"
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = reconnect.next_delay(delay);
    }
}

/// Periodically list the session's results, publishing only changes
/// to a terminal status.
pub async fn poll_source<G: GridClient>(
    client: Arc<G>,
    session_id: String,
    tx: mpsc::UnboundedSender<ResultEvent>,
    cancel: CancellationToken,
    interval: Duration,
    page_size: usize,
) {
    let mut last_known: HashMap<String, ResultStatus> = HashMap::new();

    loop {
        let listed = tokio::select! {
            _ = cancel.cancelled() => return,
            r = list_terminal(client.as_ref(), &session_id, page_size, &tx, Some(&mut last_known)) => r,
        };
        match listed {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => tracing::warn!(error = %e, "Result listing failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Page through every result of the session and send terminal ones.
///
/// With `last_known`, results whose status did not change since the
/// previous listing are skipped. Returns `Ok(false)` once the receiver
/// is gone.
async fn list_terminal<G: GridClient>(
    client: &G,
    session_id: &str,
    page_size: usize,
    tx: &mpsc::UnboundedSender<ResultEvent>,
    mut last_known: Option<&mut HashMap<String, ResultStatus>>,
) -> crate::error::Result<bool> {
    let mut offset = 0;
    loop {
        let page = client.list_results(session_id, offset, page_size).await?;
        let fetched = page.results.len();

        for event in page.results {
            if let Some(known) = last_known.as_deref_mut() {
                if known.get(&event.result_id) == Some(&event.status) {
                    continue;
                }
                known.insert(event.result_id.clone(), event.status);
            }
            if event.status.is_terminal() && tx.send(event).is_err() {
                return Ok(false);
            }
        }

        offset += fetched;
        if fetched == 0 || offset >= page.total {
            return Ok(true);
        }
    }
}
