use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::context::SharedContext;

/// Point-in-time view of a run's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Task payloads built.
    pub prepared: usize,
    /// Tasks accepted by the grid.
    pub submitted: usize,
    pub failed_submissions: usize,
    /// In-flight tasks not yet running.
    pub pending: usize,
    pub processing: usize,
    pub completed_tasks: usize,
    /// Results observed completed and handed to retrieval.
    pub available: usize,
    /// Results downloaded and decoded.
    pub retrieved: usize,
    pub finalized_tiles: usize,
    pub tile_count: usize,
    /// Accepted tiles plus every successor discovered so far.
    pub expected: usize,
    /// Passes composited into the frame buffer.
    pub displayed: usize,
}

/// Aggregates completion markers against the dynamically growing
/// expected count.
///
/// Counters only move forward within a run; [`ProgressTracker::reset`]
/// starts a new run.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    prepared: AtomicUsize,
    submitted: AtomicUsize,
    failed_submissions: AtomicUsize,
    pending: AtomicUsize,
    processing: AtomicUsize,
    completed_tasks: AtomicUsize,
    available: AtomicUsize,
    retrieved: AtomicUsize,
    finalized_tiles: AtomicUsize,
    tile_count: AtomicUsize,
    expected: AtomicUsize,
    displayed: AtomicUsize,
    submission_complete: AtomicBool,
    changed: Notify,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_prepared(&self, n: usize) {
        self.prepared.fetch_add(n, Ordering::SeqCst);
    }

    /// Tiles accepted by the grid. Each one is expected to finalize.
    pub fn record_accepted(&self, n: usize) {
        self.expected.fetch_add(n, Ordering::SeqCst);
        self.tile_count.fetch_add(n, Ordering::SeqCst);
        self.submitted.fetch_add(n, Ordering::SeqCst);
    }

    pub fn record_failed_submissions(&self, n: usize) {
        self.failed_submissions.fetch_add(n, Ordering::SeqCst);
    }

    /// Latest in-flight breakdown from a task status refresh.
    pub fn set_task_counts(&self, pending: usize, processing: usize) {
        self.pending.store(pending, Ordering::SeqCst);
        self.processing.store(processing, Ordering::SeqCst);
    }

    pub fn record_tasks_completed(&self, n: usize) {
        self.completed_tasks.fetch_add(n, Ordering::SeqCst);
    }

    pub fn record_available(&self) {
        self.available.fetch_add(1, Ordering::SeqCst);
    }

    /// A retrieved pass revealed a successor. Must be called before the
    /// pass itself is counted as retrieved.
    pub fn extend_chain(&self) {
        self.expected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_retrieved(&self, is_final: bool) {
        self.retrieved.fetch_add(1, Ordering::SeqCst);
        if is_final {
            self.finalized_tiles.fetch_add(1, Ordering::SeqCst);
        }
        self.changed.notify_waiters();
    }

    pub fn record_displayed(&self, n: usize) {
        self.displayed.fetch_add(n, Ordering::SeqCst);
    }

    /// No more tiles will be accepted in this run.
    pub fn mark_submission_complete(&self) {
        self.submission_complete.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn submission_complete(&self) -> bool {
        self.submission_complete.load(Ordering::SeqCst)
    }

    /// Every accepted tile has produced its final pass and nothing
    /// discovered along the chains is still outstanding.
    pub fn is_done(&self) -> bool {
        self.submission_complete()
            && self.finalized_tiles.load(Ordering::SeqCst) >= self.tile_count.load(Ordering::SeqCst)
            && self.retrieved.load(Ordering::SeqCst) >= self.expected.load(Ordering::SeqCst)
    }

    /// Resolves once [`is_done`](Self::is_done) holds.
    pub async fn wait_done(&self) {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if self.is_done() {
                return;
            }
            changed.await;
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            prepared: self.prepared.load(Ordering::SeqCst),
            submitted: self.submitted.load(Ordering::SeqCst),
            failed_submissions: self.failed_submissions.load(Ordering::SeqCst),
            pending: self.pending.load(Ordering::SeqCst),
            processing: self.processing.load(Ordering::SeqCst),
            completed_tasks: self.completed_tasks.load(Ordering::SeqCst),
            available: self.available.load(Ordering::SeqCst),
            retrieved: self.retrieved.load(Ordering::SeqCst),
            finalized_tiles: self.finalized_tiles.load(Ordering::SeqCst),
            tile_count: self.tile_count.load(Ordering::SeqCst),
            expected: self.expected.load(Ordering::SeqCst),
            displayed: self.displayed.load(Ordering::SeqCst),
        }
    }

    /// Zero every counter for a re-run of the same job.
    pub fn reset(&self) {
        for counter in [
            &self.prepared,
            &self.submitted,
            &self.failed_submissions,
            &self.pending,
            &self.processing,
            &self.completed_tasks,
            &self.available,
            &self.retrieved,
            &self.finalized_tiles,
            &self.tile_count,
            &self.expected,
            &self.displayed,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
        self.submission_complete.store(false, Ordering::SeqCst);
    }
}

/// Consumes completion markers and logs progress at a fixed interval.
///
/// Returns once the run is done or the context is cancelled.
pub async fn run_reporter(
    ctx: Arc<SharedContext>,
    tracker: Arc<ProgressTracker>,
    interval: Duration,
    queue_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ctx.cancellation().cancelled() => break,
            _ = ticker.tick() => log_snapshot(&tracker.snapshot()),
            marker = ctx.finalized.get_timeout(queue_timeout) => {
                if let Some(marker) = marker {
                    tracker.record_retrieved(marker.is_final);
                    ctx.finalized.task_done();
                    if marker.is_final {
                        tracing::debug!(
                            tile_x = marker.coord_x,
                            tile_y = marker.coord_y,
                            "Tile finalized"
                        );
                    }
                }
            }
        }

        if tracker.is_done() {
            break;
        }
    }

    log_snapshot(&tracker.snapshot());
}

fn log_snapshot(s: &ProgressSnapshot) {
    tracing::info!(
        pending = s.pending,
        processing = s.processing,
        completed = s.completed_tasks,
        available = s.available,
        processed = s.retrieved,
        tiles = format!("{}/{}", s.finalized_tiles, s.tile_count),
        expected = s.expected,
        failed = s.failed_submissions,
        "Progress"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TileProgress;

    #[test]
    fn test_done_requires_submission_complete() {
        let tracker = ProgressTracker::new();
        tracker.record_accepted(1);
        tracker.record_retrieved(true);
        assert!(!tracker.is_done());

        tracker.mark_submission_complete();
        assert!(tracker.is_done());
    }

    #[test]
    fn test_chain_extension_delays_done() {
        let tracker = ProgressTracker::new();
        tracker.record_accepted(2);
        tracker.mark_submission_complete();

        // Tile 0 needs a second pass
        tracker.extend_chain();
        tracker.record_retrieved(false);
        tracker.record_retrieved(true);
        assert!(!tracker.is_done());

        // Tile 0 final pass
        tracker.record_retrieved(true);
        assert!(tracker.is_done());

        let s = tracker.snapshot();
        assert_eq!(s.expected, 3);
        assert_eq!(s.retrieved, 3);
        assert_eq!(s.finalized_tiles, 2);
    }

    #[test]
    fn test_reset_clears_counters() {
        let tracker = ProgressTracker::new();
        tracker.record_accepted(4);
        tracker.record_displayed(2);
        tracker.mark_submission_complete();
        tracker.reset();

        assert_eq!(tracker.snapshot(), ProgressSnapshot::default());
        assert!(!tracker.submission_complete());
    }

    #[tokio::test]
    async fn test_reporter_exits_when_done() {
        let ctx = Arc::new(SharedContext::new("s"));
        let tracker = Arc::new(ProgressTracker::new());
        tracker.record_accepted(1);
        tracker.mark_submission_complete();

        ctx.finalized.put(TileProgress {
            coord_x: 0,
            coord_y: 0,
            is_final: true,
        });

        tokio::time::timeout(
            Duration::from_secs(2),
            run_reporter(
                ctx.clone(),
                tracker.clone(),
                Duration::from_millis(50),
                Duration::from_millis(10),
            ),
        )
        .await
        .unwrap();

        assert_eq!(ctx.finalized.unfinished(), 0);
        assert!(tracker.is_done());
    }
}
