//! Result retrieval.
//!
//! Workers take result ids the watcher saw COMPLETED, download and decode
//! them, and fan the decoded pass out to the compositor, the progress
//! reporter and, for non-final passes, back to the watcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::client::GridClient;
use crate::context::SharedContext;
use crate::error::{GridError, PipelineError};
use crate::payload::TracerResult;
use crate::progress::ProgressTracker;
use crate::types::TileProgress;

/// Downloads completed results and dispatches what they contain.
///
/// A pool of workers shares the `to_retrieve` queue. Within one tile the
/// chain is naturally ordered: a successor id only exists once its
/// predecessor has been decoded here.
pub struct Retriever<G: GridClient> {
    client: Arc<G>,
    ctx: Arc<SharedContext>,
    tracker: Arc<ProgressTracker>,
    overlay: bool,
    queue_timeout: Duration,
}

impl<G: GridClient> Retriever<G> {
    pub fn new(
        client: Arc<G>,
        ctx: Arc<SharedContext>,
        tracker: Arc<ProgressTracker>,
        overlay: bool,
        queue_timeout: Duration,
    ) -> Self {
        Self {
            client,
            ctx,
            tracker,
            overlay,
            queue_timeout,
        }
    }

    /// Download and decode `result_id`, then queue its successor for
    /// watching, the pass for display and a completion marker.
    pub async fn retrieve(&self, result_id: &str) -> Result<TracerResult, GridError> {
        let bytes = self
            .client
            .download_result(&self.ctx.session_id, result_id)
            .await?;
        let result = TracerResult::decode(&bytes, self.overlay)?;

        tracing::debug!(
            result_id = %result_id,
            tile_x = result.coord_x,
            tile_y = result.coord_y,
            samples = result.samples,
            is_final = result.is_final,
            "Result retrieved"
        );

        if !result.is_final {
            self.tracker.extend_chain();
            self.ctx.to_watch.put(result.next_result_id.clone());
        }
        self.ctx.to_display.put(result.clone());
        self.ctx.finalized.put(TileProgress {
            coord_x: result.coord_x,
            coord_y: result.coord_y,
            is_final: result.is_final,
        });
        Ok(result)
    }

    /// Run `workers` retrieval loops until `stop_retrieving` is set or
    /// the run is cancelled.
    pub async fn run(self, workers: usize) {
        let this = Arc::new(self);
        let mut pool = JoinSet::new();
        for worker in 0..workers.max(1) {
            let this = this.clone();
            pool.spawn(async move { this.worker_loop(worker).await });
        }
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    // Its result id is never acknowledged, so the run cannot finish
                    tracing::error!(error = %e, "Retrieve worker panicked");
                    this.ctx
                        .abort(PipelineError::Other(format!("retrieve worker panicked: {}", e)));
                }
            }
        }
    }

    async fn worker_loop(&self, worker: usize) {
        let ctx = &self.ctx;
        while !ctx.stop_retrieving.is_set() {
            let next = tokio::select! {
                _ = ctx.cancellation().cancelled() => break,
                id = ctx.to_retrieve.get_timeout(self.queue_timeout) => id,
            };
            let Some(result_id) = next else {
                continue;
            };

            let outcome = tokio::select! {
                _ = ctx.cancellation().cancelled() => break,
                r = self.retrieve(&result_id) => r,
            };

            match outcome {
                Ok(_) => ctx.to_retrieve.task_done(),
                Err(GridError::Decode(message)) => {
                    ctx.to_retrieve.task_done();
                    ctx.abort(PipelineError::CorruptResult { result_id, message });
                    break;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::debug!(worker, result_id = %result_id, error = %e, "Download failed, requeueing");
                    } else {
                        tracing::warn!(worker, result_id = %result_id, error = %e, "Download failed, requeueing");
                    }
                    ctx.to_retrieve.requeue(result_id);
                    tokio::select! {
                        _ = ctx.cancellation().cancelled() => break,
                        _ = tokio::time::sleep(self.queue_timeout) => {}
                    }
                }
            }
        }
        tracing::debug!(worker, "Retrieve worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::client::EventStream;
    use crate::error::Result;
    use crate::types::*;

    enum Download {
        Fail(u16),
        Bytes(Vec<u8>),
        Panic,
    }

    /// Grid whose downloads follow a per-result script.
    #[derive(Default)]
    struct ScriptedGrid {
        script: Mutex<HashMap<String, VecDeque<Download>>>,
        downloads: AtomicUsize,
    }

    impl ScriptedGrid {
        fn with(self, result_id: &str, steps: Vec<Download>) -> Self {
            self.script
                .lock()
                .unwrap()
                .insert(result_id.to_string(), steps.into());
            self
        }
    }

    impl GridClient for ScriptedGrid {
        async fn create_session(&self, _options: &TaskOptions) -> Result<String> {
            Ok("s".into())
        }

        async fn submit(
            &self,
            _session_id: &str,
            _tasks: Vec<TaskRequest>,
            _options: &TaskOptions,
        ) -> Result<SubmitOutcome> {
            Ok(SubmitOutcome::default())
        }

        async fn get_task_status(&self, _task_ids: &[String]) -> Result<HashMap<String, TaskStatus>> {
            Ok(HashMap::new())
        }

        async fn subscribe_result_events(&self, _session_id: &str) -> Result<EventStream> {
            Err(GridError::WebSocket("not scripted".into()))
        }

        async fn list_results(
            &self,
            _session_id: &str,
            _offset: usize,
            _page_size: usize,
        ) -> Result<ResultPage> {
            Ok(ResultPage::default())
        }

        async fn download_result(&self, _session_id: &str, result_id: &str) -> Result<Vec<u8>> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            let step = self
                .script
                .lock()
                .unwrap()
                .get_mut(result_id)
                .and_then(|steps| steps.pop_front());
            match step {
                Some(Download::Bytes(bytes)) => Ok(bytes),
                Some(Download::Fail(status)) => Err(GridError::Http {
                    status,
                    body: String::new(),
                }),
                Some(Download::Panic) => panic!("download of {} blew up", result_id),
                None => Err(GridError::Http {
                    status: 404,
                    body: String::new(),
                }),
            }
        }

        async fn cancel_session(&self, _session_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn final_pass() -> Vec<u8> {
        TracerResult {
            coord_x: 0,
            coord_y: 0,
            tile_width: 2,
            tile_height: 2,
            samples: 100,
            is_final: true,
            pixels: vec![90; 12],
            weights: Vec::new(),
            next_result_id: String::new(),
        }
        .to_bytes()
    }

    fn retriever(grid: ScriptedGrid) -> (Arc<ScriptedGrid>, Arc<SharedContext>, Retriever<ScriptedGrid>) {
        let grid = Arc::new(grid);
        let ctx = Arc::new(SharedContext::new("s"));
        let retriever = Retriever::new(
            grid.clone(),
            ctx.clone(),
            Arc::new(ProgressTracker::new()),
            false,
            Duration::from_millis(10),
        );
        (grid, ctx, retriever)
    }

    #[tokio::test]
    async fn test_failed_download_is_requeued_until_it_succeeds() {
        let (grid, ctx, retriever) = retriever(
            ScriptedGrid::default().with("r1", vec![Download::Fail(503), Download::Bytes(final_pass())]),
        );
        ctx.to_retrieve.put("r1".to_string());
        let workers = tokio::spawn(retriever.run(1));

        tokio::time::timeout(Duration::from_secs(2), ctx.to_retrieve.join())
            .await
            .unwrap();
        ctx.stop_retrieving.set();
        workers.await.unwrap();

        assert_eq!(grid.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.to_display.len(), 1);
        assert_eq!(ctx.finalized.try_get().map(|m| m.is_final), Some(true));
        assert!(!ctx.is_aborted());
    }

    #[tokio::test]
    async fn test_undecodable_result_aborts_run() {
        let (_grid, ctx, retriever) =
            retriever(ScriptedGrid::default().with("r1", vec![Download::Bytes(vec![1, 2, 3])]));
        ctx.to_retrieve.put("r1".to_string());

        tokio::time::timeout(Duration::from_secs(2), retriever.run(1))
            .await
            .unwrap();

        assert!(ctx.is_cancelled());
        match ctx.take_failure() {
            Some(PipelineError::CorruptResult { result_id, .. }) => assert_eq!(result_id, "r1"),
            other => panic!("expected corrupt result, got {:?}", other),
        }
        assert_eq!(ctx.to_retrieve.unfinished(), 0);
        assert!(ctx.to_display.is_empty());
    }

    #[tokio::test]
    async fn test_panicked_worker_aborts_run() {
        let (_grid, ctx, retriever) =
            retriever(ScriptedGrid::default().with("r1", vec![Download::Panic]));
        ctx.to_retrieve.put("r1".to_string());

        tokio::time::timeout(Duration::from_secs(2), retriever.run(2))
            .await
            .unwrap();

        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.take_failure(), Some(PipelineError::Other(_))));
    }
}
