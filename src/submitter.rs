use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Serialize;

use crate::client::GridClient;
use crate::config::{PipelineConfig, TileOrder};
use crate::context::SharedContext;
use crate::error::PipelineError;
use crate::payload::TracerPayload;
use crate::progress::ProgressTracker;
use crate::types::*;

/// Partition the image into tiles, clipping the last row and column.
///
/// `index` is the raster position of a tile and stays stable whatever
/// `order` is chosen.
pub fn generate_tiles(job: &Job, order: TileOrder) -> Vec<Tile> {
    let tw = job.tile_width.max(1);
    let th = job.tile_height.max(1);

    let mut tiles = Vec::with_capacity(job.rows() as usize * job.columns() as usize);
    for coord_x in (0..job.height).step_by(th as usize) {
        for coord_y in (0..job.width).step_by(tw as usize) {
            tiles.push(Tile {
                index: tiles.len(),
                coord_x,
                coord_y,
                width: tw.min(job.width - coord_y),
                height: th.min(job.height - coord_x),
                samples: job.samples_per_pass,
            });
        }
    }

    match order {
        TileOrder::Raster => {}
        TileOrder::Shuffled => tiles.shuffle(&mut rand::rng()),
        TileOrder::CenterOut => {
            let cx = job.height as f64 / 2.0;
            let cy = job.width as f64 / 2.0;
            let distance = |t: &Tile| {
                let dx = t.coord_x as f64 + t.height as f64 / 2.0 - cx;
                let dy = t.coord_y as f64 + t.width as f64 / 2.0 - cy;
                dx * dx + dy * dy
            };
            tiles.sort_by(|a, b| distance(a).total_cmp(&distance(b)));
        }
    }
    tiles
}

/// What a submission pass produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubmissionReport {
    pub submitted: Vec<SubmittedTask>,
    pub failures: Vec<SubmissionFailure>,
    /// Highest number of tasks awaiting a terminal status at any time.
    pub peak_in_flight: usize,
}

/// Submits tile tasks under an in-flight cap and tracks their status.
pub struct TaskSubmitter<G: GridClient> {
    client: Arc<G>,
    ctx: Arc<SharedContext>,
    tracker: Arc<ProgressTracker>,
    config: PipelineConfig,
    /// Task id to tile index, for tasks not yet seen in a terminal state.
    in_flight: HashMap<String, usize>,
    peak_in_flight: usize,
}

impl<G: GridClient> TaskSubmitter<G> {
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
            in_flight: HashMap::new(),
            peak_in_flight: 0,
        }
    }

    /// Submit every tile once, stalling while `max_in_flight` tasks are
    /// outstanding.
    ///
    /// Each accepted task has its result id queued for watching before the
    /// next call is made. Rejected tiles are recorded and skipped; a failed
    /// submission call marks its whole chunk as failed rather than risk a
    /// duplicate task.
    pub async fn submit_batch(
        &mut self,
        job: &Job,
        tiles: &[Tile],
    ) -> Result<SubmissionReport, PipelineError> {
        let mut report = SubmissionReport::default();
        let mut next = 0;

        while next < tiles.len() {
            if self.ctx.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let room = self.config.max_in_flight.saturating_sub(self.in_flight.len());
            if room == 0 {
                self.refresh_status().await?;
                if self.in_flight.len() >= self.config.max_in_flight {
                    self.wait_refresh_interval().await?;
                }
                continue;
            }

            let count = room
                .min(self.config.submit_batch_size)
                .min(tiles.len() - next);
            let chunk = &tiles[next..next + count];
            next += count;

            let requests: Vec<TaskRequest> = chunk
                .iter()
                .map(|tile| TaskRequest {
                    tile_index: tile.index,
                    payload: TracerPayload::for_tile(job, tile).encode(),
                })
                .collect();
            self.tracker.record_prepared(requests.len());

            let outcome = self
                .client
                .submit(&self.ctx.session_id, requests, &self.config.task_options)
                .await;

            match outcome {
                Ok(outcome) => self.record_outcome(outcome, &mut report),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        tiles = chunk.len(),
                        "Submission call failed, recording chunk as failed"
                    );
                    self.tracker.record_failed_submissions(chunk.len());
                    report
                        .failures
                        .extend(chunk.iter().map(|tile| SubmissionFailure {
                            tile_index: tile.index,
                            message: e.to_string(),
                        }));
                }
            }
        }

        self.tracker.mark_submission_complete();
        report.peak_in_flight = self.peak_in_flight;
        tracing::info!(
            submitted = report.submitted.len(),
            failed = report.failures.len(),
            peak_in_flight = report.peak_in_flight,
            "Submission finished"
        );
        Ok(report)
    }

    fn record_outcome(&mut self, outcome: SubmitOutcome, report: &mut SubmissionReport) {
        self.tracker.record_accepted(outcome.accepted.len());
        for task in &outcome.accepted {
            self.in_flight.insert(task.task_id.clone(), task.tile_index);
            self.ctx.to_watch.put(task.result_id.clone());
        }
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight.len());

        if !outcome.errors.is_empty() {
            self.tracker.record_failed_submissions(outcome.errors.len());
            for failure in &outcome.errors {
                tracing::warn!(
                    tile = failure.tile_index,
                    message = %failure.message,
                    "Tile rejected at submission"
                );
            }
        }

        report.submitted.extend(outcome.accepted);
        report.failures.extend(outcome.errors);
    }

    /// Refresh the status of in-flight tasks, releasing terminal ones.
    ///
    /// A task in `ERROR` aborts the run. Refresh failures are logged and
    /// retried on the next call.
    pub async fn refresh_status(&mut self) -> Result<(), PipelineError> {
        if self.in_flight.is_empty() {
            self.tracker.set_task_counts(0, 0);
            return Ok(());
        }

        let ids: Vec<String> = self.in_flight.keys().cloned().collect();
        let statuses = match self.client.get_task_status(&ids).await {
            Ok(statuses) => statuses,
            Err(e) => {
                tracing::warn!(error = %e, "Task status refresh failed");
                return Ok(());
            }
        };

        let (mut pending, mut processing, mut completed) = (0, 0, 0);
        for (task_id, status) in &statuses {
            match status {
                TaskStatus::Error => {
                    let err = PipelineError::TaskFailed {
                        task_id: task_id.clone(),
                    };
                    self.ctx.abort(PipelineError::TaskFailed {
                        task_id: task_id.clone(),
                    });
                    return Err(err);
                }
                TaskStatus::Completed => completed += 1,
                TaskStatus::Processing => processing += 1,
                TaskStatus::Cancelled => {
                    tracing::debug!(task_id = %task_id, "Task cancelled on the grid");
                }
                _ => pending += 1,
            }
            if status.is_terminal() {
                self.in_flight.remove(task_id);
            }
        }

        self.tracker.set_task_counts(pending, processing);
        self.tracker.record_tasks_completed(completed);
        Ok(())
    }

    /// Keep refreshing task status after submission until every task is
    /// terminal, the run is done or the context is cancelled.
    pub async fn monitor(&mut self) -> Result<(), PipelineError> {
        while !self.in_flight.is_empty() && !self.tracker.is_done() {
            self.refresh_status().await?;
            if self.in_flight.is_empty() {
                break;
            }
            self.wait_refresh_interval().await?;
        }
        self.tracker.set_task_counts(0, 0);
        Ok(())
    }

    async fn wait_refresh_interval(&self) -> Result<(), PipelineError> {
        tokio::select! {
            _ = self.ctx.cancellation().cancelled() => Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(self.config.status_refresh_interval) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_tiles_clips_edges() {
        let job = Job::new(70, 40).with_tile_size(32, 32);
        let tiles = generate_tiles(&job, TileOrder::Raster);

        assert_eq!(tiles.len(), 6);
        assert_eq!(tiles[0].coords(), (0, 0));
        assert_eq!(tiles[2].coords(), (0, 64));
        assert_eq!(tiles[2].width, 6);
        assert_eq!(tiles[3].coords(), (32, 0));
        assert_eq!(tiles[3].height, 8);

        let area: u32 = tiles.iter().map(|t| t.width * t.height).sum();
        assert_eq!(area, 70 * 40);
    }

    #[test]
    fn test_center_out_starts_in_the_middle() {
        let job = Job::new(96, 96).with_tile_size(32, 32);
        let tiles = generate_tiles(&job, TileOrder::CenterOut);
        assert_eq!(tiles[0].coords(), (32, 32));
        assert_eq!(tiles.len(), 9);
    }

    #[test]
    fn test_every_order_covers_each_tile_once() {
        let job = Job::new(100, 60).with_tile_size(16, 16);
        for order in [TileOrder::Raster, TileOrder::Shuffled, TileOrder::CenterOut] {
            let mut indices: Vec<usize> = generate_tiles(&job, order)
                .iter()
                .map(|t| t.index)
                .collect();
            indices.sort_unstable();
            let expected: Vec<usize> = (0..(job.rows() * job.columns()) as usize).collect();
            assert_eq!(indices, expected);
        }
    }
}
