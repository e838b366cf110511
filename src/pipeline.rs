use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::GridClient;
use crate::compositor::{Compositor, FrameBuffer, FrameSink, NullSink};
use crate::config::PipelineConfig;
use crate::context::SharedContext;
use crate::error::PipelineError;
use crate::progress::{run_reporter, ProgressSnapshot, ProgressTracker};
use crate::retriever::Retriever;
use crate::submitter::{generate_tiles, SubmissionReport, TaskSubmitter};
use crate::types::{Job, SubmissionFailure};
use crate::watcher::StatusWatcher;

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted { reason: String },
    Cancelled,
}

/// Record of one pipeline run, serializable for `--summary-json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Unique per invocation, also attached to the run's log lines.
    pub run_id: String,
    pub session_id: String,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Render passes started, counting auto-reruns.
    pub runs: usize,
    /// Counters of the last render pass.
    pub progress: ProgressSnapshot,
    pub submission_failures: Vec<SubmissionFailure>,
    pub peak_in_flight: usize,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    pub fn write_json(&self, path: &Path) -> Result<(), PipelineError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Summary plus the final frame, when the compositor handed it back.
#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    pub frame: Option<FrameBuffer>,
}

/// Wires submitter, watcher, retriever, compositor and progress reporter
/// around one session of a task grid.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use tile_orchestrator::{HttpGridClient, Job, RenderPipeline};
///
/// # async fn example() -> Result<(), tile_orchestrator::PipelineError> {
/// let client = Arc::new(HttpGridClient::new("http://127.0.0.1:5001"));
/// let report = RenderPipeline::builder(client, Job::new(640, 480))
///     .with_output("render.png")
///     .build()?
///     .run()
///     .await?;
/// println!("{:?}", report.summary.outcome);
/// # Ok(())
/// # }
/// ```
pub struct RenderPipeline<G: GridClient> {
    client: Arc<G>,
    job: Job,
    config: PipelineConfig,
    sink: Box<dyn FrameSink>,
    session_id: Option<String>,
    auto_rerun: bool,
    max_runs: Option<usize>,
    output: Option<PathBuf>,
    cancel: CancellationToken,
}

impl<G: GridClient> std::fmt::Debug for RenderPipeline<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPipeline")
            .field("job", &format_args!("{}x{}", self.job.width, self.job.height))
            .field("session_id", &self.session_id)
            .field("auto_rerun", &self.auto_rerun)
            .field("output", &self.output)
            .finish()
    }
}

impl<G: GridClient> RenderPipeline<G> {
    pub fn builder(client: Arc<G>, job: Job) -> RenderPipelineBuilder<G> {
        RenderPipelineBuilder::new(client, job)
    }

    /// Token that cancels the run when triggered, e.g. from a Ctrl-C handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until every tile is final (and reruns are exhausted), the grid
    /// aborts a result, or the run is cancelled.
    ///
    /// Session creation failures and a failure to write the final frame to
    /// the configured output are returned as `Err`. Every other ending is
    /// described by [`RunSummary::outcome`].
    pub async fn run(self) -> Result<RunReport, PipelineError> {
        let Self {
            client,
            job,
            config,
            sink,
            session_id,
            auto_rerun,
            max_runs,
            output,
            cancel,
        } = self;
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();

        let session_id = match session_id {
            Some(id) => id,
            None => client.create_session(&config.task_options).await?,
        };
        tracing::info!(
            run_id = %run_id,
            session_id = %session_id,
            width = job.width,
            height = job.height,
            tiles = job.rows() * job.columns(),
            overlay = job.overlay,
            "Starting render"
        );

        let ctx = Arc::new(SharedContext::new(session_id.clone()));
        let tracker = Arc::new(ProgressTracker::new());

        let cancel_link = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        ctx.abort(PipelineError::Cancelled);
                    }
                    _ = ctx.cancellation().cancelled() => {}
                }
            })
        };

        let watcher = tokio::spawn(
            StatusWatcher::new(client.clone(), ctx.clone(), tracker.clone(), config.clone()).run(),
        );
        let retriever = tokio::spawn(
            Retriever::new(
                client.clone(),
                ctx.clone(),
                tracker.clone(),
                job.overlay,
                config.queue_timeout,
            )
            .run(config.retrieve_workers),
        );
        let compositor = tokio::spawn(
            Compositor::new(ctx.clone(), tracker.clone(), job.width, job.height, sink)
                .with_overlay(job.overlay)
                .with_outline_partial(config.outline_partial_tiles)
                .with_frame_interval(config.frame_interval)
                .with_queue_timeout(config.queue_timeout)
                .with_drain_on_stop(config.drain_display_on_stop)
                .run(),
        );

        let mut runs = 0;
        let mut submission_failures = Vec::new();
        let mut peak_in_flight = 0;

        loop {
            runs += 1;
            let report = render_once(&client, &job, &config, &ctx, &tracker).await;
            if let Some(report) = report {
                peak_in_flight = peak_in_flight.max(report.peak_in_flight);
                submission_failures.extend(report.failures);
            }

            if ctx.is_cancelled() {
                break;
            }
            tracing::info!(run = runs, "Render pass complete");

            if !auto_rerun || max_runs.is_some_and(|max| runs >= max) {
                break;
            }
            let _ = tokio::time::timeout(config.shutdown_timeout, ctx.to_display.join()).await;
            tracker.reset();
            ctx.reset_display.set();
        }

        let progress = tracker.snapshot();
        let failure = ctx.take_failure();
        if failure.is_some() {
            match client.cancel_session(&session_id).await {
                Ok(()) => tracing::info!(session_id = %session_id, "Session cancelled"),
                Err(e) => tracing::warn!(session_id = %session_id, error = %e, "Session cancel failed"),
            }
        }

        ctx.stop_all();
        let limit = config.shutdown_timeout;
        join_bounded("watcher", watcher, limit).await;
        join_bounded("retriever", retriever, limit).await;
        let frame = join_bounded("compositor", compositor, limit).await;
        cancel_link.abort();

        let outcome = match failure {
            None => RunOutcome::Completed,
            Some(PipelineError::Cancelled) => RunOutcome::Cancelled,
            Some(reason) => RunOutcome::Aborted {
                reason: reason.to_string(),
            },
        };

        if outcome == RunOutcome::Completed {
            if let (Some(path), Some(frame)) = (&output, &frame) {
                frame.save_png(path)?;
                tracing::info!(path = %path.display(), "Final frame written");
            }
        }

        let summary = RunSummary {
            run_id,
            session_id,
            outcome,
            started_at,
            finished_at: Utc::now(),
            runs,
            progress,
            submission_failures,
            peak_in_flight,
        };
        match &summary.outcome {
            RunOutcome::Completed => tracing::info!(
                run_id = %summary.run_id,
                runs = summary.runs,
                tiles = summary.progress.finalized_tiles,
                failed_submissions = summary.submission_failures.len(),
                "Render completed"
            ),
            RunOutcome::Cancelled => tracing::warn!("Render cancelled"),
            RunOutcome::Aborted { reason } => tracing::error!(reason = %reason, "Render aborted"),
        }

        Ok(RunReport { summary, frame })
    }
}

/// Submit the job once and wait until it is done or the run is cancelled.
async fn render_once<G: GridClient>(
    client: &Arc<G>,
    job: &Job,
    config: &PipelineConfig,
    ctx: &Arc<SharedContext>,
    tracker: &Arc<ProgressTracker>,
) -> Option<SubmissionReport> {
    let tiles = generate_tiles(job, config.tile_order);

    let reporter = tokio::spawn(run_reporter(
        ctx.clone(),
        tracker.clone(),
        config.progress_interval,
        config.queue_timeout,
    ));

    let submitter = {
        let mut submitter =
            TaskSubmitter::new(client.clone(), ctx.clone(), tracker.clone(), config.clone());
        let job = job.clone();
        tokio::spawn(async move {
            let report = submitter.submit_batch(&job, &tiles).await?;
            submitter.monitor().await?;
            Ok::<_, PipelineError>(report)
        })
    };

    tokio::select! {
        _ = tracker.wait_done() => {}
        _ = ctx.cancellation().cancelled() => {}
    }

    join_bounded("progress", reporter, config.shutdown_timeout).await;
    match join_bounded("submitter", submitter, config.shutdown_timeout).await {
        Some(Ok(report)) => Some(report),
        Some(Err(e)) => {
            tracing::debug!(error = %e, "Submitter stopped early");
            None
        }
        None => None,
    }
}

/// Wait up to `limit` for an actor, aborting it when it overstays.
async fn join_bounded<T>(name: &str, handle: JoinHandle<T>, limit: Duration) -> Option<T> {
    let abort = handle.abort_handle();
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::error!(actor = name, error = %e, "Actor failed");
            None
        }
        Err(_) => {
            tracing::warn!(
                actor = name,
                timeout_ms = limit.as_millis() as u64,
                "Actor did not stop in time, aborting"
            );
            abort.abort();
            None
        }
    }
}

/// Builder for [`RenderPipeline`].
pub struct RenderPipelineBuilder<G: GridClient> {
    client: Arc<G>,
    job: Job,
    config: PipelineConfig,
    sink: Box<dyn FrameSink>,
    session_id: Option<String>,
    auto_rerun: bool,
    max_runs: Option<usize>,
    output: Option<PathBuf>,
    cancel: Option<CancellationToken>,
}

impl<G: GridClient> RenderPipelineBuilder<G> {
    pub fn new(client: Arc<G>, job: Job) -> Self {
        Self {
            client,
            job,
            config: PipelineConfig::default(),
            sink: Box::new(NullSink),
            session_id: None,
            auto_rerun: false,
            max_runs: None,
            output: None,
            cancel: None,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Where live frames are presented. Defaults to discarding them.
    pub fn with_sink(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Reuse an existing session instead of creating one.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Resubmit the job in the same session after each successful pass.
    pub fn with_auto_rerun(mut self, enabled: bool) -> Self {
        self.auto_rerun = enabled;
        self
    }

    /// Stop auto-rerun after `max` passes in total.
    pub fn with_max_runs(mut self, max: usize) -> Self {
        self.max_runs = Some(max);
        self
    }

    /// Write the final frame as PNG on success.
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> Result<RenderPipeline<G>, PipelineError> {
        let job = &self.job;
        if job.width == 0 || job.height == 0 {
            return Err(PipelineError::InvalidConfig(
                "image width and height must be non-zero".into(),
            ));
        }
        if job.tile_width == 0 || job.tile_height == 0 {
            return Err(PipelineError::InvalidConfig(
                "tile width and height must be non-zero".into(),
            ));
        }
        if job.samples_per_pass == 0 {
            return Err(PipelineError::InvalidConfig(
                "samples per pass must be non-zero".into(),
            ));
        }
        if self.max_runs == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "max_runs must be at least 1".into(),
            ));
        }

        Ok(RenderPipeline {
            client: self.client,
            job: self.job,
            config: self.config,
            sink: self.sink,
            session_id: self.session_id,
            auto_rerun: self.auto_rerun,
            max_runs: self.max_runs,
            output: self.output,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(RunOutcome::Aborted {
            reason: "Result r-1 was aborted by the grid".into(),
        })
        .unwrap();
        assert_eq!(json["status"], "aborted");
        assert_eq!(json["reason"], "Result r-1 was aborted by the grid");

        let json = serde_json::to_value(RunOutcome::Completed).unwrap();
        assert_eq!(json["status"], "completed");
    }

    #[test]
    fn test_summary_json_has_rfc3339_timestamps() {
        let summary = RunSummary {
            run_id: "run-1".into(),
            session_id: "s-1".into(),
            outcome: RunOutcome::Completed,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            runs: 1,
            progress: ProgressSnapshot::default(),
            submission_failures: Vec::new(),
            peak_in_flight: 0,
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        summary.write_json(&path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let started = json["started_at"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(started).is_ok());
        assert!(summary.is_success());
    }
}
