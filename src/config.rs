use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::TaskOptions;

/// How the watcher learns about result status changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Long-lived server event subscription.
    #[default]
    Events,
    /// Periodic listing of the session's results.
    Polling,
}

/// Order in which tiles are submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileOrder {
    /// Closest to the image center first.
    #[default]
    CenterOut,
    Shuffled,
    Raster,
}

/// Exponential backoff for re-subscribing to the event stream.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

impl ReconnectConfig {
    /// Delay to use after `current`, capped at `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.multiplier.max(1))
            .min(self.max_delay)
    }
}

/// Configuration for a pipeline run.
///
/// Use [`PipelineConfig::builder()`] for ergonomic construction, or
/// [`PipelineConfig::default()`] for the defaults used by the CLI.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum tasks awaiting a terminal status before submission stalls.
    pub max_in_flight: usize,

    /// Tasks sent per submission call.
    pub submit_batch_size: usize,

    /// Bounded wait on hand-off queues before stop flags are re-checked.
    pub queue_timeout: Duration,

    /// Interval between result listings in polling mode.
    pub poll_interval: Duration,

    /// Interval between task status refreshes while submission is stalled.
    pub status_refresh_interval: Duration,

    pub watch_mode: WatchMode,

    /// Page size for result listings in polling mode.
    pub poll_page_size: usize,

    /// Concurrent result downloads.
    pub retrieve_workers: usize,

    /// Minimum time between two presented frames.
    pub frame_interval: Duration,

    /// Composite tiles still queued when the display is stopped.
    pub drain_display_on_stop: bool,

    /// Outline non-final passes in overwrite mode.
    pub outline_partial_tiles: bool,

    pub tile_order: TileOrder,

    /// Bound on waiting for actors to exit before they are aborted.
    pub shutdown_timeout: Duration,

    /// Interval between progress log lines.
    pub progress_interval: Duration,

    /// Options applied to every task of the session.
    pub task_options: TaskOptions,

    pub reconnect: ReconnectConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 384,
            submit_batch_size: 64,
            queue_timeout: Duration::from_millis(250),
            poll_interval: Duration::from_secs(2),
            status_refresh_interval: Duration::from_millis(500),
            watch_mode: WatchMode::Events,
            poll_page_size: 200,
            retrieve_workers: 4,
            frame_interval: Duration::from_micros(33_333),
            drain_display_on_stop: true,
            outline_partial_tiles: false,
            tile_order: TileOrder::CenterOut,
            shutdown_timeout: Duration::from_secs(5),
            progress_interval: Duration::from_millis(500),
            task_options: TaskOptions::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Set the in-flight task cap used for backpressure.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.config.max_in_flight = max;
        self
    }

    pub fn with_submit_batch_size(mut self, size: usize) -> Self {
        self.config.submit_batch_size = size;
        self
    }

    /// Set the bounded wait used on every hand-off queue.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.config.queue_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn with_status_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.status_refresh_interval = interval;
        self
    }

    /// Choose between event subscription and polling.
    pub fn with_watch_mode(mut self, mode: WatchMode) -> Self {
        self.config.watch_mode = mode;
        self
    }

    pub fn with_poll_page_size(mut self, size: usize) -> Self {
        self.config.poll_page_size = size;
        self
    }

    pub fn with_retrieve_workers(mut self, workers: usize) -> Self {
        self.config.retrieve_workers = workers;
        self
    }

    /// Cap the redraw rate. `fps` of zero is rejected by `build()`.
    pub fn with_max_fps(mut self, fps: u32) -> Self {
        self.config.frame_interval = if fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / fps
        };
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.config.frame_interval = interval;
        self
    }

    pub fn with_drain_display_on_stop(mut self, drain: bool) -> Self {
        self.config.drain_display_on_stop = drain;
        self
    }

    pub fn with_outline_partial_tiles(mut self, outline: bool) -> Self {
        self.config.outline_partial_tiles = outline;
        self
    }

    pub fn with_tile_order(mut self, order: TileOrder) -> Self {
        self.config.tile_order = order;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.config.progress_interval = interval;
        self
    }

    pub fn with_task_options(mut self, options: TaskOptions) -> Self {
        self.config.task_options = options;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    /// Validate and build the final [`PipelineConfig`].
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.max_in_flight == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_in_flight must be at least 1".into(),
            ));
        }
        if c.submit_batch_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "submit_batch_size must be at least 1".into(),
            ));
        }
        if c.retrieve_workers == 0 {
            return Err(PipelineError::InvalidConfig(
                "retrieve_workers must be at least 1".into(),
            ));
        }
        if c.poll_page_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "poll_page_size must be at least 1".into(),
            ));
        }
        if c.queue_timeout.is_zero() || c.frame_interval.is_zero() {
            return Err(PipelineError::InvalidConfig(
                "queue_timeout and frame_interval must be non-zero".into(),
            ));
        }
        if c.reconnect.initial_delay > c.reconnect.max_delay {
            return Err(PipelineError::InvalidConfig(
                "reconnect initial_delay exceeds max_delay".into(),
            ));
        }
        Ok(self.config)
    }
}
