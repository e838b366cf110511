//! # Tile Orchestrator
//!
//! Client-side orchestration for progressively rendered images computed
//! on a remote task grid.
//!
//! A job is sliced into tiles, each tile becomes one grid task, and every
//! task produces a chain of results that refine the tile pass after pass.
//! Independent actors cooperate through a shared context of flags and
//! hand-off queues to turn those results into one live frame.
//!
//! ## Features
//!
//! - Backpressured submission with an in-flight task cap
//! - Result status tracking via event subscription or polling, with dedup
//! - Chained multi-pass retrieval with requeue on transient failures
//! - Gamma-correct progressive blending at a capped redraw rate
//! - Cancellation that interrupts blocked subscriptions and cancels the
//!   grid session exactly once
//! - Live and final PNG output, JSON run summaries
//!
//! ## Quick Start
//!
//! 1. Point an [`HttpGridClient`] (or your own [`GridClient`]) at the grid
//! 2. Describe the image with a [`Job`]
//! 3. Build a [`RenderPipeline`] with a [`PipelineConfig`] and run it
//!
//! ```no_run
//! use std::sync::Arc;
//! use tile_orchestrator::{HttpGridClient, Job, PipelineConfig, RenderPipeline, WatchMode};
//!
//! # async fn example() -> Result<(), tile_orchestrator::PipelineError> {
//! let config = PipelineConfig::builder()
//!     .with_max_in_flight(256)
//!     .with_watch_mode(WatchMode::Polling)
//!     .build()?;
//!
//! let report = RenderPipeline::builder(
//!     Arc::new(HttpGridClient::new("http://127.0.0.1:5001")),
//!     Job::new(512, 512).with_samples(200),
//! )
//! .with_config(config)
//! .with_output("render.png")
//! .build()?
//! .run()
//! .await?;
//!
//! assert!(report.summary.is_success());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod compositor;
pub mod config;
pub mod context;
pub mod error;
pub mod payload;
pub mod pipeline;
pub mod progress;
pub mod retriever;
pub mod submitter;
pub mod types;
pub mod watcher;

pub use client::{EventStream, GridClient, HttpGridClient};
pub use compositor::{Compositor, FrameBuffer, FrameSink, NullSink, PngFrameSink};
pub use config::{PipelineConfig, PipelineConfigBuilder, ReconnectConfig, TileOrder, WatchMode};
pub use context::{CancelToken, Flag, HandoffQueue, SharedContext};
pub use error::{GridError, PipelineError, Result};
pub use payload::{Scene, TracerPayload, TracerResult};
pub use pipeline::{RenderPipeline, RenderPipelineBuilder, RunOutcome, RunReport, RunSummary};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use retriever::Retriever;
pub use submitter::{generate_tiles, SubmissionReport, TaskSubmitter};
pub use types::*;
pub use watcher::{StatusBook, StatusWatcher, Transition};
