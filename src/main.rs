use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tile_orchestrator::{
    FrameSink, HttpGridClient, Job, NullSink, PipelineConfig, PngFrameSink, RenderPipeline,
    TileOrder, WatchMode,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Order {
    CenterOut,
    Shuffled,
    Raster,
}

impl From<Order> for TileOrder {
    fn from(order: Order) -> Self {
        match order {
            Order::CenterOut => TileOrder::CenterOut,
            Order::Shuffled => TileOrder::Shuffled,
            Order::Raster => TileOrder::Raster,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "tile-orchestrator",
    version,
    about = "Render an image progressively on a remote task grid"
)]
struct Cli {
    /// Task grid gateway URL
    #[arg(long = "server-url", env = "GRID_SERVER_URL")]
    server_url: String,

    /// Image height in pixels
    #[arg(long, default_value_t = 1080)]
    height: u32,

    /// Image width in pixels
    #[arg(long, default_value_t = 1920)]
    width: u32,

    /// Samples per pixel computed by one pass of a task
    #[arg(long, default_value_t = 250)]
    samples: u32,

    /// Height of a task tile in pixels
    #[arg(long = "task-height", default_value_t = 32)]
    task_height: u32,

    /// Width of a task tile in pixels
    #[arg(long = "task-width", default_value_t = 32)]
    task_width: u32,

    /// Ray kill depth
    #[arg(long = "kill-depth", default_value_t = 7)]
    kill_depth: u32,

    /// Ray split depth
    #[arg(long = "split-depth", default_value_t = 1)]
    split_depth: u32,

    /// Convergence threshold at which workers stop refining a tile
    #[arg(long = "error-threshold", default_value_t = 0.0)]
    error_threshold: f32,

    /// Blend successive passes instead of overwriting them
    #[arg(long)]
    overlay: bool,

    /// Poll result listings instead of subscribing to result events
    #[arg(long)]
    polling: bool,

    /// Re-render the same job after each completed pass until interrupted
    #[arg(long = "auto-rerun")]
    auto_rerun: bool,

    /// Maximum tasks in flight before submission stalls
    #[arg(long = "max-in-flight", env = "GRID_MAX_IN_FLIGHT", default_value_t = 384)]
    max_in_flight: usize,

    /// Concurrent result downloads
    #[arg(long = "retrieve-workers", default_value_t = 4)]
    retrieve_workers: usize,

    /// Tile submission order
    #[arg(long = "tile-order", value_enum, default_value_t = Order::CenterOut)]
    tile_order: Order,

    /// Outline tiles that are not final yet
    #[arg(long = "outline-partial")]
    outline_partial: bool,

    /// Maximum live frame refresh rate
    #[arg(long = "max-fps", default_value_t = 30)]
    max_fps: u32,

    /// Keep this PNG updated with the live frame
    #[arg(long = "live-frame")]
    live_frame: Option<PathBuf>,

    /// Write the final frame to this PNG
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write a JSON run summary to this path
    #[arg(long = "summary-json")]
    summary_json: Option<PathBuf>,

    /// Reuse an existing session
    #[arg(long)]
    session: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tile_orchestrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let job = Job::new(cli.width, cli.height)
        .with_tile_size(cli.task_width, cli.task_height)
        .with_samples(cli.samples)
        .with_depths(cli.kill_depth, cli.split_depth)
        .with_error_threshold(cli.error_threshold)
        .with_overlay(cli.overlay);

    let config = PipelineConfig::builder()
        .with_max_in_flight(cli.max_in_flight)
        .with_retrieve_workers(cli.retrieve_workers)
        .with_watch_mode(if cli.polling {
            WatchMode::Polling
        } else {
            WatchMode::Events
        })
        .with_tile_order(cli.tile_order.into())
        .with_outline_partial_tiles(cli.outline_partial)
        .with_max_fps(cli.max_fps)
        .build()
        .context("invalid pipeline configuration")?;

    let sink: Box<dyn FrameSink> = match &cli.live_frame {
        Some(path) => Box::new(PngFrameSink::new(path)),
        None => Box::new(NullSink),
    };

    let client = Arc::new(HttpGridClient::new(cli.server_url.clone()));
    let mut builder = RenderPipeline::builder(client, job)
        .with_config(config)
        .with_sink(sink)
        .with_auto_rerun(cli.auto_rerun);
    if let Some(session) = &cli.session {
        builder = builder.with_session(session.clone());
    }
    if let Some(output) = &cli.output {
        builder = builder.with_output(output.clone());
    }
    let pipeline = builder.build()?;

    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling session");
            cancel.cancel();
        }
    });

    let report = pipeline
        .run()
        .await
        .with_context(|| format!("render against {} failed", cli.server_url))?;

    if let Some(path) = &cli.summary_json {
        report
            .summary
            .write_json(path)
            .with_context(|| format!("failed to write summary to {}", path.display()))?;
    }

    if !report.summary.is_success() {
        anyhow::bail!("render did not complete: {:?}", report.summary.outcome);
    }
    Ok(())
}
