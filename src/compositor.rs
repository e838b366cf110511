//! Progressive compositing of decoded tile passes into one frame.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::{ImageFormat, Rgb, RgbImage};
use tokio::time::Instant;

use crate::context::SharedContext;
use crate::error::PipelineError;
use crate::payload::TracerResult;
use crate::progress::ProgressTracker;

const DISPLAY_GAMMA: f64 = 2.2;

/// Sample counts mapped onto the outline hue ramp.
const OUTLINE_MIN_SAMPLES: u32 = 100;
const OUTLINE_MAX_SAMPLES: u32 = 500;

/// Full-resolution RGB frame plus the per-tile pass counter.
///
/// Rows are stored top to bottom. Tile coordinates are measured from the
/// bottom edge, so tile row `r` of a tile at `coord_x` lands on frame row
/// `height - coord_x - 1 - r`.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    task_done: HashMap<(u32, u32), u32>,
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 3],
            task_done: HashMap::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGB bytes, row-major from the top.
    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    /// Pixel at column `x`, row `y` (0 = top).
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = self.offset(x, y);
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }

    /// Passes composited so far for the tile at `coords`.
    pub fn passes(&self, coords: (u32, u32)) -> u32 {
        self.task_done.get(&coords).copied().unwrap_or(0)
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 3
    }

    /// Frame position of tile row `row`, column `col`, if inside the frame.
    fn target(&self, result: &TracerResult, row: u32, col: u32) -> Option<(u32, u32)> {
        let from_bottom = result.coord_x.checked_add(row)?;
        let x = result.coord_y.checked_add(col)?;
        if from_bottom >= self.height || x >= self.width {
            return None;
        }
        Some((x, self.height - 1 - from_bottom))
    }

    /// Composite one pass.
    ///
    /// With `overlay`, the pass is blended with what earlier passes of the
    /// same tile left behind; otherwise it overwrites them.
    pub fn apply(&mut self, result: &TracerResult, overlay: bool) {
        let prior = self.passes(result.coords());
        let available = result.pixels.len() / 3;

        for row in 0..result.tile_height {
            for col in 0..result.tile_width {
                let src = row as usize * result.tile_width as usize + col as usize;
                if src >= available {
                    continue;
                }
                let Some((x, y)) = self.target(result, row, col) else {
                    continue;
                };
                let dst = self.offset(x, y);
                for channel in 0..3 {
                    let new = result.pixels[src * 3 + channel];
                    self.pixels[dst + channel] = if overlay {
                        blend(self.pixels[dst + channel], new, prior)
                    } else {
                        new
                    };
                }
            }
        }

        self.task_done.insert(result.coords(), prior + 1);
    }

    /// Draw a 1-px border around the tile, colored by achieved samples.
    pub fn outline(&mut self, result: &TracerResult) {
        let color = color_from_samples(result.samples);
        let (w, h) = (result.tile_width, result.tile_height);
        if w == 0 || h == 0 {
            return;
        }
        for row in 0..h {
            for col in 0..w {
                let edge = row == 0 || col == 0 || row == h - 1 || col == w - 1;
                if !edge {
                    continue;
                }
                if let Some((x, y)) = self.target(result, row, col) {
                    let dst = self.offset(x, y);
                    self.pixels[dst..dst + 3].copy_from_slice(&color);
                }
            }
        }
    }

    /// Black frame, no passes recorded.
    pub fn clear(&mut self) {
        self.pixels.fill(0);
        self.task_done.clear();
    }

    pub fn to_rgb_image(&self) -> RgbImage {
        RgbImage::from_fn(self.width, self.height, |x, y| Rgb(self.pixel(x, y)))
    }

    /// Write the frame as a PNG at `path`.
    pub fn save_png(&self, path: &Path) -> Result<(), PipelineError> {
        self.to_rgb_image()
            .save_with_format(path, ImageFormat::Png)?;
        Ok(())
    }
}

/// Gamma-correct running mean of one channel.
///
/// `prior` is the number of passes already averaged into `old`.
pub fn blend(old: u8, new: u8, prior: u32) -> u8 {
    let n = prior as f64;
    let old_lin = (old as f64 / 255.0).powf(DISPLAY_GAMMA);
    let new_lin = (new as f64 / 255.0).powf(DISPLAY_GAMMA);
    let mean = (n * old_lin + new_lin) / (n + 1.0);
    (mean.powf(1.0 / DISPLAY_GAMMA) * 255.0 + 0.5).min(255.0) as u8
}

/// Outline color: blue at few samples, red at many.
pub fn color_from_samples(samples: u32) -> [u8; 3] {
    let clamped = samples.clamp(OUTLINE_MIN_SAMPLES, OUTLINE_MAX_SAMPLES);
    let t = (clamped - OUTLINE_MIN_SAMPLES) as f64
        / (OUTLINE_MAX_SAMPLES - OUTLINE_MIN_SAMPLES) as f64;
    hsv_to_rgb(0.66 * (1.0 - t), 1.0, 1.0)
}

fn hsv_to_rgb(h: f64, s: f64, v: f64) -> [u8; 3] {
    let sector = (h * 6.0).floor();
    let f = h * 6.0 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    let (r, g, b) = match sector as i64 % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    [
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8,
    ]
}

/// Destination for presented frames.
pub trait FrameSink: Send {
    fn present(&mut self, frame: &FrameBuffer) -> Result<(), PipelineError>;
}

/// Discards every frame.
#[derive(Debug, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn present(&mut self, _frame: &FrameBuffer) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Keeps a PNG on disk in sync with the live frame.
///
/// Each frame is written next to the target and renamed over it, so
/// readers never see a partial file.
#[derive(Debug, Clone)]
pub struct PngFrameSink {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl PngFrameSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        Self {
            path,
            tmp_path: tmp.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSink for PngFrameSink {
    fn present(&mut self, frame: &FrameBuffer) -> Result<(), PipelineError> {
        frame.save_png(&self.tmp_path)?;
        std::fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}

/// Owns the frame buffer and redraws it at a capped rate.
pub struct Compositor {
    ctx: Arc<SharedContext>,
    tracker: Arc<ProgressTracker>,
    frame: FrameBuffer,
    sink: Box<dyn FrameSink>,
    overlay: bool,
    outline_partial: bool,
    frame_interval: Duration,
    queue_timeout: Duration,
    drain_on_stop: bool,
}

impl Compositor {
    pub fn new(
        ctx: Arc<SharedContext>,
        tracker: Arc<ProgressTracker>,
        width: u32,
        height: u32,
        sink: Box<dyn FrameSink>,
    ) -> Self {
        Self {
            ctx,
            tracker,
            frame: FrameBuffer::new(width, height),
            sink,
            overlay: false,
            outline_partial: false,
            frame_interval: Duration::from_micros(33_333),
            queue_timeout: Duration::from_millis(250),
            drain_on_stop: true,
        }
    }

    pub fn with_overlay(mut self, overlay: bool) -> Self {
        self.overlay = overlay;
        self
    }

    pub fn with_outline_partial(mut self, outline: bool) -> Self {
        self.outline_partial = outline;
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn with_drain_on_stop(mut self, drain: bool) -> Self {
        self.drain_on_stop = drain;
        self
    }

    /// Composite until `stop_display` is set or the run is cancelled,
    /// then hand back the frame.
    ///
    /// Tiles arriving within one frame interval are batched into a single
    /// redraw. A set `reset_display` flag clears the frame before the next
    /// tile is applied.
    pub async fn run(mut self) -> FrameBuffer {
        let mut last_present: Option<Instant> = None;
        let mut dirty = false;

        loop {
            if self.ctx.is_cancelled() {
                break;
            }
            if self.check_reset() {
                dirty = true;
            }
            if self.ctx.stop_display.is_set() {
                if self.drain_on_stop {
                    while let Some(result) = self.ctx.to_display.try_get() {
                        self.composite(&result);
                        dirty = true;
                    }
                }
                break;
            }

            let wait = match (dirty, last_present) {
                (true, Some(at)) => self
                    .frame_interval
                    .saturating_sub(at.elapsed())
                    .min(self.queue_timeout),
                (true, None) => Duration::ZERO,
                (false, _) => self.queue_timeout,
            };

            let received = tokio::select! {
                _ = self.ctx.cancellation().cancelled() => break,
                r = self.ctx.to_display.get_timeout(wait) => r,
            };

            if let Some(result) = received {
                self.composite(&result);
                dirty = true;
                while let Some(more) = self.ctx.to_display.try_get() {
                    self.composite(&more);
                }
            }

            let due = last_present.map_or(true, |at| at.elapsed() >= self.frame_interval);
            if dirty && due {
                self.present();
                last_present = Some(Instant::now());
                dirty = false;
            }
        }

        if dirty {
            self.present();
        }
        tracing::debug!("Compositor stopped");
        self.frame
    }

    fn check_reset(&mut self) -> bool {
        if self.ctx.reset_display.take() {
            tracing::info!("Display reset");
            self.frame.clear();
            return true;
        }
        false
    }

    fn composite(&mut self, result: &TracerResult) {
        self.check_reset();
        self.frame.apply(result, self.overlay);
        if self.outline_partial && !self.overlay && !result.is_final {
            self.frame.outline(result);
        }
        self.tracker.record_displayed(1);
        self.ctx.to_display.task_done();
    }

    fn present(&mut self) {
        if let Err(e) = self.sink.present(&self.frame) {
            tracing::warn!(error = %e, "Failed to present frame");
        }
    }
}
