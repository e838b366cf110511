use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::payload::Scene;

/// The full image request. Immutable once tiles have been generated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    /// Samples per pixel computed by one pass of a tile task.
    pub samples_per_pass: u32,
    /// Ray kill depth, forwarded to the worker untouched.
    pub kill_depth: u32,
    /// Ray split depth, forwarded to the worker untouched.
    pub split_depth: u32,
    /// Convergence threshold the worker uses to decide when a tile is final.
    pub error_threshold: f32,
    /// Blend successive passes of a tile instead of overwriting them.
    pub overlay: bool,
    pub scene: Scene,
}

impl Job {
    /// Create a job with the default scene and 32x32 tiles.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tile_width: 32,
            tile_height: 32,
            samples_per_pass: 250,
            kill_depth: 7,
            split_depth: 1,
            error_threshold: 0.0,
            overlay: false,
            scene: Scene::default(),
        }
    }

    pub fn with_tile_size(mut self, tile_width: u32, tile_height: u32) -> Self {
        self.tile_width = tile_width;
        self.tile_height = tile_height;
        self
    }

    pub fn with_samples(mut self, samples_per_pass: u32) -> Self {
        self.samples_per_pass = samples_per_pass;
        self
    }

    pub fn with_depths(mut self, kill_depth: u32, split_depth: u32) -> Self {
        self.kill_depth = kill_depth;
        self.split_depth = split_depth;
        self
    }

    pub fn with_error_threshold(mut self, threshold: f32) -> Self {
        self.error_threshold = threshold;
        self
    }

    pub fn with_overlay(mut self, overlay: bool) -> Self {
        self.overlay = overlay;
        self
    }

    /// Number of tile columns, counting a clipped last column.
    pub fn columns(&self) -> u32 {
        self.width.div_ceil(self.tile_width.max(1))
    }

    /// Number of tile rows, counting a clipped last row.
    pub fn rows(&self) -> u32 {
        self.height.div_ceil(self.tile_height.max(1))
    }
}

/// One rectangular sub-region of the image.
///
/// Coordinates follow the worker's convention: `coord_x` is the row
/// offset (vertical, measured from the bottom edge of the image) and
/// `coord_y` the column offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    pub index: usize,
    pub coord_x: u32,
    pub coord_y: u32,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
}

impl Tile {
    pub fn coords(&self) -> (u32, u32) {
        (self.coord_x, self.coord_y)
    }
}

/// Default options applied to every task of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOptions {
    #[serde(with = "duration_secs")]
    pub max_duration: Duration,
    pub priority: u32,
    pub max_retries: u32,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(300),
            priority: 1,
            max_retries: 5,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Task lifecycle as reported by the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Creating,
    Submitted,
    Dispatched,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    /// Completed, errored and cancelled tasks no longer occupy the grid.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

/// Result lifecycle: `Unspecified/Created -> Completed | Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Unspecified,
    Created,
    Completed,
    Aborted,
}

impl ResultStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResultStatus::Completed | ResultStatus::Aborted)
    }
}

/// A status change for one result, from either the event stream or polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEvent {
    pub result_id: String,
    pub status: ResultStatus,
}

impl ResultEvent {
    pub fn new(result_id: impl Into<String>, status: ResultStatus) -> Self {
        Self {
            result_id: result_id.into(),
            status,
        }
    }
}

/// One task to create on the grid.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Index of the tile this task renders, echoed back in the outcome.
    pub tile_index: usize,
    pub payload: Vec<u8>,
}

/// A task accepted by the grid together with its expected result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedTask {
    pub tile_index: usize,
    pub task_id: String,
    pub result_id: String,
}

/// A task the grid refused at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionFailure {
    pub tile_index: usize,
    pub message: String,
}

/// Partial-success outcome of one submission call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub accepted: Vec<SubmittedTask>,
    pub errors: Vec<SubmissionFailure>,
}

/// One page of a result listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultPage {
    pub total: usize,
    pub results: Vec<ResultEvent>,
}

/// Emitted by the retriever for every decoded result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileProgress {
    pub coord_x: u32,
    pub coord_y: u32,
    pub is_final: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_grid_dimensions() {
        let job = Job::new(100, 70).with_tile_size(32, 32);
        assert_eq!(job.columns(), 4);
        assert_eq!(job.rows(), 3);

        let exact = Job::new(64, 64).with_tile_size(32, 32);
        assert_eq!(exact.columns(), 2);
        assert_eq!(exact.rows(), 2);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ResultStatus::Completed.is_terminal());
        assert!(ResultStatus::Aborted.is_terminal());
        assert!(!ResultStatus::Created.is_terminal());
        assert!(!ResultStatus::Unspecified.is_terminal());

        assert!(TaskStatus::Error.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Dispatched.is_terminal());
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&ResultStatus::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");

        let status: TaskStatus = serde_json::from_str("\"PROCESSING\"").unwrap();
        assert_eq!(status, TaskStatus::Processing);
    }

    #[test]
    fn test_task_options_serialization() {
        let opts = TaskOptions::default();
        let json = serde_json::to_value(&opts).unwrap();
        assert_eq!(json["max_duration"], 300);
        assert_eq!(json["max_retries"], 5);
    }
}
