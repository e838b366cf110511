use thiserror::Error;

/// Errors returned by task-grid operations.
#[derive(Error, Debug)]
pub enum GridError {
    /// The grid gateway returned a non-success HTTP status.
    #[error("Grid returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The response from the grid was missing expected fields.
    #[error("{0}")]
    InvalidResponse(String),

    /// A downloaded result did not match the expected binary layout.
    #[error("Malformed result payload: {0}")]
    Decode(String),

    /// Event subscription stream failure.
    #[error("Event stream error: {0}")]
    WebSocket(String),

    /// Network-level request failure with context.
    #[error("{context}: {source}")]
    Network {
        context: String,
        source: reqwest::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GridError {
    /// Whether retrying the same call later may succeed.
    ///
    /// Network blips, not-yet-replicated artifacts (404) and server-side
    /// errors are transient. Malformed payloads and bad requests are not.
    pub fn is_transient(&self) -> bool {
        match self {
            GridError::Network { .. } | GridError::WebSocket(_) => true,
            GridError::Http { status, .. } => {
                *status == 404 || *status == 408 || *status == 429 || *status >= 500
            }
            _ => false,
        }
    }
}

/// Errors that end a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Result {result_id} was aborted by the grid")]
    Aborted { result_id: String },

    #[error("Task {task_id} failed on the grid")]
    TaskFailed { task_id: String },

    #[error("Result {result_id} could not be decoded: {message}")]
    CorruptResult { result_id: String, message: String },

    #[error("Pipeline was cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Grid error: {0}")]
    Grid(#[from] GridError),

    #[error("Frame output failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Convenience alias for grid-client calls.
pub type Result<T> = std::result::Result<T, GridError>;
