use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use base64::Engine;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::Value;

use crate::error::{GridError, Result};
use crate::types::*;

/// Stream of result status changes for one session.
pub type EventStream = BoxStream<'static, Result<ResultEvent>>;

/// Operations the pipeline needs from a task grid.
///
/// Implementations are shared between actors behind an `Arc`, so every
/// method takes `&self` and returns a `Send` future.
pub trait GridClient: Send + Sync + 'static {
    /// Open a session whose tasks default to `options`.
    fn create_session(&self, options: &TaskOptions)
        -> impl Future<Output = Result<String>> + Send;

    /// Create one task per request. Partial success is reported through
    /// [`SubmitOutcome::errors`], not as an `Err`.
    fn submit(
        &self,
        session_id: &str,
        tasks: Vec<TaskRequest>,
        options: &TaskOptions,
    ) -> impl Future<Output = Result<SubmitOutcome>> + Send;

    /// Current status of each known task id. Unknown ids are omitted.
    fn get_task_status(
        &self,
        task_ids: &[String],
    ) -> impl Future<Output = Result<HashMap<String, TaskStatus>>> + Send;

    /// Long-lived stream of result status changes.
    fn subscribe_result_events(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<EventStream>> + Send;

    /// One page of the session's results with their current status.
    fn list_results(
        &self,
        session_id: &str,
        offset: usize,
        page_size: usize,
    ) -> impl Future<Output = Result<ResultPage>> + Send;

    /// Raw bytes of a completed result.
    fn download_result(
        &self,
        session_id: &str,
        result_id: &str,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Best-effort abort of every outstanding task of the session.
    fn cancel_session(&self, session_id: &str) -> impl Future<Output = Result<()>> + Send;
}

fn normalize(endpoint: String) -> String {
    endpoint.trim_end_matches('/').to_string()
}

/// Async client for a task grid exposed through an HTTP gateway.
///
/// REST calls cover sessions, submission, status and downloads; result
/// events arrive over a WebSocket at `/sessions/{id}/events`.
///
/// # Example
/// ```no_run
/// use tile_orchestrator::{GridClient, HttpGridClient, TaskOptions};
///
/// # async fn example() -> tile_orchestrator::Result<()> {
/// let client = HttpGridClient::new("http://127.0.0.1:5001");
/// let session = client.create_session(&TaskOptions::default()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpGridClient {
    http: Client,
    endpoint: String,
    request_timeout: Duration,
}

impl HttpGridClient {
    /// Create a new client pointing at the given gateway endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: normalize(endpoint.into()),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Use a custom `reqwest::Client` (for connection pooling, timeouts, TLS).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Timeout applied to every REST call.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns the configured endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn events_url(&self, session_id: &str) -> String {
        format!(
            "{}/sessions/{}/events",
            self.endpoint
                .replace("http://", "ws://")
                .replace("https://", "wss://"),
            session_id
        )
    }

    fn network_error(&self, e: reqwest::Error) -> GridError {
        GridError::Network {
            context: format!(
                "Cannot reach task grid at {}, is the gateway running?",
                self.endpoint
            ),
            source: e,
        }
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.endpoint, path);
        let resp = self
            .http
            .post(&url)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| self.network_error(e))?;
        read_json(resp, path).await
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.endpoint, path);
        let resp = self
            .http
            .get(&url)
            .query(query)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.network_error(e))?;
        read_json(resp, path).await
    }
}

async fn read_json(resp: reqwest::Response, path: &str) -> Result<Value> {
    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(GridError::Http { status, body });
    }
    resp.json().await.map_err(|e| GridError::Network {
        context: format!("Failed to parse grid response for {}", path),
        source: e,
    })
}

impl GridClient for HttpGridClient {
    // ── Sessions ────────────────────────────────────────────────────

    async fn create_session(&self, options: &TaskOptions) -> Result<String> {
        let body = serde_json::json!({ "task_options": options });
        let json = self.post_json("/sessions", &body).await?;
        json.get("session_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| GridError::InvalidResponse("Response missing session_id".into()))
    }

    async fn cancel_session(&self, session_id: &str) -> Result<()> {
        let path = format!("/sessions/{}/cancel", session_id);
        self.post_json(&path, &Value::Null).await?;
        Ok(())
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn submit(
        &self,
        session_id: &str,
        tasks: Vec<TaskRequest>,
        options: &TaskOptions,
    ) -> Result<SubmitOutcome> {
        let indices: Vec<usize> = tasks.iter().map(|t| t.tile_index).collect();
        let engine = base64::engine::general_purpose::STANDARD;
        let body = serde_json::json!({
            "task_options": options,
            "tasks": tasks
                .iter()
                .map(|t| serde_json::json!({ "payload": engine.encode(&t.payload) }))
                .collect::<Vec<_>>(),
        });
        let path = format!("/sessions/{}/tasks", session_id);
        let json = self.post_json(&path, &body).await?;
        parse_submit_response(&json, &indices)
    }

    async fn get_task_status(&self, task_ids: &[String]) -> Result<HashMap<String, TaskStatus>> {
        if task_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let body = serde_json::json!({ "task_ids": task_ids });
        let json = self.post_json("/tasks/status", &body).await?;
        parse_status_map(&json)
    }

    // ── Results ─────────────────────────────────────────────────────

    async fn list_results(
        &self,
        session_id: &str,
        offset: usize,
        page_size: usize,
    ) -> Result<ResultPage> {
        let path = format!("/sessions/{}/results", session_id);
        let query = [
            ("offset", offset.to_string()),
            ("limit", page_size.to_string()),
        ];
        let json = self.get_json(&path, &query).await?;
        parse_result_page(&json)
    }

    async fn download_result(&self, session_id: &str, result_id: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/sessions/{}/results/{}/data",
            self.endpoint, session_id, result_id
        );
        let resp = self
            .http
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| GridError::Network {
                context: format!("Failed to download result {}", result_id),
                source: e,
            })?;

        if !resp.status().is_success() {
            return Err(GridError::Http {
                status: resp.status().as_u16(),
                body: format!("Failed to download result {}", result_id),
            });
        }

        let bytes = resp.bytes().await.map_err(|e| GridError::Network {
            context: format!("Failed to read bytes of result {}", result_id),
            source: e,
        })?;
        Ok(bytes.to_vec())
    }

    // ── Events ──────────────────────────────────────────────────────

    async fn subscribe_result_events(&self, session_id: &str) -> Result<EventStream> {
        let url = self.events_url(session_id);
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| GridError::WebSocket(format!("connect to {} failed: {}", url, e)))?;

        let stream = ws.filter_map(|msg| async move {
            match msg {
                Ok(m) if m.is_text() => {
                    let text = m.into_text().unwrap_or_default();
                    parse_event(&text).map(Ok)
                }
                Ok(m) if m.is_close() => {
                    Some(Err(GridError::WebSocket("server closed the stream".into())))
                }
                Ok(_) => None,
                Err(e) => Some(Err(GridError::WebSocket(e.to_string()))),
            }
        });
        Ok(stream.boxed())
    }
}

// ── Response parsing ────────────────────────────────────────────────

/// Pair each entry of `tasks` with the tile it was submitted for.
/// Entries are positional; an entry with an `error` field was rejected.
fn parse_submit_response(json: &Value, tile_indices: &[usize]) -> Result<SubmitOutcome> {
    let entries = json
        .get("tasks")
        .and_then(|v| v.as_array())
        .ok_or_else(|| GridError::InvalidResponse("Response missing tasks".into()))?;

    let mut outcome = SubmitOutcome::default();
    for (i, &tile_index) in tile_indices.iter().enumerate() {
        let Some(entry) = entries.get(i) else {
            outcome.errors.push(SubmissionFailure {
                tile_index,
                message: "no entry in submission response".into(),
            });
            continue;
        };

        if let Some(err) = entry.get("error").and_then(|v| v.as_str()) {
            outcome.errors.push(SubmissionFailure {
                tile_index,
                message: err.to_string(),
            });
            continue;
        }

        let task_id = entry.get("task_id").and_then(|v| v.as_str());
        let result_id = entry.get("result_id").and_then(|v| v.as_str());
        match (task_id, result_id) {
            (Some(task_id), Some(result_id)) => outcome.accepted.push(SubmittedTask {
                tile_index,
                task_id: task_id.to_string(),
                result_id: result_id.to_string(),
            }),
            _ => outcome.errors.push(SubmissionFailure {
                tile_index,
                message: "entry missing task_id or result_id".into(),
            }),
        }
    }
    Ok(outcome)
}

fn parse_status_map(json: &Value) -> Result<HashMap<String, TaskStatus>> {
    let statuses = json
        .get("statuses")
        .and_then(|v| v.as_object())
        .ok_or_else(|| GridError::InvalidResponse("Response missing statuses".into()))?;

    let mut map = HashMap::with_capacity(statuses.len());
    for (task_id, status) in statuses {
        match serde_json::from_value::<TaskStatus>(status.clone()) {
            Ok(s) => {
                map.insert(task_id.clone(), s);
            }
            Err(_) => tracing::debug!(task_id = %task_id, status = %status, "Ignoring unknown task status"),
        }
    }
    Ok(map)
}

fn parse_result_page(json: &Value) -> Result<ResultPage> {
    let total = json
        .get("total")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| GridError::InvalidResponse("Response missing total".into()))?;
    let results = json
        .get("results")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|r| serde_json::from_value::<ResultEvent>(r.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    Ok(ResultPage {
        total: total as usize,
        results,
    })
}

fn parse_event(text: &str) -> Option<ResultEvent> {
    match serde_json::from_str::<ResultEvent>(text) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping malformed result event");
            None
        }
    }
}
