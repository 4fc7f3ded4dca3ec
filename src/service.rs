//! Remote task service boundary.
//!
//! [`TaskService`] is the seam the session client talks through;
//! [`HttpTaskService`] implements it over HTTP with `reqwest`. A task's event
//! stream is relayed by a background tokio task into a [`SignalSink`] and is
//! owned through a [`Subscription`] handle.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::ServiceError;
use crate::protocol::{HealthResponse, RunRequest, RunResponse, TaskList, TaskStatusReport, ToolList};

/// Default timeout for non-streaming requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ── Stream signals ──────────────────────────────────────────────────────────

/// Something that happened on a task's push channel.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSignal {
    pub task_id: String,
    pub kind: SignalKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalKind {
    /// One undecoded `data:` payload.
    Payload(String),
    /// The channel broke (request failed, bad status, read error).
    Failed(String),
    /// The server ended the stream.
    Closed,
}

impl StreamSignal {
    pub fn payload(task_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            kind: SignalKind::Payload(payload.into()),
        }
    }

    pub fn failed(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            kind: SignalKind::Failed(reason.into()),
        }
    }

    pub fn closed(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            kind: SignalKind::Closed,
        }
    }
}

/// Where stream signals are delivered. One sink serves every subscription of
/// a client, so signals are processed by a single consumer in arrival order.
pub type SignalSink = mpsc::UnboundedSender<StreamSignal>;

/// Live handle to one task's push stream.
///
/// `close` may be called any number of times; only the first call has an
/// effect. Dropping the handle closes it as well.
#[derive(Debug)]
pub struct Subscription {
    task_id: String,
    cancel: CancellationToken,
    closed: bool,
}

impl Subscription {
    pub fn new(task_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            task_id: task_id.into(),
            cancel,
            closed: false,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop relaying. Returns `true` only for the call that actually closed it.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.cancel.cancel();
        debug!(task_id = %self.task_id, "Stream subscription closed");
        true
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Service trait ───────────────────────────────────────────────────────────

#[async_trait]
pub trait TaskService: Send + Sync {
    /// Probe `GET /health`; `Ok(true)` only for a `"healthy"` status.
    async fn health(&self) -> Result<bool, ServiceError>;

    /// Submit a task; returns its id.
    async fn run(&self, request: &RunRequest) -> Result<String, ServiceError>;

    /// Ask the service to stop a task. Best-effort.
    async fn stop(&self, task_id: &str) -> Result<(), ServiceError>;

    /// Start relaying the task's event stream into `sink`.
    fn open_stream(&self, task_id: &str, sink: SignalSink) -> Subscription;
}

// ── HTTP implementation ─────────────────────────────────────────────────────

/// `reqwest`-backed client for the task service API.
#[derive(Debug, Clone)]
pub struct HttpTaskService {
    http: reqwest::Client,
    base: Url,
    request_timeout: Duration,
}

/// Query parameters of `GET /config`.
#[derive(Debug, Clone, Default)]
pub struct ConfigQuery {
    pub config_file: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub max_steps: Option<u32>,
}

impl HttpTaskService {
    /// `api_url` is the API root, e.g. `http://localhost:5000/api`.
    pub fn new(api_url: &str, request_timeout: Duration) -> Result<Self, ServiceError> {
        let mut base = Url::parse(api_url)?;
        if base.cannot_be_a_base() {
            return Err(ServiceError::Malformed(format!(
                "'{api_url}' cannot be used as an API root"
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ServiceError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ServiceError::Malformed("API root cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ServiceError> {
        let resp = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        read_json(resp).await
    }

    /// `GET /tasks`: tasks the service currently tracks.
    #[instrument(skip(self))]
    pub async fn list_tasks(&self) -> Result<TaskList, ServiceError> {
        self.get_json(self.endpoint(&["tasks"])?).await
    }

    /// `GET /tasks/{id}/status`: state and buffered messages of one task.
    #[instrument(skip(self))]
    pub async fn task_status(&self, task_id: &str) -> Result<TaskStatusReport, ServiceError> {
        self.get_json(self.endpoint(&["tasks", task_id, "status"])?)
            .await
    }

    /// `GET /config`: the service's resolved agent configuration.
    #[instrument(skip(self))]
    pub async fn show_config(&self, query: &ConfigQuery) -> Result<serde_json::Value, ServiceError> {
        let mut url = self.endpoint(&["config"])?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(ref f) = query.config_file {
                pairs.append_pair("config_file", f);
            }
            if let Some(ref p) = query.provider {
                pairs.append_pair("provider", p);
            }
            if let Some(ref m) = query.model {
                pairs.append_pair("model", m);
            }
            if let Some(steps) = query.max_steps {
                pairs.append_pair("max_steps", &steps.to_string());
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        self.get_json(url).await
    }

    /// `GET /tools`: tools available to the agent.
    #[instrument(skip(self))]
    pub async fn list_tools(&self) -> Result<ToolList, ServiceError> {
        self.get_json(self.endpoint(&["tools"])?).await
    }
}

#[async_trait]
impl TaskService for HttpTaskService {
    async fn health(&self) -> Result<bool, ServiceError> {
        let health: HealthResponse = self.get_json(self.endpoint(&["health"])?).await?;
        Ok(health.is_healthy())
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn run(&self, request: &RunRequest) -> Result<String, ServiceError> {
        let resp = self
            .http
            .post(self.endpoint(&["run"])?)
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        match serde_json::from_str::<RunResponse>(&body) {
            Ok(parsed) if status.is_success() => parsed.into_task_id(),
            Ok(parsed) => {
                let reason = parsed.error.clone().or(parsed.message.clone());
                match reason {
                    Some(message) => Err(ServiceError::Rejected {
                        message: format!("{message} ({status})"),
                        traceback: parsed.traceback,
                    }),
                    None => Err(ServiceError::Status { status, body }),
                }
            }
            Err(_) if !status.is_success() => Err(ServiceError::Status { status, body }),
            Err(e) => Err(ServiceError::Malformed(e.to_string())),
        }
    }

    #[instrument(skip(self))]
    async fn stop(&self, task_id: &str) -> Result<(), ServiceError> {
        let resp = self
            .http
            .post(self.endpoint(&["tasks", task_id, "stop"])?)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(ServiceError::Status { status, body })
        }
    }

    fn open_stream(&self, task_id: &str, sink: SignalSink) -> Subscription {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let http = self.http.clone();
        let url = self.endpoint(&["tasks", task_id, "stream"]);
        let id = task_id.to_string();

        tokio::spawn(async move {
            let url = match url {
                Ok(url) => url,
                Err(e) => {
                    let _ = sink.send(StreamSignal::failed(&id, e.to_string()));
                    return;
                }
            };
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(task_id = %id, "Stream relay cancelled");
                }
                _ = relay_stream(http, url, &id, &sink) => {}
            }
        });

        debug!(task_id, "Stream subscription opened");
        Subscription::new(task_id, cancel)
    }
}

/// Read the SSE body of a task stream and forward each payload.
async fn relay_stream(http: reqwest::Client, url: Url, task_id: &str, sink: &SignalSink) {
    let response = match http.get(url).header(ACCEPT, "text/event-stream").send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = sink.send(StreamSignal::failed(task_id, format!("stream request failed: {e}")));
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let _ = sink.send(StreamSignal::failed(
            task_id,
            format!("stream request returned {status}"),
        ));
        return;
    }

    let mut events = response.bytes_stream().eventsource();
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(task_id, error = %e, "Stream read failed");
                let _ = sink.send(StreamSignal::failed(task_id, format!("stream read failed: {e}")));
                return;
            }
        };
        if event.data.is_empty() {
            continue;
        }
        if sink.send(StreamSignal::payload(task_id, event.data)).is_err() {
            return;
        }
    }

    let _ = sink.send(StreamSignal::closed(task_id));
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ServiceError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(ServiceError::Status { status, body });
    }
    serde_json::from_str(&body).map_err(|e| ServiceError::Malformed(e.to_string()))
}
