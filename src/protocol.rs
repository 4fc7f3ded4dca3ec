//! Wire protocol of the remote task service.
//!
//! Request/response bodies for the HTTP endpoints, and the decoder that turns
//! one stream payload into a [`StreamFrame`]. Everything downstream of
//! [`StreamFrame::decode`] dispatches on [`TaskEvent`], never on raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ServiceError, SessionError};

/// Placeholder shown when a finished task produced no output.
pub const NO_OUTPUT: &str = "(no output)";

// ── Requests / responses ────────────────────────────────────────────────────

/// Body of `POST /run`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRequest {
    pub task: String,
    pub working_dir: String,
    pub provider: String,
    pub model: String,
    pub max_steps: u32,
    pub config_file: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub must_patch: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_path: Option<String>,
}

/// Body returned by `POST /run`, successful or not.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
}

impl RunResponse {
    /// Extract the task id of an accepted submission.
    ///
    /// Anything but `status == "success"` with a non-empty `task_id` is a
    /// rejection.
    pub fn into_task_id(self) -> Result<String, ServiceError> {
        if self.status.as_deref() != Some("success") {
            let message = self
                .error
                .or(self.message)
                .unwrap_or_else(|| "service did not accept the task".to_string());
            return Err(ServiceError::Rejected {
                message,
                traceback: self.traceback,
            });
        }
        match self.task_id {
            Some(id) if !id.trim().is_empty() => Ok(id),
            _ => Err(ServiceError::Malformed(
                "success response without task_id".to_string(),
            )),
        }
    }
}

/// Body returned by `GET /health`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status.as_deref() == Some("healthy")
    }
}

// ── Stream frames ───────────────────────────────────────────────────────────

/// Tag of an inbound stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Step,
    Complete,
    Error,
    End,
    /// A `type` this client does not know.
    Unknown,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Step => "step",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::End => "end",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Start {
        message: Option<String>,
    },
    Step {
        message: Option<String>,
    },
    Complete {
        message: Option<String>,
        /// `None` when the frame had no result, or one that does not decode.
        result: Option<TaskResult>,
    },
    Error {
        error: Option<String>,
        message: Option<String>,
        traceback: Option<String>,
    },
    End,
    Unknown {
        kind: String,
        message: Option<String>,
    },
}

impl TaskEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Start { .. } => EventKind::Start,
            Self::Step { .. } => EventKind::Step,
            Self::Complete { .. } => EventKind::Complete,
            Self::Error { .. } => EventKind::Error,
            Self::End => EventKind::End,
            Self::Unknown { .. } => EventKind::Unknown,
        }
    }

    /// Raw `type` string as sent by the service.
    pub fn kind_label(&self) -> &str {
        match self {
            Self::Unknown { kind, .. } => kind,
            other => other.kind().as_str(),
        }
    }

    /// Whether this event settles the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. } | Self::End)
    }
}

/// One frame of the push-event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub task_id: Option<String>,
    /// Seconds since the epoch, as stamped by the service.
    pub timestamp: Option<f64>,
    pub event: TaskEvent,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    traceback: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    timestamp: Option<f64>,
}

impl StreamFrame {
    /// Decode one `data:` payload.
    pub fn decode(payload: &str) -> Result<Self, SessionError> {
        let raw: RawFrame = serde_json::from_str(payload)
            .map_err(|e| SessionError::ProtocolDecode(e.to_string()))?;
        Ok(Self::from_raw(raw))
    }

    /// Decode an already-parsed JSON value (e.g. buffered status messages).
    pub fn from_value(value: Value) -> Result<Self, SessionError> {
        let raw: RawFrame = serde_json::from_value(value)
            .map_err(|e| SessionError::ProtocolDecode(e.to_string()))?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawFrame) -> Self {
        let message = raw.message.filter(|m| !m.trim().is_empty());
        let event = match raw.kind.as_str() {
            "start" => TaskEvent::Start { message },
            "step" => TaskEvent::Step { message },
            "complete" => TaskEvent::Complete {
                message,
                result: raw.result.and_then(TaskResult::from_value),
            },
            "error" => TaskEvent::Error {
                error: raw.error.filter(|e| !e.trim().is_empty()),
                message,
                traceback: raw.traceback.filter(|t| !t.trim().is_empty()),
            },
            "end" => TaskEvent::End,
            _ => TaskEvent::Unknown {
                kind: raw.kind,
                message,
            },
        };
        Self {
            task_id: raw.task_id,
            timestamp: raw.timestamp,
            event,
        }
    }
}

// ── Task result ─────────────────────────────────────────────────────────────

/// Result payload of a `complete` frame.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub steps_count: Option<u64>,
    #[serde(default)]
    pub total_cost: Option<f64>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

impl TaskResult {
    fn from_value(value: Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    /// Trimmed, non-blank step responses in step order.
    pub fn step_responses(&self) -> impl Iterator<Item = String> + '_ {
        self.steps.iter().filter_map(StepRecord::response_text)
    }

    /// Human-readable summary appended after the step responses.
    pub fn summary(&self) -> String {
        let output = self
            .output
            .as_deref()
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .unwrap_or(NO_OUTPUT);
        let steps = self.steps_count.unwrap_or(self.steps.len() as u64);
        let cost = self.total_cost.unwrap_or(0.0);
        let success = if self.success { "yes" } else { "no" };
        format!(
            "Task finished\nOutput: {output}\nSteps: {steps}\nTotal cost: {cost}\nSuccess: {success}"
        )
    }
}

/// One agent step inside a task result. Only the model response is used.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct StepRecord {
    #[serde(default)]
    pub llm_response: Option<Value>,
}

impl StepRecord {
    /// The step's model response, trimmed; `None` when blank.
    ///
    /// Accepts either a plain string or an object carrying `content`.
    pub fn response_text(&self) -> Option<String> {
        let text = match self.llm_response.as_ref()? {
            Value::String(s) => s.as_str(),
            Value::Object(map) => map.get("content")?.as_str()?,
            _ => return None,
        };
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

// ── Inspection endpoints ────────────────────────────────────────────────────

/// Entry of `GET /tasks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub task_id: String,
    pub status: String,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    #[serde(default)]
    pub active_tasks: Vec<ActiveTask>,
    #[serde(default)]
    pub total_tasks: usize,
}

/// Body of `GET /tasks/{id}/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub task_id: String,
    pub task_status: String,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub messages: Vec<Value>,
}

impl TaskStatusReport {
    /// Buffered messages decoded as stream frames; undecodable ones are kept raw.
    pub fn frames(&self) -> Vec<Result<StreamFrame, Value>> {
        self.messages
            .iter()
            .map(|m| StreamFrame::from_value(m.clone()).map_err(|_| m.clone()))
            .collect()
    }
}

/// Entry of `GET /tools`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolList {
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
    #[serde(default)]
    pub total_tools: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_known_kinds() {
        let frame = StreamFrame::decode(r#"{"type":"start","task_id":"T1","message":"go"}"#).unwrap();
        assert_eq!(frame.task_id.as_deref(), Some("T1"));
        assert_eq!(
            frame.event,
            TaskEvent::Start {
                message: Some("go".into())
            }
        );

        let end = StreamFrame::decode(r#"{"type":"end","task_id":"T1","timestamp":1.5}"#).unwrap();
        assert_eq!(end.event, TaskEvent::End);
        assert_eq!(end.timestamp, Some(1.5));
    }

    #[test]
    fn only_complete_error_and_end_settle_a_session() {
        let terminal = |raw: &str| StreamFrame::decode(raw).unwrap().event.is_terminal();
        assert!(terminal(r#"{"type":"complete"}"#));
        assert!(terminal(r#"{"type":"error","error":"x"}"#));
        assert!(terminal(r#"{"type":"end"}"#));
        assert!(!terminal(r#"{"type":"start"}"#));
        assert!(!terminal(r#"{"type":"step","message":"working"}"#));
    }

    #[test]
    fn unknown_kind_keeps_its_label() {
        let frame = StreamFrame::decode(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(frame.event.kind(), EventKind::Unknown);
        assert_eq!(frame.event.kind_label(), "heartbeat");
        assert!(!frame.event.is_terminal());
    }

    #[test]
    fn garbage_and_missing_type_are_decode_errors() {
        assert!(matches!(
            StreamFrame::decode("not json"),
            Err(SessionError::ProtocolDecode(_))
        ));
        assert!(matches!(
            StreamFrame::decode(r#"{"message":"no type"}"#),
            Err(SessionError::ProtocolDecode(_))
        ));
    }

    #[test]
    fn complete_with_non_object_result_has_no_result() {
        let frame = StreamFrame::decode(r#"{"type":"complete","result":"done"}"#).unwrap();
        assert_eq!(
            frame.event,
            TaskEvent::Complete {
                message: None,
                result: None
            }
        );
    }

    #[test]
    fn step_responses_skip_blank_and_trim() {
        let result: TaskResult = serde_json::from_value(json!({
            "success": true,
            "steps": [
                {"llm_response": "  a  "},
                {"llm_response": ""},
                {"llm_response": {"content": "b"}},
                {"llm_response": null},
                {}
            ]
        }))
        .unwrap();
        let responses: Vec<String> = result.step_responses().collect();
        assert_eq!(responses, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn summary_mentions_output_steps_cost_and_success() {
        let result = TaskResult {
            output: Some("hi".into()),
            steps_count: Some(1),
            total_cost: Some(0.002),
            success: true,
            steps: vec![],
        };
        let summary = result.summary();
        assert!(summary.contains("Output: hi"));
        assert!(summary.contains("Steps: 1"));
        assert!(summary.contains("Total cost: 0.002"));
        assert!(summary.contains("Success: yes"));
    }

    #[test]
    fn summary_falls_back_for_missing_fields() {
        let summary = TaskResult::default().summary();
        assert!(summary.contains(NO_OUTPUT));
        assert!(summary.contains("Steps: 0"));
        assert!(summary.contains("Success: no"));
    }

    #[test]
    fn run_response_requires_success_and_task_id() {
        let ok = RunResponse {
            status: Some("success".into()),
            task_id: Some("T1".into()),
            ..Default::default()
        };
        assert_eq!(ok.into_task_id().unwrap(), "T1");

        let missing = RunResponse {
            status: Some("success".into()),
            ..Default::default()
        };
        assert!(matches!(
            missing.into_task_id(),
            Err(ServiceError::Malformed(_))
        ));

        let rejected = RunResponse {
            status: Some("error".into()),
            error: Some("bad config".into()),
            traceback: Some("Traceback ...".into()),
            ..Default::default()
        };
        let err = rejected.into_task_id().unwrap_err();
        assert_eq!(err.to_string(), "bad config");
        assert_eq!(err.traceback(), Some("Traceback ..."));
    }

    #[test]
    fn run_request_omits_unset_optionals() {
        let req = RunRequest {
            task: "t".into(),
            working_dir: "w".into(),
            provider: "p".into(),
            model: "m".into(),
            max_steps: 3,
            config_file: "c.yaml".into(),
            must_patch: false,
            patch_path: None,
        };
        let body = serde_json::to_value(&req).unwrap();
        assert!(body.get("must_patch").is_none());
        assert!(body.get("patch_path").is_none());
        assert_eq!(body["max_steps"], 3);
    }

    #[test]
    fn status_report_frames_keep_undecodable_messages() {
        let report = TaskStatusReport {
            task_id: "T1".into(),
            task_status: "running".into(),
            start_time: 0.0,
            duration: 1.0,
            messages: vec![json!({"type": "start"}), json!({"oops": true})],
        };
        let frames = report.frames();
        assert!(frames[0].is_ok());
        assert!(frames[1].is_err());
    }
}
