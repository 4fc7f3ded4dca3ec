//! Error types for the task service boundary and the session lifecycle.

use thiserror::Error;

/// Failure talking to the remote task service over HTTP.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request never produced a response (DNS, connect, read, timeout).
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The service answered with a non-2xx status.
    #[error("service returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    /// The body could not be understood (bad JSON, missing required field).
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The service refused the request (`status` other than `"success"`).
    #[error("{message}")]
    Rejected {
        message: String,
        traceback: Option<String>,
    },

    #[error("invalid service url: {0}")]
    Url(#[from] url::ParseError),
}

impl ServiceError {
    /// Remote traceback attached to the failure, if the service sent one.
    pub fn traceback(&self) -> Option<&str> {
        match self {
            Self::Rejected { traceback, .. } => traceback.as_deref(),
            _ => None,
        }
    }
}

/// Everything that can end (or disturb) a task session.
///
/// The `Display` text of each variant is what the user sees in the chat log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The task could not be started; no session was created.
    #[error("Failed to start task: {0}")]
    Submission(String),

    /// A stream frame could not be decoded; the stream keeps going.
    #[error("stream decode error: {0}")]
    ProtocolDecode(String),

    /// The remote task reported an error frame.
    #[error("Task failed: {0}")]
    RemoteTask(String),

    /// The push channel itself broke.
    #[error("Connection to task stream lost: {0}")]
    Connection(String),

    /// The user asked to stop the task.
    #[error("Task stopped by user")]
    UserStop,
}
