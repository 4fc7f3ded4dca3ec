//! Task session model: one remote task as seen by this client.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl SessionState {
    /// Completed, Failed and Stopped are final.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submitted task. Leaves `Running` exactly once, then never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSession {
    task_id: String,
    state: SessionState,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl TaskSession {
    pub fn start(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            state: SessionState::Running,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    /// Time between start and the terminal transition; `None` while running.
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }

    /// Move into a terminal state.
    ///
    /// Returns `false` (and changes nothing) if the session already left
    /// `Running` or `target` is not terminal.
    pub fn finish(&mut self, target: SessionState) -> bool {
        if !self.is_running() || !target.is_terminal() {
            return false;
        }
        self.state = target;
        self.ended_at = Some(Utc::now());
        true
    }
}
