//! Task session client: submission, stream classification, cancellation.
//!
//! [`TaskSessionClient`] owns at most one [`TaskSession`] at a time together
//! with the [`Subscription`] to its event stream. Every mutation happens in a
//! `&mut self` handler that runs to completion, so handlers never interleave.
//! Terminal transitions go through [`TaskSessionClient::settle`], which checks
//! "still running" once; whichever of stop, terminal frame or connection
//! failure gets there first wins, and the rest are no-ops.
//!
//! Presentation code observes the client through [`ClientUpdate`]s on a
//! broadcast channel, or by reading [`TaskSessionClient::entries`] and
//! [`TaskSessionClient::session`] directly.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn};

use crate::chat::{ChatEntry, ChatLog};
use crate::config::RunSettings;
use crate::error::{ServiceError, SessionError};
use crate::protocol::{EventKind, RunRequest, StreamFrame, TaskEvent};
use crate::service::{SignalKind, StreamSignal, Subscription, TaskService};
use crate::session::{SessionState, TaskSession};

/// Capacity of the update broadcast; slow observers lag rather than block.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Receiving half of the client's stream signal channel.
pub type SignalReceiver = mpsc::UnboundedReceiver<StreamSignal>;

/// Change notifications for observers.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientUpdate {
    EntryAppended(ChatEntry),
    SessionChanged(TaskSession),
    ReachabilityChanged(bool),
    /// Out-of-band diagnostics (remote tracebacks). Never part of the chat log.
    Diagnostic {
        task_id: Option<String>,
        traceback: String,
    },
}

/// Why a submission was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitRejection {
    /// Task text was empty or whitespace.
    EmptyText,
    /// A submission is in flight or a session is still running.
    Busy,
    /// The service is not known to be reachable.
    Unreachable,
}

/// Result of [`TaskSessionClient::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Session created; carries the task id.
    Started(String),
    /// The request was made and failed; one system entry was appended.
    Failed,
    /// Nothing happened.
    Ignored(SubmitRejection),
}

/// Point-in-time copy of the observable model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSnapshot {
    pub entries: Vec<ChatEntry>,
    pub session: Option<TaskSession>,
    pub reachable: bool,
}

/// The current (or most recent) session and, while it runs, its connection.
struct ActiveSession {
    session: TaskSession,
    connection: Option<Subscription>,
}

pub struct TaskSessionClient {
    service: Arc<dyn TaskService>,
    settings: RunSettings,
    log: ChatLog,
    active: Option<ActiveSession>,
    reachable: bool,
    submitting: bool,
    signals: mpsc::UnboundedSender<StreamSignal>,
    updates: broadcast::Sender<ClientUpdate>,
}

impl TaskSessionClient {
    /// Create a client. Stream signals for every session it opens arrive on
    /// the returned receiver and must be fed back through
    /// [`handle_signal`](Self::handle_signal).
    pub fn new(service: Arc<dyn TaskService>, settings: RunSettings) -> (Self, SignalReceiver) {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let client = Self {
            service,
            settings,
            log: ChatLog::new(),
            active: None,
            reachable: false,
            submitting: false,
            signals,
            updates,
        };
        (client, signal_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientUpdate> {
        self.updates.subscribe()
    }

    pub(crate) fn update_sender(&self) -> broadcast::Sender<ClientUpdate> {
        self.updates.clone()
    }

    pub fn service(&self) -> Arc<dyn TaskService> {
        Arc::clone(&self.service)
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn entries(&self) -> &[ChatEntry] {
        self.log.entries()
    }

    pub fn session(&self) -> Option<&TaskSession> {
        self.active.as_ref().map(|a| &a.session)
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn is_submitting(&self) -> bool {
        self.submitting
    }

    /// Whether a stream connection is currently held.
    pub fn has_connection(&self) -> bool {
        self.active
            .as_ref()
            .and_then(|a| a.connection.as_ref())
            .is_some_and(|c| !c.is_closed())
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            entries: self.log.entries().to_vec(),
            session: self.session().cloned(),
            reachable: self.reachable,
        }
    }

    // ── Reachability ────────────────────────────────────────────────────────

    pub fn set_reachable(&mut self, reachable: bool) {
        if self.reachable != reachable {
            info!(reachable, "Task service reachability changed");
            self.reachable = reachable;
            let _ = self.updates.send(ClientUpdate::ReachabilityChanged(reachable));
        }
    }

    /// Probe the service once and record the result.
    pub async fn refresh_reachability(&mut self) -> bool {
        let reachable = probe(self.service.as_ref()).await;
        self.set_reachable(reachable);
        reachable
    }

    // ── Submission ──────────────────────────────────────────────────────────

    /// Validate a submission and record the user's entry.
    ///
    /// On success the caller must issue the returned request and hand its
    /// result to [`finish_submit`](Self::finish_submit).
    pub fn begin_submit(&mut self, text: &str) -> Result<RunRequest, SubmitRejection> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SubmitRejection::EmptyText);
        }
        if self.submitting || self.session().is_some_and(TaskSession::is_running) {
            debug!("Submission ignored: client busy");
            return Err(SubmitRejection::Busy);
        }
        if !self.reachable {
            debug!("Submission ignored: service unreachable");
            return Err(SubmitRejection::Unreachable);
        }

        self.append(ChatEntry::user(text));
        self.submitting = true;
        Ok(self.settings.request_for(text))
    }

    /// Apply the outcome of a submission request.
    pub fn finish_submit(&mut self, result: Result<String, ServiceError>) -> SubmitOutcome {
        self.submitting = false;
        match result {
            Ok(task_id) => {
                info!(task_id = %task_id, "Task started");
                let connection = self.service.open_stream(&task_id, self.signals.clone());
                let session = TaskSession::start(task_id.clone());
                let _ = self
                    .updates
                    .send(ClientUpdate::SessionChanged(session.clone()));
                self.active = Some(ActiveSession {
                    session,
                    connection: Some(connection),
                });
                SubmitOutcome::Started(task_id)
            }
            Err(e) => {
                warn!(error = %e, "Task submission failed");
                if let Some(traceback) = e.traceback() {
                    self.diagnostic(None, traceback);
                }
                self.append(ChatEntry::system(
                    SessionError::Submission(e.to_string()).to_string(),
                ));
                SubmitOutcome::Failed
            }
        }
    }

    /// Submit a task and wait for the service to accept or reject it.
    #[instrument(skip(self, text))]
    pub async fn submit(&mut self, text: &str) -> SubmitOutcome {
        let request = match self.begin_submit(text) {
            Ok(request) => request,
            Err(rejection) => return SubmitOutcome::Ignored(rejection),
        };
        let result = self.service.run(&request).await;
        self.finish_submit(result)
    }

    // ── Stream handling ─────────────────────────────────────────────────────

    /// Fold one stream signal into the model.
    ///
    /// Signals for anything but the running session are dropped.
    pub fn handle_signal(&mut self, signal: StreamSignal) {
        let current = self
            .active
            .as_ref()
            .filter(|a| a.session.is_running())
            .map(|a| a.session.task_id() == signal.task_id);
        if current != Some(true) {
            debug!(task_id = %signal.task_id, "Dropping signal for inactive session");
            return;
        }

        match signal.kind {
            SignalKind::Payload(payload) => match StreamFrame::decode(&payload) {
                Ok(frame) => self.apply_frame(frame),
                Err(e) => {
                    warn!(task_id = %signal.task_id, error = %e, "Undecodable stream frame");
                    self.append(ChatEntry::system(e.to_string()).with_task(&signal.task_id));
                }
            },
            SignalKind::Failed(reason) => self.fail_connection(&reason),
            SignalKind::Closed => self.fail_connection("stream ended before the task finished"),
        }
    }

    /// Classify a decoded frame for the running session.
    pub fn apply_frame(&mut self, frame: StreamFrame) {
        let Some(task_id) = self.running_task_id() else {
            return;
        };
        if let Some(ref frame_task) = frame.task_id {
            if *frame_task != task_id {
                warn!(expected = %task_id, got = %frame_task, "Frame for another task ignored");
                return;
            }
        }

        let kind = frame.event.kind();
        debug!(
            task_id = %task_id,
            kind = %frame.event.kind_label(),
            terminal = frame.event.is_terminal(),
            "Stream frame"
        );

        match frame.event {
            TaskEvent::Error {
                error,
                message,
                traceback,
            } => {
                let text = error
                    .or(message)
                    .unwrap_or_else(|| "unknown error".to_string());
                if let Some(traceback) = traceback {
                    self.diagnostic(Some(&task_id), &traceback);
                }
                let entry = ChatEntry::system(SessionError::RemoteTask(text).to_string());
                self.settle(SessionState::Failed, vec![entry], Some(kind));
            }
            TaskEvent::Complete {
                result: Some(result),
                ..
            } => {
                let mut entries: Vec<ChatEntry> =
                    result.step_responses().map(ChatEntry::agent).collect();
                entries.push(ChatEntry::system(result.summary()));
                self.settle(SessionState::Completed, entries, Some(kind));
            }
            TaskEvent::Complete {
                message,
                result: None,
            } => {
                let text = message.unwrap_or_else(|| "Task completed".to_string());
                self.settle(SessionState::Completed, vec![ChatEntry::system(text)], Some(kind));
            }
            TaskEvent::End => {
                self.settle(SessionState::Completed, Vec::new(), Some(kind));
            }
            event @ (TaskEvent::Start { .. } | TaskEvent::Step { .. } | TaskEvent::Unknown { .. }) => {
                let label = event.kind_label().to_string();
                let message = match event {
                    TaskEvent::Start { message }
                    | TaskEvent::Step { message }
                    | TaskEvent::Unknown { message, .. } => message,
                    _ => None,
                };
                let text = message.unwrap_or_else(|| format!("[{label}] status update"));
                self.append(ChatEntry::agent(text).with_task(&task_id).with_kind(kind));
            }
        }
    }

    /// The push channel broke underneath a running session.
    fn fail_connection(&mut self, reason: &str) {
        warn!(reason, "Task stream connection failed");
        let entry = ChatEntry::system(SessionError::Connection(reason.to_string()).to_string());
        self.settle(SessionState::Failed, vec![entry], None);
    }

    // ── Cancellation ────────────────────────────────────────────────────────

    /// Stop observing the running session locally.
    ///
    /// Returns the task id the remote stop request should target, or `None`
    /// if there was nothing to stop.
    pub fn cancel(&mut self) -> Option<String> {
        let task_id = self.running_task_id()?;
        let entry = ChatEntry::system(SessionError::UserStop.to_string());
        self.settle(SessionState::Stopped, vec![entry], None)
            .then_some(task_id)
    }

    /// Stop the running session: local teardown first, then a best-effort
    /// stop request. Returns whether anything was stopped.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> bool {
        let Some(task_id) = self.cancel() else {
            return false;
        };
        if let Err(e) = self.service.stop(&task_id).await {
            warn!(task_id = %task_id, error = %e, "Remote stop request failed");
        }
        true
    }

    /// Close any open connection, whatever the session state.
    pub fn shutdown(&mut self) {
        if let Some(connection) = self.active.as_mut().and_then(|a| a.connection.as_mut()) {
            connection.close();
        }
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn running_task_id(&self) -> Option<String> {
        self.active
            .as_ref()
            .filter(|a| a.session.is_running())
            .map(|a| a.session.task_id().to_string())
    }

    /// The single terminal transition: append `entries`, move the session to
    /// `target`, close its connection. No-op unless the session is running.
    fn settle(
        &mut self,
        target: SessionState,
        entries: Vec<ChatEntry>,
        kind: Option<EventKind>,
    ) -> bool {
        let Some(task_id) = self.running_task_id() else {
            return false;
        };

        for entry in entries {
            let mut entry = entry.with_task(&task_id);
            if entry.event_kind.is_none() {
                entry.event_kind = kind;
            }
            self.append(entry);
        }

        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if !active.session.finish(target) {
            return false;
        }
        if let Some(mut connection) = active.connection.take() {
            connection.close();
        }

        let duration_ms = active
            .session
            .duration()
            .map(|d| d.num_milliseconds())
            .unwrap_or_default();
        info!(task_id = %task_id, state = %target, duration_ms, "Task session ended");
        let _ = self
            .updates
            .send(ClientUpdate::SessionChanged(active.session.clone()));
        true
    }

    fn append(&mut self, entry: ChatEntry) {
        let entry = self.log.push(entry).clone();
        let _ = self.updates.send(ClientUpdate::EntryAppended(entry));
    }

    fn diagnostic(&self, task_id: Option<&str>, traceback: &str) {
        error!(
            target: "taskstream::diagnostics",
            task_id = task_id.unwrap_or("-"),
            traceback,
            "Remote traceback"
        );
        let _ = self.updates.send(ClientUpdate::Diagnostic {
            task_id: task_id.map(str::to_string),
            traceback: traceback.to_string(),
        });
    }
}

impl Drop for TaskSessionClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One reachability probe: healthy response ⇒ `true`, anything else ⇒ `false`.
pub async fn probe(service: &dyn TaskService) -> bool {
    match service.health().await {
        Ok(healthy) => healthy,
        Err(e) => {
            debug!(error = %e, "Reachability probe failed");
            false
        }
    }
}
