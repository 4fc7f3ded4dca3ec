//! Event loop that owns a [`TaskSessionClient`] and serializes everything
//! that touches it: user commands, stream signals, probe results and the
//! completions of in-flight requests.
//!
//! Network calls run on spawned tasks and report back as reactions, so a
//! slow `/run` or `/stop` never delays stream handling. The loop itself is
//! the only place the client is mutated.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{
    ClientSnapshot, ClientUpdate, SignalReceiver, SubmitOutcome, TaskSessionClient, probe,
};
use crate::error::ServiceError;

/// Requests accepted by the driver loop.
#[derive(Debug)]
pub enum ClientCommand {
    Submit(String),
    Stop,
    Snapshot(oneshot::Sender<ClientSnapshot>),
    Shutdown,
}

/// Completions of work the loop spawned.
enum Reaction {
    Submitted(Result<String, ServiceError>),
    Probed(bool),
    Stopped(String, Result<(), ServiceError>),
}

/// Cheap, cloneable front door to a running driver.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
    updates: broadcast::Sender<ClientUpdate>,
}

impl ClientHandle {
    /// Queue a task submission. Rejections surface as the absence of a
    /// `SessionChanged` update, exactly like the synchronous API.
    pub fn submit(&self, text: impl Into<String>) -> bool {
        self.commands.send(ClientCommand::Submit(text.into())).is_ok()
    }

    pub fn stop(&self) -> bool {
        self.commands.send(ClientCommand::Stop).is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.commands.send(ClientCommand::Shutdown).is_ok()
    }

    /// Current model, or `None` once the driver has exited.
    pub async fn snapshot(&self) -> Option<ClientSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(ClientCommand::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientUpdate> {
        self.updates.subscribe()
    }
}

/// Follows a driver's updates without dropping chat entries.
///
/// The update channel is bounded and discards its oldest updates for a
/// receiver that falls behind. On a lag the follower reads the missed entries
/// back from a snapshot, then skips their copies still queued in the channel.
pub struct EntryFollower {
    handle: ClientHandle,
    updates: broadcast::Receiver<ClientUpdate>,
    /// Log entries already handed to the caller.
    seen: usize,
    recovered: HashSet<String>,
    pending: VecDeque<ClientUpdate>,
}

impl EntryFollower {
    /// Follow `updates`, given that the caller already holds the first
    /// `seen` entries of the log.
    pub fn new(handle: ClientHandle, updates: broadcast::Receiver<ClientUpdate>, seen: usize) -> Self {
        Self {
            handle,
            updates,
            seen,
            recovered: HashSet::new(),
            pending: VecDeque::new(),
        }
    }

    /// Next update, or `None` once the driver is gone.
    pub async fn next(&mut self) -> Option<ClientUpdate> {
        loop {
            if let Some(update) = self.pending.pop_front() {
                return Some(update);
            }
            match self.updates.recv().await {
                Ok(ClientUpdate::EntryAppended(entry)) => {
                    if self.recovered.remove(&entry.id) {
                        continue;
                    }
                    self.seen += 1;
                    return Some(ClientUpdate::EntryAppended(entry));
                }
                Ok(update) => return Some(update),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, seen = self.seen, "Update stream lagged, reading entries back");
                    let snapshot = self.handle.snapshot().await?;
                    self.catch_up(snapshot);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn catch_up(&mut self, snapshot: ClientSnapshot) {
        for entry in snapshot.entries.into_iter().skip(self.seen) {
            self.seen += 1;
            self.recovered.insert(entry.id.clone());
            self.pending.push_back(ClientUpdate::EntryAppended(entry));
        }
        if let Some(session) = snapshot.session {
            self.pending.push_back(ClientUpdate::SessionChanged(session));
        }
    }
}

/// Start the driver loop.
///
/// Reachability is probed immediately and then every `probe_interval`.
/// The loop exits on [`ClientHandle::shutdown`], when every handle is
/// dropped, or when `cancel` fires; the join handle yields the client back
/// with its connection closed.
pub fn spawn_client(
    client: TaskSessionClient,
    signals: SignalReceiver,
    probe_interval: Duration,
    cancel: CancellationToken,
) -> (ClientHandle, JoinHandle<TaskSessionClient>) {
    let (commands, command_rx) = mpsc::unbounded_channel();
    let handle = ClientHandle {
        commands,
        updates: client.update_sender(),
    };
    let join = tokio::spawn(drive(client, signals, command_rx, probe_interval, cancel));
    (handle, join)
}

async fn drive(
    mut client: TaskSessionClient,
    mut signals: SignalReceiver,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    probe_interval: Duration,
    cancel: CancellationToken,
) -> TaskSessionClient {
    let (reaction_tx, mut reactions) = mpsc::unbounded_channel::<Reaction>();
    let mut ticker = tokio::time::interval(probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut probing = false;

    info!(interval_secs = probe_interval.as_secs(), "Task session client started");

    loop {
        tokio::select! {
            // Poll order: cancel, commands, stream signals, reactions, tick.
            biased;

            _ = cancel.cancelled() => {
                debug!("Task session client cancelled");
                break;
            }

            command = commands.recv() => match command {
                Some(ClientCommand::Submit(text)) => match client.begin_submit(&text) {
                    Ok(request) => {
                        let service = client.service();
                        let tx = reaction_tx.clone();
                        tokio::spawn(async move {
                            let result = service.run(&request).await;
                            let _ = tx.send(Reaction::Submitted(result));
                        });
                    }
                    Err(rejection) => debug!(?rejection, "Submission ignored"),
                },
                Some(ClientCommand::Stop) => {
                    if let Some(task_id) = client.cancel() {
                        let service = client.service();
                        let tx = reaction_tx.clone();
                        tokio::spawn(async move {
                            let result = service.stop(&task_id).await;
                            let _ = tx.send(Reaction::Stopped(task_id, result));
                        });
                    }
                }
                Some(ClientCommand::Snapshot(reply)) => {
                    let _ = reply.send(client.snapshot());
                }
                Some(ClientCommand::Shutdown) | None => break,
            },

            Some(signal) = signals.recv() => {
                client.handle_signal(signal);
            }

            Some(reaction) = reactions.recv() => match reaction {
                Reaction::Submitted(result) => {
                    if let SubmitOutcome::Started(task_id) = client.finish_submit(result) {
                        debug!(task_id = %task_id, "Session opened");
                    }
                }
                Reaction::Probed(reachable) => {
                    probing = false;
                    client.set_reachable(reachable);
                }
                Reaction::Stopped(task_id, result) => {
                    if let Err(e) = result {
                        warn!(task_id = %task_id, error = %e, "Remote stop request failed");
                    }
                }
            },

            _ = ticker.tick() => {
                if !probing {
                    probing = true;
                    let service = client.service();
                    let tx = reaction_tx.clone();
                    tokio::spawn(async move {
                        let reachable = probe(service.as_ref()).await;
                        let _ = tx.send(Reaction::Probed(reachable));
                    });
                }
            }
        }
    }

    client.shutdown();
    info!("Task session client stopped");
    client
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{FakeService, RunReply};
    use crate::config::RunSettings;
    use crate::service::StreamSignal;
    use crate::session::SessionState;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    const PROBE: Duration = Duration::from_secs(3600);

    async fn wait_for<F>(rx: &mut broadcast::Receiver<ClientUpdate>, mut pred: F) -> ClientUpdate
    where
        F: FnMut(&ClientUpdate) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(update) if pred(&update) => return update,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("updates closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for update")
    }

    /// Pull updates through `follower`, recording entry texts, until `done`.
    async fn follow_until<F>(follower: &mut EntryFollower, texts: &mut Vec<String>, mut done: F)
    where
        F: FnMut(&ClientUpdate) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let update = follower.next().await.expect("updates closed");
                if let ClientUpdate::EntryAppended(entry) = &update {
                    texts.push(entry.text.clone());
                }
                if done(&update) {
                    return;
                }
            }
        })
        .await
        .expect("timed out following updates")
    }

    fn start(service: &std::sync::Arc<FakeService>) -> (ClientHandle, JoinHandle<TaskSessionClient>) {
        let (client, signals) = TaskSessionClient::new(service.clone(), RunSettings::default());
        spawn_client(client, signals, PROBE, CancellationToken::new())
    }

    #[tokio::test]
    async fn probes_on_start_then_runs_a_task() {
        let service = FakeService::new(RunReply::Accept("T1"));
        let (handle, join) = start(&service);
        let mut updates = handle.subscribe();

        wait_for(&mut updates, |u| *u == ClientUpdate::ReachabilityChanged(true)).await;
        assert!(handle.submit("write hello world"));
        wait_for(&mut updates, |u| matches!(u, ClientUpdate::SessionChanged(s) if s.is_running())).await;

        let sink = service.opened.lock().unwrap()[0].2.clone();
        sink.send(StreamSignal::payload("T1", r#"{"type":"step","message":"working"}"#))
            .unwrap();
        sink.send(StreamSignal::payload("T1", r#"{"type":"end"}"#)).unwrap();
        wait_for(&mut updates, |u| {
            matches!(u, ClientUpdate::SessionChanged(s) if s.state() == SessionState::Completed)
        })
        .await;

        let snapshot = handle.snapshot().await.unwrap();
        let texts: Vec<&str> = snapshot.entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["write hello world", "working"]);

        handle.shutdown();
        let client = join.await.unwrap();
        assert!(!client.has_connection());
    }

    #[tokio::test]
    async fn stop_command_tears_down_and_calls_service() {
        let service = FakeService::new(RunReply::Accept("T1"));
        let (handle, join) = start(&service);
        let mut updates = handle.subscribe();

        wait_for(&mut updates, |u| *u == ClientUpdate::ReachabilityChanged(true)).await;
        handle.submit("long task");
        wait_for(&mut updates, |u| matches!(u, ClientUpdate::SessionChanged(s) if s.is_running())).await;

        handle.stop();
        handle.stop();
        wait_for(&mut updates, |u| {
            matches!(u, ClientUpdate::SessionChanged(s) if s.state() == SessionState::Stopped)
        })
        .await;
        assert!(service.token(0).is_cancelled());

        tokio::time::timeout(Duration::from_secs(5), async {
            while service.stops.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        handle.shutdown();
        join.await.unwrap();
        assert_eq!(*service.stops.lock().unwrap(), vec!["T1".to_string()]);
    }

    #[tokio::test]
    async fn unreachable_service_ignores_submission() {
        let service = FakeService::new(RunReply::Accept("T1"));
        service.healthy.store(false, Ordering::SeqCst);
        let (handle, join) = start(&service);

        handle.submit("hello");
        let snapshot = handle.snapshot().await.unwrap();
        assert!(!snapshot.reachable);

        handle.shutdown();
        let client = join.await.unwrap();
        assert!(client.entries().is_empty());
        assert!(service.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_token_ends_loop_and_closes_stream() {
        let service = FakeService::new(RunReply::Accept("T1"));
        let (client, signals) = TaskSessionClient::new(service.clone(), RunSettings::default());
        let cancel = CancellationToken::new();
        let (handle, join) = spawn_client(client, signals, PROBE, cancel.clone());
        let mut updates = handle.subscribe();

        wait_for(&mut updates, |u| *u == ClientUpdate::ReachabilityChanged(true)).await;
        handle.submit("task");
        wait_for(&mut updates, |u| matches!(u, ClientUpdate::SessionChanged(_))).await;

        cancel.cancel();
        let client = join.await.unwrap();
        assert!(service.token(0).is_cancelled());
        assert_eq!(client.session().unwrap().state(), SessionState::Running);
        assert!(handle.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn follower_reads_back_entries_the_channel_dropped() {
        let service = FakeService::new(RunReply::Accept("T1"));
        let (handle, join) = start(&service);
        let mut follower = EntryFollower::new(handle.clone(), handle.subscribe(), 0);
        let mut texts = Vec::new();

        follow_until(&mut follower, &mut texts, |u| *u == ClientUpdate::ReachabilityChanged(true)).await;
        handle.submit("many steps");
        follow_until(&mut follower, &mut texts, |u| {
            matches!(u, ClientUpdate::SessionChanged(s) if s.is_running())
        })
        .await;

        let steps: Vec<_> = (0..300).map(|i| json!({"llm_response": format!("step {i}")})).collect();
        let frame = json!({
            "type": "complete",
            "task_id": "T1",
            "result": {"output": "done", "success": true, "steps": steps},
        });
        let sink = service.opened.lock().unwrap()[0].2.clone();
        sink.send(StreamSignal::payload("T1", frame.to_string())).unwrap();
        follow_until(&mut follower, &mut texts, |u| {
            matches!(u, ClientUpdate::SessionChanged(s) if s.state() == SessionState::Completed)
        })
        .await;

        assert_eq!(texts.len(), 302);
        assert_eq!(texts[0], "many steps");
        for (i, text) in texts[1..301].iter().enumerate() {
            assert_eq!(*text, format!("step {i}"));
        }
        assert!(texts[301].contains("Steps: 300"));

        handle.shutdown();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn stop_runs_before_queued_stream_frames() {
        let service = FakeService::new(RunReply::Accept("T1"));
        let (handle, join) = start(&service);
        let mut updates = handle.subscribe();

        wait_for(&mut updates, |u| *u == ClientUpdate::ReachabilityChanged(true)).await;
        handle.submit("long task");
        wait_for(&mut updates, |u| matches!(u, ClientUpdate::SessionChanged(s) if s.is_running())).await;

        let sink = service.opened.lock().unwrap()[0].2.clone();
        for i in 0..500 {
            let frame = json!({"type": "step", "task_id": "T1", "message": format!("step {i}")});
            sink.send(StreamSignal::payload("T1", frame.to_string())).unwrap();
        }
        handle.stop();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.session.unwrap().state(), SessionState::Stopped);
        let texts: Vec<&str> = snapshot.entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["long task", "Task stopped by user"]);

        handle.shutdown();
        join.await.unwrap();
    }
}
