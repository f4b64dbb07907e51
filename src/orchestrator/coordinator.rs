//! Timeline coordinator.
//!
//! Owns the session of the currently viewed run and sequences its sources: history first, then
//! the live channel, then polling if the live channel has not opened within the grace delay.
//! Every source task funnels its results into one channel tagged with the generation it was
//! issued for; [`TimelineCoordinator::apply`] is the single merge step and drops anything
//! whose generation is no longer current.

use crate::dedup::SeenSet;
use crate::engine::poll::{self, PollParams};
use crate::engine::{live, CloseReason, CurrentRun, LiveSignal, SyncError, TimelineBackend};
use crate::model::{
    RunSnapshot, SourcePhase, SyncConfig, TerminalStatus, TimelineEvent, TimelineUpdate,
};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// Invoked once per session when it completes.
pub type CompletionCallback = Box<dyn FnMut(&str, TerminalStatus) + Send>;

#[derive(Debug)]
pub(crate) enum SourceMessage {
    History(Result<Vec<TimelineEvent>, SyncError>),
    Live(LiveSignal),
    GraceElapsed,
    Poll(Result<Vec<TimelineEvent>, SyncError>),
}

/// A source result tagged with the generation of the run it belongs to.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub generation: u64,
    pub message: SourceMessage,
}

#[derive(Default)]
struct Updates(Option<UnboundedSender<TimelineUpdate>>);

impl Updates {
    fn send(&self, update: TimelineUpdate) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(update);
        }
    }
}

/// What a merge accepted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Merged {
    added: usize,
    /// An accepted event ends the run.
    terminal: bool,
}

#[derive(Default)]
struct SessionTasks {
    history: Option<JoinHandle<()>>,
    live: Option<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
    poll: Option<JoinHandle<()>>,
}

fn abort(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}

impl SessionTasks {
    fn stop_poll(&mut self) {
        abort(&mut self.poll);
    }

    fn stop_sources(&mut self) {
        abort(&mut self.live);
        abort(&mut self.grace);
        abort(&mut self.poll);
    }

    fn abort_all(&mut self) {
        abort(&mut self.history);
        self.stop_sources();
    }
}

/// Mutable state of the viewed run.
struct RunSession {
    run_id: String,
    generation: u64,
    events: Vec<TimelineEvent>,
    seen: SeenSet,
    connected: bool,
    complete: bool,
    terminal_status: Option<TerminalStatus>,
    last_error: Option<String>,
    source: SourcePhase,
    tasks: SessionTasks,
}

impl Drop for RunSession {
    fn drop(&mut self) {
        self.tasks.abort_all();
    }
}

impl RunSession {
    fn new(run_id: String, generation: u64) -> Self {
        Self {
            run_id,
            generation,
            events: Vec::new(),
            seen: SeenSet::default(),
            connected: false,
            complete: false,
            terminal_status: None,
            last_error: None,
            source: SourcePhase::LoadingHistory,
            tasks: SessionTasks::default(),
        }
    }

    /// Append every not-yet-seen event that belongs to this run.
    fn merge(&mut self, incoming: Vec<TimelineEvent>, updates: &Updates) -> Merged {
        let mut merged = Merged::default();
        for mut event in incoming {
            if event.run_id.is_empty() {
                event.run_id = self.run_id.clone();
            } else if event.run_id != self.run_id {
                tracing::warn!(
                    run_id = %self.run_id,
                    foreign = %event.run_id,
                    "ignoring event that belongs to another run"
                );
                continue;
            }
            if !self.seen.accept(&event) {
                tracing::trace!(
                    run_id = %self.run_id,
                    timestamp = %event.timestamp,
                    "duplicate event"
                );
                continue;
            }
            let index = self.events.len();
            merged.terminal |= event.kind.is_terminal();
            updates.send(TimelineUpdate::Appended {
                index,
                event: event.clone(),
            });
            self.events.push(event);
            merged.added += 1;
        }
        merged
    }

    fn has_terminal_event(&self) -> bool {
        self.events.iter().any(|e| e.kind.is_terminal())
    }

    fn set_connected(&mut self, connected: bool, updates: &Updates) {
        if self.connected != connected {
            self.connected = connected;
            updates.send(TimelineUpdate::Connectivity { connected });
        }
    }

    fn set_error(&mut self, message: String, updates: &Updates) {
        updates.send(TimelineUpdate::Status(message.clone()));
        self.last_error = Some(message);
    }

    /// First writer wins; later calls are no-ops.
    fn mark_complete(&mut self, updates: &Updates, on_complete: &mut Option<CompletionCallback>) {
        if self.complete {
            return;
        }
        let status = TerminalStatus::resolve(&self.events);
        self.complete = true;
        self.terminal_status = Some(status);
        self.source = SourcePhase::Finished;
        self.tasks.stop_sources();
        self.set_connected(false, updates);
        tracing::info!(run_id = %self.run_id, %status, events = self.events.len(), "run complete");
        updates.send(TimelineUpdate::Completed {
            run_id: self.run_id.clone(),
            status,
        });
        if let Some(callback) = on_complete.as_mut() {
            callback(&self.run_id, status);
        }
    }

    fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: Some(self.run_id.clone()),
            events: self.events.clone(),
            connected: self.connected,
            complete: self.complete,
            terminal_status: self.terminal_status,
            last_error: self.last_error.clone(),
            source: self.source,
        }
    }
}

/// Spawns source tasks whose results are routed back through the source channel.
struct TaskSpawner<B> {
    backend: B,
    current: CurrentRun,
    source_tx: UnboundedSender<Envelope>,
    grace_delay: Duration,
    poll_interval: Duration,
}

impl<B: TimelineBackend> TaskSpawner<B> {
    /// Forward a message only while `generation` is still the viewed run.
    fn sender(&self, generation: u64) -> impl Fn(SourceMessage) -> bool + Send + 'static {
        let tx = self.source_tx.clone();
        let current = self.current.clone();
        move |message| {
            current.is_current(generation) && tx.send(Envelope { generation, message }).is_ok()
        }
    }

    fn history(&self, run_id: &str, generation: u64) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let run_id = run_id.to_string();
        let send = self.sender(generation);
        tokio::spawn(async move {
            let result = backend.fetch_history(&run_id).await;
            if !send(SourceMessage::History(result)) {
                tracing::debug!(%run_id, generation, "history response discarded");
            }
        })
    }

    fn live(&self, run_id: &str, generation: u64) -> JoinHandle<()> {
        let frames = self.backend.open_stream(run_id);
        let send = self.sender(generation);
        tokio::spawn(live::run_live_channel(
            frames,
            run_id.to_string(),
            move |signal| send(SourceMessage::Live(signal)),
        ))
    }

    fn grace(&self, generation: u64) -> JoinHandle<()> {
        let delay = self.grace_delay;
        let send = self.sender(generation);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = send(SourceMessage::GraceElapsed);
        })
    }

    fn poll(&self, run_id: &str, generation: u64) -> JoinHandle<()> {
        let params = PollParams {
            backend: self.backend.clone(),
            run_id: run_id.to_string(),
            interval: self.poll_interval,
            generation,
            current: self.current.clone(),
        };
        let send = self.sender(generation);
        tokio::spawn(poll::run_poll_loop(params, move |result| {
            send(SourceMessage::Poll(result))
        }))
    }
}

pub struct TimelineCoordinator<B: TimelineBackend> {
    spawner: TaskSpawner<B>,
    current: CurrentRun,
    session: Option<RunSession>,
    source_rx: UnboundedReceiver<Envelope>,
    updates: Updates,
    on_complete: Option<CompletionCallback>,
}

impl<B: TimelineBackend> TimelineCoordinator<B> {
    pub fn new(backend: B, cfg: &SyncConfig) -> Self {
        let (source_tx, source_rx) = mpsc::unbounded_channel();
        let current = CurrentRun::default();
        Self {
            spawner: TaskSpawner {
                backend,
                current: current.clone(),
                source_tx,
                grace_delay: cfg.grace_delay,
                poll_interval: cfg.poll_interval,
            },
            current,
            session: None,
            source_rx,
            updates: Updates::default(),
            on_complete: None,
        }
    }

    /// Emit [`TimelineUpdate`]s to `tx` as the session changes.
    pub fn with_updates(mut self, tx: UnboundedSender<TimelineUpdate>) -> Self {
        self.updates = Updates(Some(tx));
        self
    }

    pub fn on_complete(&mut self, callback: impl FnMut(&str, TerminalStatus) + Send + 'static) {
        self.on_complete = Some(Box::new(callback));
    }

    pub fn generation(&self) -> u64 {
        self.current.get()
    }

    pub fn viewed_run(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.run_id.as_str())
    }

    pub fn is_complete(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.complete)
    }

    /// Switch the viewed run. The previous session's tasks are aborted and anything they
    /// already queued is discarded on arrival. Re-selecting the active run is a no-op.
    pub fn set_viewed_run(&mut self, run_id: Option<String>) {
        let run_id = run_id.filter(|id| !id.trim().is_empty());
        if let (Some(next), Some(active)) = (run_id.as_deref(), self.session.as_ref()) {
            if next == active.run_id {
                tracing::debug!(run_id = next, "run already viewed");
                return;
            }
        }

        let generation = self.current.advance();
        if let Some(old) = self.session.take() {
            tracing::info!(run_id = %old.run_id, "leaving run");
            drop(old);
        }
        self.updates.send(TimelineUpdate::Viewing {
            run_id: run_id.clone(),
        });

        let Some(run_id) = run_id else {
            return;
        };
        tracing::info!(%run_id, generation, "viewing run");
        let mut session = RunSession::new(run_id, generation);
        session.tasks.history = Some(self.spawner.history(&session.run_id, generation));
        self.session = Some(session);
    }

    /// Tear down the viewing context. The update feed is closed first, so listeners see the
    /// last real state rather than an idle view.
    pub fn shutdown(&mut self) {
        self.updates = Updates::default();
        self.set_viewed_run(None);
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.session
            .as_ref()
            .map(RunSession::snapshot)
            .unwrap_or_default()
    }

    pub(crate) async fn next_message(&mut self) -> Option<Envelope> {
        self.source_rx.recv().await
    }

    /// Merge one source result into the session, unless it is stale.
    pub(crate) fn apply(&mut self, envelope: Envelope) {
        let current = self.current.is_current(envelope.generation);
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(generation = envelope.generation, "no viewed run; dropping message");
            return;
        };
        if !current || session.generation != envelope.generation {
            tracing::debug!(
                run_id = %session.run_id,
                generation = envelope.generation,
                "dropping stale message"
            );
            return;
        }
        match envelope.message {
            SourceMessage::History(result) => self.on_history(result),
            SourceMessage::Live(signal) => self.on_live(signal),
            SourceMessage::GraceElapsed => self.on_grace_elapsed(),
            SourceMessage::Poll(result) => self.on_poll(result),
        }
    }

    fn on_history(&mut self, result: Result<Vec<TimelineEvent>, SyncError>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.tasks.history = None;
        match result {
            Ok(events) => {
                let added = session.merge(events, &self.updates).added;
                tracing::info!(
                    run_id = %session.run_id,
                    added,
                    seen = session.seen.len(),
                    "history loaded"
                );
            }
            Err(e) => {
                tracing::warn!(run_id = %session.run_id, error = %e, "history fetch failed");
                session.set_error(format!("Failed to load history: {e}"), &self.updates);
            }
        }
        if session.has_terminal_event() {
            session.mark_complete(&self.updates, &mut self.on_complete);
        }
        if session.complete {
            return;
        }
        session.source = SourcePhase::Live;
        session.tasks.live = Some(self.spawner.live(&session.run_id, session.generation));
        session.tasks.grace = Some(self.spawner.grace(session.generation));
    }

    fn on_live(&mut self, signal: LiveSignal) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.complete {
            return;
        }
        match signal {
            LiveSignal::Opened => {
                session.set_connected(true, &self.updates);
                session.last_error = None;
                if session.tasks.poll.is_some() {
                    tracing::info!(run_id = %session.run_id, "live channel open; polling stopped");
                    session.tasks.stop_poll();
                }
                session.source = SourcePhase::Live;
                self.updates.send(TimelineUpdate::Status("Live".into()));
            }
            LiveSignal::Event(event) => {
                if session.merge(vec![event], &self.updates).terminal {
                    session.mark_complete(&self.updates, &mut self.on_complete);
                }
            }
            LiveSignal::TransportError(message) => {
                tracing::warn!(run_id = %session.run_id, error = %message, "live channel error");
                session.set_connected(false, &self.updates);
                session.set_error("Connection lost, reconnecting…".into(), &self.updates);
            }
            LiveSignal::Closed(reason) => {
                abort(&mut session.tasks.live);
                session.set_connected(false, &self.updates);
                match reason {
                    CloseReason::CompleteSignal => {
                        session.mark_complete(&self.updates, &mut self.on_complete);
                    }
                    CloseReason::TerminalEvent if session.has_terminal_event() => {
                        session.mark_complete(&self.updates, &mut self.on_complete);
                    }
                    CloseReason::TerminalEvent | CloseReason::SourceEnded => {
                        tracing::warn!(
                            run_id = %session.run_id,
                            "live channel ended before completion"
                        );
                        session.set_error("Live stream ended".into(), &self.updates);
                        if session.tasks.poll.is_none() {
                            abort(&mut session.tasks.grace);
                            session.tasks.poll =
                                Some(self.spawner.poll(&session.run_id, session.generation));
                            session.source = SourcePhase::LiveWithPolling;
                        }
                    }
                }
            }
        }
    }

    fn on_grace_elapsed(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.tasks.grace = None;
        if session.complete || session.connected || session.tasks.poll.is_some() {
            return;
        }
        tracing::info!(
            run_id = %session.run_id,
            interval = ?self.spawner.poll_interval,
            "live channel not open after grace delay; polling history"
        );
        session.tasks.poll = Some(self.spawner.poll(&session.run_id, session.generation));
        session.source = SourcePhase::LiveWithPolling;
        self.updates.send(TimelineUpdate::Status(format!(
            "Live stream unavailable, polling every {}",
            humantime::format_duration(self.spawner.poll_interval)
        )));
    }

    fn on_poll(&mut self, result: Result<Vec<TimelineEvent>, SyncError>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.complete || session.tasks.poll.is_none() {
            return;
        }
        match result {
            Ok(events) => {
                if !poll::has_grown(events.len(), session.events.len()) {
                    return;
                }
                let added = session.merge(events, &self.updates).added;
                tracing::debug!(run_id = %session.run_id, added, "poll merged");
                if session.has_terminal_event() {
                    session.mark_complete(&self.updates, &mut self.on_complete);
                }
            }
            Err(e) => {
                tracing::warn!(run_id = %session.run_id, error = %e, "poll fetch failed");
                session.set_error(format!("Poll failed: {e}"), &self.updates);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SseFrame;
    use crate::model::{event, EventKind};
    use futures::channel::mpsc as fmpsc;
    use futures::future::BoxFuture;
    use futures::stream::BoxStream;
    use futures::{FutureExt, StreamExt};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    type Reply = Result<Vec<TimelineEvent>, String>;

    #[derive(Default)]
    struct Script {
        history: HashMap<String, Reply>,
        gates: HashMap<String, Arc<Notify>>,
        streams: HashMap<String, fmpsc::UnboundedSender<SseFrame>>,
        history_calls: HashMap<String, usize>,
        opened: HashMap<String, usize>,
    }

    /// In-memory backend whose history replies and stream frames are scripted by the test.
    #[derive(Clone, Default)]
    struct ScriptedBackend(Arc<Mutex<Script>>);

    impl ScriptedBackend {
        fn set_history(&self, run_id: &str, reply: Reply) {
            self.0.lock().unwrap().history.insert(run_id.into(), reply);
        }

        fn gate(&self, run_id: &str) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            self.0
                .lock()
                .unwrap()
                .gates
                .insert(run_id.into(), gate.clone());
            gate
        }

        fn push(&self, run_id: &str, frame: SseFrame) -> bool {
            let script = self.0.lock().unwrap();
            script
                .streams
                .get(run_id)
                .is_some_and(|tx| tx.unbounded_send(frame).is_ok())
        }

        fn history_calls(&self, run_id: &str) -> usize {
            let script = self.0.lock().unwrap();
            script.history_calls.get(run_id).copied().unwrap_or(0)
        }

        fn opened(&self, run_id: &str) -> usize {
            let script = self.0.lock().unwrap();
            script.opened.get(run_id).copied().unwrap_or(0)
        }
    }

    impl TimelineBackend for ScriptedBackend {
        fn fetch_history(
            &self,
            run_id: &str,
        ) -> BoxFuture<'static, Result<Vec<TimelineEvent>, SyncError>> {
            let (reply, gate) = {
                let mut script = self.0.lock().unwrap();
                *script.history_calls.entry(run_id.into()).or_default() += 1;
                (
                    script.history.get(run_id).cloned().unwrap_or(Ok(Vec::new())),
                    script.gates.get(run_id).cloned(),
                )
            };
            async move {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                reply.map_err(|url| SyncError::FetchStatus { status: 500, url })
            }
            .boxed()
        }

        fn open_stream(&self, run_id: &str) -> BoxStream<'static, SseFrame> {
            let (tx, rx) = fmpsc::unbounded();
            let mut script = self.0.lock().unwrap();
            *script.opened.entry(run_id.into()).or_default() += 1;
            script.streams.insert(run_id.into(), tx);
            rx.boxed()
        }
    }

    fn live(run_id: &str, kind: &str, ts: &str) -> SseFrame {
        SseFrame::Message {
            name: kind.into(),
            data: serde_json::json!({
                "run_id": run_id,
                "event_type": kind,
                "title": kind,
                "description": "",
                "timestamp": ts,
            })
            .to_string(),
        }
    }

    fn coordinator(backend: &ScriptedBackend) -> TimelineCoordinator<ScriptedBackend> {
        TimelineCoordinator::new(backend.clone(), &SyncConfig::default())
    }

    fn count_completions(
        coord: &mut TimelineCoordinator<ScriptedBackend>,
    ) -> Arc<AtomicUsize> {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        coord.on_complete(move |_, _| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        fired
    }

    /// Apply everything the sources have produced so far.
    async fn settle(coord: &mut TimelineCoordinator<ScriptedBackend>) {
        loop {
            tokio::task::yield_now().await;
            match tokio::time::timeout(Duration::from_millis(1), coord.next_message()).await {
                Ok(Some(envelope)) => coord.apply(envelope),
                _ => break,
            }
        }
    }

    fn timestamps(snapshot: &RunSnapshot) -> Vec<&str> {
        snapshot.events.iter().map(|e| e.timestamp.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn live_events_complete_an_empty_history() {
        let backend = ScriptedBackend::default();
        let mut coord = coordinator(&backend);
        let fired = count_completions(&mut coord);

        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;
        assert_eq!(backend.opened("r1"), 1);
        assert_eq!(coord.snapshot().source, SourcePhase::Live);

        backend.push("r1", SseFrame::Open);
        settle(&mut coord).await;
        assert!(coord.snapshot().connected);

        backend.push("r1", live("r1", "mission_start", "t1"));
        backend.push("r1", live("r1", "success", "t2"));
        settle(&mut coord).await;

        let snap = coord.snapshot();
        assert_eq!(timestamps(&snap), vec!["t1", "t2"]);
        assert_eq!(snap.events[0].kind, EventKind::MissionStart);
        assert!(snap.complete);
        assert_eq!(snap.terminal_status, Some(TerminalStatus::Success));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_history_completes_without_live_channel() {
        let backend = ScriptedBackend::default();
        backend.set_history(
            "r1",
            Ok(vec![event("mission_start", "t1"), event("failure", "t2")]),
        );
        let mut coord = coordinator(&backend);
        let fired = count_completions(&mut coord);

        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;

        let snap = coord.snapshot();
        assert!(snap.complete);
        assert_eq!(snap.terminal_status, Some(TerminalStatus::Failure));
        assert_eq!(snap.source, SourcePhase::Finished);
        assert_eq!(backend.opened("r1"), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle(&mut coord).await;
        assert_eq!(backend.history_calls("r1"), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_does_not_append_an_unchanged_history() {
        let backend = ScriptedBackend::default();
        backend.set_history(
            "r1",
            Ok(vec![event("mission_start", "t1"), event("cloning", "t2")]),
        );
        let mut coord = coordinator(&backend);
        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;
        assert_eq!(coord.snapshot().events.len(), 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle(&mut coord).await;
        assert_eq!(coord.snapshot().source, SourcePhase::LiveWithPolling);

        tokio::time::sleep(Duration::from_secs(4)).await;
        settle(&mut coord).await;
        assert_eq!(backend.history_calls("r1"), 2);
        assert_eq!(timestamps(&coord.snapshot()), vec!["t1", "t2"]);

        backend.set_history(
            "r1",
            Ok(vec![
                event("mission_start", "t1"),
                event("cloning", "t2"),
                event("thinking", "t3"),
            ]),
        );
        tokio::time::sleep(Duration::from_secs(3)).await;
        settle(&mut coord).await;
        assert_eq!(timestamps(&coord.snapshot()), vec!["t1", "t2", "t3"]);
        assert!(!coord.snapshot().complete);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_detects_completion() {
        let backend = ScriptedBackend::default();
        let mut coord = coordinator(&backend);
        let fired = count_completions(&mut coord);
        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle(&mut coord).await;
        backend.set_history(
            "r1",
            Ok(vec![event("mission_start", "t1"), event("mission_end", "t2")]),
        );
        tokio::time::sleep(Duration::from_secs(4)).await;
        settle(&mut coord).await;

        let snap = coord.snapshot();
        assert!(snap.complete);
        assert_eq!(snap.terminal_status, Some(TerminalStatus::Failure));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Poll and live are torn down.
        let calls = backend.history_calls("r1");
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle(&mut coord).await;
        assert_eq!(backend.history_calls("r1"), calls);
        assert!(!backend.push("r1", SseFrame::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn switching_runs_discards_the_pending_history() {
        let backend = ScriptedBackend::default();
        let gate = backend.gate("r1");
        backend.set_history("r1", Ok(vec![event("mission_start", "a1")]));
        backend.set_history("r2", Ok(vec![event("mission_start", "b1")]));
        let mut coord = coordinator(&backend);

        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;
        coord.set_viewed_run(Some("r2".into()));
        gate.notify_one();
        settle(&mut coord).await;

        let snap = coord.snapshot();
        assert_eq!(snap.run_id.as_deref(), Some("r2"));
        assert_eq!(timestamps(&snap), vec!["b1"]);
        assert!(snap.events.iter().all(|e| e.run_id == "r2"));
        assert_eq!(backend.opened("r1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_envelopes_are_dropped() {
        let backend = ScriptedBackend::default();
        let mut coord = coordinator(&backend);
        coord.set_viewed_run(Some("r1".into()));
        let old = coord.generation();
        settle(&mut coord).await;
        coord.set_viewed_run(Some("r2".into()));
        settle(&mut coord).await;

        coord.apply(Envelope {
            generation: old,
            message: SourceMessage::Live(LiveSignal::Event(event("success", "a9"))),
        });
        coord.apply(Envelope {
            generation: old,
            message: SourceMessage::History(Ok(vec![event("thinking", "a1")])),
        });

        let snap = coord.snapshot();
        assert!(snap.events.is_empty());
        assert!(!snap.complete);
    }

    #[tokio::test(start_paused = true)]
    async fn history_and_live_overlap_is_deduplicated() {
        let backend = ScriptedBackend::default();
        backend.set_history("r1", Ok(vec![event("mission_start", "t1")]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut coord = coordinator(&backend).with_updates(tx);
        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;

        backend.push("r1", SseFrame::Open);
        backend.push("r1", live("r1", "mission_start", "t1"));
        backend.push("r1", live("r1", "thinking", "t2"));
        backend.push("r1", live("r1", "thinking", "t2"));
        settle(&mut coord).await;

        assert_eq!(timestamps(&coord.snapshot()), vec!["t1", "t2"]);

        let mut indices = Vec::new();
        while let Ok(update) = rx.try_recv() {
            if let TimelineUpdate::Appended { index, .. } = update {
                indices.push(index);
            }
        }
        assert_eq!(indices, vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn reselecting_the_same_run_is_a_noop() {
        let backend = ScriptedBackend::default();
        let mut coord = coordinator(&backend);
        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;
        let generation = coord.generation();

        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;

        assert_eq!(coord.generation(), generation);
        assert_eq!(backend.history_calls("r1"), 1);
        assert_eq!(backend.opened("r1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_fires_once() {
        let backend = ScriptedBackend::default();
        let mut coord = coordinator(&backend);
        let fired = count_completions(&mut coord);
        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;

        backend.push("r1", live("r1", "success", "t1"));
        settle(&mut coord).await;
        let generation = coord.generation();
        for (kind, ts) in [("failure", "t2"), ("mission_end", "t3")] {
            coord.apply(Envelope {
                generation,
                message: SourceMessage::Live(LiveSignal::Event(event(kind, ts))),
            });
        }
        coord.apply(Envelope {
            generation,
            message: SourceMessage::Live(LiveSignal::Closed(CloseReason::CompleteSignal)),
        });

        let snap = coord.snapshot();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(snap.terminal_status, Some(TerminalStatus::Success));
        assert_eq!(timestamps(&snap), vec!["t1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn live_open_stops_polling() {
        let backend = ScriptedBackend::default();
        backend.set_history("r1", Ok(vec![event("mission_start", "t1")]));
        let mut coord = coordinator(&backend);
        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle(&mut coord).await;
        assert_eq!(coord.snapshot().source, SourcePhase::LiveWithPolling);

        backend.push("r1", SseFrame::Open);
        settle(&mut coord).await;
        let snap = coord.snapshot();
        assert!(snap.connected);
        assert_eq!(snap.source, SourcePhase::Live);

        let calls = backend.history_calls("r1");
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle(&mut coord).await;
        assert_eq!(backend.history_calls("r1"), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_toggle_connectivity() {
        let backend = ScriptedBackend::default();
        let mut coord = coordinator(&backend);
        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;

        backend.push("r1", SseFrame::Open);
        backend.push("r1", SseFrame::Error("connection reset".into()));
        settle(&mut coord).await;
        let snap = coord.snapshot();
        assert!(!snap.connected);
        assert!(snap.last_error.is_some());

        backend.push("r1", SseFrame::Open);
        settle(&mut coord).await;
        let snap = coord.snapshot();
        assert!(snap.connected);
        assert_eq!(snap.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn history_failure_still_opens_live_channel() {
        let backend = ScriptedBackend::default();
        backend.set_history("r1", Err("http://backend/events/history/r1".into()));
        let mut coord = coordinator(&backend);
        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;

        let snap = coord.snapshot();
        assert!(snap.events.is_empty());
        assert!(snap.last_error.is_some());
        assert_eq!(backend.opened("r1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ended_stream_falls_back_to_polling() {
        let backend = ScriptedBackend::default();
        let mut coord = coordinator(&backend);
        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;

        backend.push("r1", SseFrame::Open);
        settle(&mut coord).await;
        // Dropping the sender ends the scripted stream.
        backend.0.lock().unwrap().streams.remove("r1");
        settle(&mut coord).await;

        let snap = coord.snapshot();
        assert!(!snap.connected);
        assert_eq!(snap.source, SourcePhase::LiveWithPolling);
    }

    #[tokio::test(start_paused = true)]
    async fn events_for_another_run_are_rejected() {
        let backend = ScriptedBackend::default();
        let mut coord = coordinator(&backend);
        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;

        backend.push("r1", live("r0", "thinking", "t1"));
        backend.push("r1", live("r1", "thinking", "t2"));
        settle(&mut coord).await;
        assert_eq!(timestamps(&coord.snapshot()), vec!["t2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_event_for_another_run_does_not_complete() {
        let backend = ScriptedBackend::default();
        let mut coord = coordinator(&backend);
        let fired = count_completions(&mut coord);
        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;

        backend.push("r1", SseFrame::Open);
        backend.push("r1", live("r0", "failure", "t1"));
        settle(&mut coord).await;

        let mut foreign = event("failure", "t2");
        foreign.run_id = "r0".into();
        let generation = coord.generation();
        coord.apply(Envelope {
            generation,
            message: SourceMessage::Live(LiveSignal::Event(foreign)),
        });
        coord.apply(Envelope {
            generation,
            message: SourceMessage::Live(LiveSignal::Closed(CloseReason::TerminalEvent)),
        });

        let snap = coord.snapshot();
        assert!(snap.events.is_empty());
        assert!(!snap.complete);
        assert_eq!(snap.terminal_status, None);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(snap.source, SourcePhase::LiveWithPolling);
    }

    #[tokio::test(start_paused = true)]
    async fn live_redelivery_after_polling_is_deduplicated() {
        let backend = ScriptedBackend::default();
        backend.set_history("r1", Ok(vec![event("mission_start", "t1")]));
        let mut coord = coordinator(&backend);
        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle(&mut coord).await;
        backend.set_history(
            "r1",
            Ok(vec![event("mission_start", "t1"), event("cloning", "t2")]),
        );
        tokio::time::sleep(Duration::from_secs(4)).await;
        settle(&mut coord).await;
        assert_eq!(timestamps(&coord.snapshot()), vec!["t1", "t2"]);

        // The recovered channel replays what polling already delivered.
        backend.push("r1", SseFrame::Open);
        backend.push("r1", live("r1", "mission_start", "t1"));
        backend.push("r1", live("r1", "cloning", "t2"));
        backend.push("r1", live("r1", "thinking", "t3"));
        settle(&mut coord).await;

        let snap = coord.snapshot();
        assert_eq!(timestamps(&snap), vec!["t1", "t2", "t3"]);
        assert!(snap.connected);
        assert_eq!(snap.source, SourcePhase::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_events_only_grow() {
        let backend = ScriptedBackend::default();
        backend.set_history("r1", Ok(vec![event("mission_start", "t1")]));
        let mut coord = coordinator(&backend);
        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;

        let mut previous = coord.snapshot().events;
        for (kind, ts) in [("thinking", "t2"), ("thinking", "t1"), ("verifying", "t3")] {
            backend.push("r1", live("r1", kind, ts));
            settle(&mut coord).await;
            let now = coord.snapshot().events;
            assert!(now.len() >= previous.len());
            assert_eq!(&now[..previous.len()], &previous[..]);
            previous = now;
        }
        assert_eq!(previous.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_the_view_goes_idle() {
        let backend = ScriptedBackend::default();
        let mut coord = coordinator(&backend);
        coord.set_viewed_run(Some("r1".into()));
        settle(&mut coord).await;

        coord.set_viewed_run(None);
        assert_eq!(coord.viewed_run(), None);
        settle(&mut coord).await;
        assert!(!backend.push("r1", SseFrame::Open));

        let snap = coord.snapshot();
        assert_eq!(snap.run_id, None);
        assert_eq!(snap.source, SourcePhase::Idle);
    }
}
