//! One managed assistant process with its history, status and attached viewers.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tmuxdeck_terminal::{Classifier, Status, Verdict};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer::OutputRing;
use crate::config::Config;
use crate::error::{SessionError, SessionResult};
use crate::event::{Chunk, SessionEvent, StatusChange};
use crate::process::{terminate, ProcessControl, ProcessEvent};
use crate::subscriber::{Deliver, Subscriber, SubscriberId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Starting,
    Running,
    Restarting,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub display_name: String,
    pub working_directory: PathBuf,
    pub multiplexer_name: String,
    pub status: Status,
    pub lifecycle: Lifecycle,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub subscribers: usize,
    pub buffered_chunks: usize,
    pub buffered_bytes: usize,
    pub last_seq: Option<u64>,
}

pub struct Session {
    id: String,
    display_name: String,
    working_directory: PathBuf,
    multiplexer_name: String,
    created_at: DateTime<Utc>,
    control: Arc<dyn ProcessControl>,
    state: Mutex<SessionState>,
    status_tx: broadcast::Sender<StatusChange>,
    stopped_tx: watch::Sender<bool>,
    stopped_rx: watch::Receiver<bool>,
    ready_delay: Duration,
    kill_grace: Duration,
    this: Weak<Session>,
}

struct SessionState {
    ring: OutputRing,
    next_seq: u64,
    subscribers: Vec<Subscriber>,
    classifier: Classifier,
    status_changed_at: DateTime<Utc>,
    lifecycle: Lifecycle,
    exited: bool,
    exit_code: Option<i32>,
    stop_requested: bool,
    ready_timer: Option<JoinHandle<()>>,
    timer_generation: u64,
}

/// Everything needed to construct a [`Session`] around a spawned process.
pub struct SessionParts {
    pub id: String,
    pub display_name: String,
    pub working_directory: PathBuf,
    pub multiplexer_name: String,
    pub control: Arc<dyn ProcessControl>,
}

// The classifier works in std instants; going through tokio's clock keeps paused-time
// tests deterministic.
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

impl Session {
    pub fn new(
        parts: SessionParts,
        config: &Config,
        status_tx: broadcast::Sender<StatusChange>,
    ) -> Arc<Self> {
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let classifier = Classifier::with_patterns(
            config.status.patterns.clone(),
            config.status.flap_window(),
        );

        Arc::new_cyclic(|this| Self {
            id: parts.id,
            display_name: parts.display_name,
            working_directory: parts.working_directory,
            multiplexer_name: parts.multiplexer_name,
            created_at: Utc::now(),
            control: parts.control,
            state: Mutex::new(SessionState {
                ring: OutputRing::from_config(&config.buffer),
                next_seq: 0,
                subscribers: Vec::new(),
                classifier,
                status_changed_at: Utc::now(),
                lifecycle: Lifecycle::Starting,
                exited: false,
                exit_code: None,
                stop_requested: false,
                ready_timer: None,
                timer_generation: 0,
            }),
            status_tx,
            stopped_tx,
            stopped_rx,
            ready_delay: config.status.ready_delay(),
            kill_grace: config.process.kill_grace(),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn status(&self) -> Status {
        self.state.lock().classifier.status()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state.lock();
        SessionInfo {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            working_directory: self.working_directory.clone(),
            multiplexer_name: self.multiplexer_name.clone(),
            status: state.classifier.status(),
            lifecycle: state.lifecycle,
            pid: self.control.pid(),
            exit_code: state.exit_code,
            created_at: self.created_at,
            subscribers: state.subscribers.len(),
            buffered_chunks: state.ring.len(),
            buffered_bytes: state.ring.total_bytes(),
            last_seq: state.ring.last_seq(),
        }
    }

    /// Process is up; publish `running`.
    pub fn mark_running(&self) {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Starting {
            return;
        }
        state.lifecycle = Lifecycle::Running;
        self.transition(&mut state, Status::Running);
    }

    /// Replay buffered history, then add the subscriber to the live set.
    /// `since` is the last seq the subscriber already has, for reconnects.
    ///
    /// Replay and registration happen under the session lock, so no live chunk can
    /// overtake the history and none is delivered twice.
    pub fn attach(&self, sink: Arc<dyn Deliver>, since: Option<u64>) -> SubscriberId {
        let subscriber = Subscriber::new(sink);
        let id = subscriber.id;
        let mut state = self.state.lock();

        let replay = state.ring.replay(since);
        let replayed = replay.len();
        for chunk in &replay {
            if let Err(e) = subscriber.deliver(SessionEvent::from(chunk)) {
                debug!("[session:{}] Subscriber {} failed during replay: {}", self.id, id, e);
                subscriber.close();
                return id;
            }
        }

        if state.exited {
            let _ = subscriber.deliver(SessionEvent::Exit {
                code: state.exit_code,
            });
            subscriber.close();
            return id;
        }

        let current = SessionEvent::Status {
            status: state.classifier.status(),
            timestamp: state.status_changed_at,
        };
        if subscriber.deliver(current).is_err() {
            subscriber.close();
            return id;
        }

        state.subscribers.push(subscriber);
        info!(
            "[session:{}] Subscriber {} attached ({} chunks replayed, {} live)",
            self.id,
            id,
            replayed,
            state.subscribers.len()
        );
        id
    }

    /// Remove a subscriber. Returns false if it was not attached.
    pub fn detach(&self, subscriber_id: SubscriberId) -> bool {
        let mut state = self.state.lock();
        let Some(index) = state.subscribers.iter().position(|s| s.id == subscriber_id) else {
            return false;
        };
        let subscriber = state.subscribers.remove(index);
        subscriber.close();
        debug!("[session:{}] Subscriber {} detached", self.id, subscriber_id);
        true
    }

    pub fn input(&self, data: &[u8]) -> SessionResult<()> {
        if self.is_exited() {
            return Err(SessionError::ProcessGone(self.id.clone()));
        }
        self.control.write(data);
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> SessionResult<()> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidRequest(format!(
                "invalid terminal size {cols}x{rows}"
            )));
        }
        if self.is_exited() {
            return Err(SessionError::ProcessGone(self.id.clone()));
        }
        self.control.resize(cols, rows);
        Ok(())
    }

    pub fn is_exited(&self) -> bool {
        self.state.lock().exited || self.control.has_exited()
    }

    /// Consume process events until the process exits.
    pub async fn pump(self: Arc<Self>, mut events: mpsc::Receiver<ProcessEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Output(data) => self.handle_output(data),
                ProcessEvent::Exited(code) => {
                    self.handle_exit(code);
                    return;
                }
            }
        }
        warn!("[session:{}] Process event stream ended without exit", self.id);
        self.handle_exit(None);
    }

    fn handle_output(&self, data: Bytes) {
        let mut state = self.state.lock();
        if state.exited {
            return;
        }

        let chunk = Chunk::new(state.next_seq, data);
        state.next_seq += 1;
        state.ring.append(chunk.clone());
        self.fan_out(&mut state, SessionEvent::from(&chunk));

        let previous = state.classifier.status();
        match state.classifier.observe_at(&chunk.data, now()) {
            Verdict::Emit(status) => {
                Self::cancel_timer(&mut state);
                self.publish(&mut state, previous, status);
            }
            Verdict::ScheduleReady => self.schedule_ready(&mut state),
            Verdict::CancelPending => Self::cancel_timer(&mut state),
            Verdict::None => {}
        }
    }

    fn handle_exit(&self, code: Option<i32>) {
        {
            let mut state = self.state.lock();
            if state.exited {
                return;
            }
            state.exited = true;
            state.exit_code = code;
            Self::cancel_timer(&mut state);

            let restarting = state.lifecycle == Lifecycle::Restarting;
            state.lifecycle = Lifecycle::Stopped;
            if !restarting {
                let status = if state.stop_requested || code == Some(0) {
                    Status::Completed
                } else {
                    Status::Errored
                };
                self.transition(&mut state, status);
            }

            self.fan_out(&mut state, SessionEvent::Exit { code });
            for subscriber in state.subscribers.drain(..) {
                subscriber.close();
            }
            info!("[session:{}] Stopped (exit code {:?})", self.id, code);
        }
        let _ = self.stopped_tx.send(true);
    }

    /// Force a lifecycle status, publishing it if it changed.
    fn transition(&self, state: &mut SessionState, status: Status) {
        if let Some(previous) = state.classifier.set_status_at(status, now()) {
            self.publish(state, previous, status);
        }
    }

    /// Announce `status`, which the classifier has already adopted.
    fn publish(&self, state: &mut SessionState, previous: Status, status: Status) {
        let timestamp = Utc::now();
        state.status_changed_at = timestamp;
        info!("[session:{}] Status {} -> {}", self.id, previous, status);

        self.fan_out(state, SessionEvent::Status { status, timestamp });
        let _ = self.status_tx.send(StatusChange {
            session_id: self.id.clone(),
            display_name: self.display_name.clone(),
            previous,
            status,
            timestamp,
        });
    }

    /// Deliver to every live subscriber, pruning dead and failed ones.
    fn fan_out(&self, state: &mut SessionState, event: SessionEvent) {
        state.subscribers.retain(|subscriber| {
            if !subscriber.is_alive() {
                debug!("[session:{}] Pruning dead subscriber {}", self.id, subscriber.id);
                return false;
            }
            match subscriber.deliver(event.clone()) {
                Ok(()) => true,
                Err(e) => {
                    debug!(
                        "[session:{}] Dropping subscriber {}: {}",
                        self.id, subscriber.id, e
                    );
                    subscriber.close();
                    false
                }
            }
        });
    }

    /// Replace any running timer. The classifier's pending flag is already set.
    fn schedule_ready(&self, state: &mut SessionState) {
        Self::abort_timer(state);
        let generation = state.timer_generation;
        let session = self.this.clone();
        let delay = self.ready_delay;
        state.ready_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(session) = session.upgrade() {
                session.fire_ready(generation);
            }
        }));
    }

    fn fire_ready(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.timer_generation != generation || state.exited {
            return;
        }
        state.ready_timer = None;
        let previous = state.classifier.status();
        if let Some(status) = state.classifier.fire_pending_at(now()) {
            self.publish(&mut state, previous, status);
        }
    }

    fn abort_timer(state: &mut SessionState) {
        if let Some(timer) = state.ready_timer.take() {
            timer.abort();
        }
        state.timer_generation += 1;
    }

    fn cancel_timer(state: &mut SessionState) {
        Self::abort_timer(state);
        state.classifier.cancel_pending();
    }

    /// Tear down for a replacing `start`: subscribers are told and detached first, so
    /// none of this process's exit reaches them.
    pub async fn teardown_for_restart(&self) {
        {
            let mut state = self.state.lock();
            if !state.exited {
                state.lifecycle = Lifecycle::Restarting;
            }
            for subscriber in state.subscribers.drain(..) {
                let _ = subscriber.deliver(SessionEvent::Restarted);
                subscriber.close();
            }
        }
        info!("[session:{}] Tearing down for restart", self.id);
        self.shutdown().await;
    }

    /// Explicit stop: the session ends `completed` whatever the exit code.
    pub async fn stop(&self) {
        self.state.lock().stop_requested = true;
        info!("[session:{}] Stopping", self.id);
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        terminate(self.control.as_ref(), Signal::SIGTERM, self.kill_grace).await;
        if tokio::time::timeout(self.kill_grace, self.wait_stopped())
            .await
            .is_err()
        {
            warn!(
                "[session:{}] Exit not observed {:?} after kill",
                self.id, self.kill_grace
            );
        }
    }

    pub async fn wait_stopped(&self) {
        let mut stopped = self.stopped_rx.clone();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().ready_timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::local_channel;
    use crate::testing::{events_through, next_event, output_seqs, statuses, FakeProcess};

    fn session_with(config: &Config) -> (Arc<Session>, Arc<FakeProcess>) {
        let (process, events) = FakeProcess::new("s1#1", false);
        let (status_tx, _) = broadcast::channel(64);
        let session = Session::new(
            SessionParts {
                id: "s1".to_string(),
                display_name: "Session One".to_string(),
                working_directory: PathBuf::from("/tmp"),
                multiplexer_name: "s1".to_string(),
                control: process.clone(),
            },
            config,
            status_tx,
        );
        session.mark_running();
        tokio::spawn(session.clone().pump(events));
        (session, process)
    }

    #[tokio::test]
    async fn attach_replays_then_streams_live() {
        let (session, process) = session_with(&Config::default());
        for i in 0..3 {
            process.emit(format!("early {i}\r\n"));
        }
        let (watcher, mut watcher_rx) = local_channel(64);
        session.attach(watcher, None);
        events_through(&mut watcher_rx, 2).await;

        let (late, mut late_rx) = local_channel(64);
        session.attach(late, None);
        process.emit("live\r\n");

        let events = events_through(&mut late_rx, 3).await;
        assert_eq!(output_seqs(&events), vec![0, 1, 2, 3]);
        assert_eq!(statuses(&events), vec![Status::Running]);
        // The current status follows the replay.
        assert!(matches!(events[3], SessionEvent::Status { .. }));
    }

    #[tokio::test]
    async fn attach_since_skips_acknowledged_chunks() {
        let (session, process) = session_with(&Config::default());
        let (watcher, mut watcher_rx) = local_channel(64);
        session.attach(watcher, None);
        for i in 0..5 {
            process.emit(format!("{i}"));
        }
        events_through(&mut watcher_rx, 4).await;

        // Reconnecting with the last seq seen gets only what came after it.
        let (sub, mut rx) = local_channel(64);
        session.attach(sub, Some(3));
        let first = next_event(&mut rx).await.unwrap();
        assert_eq!(output_seqs(&[first]), vec![4]);
        assert_eq!(next_event(&mut rx).await.map(|e| e.kind()), Some("status"));

        let (caught_up, mut caught_up_rx) = local_channel(64);
        session.attach(caught_up, Some(4));
        assert_eq!(next_event(&mut caught_up_rx).await.map(|e| e.kind()), Some("status"));
    }

    #[tokio::test]
    async fn attach_since_evicted_seq_replays_from_oldest_buffered() {
        let mut config = Config::default();
        config.buffer.max_chunks = 3;
        let (session, process) = session_with(&config);
        let (watcher, mut watcher_rx) = local_channel(64);
        session.attach(watcher, None);
        for i in 0..6 {
            process.emit(format!("{i}"));
        }
        events_through(&mut watcher_rx, 5).await;

        let (sub, mut rx) = local_channel(64);
        session.attach(sub, Some(0));
        let replayed = events_through(&mut rx, 5).await;
        assert_eq!(output_seqs(&replayed), vec![3, 4, 5]);
    }


    #[tokio::test]
    async fn dead_subscriber_is_pruned_without_affecting_others() {
        let (session, process) = session_with(&Config::default());
        let (keep, mut keep_rx) = local_channel(64);
        let (gone, gone_rx) = local_channel(64);
        session.attach(keep, None);
        session.attach(gone, None);
        assert_eq!(session.info().subscribers, 2);

        drop(gone_rx);
        process.emit("after");
        let events = events_through(&mut keep_rx, 0).await;
        assert_eq!(output_seqs(&events), vec![0]);
        assert_eq!(session.info().subscribers, 1);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_its_own_oldest_events() {
        let (session, process) = session_with(&Config::default());
        let (slow, mut slow_rx) = local_channel(4);
        let (fast, mut fast_rx) = local_channel(256);
        session.attach(slow, None);
        session.attach(fast, None);

        for i in 0..20 {
            process.emit(format!("{i}"));
        }
        let events = events_through(&mut fast_rx, 19).await;
        assert_eq!(output_seqs(&events), (0..20).collect::<Vec<_>>());

        assert!(slow_rx.dropped() > 0);
        let mut tail = Vec::new();
        while let Some(event) = slow_rx.try_recv() {
            tail.push(event);
        }
        assert_eq!(output_seqs(&tail), vec![16, 17, 18, 19]);
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let (session, _process) = session_with(&Config::default());
        let (sub, _rx) = local_channel(8);
        let id = session.attach(sub, None);
        assert!(session.detach(id));
        assert!(!session.detach(id));
    }

    #[tokio::test]
    async fn natural_exit_reports_code_and_closes_subscribers() {
        let (session, process) = session_with(&Config::default());
        let (sub, mut rx) = local_channel(16);
        session.attach(sub, None);

        process.emit("bye\r\n");
        process.finish(Some(2));
        session.wait_stopped().await;

        let mut events = Vec::new();
        while let Some(event) = next_event(&mut rx).await {
            events.push(event);
        }
        assert_eq!(statuses(&events), vec![Status::Running, Status::Errored]);
        assert_eq!(events.last(), Some(&SessionEvent::Exit { code: Some(2) }));
        assert!(matches!(
            session.input(b"x"),
            Err(SessionError::ProcessGone(_))
        ));
        assert_eq!(session.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn attach_after_exit_replays_then_exits() {
        let (session, process) = session_with(&Config::default());
        process.emit("last words");
        process.finish(Some(0));
        session.wait_stopped().await;

        let (sub, mut rx) = local_channel(16);
        session.attach(sub, None);
        let first = next_event(&mut rx).await.unwrap();
        assert_eq!(first.kind(), "output");
        assert_eq!(
            next_event(&mut rx).await,
            Some(SessionEvent::Exit { code: Some(0) })
        );
        assert_eq!(next_event(&mut rx).await, None);
        assert_eq!(session.status(), Status::Completed);
    }

    #[tokio::test]
    async fn input_and_resize_reach_the_process() {
        let (session, process) = session_with(&Config::default());
        session.input(b"hello\n").unwrap();
        session.resize(100, 30).unwrap();
        assert_eq!(process.written(), b"hello\n");
        assert_eq!(process.size(), Some((100, 30)));
        assert!(matches!(
            session.resize(0, 30),
            Err(SessionError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn restart_teardown_notifies_without_exit() {
        let (session, _process) = session_with(&Config::default());
        let (sub, mut rx) = local_channel(16);
        session.attach(sub, None);

        session.teardown_for_restart().await;

        let mut events = Vec::new();
        while let Some(event) = next_event(&mut rx).await {
            events.push(event);
        }
        assert_eq!(events.last(), Some(&SessionEvent::Restarted));
        assert!(!events.iter().any(|e| e.kind() == "exit"));
        assert_eq!(session.lifecycle(), Lifecycle::Stopped);
    }
}
