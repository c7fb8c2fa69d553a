//! In-memory process doubles for session and registry tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::error::{SessionError, SessionResult};
use crate::event::SessionEvent;
use crate::launch::multiplexer_name;
use crate::process::{Liveness, ProcessControl, ProcessEvent, SpawnRequest, Spawned, Spawner};
use crate::subscriber::LocalReceiver;

type Log = Arc<Mutex<Vec<String>>>;

pub struct FakeProcess {
    label: String,
    ignore_polite: bool,
    log: Log,
    events: mpsc::Sender<ProcessEvent>,
    liveness_tx: watch::Sender<Liveness>,
    liveness_rx: watch::Receiver<Liveness>,
    written: Mutex<Vec<u8>>,
    size: Mutex<Option<(u16, u16)>>,
}

impl FakeProcess {
    pub fn new(label: &str, ignore_polite: bool) -> (Arc<Self>, mpsc::Receiver<ProcessEvent>) {
        Self::with_log(label, ignore_polite, Log::default())
    }

    fn with_log(
        label: &str,
        ignore_polite: bool,
        log: Log,
    ) -> (Arc<Self>, mpsc::Receiver<ProcessEvent>) {
        let (events, rx) = mpsc::channel(1024);
        let (liveness_tx, liveness_rx) = watch::channel(Liveness::Running);
        let process = Arc::new(Self {
            label: label.to_string(),
            ignore_polite,
            log,
            events,
            liveness_tx,
            liveness_rx,
            written: Mutex::new(Vec::new()),
            size: Mutex::new(None),
        });
        (process, rx)
    }

    pub fn emit(&self, text: impl Into<Bytes>) {
        if !self.has_exited() {
            let _ = self.events.try_send(ProcessEvent::Output(text.into()));
        }
    }

    /// Exit with `code`. Only the first call has any effect.
    pub fn finish(&self, code: Option<i32>) {
        let first = self.liveness_tx.send_if_modified(|liveness| {
            if liveness.is_exited() {
                false
            } else {
                *liveness = Liveness::Exited(code);
                true
            }
        });
        if first {
            let _ = self.events.try_send(ProcessEvent::Exited(code));
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub fn size(&self) -> Option<(u16, u16)> {
        *self.size.lock()
    }
}

impl ProcessControl for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn write(&self, data: &[u8]) {
        if !self.has_exited() {
            self.written.lock().extend_from_slice(data);
        }
    }

    fn resize(&self, cols: u16, rows: u16) {
        *self.size.lock() = Some((cols, rows));
    }

    fn signal(&self, signal: Signal) -> SessionResult<()> {
        self.log
            .lock()
            .push(format!("signal:{}:{}", self.label, signal.as_str()));
        if !self.ignore_polite {
            self.finish(Some(128 + signal as i32));
        }
        Ok(())
    }

    fn force_kill(&self) {
        self.log.lock().push(format!("kill9:{}", self.label));
        self.finish(Some(137));
    }

    fn liveness(&self) -> watch::Receiver<Liveness> {
        self.liveness_rx.clone()
    }
}

/// Spawner that hands out [`FakeProcess`]es labelled `<id>#<n>`.
#[derive(Clone, Default)]
pub struct FakeSpawner {
    log: Log,
    processes: Arc<Mutex<HashMap<String, Arc<FakeProcess>>>>,
    counts: Arc<Mutex<HashMap<String, u32>>>,
    ignore_polite: bool,
    fail_with: Arc<Mutex<Option<String>>>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ignoring_polite_signals() -> Self {
        Self {
            ignore_polite: true,
            ..Self::default()
        }
    }

    pub fn fail_next(&self, message: &str) {
        *self.fail_with.lock() = Some(message.to_string());
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Process by label, e.g. `"p1#2"`.
    pub fn process(&self, label: &str) -> Arc<FakeProcess> {
        self.processes
            .lock()
            .get(label)
            .cloned()
            .unwrap_or_else(|| panic!("no process spawned as {label}"))
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, request: &SpawnRequest) -> SessionResult<Spawned> {
        if let Some(message) = self.fail_with.lock().take() {
            return Err(SessionError::Spawn(message));
        }

        let n = {
            let mut counts = self.counts.lock();
            let n = counts.entry(request.session_id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let label = format!("{}#{}", request.session_id, n);
        self.log.lock().push(format!("spawn:{label}"));

        let (process, events) = FakeProcess::with_log(&label, self.ignore_polite, self.log.clone());
        self.processes.lock().insert(label, process.clone());

        Ok(Spawned {
            control: process,
            events,
            multiplexer_name: multiplexer_name(&request.session_id),
        })
    }
}

/// Next event, failing the test instead of hanging.
pub async fn next_event(rx: &mut LocalReceiver) -> Option<SessionEvent> {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for session event")
}

/// Receive until an output event with `seq` arrives, returning everything seen.
pub async fn events_through(rx: &mut LocalReceiver, seq: u64) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Some(event) = next_event(rx).await {
        let done = matches!(event, SessionEvent::Output { seq: s, .. } if s == seq);
        seen.push(event);
        if done {
            break;
        }
    }
    seen
}

pub fn output_seqs(events: &[SessionEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Output { seq, .. } => Some(*seq),
            _ => None,
        })
        .collect()
}

pub fn statuses(events: &[SessionEvent]) -> Vec<tmuxdeck_terminal::Status> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Status { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}
