//! Process handle: one spawned PTY child per session.
//!
//! Output and exit are reported on a single ordered channel. A supervisor task merges
//! the reader thread and the waiter thread so that `Exited` is always the last event and
//! is sent exactly once, regardless of how many times the process is killed.

use std::io::{Read, Write as IoWrite};
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver as SyncReceiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tmuxdeck_terminal::Utf8Carry;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::ProcessConfig;
use crate::error::{SessionError, SessionResult};
use crate::launch::LaunchPlan;

const PTY_READ_BUFFER_SIZE: usize = 4096;
const PTY_WRITE_CHUNK_SIZE: usize = 512; // Small chunks for smooth writes
const PTY_INPUT_CHANNEL_SIZE: usize = 1024;
const OUTPUT_CHANNEL_SIZE: usize = 256;
/// How long to keep reading after the child exits before reporting the exit.
const EXIT_DRAIN: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(Bytes),
    Exited(Option<i32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited(Option<i32>),
}

impl Liveness {
    pub fn is_exited(&self) -> bool {
        matches!(self, Liveness::Exited(_))
    }
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub session_id: String,
    pub working_directory: PathBuf,
    pub command: String,
    pub bypass_permissions: bool,
    pub cols: u16,
    pub rows: u16,
}

/// A freshly spawned process: its control surface plus its ordered event stream.
pub struct Spawned {
    pub control: Arc<dyn ProcessControl>,
    pub events: mpsc::Receiver<ProcessEvent>,
    pub multiplexer_name: String,
}

pub trait Spawner: Send + Sync + 'static {
    fn spawn(&self, request: &SpawnRequest) -> SessionResult<Spawned>;
}

pub trait ProcessControl: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Queue input for the child. Dropped silently once the child has exited.
    fn write(&self, data: &[u8]);

    /// Best effort; failures are logged.
    fn resize(&self, cols: u16, rows: u16);

    /// Polite termination request.
    fn signal(&self, signal: Signal) -> SessionResult<()>;

    /// Unconditional termination.
    fn force_kill(&self);

    fn liveness(&self) -> watch::Receiver<Liveness>;

    fn has_exited(&self) -> bool {
        self.liveness().borrow().is_exited()
    }
}

/// Terminate `control`: send `signal`, wait up to `grace`, then force.
/// A no-op if the process already exited.
pub async fn terminate(control: &dyn ProcessControl, signal: Signal, grace: Duration) {
    let mut liveness = control.liveness();
    if liveness.borrow().is_exited() {
        return;
    }

    if let Err(e) = control.signal(signal) {
        warn!("Failed to send {} to pid {:?}: {}", signal, control.pid(), e);
    }

    let settled = matches!(
        tokio::time::timeout(grace, liveness.wait_for(Liveness::is_exited)).await,
        Ok(Ok(_))
    );
    if settled {
        return;
    }

    warn!(
        "Process {:?} ignored {} for {:?}, forcing termination",
        control.pid(),
        signal,
        grace
    );
    control.force_kill();
    let _ = tokio::time::timeout(grace, liveness.wait_for(Liveness::is_exited)).await;
}

// =============================================================================
// portable-pty backend
// =============================================================================

pub struct PtySpawner {
    config: ProcessConfig,
}

impl PtySpawner {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }
}

struct PtyProcess {
    session_id: String,
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    input_tx: SyncSender<Vec<u8>>,
    liveness: watch::Receiver<Liveness>,
}

fn spawn_error(e: impl std::fmt::Display) -> SessionError {
    SessionError::Spawn(e.to_string())
}

impl Spawner for PtySpawner {
    fn spawn(&self, request: &SpawnRequest) -> SessionResult<Spawned> {
        if !request.working_directory.is_dir() {
            return Err(SessionError::Spawn(format!(
                "working directory does not exist: {}",
                request.working_directory.display()
            )));
        }

        let plan = LaunchPlan::new(
            &self.config,
            &request.session_id,
            &request.working_directory,
            &request.command,
            request.bypass_permissions,
        );

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(spawn_error)?;

        let mut cmd = CommandBuilder::new(&plan.program);
        cmd.args(&plan.args);
        cmd.cwd(&request.working_directory);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        // Allow tmux to start even when this server itself runs inside tmux.
        cmd.env_remove("TMUX");

        let mut child = pair.slave.spawn_command(cmd).map_err(spawn_error)?;
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair.master.try_clone_reader().map_err(spawn_error)?;
        let writer = pair.master.take_writer().map_err(spawn_error)?;

        let session_id = request.session_id.clone();
        info!(
            "[process:{}] Spawned pid {:?} (tmux session: {})",
            session_id, pid, plan.multiplexer_name
        );

        let (input_tx, input_rx) = sync_channel(PTY_INPUT_CHANNEL_SIZE);
        spawn_pty_writer_thread(session_id.clone(), writer, input_rx);

        let (raw_tx, raw_rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
        spawn_pty_reader_thread(session_id.clone(), reader, raw_tx);

        let (exit_tx, exit_rx) = oneshot::channel();
        let waiter_id = session_id.clone();
        std::thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => i32::try_from(status.exit_code()).ok(),
                Err(e) => {
                    error!("[process:{}] wait failed: {}", waiter_id, e);
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

        let (events_tx, events_rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
        let (liveness_tx, liveness_rx) = watch::channel(Liveness::Running);
        tokio::spawn(supervise(
            session_id.clone(),
            raw_rx,
            exit_rx,
            events_tx,
            liveness_tx,
        ));

        let process = PtyProcess {
            session_id,
            pid,
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            input_tx,
            liveness: liveness_rx,
        };

        Ok(Spawned {
            control: Arc::new(process),
            events: events_rx,
            multiplexer_name: plan.multiplexer_name,
        })
    }
}

impl ProcessControl for PtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&self, data: &[u8]) {
        if self.has_exited() {
            debug!(
                "[process:{}] Dropping {} bytes written after exit",
                self.session_id,
                data.len()
            );
            return;
        }
        match self.input_tx.try_send(data.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    "[process:{}] Input queue full, dropping {} bytes",
                    self.session_id,
                    dropped.len()
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("[process:{}] Writer thread gone", self.session_id);
            }
        }
    }

    fn resize(&self, cols: u16, rows: u16) {
        let result = self.master.lock().resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        });
        if let Err(e) = result {
            warn!(
                "[process:{}] Failed to resize to {}x{}: {}",
                self.session_id, cols, rows, e
            );
        }
    }

    fn signal(&self, signal: Signal) -> SessionResult<()> {
        let pid = self
            .pid
            .ok_or_else(|| SessionError::ProcessGone(self.session_id.clone()))?;
        let pid = i32::try_from(pid)
            .map_err(|_| SessionError::InvalidRequest(format!("pid out of range: {pid}")))?;
        // The PTY child is a session leader, so its pid is also its process group.
        killpg(Pid::from_raw(pid), signal).map_err(std::io::Error::from)?;
        Ok(())
    }

    fn force_kill(&self) {
        if let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) {
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        }
        if let Err(e) = self.killer.lock().kill() {
            debug!("[process:{}] Killer: {}", self.session_id, e);
        }
    }

    fn liveness(&self) -> watch::Receiver<Liveness> {
        self.liveness.clone()
    }
}

/// Merge reader output and child exit into one ordered stream ending in `Exited`.
async fn supervise(
    session_id: String,
    mut raw_rx: mpsc::Receiver<Bytes>,
    mut exit_rx: oneshot::Receiver<Option<i32>>,
    events: mpsc::Sender<ProcessEvent>,
    liveness: watch::Sender<Liveness>,
) {
    let mut total_bytes = 0usize;

    let code = loop {
        tokio::select! {
            chunk = raw_rx.recv() => match chunk {
                Some(data) => {
                    total_bytes += data.len();
                    let _ = events.send(ProcessEvent::Output(data)).await;
                }
                None => {
                    let code = (&mut exit_rx).await.unwrap_or(None);
                    let _ = liveness.send(Liveness::Exited(code));
                    break code;
                }
            },
            code = &mut exit_rx => {
                let code = code.unwrap_or(None);
                let _ = liveness.send(Liveness::Exited(code));
                let drain = async {
                    while let Some(data) = raw_rx.recv().await {
                        let _ = events.send(ProcessEvent::Output(data)).await;
                    }
                };
                if tokio::time::timeout(EXIT_DRAIN, drain).await.is_err() {
                    debug!("[process:{}] Reader still open after exit, not waiting", session_id);
                }
                break code;
            }
        }
    };

    info!(
        "[process:{}] Exited with code {:?} after {} bytes of output",
        session_id, code, total_bytes
    );
    let _ = events.send(ProcessEvent::Exited(code)).await;
}

/// Blocking reader thread. Chunks are cut on UTF-8 boundaries.
fn spawn_pty_reader_thread(
    session_id: String,
    mut reader: Box<dyn Read + Send>,
    raw_tx: mpsc::Sender<Bytes>,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
        let mut carry = Utf8Carry::new();
        let mut read_count = 0usize;

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    read_count += 1;
                    let ready = carry.push(&buf[..n]);
                    if !ready.is_empty() && raw_tx.blocking_send(Bytes::from(ready)).is_err() {
                        debug!("[reader:{}] Output channel closed", session_id);
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    // EIO once the slave side is closed is the normal end on Linux.
                    debug!("[reader:{}] Read ended: {}", session_id, e);
                    break;
                }
            }
        }

        let rest = carry.flush();
        if !rest.is_empty() {
            let _ = raw_tx.blocking_send(Bytes::from(rest));
        }
        info!("[reader:{}] EOF after {} reads", session_id, read_count);
    });
}

/// Dedicated writer thread: input is written sequentially in small chunks so the PTY
/// buffer can drain between them.
fn spawn_pty_writer_thread(
    session_id: String,
    mut writer: Box<dyn IoWrite + Send>,
    input_rx: SyncReceiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        let mut total_bytes_written = 0usize;

        while let Ok(data) = input_rx.recv() {
            for chunk in data.chunks(PTY_WRITE_CHUNK_SIZE) {
                if let Err(e) = writer.write_all(chunk).and_then(|_| writer.flush()) {
                    error!(
                        "[writer:{}] Write error: {} (errno: {:?})",
                        session_id,
                        e,
                        e.raw_os_error()
                    );
                    return;
                }
                std::thread::yield_now();
            }
            total_bytes_written += data.len();
        }

        info!(
            "[writer:{}] Writer finished (channel closed). Total: {} bytes",
            session_id, total_bytes_written
        );
    });
}
