//! Process-wide map of session id to live [`Session`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{SessionError, SessionResult};
use crate::event::StatusChange;
use crate::process::{PtySpawner, SpawnRequest, Spawned, Spawner};
use crate::session::{Session, SessionInfo, SessionParts};
use crate::subscriber::{Deliver, SubscriberId};

const STATUS_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub session_id: String,
    pub working_directory: PathBuf,
    pub command: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub bypass_permissions: bool,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

/// Cheap to clone; all clones share one session table.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Serialises start/stop per id so a restart can't interleave with another.
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    spawner: Arc<dyn Spawner>,
    config: Config,
    status_tx: broadcast::Sender<StatusChange>,
}

impl Registry {
    pub fn new(config: Config, spawner: Arc<dyn Spawner>) -> Self {
        if config.subscriber.queue_capacity <= config.buffer.max_chunks {
            warn!(
                "subscriber.queue_capacity ({}) does not exceed buffer.max_chunks ({}); \
                 a full replay will drop history for new subscribers",
                config.subscriber.queue_capacity, config.buffer.max_chunks
            );
        }
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_SIZE);
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                op_locks: Mutex::new(HashMap::new()),
                spawner,
                config,
                status_tx,
            }),
        }
    }

    /// Registry backed by real PTY processes.
    pub fn with_pty(config: Config) -> Self {
        let spawner = Arc::new(PtySpawner::new(config.process.clone()));
        Self::new(config, spawner)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    fn op_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .op_locks
            .lock()
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the op lock for `id` once nobody holds or waits on it.
    /// Callers must have released their own clone first.
    fn prune_op_lock(&self, id: &str) {
        let mut locks = self.inner.op_locks.lock();
        if locks
            .get(id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(id);
        }
    }

    /// Ensure exactly one fresh session for `request.session_id`.
    ///
    /// An existing session is torn down (its process has exited) before the new process
    /// is spawned. If the spawn fails nothing is registered.
    pub async fn start(&self, request: StartRequest) -> SessionResult<Arc<Session>> {
        let id = request.session_id.trim().to_string();
        if id.is_empty() {
            return Err(SessionError::InvalidRequest(
                "sessionId must not be empty".to_string(),
            ));
        }
        if request.command.trim().is_empty() {
            return Err(SessionError::InvalidRequest(
                "command must not be empty".to_string(),
            ));
        }

        let lock = self.op_lock(&id);
        let _guard = lock.lock().await;

        let previous = self.inner.sessions.write().remove(&id);
        if let Some(previous) = previous {
            info!("[registry] Restarting session {}", id);
            previous.teardown_for_restart().await;
        }

        let process = &self.inner.config.process;
        let spawn_request = SpawnRequest {
            session_id: id.clone(),
            working_directory: request.working_directory.clone(),
            command: request.command.clone(),
            bypass_permissions: request.bypass_permissions,
            cols: request.cols.unwrap_or(process.cols),
            rows: request.rows.unwrap_or(process.rows),
        };
        // openpty and fork block; keep them off the async workers.
        let spawner = self.inner.spawner.clone();
        let spawned = tokio::task::spawn_blocking(move || spawner.spawn(&spawn_request))
            .await
            .unwrap_or_else(|e| Err(SessionError::Spawn(format!("spawn task failed: {e}"))));
        let Spawned {
            control,
            events,
            multiplexer_name,
        } = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!("[registry] Failed to start {}: {}", id, e);
                drop(_guard);
                drop(lock);
                self.prune_op_lock(&id);
                return Err(e);
            }
        };

        let session = Session::new(
            SessionParts {
                id: id.clone(),
                display_name: request.display_name.unwrap_or_else(|| id.clone()),
                working_directory: request.working_directory,
                multiplexer_name,
                control,
            },
            &self.inner.config,
            self.inner.status_tx.clone(),
        );

        self.inner
            .sessions
            .write()
            .insert(id.clone(), session.clone());
        session.mark_running();

        let registry = self.clone();
        let pumped = session.clone();
        let exit_echo = self.inner.config.process.exit_echo();
        tokio::spawn(async move {
            pumped.clone().pump(events).await;
            tokio::time::sleep(exit_echo).await;
            if registry.remove_if_same(&pumped) {
                registry.prune_op_lock(pumped.id());
            }
        });

        info!("[registry] Started session {}", id);
        Ok(session)
    }

    /// Kill the process, deliver its exit, and unregister the session.
    pub async fn stop(&self, id: &str) -> SessionResult<()> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        let result = match self.get(id) {
            Some(session) => {
                session.stop().await;
                self.remove_if_same(&session);
                info!("[registry] Stopped session {}", id);
                Ok(())
            }
            None => Err(SessionError::NotFound(id.to_string())),
        };

        drop(_guard);
        drop(lock);
        self.prune_op_lock(id);
        result
    }

    /// Returns true if `session` was still the registered entry and is now removed.
    fn remove_if_same(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.inner.sessions.write();
        if sessions
            .get(session.id())
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(session.id());
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(id).cloned()
    }

    fn require(&self, id: &str) -> SessionResult<Arc<Session>> {
        self.get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub fn input(&self, id: &str, data: &[u8]) -> SessionResult<()> {
        self.require(id)?.input(data)
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> SessionResult<()> {
        self.require(id)?.resize(cols, rows)
    }

    pub fn attach(
        &self,
        id: &str,
        sink: Arc<dyn Deliver>,
        since: Option<u64>,
    ) -> SessionResult<SubscriberId> {
        Ok(self.require(id)?.attach(sink, since))
    }

    pub fn detach(&self, id: &str, subscriber: SubscriberId) -> SessionResult<bool> {
        Ok(self.require(id)?.detach(subscriber))
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.read().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Registry-wide status transitions.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.status_tx.subscribe()
    }

    #[cfg(test)]
    fn op_lock_count(&self) -> usize {
        self.inner.op_locks.lock().len()
    }

    /// Stop every session, e.g. on server shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.inner.sessions.read().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!("[registry] Failed to stop {} during shutdown: {}", id, e);
            }
        }
    }
}
