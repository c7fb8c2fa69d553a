//! Subscriber transport adapters.
//!
//! A session only knows the [`Deliver`] capability. Delivery never blocks: every adapter
//! sits behind an [`Outbox`], a bounded queue that drops the oldest queued events for
//! that subscriber alone when it falls behind.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::SessionEvent;

pub type SubscriberId = Uuid;

#[derive(Debug, Error)]
pub enum TransportFailure {
    #[error("subscriber channel closed")]
    Closed,
    #[error("failed to encode event: {0}")]
    Encode(String),
}

/// "Deliver this event to this viewer."
pub trait Deliver: Send + Sync {
    fn deliver(&self, event: SessionEvent) -> Result<(), TransportFailure>;

    fn is_alive(&self) -> bool;

    /// Called once when the session detaches this subscriber.
    fn close(&self) {}
}

/// A viewer attached to a session.
pub struct Subscriber {
    pub id: SubscriberId,
    pub attached_at: DateTime<Utc>,
    sink: Arc<dyn Deliver>,
}

impl Subscriber {
    pub fn new(sink: Arc<dyn Deliver>) -> Self {
        Self {
            id: Uuid::new_v4(),
            attached_at: Utc::now(),
            sink,
        }
    }

    pub fn deliver(&self, event: SessionEvent) -> Result<(), TransportFailure> {
        self.sink.deliver(event)
    }

    pub fn is_alive(&self) -> bool {
        self.sink.is_alive()
    }

    pub fn close(&self) {
        self.sink.close();
    }
}

/// Bounded single-consumer queue that never blocks the producer.
pub struct Outbox {
    queue: Mutex<VecDeque<SessionEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn push(&self, event: SessionEvent) -> Result<(), TransportFailure> {
        if self.is_closed() {
            return Err(TransportFailure::Closed);
        }
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Next event, or `None` once closed and drained.
    pub async fn recv(&self) -> Option<SessionEvent> {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.queue.lock().pop_front() {
                return Some(event);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&self) -> Option<SessionEvent> {
        self.queue.lock().pop_front()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Events discarded because this subscriber could not keep up.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Local (in-process) delivery
// =============================================================================

/// In-process delivery channel, e.g. for an embedded desktop UI.
pub struct LocalSubscriber {
    outbox: Arc<Outbox>,
}

/// Receiving half of a [`LocalSubscriber`]. Dropping it marks the subscriber dead.
pub struct LocalReceiver {
    outbox: Arc<Outbox>,
}

pub fn local_channel(capacity: usize) -> (Arc<LocalSubscriber>, LocalReceiver) {
    let outbox = Outbox::new(capacity);
    (
        Arc::new(LocalSubscriber {
            outbox: outbox.clone(),
        }),
        LocalReceiver { outbox },
    )
}

impl Deliver for LocalSubscriber {
    fn deliver(&self, event: SessionEvent) -> Result<(), TransportFailure> {
        self.outbox.push(event)
    }

    fn is_alive(&self) -> bool {
        !self.outbox.is_closed()
    }

    fn close(&self) {
        self.outbox.close();
    }
}

impl LocalReceiver {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.outbox.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.outbox.try_recv()
    }

    pub fn dropped(&self) -> u64 {
        self.outbox.dropped()
    }
}

impl Drop for LocalReceiver {
    fn drop(&mut self) {
        self.outbox.close();
    }
}

// =============================================================================
// WebSocket push delivery
// =============================================================================

/// Pushes events to a remote client as JSON text frames.
pub struct WsSubscriber {
    outbox: Arc<Outbox>,
}

impl WsSubscriber {
    /// Start the forwarder task that drains the outbox into `sink`.
    pub fn spawn<S>(mut sink: S, capacity: usize, label: String) -> (Arc<Self>, JoinHandle<()>)
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display,
    {
        let outbox = Outbox::new(capacity);
        let forward = outbox.clone();

        let task = tokio::spawn(async move {
            let mut sent = 0usize;
            while let Some(event) = forward.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("[{}] Dropping unencodable {} event: {}", label, event.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    warn!("[{}] Failed to send event, closing: {}", label, e);
                    forward.close();
                    break;
                }
                sent += 1;
            }

            if forward.dropped() > 0 {
                warn!(
                    "[{}] Subscriber fell behind; {} events dropped",
                    label,
                    forward.dropped()
                );
            }
            let _ = sink.close().await;
            info!("[{}] Forwarder finished after {} events", label, sent);
        });

        (Arc::new(Self { outbox }), task)
    }
}

impl Deliver for WsSubscriber {
    fn deliver(&self, event: SessionEvent) -> Result<(), TransportFailure> {
        self.outbox.push(event)
    }

    fn is_alive(&self) -> bool {
        !self.outbox.is_closed()
    }

    fn close(&self) {
        debug!("Closing websocket subscriber outbox");
        self.outbox.close();
    }
}
