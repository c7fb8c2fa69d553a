//! "Session finished" notices for sessions the user is not looking at.
//!
//! The registry knows nothing about focus; this consumer of its status channel does.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tmuxdeck_terminal::Status;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::event::StatusChange;

const MAX_NOTIFICATION_LOG: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub id: Uuid,
    pub session_id: String,
    pub display_name: String,
    pub message: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct Notifier {
    focused: Arc<RwLock<Option<String>>>,
    log: Arc<RwLock<VecDeque<Notice>>>,
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|item| !item.is_empty())
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_focus(&self, session_id: Option<String>) {
        *self.focused.write().await = normalize_opt(session_id);
    }

    pub async fn focused(&self) -> Option<String> {
        self.focused.read().await.clone()
    }

    /// Record a notice if `change` is a transition to `ready` of an unfocused session.
    pub async fn observe(&self, change: &StatusChange) -> Option<Notice> {
        if change.status != Status::Ready || change.previous == Status::Ready {
            return None;
        }
        if self.focused.read().await.as_deref() == Some(change.session_id.as_str()) {
            return None;
        }

        let notice = Notice {
            id: Uuid::new_v4(),
            session_id: change.session_id.clone(),
            display_name: change.display_name.clone(),
            message: format!("{} finished", change.display_name),
            received_at: change.timestamp,
        };
        info!("[notify] {} is ready for input", notice.display_name);

        let mut guard = self.log.write().await;
        guard.push_front(notice.clone());
        if guard.len() > MAX_NOTIFICATION_LOG {
            guard.pop_back();
        }

        Some(notice)
    }

    /// Newest first.
    pub async fn list(&self) -> Vec<Notice> {
        let guard = self.log.read().await;
        guard.iter().cloned().collect()
    }

    /// Consume the registry's status channel until it closes.
    pub fn spawn(&self, mut changes: broadcast::Receiver<StatusChange>) -> JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        notifier.observe(&change).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("[notify] Missed {} status changes", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(id: &str, previous: Status, status: Status) -> StatusChange {
        StatusChange {
            session_id: id.to_string(),
            display_name: format!("Project {id}"),
            previous,
            status,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ready_of_unfocused_session_is_recorded() {
        let notifier = Notifier::new();
        notifier.set_focus(Some("p2".to_string())).await;

        let notice = notifier
            .observe(&change("p1", Status::Working, Status::Ready))
            .await
            .unwrap();
        assert_eq!(notice.message, "Project p1 finished");
        assert_eq!(notifier.list().await, vec![notice]);
    }

    #[tokio::test]
    async fn notice_serializes_for_the_notifications_endpoint() {
        let notifier = Notifier::new();
        let notice = notifier
            .observe(&change("p1", Status::Working, Status::Ready))
            .await
            .unwrap();

        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["id"], notice.id.to_string());
        assert_eq!(json["sessionId"], "p1");
        assert_eq!(json["displayName"], "Project p1");
        assert!(json["receivedAt"].is_string());
    }

    #[tokio::test]
    async fn focused_and_non_ready_changes_are_ignored() {
        let notifier = Notifier::new();
        notifier.set_focus(Some(" p1 ".to_string())).await;
        assert_eq!(notifier.focused().await.as_deref(), Some("p1"));

        assert!(notifier
            .observe(&change("p1", Status::Working, Status::Ready))
            .await
            .is_none());
        assert!(notifier
            .observe(&change("p2", Status::Running, Status::Working))
            .await
            .is_none());
        assert!(notifier.list().await.is_empty());
    }

    #[tokio::test]
    async fn log_is_bounded_and_newest_first() {
        let notifier = Notifier::new();
        for idx in 0..(MAX_NOTIFICATION_LOG + 3) {
            notifier
                .observe(&change(&format!("p{idx}"), Status::Working, Status::Ready))
                .await;
        }
        let items = notifier.list().await;
        assert_eq!(items.len(), MAX_NOTIFICATION_LOG);
        assert_eq!(
            items.first().map(|n| n.session_id.clone()),
            Some(format!("p{}", MAX_NOTIFICATION_LOG + 2))
        );
    }

    #[tokio::test]
    async fn spawned_notifier_follows_the_channel() {
        let notifier = Notifier::new();
        let (tx, rx) = broadcast::channel(8);
        let task = notifier.spawn(rx);

        tx.send(change("p1", Status::Working, Status::Ready)).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(notifier.list().await.len(), 1);
    }
}
