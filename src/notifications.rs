//!
//! In-process notification feed.
//!
//! Notifications are kept in a bounded history and fanned out to live subscribers through a
//! broadcast channel. Publishing never fails: a notification without subscribers is still kept in
//! the history, and slow subscribers simply lag.
//!

use crate::messaging::{ClientId, NotificationId};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    /// An error the user needs to see.
    Destructive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub client_id: Option<ClientId>,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

#[derive(Debug)]
pub struct NotificationCenter {
    capacity: usize,
    history: Mutex<VecDeque<Notification>>,
    feed: broadcast::Sender<Notification>,
}

impl NotificationCenter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (feed, _) = broadcast::channel(capacity);
        Self { capacity, history: Mutex::new(VecDeque::with_capacity(capacity)), feed }
    }

    pub fn publish<T, M>(
        &self,
        kind: NotificationKind,
        title: T,
        message: M,
        client_id: Option<ClientId>,
        now: DateTime<Utc>,
    ) -> Notification
    where
        T: Into<String>,
        M: Into<String>,
    {
        let notification = Notification {
            id: NotificationId::new(),
            kind,
            title: title.into(),
            message: message.into(),
            client_id,
            created_at: now,
            read: false,
        };

        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(notification.clone());
        }

        // Err only means nobody is subscribed right now.
        if self.feed.send(notification.clone()).is_err() {
            debug!(id = notification.id; "Notification published without subscribers");
        }
        notification
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.feed.subscribe()
    }

    /// Newest first.
    pub fn list(&self, unread_only: bool) -> Vec<Notification> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history
            .iter()
            .rev()
            .filter(|n| !unread_only || !n.read)
            .cloned()
            .collect()
    }

    pub fn mark_read(&self, id: NotificationId) -> bool {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        match history.iter_mut().find(|n| n.id == id) {
            Some(notification) => {
                notification.read = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_read(&self) -> usize {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let mut marked = 0;
        for notification in history.iter_mut().filter(|n| !n.read) {
            notification.read = true;
            marked += 1;
        }
        marked
    }

    pub fn unread_count(&self) -> usize {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.iter().filter(|n| !n.read).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_notifications() -> Result<(), anyhow::Error> {
        let center = NotificationCenter::new(10);
        let mut feed = center.subscribe();

        let published = center.publish(NotificationKind::Warning, "Overdue", "2 payments", None, Utc::now());
        let received = feed.recv().await?;
        assert_eq!(received, published);
        Ok(())
    }

    #[test]
    fn unread_tracking() {
        let center = NotificationCenter::new(10);
        let first = center.publish(NotificationKind::Info, "a", "", None, Utc::now());
        center.publish(NotificationKind::Success, "b", "", Some(ClientId::from("c-1")), Utc::now());
        assert_eq!(center.unread_count(), 2);

        assert!(center.mark_read(first.id));
        assert!(!center.mark_read(NotificationId::new()));
        assert_eq!(center.unread_count(), 1);

        let unread = center.list(true);
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].title, "b");

        assert_eq!(center.mark_all_read(), 1);
        assert_eq!(center.unread_count(), 0);
        assert_eq!(center.list(false).len(), 2);
    }

    #[test]
    fn history_is_bounded() {
        let center = NotificationCenter::new(2);
        for title in ["a", "b", "c"] {
            center.publish(NotificationKind::Info, title, "", None, Utc::now());
        }
        let titles: Vec<String> = center.list(false).into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["c", "b"]);
    }
}
