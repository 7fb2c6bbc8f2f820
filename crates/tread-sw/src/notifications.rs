//! Shown notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationActionButton {
    pub action: String,
    pub title: String,
}

/// Notification options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationOptions {
    pub body: String,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub vibrate: Vec<u32>,
    pub data: JsonValue,
    pub actions: Vec<NotificationActionButton>,
    pub tag: Option<String>,
}

/// A displayed notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    pub title: String,
    pub options: NotificationOptions,
    pub shown_at: DateTime<Utc>,
}

/// Notifications currently on screen.
#[derive(Debug, Default)]
pub struct NotificationCenter {
    shown: Vec<Notification>,
    next_id: u64,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Display a notification. A matching tag replaces the older one.
    pub fn show(&mut self, title: &str, options: NotificationOptions) -> u64 {
        if let Some(tag) = &options.tag {
            self.shown.retain(|n| n.options.tag.as_ref() != Some(tag));
        }
        self.next_id += 1;
        let id = self.next_id;
        self.shown.push(Notification {
            id,
            title: title.to_string(),
            options,
            shown_at: Utc::now(),
        });
        id
    }

    /// Close a notification.
    pub fn close(&mut self, id: u64) -> bool {
        let before = self.shown.len();
        self.shown.retain(|n| n.id != id);
        self.shown.len() != before
    }

    pub fn get(&self, id: u64) -> Option<&Notification> {
        self.shown.iter().find(|n| n.id == id)
    }

    /// Notifications in display order.
    pub fn list(&self) -> &[Notification] {
        &self.shown
    }

    pub fn len(&self) -> usize {
        self.shown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shown.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_show_and_close() {
        let mut center = NotificationCenter::new();
        let id = center.show("TreadHub", NotificationOptions::default());

        assert_eq!(center.get(id).unwrap().title, "TreadHub");
        assert!(center.close(id));
        assert!(!center.close(id));
        assert!(center.is_empty());
    }

    #[test]
    fn test_tag_replaces() {
        let mut center = NotificationCenter::new();
        let tagged = || NotificationOptions {
            tag: Some("deals".to_string()),
            ..Default::default()
        };
        center.show("first", tagged());
        let second = center.show("second", tagged());

        assert_eq!(center.len(), 1);
        assert_eq!(center.list()[0].id, second);
    }
}
