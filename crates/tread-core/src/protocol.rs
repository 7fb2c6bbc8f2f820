//! Messages exchanged between the cache worker and its pages.
//!
//! Messages travel as structured JSON values; every message carries a
//! `type` discriminator.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Worker → page messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Broadcast after activation with the new generation.
    SwUpdated { version: String, timestamp: String },
    /// Reply to [`PageMessage::GetVersion`].
    Version { version: String, timestamp: String },
}

/// Page → worker messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageMessage {
    /// Activate an installed-but-waiting worker now.
    SkipWaiting,
    /// Ask the worker which generation it serves.
    GetVersion,
}

impl WorkerMessage {
    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    pub fn from_value(value: &JsonValue) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

impl PageMessage {
    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    pub fn from_value(value: &JsonValue) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Optional JSON body of a push event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub data: Option<JsonValue>,
}

impl PushPayload {
    /// Interpret raw push bytes: JSON when it parses, otherwise plain body text.
    pub fn parse(raw: &[u8]) -> Self {
        if let Ok(payload) = serde_json::from_slice::<PushPayload>(raw) {
            return payload;
        }
        let text = String::from_utf8_lossy(raw).trim().to_string();
        Self {
            body: (!text.is_empty()).then_some(text),
            ..Default::default()
        }
    }
}

/// Notification action buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationAction {
    /// Open the product listing.
    Explore,
    /// Dismiss.
    Close,
}

impl NotificationAction {
    pub const EXPLORE: &'static str = "explore";
    pub const CLOSE: &'static str = "close";

    pub fn parse(action: &str) -> Option<Self> {
        match action {
            Self::EXPLORE => Some(Self::Explore),
            Self::CLOSE => Some(Self::Close),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explore => Self::EXPLORE,
            Self::Close => Self::CLOSE,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Explore => "Browse tires",
            Self::Close => "Close",
        }
    }
}

/// Background sync tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTag {
    Cart,
    Wishlist,
}

impl SyncTag {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "sync-cart" => Some(Self::Cart),
            "sync-wishlist" => Some(Self::Wishlist),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cart => "sync-cart",
            Self::Wishlist => "sync-wishlist",
        }
    }
}
