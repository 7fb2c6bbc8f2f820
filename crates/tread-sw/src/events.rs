//! Events the host dispatches into a worker.

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tread_net::{Request, Response};

use crate::notifications::Notification;

/// A fetch event.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub request: Request,
    /// Page that issued the request.
    pub client_id: Option<String>,
}

/// A message posted by a page.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub data: JsonValue,
    pub source: Option<String>,
}

/// A background sync event.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub tag: String,
    /// No further retries will be scheduled after this one.
    pub last_chance: bool,
}

/// A push event.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub data: Option<Bytes>,
}

/// A click on a shown notification.
#[derive(Debug, Clone)]
pub struct NotificationClickEvent {
    pub notification: Notification,
    /// Action button pressed; `None` for the notification body.
    pub action: Option<String>,
}

/// Worker events.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(FetchEvent),
    Message(MessageEvent),
    Sync(SyncEvent),
    Push(PushEvent),
    NotificationClick(NotificationClickEvent),
}

impl WorkerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Activate => "activate",
            Self::Fetch(_) => "fetch",
            Self::Message(_) => "message",
            Self::Sync(_) => "sync",
            Self::Push(_) => "push",
            Self::NotificationClick(_) => "notificationclick",
        }
    }
}

/// How a handler settled.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    /// Handled; nothing to return.
    Handled,
    /// Fetch answered by the worker.
    Respond(Response),
    /// Fetch left to the network.
    Passthrough,
}
