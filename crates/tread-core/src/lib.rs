//! TreadCache Core Library
//!
//! This crate provides configuration and the message protocol shared by the
//! cache worker and the page-side update manager.

pub mod config;
pub mod protocol;

pub use config::{AppConfig, PushDefaults};
pub use protocol::{NotificationAction, PageMessage, PushPayload, SyncTag, WorkerMessage};
