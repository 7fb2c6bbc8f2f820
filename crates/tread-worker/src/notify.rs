//! Push messages and notification clicks.

use tracing::{debug, info};
use tread_core::{NotificationAction, PushPayload};
use tread_sw::{
    EventOutcome, NotificationActionButton, NotificationClickEvent, NotificationOptions, PushEvent,
    ServiceWorkerError, WorkerScope,
};

use crate::CacheWorker;

fn button(action: NotificationAction) -> NotificationActionButton {
    NotificationActionButton {
        action: action.as_str().to_string(),
        title: action.title().to_string(),
    }
}

impl CacheWorker {
    pub(crate) async fn on_push(
        &self,
        event: PushEvent,
        scope: &WorkerScope,
    ) -> Result<EventOutcome, ServiceWorkerError> {
        let defaults = &self.config.push;
        let payload = event
            .data
            .as_deref()
            .map(PushPayload::parse)
            .unwrap_or_default();

        let title = payload.title.unwrap_or_else(|| defaults.title.clone());
        let options = NotificationOptions {
            body: payload.body.unwrap_or_else(|| defaults.body.clone()),
            icon: Some(defaults.icon.clone()),
            badge: Some(defaults.badge.clone()),
            vibrate: defaults.vibrate.clone(),
            data: payload.data.unwrap_or_else(|| defaults.data.clone()),
            actions: vec![
                button(NotificationAction::Explore),
                button(NotificationAction::Close),
            ],
            tag: None,
        };

        let id = scope.show_notification(&title, options).await;
        info!(id, title = %title, "Notification shown");
        Ok(EventOutcome::Handled)
    }

    pub(crate) async fn on_notification_click(
        &self,
        event: NotificationClickEvent,
        scope: &WorkerScope,
    ) -> Result<EventOutcome, ServiceWorkerError> {
        scope.close_notification(event.notification.id).await;

        let target = match event.action.as_deref() {
            None | Some("") => "/",
            Some(action) => match NotificationAction::parse(action) {
                Some(NotificationAction::Explore) => self.config.explore_path.as_str(),
                Some(NotificationAction::Close) => return Ok(EventOutcome::Handled),
                None => {
                    debug!(action, "Ignoring unknown notification action");
                    return Ok(EventOutcome::Handled);
                }
            },
        };

        let url = self
            .config
            .resolve(target)
            .map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))?;
        scope.open_window(&url).await?;
        Ok(EventOutcome::Handled)
    }
}
