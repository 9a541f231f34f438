//! Push notification relay.
//!
//! Turns pushed payloads into notification descriptors and notification
//! clicks into client actions. Nothing here talks to a display; the caller
//! decides how to show a [`Notification`] or carry out a [`ClientAction`].

use serde::{Deserialize, Serialize};
use url::Url;

/// Payload shape a push message may carry.
#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  #[serde(default)]
  pub body: String,
  pub icon: Option<String>,
  pub badge: Option<String>,
  #[serde(default)]
  pub data: NotificationData,
  #[serde(default)]
  pub actions: Vec<NotificationAction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
  pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

/// A notification to display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: Option<String>,
  pub badge: Option<String>,
  #[serde(default)]
  pub data: NotificationData,
  #[serde(default)]
  pub actions: Vec<NotificationAction>,
  /// Stays visible until the user dismisses it
  #[serde(default)]
  pub require_interaction: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "url", rename_all = "snake_case")]
pub enum ClientAction {
  OpenWindow(Url),
  Nothing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClickOutcome {
  /// The clicked notification is always closed
  pub close: bool,
  pub action: ClientAction,
}

pub struct NotificationRelay {
  origin: Url,
  app_root: Url,
  app_name: String,
}

impl NotificationRelay {
  pub fn new(origin: Url, app_root: Url, app_name: &str) -> Self {
    Self {
      origin,
      app_root,
      app_name: app_name.to_string(),
    }
  }

  /// Build the notification for a push event. No payload, no notification.
  ///
  /// A payload that is not JSON becomes the body of a notification titled
  /// with the application name.
  pub fn on_push(&self, payload: Option<&[u8]>) -> Option<Notification> {
    let payload = payload?;

    let parsed = match serde_json::from_slice::<PushPayload>(payload) {
      Ok(parsed) => parsed,
      Err(e) => {
        tracing::debug!(error = %e, "Push payload is not JSON, using it as text");
        PushPayload {
          title: None,
          body: String::from_utf8_lossy(payload).into_owned(),
          icon: None,
          badge: None,
          data: NotificationData::default(),
          actions: Vec::new(),
        }
      }
    };

    let notification = Notification {
      title: parsed.title.unwrap_or_else(|| self.app_name.clone()),
      body: parsed.body,
      icon: parsed.icon,
      badge: parsed.badge,
      data: parsed.data,
      actions: parsed.actions,
      require_interaction: true,
    };

    tracing::info!(title = %notification.title, "Showing notification");
    Some(notification)
  }

  /// Route a notification click.
  ///
  /// `view` and body clicks open the notification's URL (default: app
  /// root), `dismiss` does nothing, any other action opens the app root.
  pub fn on_click(&self, notification: &Notification, action: Option<&str>) -> ClickOutcome {
    let action = match action {
      None | Some("") | Some("view") => ClientAction::OpenWindow(self.target_of(notification)),
      Some("dismiss") => ClientAction::Nothing,
      Some(other) => {
        tracing::debug!(action = other, "Unknown notification action, opening app root");
        ClientAction::OpenWindow(self.app_root.clone())
      }
    };

    ClickOutcome {
      close: true,
      action,
    }
  }

  fn target_of(&self, notification: &Notification) -> Url {
    notification
      .data
      .url
      .as_deref()
      .and_then(|u| match self.origin.join(u) {
        Ok(url) => Some(url),
        Err(e) => {
          tracing::warn!(url = u, error = %e, "Invalid notification URL");
          None
        }
      })
      .unwrap_or_else(|| self.app_root.clone())
  }
}
