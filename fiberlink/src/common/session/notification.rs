// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use serde::Serialize;

use super::{context::ExecutionContext, SessionError};
use crate::common::protocol::service::ServiceDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
  /// Outcome of the connect or handshake stage
  Network,
  /// The channel is up and bootstrap has run
  Transport,
  /// The channel has closed and its services are gone
  Close,
  ServiceStarted,
  ServiceStopped,
  ServiceError,
}

impl std::fmt::Display for NotificationKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Self::Network => "NETWORK",
      Self::Transport => "TRANSPORT",
      Self::Close => "CLOSE",
      Self::ServiceStarted => "SERVICE_STARTED",
      Self::ServiceStopped => "SERVICE_STOPPED",
      Self::ServiceError => "SERVICE_ERROR",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone)]
pub struct Notification {
  pub kind: NotificationKind,
  pub service: Option<Arc<ServiceDescriptor>>,
  pub error: Option<Arc<SessionError>>,
}

impl Notification {
  pub fn new(kind: NotificationKind) -> Self {
    Self {
      kind,
      service: None,
      error: None,
    }
  }

  pub fn with_service(mut self, service: Arc<ServiceDescriptor>) -> Self {
    self.service = Some(service);
    self
  }

  pub fn with_error<E: Into<SessionError>>(mut self, error: E) -> Self {
    self.error = Some(Arc::new(error.into()));
    self
  }

  pub fn with_result<E: Into<SessionError>>(self, result: Result<(), E>) -> Self {
    match result {
      Ok(()) => self,
      Err(error) => self.with_error(error),
    }
  }

  pub fn is_error(&self) -> bool {
    self.error.is_some()
  }
}

impl std::fmt::Display for Notification {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.kind)?;
    if let Some(service) = &self.service {
      write!(f, " [{}]", service.name)?;
    }
    if let Some(error) = &self.error {
      write!(f, ": {}", error)?;
    }
    Ok(())
  }
}

pub type NotificationCallback = Arc<dyn Fn(Notification) + Send + Sync + 'static>;

/// The funnel every observable session event passes through
///
/// Notifications are posted to the session's [ExecutionContext], never
/// delivered inline, so the callback sees them one at a time and in order.
#[derive(Clone)]
pub struct Notifier {
  context: Arc<ExecutionContext>,
  callback: Option<NotificationCallback>,
}

impl std::fmt::Debug for Notifier {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Notifier")
      .field("has_callback", &self.callback.is_some())
      .finish_non_exhaustive()
  }
}

impl Notifier {
  pub fn new(context: Arc<ExecutionContext>, callback: Option<NotificationCallback>) -> Self {
    Self { context, callback }
  }

  pub fn notify(&self, notification: Notification) {
    let callback = match &self.callback {
      Some(callback) => Arc::clone(callback),
      None => {
        tracing::trace!(%notification, "notification_dropped_without_callback");
        return;
      }
    };
    tracing::debug!(%notification, "notification_posted");
    let kind = notification.kind;
    if !self.context.post(move || callback(notification)) {
      tracing::debug!(%kind, "notification_dropped_queue_closed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{Notification, NotificationKind, Notifier};
  use crate::common::session::{context::ExecutionContext, SessionError};
  use std::{
    sync::{Arc, Mutex},
    time::Duration,
  };

  #[tokio::test]
  async fn notifications_are_queued_not_inline() {
    let context = Arc::new(ExecutionContext::current());
    context.start();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let notifier = {
      let seen = Arc::clone(&seen);
      Notifier::new(
        Arc::clone(&context),
        Some(Arc::new(move |n: Notification| seen.lock().unwrap().push(n.kind))),
      )
    };
    notifier.notify(Notification::new(NotificationKind::Network));
    notifier.notify(Notification::new(NotificationKind::Close).with_error(SessionError::Busy));
    assert!(
      seen.lock().unwrap().is_empty(),
      "Nothing may be delivered on the notifying call stack"
    );
    context.stop();
    tokio::time::timeout(Duration::from_secs(5), context.drained())
      .await
      .unwrap();
    assert_eq!(
      *seen.lock().unwrap(),
      vec![NotificationKind::Network, NotificationKind::Close]
    );
  }

  #[tokio::test]
  async fn absent_callback_drops_notifications() {
    let context = Arc::new(ExecutionContext::current());
    context.start();
    let notifier = Notifier::new(Arc::clone(&context), None);
    notifier.notify(Notification::new(NotificationKind::Transport));
    context.stop();
    tokio::time::timeout(Duration::from_secs(5), context.drained())
      .await
      .unwrap();
  }

  #[test]
  fn display_includes_error() {
    let n = Notification::new(NotificationKind::Network).with_error(SessionError::Busy);
    assert!(n.is_error());
    assert!(n.to_string().starts_with("NETWORK: "));
  }
}
