// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The control service: started first on every channel, it launches the
//! locally configured services and answers service management requests
//! arriving from the peer.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::{
  future::{BoxFuture, FutureExt},
  StreamExt,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::{
  common::{
    protocol::{
      service::{
        ExitHook, Service, ServiceContext, ServiceDescriptor, ServiceError, ServiceFactory,
        ServiceInstanceId, ServiceKind, ServiceStatus,
      },
      tunnel::{ArcChannel, ChannelError, FiberIncomingType},
    },
    session::{
      context::ExecutionContext,
      notification::{Notification, NotificationKind, Notifier},
      SessionError,
    },
  },
  util::{
    framed::{read_framed_json, write_framed_json, JsonReadError, JsonWriteError},
    tunnel_stream::WrappedStream,
    MAX_CONTROL_FRAME_LENGTH,
  },
};

mod client;
pub mod commands;

pub use self::client::ControlClient;
pub use self::commands::{CommandContext, CommandError, CommandTable, ControlCommand};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlParams {
  /// Largest request or response frame; defaults to 64 KiB
  #[serde(default)]
  pub max_frame_length: Option<usize>,
}

impl ControlParams {
  fn frame_limit(&self) -> usize {
    self.max_frame_length.unwrap_or(MAX_CONTROL_FRAME_LENGTH)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
  pub command: String,
  #[serde(default)]
  pub payload: serde_json::Value,
}

impl ControlRequest {
  pub fn new<N: Into<String>>(command: N, payload: serde_json::Value) -> Self {
    Self {
      command: command.into(),
      payload,
    }
  }

  pub fn create_service(descriptor: &ServiceDescriptor) -> Self {
    Self::new(
      commands::CREATE_SERVICE,
      serde_json::json!({ "descriptor": descriptor }),
    )
  }

  pub fn stop_service(instance: ServiceInstanceId) -> Self {
    Self::new(
      commands::STOP_SERVICE,
      serde_json::json!({ "instance": instance }),
    )
  }

  pub fn service_status(instance: Option<ServiceInstanceId>) -> Self {
    Self::new(
      commands::SERVICE_STATUS,
      serde_json::json!({ "instance": instance }),
    )
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum ControlResponse {
  Created { instance: ServiceInstanceId },
  Stopped { instance: ServiceInstanceId },
  Status { services: Vec<ServiceStatus> },
  Error { message: String },
}

impl ControlResponse {
  pub fn error<E: std::fmt::Display>(error: E) -> Self {
    Self::Error {
      message: error.to_string(),
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum ControlError {
  #[error("Control link could not be opened: {0}")]
  Channel(#[from] ChannelError),
  #[error("Control request could not be read: {0}")]
  Read(#[from] JsonReadError),
  #[error("Control response could not be written: {0}")]
  Write(#[from] JsonWriteError),
  #[error("Control link IO failure: {0}")]
  Io(#[from] std::io::Error),
}

/// Creates and starts `descriptor`, reporting SERVICE_STARTED or SERVICE_ERROR
///
/// The start is reported before the instance is spawned, so its exit can
/// never be observed ahead of it.
pub(crate) fn launch_reported(
  factory: &ServiceFactory,
  descriptor: ServiceDescriptor,
  notifier: Option<&Notifier>,
) -> Result<ServiceInstanceId, String> {
  let report = |notification: Notification| {
    if let Some(notifier) = notifier {
      notifier.notify(notification);
    }
  };
  let descriptor = Arc::new(descriptor);
  let started = factory.create(&descriptor).and_then(|service| {
    report(
      Notification::new(NotificationKind::ServiceStarted).with_service(Arc::clone(&descriptor)),
    );
    factory.registry().start(service, Arc::clone(&descriptor))
  });
  started.map_err(|error| {
    let message = error.to_string();
    report(
      Notification::new(NotificationKind::ServiceError)
        .with_service(descriptor)
        .with_error(SessionError::Service(error)),
    );
    message
  })
}

#[derive(Default)]
struct Attachment {
  descriptors: Vec<ServiceDescriptor>,
  notifier: Option<Notifier>,
}

pub struct ControlService {
  execution: Arc<ExecutionContext>,
  channel: ArcChannel,
  params: ControlParams,
  commands: Arc<CommandTable>,
  attachment: Mutex<Attachment>,
}

impl std::fmt::Debug for ControlService {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ControlService")
      .field("channel", &self.channel.id())
      .field("params", &self.params)
      .finish_non_exhaustive()
  }
}

impl ControlService {
  pub fn create(
    execution: Arc<ExecutionContext>,
    channel: ArcChannel,
    params: ControlParams,
    commands: Arc<CommandTable>,
  ) -> Arc<Self> {
    Arc::new(Self {
      execution,
      channel,
      params,
      commands,
      attachment: Mutex::new(Attachment::default()),
    })
  }

  /// Supplies the services to launch on start, and where to report on them
  pub fn attach(&self, descriptors: Vec<ServiceDescriptor>, notifier: Notifier) {
    let mut attachment = self
      .attachment
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    attachment.descriptors = descriptors;
    attachment.notifier = Some(notifier);
  }

  pub fn descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new("control", ServiceKind::Control, serde_json::Value::Null)
  }

  fn take_attachment(&self) -> Attachment {
    std::mem::take(
      &mut *self
        .attachment
        .lock()
        .unwrap_or_else(PoisonError::into_inner),
    )
  }

  fn install_exit_hook(factory: &ServiceFactory, notifier: Notifier) {
    factory
      .registry()
      .set_exit_hook(ExitHook::new(move |instance, descriptor, result| {
        if descriptor.kind == ServiceKind::Control {
          return;
        }
        tracing::debug!(%instance, name = %descriptor.name, "service_exited");
        notifier.notify(
          Notification::new(NotificationKind::ServiceStopped)
            .with_service(descriptor)
            .with_result(result.map_err(SessionError::Service)),
        );
      }));
  }

  fn launch_attached(
    factory: &ServiceFactory,
    descriptors: Vec<ServiceDescriptor>,
    notifier: Option<&Notifier>,
  ) {
    for descriptor in descriptors {
      let name = descriptor.name.clone();
      match launch_reported(factory, descriptor, notifier) {
        Ok(instance) => tracing::info!(%instance, %name, "local_service_started"),
        Err(error) => tracing::warn!(%error, %name, "local_service_start_failed"),
      }
    }
  }

  async fn serve(
    &self,
    context: &ServiceContext,
    factory: Weak<ServiceFactory>,
    notifier: Option<Notifier>,
  ) {
    let mut downlink = match self.channel.downlink().await {
      Some(downlink) => downlink,
      None => {
        tracing::debug!("control_downlink_unavailable");
        return;
      }
    };
    let shutdown = context.shutdown.clone();
    downlink
      .as_stream()
      .take_until(shutdown.cancelled())
      .for_each_concurrent(None, |incoming| {
        let factory = factory.clone();
        let notifier = notifier.clone();
        async move {
          match incoming {
            Ok(FiberIncomingType::BiStream(mut link)) => {
              if let Err(error) = self.answer(&mut link, factory, notifier).await {
                tracing::debug!(?error, "control_request_failed");
              }
            }
            Err(error) => tracing::debug!(?error, "control_fiber_failed"),
          }
        }
      })
      .await;
  }

  async fn answer(
    &self,
    link: &mut WrappedStream,
    factory: Weak<ServiceFactory>,
    notifier: Option<Notifier>,
  ) -> Result<(), ControlError> {
    let limit = self.params.frame_limit();
    let request: ControlRequest = read_framed_json(&mut *link, Some(limit)).await?;
    let command_name = request.command.clone();
    let response = match self.commands.build(request) {
      Ok(command) => match factory.upgrade() {
        Some(factory) if !factory.is_destroyed() => {
          command
            .execute(CommandContext { factory, notifier })
            .await
        }
        _ => ControlResponse::error(ServiceError::Destroyed),
      },
      Err(error) => ControlResponse::error(error),
    };
    tracing::debug!(command = %command_name, ?response, "control_request_answered");
    write_framed_json(&mut *link, &response, Some(limit)).await?;
    link.flush().await?;
    link.shutdown().await?;
    Ok(())
  }
}

impl Service for ControlService {
  fn kind(&self) -> ServiceKind {
    ServiceKind::Control
  }

  fn run(self: Arc<Self>, context: ServiceContext) -> BoxFuture<'static, Result<(), ServiceError>> {
    async move {
      let factory = context.factory().ok_or(ServiceError::Destroyed)?;
      let Attachment {
        descriptors,
        notifier,
      } = self.take_attachment();
      if let Some(notifier) = &notifier {
        Self::install_exit_hook(&factory, notifier.clone());
      }
      Self::launch_attached(&factory, descriptors, notifier.as_ref());
      let factory = Arc::downgrade(&factory);
      tracing::debug!(execution = ?self.execution, "control_service_serving");
      self.serve(&context, factory, notifier).await;
      Ok(())
    }
    .boxed()
  }
}
