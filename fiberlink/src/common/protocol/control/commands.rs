// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Commands understood by the control service, built by name from a [CommandTable]

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;

use super::{launch_reported, ControlRequest, ControlResponse};
use crate::common::{
  protocol::service::{ServiceDescriptor, ServiceFactory, ServiceInstanceId, ServiceKind},
  session::notification::Notifier,
};

pub const CREATE_SERVICE: &str = "create-service";
pub const STOP_SERVICE: &str = "stop-service";
pub const SERVICE_STATUS: &str = "service-status";

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
  #[error("Unknown control command {0:?}")]
  UnknownCommand(String),
  #[error("Invalid payload for control command {command:?}: {source}")]
  InvalidPayload {
    command: &'static str,
    #[source]
    source: serde_json::Error,
  },
}

/// What a command may act on: the channel's services, and the session's event stream
pub struct CommandContext {
  pub factory: Arc<ServiceFactory>,
  pub notifier: Option<Notifier>,
}

pub trait ControlCommand: Send + 'static {
  fn name(&self) -> &'static str;

  fn execute(self: Box<Self>, context: CommandContext) -> BoxFuture<'static, ControlResponse>;
}

pub type BoxedCommand = Box<dyn ControlCommand>;

pub type CommandConstructor = fn(serde_json::Value) -> Result<BoxedCommand, CommandError>;

fn payload<T: serde::de::DeserializeOwned>(
  command: &'static str,
  payload: serde_json::Value,
) -> Result<T, CommandError> {
  serde_json::from_value(payload).map_err(|source| CommandError::InvalidPayload { command, source })
}

/// Name-to-constructor table consulted for every incoming control request
#[derive(Default)]
pub struct CommandTable {
  constructors: DashMap<String, CommandConstructor>,
}

impl std::fmt::Debug for CommandTable {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CommandTable")
      .field("commands", &self.names())
      .finish()
  }
}

impl CommandTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Installs `constructor` under `name`, returning any constructor it replaced
  pub fn register<N: Into<String>>(
    &self,
    name: N,
    constructor: CommandConstructor,
  ) -> Option<CommandConstructor> {
    let name = name.into();
    let replaced = self.constructors.insert(name.clone(), constructor);
    if replaced.is_some() {
      tracing::debug!(command = %name, "control_command_replaced");
    }
    replaced
  }

  /// Installs the service management commands; returns how many were replaced
  pub fn register_builtin(&self) -> usize {
    [
      self.register(CREATE_SERVICE, CreateServiceCommand::construct),
      self.register(STOP_SERVICE, StopServiceCommand::construct),
      self.register(SERVICE_STATUS, ServiceStatusCommand::construct),
    ]
    .iter()
    .filter(|replaced| replaced.is_some())
    .count()
  }

  pub fn build(&self, request: ControlRequest) -> Result<BoxedCommand, CommandError> {
    let constructor = *self
      .constructors
      .get(&request.command)
      .ok_or_else(|| CommandError::UnknownCommand(request.command.clone()))?;
    constructor(request.payload)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.constructors.contains_key(name)
  }

  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.constructors.iter().map(|e| e.key().clone()).collect();
    names.sort();
    names
  }
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceCommand {
  pub descriptor: ServiceDescriptor,
}

impl CreateServiceCommand {
  fn construct(value: serde_json::Value) -> Result<BoxedCommand, CommandError> {
    Ok(Box::new(payload::<Self>(CREATE_SERVICE, value)?))
  }
}

impl ControlCommand for CreateServiceCommand {
  fn name(&self) -> &'static str {
    CREATE_SERVICE
  }

  fn execute(self: Box<Self>, context: CommandContext) -> BoxFuture<'static, ControlResponse> {
    async move {
      let name = self.descriptor.name.clone();
      match launch_reported(&context.factory, self.descriptor, context.notifier.as_ref()) {
        Ok(instance) => {
          tracing::info!(%instance, %name, "remote_service_created");
          ControlResponse::Created { instance }
        }
        Err(message) => ControlResponse::Error { message },
      }
    }
    .boxed()
  }
}

#[derive(Debug, Deserialize)]
pub struct StopServiceCommand {
  pub instance: ServiceInstanceId,
}

impl StopServiceCommand {
  fn construct(value: serde_json::Value) -> Result<BoxedCommand, CommandError> {
    Ok(Box::new(payload::<Self>(STOP_SERVICE, value)?))
  }
}

impl ControlCommand for StopServiceCommand {
  fn name(&self) -> &'static str {
    STOP_SERVICE
  }

  fn execute(self: Box<Self>, context: CommandContext) -> BoxFuture<'static, ControlResponse> {
    async move {
      let registry = context.factory.registry();
      if registry.kind_of(self.instance) == Some(ServiceKind::Control) {
        return ControlResponse::Error {
          message: String::from("The control service cannot be stopped remotely"),
        };
      }
      match registry.stop(self.instance) {
        Ok(()) => ControlResponse::Stopped {
          instance: self.instance,
        },
        Err(error) => ControlResponse::error(error),
      }
    }
    .boxed()
  }
}

#[derive(Debug, Default, Deserialize)]
pub struct ServiceStatusCommand {
  #[serde(default)]
  pub instance: Option<ServiceInstanceId>,
}

impl ServiceStatusCommand {
  fn construct(value: serde_json::Value) -> Result<BoxedCommand, CommandError> {
    // A bare request asks about every service
    let command = match value {
      serde_json::Value::Null => Self::default(),
      value => payload::<Self>(SERVICE_STATUS, value)?,
    };
    Ok(Box::new(command))
  }
}

impl ControlCommand for ServiceStatusCommand {
  fn name(&self) -> &'static str {
    SERVICE_STATUS
  }

  fn execute(self: Box<Self>, context: CommandContext) -> BoxFuture<'static, ControlResponse> {
    async move {
      let registry = context.factory.registry();
      let services = match self.instance {
        Some(instance) => registry.status(instance).into_iter().collect(),
        None => registry.statuses(),
      };
      ControlResponse::Status { services }
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::{CommandError, CommandTable, CREATE_SERVICE, SERVICE_STATUS, STOP_SERVICE};
  use crate::common::protocol::control::ControlRequest;
  use serde_json::json;

  #[test]
  fn builtin_registration_reports_replacements() {
    let table = CommandTable::new();
    assert_eq!(table.register_builtin(), 0);
    assert_eq!(table.register_builtin(), 3);
    assert_eq!(
      table.names(),
      vec![CREATE_SERVICE, SERVICE_STATUS, STOP_SERVICE]
    );
  }

  #[test]
  fn requests_are_built_by_name() {
    let table = CommandTable::new();
    table.register_builtin();
    let status = table
      .build(ControlRequest::new(SERVICE_STATUS, json!(null)))
      .unwrap();
    assert_eq!(status.name(), SERVICE_STATUS);
    assert!(matches!(
      table.build(ControlRequest::new("reboot", json!(null))),
      Err(CommandError::UnknownCommand(name)) if name == "reboot"
    ));
    assert!(matches!(
      table.build(ControlRequest::new(STOP_SERVICE, json!({ "instance": 7 }))),
      Err(CommandError::InvalidPayload { .. })
    ));
  }
}
