// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Microservices that run over a multiplexed channel
//!
//! Each channel gets its own [ServiceRegistry] and [ServiceFactory]. Builders
//! are registered against the factory by [ServiceKind]; instances are created
//! from [ServiceDescriptor]s and tracked by the registry until they exit or
//! the channel goes away.

use std::{
  collections::BTreeMap,
  sync::{Arc, Weak},
};

use downcast_rs::{impl_downcast, DowncastSync};
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
  common::{
    protocol::tunnel::{ArcChannel, ChannelError},
    session::context::ExecutionContext,
  },
  util::cancellation::CancellationListener,
};

mod factory;
mod registry;

pub use self::factory::{ServiceDirectory, ServiceFactory};
pub use self::registry::{ExitHook, ServiceRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
  Socks,
  TcpForward,
  TcpListen,
  UdpForward,
  UdpListen,
  CopyFile,
  Process,
  Control,
}

impl ServiceKind {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Socks => "socks",
      Self::TcpForward => "tcp-forward",
      Self::TcpListen => "tcp-listen",
      Self::UdpForward => "udp-forward",
      Self::UdpListen => "udp-listen",
      Self::CopyFile => "copy-file",
      Self::Process => "process",
      Self::Control => "control",
    }
  }
}

impl std::fmt::Display for ServiceKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

/// Parses a JSON parameter blob, treating `null` as an empty object
fn parse_object<T: DeserializeOwned>(value: &serde_json::Value) -> Result<T, serde_json::Error> {
  match value {
    serde_json::Value::Null => serde_json::from_value(serde_json::Value::Object(Default::default())),
    other => T::deserialize(other),
  }
}

/// A request for one service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
  pub name: String,
  pub kind: ServiceKind,
  #[serde(default)]
  pub parameters: serde_json::Value,
}

impl ServiceDescriptor {
  pub fn new<N: Into<String>>(name: N, kind: ServiceKind, parameters: serde_json::Value) -> Self {
    Self {
      name: name.into(),
      kind,
      parameters,
    }
  }

  pub fn parse_parameters<T: DeserializeOwned>(&self) -> Result<T, ServiceError> {
    parse_object(&self.parameters).map_err(|e| ServiceError::InvalidParameters(e.to_string()))
  }
}

/// Configuration handed unmodified to the builder of one [ServiceKind]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceConfig(serde_json::Value);

impl ServiceConfig {
  pub fn new(value: serde_json::Value) -> Self {
    Self(value)
  }

  pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
    parse_object(&self.0)
  }

  pub fn as_value(&self) -> &serde_json::Value {
    &self.0
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceConfigs(BTreeMap<ServiceKind, ServiceConfig>);

impl ServiceConfigs {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, kind: ServiceKind, config: ServiceConfig) -> Option<ServiceConfig> {
    self.0.insert(kind, config)
  }

  /// The slice for `kind`, or an empty configuration
  pub fn get(&self, kind: ServiceKind) -> ServiceConfig {
    self.0.get(&kind).cloned().unwrap_or_default()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&ServiceKind, &ServiceConfig)> {
    self.0.iter()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceInstanceId(uuid::Uuid);

impl ServiceInstanceId {
  pub fn new() -> Self {
    Self(uuid::Uuid::new_v4())
  }
}

impl Default for ServiceInstanceId {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Display for ServiceInstanceId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
  pub instance: ServiceInstanceId,
  pub name: String,
  pub kind: ServiceKind,
  pub running: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
  #[error("No builder is registered for service kind {0}")]
  UnknownKind(ServiceKind),
  #[error("Invalid service parameters: {0}")]
  InvalidParameters(String),
  #[error("Service container has been destroyed")]
  Destroyed,
  #[error("No service instance {0}")]
  NotFound(ServiceInstanceId),
  #[error("Service request refused: {0}")]
  Refused(String),
  #[error("Service IO failure: {0}")]
  Io(#[from] std::io::Error),
  #[error("Service channel failure: {0}")]
  Channel(#[from] ChannelError),
  #[error("Service failed: {0}")]
  Failed(String),
}

#[derive(thiserror::Error, Debug)]
pub enum RegistrationError {
  #[error("A builder for service kind {0} is already registered")]
  Duplicate(ServiceKind),
  #[error("Service factory has been destroyed")]
  Destroyed,
  #[error("Invalid configuration for service kind {kind}: {reason}")]
  InvalidConfig { kind: ServiceKind, reason: String },
}

/// Everything a running service instance may reach
#[derive(Clone)]
pub struct ServiceContext {
  pub instance: ServiceInstanceId,
  pub descriptor: Arc<ServiceDescriptor>,
  pub channel: ArcChannel,
  pub shutdown: CancellationListener,
  pub execution: Arc<ExecutionContext>,
  factory: Weak<ServiceFactory>,
}

impl ServiceContext {
  /// The factory that owns this instance, while it is still alive
  pub fn factory(&self) -> Option<Arc<ServiceFactory>> {
    self.factory.upgrade()
  }
}

impl std::fmt::Debug for ServiceContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ServiceContext")
      .field("instance", &self.instance)
      .field("descriptor", &self.descriptor.name)
      .field("channel", &self.channel.id())
      .finish_non_exhaustive()
  }
}

pub trait Service: DowncastSync {
  fn kind(&self) -> ServiceKind;

  /// Runs until the service finishes or `context.shutdown` fires
  fn run(self: Arc<Self>, context: ServiceContext) -> BoxFuture<'static, Result<(), ServiceError>>;
}
impl_downcast!(sync Service);

pub type ArcService = Arc<dyn Service>;

pub trait ServiceBuilder: Send + Sync + 'static {
  fn kind(&self) -> ServiceKind;

  /// Accepts this kind's configuration slice; called once, at registration
  fn configure(&mut self, config: &ServiceConfig) -> Result<(), RegistrationError>;

  fn build(&self, descriptor: &ServiceDescriptor) -> Result<ArcService, ServiceError>;
}

#[cfg(test)]
pub(crate) mod testing {
  //! A scriptable service for registry and session tests
  use super::{
    ArcService, RegistrationError, Service, ServiceBuilder, ServiceConfig, ServiceContext,
    ServiceDescriptor, ServiceError, ServiceKind,
  };
  use futures::{future::BoxFuture, FutureExt};
  use std::sync::Arc;

  #[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
  #[serde(rename_all = "kebab-case")]
  pub enum Behavior {
    /// Runs until cancelled
    Park,
    /// Returns immediately
    Finish,
    /// Returns an error immediately
    Fail,
  }

  #[derive(Debug, serde::Deserialize)]
  struct Parameters {
    #[serde(default = "default_behavior")]
    behavior: Behavior,
  }

  fn default_behavior() -> Behavior {
    Behavior::Park
  }

  pub struct ScriptedService {
    kind: ServiceKind,
    behavior: Behavior,
  }

  impl Service for ScriptedService {
    fn kind(&self) -> ServiceKind {
      self.kind
    }

    fn run(self: Arc<Self>, context: ServiceContext) -> BoxFuture<'static, Result<(), ServiceError>> {
      async move {
        match self.behavior {
          Behavior::Park => {
            context.shutdown.cancelled().await;
            Ok(())
          }
          Behavior::Finish => Ok(()),
          Behavior::Fail => Err(ServiceError::Failed(String::from("scripted failure"))),
        }
      }
      .boxed()
    }
  }

  pub struct ScriptedBuilder {
    pub kind: ServiceKind,
    pub reject_config: bool,
  }

  impl ScriptedBuilder {
    pub fn new(kind: ServiceKind) -> Self {
      Self {
        kind,
        reject_config: false,
      }
    }
  }

  impl ServiceBuilder for ScriptedBuilder {
    fn kind(&self) -> ServiceKind {
      self.kind
    }

    fn configure(&mut self, _config: &ServiceConfig) -> Result<(), RegistrationError> {
      if self.reject_config {
        return Err(RegistrationError::InvalidConfig {
          kind: self.kind,
          reason: String::from("scripted rejection"),
        });
      }
      Ok(())
    }

    fn build(&self, descriptor: &ServiceDescriptor) -> Result<ArcService, ServiceError> {
      let parameters: Parameters = descriptor.parse_parameters()?;
      Ok(Arc::new(ScriptedService {
        kind: self.kind,
        behavior: parameters.behavior,
      }))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{ServiceConfig, ServiceConfigs, ServiceDescriptor, ServiceKind};
  use serde_json::json;

  #[test]
  fn descriptor_wire_shape() {
    let descriptor: ServiceDescriptor = serde_json::from_value(json!({
      "name": "db",
      "kind": "tcp-forward",
      "parameters": { "listen": "127.0.0.1:0" }
    }))
    .unwrap();
    assert_eq!(descriptor.kind, ServiceKind::TcpForward);
    let bare: ServiceDescriptor =
      serde_json::from_value(json!({ "name": "c", "kind": "control" })).unwrap();
    assert!(bare.parameters.is_null());
  }

  #[test]
  fn configs_fall_back_to_empty() {
    let configs: ServiceConfigs = serde_json::from_value(json!({
      "tcp-forward": { "allow_non_loopback": true }
    }))
    .unwrap();
    assert_eq!(
      configs.get(ServiceKind::TcpForward).as_value()["allow_non_loopback"],
      json!(true)
    );
    assert_eq!(configs.get(ServiceKind::Socks), ServiceConfig::default());

    #[derive(serde::Deserialize)]
    struct Empty {
      #[serde(default)]
      flag: bool,
    }
    let parsed: Empty = configs.get(ServiceKind::Socks).parse().unwrap();
    assert!(!parsed.flag);
  }
}
