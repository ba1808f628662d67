// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use dashmap::{mapref::entry::Entry, DashMap};

use super::{
  ArcService, RegistrationError, ServiceBuilder, ServiceConfig, ServiceDescriptor, ServiceError,
  ServiceInstanceId, ServiceKind, ServiceRegistry,
};
use crate::common::{
  protocol::tunnel::{ArcChannel, ChannelId},
  session::context::ExecutionContext,
};

/// Builds service instances for one channel and launches them into its registry
pub struct ServiceFactory {
  execution: Arc<ExecutionContext>,
  channel: ArcChannel,
  registry: Arc<ServiceRegistry>,
  builders: DashMap<ServiceKind, Box<dyn ServiceBuilder>>,
  destroyed: AtomicBool,
}

impl std::fmt::Debug for ServiceFactory {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ServiceFactory")
      .field("channel", &self.channel.id())
      .field("kinds", &self.registered_kinds())
      .field("destroyed", &self.is_destroyed())
      .finish()
  }
}

impl ServiceFactory {
  pub fn new(
    execution: Arc<ExecutionContext>,
    channel: ArcChannel,
    registry: Arc<ServiceRegistry>,
  ) -> Arc<Self> {
    let factory = Arc::new(Self {
      execution,
      channel,
      registry,
      builders: DashMap::new(),
      destroyed: AtomicBool::new(false),
    });
    factory.registry.bind_factory(Arc::downgrade(&factory));
    factory
  }

  /// Configures `builder` and makes its kind available
  ///
  /// At most one builder may exist per kind; a second registration for the
  /// same kind fails and leaves the first in place.
  pub fn register(
    &self,
    mut builder: Box<dyn ServiceBuilder>,
    config: &ServiceConfig,
  ) -> Result<(), RegistrationError> {
    if self.is_destroyed() {
      return Err(RegistrationError::Destroyed);
    }
    let kind = builder.kind();
    if self.builders.contains_key(&kind) {
      return Err(RegistrationError::Duplicate(kind));
    }
    builder.configure(config)?;
    match self.builders.entry(kind) {
      Entry::Occupied(_) => Err(RegistrationError::Duplicate(kind)),
      Entry::Vacant(slot) => {
        slot.insert(builder);
        tracing::debug!(%kind, channel = ?self.channel.id(), "service_builder_registered");
        Ok(())
      }
    }
  }

  /// Builds an instance without starting it
  pub fn create(&self, descriptor: &ServiceDescriptor) -> Result<ArcService, ServiceError> {
    if self.is_destroyed() {
      return Err(ServiceError::Destroyed);
    }
    let builder = self
      .builders
      .get(&descriptor.kind)
      .ok_or(ServiceError::UnknownKind(descriptor.kind))?;
    builder.build(descriptor)
  }

  /// Builds an instance and starts it in the registry
  pub fn launch(&self, descriptor: ServiceDescriptor) -> Result<ServiceInstanceId, ServiceError> {
    let service = self.create(&descriptor)?;
    self.registry.start(service, Arc::new(descriptor))
  }

  /// Stops every instance and forgets every builder; returns `false` if already destroyed
  pub fn destroy(&self) -> bool {
    if self.destroyed.swap(true, Ordering::AcqRel) {
      return false;
    }
    self.registry.destroy();
    self.builders.clear();
    tracing::debug!(channel = ?self.channel.id(), "service_factory_destroyed");
    true
  }

  pub fn is_destroyed(&self) -> bool {
    self.destroyed.load(Ordering::Acquire)
  }

  pub fn registry(&self) -> &Arc<ServiceRegistry> {
    &self.registry
  }

  pub fn channel(&self) -> &ArcChannel {
    &self.channel
  }

  pub fn execution(&self) -> &Arc<ExecutionContext> {
    &self.execution
  }

  pub fn registered_kinds(&self) -> Vec<ServiceKind> {
    let mut kinds: Vec<ServiceKind> = self.builders.iter().map(|e| *e.key()).collect();
    kinds.sort();
    kinds
  }
}

/// Maps each live channel to the factory serving it
#[derive(Default)]
pub struct ServiceDirectory {
  factories: DashMap<ChannelId, Arc<ServiceFactory>>,
}

impl std::fmt::Debug for ServiceDirectory {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ServiceDirectory")
      .field("channels", &self.factories.len())
      .finish()
  }
}

impl ServiceDirectory {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&self, id: ChannelId, factory: Arc<ServiceFactory>) -> Option<Arc<ServiceFactory>> {
    self.factories.insert(id, factory)
  }

  pub fn lookup(&self, id: ChannelId) -> Option<Arc<ServiceFactory>> {
    self.factories.get(&id).map(|f| Arc::clone(f.value()))
  }

  pub fn remove(&self, id: ChannelId) -> Option<Arc<ServiceFactory>> {
    self.factories.remove(&id).map(|(_, f)| f)
  }

  pub fn len(&self) -> usize {
    self.factories.len()
  }

  pub fn is_empty(&self) -> bool {
    self.factories.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::{ServiceDirectory, ServiceFactory};
  use crate::common::{
    protocol::{
      service::{
        testing::ScriptedBuilder, RegistrationError, ServiceConfig, ServiceDescriptor,
        ServiceError, ServiceKind, ServiceRegistry,
      },
      tunnel::{duplex, ArcChannel},
    },
    session::context::ExecutionContext,
  };
  use serde_json::json;
  use std::sync::Arc;

  fn factory() -> (Arc<ServiceFactory>, Arc<duplex::DuplexChannel>) {
    let duplex::EntangledChannels {
      listener,
      connector,
    } = duplex::channel();
    let execution = Arc::new(ExecutionContext::current());
    let channel: ArcChannel = connector;
    let registry = ServiceRegistry::new(Arc::clone(&channel), Arc::clone(&execution));
    (ServiceFactory::new(execution, channel, registry), listener)
  }

  #[tokio::test]
  async fn one_builder_per_kind() {
    let (factory, _peer) = factory();
    factory
      .register(
        Box::new(ScriptedBuilder::new(ServiceKind::Process)),
        &ServiceConfig::default(),
      )
      .unwrap();
    assert!(matches!(
      factory.register(
        Box::new(ScriptedBuilder::new(ServiceKind::Process)),
        &ServiceConfig::default(),
      ),
      Err(RegistrationError::Duplicate(ServiceKind::Process))
    ));
    let mut rejecting = ScriptedBuilder::new(ServiceKind::Socks);
    rejecting.reject_config = true;
    assert!(matches!(
      factory.register(Box::new(rejecting), &ServiceConfig::default()),
      Err(RegistrationError::InvalidConfig { .. })
    ));
    assert_eq!(factory.registered_kinds(), vec![ServiceKind::Process]);
  }

  #[tokio::test]
  async fn launch_requires_a_builder() {
    let (factory, _peer) = factory();
    let descriptor = ServiceDescriptor::new("p", ServiceKind::Process, json!(null));
    assert!(matches!(
      factory.launch(descriptor.clone()),
      Err(ServiceError::UnknownKind(ServiceKind::Process))
    ));
    factory
      .register(
        Box::new(ScriptedBuilder::new(ServiceKind::Process)),
        &ServiceConfig::default(),
      )
      .unwrap();
    let instance = factory.launch(descriptor).unwrap();
    assert!(factory.registry().status(instance).is_some());
  }

  #[tokio::test]
  async fn destroyed_factory_refuses_everything() {
    let (factory, _peer) = factory();
    factory
      .register(
        Box::new(ScriptedBuilder::new(ServiceKind::Process)),
        &ServiceConfig::default(),
      )
      .unwrap();
    factory
      .launch(ServiceDescriptor::new("p", ServiceKind::Process, json!(null)))
      .unwrap();
    assert!(factory.destroy());
    assert!(!factory.destroy());
    assert!(factory.registry().is_destroyed());
    assert!(factory.registry().is_empty());
    assert!(matches!(
      factory.register(
        Box::new(ScriptedBuilder::new(ServiceKind::Socks)),
        &ServiceConfig::default(),
      ),
      Err(RegistrationError::Destroyed)
    ));
    assert!(matches!(
      factory.launch(ServiceDescriptor::new("p", ServiceKind::Process, json!(null))),
      Err(ServiceError::Destroyed)
    ));
  }

  #[tokio::test]
  async fn directory_tracks_factories_by_channel() {
    let (factory, _peer) = factory();
    let directory = ServiceDirectory::new();
    let id = factory.channel().id();
    assert!(directory.insert(id, Arc::clone(&factory)).is_none());
    assert!(Arc::ptr_eq(&directory.lookup(id).unwrap(), &factory));
    assert_eq!(directory.len(), 1);
    assert!(directory.remove(id).is_some());
    assert!(directory.lookup(id).is_none());
    assert!(directory.is_empty());
  }
}
