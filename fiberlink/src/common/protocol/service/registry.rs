// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc, Mutex, PoisonError, Weak,
};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{
  ArcService, ServiceContext, ServiceDescriptor, ServiceError, ServiceFactory, ServiceInstanceId,
  ServiceKind, ServiceStatus,
};
use crate::common::{
  protocol::tunnel::{ArcChannel, ChannelId},
  session::context::ExecutionContext,
};

/// Told about every instance that leaves the registry, except during destruction
pub struct ExitHook(
  Box<dyn Fn(ServiceInstanceId, Arc<ServiceDescriptor>, Result<(), ServiceError>) + Send + Sync>,
);

impl ExitHook {
  pub fn new<F>(hook: F) -> Self
  where
    F: Fn(ServiceInstanceId, Arc<ServiceDescriptor>, Result<(), ServiceError>)
      + Send
      + Sync
      + 'static,
  {
    Self(Box::new(hook))
  }
}

struct ActiveService {
  descriptor: Arc<ServiceDescriptor>,
  kind: ServiceKind,
  token: CancellationToken,
  task: Option<JoinHandle<()>>,
}

impl ActiveService {
  fn halt(self) {
    self.token.cancel();
    if let Some(task) = self.task {
      task.abort();
    }
  }
}

/// Service instances running over one channel
pub struct ServiceRegistry {
  channel: ArcChannel,
  execution: Arc<ExecutionContext>,
  services: DashMap<ServiceInstanceId, ActiveService>,
  root: CancellationToken,
  destroyed: AtomicBool,
  factory: Mutex<Weak<ServiceFactory>>,
  exit_hook: ArcSwapOption<ExitHook>,
}

impl std::fmt::Debug for ServiceRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ServiceRegistry")
      .field("channel", &self.channel.id())
      .field("active", &self.services.len())
      .field("destroyed", &self.is_destroyed())
      .finish()
  }
}

impl ServiceRegistry {
  pub fn new(channel: ArcChannel, execution: Arc<ExecutionContext>) -> Arc<Self> {
    Arc::new(Self {
      channel,
      execution,
      services: DashMap::new(),
      root: CancellationToken::new(),
      destroyed: AtomicBool::new(false),
      factory: Mutex::new(Weak::new()),
      exit_hook: ArcSwapOption::empty(),
    })
  }

  pub fn channel_id(&self) -> ChannelId {
    self.channel.id()
  }

  pub(super) fn bind_factory(&self, factory: Weak<ServiceFactory>) {
    *self.factory.lock().unwrap_or_else(PoisonError::into_inner) = factory;
  }

  fn factory(&self) -> Weak<ServiceFactory> {
    self
      .factory
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Replaces the exit hook; ignored once destroyed
  pub fn set_exit_hook(&self, hook: ExitHook) {
    if !self.is_destroyed() {
      self.exit_hook.store(Some(Arc::new(hook)));
    }
  }

  fn report_exit(
    &self,
    instance: ServiceInstanceId,
    descriptor: Arc<ServiceDescriptor>,
    result: Result<(), ServiceError>,
  ) {
    if let Some(hook) = self.exit_hook.load_full() {
      (hook.0)(instance, descriptor, result);
    }
  }

  /// Starts `service` as a new tracked instance
  pub fn start(
    self: &Arc<Self>,
    service: ArcService,
    descriptor: Arc<ServiceDescriptor>,
  ) -> Result<ServiceInstanceId, ServiceError> {
    if self.is_destroyed() {
      return Err(ServiceError::Destroyed);
    }
    let instance = ServiceInstanceId::new();
    let token = self.root.child_token();
    let context = ServiceContext {
      instance,
      descriptor: Arc::clone(&descriptor),
      channel: Arc::clone(&self.channel),
      shutdown: token.clone().into(),
      execution: Arc::clone(&self.execution),
      factory: self.factory(),
    };
    self.services.insert(
      instance,
      ActiveService {
        descriptor: Arc::clone(&descriptor),
        kind: service.kind(),
        token,
        task: None,
      },
    );
    // Destruction may have swept the map between the check above and the insert
    if self.is_destroyed() {
      if let Some((_, active)) = self.services.remove(&instance) {
        active.halt();
      }
      return Err(ServiceError::Destroyed);
    }

    let span = tracing::debug_span!(
      "service",
      %instance,
      name = %descriptor.name,
      kind = %descriptor.kind,
      channel = ?self.channel.id(),
    );
    let registry = Arc::downgrade(self);
    let task = self.execution.spawn(
      async move {
        tracing::debug!("service_started");
        let result = service.run(context).await;
        match &result {
          Ok(()) => tracing::debug!("service_finished"),
          Err(error) => tracing::warn!(?error, "service_failed"),
        }
        if let Some(registry) = registry.upgrade() {
          registry.finished(instance, result);
        }
      }
      .instrument(span),
    );
    match self.services.get_mut(&instance) {
      Some(mut active) => active.task = Some(task),
      // Already finished and removed itself
      None => drop(task),
    }
    Ok(instance)
  }

  fn finished(&self, instance: ServiceInstanceId, result: Result<(), ServiceError>) {
    if let Some((_, active)) = self.services.remove(&instance) {
      active.token.cancel();
      self.report_exit(instance, active.descriptor, result);
    }
  }

  /// Cancels and removes one instance
  pub fn stop(&self, instance: ServiceInstanceId) -> Result<(), ServiceError> {
    let (_, active) = self
      .services
      .remove(&instance)
      .ok_or(ServiceError::NotFound(instance))?;
    let descriptor = Arc::clone(&active.descriptor);
    active.halt();
    tracing::debug!(%instance, "service_stopped");
    self.report_exit(instance, descriptor, Ok(()));
    Ok(())
  }

  /// Cancels every instance; returns `false` if already destroyed
  pub fn destroy(&self) -> bool {
    if self.destroyed.swap(true, Ordering::AcqRel) {
      return false;
    }
    self.exit_hook.store(None);
    self.root.cancel();
    let instances: Vec<ServiceInstanceId> = self.services.iter().map(|e| *e.key()).collect();
    for instance in instances {
      if let Some((_, active)) = self.services.remove(&instance) {
        active.halt();
      }
    }
    tracing::debug!(channel = ?self.channel.id(), "service_registry_destroyed");
    true
  }

  pub fn is_destroyed(&self) -> bool {
    self.destroyed.load(Ordering::Acquire)
  }

  pub fn status(&self, instance: ServiceInstanceId) -> Option<ServiceStatus> {
    self.services.get(&instance).map(|active| ServiceStatus {
      instance,
      name: active.descriptor.name.clone(),
      kind: active.kind,
      running: !active.token.is_cancelled(),
    })
  }

  pub fn statuses(&self) -> Vec<ServiceStatus> {
    self
      .services
      .iter()
      .map(|entry| ServiceStatus {
        instance: *entry.key(),
        name: entry.descriptor.name.clone(),
        kind: entry.kind,
        running: !entry.token.is_cancelled(),
      })
      .collect()
  }

  pub fn len(&self) -> usize {
    self.services.len()
  }

  pub fn is_empty(&self) -> bool {
    self.services.is_empty()
  }

  pub fn count_of(&self, kind: ServiceKind) -> usize {
    self.services.iter().filter(|e| e.kind == kind).count()
  }

  pub fn kind_of(&self, instance: ServiceInstanceId) -> Option<ServiceKind> {
    self.services.get(&instance).map(|e| e.kind)
  }
}

impl Drop for ServiceRegistry {
  fn drop(&mut self) {
    self.destroy();
  }
}

#[cfg(test)]
mod tests {
  use super::{ExitHook, ServiceRegistry};
  use crate::common::{
    protocol::{
      service::{
        testing::ScriptedBuilder, ServiceBuilder, ServiceDescriptor, ServiceError, ServiceKind,
      },
      tunnel::duplex,
    },
    session::context::ExecutionContext,
  };
  use serde_json::json;
  use std::{
    sync::{Arc, Mutex},
    time::Duration,
  };

  fn descriptor(name: &str, behavior: &str) -> Arc<ServiceDescriptor> {
    Arc::new(ServiceDescriptor::new(
      name,
      ServiceKind::Process,
      json!({ "behavior": behavior }),
    ))
  }

  fn registry() -> Arc<ServiceRegistry> {
    let channels = duplex::channel();
    ServiceRegistry::new(channels.connector, Arc::new(ExecutionContext::current()))
  }

  #[tokio::test]
  async fn finished_services_leave_and_report() {
    let registry = registry();
    let exits = Arc::new(Mutex::new(Vec::new()));
    {
      let exits = Arc::clone(&exits);
      registry.set_exit_hook(ExitHook::new(move |_, descriptor, result| {
        exits
          .lock()
          .unwrap()
          .push((descriptor.name.clone(), result.is_ok()));
      }));
    }
    let builder = ScriptedBuilder::new(ServiceKind::Process);
    for (name, behavior) in [("ok", "finish"), ("bad", "fail")] {
      let d = descriptor(name, behavior);
      registry.start(builder.build(&d).unwrap(), d).unwrap();
    }
    tokio::time::timeout(Duration::from_secs(5), async {
      while exits.lock().unwrap().len() < 2 {
        tokio::task::yield_now().await;
      }
    })
    .await
    .expect("Both services must report their exit");
    let mut exits = exits.lock().unwrap().clone();
    exits.sort();
    assert_eq!(
      exits,
      vec![(String::from("bad"), false), (String::from("ok"), true)]
    );
    assert!(registry.is_empty());
  }

  #[tokio::test]
  async fn stop_removes_and_reports_once() {
    let registry = registry();
    let exits = Arc::new(Mutex::new(0usize));
    {
      let exits = Arc::clone(&exits);
      registry.set_exit_hook(ExitHook::new(move |_, _, _| *exits.lock().unwrap() += 1));
    }
    let d = descriptor("parked", "park");
    let builder = ScriptedBuilder::new(ServiceKind::Process);
    let instance = registry.start(builder.build(&d).unwrap(), d).unwrap();
    assert!(registry.status(instance).unwrap().running);
    registry.stop(instance).unwrap();
    assert!(matches!(
      registry.stop(instance),
      Err(ServiceError::NotFound(_))
    ));
    tokio::task::yield_now().await;
    assert_eq!(*exits.lock().unwrap(), 1);
    assert!(registry.status(instance).is_none());
  }

  #[tokio::test]
  async fn destroy_is_idempotent_and_silent() {
    let registry = registry();
    let exits = Arc::new(Mutex::new(0usize));
    {
      let exits = Arc::clone(&exits);
      registry.set_exit_hook(ExitHook::new(move |_, _, _| *exits.lock().unwrap() += 1));
    }
    let builder = ScriptedBuilder::new(ServiceKind::Process);
    for i in 0..3 {
      let d = descriptor(&format!("parked-{}", i), "park");
      registry.start(builder.build(&d).unwrap(), d).unwrap();
    }
    assert_eq!(registry.count_of(ServiceKind::Process), 3);
    assert!(registry.destroy());
    assert!(!registry.destroy());
    assert!(registry.is_empty());
    let d = descriptor("late", "park");
    assert!(matches!(
      registry.start(builder.build(&d).unwrap(), d),
      Err(ServiceError::Destroyed)
    ));
    tokio::task::yield_now().await;
    assert_eq!(*exits.lock().unwrap(), 0);
  }
}
