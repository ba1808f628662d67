// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The client session: one outbound connection, handshaken, fiberized, and
//! populated with services
//!
//! A [Session] drives `connect -> handshake -> fiberize -> bootstrap`, then
//! sits in the active phase until its channel closes, at which point the
//! channel's close handle tears the services down. Every observable event is
//! reported through the [Notifier] and arrives on the session's own
//! [ExecutionContext] queue, never on the call stack that caused it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use self::{
  context::ExecutionContext,
  notification::{Notification, NotificationCallback, NotificationKind, Notifier},
};
use crate::{
  common::{
    connector::{
      ConnectError, Connection, EndpointDescriptor, NetworkConnector, ResolutionError,
      ShutdownHandle,
    },
    handshake::{HandshakeError, HandshakeInitiator},
    protocol::{
      control::{CommandTable, ControlParams, ControlService},
      service::{
        RegistrationError, ServiceBuilder, ServiceConfigs, ServiceDescriptor, ServiceDirectory,
        ServiceError, ServiceFactory, ServiceRegistry,
      },
      tunnel::{
        ArcChannel, ChannelCloseHandle, ChannelCloseReason, ChannelId, MonotonicAtomicGenerator,
        Multiplexer,
      },
    },
  },
  util::cancellation::CancellationListener,
};

pub mod config;
pub mod context;
pub mod notification;

pub use self::config::{ConfigError, SessionConfig};

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
  #[error("Session has already been started")]
  Busy,
  #[error("Endpoint resolution failed: {0}")]
  Resolution(#[from] ResolutionError),
  #[error("Connection failed: {0}")]
  Connect(#[from] ConnectError),
  #[error("Handshake failed: {0}")]
  Handshake(#[from] HandshakeError),
  #[error("Service registration failed during bootstrap: {0}")]
  BootstrapRegistration(#[from] RegistrationError),
  #[error("Control service failed to start: {0}")]
  ControlServiceStart(#[source] ServiceError),
  #[error("Service failure: {0}")]
  Service(#[source] ServiceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
  Idle,
  Connecting,
  Handshaking,
  Active,
  Closed,
}

impl std::fmt::Display for Phase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Debug::fmt(self, f)
  }
}

/// Produces a fresh, unconfigured builder for each run
pub type BuilderSource = Arc<dyn Fn() -> Box<dyn ServiceBuilder> + Send + Sync + 'static>;

struct SessionState<T> {
  phase: Phase,
  /// Bumped by every `run` and `stop`; stage completions from older runs are discarded
  generation: u64,
  shutdown: Option<ShutdownHandle>,
  /// Connection kept after a failed handshake, until `stop`
  held: Option<T>,
  channel: Option<ArcChannel>,
  run_token: Option<CancellationToken>,
  /// Generation whose bootstrap is in progress; its CLOSE must follow its TRANSPORT
  bootstrapping: Option<u64>,
  deferred_close: Option<u64>,
}

impl<T> Default for SessionState<T> {
  fn default() -> Self {
    Self {
      phase: Phase::Idle,
      generation: 0,
      shutdown: None,
      held: None,
      channel: None,
      run_token: None,
      bootstrapping: None,
      deferred_close: None,
    }
  }
}

struct Shared<C: NetworkConnector, H, M> {
  connector: C,
  handshake: H,
  multiplexer: M,
  descriptors: Vec<ServiceDescriptor>,
  configs: ServiceConfigs,
  builders: Vec<BuilderSource>,
  context: Arc<ExecutionContext>,
  notifier: Notifier,
  directory: ServiceDirectory,
  commands: Arc<CommandTable>,
  channel_ids: MonotonicAtomicGenerator,
  state: Mutex<SessionState<C::Connection>>,
}

impl<C, H, M> Shared<C, H, M>
where
  C: NetworkConnector,
  H: HandshakeInitiator<C::Connection>,
  M: Multiplexer<C::Connection> + 'static,
{
  fn state(&self) -> MutexGuard<'_, SessionState<C::Connection>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Moves to `phase` and posts `notification`, unless the run has been superseded
  fn settle(&self, generation: u64, phase: Option<Phase>, notification: Notification) -> bool {
    let mut state = self.state();
    if state.generation != generation {
      tracing::debug!(generation, current = state.generation, kind = %notification.kind, "stale_completion_discarded");
      return false;
    }
    if let Some(phase) = phase {
      state.phase = phase;
    }
    // Posting only enqueues; it cannot re-enter the session
    self.notifier.notify(notification);
    true
  }

  async fn establish(
    self: Arc<Self>,
    endpoint: EndpointDescriptor,
    generation: u64,
    token: CancellationToken,
  ) {
    let addresses = match self.connector.resolve(&endpoint).await {
      Ok(addresses) => addresses,
      Err(error) => {
        tracing::warn!(%endpoint, ?error, "endpoint_resolution_failed");
        let mut state = self.state();
        if state.generation == generation {
          state.phase = Phase::Idle;
          state.run_token = None;
          self
            .notifier
            .notify(Notification::new(NotificationKind::Network).with_error(error));
          // Idle sessions ignore `stop`, so the queue is closed here instead
          self.context.stop();
        }
        return;
      }
    };
    tracing::debug!(?addresses, "endpoint_resolved");

    let mut connection = match self.connector.connect(&endpoint, addresses).await {
      Ok(connection) => connection,
      Err(error) => {
        tracing::warn!(%endpoint, ?error, "connect_attempt_failed");
        self.settle(
          generation,
          Some(Phase::Closed),
          Notification::new(NotificationKind::Network).with_error(error),
        );
        return;
      }
    };
    tracing::debug!(remote = ?connection.remote_address(), "connected");

    let accepted = {
      let mut state = self.state();
      if state.generation == generation {
        state.shutdown = Some(connection.shutdown_handle());
        state.phase = Phase::Handshaking;
        true
      } else {
        false
      }
    };
    if !accepted {
      tracing::debug!(generation, "connection_arrived_after_stop");
      connection.shutdown_handle().shutdown();
      return;
    }

    let listener = CancellationListener::from(token);
    let outcome = self.handshake.handshake(&mut connection, &listener).await;
    match outcome {
      Err(error) => {
        tracing::warn!(?error, "handshake_failed");
        let held = {
          let mut state = self.state();
          if state.generation == generation {
            state.held = Some(connection);
            self
              .notifier
              .notify(Notification::new(NotificationKind::Network).with_error(error));
            None
          } else {
            Some(connection)
          }
        };
        if let Some(connection) = held {
          connection.shutdown_handle().shutdown();
        }
      }
      Ok(()) => {
        tracing::info!("handshake_complete");
        if !self.settle(
          generation,
          None,
          Notification::new(NotificationKind::Network),
        ) {
          connection.shutdown_handle().shutdown();
          return;
        }
        if let Err(error) = self.bootstrap(connection, generation) {
          tracing::warn!(?error, "bootstrap_incomplete");
        }
        self.finish_bootstrap(generation);
      }
    }
  }

  /// Fiberizes `connection` and populates the channel's services
  ///
  /// Only the last failure is returned; every step after fiberization is
  /// attempted regardless of earlier registration failures.
  fn bootstrap(
    self: &Arc<Self>,
    connection: C::Connection,
    generation: u64,
  ) -> Result<(), SessionError> {
    {
      let mut state = self.state();
      if state.generation == generation {
        state.bootstrapping = Some(generation);
      }
    }
    let replaced = self.commands.register_builtin();
    tracing::trace!(replaced, "control_commands_registered");

    let channel_id = self.channel_ids.next();
    let on_close = {
      let shared = Arc::downgrade(self);
      ChannelCloseHandle::new(move |id, reason| match shared.upgrade() {
        Some(shared) => shared.teardown(id, generation, &reason),
        None => tracing::debug!(channel_id = ?id, "channel_closed_after_session_dropped"),
      })
    };
    let channel = self.multiplexer.fiberize(connection, channel_id, on_close);
    tracing::info!(?channel_id, addr = %channel.addr(), "channel_fiberized");

    let superseded = {
      let mut state = self.state();
      if state.generation != generation {
        true
      } else {
        // A channel that closed during fiberization has already been torn down
        if !channel.is_closed() {
          state.channel = Some(Arc::clone(&channel));
          state.phase = Phase::Active;
        }
        false
      }
    };
    if superseded {
      channel.close(ChannelCloseReason::GracefulExit {
        remote_initiated: false,
      });
      return Ok(());
    }

    let registry = ServiceRegistry::new(Arc::clone(&channel), Arc::clone(&self.context));
    let factory = ServiceFactory::new(Arc::clone(&self.context), Arc::clone(&channel), registry);
    self.directory.insert(channel_id, Arc::clone(&factory));
    if channel.is_closed() {
      if let Some(factory) = self.directory.remove(channel_id) {
        factory.destroy();
      }
      tracing::debug!(?channel_id, "channel_closed_during_bootstrap");
      return Ok(());
    }

    let mut last_error = None;
    for source in &self.builders {
      let builder = source();
      let kind = builder.kind();
      if let Err(error) = factory.register(builder, &self.configs.get(kind)) {
        tracing::warn!(%kind, ?error, "service_registration_failed");
        last_error = Some(SessionError::BootstrapRegistration(error));
      }
    }

    let control = ControlService::create(
      Arc::clone(&self.context),
      Arc::clone(&channel),
      ControlParams::default(),
      Arc::clone(&self.commands),
    );
    control.attach(self.descriptors.clone(), self.notifier.clone());
    factory
      .registry()
      .start(control, Arc::new(ControlService::descriptor()))
      .map_err(SessionError::ControlServiceStart)?;

    match last_error {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }

  /// Posts TRANSPORT, then any CLOSE held back while the bootstrap ran
  fn finish_bootstrap(&self, generation: u64) {
    let mut state = self.state();
    if state.bootstrapping == Some(generation) {
      state.bootstrapping = None;
    }
    let deferred = state.deferred_close == Some(generation);
    if deferred {
      state.deferred_close = None;
    }
    if state.generation == generation {
      self
        .notifier
        .notify(Notification::new(NotificationKind::Transport));
    } else {
      tracing::debug!(generation, current = state.generation, "stale_transport_discarded");
    }
    if deferred {
      self
        .notifier
        .notify(Notification::new(NotificationKind::Close));
    }
  }

  /// Runs once per channel, from its close handle
  fn teardown(&self, channel_id: ChannelId, generation: u64, reason: &ChannelCloseReason) {
    tracing::info!(?channel_id, %reason, "channel_closed");
    match self.directory.remove(channel_id) {
      Some(factory) => {
        factory.destroy();
      }
      None => tracing::debug!(?channel_id, "teardown_without_services"),
    }
    let released = {
      let mut state = self.state();
      let released = if state.generation == generation {
        state.phase = Phase::Closed;
        state.channel.take()
      } else {
        None
      };
      if state.bootstrapping == Some(generation) {
        tracing::debug!(?channel_id, "close_deferred_until_transport");
        state.deferred_close = Some(generation);
      } else {
        self
          .notifier
          .notify(Notification::new(NotificationKind::Close));
      }
      released
    };
    drop(released);
  }
}

/// A client session over connector `C`, handshake `H` and multiplexer `M`
pub struct Session<C, H, M>
where
  C: NetworkConnector,
  H: HandshakeInitiator<C::Connection>,
  M: Multiplexer<C::Connection> + 'static,
{
  shared: Arc<Shared<C, H, M>>,
}

impl<C, H, M> std::fmt::Debug for Session<C, H, M>
where
  C: NetworkConnector,
  H: HandshakeInitiator<C::Connection>,
  M: Multiplexer<C::Connection> + 'static,
{
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Session")
      .field("phase", &self.phase())
      .field("services", &self.shared.descriptors.len())
      .finish_non_exhaustive()
  }
}

impl<C, H, M> Session<C, H, M>
where
  C: NetworkConnector,
  H: HandshakeInitiator<C::Connection>,
  M: Multiplexer<C::Connection> + 'static,
{
  pub fn builder(connector: C, handshake: H, multiplexer: M) -> SessionBuilder<C, H, M> {
    SessionBuilder::new(connector, handshake, multiplexer)
  }

  /// Starts connecting to `endpoint`
  ///
  /// Only [SessionError::Busy] is reported here; everything that goes wrong
  /// later arrives as a notification.
  pub fn run(&self, endpoint: EndpointDescriptor) -> Result<(), SessionError> {
    let (generation, token) = {
      let mut state = self.shared.state();
      match state.phase {
        Phase::Idle | Phase::Closed => {}
        phase => {
          tracing::debug!(%phase, "run_rejected_busy");
          return Err(SessionError::Busy);
        }
      }
      state.generation += 1;
      state.phase = Phase::Connecting;
      let token = CancellationToken::new();
      state.run_token = Some(token.clone());
      (state.generation, token)
    };
    self.shared.context.start();
    let span = tracing::info_span!("session", generation, %endpoint);
    self.shared.context.spawn(
      Arc::clone(&self.shared)
        .establish(endpoint, generation, token)
        .instrument(span),
    );
    Ok(())
  }

  /// Closes everything this session holds; never fails and may be repeated
  pub fn stop(&self) {
    let (token, channel, shutdown, held) = {
      let mut state = self.shared.state();
      if state.phase == Phase::Idle {
        return;
      }
      state.generation += 1;
      state.phase = Phase::Closed;
      (
        state.run_token.take(),
        state.channel.take(),
        state.shutdown.take(),
        state.held.take(),
      )
    };
    if let Some(token) = token {
      token.cancel();
    }
    if let Some(channel) = channel {
      channel.close(ChannelCloseReason::GracefulExit {
        remote_initiated: false,
      });
    }
    if let Some(shutdown) = shutdown {
      if !shutdown.shutdown() {
        tracing::trace!("connection_already_shut_down");
      }
    }
    self.shared.context.stop();
    drop(held);
    tracing::debug!("session_stopped");
  }

  pub fn phase(&self) -> Phase {
    self.shared.state().phase
  }

  /// The live channel, while the session is active
  pub fn channel(&self) -> Option<ArcChannel> {
    self.shared.state().channel.clone()
  }

  /// The factory serving the live channel
  pub fn factory(&self) -> Option<Arc<ServiceFactory>> {
    let id = self.channel()?.id();
    self.shared.directory.lookup(id)
  }

  pub fn directory(&self) -> &ServiceDirectory {
    &self.shared.directory
  }

  pub fn commands(&self) -> &Arc<CommandTable> {
    &self.shared.commands
  }

  pub fn execution_context(&self) -> &Arc<ExecutionContext> {
    &self.shared.context
  }
}

impl<C, H, M> Drop for Session<C, H, M>
where
  C: NetworkConnector,
  H: HandshakeInitiator<C::Connection>,
  M: Multiplexer<C::Connection> + 'static,
{
  fn drop(&mut self) {
    self.stop();
  }
}

pub struct SessionBuilder<C, H, M> {
  connector: C,
  handshake: H,
  multiplexer: M,
  descriptors: Vec<ServiceDescriptor>,
  configs: ServiceConfigs,
  builders: Vec<BuilderSource>,
  callback: Option<NotificationCallback>,
  runtime: Option<Handle>,
}

impl<C, H, M> SessionBuilder<C, H, M>
where
  C: NetworkConnector,
  H: HandshakeInitiator<C::Connection>,
  M: Multiplexer<C::Connection> + 'static,
{
  pub fn new(connector: C, handshake: H, multiplexer: M) -> Self {
    Self {
      connector,
      handshake,
      multiplexer,
      descriptors: Vec::new(),
      configs: ServiceConfigs::default(),
      builders: Vec::new(),
      callback: None,
      runtime: None,
    }
  }

  pub fn services(mut self, descriptors: Vec<ServiceDescriptor>) -> Self {
    self.descriptors = descriptors;
    self
  }

  pub fn service_configs(mut self, configs: ServiceConfigs) -> Self {
    self.configs = configs;
    self
  }

  pub fn config(self, config: SessionConfig) -> Self {
    self
      .services(config.services)
      .service_configs(config.service_configs)
  }

  /// Registers a builder kind; `source` is called once per run
  pub fn service_builder<F, B>(mut self, source: F) -> Self
  where
    F: Fn() -> B + Send + Sync + 'static,
    B: ServiceBuilder,
  {
    self
      .builders
      .push(Arc::new(move || Box::new(source()) as Box<dyn ServiceBuilder>));
    self
  }

  pub fn on_notification<F>(mut self, callback: F) -> Self
  where
    F: Fn(Notification) + Send + Sync + 'static,
  {
    self.callback = Some(Arc::new(callback));
    self
  }

  pub fn runtime(mut self, runtime: Handle) -> Self {
    self.runtime = Some(runtime);
    self
  }

  /// Panics outside of a tokio runtime unless [runtime](Self::runtime) was given
  pub fn build(self) -> Session<C, H, M> {
    let runtime = self.runtime.unwrap_or_else(Handle::current);
    let context = Arc::new(ExecutionContext::new(runtime));
    let notifier = Notifier::new(Arc::clone(&context), self.callback);
    Session {
      shared: Arc::new(Shared {
        connector: self.connector,
        handshake: self.handshake,
        multiplexer: self.multiplexer,
        descriptors: self.descriptors,
        configs: self.configs,
        builders: self.builders,
        context,
        notifier,
        directory: ServiceDirectory::new(),
        commands: Arc::new(CommandTable::new()),
        channel_ids: MonotonicAtomicGenerator::new(1),
        state: Mutex::new(SessionState::default()),
      }),
    }
  }
}
