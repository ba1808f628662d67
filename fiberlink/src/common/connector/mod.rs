// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Outbound transport establishment
//!
//! A [NetworkConnector] turns an [EndpointDescriptor] into a connected
//! [Connection]. The session never interprets the descriptor itself.

use std::{
  collections::BTreeMap,
  net::SocketAddr,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::common::protocol::tunnel::ChannelError;

pub mod quinn_connector;

pub use self::quinn_connector::{QuinnConnection, QuinnConnector};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
  pub host: String,
  pub port: u16,
  /// Name presented for peer verification; the host is used when absent
  #[serde(default)]
  pub server_name: Option<String>,
  /// Connector-specific settings
  #[serde(default)]
  pub parameters: BTreeMap<String, String>,
}

impl EndpointDescriptor {
  pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
      server_name: None,
      parameters: BTreeMap::new(),
    }
  }

  pub fn with_server_name<S: Into<String>>(mut self, server_name: S) -> Self {
    self.server_name = Some(server_name.into());
    self
  }

  pub fn server_name(&self) -> &str {
    self.server_name.as_deref().unwrap_or(&self.host)
  }
}

impl std::fmt::Display for EndpointDescriptor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}

#[derive(thiserror::Error, Debug)]
pub enum ResolutionError {
  #[error("Failed to resolve host {host}")]
  Lookup {
    host: String,
    #[source]
    source: std::io::Error,
  },
  #[error("Host {0} resolved to no addresses")]
  NoAddresses(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
  #[error("Connection refused by {0}")]
  Refused(SocketAddr),
  #[error("No addresses were available to connect to")]
  NoAddresses,
  #[error("Endpoint configuration was rejected: {0}")]
  InvalidEndpoint(String),
  #[error("Transport failure while connecting: {0}")]
  Transport(#[from] ChannelError),
  #[error("IO failure while connecting: {0}")]
  Io(#[from] std::io::Error),
}

/// Best-effort emergency shutdown of a connection
///
/// Cloneable and idempotent: only the first `shutdown` call reaches the
/// underlying transport, no matter which clone makes it.
#[derive(Clone)]
pub struct ShutdownHandle {
  inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
  done: AtomicBool,
  action: Box<dyn Fn() + Send + Sync + 'static>,
}

impl ShutdownHandle {
  pub fn new<F>(action: F) -> Self
  where
    F: Fn() + Send + Sync + 'static,
  {
    Self {
      inner: Arc::new(ShutdownInner {
        done: AtomicBool::new(false),
        action: Box::new(action),
      }),
    }
  }

  /// Returns `true` only for the call that performed the shutdown
  pub fn shutdown(&self) -> bool {
    if self.inner.done.swap(true, Ordering::AcqRel) {
      return false;
    }
    (self.inner.action)();
    true
  }

  pub fn is_shut_down(&self) -> bool {
    self.inner.done.load(Ordering::Acquire)
  }
}

impl std::fmt::Debug for ShutdownHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ShutdownHandle")
      .field("shut_down", &self.is_shut_down())
      .finish()
  }
}

/// A connected, not yet multiplexed, transport
pub trait Connection: Send + 'static {
  fn remote_address(&self) -> Option<SocketAddr>;

  fn shutdown_handle(&self) -> ShutdownHandle;
}

pub trait NetworkConnector: Send + Sync + 'static {
  type Connection: Connection;

  fn resolve<'a>(
    &'a self,
    endpoint: &'a EndpointDescriptor,
  ) -> BoxFuture<'a, Result<Vec<SocketAddr>, ResolutionError>>;

  fn connect<'a>(
    &'a self,
    endpoint: &'a EndpointDescriptor,
    addresses: Vec<SocketAddr>,
  ) -> BoxFuture<'a, Result<Self::Connection, ConnectError>>;
}

/// Resolves `host:port` through the system resolver
pub async fn lookup_endpoint(
  endpoint: &EndpointDescriptor,
) -> Result<Vec<SocketAddr>, ResolutionError> {
  let addresses: Vec<SocketAddr> = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
    .await
    .map_err(|source| ResolutionError::Lookup {
      host: endpoint.host.clone(),
      source,
    })?
    .collect();
  if addresses.is_empty() {
    return Err(ResolutionError::NoAddresses(endpoint.host.clone()));
  }
  Ok(addresses)
}
