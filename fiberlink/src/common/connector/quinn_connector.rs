// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  io::BufReader,
  net::{Ipv4Addr, Ipv6Addr, SocketAddr},
  path::Path,
  sync::Arc,
};

use futures::{future::BoxFuture, FutureExt};
use tracing::Instrument;

use super::{
  lookup_endpoint, ConnectError, Connection, EndpointDescriptor, NetworkConnector,
  ResolutionError, ShutdownHandle,
};
use crate::{
  common::{
    handshake::HandshakeTransport,
    protocol::tunnel::ChannelError,
  },
  util::{self, tunnel_stream::WrappedStream},
};

/// Loads every parsable certificate from a PEM file as a trust root
pub fn load_pem_roots<P: AsRef<Path>>(path: P) -> std::io::Result<rustls::RootCertStore> {
  let file = std::fs::File::open(path)?;
  let ders = rustls_pemfile::certs(&mut BufReader::new(file))?;
  let mut roots = rustls::RootCertStore::empty();
  let (added, ignored) = roots.add_parsable_certificates(&ders);
  tracing::debug!(added, ignored, "loaded_pem_roots");
  if added == 0 {
    return Err(std::io::Error::new(
      std::io::ErrorKind::InvalidData,
      "No usable certificates were found in the authority file",
    ));
  }
  Ok(roots)
}

/// Builds a QUIC client configuration speaking the fiberlink ALPN
pub fn client_config_from_roots(roots: rustls::RootCertStore) -> quinn::ClientConfig {
  let mut crypto = rustls::ClientConfig::builder()
    .with_safe_defaults()
    .with_root_certificates(roots)
    .with_no_client_auth();
  crypto.alpn_protocols = vec![util::ALPN_FIBERLINK_1.to_vec()];
  quinn::ClientConfig::new(Arc::new(crypto))
}

/// Connects over QUIC, one client endpoint per connection
pub struct QuinnConnector {
  client_config: quinn::ClientConfig,
}

impl QuinnConnector {
  pub fn new(client_config: quinn::ClientConfig) -> Self {
    Self { client_config }
  }

  async fn connect_one(
    &self,
    addr: SocketAddr,
    server_name: &str,
  ) -> Result<QuinnConnection, ConnectError> {
    let bind_addr: SocketAddr = if addr.is_ipv6() {
      (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
      (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let mut endpoint = quinn::Endpoint::client(bind_addr)?;
    endpoint.set_default_client_config(self.client_config.clone());
    let connecting = endpoint
      .connect(addr, server_name)
      .map_err(|e| ConnectError::InvalidEndpoint(e.to_string()))?;
    let connection = connecting.await.map_err(|e| match e {
      quinn::ConnectionError::ConnectionClosed(_) => ConnectError::Refused(addr),
      other => ConnectError::Transport(other.into()),
    })?;
    Ok(QuinnConnection {
      connection,
      endpoint,
    })
  }
}

impl std::fmt::Debug for QuinnConnector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "({})", std::any::type_name::<Self>())
  }
}

impl NetworkConnector for QuinnConnector {
  type Connection = QuinnConnection;

  fn resolve<'a>(
    &'a self,
    endpoint: &'a EndpointDescriptor,
  ) -> BoxFuture<'a, Result<Vec<SocketAddr>, ResolutionError>> {
    lookup_endpoint(endpoint).boxed()
  }

  fn connect<'a>(
    &'a self,
    endpoint: &'a EndpointDescriptor,
    addresses: Vec<SocketAddr>,
  ) -> BoxFuture<'a, Result<Self::Connection, ConnectError>> {
    let span = tracing::debug_span!("quinn_connect", %endpoint);
    async move {
      let mut last_error = ConnectError::NoAddresses;
      for addr in addresses {
        match self.connect_one(addr, endpoint.server_name()).await {
          Ok(connection) => {
            tracing::info!(remote = ?addr, "connected");
            return Ok(connection);
          }
          Err(error) => {
            tracing::debug!(remote = ?addr, ?error, "connect_attempt_failed");
            last_error = error;
          }
        }
      }
      Err(last_error)
    }
    .instrument(span)
    .boxed()
  }
}

/// A connected QUIC session awaiting fiberization
///
/// Holds its client endpoint so the socket outlives the handshake.
pub struct QuinnConnection {
  connection: quinn::Connection,
  endpoint: quinn::Endpoint,
}

impl QuinnConnection {
  pub fn into_inner(self) -> (quinn::Connection, quinn::Endpoint) {
    (self.connection, self.endpoint)
  }
}

impl Connection for QuinnConnection {
  fn remote_address(&self) -> Option<SocketAddr> {
    Some(self.connection.remote_address())
  }

  fn shutdown_handle(&self) -> ShutdownHandle {
    let connection = self.connection.clone();
    ShutdownHandle::new(move || {
      connection.close(quinn::VarInt::from_u32(0), b"shutdown");
    })
  }
}

impl HandshakeTransport for QuinnConnection {
  fn open_fiber(&mut self) -> BoxFuture<'_, Result<WrappedStream, ChannelError>> {
    let connection = self.connection.clone();
    async move {
      let streams = connection.open_bi().await?;
      Ok(WrappedStream::from(streams))
    }
    .boxed()
  }

  fn accept_fiber(&mut self) -> BoxFuture<'_, Result<WrappedStream, ChannelError>> {
    let connection = self.connection.clone();
    async move {
      let streams = connection.accept_bi().await?;
      Ok(WrappedStream::from(streams))
    }
    .boxed()
  }
}
