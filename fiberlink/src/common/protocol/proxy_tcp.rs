// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Local TCP listener whose connections are carried to the peer over fibers

use std::{
  net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
  sync::Arc,
};

use arc_swap::ArcSwapOption;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::{
  io::AsyncWriteExt,
  net::{TcpListener, TcpStream},
};
use tracing_futures::Instrument;

use super::{
  service::{
    ArcService, RegistrationError, Service, ServiceBuilder, ServiceConfig, ServiceContext,
    ServiceDescriptor, ServiceError, ServiceKind,
  },
  tunnel::ArcChannel,
};
use crate::util::{framed::write_framed_json, MAX_CONTROL_FRAME_LENGTH};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpForwardConfig {
  #[serde(default)]
  pub allow_non_loopback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpForwardParameters {
  pub listen: SocketAddr,
  /// Route address on the peer: `/tcp/<port>`, `/ip4/<addr>/tcp/<port>` or `/ip6/<addr>/tcp/<port>`
  pub target: String,
}

/// First frame written on every forwarding fiber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardHeader {
  pub target: String,
}

/// Resolves a route address; the bare `/tcp/<port>` form implies the peer's loopback
pub fn parse_route_address(addr: &str) -> Option<SocketAddr> {
  let parts = addr.splitn(5, '/').collect::<Vec<_>>();
  let (ip, port) = match parts.as_slice() {
    ["", "tcp", port] => (IpAddr::V4(Ipv4Addr::LOCALHOST), port),
    ["", "ip4", ip, "tcp", port] => (IpAddr::V4(ip.parse::<Ipv4Addr>().ok()?), port),
    ["", "ip6", ip, "tcp", port] => (IpAddr::V6(ip.parse::<Ipv6Addr>().ok()?), port),
    _ => return None,
  };
  Some(SocketAddr::new(ip, port.parse::<u16>().ok()?))
}

#[derive(Debug, Default)]
pub struct TcpForwardBuilder {
  config: TcpForwardConfig,
}

impl TcpForwardBuilder {
  pub fn new() -> Self {
    Self::default()
  }
}

impl ServiceBuilder for TcpForwardBuilder {
  fn kind(&self) -> ServiceKind {
    ServiceKind::TcpForward
  }

  fn configure(&mut self, config: &ServiceConfig) -> Result<(), RegistrationError> {
    self.config = config
      .parse()
      .map_err(|e: serde_json::Error| RegistrationError::InvalidConfig {
        kind: ServiceKind::TcpForward,
        reason: e.to_string(),
      })?;
    Ok(())
  }

  fn build(&self, descriptor: &ServiceDescriptor) -> Result<ArcService, ServiceError> {
    let parameters: TcpForwardParameters = descriptor.parse_parameters()?;
    if !self.config.allow_non_loopback && !parameters.listen.ip().is_loopback() {
      return Err(ServiceError::Refused(format!(
        "Listening on non-loopback address {} is not allowed",
        parameters.listen
      )));
    }
    if parse_route_address(&parameters.target).is_none() {
      return Err(ServiceError::InvalidParameters(format!(
        "Unsupported route address {:?}",
        parameters.target
      )));
    }
    Ok(Arc::new(TcpForwardService {
      parameters,
      bound: ArcSwapOption::empty(),
    }))
  }
}

pub struct TcpForwardService {
  parameters: TcpForwardParameters,
  bound: ArcSwapOption<SocketAddr>,
}

impl std::fmt::Debug for TcpForwardService {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TcpForwardService")
      .field("parameters", &self.parameters)
      .field("bound", &self.local_addr())
      .finish()
  }
}

impl TcpForwardService {
  pub fn parameters(&self) -> &TcpForwardParameters {
    &self.parameters
  }

  /// The listener's actual address once bound
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.bound.load_full().map(|addr| *addr)
  }

  async fn forward(
    channel: ArcChannel,
    target: String,
    mut connection: TcpStream,
  ) -> Result<(u64, u64), ServiceError> {
    let mut link = channel.open_link().await?;
    write_framed_json(
      &mut link,
      &ForwardHeader { target },
      Some(MAX_CONTROL_FRAME_LENGTH),
    )
    .await
    .map_err(|e| ServiceError::Failed(e.to_string()))?;
    link.flush().await?;
    Ok(tokio::io::copy_bidirectional(&mut connection, &mut link).await?)
  }
}

impl Service for TcpForwardService {
  fn kind(&self) -> ServiceKind {
    ServiceKind::TcpForward
  }

  fn run(self: Arc<Self>, context: ServiceContext) -> BoxFuture<'static, Result<(), ServiceError>> {
    async move {
      let listener = TcpListener::bind(self.parameters.listen).await?;
      let local_addr = listener.local_addr()?;
      self.bound.store(Some(Arc::new(local_addr)));
      tracing::info!(listen = %local_addr, target = %self.parameters.target, "tcp_forward_listening");
      loop {
        let accepted = tokio::select! {
          accepted = listener.accept() => accepted,
          _ = context.shutdown.cancelled() => break,
        };
        let (connection, peer) = match accepted {
          Ok(accepted) => accepted,
          Err(error) => {
            tracing::warn!(?error, "tcp_forward_accept_failed");
            continue;
          }
        };
        let channel = Arc::clone(&context.channel);
        let target = self.parameters.target.clone();
        let shutdown = context.shutdown.clone();
        let span = tracing::debug_span!("tcp_forward", %peer);
        context.execution.spawn(
          async move {
            tokio::select! {
              res = Self::forward(channel, target, connection) => match res {
                Ok((sent, received)) => tracing::debug!(sent, received, "tcp_forward_closed"),
                Err(error) => tracing::debug!(?error, "tcp_forward_failed"),
              },
              _ = shutdown.cancelled() => tracing::trace!("tcp_forward_cancelled"),
            }
          }
          .instrument(span),
        );
      }
      self.bound.store(None);
      Ok(())
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::{parse_route_address, ForwardHeader, TcpForwardBuilder, TcpForwardService};
  use crate::{
    common::{
      protocol::{
        service::{
          ServiceBuilder, ServiceConfig, ServiceDescriptor, ServiceError, ServiceFactory,
          ServiceKind, ServiceRegistry,
        },
        tunnel::{duplex, ArcChannel, FiberIncomingType, MultiplexedChannel},
      },
      session::context::ExecutionContext,
    },
    util::framed::read_framed_json,
  };
  use futures::StreamExt;
  use serde_json::json;
  use std::{sync::Arc, time::Duration};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[test]
  fn route_addresses() {
    assert_eq!(
      parse_route_address("/tcp/8080"),
      Some("127.0.0.1:8080".parse().unwrap())
    );
    assert_eq!(
      parse_route_address("/ip6/::1/tcp/22"),
      Some("[::1]:22".parse().unwrap())
    );
    assert_eq!(parse_route_address("/ip4/10.0.0.1/udp/53"), None);
    assert_eq!(parse_route_address("/tcp/99999"), None);
  }

  #[test]
  fn non_loopback_listeners_need_permission() {
    let descriptor = ServiceDescriptor::new(
      "wide",
      ServiceKind::TcpForward,
      json!({ "listen": "0.0.0.0:0", "target": "/tcp/80" }),
    );
    let mut builder = TcpForwardBuilder::new();
    assert!(matches!(
      builder.build(&descriptor),
      Err(ServiceError::Refused(_))
    ));
    builder
      .configure(&ServiceConfig::new(json!({ "allow_non_loopback": true })))
      .unwrap();
    assert!(builder.build(&descriptor).is_ok());
    let bad_target = ServiceDescriptor::new(
      "bad",
      ServiceKind::TcpForward,
      json!({ "listen": "127.0.0.1:0", "target": "tcp:80" }),
    );
    assert!(matches!(
      builder.build(&bad_target),
      Err(ServiceError::InvalidParameters(_))
    ));
  }

  #[tokio::test]
  async fn connections_are_carried_over_fibers() {
    let duplex::EntangledChannels {
      listener: peer,
      connector,
    } = duplex::channel();
    let context = Arc::new(ExecutionContext::current());
    let channel: ArcChannel = connector;
    let registry = ServiceRegistry::new(Arc::clone(&channel), Arc::clone(&context));
    let factory = ServiceFactory::new(Arc::clone(&context), channel, registry);
    factory
      .register(Box::new(TcpForwardBuilder::new()), &ServiceConfig::default())
      .unwrap();
    let descriptor = ServiceDescriptor::new(
      "fwd",
      ServiceKind::TcpForward,
      json!({ "listen": "127.0.0.1:0", "target": "/tcp/5432" }),
    );
    let service = factory.create(&descriptor).unwrap();
    let forward = Arc::clone(&service)
      .downcast_arc::<TcpForwardService>()
      .unwrap_or_else(|_| panic!("Builder must produce a TcpForwardService"));
    factory
      .registry()
      .start(service, Arc::new(descriptor))
      .unwrap();

    let test = async {
      let addr = loop {
        if let Some(addr) = forward.local_addr() {
          break addr;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
      };
      let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
      client.write_all(b"ping").await.unwrap();

      let mut downlink = peer.downlink().await.unwrap();
      let mut link = match downlink.as_stream().next().await.unwrap().unwrap() {
        FiberIncomingType::BiStream(link) => link,
      };
      let header: ForwardHeader = read_framed_json(&mut link, None).await.unwrap();
      assert_eq!(header.target, "/tcp/5432");
      let mut buf = [0u8; 4];
      link.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"ping");
      link.write_all(b"pong").await.unwrap();
      client.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"pong");
    };
    tokio::time::timeout(Duration::from_secs(5), test)
      .await
      .expect("Forwarding stalled");
    factory.destroy();
  }
}
