// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Handshakes performed over a freshly connected transport
//!
//! The session lends the connection to a [HandshakeInitiator] for exactly one
//! attempt and takes it back, whatever the outcome, before fiberization.

use futures::future::BoxFuture;

use crate::{
  common::protocol::tunnel::ChannelError,
  util::{cancellation::CancellationListener, tunnel_stream::WrappedStream},
};

mod no_op;
mod simple_ack;

pub use self::no_op::NoOpHandshake;
pub use self::simple_ack::SimpleAckHandshake;

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
  #[error("Peer violated the handshake protocol: {0}")]
  ProtocolViolation(String),
  #[error("Handshake rejected by peer: {0}")]
  Rejected(String),
  #[error("IO failure during handshake: {0}")]
  Io(#[from] std::io::Error),
  #[error("Transport failure during handshake: {0}")]
  Transport(#[from] ChannelError),
  #[error("Handshake cancelled by shutdown")]
  Cancelled,
}

/// Performs the client side of a handshake over a connection of type `C`
///
/// Each call is one attempt and resolves exactly once.
pub trait HandshakeInitiator<C>: Send + Sync + 'static {
  fn handshake<'a>(
    &'a self,
    connection: &'a mut C,
    shutdown: &'a CancellationListener,
  ) -> BoxFuture<'a, Result<(), HandshakeError>>;
}

impl<C, H> HandshakeInitiator<C> for std::sync::Arc<H>
where
  H: HandshakeInitiator<C> + ?Sized,
{
  fn handshake<'a>(
    &'a self,
    connection: &'a mut C,
    shutdown: &'a CancellationListener,
  ) -> BoxFuture<'a, Result<(), HandshakeError>> {
    (**self).handshake(connection, shutdown)
  }
}

/// Raw stream access to a connection before it is fiberized
pub trait HandshakeTransport: Send {
  fn open_fiber(&mut self) -> BoxFuture<'_, Result<WrappedStream, ChannelError>>;

  fn accept_fiber(&mut self) -> BoxFuture<'_, Result<WrappedStream, ChannelError>>;
}
