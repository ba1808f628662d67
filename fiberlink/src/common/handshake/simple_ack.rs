// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::Write;

use futures::{future::BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{HandshakeError, HandshakeInitiator, HandshakeTransport};
use crate::util::cancellation::CancellationListener;

const HEADER_LENGTH: usize = 64;
const GREETING: &str = "HELO";

/// Greets the peer on the first fiber and expects the greeting echoed back
///
/// The initiator writes a 64-byte, zero-padded `HELO`; the responder answers
/// with `HELO/HELO`, padded the same way.
#[derive(Default, Clone, Copy)]
pub struct SimpleAckHandshake;

impl SimpleAckHandshake {
  pub fn new() -> Self {
    Self
  }

  /// Runs the initiating half over an already-open stream
  pub async fn initiate_over<S>(&self, stream: &mut S) -> Result<(), HandshakeError>
  where
    S: AsyncRead + AsyncWrite + Send + Unpin + ?Sized,
  {
    tracing::debug!("Sending HELO...");
    let mut buffer = [0u8; HEADER_LENGTH];
    write!(&mut buffer[..], "{}", GREETING)?;
    stream.write_all(&buffer).await?;
    stream.flush().await?;
    buffer = [0u8; HEADER_LENGTH];
    stream.read_exact(&mut buffer).await?;
    let expected = format!("{}/{}\0", GREETING, GREETING);
    if !buffer.starts_with(expected.as_bytes()) {
      let received = String::from_utf8_lossy(trim_padding(&buffer)).into_owned();
      tracing::trace!(raw = %received, "bad_peer_ack");
      return Err(HandshakeError::ProtocolViolation(format!(
        "Unexpected acknowledgement {:?}",
        received
      )));
    }
    tracing::trace!("peer_ack");
    if let Err(error) = stream.shutdown().await {
      tracing::warn!(?error, "handshake_stream_shutdown_failed");
    }
    Ok(())
  }

  /// Runs the responding half over an already-open stream
  pub async fn respond_over<S>(&self, stream: &mut S) -> Result<(), HandshakeError>
  where
    S: AsyncRead + AsyncWrite + Send + Unpin + ?Sized,
  {
    let mut header = [0u8; HEADER_LENGTH];
    stream.read_exact(&mut header).await?;
    let greeting = std::str::from_utf8(trim_padding(&header))
      .map_err(|_| HandshakeError::ProtocolViolation(String::from("Greeting was not UTF-8")))?
      .to_string();
    if greeting.is_empty() || greeting.len() * 2 + 2 > HEADER_LENGTH {
      return Err(HandshakeError::ProtocolViolation(format!(
        "Greeting of {} bytes cannot be acknowledged",
        greeting.len()
      )));
    }
    tracing::debug!(%greeting, "received_greeting");
    header = [0u8; HEADER_LENGTH];
    write!(&mut header[..], "{}/{}", greeting, greeting)?;
    stream.write_all(&header).await?;
    stream.flush().await?;
    Ok(())
  }

  /// Plays the peer role on a raw connection by accepting its first fiber
  pub async fn respond_channel<C>(&self, connection: &mut C) -> Result<(), HandshakeError>
  where
    C: HandshakeTransport + ?Sized,
  {
    let mut stream = connection.accept_fiber().await?;
    self.respond_over(&mut stream).await
  }
}

fn trim_padding(buffer: &[u8]) -> &[u8] {
  let end = buffer
    .iter()
    .position(|x| *x == 0)
    .unwrap_or(buffer.len());
  &buffer[..end]
}

impl std::fmt::Debug for SimpleAckHandshake {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "({})", std::any::type_name::<SimpleAckHandshake>())
  }
}

impl<C> HandshakeInitiator<C> for SimpleAckHandshake
where
  C: HandshakeTransport + 'static,
{
  fn handshake<'a>(
    &'a self,
    connection: &'a mut C,
    shutdown: &'a CancellationListener,
  ) -> BoxFuture<'a, Result<(), HandshakeError>> {
    async move {
      let exchange = async {
        let mut stream = connection.open_fiber().await?;
        self.initiate_over(&mut stream).await
      };
      tokio::select! {
        res = exchange => res,
        _ = shutdown.cancelled() => Err(HandshakeError::Cancelled),
      }
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::SimpleAckHandshake;
  use crate::common::{
    handshake::{HandshakeError, HandshakeInitiator},
    protocol::tunnel::duplex::connection_pair,
  };
  use crate::util::cancellation::CancellationListener;
  use std::time::Duration;
  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
  use tokio_util::sync::CancellationToken;

  #[tokio::test]
  async fn greeting_is_echoed() {
    // A small buffer ensures neither side needs a minimum to make progress
    let (mut client, mut server) = duplex(64);
    let handshake = SimpleAckHandshake::new();
    let (client_res, server_res) = tokio::time::timeout(
      Duration::from_secs(5),
      futures::future::join(
        handshake.initiate_over(&mut client),
        handshake.respond_over(&mut server),
      ),
    )
    .await
    .expect("Handshake stalled");
    server_res.unwrap();
    client_res.unwrap();
  }

  #[tokio::test]
  async fn wrong_acknowledgement_is_a_violation() {
    let (mut client, mut server) = duplex(256);
    let peer = async move {
      let mut header = [0u8; 64];
      server.read_exact(&mut header).await.unwrap();
      let mut reply = [0u8; 64];
      reply[..4].copy_from_slice(b"NOPE");
      server.write_all(&reply).await.unwrap();
    };
    let (res, ()) = tokio::time::timeout(
      Duration::from_secs(5),
      futures::future::join(SimpleAckHandshake::new().initiate_over(&mut client), peer),
    )
    .await
    .expect("Handshake stalled");
    assert!(matches!(res, Err(HandshakeError::ProtocolViolation(_))));
  }

  #[tokio::test]
  async fn truncated_acknowledgement_is_an_io_error() {
    let (mut client, server) = duplex(256);
    drop(server);
    let res = SimpleAckHandshake::new().initiate_over(&mut client).await;
    assert!(matches!(res, Err(HandshakeError::Io(_))));
  }

  #[tokio::test]
  async fn handshake_over_raw_connection() {
    let (mut near, mut far) = connection_pair();
    let handshake = SimpleAckHandshake::new();
    let listener = CancellationListener::never();
    let (client_res, server_res) = tokio::time::timeout(
      Duration::from_secs(5),
      futures::future::join(
        handshake.handshake(&mut near, &listener),
        handshake.respond_channel(&mut far),
      ),
    )
    .await
    .expect("Handshake stalled");
    server_res.unwrap();
    client_res.unwrap();
  }

  #[tokio::test]
  async fn shutdown_cancels_pending_handshake() {
    // Nobody answers on the far side
    let (mut near, _far) = connection_pair();
    let source = CancellationToken::new();
    let listener: CancellationListener = source.clone().into();
    source.cancel();
    let res = tokio::time::timeout(
      Duration::from_secs(5),
      SimpleAckHandshake::new().handshake(&mut near, &listener),
    )
    .await
    .expect("Cancellation must end the handshake");
    assert!(matches!(res, Err(HandshakeError::Cancelled)));
  }
}
