// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use futures::{future::BoxFuture, FutureExt, StreamExt};

use super::{
  ArcChannel, ChannelAddressInfo, ChannelCloseHandle, ChannelCloseReason, ChannelError, ChannelId,
  FiberDownlink, FiberIncoming, FiberIncomingType, MultiplexedChannel, Multiplexer,
};
use crate::{common::connector::QuinnConnection, util::tunnel_stream::WrappedStream};

/// A QUIC connection whose bidirectional streams are the fibers
pub struct QuinnChannel {
  id: ChannelId,
  connection: quinn::Connection,
  // Dropping the endpoint early would take the socket with it
  _endpoint: quinn::Endpoint,
  incoming: Arc<tokio::sync::Mutex<FiberIncoming>>,
  closed: Arc<AtomicBool>,
  on_close: ChannelCloseHandle,
}

impl QuinnChannel {
  fn new(
    id: ChannelId,
    connection: quinn::Connection,
    endpoint: quinn::Endpoint,
    on_close: ChannelCloseHandle,
  ) -> Self {
    let accepting = connection.clone();
    let fibers = futures::stream::unfold(accepting, |connection| async move {
      match connection.accept_bi().await {
        Ok(streams) => Some((
          Ok(FiberIncomingType::BiStream(WrappedStream::from(streams))),
          connection,
        )),
        Err(quinn::ConnectionError::LocallyClosed)
        | Err(quinn::ConnectionError::ApplicationClosed(_)) => None,
        Err(e) => {
          tracing::debug!(error = ?e, "fiber_accept_failed");
          None
        }
      }
    })
    .boxed();
    let closed = Arc::new(AtomicBool::new(false));
    // Remote closure and transport failure both surface through `closed()`
    {
      let (connection, closed, on_close) = (connection.clone(), closed.clone(), on_close.clone());
      tokio::task::spawn(async move {
        let error = connection.closed().await;
        if !closed.swap(true, Ordering::AcqRel) {
          let reason = match error {
            quinn::ConnectionError::LocallyClosed => ChannelCloseReason::GracefulExit {
              remote_initiated: false,
            },
            quinn::ConnectionError::ApplicationClosed(_) => ChannelCloseReason::GracefulExit {
              remote_initiated: true,
            },
            other => ChannelCloseReason::Error(other.into()),
          };
          tracing::debug!(channel = ?id, %reason, "quinn_channel_closed");
          on_close.fire(id, Arc::new(reason));
        }
      });
    }
    Self {
      id,
      connection,
      _endpoint: endpoint,
      incoming: Arc::new(tokio::sync::Mutex::new(FiberIncoming::new(id, fibers))),
      closed,
      on_close,
    }
  }
}

impl MultiplexedChannel for QuinnChannel {
  fn id(&self) -> ChannelId {
    self.id
  }

  fn addr(&self) -> ChannelAddressInfo {
    ChannelAddressInfo::Socket(self.connection.remote_address())
  }

  fn open_link(&self) -> BoxFuture<'static, Result<WrappedStream, ChannelError>> {
    let connection = self.connection.clone();
    async move {
      let streams = connection.open_bi().await?;
      Ok(WrappedStream::from(streams))
    }
    .boxed()
  }

  fn downlink<'a>(&'a self) -> BoxFuture<'a, Option<Box<dyn FiberDownlink + Send + Unpin>>> {
    self
      .incoming
      .clone()
      .lock_owned()
      .map(|x| Some(Box::new(x) as Box<_>))
      .boxed()
  }

  fn close(&self, reason: ChannelCloseReason) -> bool {
    if self.closed.swap(true, Ordering::AcqRel) {
      return false;
    }
    self.connection.close(quinn::VarInt::from_u32(0), b"closed");
    self.on_close.fire(self.id, Arc::new(reason));
    true
  }

  fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }
}

impl From<quinn::ConnectionError> for ChannelError {
  fn from(connection_error: quinn::ConnectionError) -> Self {
    match connection_error {
      quinn::ConnectionError::VersionMismatch => Self::TransportError,
      quinn::ConnectionError::TransportError(_) => Self::TransportError,
      quinn::ConnectionError::ConnectionClosed(_) => Self::ConnectionClosed,
      quinn::ConnectionError::ApplicationClosed(_) => Self::ApplicationClosed,
      quinn::ConnectionError::Reset => Self::TransportError,
      quinn::ConnectionError::TimedOut => Self::TimedOut,
      quinn::ConnectionError::LocallyClosed => Self::LocallyClosed,
    }
  }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QuinnMultiplexer;

impl Multiplexer<QuinnConnection> for QuinnMultiplexer {
  fn fiberize(
    &self,
    connection: QuinnConnection,
    id: ChannelId,
    on_close: ChannelCloseHandle,
  ) -> ArcChannel {
    let (connection, endpoint) = connection.into_inner();
    Arc::new(QuinnChannel::new(id, connection, endpoint, on_close))
  }
}
