// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! In-memory connections and channels
//!
//! [connection_pair] produces two entangled raw connections, each able to
//! open fibers that arrive at the other. Shutting either one down closes
//! both, the same way a dropped transport would be seen by its peer.

use std::{
  net::SocketAddr,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use futures::{future::BoxFuture, FutureExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{
  ArcChannel, ChannelCloseHandle, ChannelCloseReason, ChannelError, ChannelId, FiberDownlink,
  FiberIncoming, FiberIncomingType, MonotonicAtomicGenerator, MultiplexedChannel, Multiplexer,
};
use crate::{
  common::{
    connector::{Connection, ShutdownHandle},
    handshake::HandshakeTransport,
  },
  util::tunnel_stream::WrappedStream,
};

const FIBER_BUFFER_SIZE: usize = 8192;

/// One side of an in-memory connection
pub struct DuplexEndpoint {
  to_remote: UnboundedSender<WrappedStream>,
  from_remote: UnboundedReceiver<WrappedStream>,
  link: CancellationToken,
}

impl std::fmt::Debug for DuplexEndpoint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DuplexEndpoint")
      .field("closed", &self.link.is_cancelled())
      .finish_non_exhaustive()
  }
}

pub fn connection_pair() -> (DuplexEndpoint, DuplexEndpoint) {
  let link = CancellationToken::new();
  let (left_up, right_down) = mpsc::unbounded_channel::<WrappedStream>();
  let (right_up, left_down) = mpsc::unbounded_channel::<WrappedStream>();
  (
    DuplexEndpoint {
      to_remote: left_up,
      from_remote: left_down,
      link: link.clone(),
    },
    DuplexEndpoint {
      to_remote: right_up,
      from_remote: right_down,
      link,
    },
  )
}

impl DuplexEndpoint {
  fn send_fiber(&self) -> Result<WrappedStream, ChannelError> {
    if self.link.is_cancelled() {
      return Err(ChannelError::LocallyClosed);
    }
    let (local, remote) = tokio::io::duplex(FIBER_BUFFER_SIZE);
    self
      .to_remote
      .send(WrappedStream::DuplexStream(remote))
      .map_err(|_| ChannelError::ConnectionClosed)?;
    Ok(WrappedStream::DuplexStream(local))
  }
}

impl Connection for DuplexEndpoint {
  fn remote_address(&self) -> Option<SocketAddr> {
    None
  }

  fn shutdown_handle(&self) -> ShutdownHandle {
    let link = self.link.clone();
    ShutdownHandle::new(move || link.cancel())
  }
}

impl HandshakeTransport for DuplexEndpoint {
  fn open_fiber(&mut self) -> BoxFuture<'_, Result<WrappedStream, ChannelError>> {
    futures::future::ready(self.send_fiber()).boxed()
  }

  fn accept_fiber(&mut self) -> BoxFuture<'_, Result<WrappedStream, ChannelError>> {
    async move {
      tokio::select! {
        fiber = self.from_remote.recv() => fiber.ok_or(ChannelError::ConnectionClosed),
        _ = self.link.cancelled() => Err(ChannelError::ConnectionClosed),
      }
    }
    .boxed()
  }
}

/// A fiberized [DuplexEndpoint]
pub struct DuplexChannel {
  id: ChannelId,
  to_remote: UnboundedSender<WrappedStream>,
  incoming: Arc<tokio::sync::Mutex<FiberIncoming>>,
  link: CancellationToken,
  closed: Arc<AtomicBool>,
  on_close: ChannelCloseHandle,
}

impl DuplexChannel {
  pub fn new(endpoint: DuplexEndpoint, id: ChannelId, on_close: ChannelCloseHandle) -> Self {
    let DuplexEndpoint {
      to_remote,
      from_remote,
      link,
    } = endpoint;
    let incoming = {
      let link = link.clone();
      UnboundedReceiverStream::new(from_remote)
        .take_until(async move { link.cancelled().await })
        .map(|stream| Ok(FiberIncomingType::BiStream(stream)))
        .boxed()
    };
    let closed = Arc::new(AtomicBool::new(false));
    {
      let (link, closed, on_close) = (link.clone(), closed.clone(), on_close.clone());
      tokio::task::spawn(async move {
        link.cancelled().await;
        if !closed.swap(true, Ordering::AcqRel) {
          tracing::debug!(channel = ?id, "duplex_peer_closed");
          on_close.fire(
            id,
            Arc::new(ChannelCloseReason::GracefulExit {
              remote_initiated: true,
            }),
          );
        }
      });
    }
    Self {
      id,
      to_remote,
      incoming: Arc::new(tokio::sync::Mutex::new(FiberIncoming::new(id, incoming))),
      link,
      closed,
      on_close,
    }
  }
}

impl MultiplexedChannel for DuplexChannel {
  fn id(&self) -> ChannelId {
    self.id
  }

  fn open_link(&self) -> BoxFuture<'static, Result<WrappedStream, ChannelError>> {
    let result = if self.is_closed() {
      Err(ChannelError::LocallyClosed)
    } else {
      let (local, remote) = tokio::io::duplex(FIBER_BUFFER_SIZE);
      self
        .to_remote
        .send(WrappedStream::DuplexStream(remote))
        .map_err(|_| ChannelError::ConnectionClosed)
        .map(|_| WrappedStream::DuplexStream(local))
    };
    futures::future::ready(result).boxed()
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
    self.link.cancel();
    self.on_close.fire(self.id, Arc::new(reason));
    true
  }

  fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }
}

impl Drop for DuplexChannel {
  fn drop(&mut self) {
    self.close(ChannelCloseReason::GracefulExit {
      remote_initiated: false,
    });
  }
}

/// Fiberizes [DuplexEndpoint]s into [DuplexChannel]s
#[derive(Debug, Default, Clone, Copy)]
pub struct DuplexMultiplexer;

impl Multiplexer<DuplexEndpoint> for DuplexMultiplexer {
  fn fiberize(
    &self,
    connection: DuplexEndpoint,
    id: ChannelId,
    on_close: ChannelCloseHandle,
  ) -> ArcChannel {
    Arc::new(DuplexChannel::new(connection, id, on_close))
  }
}

/// Two entangled channels; fibers opened on one arrive on the other
pub struct EntangledChannels {
  pub listener: Arc<DuplexChannel>,
  pub connector: Arc<DuplexChannel>,
}

impl From<EntangledChannels> for (Arc<DuplexChannel>, Arc<DuplexChannel>) {
  fn from(channels: EntangledChannels) -> Self {
    (channels.listener, channels.connector)
  }
}

/// Must be called from within a tokio runtime
pub fn channel() -> EntangledChannels {
  let ids = MonotonicAtomicGenerator::new(0);
  let (listen, connect) = connection_pair();
  EntangledChannels {
    listener: Arc::new(DuplexChannel::new(
      listen,
      ids.next(),
      ChannelCloseHandle::noop(),
    )),
    connector: Arc::new(DuplexChannel::new(
      connect,
      ids.next(),
      ChannelCloseHandle::noop(),
    )),
  }
}
