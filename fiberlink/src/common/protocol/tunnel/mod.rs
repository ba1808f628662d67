// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Multiplexed channels and the fibers they carry
//!
//! A [MultiplexedChannel] is built from exactly one physical connection by a
//! [Multiplexer]. It hands out independent bidirectional "fibers" in both
//! directions and reports its own closure exactly once through the
//! [ChannelCloseHandle] supplied at construction.

use std::{
  net::SocketAddr,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::{future::BoxFuture, stream::BoxStream, StreamExt};

use crate::util::tunnel_stream::WrappedStream;

pub mod duplex;
pub mod id;
pub mod quinn_tunnel;

pub use self::id::{ChannelId, ChannelIdGenerator, MonotonicAtomicGenerator};

pub type ArcChannel = Arc<dyn MultiplexedChannel + Send + Sync + 'static>;

pub mod prelude {
  pub use super::{
    ArcChannel, ChannelCloseHandle, ChannelCloseReason, ChannelError, ChannelId, FiberDownlink,
    FiberIncoming, FiberIncomingType, MultiplexedChannel, Multiplexer,
  };
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
  #[error("Connection closed")]
  ConnectionClosed,
  #[error("Connection closed by application")]
  ApplicationClosed,
  #[error("Connection timed out")]
  TimedOut,
  #[error("Transport error encountered")]
  TransportError,
  #[error("Connection closed locally")]
  LocallyClosed,
}

#[derive(Debug, Clone)]
pub enum ChannelAddressInfo {
  Unidentified,
  Socket(SocketAddr),
}

impl std::fmt::Display for ChannelAddressInfo {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Unidentified => f.write_str("Unidentified"),
      Self::Socket(socket_addr) => write!(f, "{}", socket_addr),
    }
  }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum ChannelCloseReason {
  #[error(
    "Channel closed gracefully - initiator: {}",
    if *(.remote_initiated) { "remote" } else { "local" },
  )]
  GracefulExit {
    /// Marks that the remote was or was not the initiator for the exit
    remote_initiated: bool,
  },
  #[error("Channel closed due to error: {0}")]
  Error(
    #[from]
    #[source]
    ChannelError,
  ),
  #[error("Channel closed due to application error message: {0}")]
  ApplicationErrorMessage(Arc<String>),
  #[error("Channel closed without indication of reason")]
  Unspecified,
}

impl ChannelCloseReason {
  #[must_use]
  pub fn is_graceful_exit(&self) -> bool {
    matches!(self, Self::GracefulExit { .. })
  }
}

pub enum FiberIncomingType {
  BiStream(WrappedStream),
}

impl std::fmt::Debug for FiberIncomingType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::BiStream(stream) => f.debug_tuple("BiStream").field(stream).finish(),
    }
  }
}

/// Fibers opened by the remote side of a channel
pub struct FiberIncoming {
  id: ChannelId,
  inner: BoxStream<'static, Result<FiberIncomingType, ChannelError>>,
}

impl std::fmt::Debug for FiberIncoming {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FiberIncoming")
      .field("id", &self.id)
      .finish_non_exhaustive()
  }
}

impl FiberIncoming {
  pub fn new(
    id: ChannelId,
    inner: BoxStream<'static, Result<FiberIncomingType, ChannelError>>,
  ) -> Self {
    Self { id, inner }
  }

  pub fn id(&self) -> ChannelId {
    self.id
  }

  pub fn streams(self) -> BoxStream<'static, Result<FiberIncomingType, ChannelError>> {
    self.inner
  }
}

pub trait FiberDownlink: Send {
  fn channel_id(&self) -> ChannelId;

  fn as_stream<'a>(&'a mut self) -> BoxStream<'a, Result<FiberIncomingType, ChannelError>>;
}

impl FiberDownlink for FiberIncoming {
  fn channel_id(&self) -> ChannelId {
    self.id
  }

  fn as_stream<'a>(&'a mut self) -> BoxStream<'a, Result<FiberIncomingType, ChannelError>> {
    (&mut self.inner).boxed()
  }
}

impl FiberDownlink for tokio::sync::OwnedMutexGuard<FiberIncoming> {
  fn channel_id(&self) -> ChannelId {
    (**self).channel_id()
  }

  fn as_stream<'a>(&'a mut self) -> BoxStream<'a, Result<FiberIncomingType, ChannelError>> {
    (**self).as_stream()
  }
}

/// One physical connection presented as many independent fibers
pub trait MultiplexedChannel: Send + Sync {
  fn id(&self) -> ChannelId;

  fn addr(&self) -> ChannelAddressInfo {
    ChannelAddressInfo::Unidentified
  }

  /// Opens an outgoing fiber
  fn open_link(&self) -> BoxFuture<'static, Result<WrappedStream, ChannelError>>;

  /// Exclusive access to the incoming fibers
  ///
  /// Only one holder may consume the downlink at a time; the future resolves
  /// once any previous holder releases it. `None` means the channel has no
  /// downlink to offer.
  fn downlink<'a>(&'a self) -> BoxFuture<'a, Option<Box<dyn FiberDownlink + Send + Unpin>>>;

  /// Forces the channel closed, returning `false` if it was already closed
  ///
  /// The close handle fires before this returns when this call is the one
  /// that closes the channel.
  fn close(&self, reason: ChannelCloseReason) -> bool;

  fn is_closed(&self) -> bool;
}

type CloseCallback = Box<dyn FnOnce(ChannelId, Arc<ChannelCloseReason>) + Send + 'static>;

/// The one-shot closure notification given to a channel at fiberization
///
/// Clones share the same callback; whichever clone fires first runs it and
/// every later `fire` is ignored.
#[derive(Clone)]
pub struct ChannelCloseHandle {
  callback: Arc<Mutex<Option<CloseCallback>>>,
}

impl std::fmt::Debug for ChannelCloseHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ChannelCloseHandle")
      .field("fired", &self.has_fired())
      .finish()
  }
}

impl ChannelCloseHandle {
  pub fn new<F>(callback: F) -> Self
  where
    F: FnOnce(ChannelId, Arc<ChannelCloseReason>) + Send + 'static,
  {
    Self {
      callback: Arc::new(Mutex::new(Some(Box::new(callback)))),
    }
  }

  pub fn noop() -> Self {
    Self::new(|_, _| {})
  }

  fn slot(&self) -> MutexGuard<'_, Option<CloseCallback>> {
    self.callback.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Runs the callback if nothing has fired it yet; returns whether it ran
  pub fn fire(&self, id: ChannelId, reason: Arc<ChannelCloseReason>) -> bool {
    // Taken under the lock, invoked outside it, so the callback may close the channel again
    let callback = self.slot().take();
    match callback {
      Some(callback) => {
        callback(id, reason);
        true
      }
      None => false,
    }
  }

  pub fn has_fired(&self) -> bool {
    self.slot().is_none()
  }
}

/// Turns a connected transport into a [MultiplexedChannel]
///
/// The connection is consumed; from here on the channel owns it and is
/// responsible for firing `on_close` exactly once, whatever the cause.
pub trait Multiplexer<C>: Send + Sync {
  fn fiberize(&self, connection: C, id: ChannelId, on_close: ChannelCloseHandle) -> ArcChannel;
}

impl<C, M> Multiplexer<C> for Arc<M>
where
  M: Multiplexer<C> + ?Sized,
{
  fn fiberize(&self, connection: C, id: ChannelId, on_close: ChannelCloseHandle) -> ArcChannel {
    (**self).fiberize(connection, id, on_close)
  }
}

#[cfg(test)]
mod tests {
  use super::{ChannelCloseHandle, ChannelCloseReason, ChannelId};
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  };

  #[test]
  fn close_handle_fires_once_across_clones() {
    let fired = Arc::new(AtomicUsize::new(0));
    let handle = {
      let fired = Arc::clone(&fired);
      ChannelCloseHandle::new(move |id, reason| {
        assert_eq!(id, ChannelId::new(3));
        assert!(reason.is_graceful_exit());
        fired.fetch_add(1, Ordering::SeqCst);
      })
    };
    let other = handle.clone();
    let reason = Arc::new(ChannelCloseReason::GracefulExit {
      remote_initiated: false,
    });
    assert!(handle.fire(ChannelId::new(3), Arc::clone(&reason)));
    assert!(!other.fire(ChannelId::new(3), reason));
    assert!(other.has_fired());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn close_handle_allows_reentrant_fire() {
    let handle = ChannelCloseHandle::noop();
    let inner = handle.clone();
    let outer = ChannelCloseHandle::new(move |id, reason| {
      // A callback that closes again must not deadlock
      inner.fire(id, reason);
    });
    assert!(outer.fire(ChannelId::new(0), Arc::new(ChannelCloseReason::Unspecified)));
    assert!(handle.has_fired());
  }
}
