// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::{future::BoxFuture, FutureExt};

use super::{HandshakeError, HandshakeInitiator};
use crate::util::cancellation::CancellationListener;

/// Accepts every connection without exchanging anything
#[derive(Default, Clone, Copy)]
pub struct NoOpHandshake;

impl NoOpHandshake {
  pub fn new() -> Self {
    Self
  }
}

impl std::fmt::Debug for NoOpHandshake {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "({})", std::any::type_name::<NoOpHandshake>())
  }
}

impl<C: Send + 'static> HandshakeInitiator<C> for NoOpHandshake {
  fn handshake<'a>(
    &'a self,
    _connection: &'a mut C,
    _shutdown: &'a CancellationListener,
  ) -> BoxFuture<'a, Result<(), HandshakeError>> {
    futures::future::ready(Ok(())).boxed()
  }
}
