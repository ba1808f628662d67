// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A [CancellationToken] that cannot be triggered by its recipient
///
/// Handshakes and services receive one of these so they can observe
/// session shutdown without being able to request it themselves.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  /// A listener whose source has already been dropped; it never fires
  pub fn never() -> Self {
    Self::default()
  }

  pub fn child_token(&self) -> CancellationToken {
    self.token.child_token()
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

#[cfg(test)]
mod tests {
  use super::CancellationListener;
  use tokio_util::sync::CancellationToken;

  #[tokio::test]
  async fn listener_observes_source_cancellation() {
    let source = CancellationToken::new();
    let listener: CancellationListener = source.clone().into();
    let child = listener.child_token();
    assert!(!listener.is_cancelled());
    source.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(1), listener.cancelled())
      .await
      .expect("Listener must fire once its source is cancelled");
    assert!(child.is_cancelled(), "Children follow their parent");
  }

  #[test]
  fn never_listener_stays_quiet() {
    let listener = CancellationListener::never();
    assert!(!listener.is_cancelled());
  }
}
