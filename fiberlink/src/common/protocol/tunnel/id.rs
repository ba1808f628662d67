// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one multiplexed channel for the lifetime of a process
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ChannelId(u64);

impl ChannelId {
  pub fn new(inner: u64) -> ChannelId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl From<u64> for ChannelId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl From<ChannelId> for u64 {
  fn from(id: ChannelId) -> Self {
    id.inner()
  }
}

impl std::fmt::Debug for ChannelId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("ChannelId").field(&self.inner()).finish()
  }
}

impl std::fmt::Display for ChannelId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "channel#{}", self.0)
  }
}

pub trait ChannelIdGenerator {
  fn next(&self) -> ChannelId;
}

#[derive(Debug)]
pub struct MonotonicAtomicGenerator {
  next: AtomicU64,
}

impl MonotonicAtomicGenerator {
  pub fn new(next: u64) -> Self {
    Self {
      next: AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> ChannelId {
    ChannelId::new(self.next.fetch_add(1, Ordering::Relaxed))
  }
}

impl Default for MonotonicAtomicGenerator {
  fn default() -> Self {
    Self::new(0)
  }
}

impl ChannelIdGenerator for MonotonicAtomicGenerator {
  fn next(&self) -> ChannelId {
    MonotonicAtomicGenerator::next(self)
  }
}

#[cfg(test)]
mod tests {
  use super::{ChannelIdGenerator, MonotonicAtomicGenerator};

  #[test]
  fn generator_never_repeats() {
    let generator = MonotonicAtomicGenerator::new(7);
    let first = ChannelIdGenerator::next(&generator);
    let second = generator.next();
    assert_eq!(first.inner(), 7);
    assert!(second > first);
  }
}
