// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::Error as IOError;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A duplex byte stream carried by one fiber of a multiplexed channel
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<'stream, TInner: TunnelStream + ?Sized + 'stream> TunnelStream for &'stream mut TInner {}
impl<TInner: TunnelStream + ?Sized> TunnelStream for Box<TInner> {}

/// Concrete fiber streams handed out by the channel implementations
pub enum WrappedStream {
  Boxed(
    Box<dyn AsyncRead + Send + Sync + Unpin + 'static>,
    Box<dyn AsyncWrite + Send + Sync + Unpin + 'static>,
  ),
  Quinn(quinn::SendStream, quinn::RecvStream),
  DuplexStream(tokio::io::DuplexStream),
}

impl std::fmt::Debug for WrappedStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let variant = match self {
      WrappedStream::Boxed(..) => "Boxed",
      WrappedStream::Quinn(..) => "Quinn",
      WrappedStream::DuplexStream(_) => "DuplexStream",
    };
    f.debug_tuple("WrappedStream").field(&variant).finish()
  }
}

impl WrappedStream {
  pub fn duplex(max_buf_size: usize) -> (WrappedStream, WrappedStream) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (a.into(), b.into())
  }
}

impl From<tokio::io::DuplexStream> for WrappedStream {
  fn from(stream: tokio::io::DuplexStream) -> Self {
    WrappedStream::DuplexStream(stream)
  }
}

impl From<(quinn::SendStream, quinn::RecvStream)> for WrappedStream {
  fn from((send, recv): (quinn::SendStream, quinn::RecvStream)) -> Self {
    WrappedStream::Quinn(send, recv)
  }
}

impl AsyncRead for WrappedStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Quinn(_, ref mut recv) => AsyncRead::poll_read(Pin::new(recv), cx, buf),
      WrappedStream::DuplexStream(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      WrappedStream::Boxed(ref mut s, _) => AsyncRead::poll_read(Pin::new(&mut *s), cx, buf),
    }
  }
}

impl AsyncWrite for WrappedStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    match self.get_mut() {
      WrappedStream::Quinn(ref mut send, _) => AsyncWrite::poll_write(Pin::new(send), cx, buf),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      WrappedStream::Boxed(_, ref mut s) => AsyncWrite::poll_write(Pin::new(&mut *s), cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Quinn(ref mut send, _) => AsyncWrite::poll_flush(Pin::new(send), cx),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WrappedStream::Boxed(_, ref mut s) => AsyncWrite::poll_flush(Pin::new(&mut *s), cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Quinn(ref mut send, _) => AsyncWrite::poll_shutdown(Pin::new(send), cx),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WrappedStream::Boxed(_, ref mut s) => AsyncWrite::poll_shutdown(Pin::new(&mut *s), cx),
    }
  }
}

impl TunnelStream for WrappedStream {}

#[cfg(test)]
mod tests {
  use super::{TunnelStream, WrappedStream};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  fn _assert_tunnel_stream(s: WrappedStream) -> Box<dyn TunnelStream> {
    Box::new(s)
  }

  #[tokio::test]
  async fn duplex_pair_is_connected_both_ways() {
    let (mut a, mut b) = WrappedStream::duplex(64);
    a.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    b.write_all(b"pong").await.unwrap();
    a.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
  }

  #[tokio::test]
  async fn boxed_halves_route_independently() {
    let (read_near, mut read_far) = tokio::io::duplex(64);
    let (write_near, mut write_far) = tokio::io::duplex(64);
    let mut wrapped = WrappedStream::Boxed(Box::new(read_near), Box::new(write_near));
    read_far.write_all(b"in").await.unwrap();
    wrapped.write_all(b"out").await.unwrap();
    let mut incoming = [0u8; 2];
    wrapped.read_exact(&mut incoming).await.unwrap();
    assert_eq!(&incoming, b"in");
    let mut outgoing = [0u8; 3];
    write_far.read_exact(&mut outgoing).await.unwrap();
    assert_eq!(&outgoing, b"out");
  }
}
