// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Length-prefixed frames, as used by the control and forwarding fibers
//!
//! Each frame is a big-endian `u32` length followed by that many bytes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Frame length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    #[source]
    error: std::io::Error,
  },
}

#[derive(thiserror::Error, Debug)]
pub enum JsonReadError {
  #[error("Failure reading JSON from frame: {0}")]
  Read(#[from] ReadError),
  #[error("Failure deserializing JSON from frame: {0}")]
  Deserialization(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Frame write failure: {0:?}")]
  UnexpectedEnd(#[from] std::io::Error),
  #[error("Frame of {0} bytes cannot be described by a u32 length")]
  Oversized(usize),
}

#[derive(thiserror::Error, Debug)]
pub enum JsonWriteError {
  #[error("Failure writing JSON into frame: {0}")]
  Write(#[from] WriteError),
  #[error("Failure serializing JSON for frame: {0}")]
  Serialization(#[from] serde_json::Error),
  /// Nothing is written to the stream when this is returned.
  #[error("Frame length exceeded expectation of {expected} bytes with {produced}")]
  MaxLengthExceeded { expected: usize, produced: usize },
}

pub async fn read_frame<T: AsyncRead + Unpin>(
  mut s: T,
  max_length: Option<usize>,
) -> Result<Vec<u8>, ReadError> {
  let length = s
    .read_u32()
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::LengthSpecifier,
      error,
    })? as usize;
  if let Some(max_length) = max_length {
    if length > max_length {
      return Err(ReadError::MaxLengthExceeded {
        expected: max_length,
        received: length,
      });
    }
  }
  let mut buffer = vec![0u8; length];
  s.read_exact(buffer.as_mut_slice())
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(buffer)
}

pub async fn write_frame<T: AsyncWrite + Unpin>(mut s: T, buffer: &[u8]) -> Result<(), WriteError> {
  let length = u32::try_from(buffer.len()).map_err(|_| WriteError::Oversized(buffer.len()))?;
  s.write_u32(length).await?;
  s.write_all(buffer).await?;
  Ok(())
}

pub async fn read_framed_json<TStream, TOutput>(
  s: TStream,
  max_length: Option<usize>,
) -> Result<TOutput, JsonReadError>
where
  TStream: AsyncRead + Unpin,
  TOutput: serde::de::DeserializeOwned,
{
  let buffer = read_frame(s, max_length).await?;
  Ok(serde_json::from_slice::<TOutput>(&buffer)?)
}

/// Serializes `value` and writes it as a single frame
///
/// `max_length` bounds the full frame, length prefix included.
pub async fn write_framed_json<TStream, TInput>(
  s: TStream,
  value: TInput,
  max_length: Option<usize>,
) -> Result<(), JsonWriteError>
where
  TStream: AsyncWrite + Unpin,
  TInput: serde::Serialize,
{
  const U32_SIZE: usize = std::mem::size_of::<u32>();
  let buffer = serde_json::to_vec(&value)?;
  if let Some(max_length) = max_length {
    if buffer.len() + U32_SIZE > max_length {
      return Err(JsonWriteError::MaxLengthExceeded {
        expected: max_length,
        produced: buffer.len() + U32_SIZE,
      });
    }
  }
  Ok(write_frame(s, &buffer).await?)
}

#[cfg(test)]
mod tests {
  use super::{read_frame, read_framed_json, write_frame, write_framed_json};
  use super::{JsonWriteError, ReadError};

  #[tokio::test]
  async fn frame_carries_length_prefix() {
    let mut buffer: Vec<u8> = Vec::new();
    write_frame(&mut buffer, b"fiber").await.unwrap();
    assert_eq!(&buffer[..4], &[0, 0, 0, 5]);
    assert_eq!(&buffer[4..], b"fiber");

    let mut cursor = std::io::Cursor::new(buffer);
    let content = read_frame(&mut cursor, None).await.unwrap();
    assert_eq!(content, b"fiber");
  }

  #[tokio::test]
  async fn empty_frames_are_legal() {
    let mut buffer: Vec<u8> = Vec::new();
    write_frame(&mut buffer, &[]).await.unwrap();
    assert_eq!(buffer.len(), std::mem::size_of::<u32>());
    let mut cursor = std::io::Cursor::new(buffer);
    assert!(read_frame(&mut cursor, None).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn oversized_incoming_frame_is_refused() {
    let mut buffer: Vec<u8> = Vec::new();
    write_frame(&mut buffer, &[7u8; 32]).await.unwrap();
    let mut cursor = std::io::Cursor::new(buffer);
    match read_frame(&mut cursor, Some(16)).await {
      Err(ReadError::MaxLengthExceeded { expected, received }) => {
        assert_eq!(expected, 16);
        assert_eq!(received, 32);
      }
      other => panic!("Expected a length refusal, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn truncated_frame_reports_missing_content() {
    let mut cursor = std::io::Cursor::new(vec![0u8, 0, 0, 9, 1, 2]);
    assert!(matches!(
      read_frame(&mut cursor, None).await,
      Err(ReadError::UnexpectedEnd { .. })
    ));
  }

  #[tokio::test]
  async fn exceeding_maximum_length_writes_nothing() {
    let mut buffer: Vec<u8> = Vec::new();
    // "a" serializes to three bytes once quoted
    assert!(matches!(
      write_framed_json(&mut buffer, "a", Some(std::mem::size_of::<u32>() + 2)).await,
      Err(JsonWriteError::MaxLengthExceeded { .. })
    ));
    assert!(buffer.is_empty());
  }

  #[tokio::test]
  async fn json_frames_survive_a_stream() {
    let (mut near, mut far) = tokio::io::duplex(256);
    let original = (String::from("create-service"), 3u8);
    write_framed_json(&mut near, &original, None).await.unwrap();
    let received: (String, u8) = read_framed_json(&mut far, None).await.unwrap();
    assert_eq!(original, received);
  }
}
