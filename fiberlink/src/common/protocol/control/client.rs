// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::io::AsyncWriteExt;

use super::{ControlError, ControlRequest, ControlResponse};
use crate::{
  common::protocol::tunnel::MultiplexedChannel,
  util::{
    framed::{read_framed_json, write_framed_json},
    MAX_CONTROL_FRAME_LENGTH,
  },
};

/// Issues control requests to the control service on the far side of a channel
pub struct ControlClient;

impl ControlClient {
  /// Opens a fresh fiber and performs one request/response exchange on it
  pub async fn request<Ch>(
    channel: &Ch,
    request: &ControlRequest,
  ) -> Result<ControlResponse, ControlError>
  where
    Ch: MultiplexedChannel + ?Sized,
  {
    let mut link = channel.open_link().await?;
    write_framed_json(&mut link, request, Some(MAX_CONTROL_FRAME_LENGTH)).await?;
    link.flush().await?;
    let response = read_framed_json(&mut link, Some(MAX_CONTROL_FRAME_LENGTH)).await?;
    if let Err(error) = link.shutdown().await {
      tracing::trace!(?error, "control_link_shutdown_failed");
    }
    Ok(response)
  }
}
