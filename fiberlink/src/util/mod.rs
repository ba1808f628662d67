// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod cancellation;
pub mod framed;
pub mod tunnel_stream;
pub mod validators;

// ALPN protocol names and prefixes for fiberlink variations
pub const ALPN_PREFIX_FIBERLINK: &[u8] = b"fiberlink-";
pub const ALPN_FIBERLINK_1: &[u8] = b"fiberlink-1";

/// Largest frame accepted on control and forwarding fibers
pub const MAX_CONTROL_FRAME_LENGTH: usize = 64 * 1024;
