// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Everything carried over a multiplexed channel once it exists
//!
//! The [tunnel] layer turns one connection into fibers, [service] tracks what
//! runs over those fibers, and [control] lets either side manage services at
//! runtime. [proxy_tcp] is the built-in TCP forwarding service.

pub mod control;
pub mod proxy_tcp;
pub mod service;
pub mod tunnel;
