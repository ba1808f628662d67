// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Client-side session orchestration for multiplexed service tunnels
//!
//! A [Session] connects to a remote endpoint, handshakes, upgrades the
//! connection into a multiplexed channel, and runs a control service plus
//! any configured microservices over it until the channel closes.

pub mod common;
pub mod util;

pub use common::session::{Phase, Session, SessionBuilder, SessionConfig, SessionError};
