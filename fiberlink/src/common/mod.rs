// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod connector;
pub mod handshake;
pub mod protocol;
pub mod session;
