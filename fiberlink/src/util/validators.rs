// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context, Error as AnyErr, Result};
use std::path::Path;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

/// Splits a `host:port` pair without resolving the host
///
/// Bracketed IPv6 literals (`[::1]:443`) are unwrapped.
pub fn parse_host_port(v: &str) -> Result<(String, u16)> {
  let (host, port) = v
    .rsplit_once(':')
    .ok_or_else(|| AnyErr::msg("Expected an endpoint of the form host:port"))?;
  let host = host.trim_start_matches('[').trim_end_matches(']');
  if host.is_empty() {
    return Err(AnyErr::msg("Endpoint host must not be empty"));
  }
  let port = port
    .parse::<u16>()
    .context("Endpoint port was not a valid u16")?;
  Ok((host.to_string(), port))
}

pub fn validate_host_port(v: &str) -> Result<(), String> {
  parse_host_port(v).map(|_| ()).map_err(|e| e.to_string())
}
