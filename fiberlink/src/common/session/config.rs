// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::protocol::service::{ServiceConfigs, ServiceDescriptor};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read session configuration from {path:?}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Malformed session configuration in {path:?}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

/// Services launched on every run, and the configuration of each builder kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
  #[serde(default)]
  pub services: Vec<ServiceDescriptor>,
  #[serde(default)]
  pub service_configs: ServiceConfigs,
}

impl SessionConfig {
  pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    serde_json::from_slice(&contents).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::{ConfigError, SessionConfig};
  use crate::common::protocol::service::ServiceKind;
  use std::io::Write;

  fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!(
      "fiberlink-config-{}-{}.json",
      name,
      uuid::Uuid::new_v4()
    ));
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
  }

  #[test]
  fn loads_services_and_configs() {
    let path = write_temp(
      "full",
      r#"{
        "services": [
          { "name": "db", "kind": "tcp-forward",
            "parameters": { "listen": "127.0.0.1:15432", "target": "/tcp/5432" } }
        ],
        "service_configs": { "tcp-forward": { "allow_non_loopback": false } }
      }"#,
    );
    let config = SessionConfig::from_json_file(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(config.services.len(), 1);
    assert_eq!(config.services[0].kind, ServiceKind::TcpForward);
    assert!(!config
      .service_configs
      .get(ServiceKind::TcpForward)
      .as_value()
      .is_null());
  }

  #[test]
  fn empty_object_is_an_empty_config() {
    let path = write_temp("empty", "{}");
    let config = SessionConfig::from_json_file(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(config, SessionConfig::default());
  }

  #[test]
  fn errors_name_the_file() {
    let path = write_temp("broken", "{ services: ");
    let error = SessionConfig::from_json_file(&path).unwrap_err();
    std::fs::remove_file(&path).ok();
    assert!(matches!(error, ConfigError::Parse { .. }));
    assert!(matches!(
      SessionConfig::from_json_file("/nonexistent/fiberlink.json"),
      Err(ConfigError::Read { .. })
    ));
  }
}
