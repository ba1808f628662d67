// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use fiberlink::{
  common::{
    connector::{
      quinn_connector::{client_config_from_roots, load_pem_roots},
      EndpointDescriptor, QuinnConnector,
    },
    handshake::SimpleAckHandshake,
    protocol::{proxy_tcp::TcpForwardBuilder, tunnel::quinn_tunnel::QuinnMultiplexer},
    session::notification::{Notification, NotificationKind},
  },
  Session, SessionConfig,
};
use std::path::PathBuf;
use tokio::sync::mpsc;

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ClientArgs {
  pub authority_cert: Option<PathBuf>,
  pub driver_host: String,
  pub driver_port: u16,
  pub driver_san: Option<String>,
  pub config: Option<PathBuf>,
}

fn trust_roots(authority_cert: Option<&PathBuf>) -> Result<rustls::RootCertStore> {
  match authority_cert {
    Some(path) => load_pem_roots(path)
      .with_context(|| format!("Failed reading authority cert file {:?}", path)),
    None => {
      let mut roots = rustls::RootCertStore::empty();
      let native =
        rustls_native_certs::load_native_certs().context("Failed loading platform trust roots")?;
      let (added, ignored) = roots.add_parsable_certificates(
        &native.into_iter().map(|cert| cert.0).collect::<Vec<_>>(),
      );
      tracing::debug!(added, ignored, "loaded_native_roots");
      Ok(roots)
    }
  }
}

fn log_notification(notification: &Notification) {
  match &notification.error {
    Some(error) => tracing::warn!(
      kind = %notification.kind,
      service = ?notification.service.as_ref().map(|s| s.name.as_str()),
      %error,
      "session_notification"
    ),
    None => tracing::info!(
      kind = %notification.kind,
      service = ?notification.service.as_ref().map(|s| s.name.as_str()),
      "session_notification"
    ),
  }
}

pub async fn client_main(args: ClientArgs) -> Result<()> {
  let session_config = match &args.config {
    Some(path) => SessionConfig::from_json_file(path)?,
    None => SessionConfig::default(),
  };
  let roots = trust_roots(args.authority_cert.as_ref())?;
  let connector = QuinnConnector::new(client_config_from_roots(roots));

  let mut endpoint = EndpointDescriptor::new(args.driver_host.clone(), args.driver_port);
  if let Some(san) = &args.driver_san {
    endpoint = endpoint.with_server_name(san.clone());
  }

  let (closed_sender, mut closed) = mpsc::unbounded_channel::<()>();
  let session = Session::builder(connector, SimpleAckHandshake::new(), QuinnMultiplexer)
    .config(session_config)
    .service_builder(TcpForwardBuilder::new)
    .on_notification(move |notification| {
      log_notification(&notification);
      let finished = match notification.kind {
        NotificationKind::Close => true,
        // A failed connect or handshake leaves nothing to wait for
        NotificationKind::Network => notification.is_error(),
        _ => false,
      };
      if finished {
        let _ = closed_sender.send(());
      }
    })
    .build();

  session.run(endpoint)?;
  tokio::select! {
    res = tokio::signal::ctrl_c() => {
      res.context("Failed listening for interrupt")?;
      tracing::info!("Interrupt received; stopping session");
    }
    _ = closed.recv() => tracing::info!(phase = %session.phase(), "Session ended"),
  }
  session.stop();
  session.execution_context().drained().await;
  Ok(())
}
