// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use fiberlink::util;
use std::{path::PathBuf, str::FromStr};

use util::validators::{parse_host_port, validate_existing_file, validate_host_port};

mod client;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quinn=warn,quinn_proto=warn,info"));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("client")
        .alias("-c")
        .about("Connect to a remote driver and run the configured services over it")
        .arg(
          Arg::new("authority")
            .long("authority")
            .short('a')
            .help("PEM file of trusted roots; the platform roots are used when absent")
            .validator(validate_existing_file)
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("driver")
            .long("driver")
            .short('d')
            .help("Remote endpoint as host:port")
            .validator(validate_host_port)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("driver-san")
            .long("driver-san")
            .visible_alias("san")
            .short('s')
            .help("Name to verify the driver's certificate against; defaults to the driver host")
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("config")
            .long("config")
            .help("JSON file listing services and per-kind service configuration")
            .validator(validate_existing_file)
            .takes_value(true)
            .required(false),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn path_arg(args: &'_ ArgMatches, name: &str) -> Result<Option<PathBuf>> {
  args
    .value_of(name)
    .map(PathBuf::from_str)
    // flip Option<Result<T, E>> to Result<Option<T>, E>
    .map_or(Ok(None), |v| v.map(Some))
    .map_err(Into::into)
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  let (driver_host, driver_port) = parse_host_port(
    args
      .value_of("driver")
      .ok_or_else(|| anyhow::Error::msg("Driver argument is required"))?,
  )?;
  Ok(client::ClientArgs {
    authority_cert: path_arg(args, "authority")?,
    driver_host,
    driver_port,
    driver_san: args.value_of("driver-san").map(String::from),
    config: path_arg(args, "config")?,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("client", opts) => {
      let config = client_arg_handling(opts)?;
      tracing::info!("Running as client with config {:#?}", config);
      client::client_main(config).await
    }
    (_, _) => unreachable!(),
  }
}
