// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use clap::{Parser, Subcommand};
use tether_config::{load_config_with_cli, LogFormat, LoggingConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

use commands::{ConnectArgs, ExchangeArgs, GlobalArgs, MeshArgs};

#[derive(Parser, Debug)]
#[command(
	name = "tether",
	about = "Bridge a workstation into a Kubernetes cluster",
	version
)]
struct Args {
	#[command(flatten)]
	global: GlobalArgs,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Reach cluster services from this machine
	Connect(ConnectArgs),
	/// Send all traffic of a deployment to this machine
	Exchange(ExchangeArgs),
	/// Send requests carrying a version header to this machine
	Mesh(MeshArgs),
	/// Tear down sessions left behind by processes that no longer run
	Clean,
}

fn init_tracing(logging: &LoggingConfig) {
	let filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
	let registry = tracing_subscriber::registry().with(filter);
	match logging.format {
		LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
		LogFormat::Compact => registry
			.with(tracing_subscriber::fmt::layer().compact())
			.init(),
		LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let mut overrides = args.global.overrides();
	match &args.command {
		Command::Connect(connect) => connect.apply(&mut overrides),
		Command::Exchange(exchange) => exchange.apply(&mut overrides),
		Command::Mesh(_) | Command::Clean => {}
	}
	let config = load_config_with_cli(overrides)?;
	init_tracing(&config.logging);
	tracing::debug!(namespace = %config.cluster.namespace, home = %config.paths.home_dir.display(), "configuration loaded");

	match args.command {
		Command::Connect(connect) => commands::connect::run(config, &args.global, connect).await,
		Command::Exchange(exchange) => commands::exchange::run(config, &args.global, exchange).await,
		Command::Mesh(mesh) => commands::mesh::run(config, &args.global, mesh).await,
		Command::Clean => commands::clean::run(config).await,
	}
}
