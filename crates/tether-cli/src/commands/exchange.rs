// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use clap::Args;
use tether_config::{CliOverrides, TetherConfig};
use tether_session::ComponentKind;
use tracing::info;

use super::{hold_session, parse_ports, session_manager, GlobalArgs};

#[derive(Debug, Clone, Args)]
pub struct ExchangeArgs {
	/// Deployment whose traffic comes to this machine
	pub deployment: String,

	/// Ports to redirect, as <local>:<remote>[,...]
	#[arg(long)]
	pub expose: String,

	/// scale or ephemeral
	#[arg(long)]
	pub method: Option<String>,

	/// Seconds to wait for the deployment to come back on exit
	#[arg(long)]
	pub recover_wait: Option<u64>,
}

impl ExchangeArgs {
	pub fn apply(&self, overrides: &mut CliOverrides) {
		overrides.exchange_method = self.method.clone();
		overrides.recover_wait_secs = self.recover_wait;
	}
}

pub async fn run(config: TetherConfig, global: &GlobalArgs, args: ExchangeArgs) -> anyhow::Result<()> {
	let ports = parse_ports(&args.expose)?;
	let manager = session_manager(config, global.debug).await?;
	hold_session(&manager, ComponentKind::Exchange, async {
		let session = manager.exchange(&args.deployment, &ports).await?;
		match &session.endpoint {
			Some(endpoint) => info!(shadow = %endpoint.pod_name, ip = %endpoint.ip, ports = %ports, "exchanging"),
			None => info!(pods = %session.pods.join(", "), ports = %ports, "exchanging"),
		}
		Ok(())
	})
	.await
}
