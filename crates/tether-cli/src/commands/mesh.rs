// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use clap::Args;
use tether_config::TetherConfig;
use tether_session::ComponentKind;
use tracing::info;

use super::{hold_session, parse_ports, session_manager, GlobalArgs};

#[derive(Debug, Clone, Args)]
pub struct MeshArgs {
	/// Service to route by header
	pub service: String,

	/// Ports to redirect, as <local>:<remote>[,...]
	#[arg(long)]
	pub expose: String,

	/// Header and value that select this machine, as [<key>:]<version>
	#[arg(long, default_value = "")]
	pub version_mark: String,
}

pub async fn run(config: TetherConfig, global: &GlobalArgs, args: MeshArgs) -> anyhow::Result<()> {
	let ports = parse_ports(&args.expose)?;
	let manager = session_manager(config, global.debug).await?;
	hold_session(&manager, ComponentKind::Mesh, async {
		let session = manager.mesh(&args.service, &ports, &args.version_mark).await?;
		info!(
			router = %session.router,
			shadow = %session.endpoint.pod_name,
			"send requests with header '{}: {}' to reach this machine",
			session.mark.key,
			session.mark.version
		);
		Ok(())
	})
	.await
}
