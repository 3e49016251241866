// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod clean;
pub mod connect;
pub mod exchange;
pub mod mesh;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Args;
use tether_config::{CliOverrides, TetherConfig};
use tether_k8s::{K8sClient, KubeClient};
use tether_session::command::SystemCommandRunner;
use tether_session::{ClientFactory, ComponentKind, SessionManager, Workstation};
use tracing::{error, info, warn};

pub use connect::ConnectArgs;
pub use exchange::ExchangeArgs;
pub use mesh::MeshArgs;

/// Options shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
	/// Namespace the session works in
	#[arg(short, long, global = true, env = "TETHER_NAMESPACE")]
	pub namespace: Option<String>,

	/// Cluster DNS domain
	#[arg(long, global = true)]
	pub cluster_domain: Option<String>,

	/// Image for shadow pods
	#[arg(long, global = true)]
	pub image: Option<String>,

	/// Config file to use instead of the user config
	#[arg(long, global = true)]
	pub config: Option<PathBuf>,

	/// Directory for session state and keys
	#[arg(long, global = true)]
	pub home: Option<PathBuf>,

	/// Log level (error, warn, info, debug, trace)
	#[arg(long, global = true)]
	pub log_level: Option<String>,

	/// Emit logs as JSON
	#[arg(long, global = true)]
	pub json_logs: bool,

	/// Debug logging here and in shadow pods
	#[arg(long, global = true)]
	pub debug: bool,
}

impl GlobalArgs {
	pub fn overrides(&self) -> CliOverrides {
		let log_level = if self.debug {
			Some("debug".to_string())
		} else {
			self.log_level.clone()
		};
		CliOverrides {
			namespace: self.namespace.clone(),
			cluster_domain: self.cluster_domain.clone(),
			shadow_image: self.image.clone(),
			config_file: self.config.clone(),
			home: self.home.clone(),
			log_level,
			log_format: self.json_logs.then(|| "json".to_string()),
			..Default::default()
		}
	}
}

/// Builds a kube client from the ambient kubeconfig when teardown needs one.
pub struct KubeClients;

#[async_trait]
impl ClientFactory for KubeClients {
	async fn client(&self) -> tether_session::Result<Arc<dyn K8sClient>> {
		Ok(Arc::new(KubeClient::new().await?))
	}
}

pub fn workstation(config: &TetherConfig) -> Workstation {
	Workstation::system(config, Arc::new(SystemCommandRunner))
}

pub async fn session_manager(config: TetherConfig, debug: bool) -> anyhow::Result<SessionManager> {
	let client: Arc<dyn K8sClient> = Arc::new(KubeClient::new().await?);
	let workstation = workstation(&config);
	Ok(SessionManager::new(config, client, workstation).with_debug(debug))
}

/// Run `setup`, hold the session until interrupted, then tear it down.
///
/// Teardown runs whether setup succeeded, failed, or was interrupted.
/// A setup failure is returned after teardown so the process exits non-zero.
pub async fn hold_session<F>(
	manager: &SessionManager,
	component: ComponentKind,
	setup: F,
) -> anyhow::Result<()>
where
	F: Future<Output = tether_session::Result<()>>,
{
	let outcome = tokio::select! {
		result = setup => Some(result),
		_ = tokio::signal::ctrl_c() => None,
	};

	let setup_error = match outcome {
		Some(Ok(())) => {
			info!("session ready, press ctrl-c to stop");
			if let Err(e) = tokio::signal::ctrl_c().await {
				error!(error = %e, "failed to listen for ctrl-c");
			}
			None
		}
		Some(Err(e)) => {
			error!(error = %e, "session setup failed");
			Some(e)
		}
		None => {
			warn!("interrupted during setup");
			None
		}
	};

	let report = manager
		.teardown_coordinator()
		.run(SessionManager::handle(component), async {
			let _ = tokio::signal::ctrl_c().await;
		})
		.await;
	if !report.is_clean() {
		warn!(failed = %report.failures.join(", "), "session torn down with errors");
	}

	match setup_error {
		Some(e) => Err(e.into()),
		None => Ok(()),
	}
}

/// Parse a `--expose` value into a port map.
pub fn parse_ports(expose: &str) -> anyhow::Result<tether_session::PortMap> {
	expose
		.parse()
		.map_err(|e| anyhow::anyhow!("invalid --expose '{expose}': {e}"))
}
