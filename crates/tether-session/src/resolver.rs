// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Pointing the workstation's resolver at a name server.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::command::{args, CommandRunner};
use crate::error::Result;
use crate::tunnel::TunnelDriver;

pub const RESOLVED_DROP_IN: &str = "/etc/systemd/resolved.conf.d/tether.conf";

#[async_trait]
pub trait NameServerSetter: Send + Sync {
	/// Route cluster lookups to `address` (`ip` or `ip:port`).
	async fn set_name_server(&self, address: &str) -> Result<()>;

	/// Undo `set_name_server`.
	async fn restore(&self) -> Result<()>;
}

/// systemd-resolved drop-in that sends the cluster domain to one server.
pub struct ResolvedDropIn {
	path: PathBuf,
	cluster_domain: String,
	runner: Option<Arc<dyn CommandRunner>>,
}

impl ResolvedDropIn {
	pub fn new(cluster_domain: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
		Self {
			path: PathBuf::from(RESOLVED_DROP_IN),
			cluster_domain: cluster_domain.into(),
			runner: Some(runner),
		}
	}

	/// Write to `path` and skip the resolver restart.
	pub fn at(path: impl Into<PathBuf>, cluster_domain: impl Into<String>) -> Self {
		Self {
			path: path.into(),
			cluster_domain: cluster_domain.into(),
			runner: None,
		}
	}

	fn render(&self, address: &str) -> String {
		format!(
			"# written by tether, removed on exit\n[Resolve]\nDNS={address}\nDomains=~{}\n",
			self.cluster_domain
		)
	}

	async fn reload(&self) {
		if let Some(runner) = &self.runner {
			if let Err(e) = runner
				.run("systemctl", &args(&["restart", "systemd-resolved"]))
				.await
			{
				warn!(error = %e, "failed to restart systemd-resolved");
			}
		}
	}
}

#[async_trait]
impl NameServerSetter for ResolvedDropIn {
	async fn set_name_server(&self, address: &str) -> Result<()> {
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		tokio::fs::write(&self.path, self.render(address)).await?;
		info!(path = %self.path.display(), address = %address, "resolver pointed at cluster dns");
		self.reload().await;
		Ok(())
	}

	async fn restore(&self) -> Result<()> {
		match tokio::fs::remove_file(&self.path).await {
			Ok(()) => info!(path = %self.path.display(), "resolver configuration restored"),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				debug!(path = %self.path.display(), "resolver drop-in already removed");
				return Ok(());
			}
			Err(e) => return Err(e.into()),
		}
		self.reload().await;
		Ok(())
	}
}

/// Name server set on the tunnel device, as Windows does it.
pub struct DeviceNameServer {
	tunnel: Arc<dyn TunnelDriver>,
}

impl DeviceNameServer {
	pub fn new(tunnel: Arc<dyn TunnelDriver>) -> Self {
		Self { tunnel }
	}
}

#[async_trait]
impl NameServerSetter for DeviceNameServer {
	async fn set_name_server(&self, address: &str) -> Result<()> {
		let host = address.split(':').next().unwrap_or(address).to_string();
		self.tunnel.set_dns_server(&[host]).await
	}

	// Device settings vanish with the device.
	async fn restore(&self) -> Result<()> {
		Ok(())
	}
}
