// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Workstation proxy settings for socks sessions.
//!
//! `proxy.env` in the tether home holds `HTTP_PROXY`-style variables for the
//! user to source. The global proxy is the desktop-wide socks setting, managed
//! through `gsettings`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::command::{args, CommandRunner};
use crate::error::Result;
use crate::state::ProxyRecord;

pub const PROXY_ENV_FILE: &str = "proxy.env";
pub const JVMRC_FILE: &str = ".jvmrc";

const GNOME_PROXY: &str = "org.gnome.system.proxy";
const GNOME_SOCKS: &str = "org.gnome.system.proxy.socks";

#[async_trait]
pub trait ProxyRegistry: Send + Sync {
	/// Write proxy environment variables for `socks_port`. Returns the file written.
	async fn set_http_proxy_env(&self, socks_port: u16) -> Result<PathBuf>;

	async fn clean_http_proxy_env(&self, record: &ProxyRecord) -> Result<()>;

	async fn set_global_proxy(&self, socks_port: u16) -> Result<()>;

	async fn clean_global_proxy(&self, record: &ProxyRecord) -> Result<()>;
}

pub fn socks_url(port: u16) -> String {
	format!("socks5://127.0.0.1:{port}")
}

fn render_env(port: u16) -> String {
	let url = socks_url(port);
	format!(
		"export HTTP_PROXY={url}\nexport HTTPS_PROXY={url}\nexport ALL_PROXY={url}\nexport NO_PROXY=localhost,127.0.0.1\n"
	)
}

pub struct DesktopProxyRegistry {
	home: PathBuf,
	runner: Arc<dyn CommandRunner>,
}

impl DesktopProxyRegistry {
	pub fn new(home: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
		Self {
			home: home.into(),
			runner,
		}
	}

	async fn gsettings(&self, parts: &[&str]) -> Result<()> {
		self.runner.run("gsettings", &args(parts)).await?;
		Ok(())
	}
}

#[async_trait]
impl ProxyRegistry for DesktopProxyRegistry {
	async fn set_http_proxy_env(&self, socks_port: u16) -> Result<PathBuf> {
		tokio::fs::create_dir_all(&self.home).await?;
		let path = self.home.join(PROXY_ENV_FILE);
		tokio::fs::write(&path, render_env(socks_port)).await?;
		info!(path = %path.display(), "proxy environment written, source it to use the socks proxy");
		Ok(path)
	}

	async fn clean_http_proxy_env(&self, record: &ProxyRecord) -> Result<()> {
		let path = record
			.env_file
			.clone()
			.unwrap_or_else(|| self.home.join(PROXY_ENV_FILE));
		match tokio::fs::remove_file(&path).await {
			Ok(()) => info!(path = %path.display(), "proxy environment removed"),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				debug!(path = %path.display(), "proxy environment already removed")
			}
			Err(e) => return Err(e.into()),
		}
		Ok(())
	}

	async fn set_global_proxy(&self, socks_port: u16) -> Result<()> {
		let port = socks_port.to_string();
		self.gsettings(&["set", GNOME_SOCKS, "host", "127.0.0.1"]).await?;
		self.gsettings(&["set", GNOME_SOCKS, "port", &port]).await?;
		self.gsettings(&["set", GNOME_PROXY, "mode", "manual"]).await?;
		info!(port = socks_port, "global socks proxy enabled");
		Ok(())
	}

	async fn clean_global_proxy(&self, record: &ProxyRecord) -> Result<()> {
		if !record.global {
			return Ok(());
		}
		self.gsettings(&["set", GNOME_PROXY, "mode", "none"]).await?;
		if let Err(e) = self.gsettings(&["reset", GNOME_SOCKS, "port"]).await {
			warn!(error = %e, "failed to reset socks proxy port");
		}
		info!("global socks proxy disabled");
		Ok(())
	}
}

/// Write a `.jvmrc` routing JVM traffic through the socks proxy.
pub fn write_jvmrc(dir: &Path, socks_port: u16) -> Result<PathBuf> {
	let path = dir.join(JVMRC_FILE);
	std::fs::write(
		&path,
		format!("-DsocksProxyHost=127.0.0.1\n-DsocksProxyPort={socks_port}\n"),
	)?;
	debug!(path = %path.display(), "jvmrc written");
	Ok(path)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::command::RecordingRunner;
	use tempfile::TempDir;

	#[tokio::test]
	async fn env_file_written_and_cleaned() {
		let dir = TempDir::new().unwrap();
		let registry = DesktopProxyRegistry::new(dir.path(), Arc::new(RecordingRunner::new()));

		let path = registry.set_http_proxy_env(2223).await.unwrap();
		let content = std::fs::read_to_string(&path).unwrap();
		assert!(content.contains("export HTTP_PROXY=socks5://127.0.0.1:2223\n"));
		assert!(content.contains("export ALL_PROXY=socks5://127.0.0.1:2223\n"));

		let record = ProxyRecord {
			socks_port: 2223,
			global: false,
			env_file: Some(path.clone()),
		};
		registry.clean_http_proxy_env(&record).await.unwrap();
		assert!(!path.exists());
		registry.clean_http_proxy_env(&record).await.unwrap();
	}

	#[tokio::test]
	async fn global_proxy_only_cleaned_when_recorded() {
		let dir = TempDir::new().unwrap();
		let runner = RecordingRunner::new();
		let registry = DesktopProxyRegistry::new(dir.path(), Arc::new(runner.clone()));

		let mut record = ProxyRecord {
			socks_port: 2223,
			global: false,
			env_file: None,
		};
		registry.clean_global_proxy(&record).await.unwrap();
		assert!(runner.calls().is_empty());

		record.global = true;
		registry.clean_global_proxy(&record).await.unwrap();
		assert_eq!(
			runner.calls()[0],
			"gsettings set org.gnome.system.proxy mode none"
		);
	}

	#[test]
	fn jvmrc_carries_socks_flags() {
		let dir = TempDir::new().unwrap();
		let path = write_jvmrc(dir.path(), 1080).unwrap();
		assert_eq!(path.file_name().unwrap(), ".jvmrc");
		assert!(std::fs::read_to_string(path)
			.unwrap()
			.contains("-DsocksProxyPort=1080"));
	}
}
