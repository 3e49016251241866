// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;

use clap::Args;
use tether_config::{CliOverrides, TetherConfig};
use tether_session::{ComponentKind, ConnectOptions};
use tracing::info;

use super::{hold_session, session_manager, GlobalArgs};

const RESOLV_CONF: &str = "/etc/resolv.conf";

#[derive(Debug, Clone, Args)]
pub struct ConnectArgs {
	/// hosts, hosts:<ns1>,<ns2>, pod-dns or local-dns
	#[arg(long)]
	pub dns_mode: Option<String>,

	/// tun or socks
	#[arg(long)]
	pub method: Option<String>,

	/// Share one shadow pod with other connect sessions
	#[arg(long)]
	pub shared_shadow: bool,

	/// Also set the desktop-wide proxy (socks only)
	#[arg(long)]
	pub global_proxy: bool,

	/// Leave DNS untouched
	#[arg(long)]
	pub disable_dns: bool,

	/// Cluster address range to route, repeatable
	#[arg(long = "cidr")]
	pub cidrs: Vec<String>,

	/// Local socks port
	#[arg(long)]
	pub socks_port: Option<u16>,

	/// Write a .jvmrc with proxy flags into this directory
	#[arg(long)]
	pub jvmrc_dir: Option<PathBuf>,
}

impl ConnectArgs {
	pub fn apply(&self, overrides: &mut CliOverrides) {
		overrides.dns_mode = self.dns_mode.clone();
		overrides.connect_method = self.method.clone();
		overrides.shared_shadow = self.shared_shadow.then_some(true);
		overrides.use_global_proxy = self.global_proxy.then_some(true);
		overrides.disable_dns = self.disable_dns.then_some(true);
		if !self.cidrs.is_empty() {
			overrides.cidrs = Some(self.cidrs.clone());
		}
		overrides.socks_port = self.socks_port;
	}
}

pub async fn run(config: TetherConfig, global: &GlobalArgs, args: ConnectArgs) -> anyhow::Result<()> {
	let manager = session_manager(config, global.debug).await?;
	let options = ConnectOptions {
		local_domains: host_search_domains(),
		jvmrc_dir: args.jvmrc_dir,
	};
	hold_session(&manager, ComponentKind::Connect, async {
		let session = manager.connect(&options).await?;
		info!(
			shadow = %session.endpoint.pod_name,
			ip = %session.endpoint.ip,
			hosts = session.dns.dumped_hosts,
			"connected"
		);
		Ok(())
	})
	.await
}

fn host_search_domains() -> Vec<String> {
	std::fs::read_to_string(RESOLV_CONF)
		.map(|content| search_domains(&content))
		.unwrap_or_default()
}

fn search_domains(resolv_conf: &str) -> Vec<String> {
	let mut domains = Vec::new();
	for line in resolv_conf.lines() {
		let mut fields = line.split_whitespace();
		if matches!(fields.next(), Some("search" | "domain")) {
			for domain in fields {
				if !domains.iter().any(|d| d == domain) {
					domains.push(domain.to_string());
				}
			}
		}
	}
	domains
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn search_and_domain_lines_are_collected() {
		let conf = "nameserver 10.0.0.2\ndomain corp.example\nsearch corp.example lab.example\n# search ignored.example\n";
		assert_eq!(search_domains(conf), vec!["corp.example", "lab.example"]);
	}

	#[test]
	fn flags_only_override_when_given() {
		let args = ConnectArgs {
			dns_mode: Some("pod-dns".to_string()),
			method: None,
			shared_shadow: false,
			global_proxy: true,
			disable_dns: false,
			cidrs: Vec::new(),
			socks_port: None,
			jvmrc_dir: None,
		};
		let mut overrides = CliOverrides::default();
		args.apply(&mut overrides);
		assert_eq!(overrides.dns_mode.as_deref(), Some("pod-dns"));
		assert_eq!(overrides.use_global_proxy, Some(true));
		assert_eq!(overrides.shared_shadow, None);
		assert_eq!(overrides.cidrs, None);
	}
}
