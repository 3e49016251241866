// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;
use std::sync::Arc;

use tether_config::TetherConfig;

use crate::command::CommandRunner;
use crate::hosts::{HostsFile, HostsWriter};
use crate::keys::{FileKeyStore, KeyStore};
use crate::local_dns::{LocalDnsServer, TcpForwardingDns};
use crate::proxy::{DesktopProxyRegistry, ProxyRegistry};
use crate::resolver::{DeviceNameServer, NameServerSetter, ResolvedDropIn};
use crate::tunnel::{platform_tunnel, TunnelDriver};

/// Everything a session changes on the local machine.
#[derive(Clone)]
pub struct Workstation {
	pub hosts: Arc<dyn HostsWriter>,
	pub name_server: Arc<dyn NameServerSetter>,
	pub local_dns: Arc<dyn LocalDnsServer>,
	pub tunnel: Arc<dyn TunnelDriver>,
	pub proxy: Arc<dyn ProxyRegistry>,
	pub keys: Arc<dyn KeyStore>,
	pub key_dir: PathBuf,
}

impl Workstation {
	/// The real machine, driven through `runner`.
	pub fn system(config: &TetherConfig, runner: Arc<dyn CommandRunner>) -> Self {
		let tunnel: Arc<dyn TunnelDriver> = Arc::from(platform_tunnel(runner.clone()));
		let name_server: Arc<dyn NameServerSetter> = if cfg!(windows) {
			Arc::new(DeviceNameServer::new(tunnel.clone()))
		} else {
			Arc::new(ResolvedDropIn::new(
				config.cluster.cluster_domain.clone(),
				runner.clone(),
			))
		};
		Self {
			hosts: Arc::new(HostsFile::system()),
			name_server,
			local_dns: Arc::new(TcpForwardingDns::new()),
			tunnel,
			proxy: Arc::new(DesktopProxyRegistry::new(
				config.paths.home_dir.clone(),
				runner,
			)),
			keys: Arc::new(FileKeyStore),
			key_dir: config.paths.key_dir(),
		}
	}
}
