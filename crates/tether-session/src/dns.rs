// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Name resolution for connect sessions.
//!
//! Three mutually exclusive modes:
//! - `hosts[:ns,...]` writes service entries into the hosts file
//! - `pod-dns` points the resolver straight at the shadow pod
//! - `local-dns` dumps the current namespace and runs a local forwarder
//!   in front of the shadow pod

use std::collections::BTreeMap;
use std::sync::Arc;

use tether_config::DnsMode;
use tether_k8s::{label_selector, pod_ip, pod_is_ready, K8sClient};
use tracing::{debug, error, info, instrument};

use crate::error::Result;
use crate::hosts::HostsWriter;
use crate::names::{ENV_DNS_PROTOCOL, ENV_LOCAL_DOMAINS, ENV_LOG_LEVEL};
use crate::local_dns::{local_dns_port, LocalDnsServer};
use crate::resolver::NameServerSetter;

/// What applying a DNS mode changed on the workstation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedDns {
	pub dumped_hosts: bool,
	pub name_server_set: bool,
	pub local_dns_port: Option<u16>,
}

pub struct DnsStrategy {
	client: Arc<dyn K8sClient>,
	hosts: Arc<dyn HostsWriter>,
	name_server: Arc<dyn NameServerSetter>,
	local_dns: Arc<dyn LocalDnsServer>,
	cluster_domain: String,
	windows: bool,
}

impl DnsStrategy {
	pub fn new(
		client: Arc<dyn K8sClient>,
		hosts: Arc<dyn HostsWriter>,
		name_server: Arc<dyn NameServerSetter>,
		local_dns: Arc<dyn LocalDnsServer>,
		cluster_domain: impl Into<String>,
	) -> Self {
		Self {
			client,
			hosts,
			name_server,
			local_dns,
			cluster_domain: cluster_domain.into(),
			windows: cfg!(windows),
		}
	}

	/// Behave as on Windows (standard DNS port) or not, regardless of host.
	pub fn with_windows(mut self, windows: bool) -> Self {
		self.windows = windows;
		self
	}

	/// Parse `mode` and apply it. Unknown modes are configuration errors.
	pub async fn apply_str(
		&self,
		mode: &str,
		namespace: &str,
		shadow_ip: &str,
	) -> Result<AppliedDns> {
		let mode: DnsMode = mode.parse()?;
		self.apply(&mode, namespace, shadow_ip).await
	}

	#[instrument(skip(self), fields(mode = %mode))]
	pub async fn apply(&self, mode: &DnsMode, namespace: &str, shadow_ip: &str) -> Result<AppliedDns> {
		match mode {
			DnsMode::Hosts { namespaces } => {
				let targets: Vec<String> = if namespaces.is_empty() {
					vec![namespace.to_string()]
				} else {
					namespaces.clone()
				};
				let hosts = self.hosts_for(namespace, &targets).await?;
				self.hosts.dump_hosts(&hosts)?;
				Ok(AppliedDns {
					dumped_hosts: true,
					..Default::default()
				})
			}
			DnsMode::PodDns => {
				self.name_server.set_name_server(shadow_ip).await?;
				Ok(AppliedDns {
					name_server_set: true,
					..Default::default()
				})
			}
			DnsMode::LocalDns => {
				let hosts = self.hosts_for(namespace, &[namespace.to_string()]).await?;
				self.hosts.dump_hosts(&hosts)?;

				let port = local_dns_port(self.windows);
				if let Err(e) = self.local_dns.start(shadow_ip, port).await {
					error!(port, error = %e, "failed to start local dns server");
					return Err(e);
				}
				self
					.name_server
					.set_name_server(&format!("127.0.0.1:{port}"))
					.await?;
				Ok(AppliedDns {
					dumped_hosts: true,
					name_server_set: true,
					local_dns_port: Some(port),
				})
			}
		}
	}

	/// Host entries for every service in `targets`.
	///
	/// Bare service names are only emitted for the current namespace.
	pub async fn hosts_for(
		&self,
		current_namespace: &str,
		targets: &[String],
	) -> Result<BTreeMap<String, String>> {
		let mut hosts = BTreeMap::new();
		for namespace in targets {
			debug!(namespace = %namespace, "searching services");
			for (service, ip) in self.service_hosts(namespace).await? {
				if namespace == current_namespace {
					hosts.insert(service.clone(), ip.clone());
				}
				hosts.insert(format!("{service}.{namespace}"), ip.clone());
				hosts.insert(
					format!("{service}.{namespace}.svc.{}", self.cluster_domain),
					ip,
				);
			}
		}
		info!(entries = hosts.len(), "resolved service hosts");
		Ok(hosts)
	}

	/// Service name to IP for one namespace.
	///
	/// Headless services resolve to a ready backing pod and are skipped when
	/// there is none.
	pub async fn service_hosts(&self, namespace: &str) -> Result<BTreeMap<String, String>> {
		let mut hosts = BTreeMap::new();
		for service in self.client.list_services(namespace).await? {
			let Some(name) = service.metadata.name.clone() else {
				continue;
			};
			let spec = service.spec.unwrap_or_default();
			let cluster_ip = spec.cluster_ip.unwrap_or_default();
			if !cluster_ip.is_empty() && cluster_ip != "None" {
				debug!(service = %name, ip = %cluster_ip, "service found");
				hosts.insert(name, cluster_ip);
				continue;
			}

			let selector = spec.selector.unwrap_or_default();
			if selector.is_empty() {
				continue;
			}
			let pods = match self
				.client
				.list_pods(namespace, &label_selector(&selector))
				.await
			{
				Ok(pods) => pods,
				Err(e) => {
					debug!(service = %name, error = %e, "cannot list pods of headless service, skipping");
					continue;
				}
			};
			let backing = pods
				.iter()
				.filter(|p| pod_is_ready(p))
				.find_map(|p| pod_ip(p).map(str::to_string));
			match backing {
				Some(ip) => {
					debug!(service = %name, ip = %ip, "headless service found");
					hosts.insert(name, ip);
				}
				None => debug!(service = %name, "headless service has no ready pod, skipping"),
			}
		}
		Ok(hosts)
	}
}

/// Environment for a connect shadow serving `mode`.
///
/// The local forwarder speaks TCP to the shadow; everything else uses UDP.
pub fn shadow_env(mode: &DnsMode, debug: bool, local_domains: &[String]) -> BTreeMap<String, String> {
	let mut env = BTreeMap::new();
	let protocol = if matches!(mode, DnsMode::LocalDns) {
		"tcp"
	} else {
		"udp"
	};
	env.insert(ENV_DNS_PROTOCOL.to_string(), protocol.to_string());
	env.insert(
		ENV_LOG_LEVEL.to_string(),
		if debug { "debug" } else { "info" }.to_string(),
	);
	if !local_domains.is_empty() {
		env.insert(ENV_LOCAL_DOMAINS.to_string(), local_domains.join(","));
	}
	env
}
