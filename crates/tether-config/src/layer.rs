// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Partial configuration layer for merging from multiple sources.

use serde::Deserialize;

/// Partial configuration layer - all fields are Option for merging.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigLayer {
	#[serde(default)]
	pub cluster: Option<ClusterLayer>,
	#[serde(default)]
	pub connect: Option<ConnectLayer>,
	#[serde(default)]
	pub exchange: Option<ExchangeLayer>,
	#[serde(default)]
	pub shadow: Option<ShadowLayer>,
	#[serde(default)]
	pub logging: Option<LoggingLayer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterLayer {
	#[serde(default)]
	pub namespace: Option<String>,
	#[serde(default)]
	pub cluster_domain: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectLayer {
	#[serde(default)]
	pub dns_mode: Option<String>,
	#[serde(default)]
	pub method: Option<String>,
	#[serde(default)]
	pub shared_shadow: Option<bool>,
	#[serde(default)]
	pub use_global_proxy: Option<bool>,
	#[serde(default)]
	pub disable_dns: Option<bool>,
	#[serde(default)]
	pub cidrs: Option<Vec<String>>,
	#[serde(default)]
	pub socks_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExchangeLayer {
	#[serde(default)]
	pub method: Option<String>,
	#[serde(default)]
	pub recover_wait_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShadowLayer {
	#[serde(default)]
	pub image: Option<String>,
	#[serde(default)]
	pub router_image: Option<String>,
	#[serde(default)]
	pub ready_timeout_secs: Option<u64>,
	#[serde(default)]
	pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingLayer {
	#[serde(default)]
	pub level: Option<String>,
	#[serde(default)]
	pub format: Option<String>,
}

impl ConfigLayer {
	/// Merge another layer into this one. Other layer takes precedence.
	pub fn merge(&mut self, other: ConfigLayer) {
		merge_option(&mut self.cluster, other.cluster, ClusterLayer::merge);
		merge_option(&mut self.connect, other.connect, ConnectLayer::merge);
		merge_option(&mut self.exchange, other.exchange, ExchangeLayer::merge);
		merge_option(&mut self.shadow, other.shadow, ShadowLayer::merge);
		merge_option(&mut self.logging, other.logging, LoggingLayer::merge);
	}
}

fn merge_option<T, F>(target: &mut Option<T>, source: Option<T>, merge_fn: F)
where
	F: FnOnce(&mut T, T),
{
	match (target.as_mut(), source) {
		(Some(t), Some(s)) => merge_fn(t, s),
		(None, Some(s)) => *target = Some(s),
		_ => {}
	}
}

/// Overwrite `target` when `source` carries a value.
fn take<T>(target: &mut Option<T>, source: Option<T>) {
	if source.is_some() {
		*target = source;
	}
}

impl ClusterLayer {
	fn merge(&mut self, other: ClusterLayer) {
		take(&mut self.namespace, other.namespace);
		take(&mut self.cluster_domain, other.cluster_domain);
	}
}

impl ConnectLayer {
	fn merge(&mut self, other: ConnectLayer) {
		take(&mut self.dns_mode, other.dns_mode);
		take(&mut self.method, other.method);
		take(&mut self.shared_shadow, other.shared_shadow);
		take(&mut self.use_global_proxy, other.use_global_proxy);
		take(&mut self.disable_dns, other.disable_dns);
		take(&mut self.cidrs, other.cidrs);
		take(&mut self.socks_port, other.socks_port);
	}
}

impl ExchangeLayer {
	fn merge(&mut self, other: ExchangeLayer) {
		take(&mut self.method, other.method);
		take(&mut self.recover_wait_secs, other.recover_wait_secs);
	}
}

impl ShadowLayer {
	fn merge(&mut self, other: ShadowLayer) {
		take(&mut self.image, other.image);
		take(&mut self.router_image, other.router_image);
		take(&mut self.ready_timeout_secs, other.ready_timeout_secs);
		take(&mut self.poll_interval_ms, other.poll_interval_ms);
	}
}

impl LoggingLayer {
	fn merge(&mut self, other: LoggingLayer) {
		take(&mut self.level, other.level);
		take(&mut self.format, other.format);
	}
}
