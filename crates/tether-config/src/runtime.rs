// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Fully resolved runtime configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::layer::*;
use crate::paths::PathsConfig;
use crate::ConfigError;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
pub const DEFAULT_SOCKS_PORT: u16 = 2223;
pub const DEFAULT_RECOVER_WAIT_SECS: u64 = 120;
pub const DEFAULT_SHADOW_IMAGE: &str = "ghcr.io/tether-dev/tether-shadow:latest";
pub const DEFAULT_ROUTER_IMAGE: &str = "ghcr.io/tether-dev/tether-router:latest";

/// Fully resolved configuration for a tether invocation.
#[derive(Debug, Clone)]
pub struct TetherConfig {
	pub cluster: ClusterConfig,
	pub connect: ConnectConfig,
	pub exchange: ExchangeConfig,
	pub shadow: ShadowConfig,
	pub logging: LoggingConfig,
	pub paths: PathsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
	pub namespace: String,
	pub cluster_domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectConfig {
	pub dns_mode: DnsMode,
	pub method: ConnectMethod,
	pub shared_shadow: bool,
	pub use_global_proxy: bool,
	pub disable_dns: bool,
	pub cidrs: Vec<String>,
	pub socks_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeConfig {
	pub method: ExchangeMethod,
	pub recover_wait_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowConfig {
	pub image: String,
	pub router_image: String,
	pub ready_timeout: Duration,
	pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
	pub level: LogLevel,
	pub format: LogFormat,
}

/// Name resolution strategy for a connect session.
///
/// Parsed from `hosts[:ns1,ns2]`, `pod-dns` or `local-dns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsMode {
	/// Write service entries to the hosts file. An empty list means the
	/// current namespace only.
	Hosts { namespaces: Vec<String> },
	/// Point the local resolver straight at the shadow pod.
	PodDns,
	/// Run a local forwarder in front of the shadow pod.
	LocalDns,
}

impl FromStr for DnsMode {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		let (tag, suffix) = match s.split_once(':') {
			Some((tag, suffix)) => (tag, Some(suffix)),
			None => (s, None),
		};
		match (tag, suffix) {
			("hosts", suffix) => {
				let namespaces = suffix
					.unwrap_or_default()
					.split(',')
					.map(str::trim)
					.filter(|ns| !ns.is_empty())
					.map(String::from)
					.collect();
				Ok(DnsMode::Hosts { namespaces })
			}
			("pod-dns", None) => Ok(DnsMode::PodDns),
			("local-dns", None) => Ok(DnsMode::LocalDns),
			_ => Err(ConfigError::invalid_value(
				"connect.dns_mode",
				format!("unsupported dns mode '{s}', expected hosts[:ns,...], pod-dns or local-dns"),
			)),
		}
	}
}

impl fmt::Display for DnsMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DnsMode::Hosts { namespaces } if namespaces.is_empty() => write!(f, "hosts"),
			DnsMode::Hosts { namespaces } => write!(f, "hosts:{}", namespaces.join(",")),
			DnsMode::PodDns => write!(f, "pod-dns"),
			DnsMode::LocalDns => write!(f, "local-dns"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectMethod {
	#[default]
	Tun,
	Socks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeMethod {
	#[default]
	Scale,
	Ephemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
	Error,
	Warn,
	#[default]
	Info,
	Debug,
	Trace,
}

impl LogLevel {
	pub fn as_str(&self) -> &'static str {
		match self {
			LogLevel::Error => "error",
			LogLevel::Warn => "warn",
			LogLevel::Info => "info",
			LogLevel::Debug => "debug",
			LogLevel::Trace => "trace",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
	#[default]
	Pretty,
	Json,
	Compact,
}

impl Default for ShadowConfig {
	fn default() -> Self {
		Self {
			image: DEFAULT_SHADOW_IMAGE.to_string(),
			router_image: DEFAULT_ROUTER_IMAGE.to_string(),
			ready_timeout: Duration::from_secs(60),
			poll_interval: Duration::from_millis(1000),
		}
	}
}

impl TetherConfig {
	/// Build runtime config from a merged layer and paths.
	pub fn from_layer(layer: ConfigLayer, paths: PathsConfig) -> Result<Self, ConfigError> {
		Ok(Self {
			cluster: build_cluster_config(layer.cluster),
			connect: build_connect_config(layer.connect)?,
			exchange: build_exchange_config(layer.exchange)?,
			shadow: build_shadow_config(layer.shadow),
			logging: build_logging_config(layer.logging)?,
			paths,
		})
	}
}

fn build_cluster_config(layer: Option<ClusterLayer>) -> ClusterConfig {
	let layer = layer.unwrap_or_default();
	ClusterConfig {
		namespace: layer
			.namespace
			.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
		cluster_domain: layer
			.cluster_domain
			.unwrap_or_else(|| DEFAULT_CLUSTER_DOMAIN.to_string()),
	}
}

fn build_connect_config(layer: Option<ConnectLayer>) -> Result<ConnectConfig, ConfigError> {
	let layer = layer.unwrap_or_default();
	let dns_mode = match layer.dns_mode.as_deref() {
		Some(mode) => mode.parse()?,
		None => DnsMode::Hosts {
			namespaces: Vec::new(),
		},
	};
	Ok(ConnectConfig {
		dns_mode,
		method: parse_connect_method(layer.method.as_deref())?,
		shared_shadow: layer.shared_shadow.unwrap_or(false),
		use_global_proxy: layer.use_global_proxy.unwrap_or(false),
		disable_dns: layer.disable_dns.unwrap_or(false),
		cidrs: layer.cidrs.unwrap_or_default(),
		socks_port: layer.socks_port.unwrap_or(DEFAULT_SOCKS_PORT),
	})
}

fn build_exchange_config(layer: Option<ExchangeLayer>) -> Result<ExchangeConfig, ConfigError> {
	let layer = layer.unwrap_or_default();
	Ok(ExchangeConfig {
		method: parse_exchange_method(layer.method.as_deref())?,
		recover_wait_secs: layer
			.recover_wait_secs
			.unwrap_or(DEFAULT_RECOVER_WAIT_SECS),
	})
}

fn build_shadow_config(layer: Option<ShadowLayer>) -> ShadowConfig {
	let layer = layer.unwrap_or_default();
	let defaults = ShadowConfig::default();
	ShadowConfig {
		image: layer.image.unwrap_or(defaults.image),
		router_image: layer.router_image.unwrap_or(defaults.router_image),
		ready_timeout: layer
			.ready_timeout_secs
			.map(Duration::from_secs)
			.unwrap_or(defaults.ready_timeout),
		poll_interval: layer
			.poll_interval_ms
			.map(Duration::from_millis)
			.unwrap_or(defaults.poll_interval),
	}
}

fn build_logging_config(layer: Option<LoggingLayer>) -> Result<LoggingConfig, ConfigError> {
	let layer = layer.unwrap_or_default();
	Ok(LoggingConfig {
		level: parse_log_level(layer.level.as_deref())?,
		format: parse_log_format(layer.format.as_deref())?,
	})
}

pub fn parse_log_level(s: Option<&str>) -> Result<LogLevel, ConfigError> {
	match s.map(str::to_ascii_lowercase).as_deref() {
		None => Ok(LogLevel::Info),
		Some("error") => Ok(LogLevel::Error),
		Some("warn") => Ok(LogLevel::Warn),
		Some("info") => Ok(LogLevel::Info),
		Some("debug") => Ok(LogLevel::Debug),
		Some("trace") => Ok(LogLevel::Trace),
		Some(other) => Err(ConfigError::invalid_value(
			"logging.level",
			format!("unknown log level '{other}'"),
		)),
	}
}

pub fn parse_log_format(s: Option<&str>) -> Result<LogFormat, ConfigError> {
	match s {
		None | Some("pretty") => Ok(LogFormat::Pretty),
		Some("json") => Ok(LogFormat::Json),
		Some("compact") => Ok(LogFormat::Compact),
		Some(other) => Err(ConfigError::invalid_value(
			"logging.format",
			format!("unknown log format '{other}'"),
		)),
	}
}

fn parse_connect_method(s: Option<&str>) -> Result<ConnectMethod, ConfigError> {
	match s {
		None | Some("tun") => Ok(ConnectMethod::Tun),
		Some("socks") => Ok(ConnectMethod::Socks),
		Some(other) => Err(ConfigError::invalid_value(
			"connect.method",
			format!("unknown connect method '{other}', expected tun or socks"),
		)),
	}
}

fn parse_exchange_method(s: Option<&str>) -> Result<ExchangeMethod, ConfigError> {
	match s {
		None | Some("scale") => Ok(ExchangeMethod::Scale),
		Some("ephemeral") => Ok(ExchangeMethod::Ephemeral),
		Some(other) => Err(ConfigError::invalid_value(
			"exchange.method",
			format!("unknown exchange method '{other}', expected scale or ephemeral"),
		)),
	}
}
