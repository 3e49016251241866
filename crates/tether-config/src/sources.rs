// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sources: files, environment, CLI, defaults.

use std::path::PathBuf;

use tracing::{debug, trace, warn};

use crate::layer::*;
use crate::paths::PathsConfig;
use crate::ConfigError;

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	UserFile = 30,
	Environment = 50,
	Cli = 60,
}

/// Trait for configuration sources.
pub trait ConfigSource: Send + Sync {
	/// Name for logging
	fn name(&self) -> &'static str;

	/// Precedence level
	fn precedence(&self) -> Precedence;

	/// Load configuration layer from this source
	fn load(&self) -> Result<ConfigLayer, ConfigError>;
}

/// Built-in defaults source.
pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}
	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<ConfigLayer, ConfigError> {
		debug!("loading defaults");
		// Defaults are applied in TetherConfig::from_layer
		Ok(ConfigLayer::default())
	}
}

/// File-based configuration source (TOML).
pub struct FileSource {
	path: PathBuf,
	precedence: Precedence,
	name: &'static str,
}

impl FileSource {
	/// User config: ~/.config/tether/config.toml
	pub fn user(paths: &PathsConfig) -> Self {
		Self {
			path: paths.user_config_file.clone(),
			precedence: Precedence::UserFile,
			name: "user-config",
		}
	}

	/// Explicit `--config` file, loaded in place of the user config.
	pub fn explicit(path: PathBuf) -> Self {
		Self {
			path,
			precedence: Precedence::UserFile,
			name: "explicit-config",
		}
	}
}

impl ConfigSource for FileSource {
	fn name(&self) -> &'static str {
		self.name
	}
	fn precedence(&self) -> Precedence {
		self.precedence
	}

	fn load(&self) -> Result<ConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), source = self.name, "config file not found, skipping");
			return Ok(ConfigLayer::default());
		}

		debug!(path = %self.path.display(), source = self.name, "loading config file");

		let content = std::fs::read_to_string(&self.path)?;
		let layer: ConfigLayer = toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
			path: self.path.clone(),
			source: e,
		})?;

		trace!(source = self.name, "parsed config layer");
		Ok(layer)
	}
}

/// Environment variable source.
///
/// Reads the `TETHER_*` variables. `TETHER_HOME` is handled by path
/// resolution, not here.
pub struct EnvSource {
	vars: Option<Vec<(String, String)>>,
}

impl EnvSource {
	/// Read from the process environment.
	pub fn new() -> Self {
		Self { vars: None }
	}

	/// Read from a fixed set of variables instead of the process environment.
	pub fn from_vars<I, K, V>(vars: I) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		Self {
			vars: Some(
				vars
					.into_iter()
					.map(|(k, v)| (k.into(), v.into()))
					.collect(),
			),
		}
	}
}

impl Default for EnvSource {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}
	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<ConfigLayer, ConfigError> {
		debug!("loading environment variables");
		let mut layer = ConfigLayer::default();

		let vars: Vec<(String, String)> = match &self.vars {
			Some(vars) => vars.clone(),
			None => std::env::vars().collect(),
		};

		for (key, value) in vars {
			if !key.starts_with("TETHER_") {
				continue;
			}

			let value = value.trim().to_string();
			if value.is_empty() {
				continue;
			}

			trace!(key = %key, "processing env var");

			match key.as_str() {
				"TETHER_NAMESPACE" => {
					layer
						.cluster
						.get_or_insert_with(ClusterLayer::default)
						.namespace = Some(value);
				}
				"TETHER_CLUSTER_DOMAIN" => {
					layer
						.cluster
						.get_or_insert_with(ClusterLayer::default)
						.cluster_domain = Some(value);
				}
				"TETHER_DNS_MODE" => {
					layer
						.connect
						.get_or_insert_with(ConnectLayer::default)
						.dns_mode = Some(value);
				}
				"TETHER_SHARED_SHADOW" => match parse_bool(&value) {
					Some(v) => {
						layer
							.connect
							.get_or_insert_with(ConnectLayer::default)
							.shared_shadow = Some(v);
					}
					None => {
						return Err(ConfigError::invalid_value(
							"TETHER_SHARED_SHADOW",
							format!("expected a boolean, got '{value}'"),
						))
					}
				},
				"TETHER_EXCHANGE_METHOD" => {
					layer
						.exchange
						.get_or_insert_with(ExchangeLayer::default)
						.method = Some(value);
				}
				"TETHER_RECOVER_WAIT_SECS" => match value.parse() {
					Ok(v) => {
						layer
							.exchange
							.get_or_insert_with(ExchangeLayer::default)
							.recover_wait_secs = Some(v);
					}
					Err(_) => {
						return Err(ConfigError::invalid_value(
							"TETHER_RECOVER_WAIT_SECS",
							format!("expected seconds, got '{value}'"),
						))
					}
				},
				"TETHER_LOG_LEVEL" => {
					layer
						.logging
						.get_or_insert_with(LoggingLayer::default)
						.level = Some(value);
				}
				"TETHER_LOG_FORMAT" => {
					layer
						.logging
						.get_or_insert_with(LoggingLayer::default)
						.format = Some(value);
				}
				"TETHER_HOME" => {}
				_ => {
					warn!(key = %key, "ignoring unknown TETHER_ variable");
				}
			}
		}

		Ok(layer)
	}
}

fn parse_bool(value: &str) -> Option<bool> {
	match value.to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

/// CLI override source.
pub struct CliSource {
	overrides: CliOverrides,
}

/// CLI argument overrides.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
	pub namespace: Option<String>,
	pub cluster_domain: Option<String>,
	pub dns_mode: Option<String>,
	pub connect_method: Option<String>,
	pub shared_shadow: Option<bool>,
	pub use_global_proxy: Option<bool>,
	pub disable_dns: Option<bool>,
	pub cidrs: Option<Vec<String>>,
	pub socks_port: Option<u16>,
	pub exchange_method: Option<String>,
	pub recover_wait_secs: Option<u64>,
	pub shadow_image: Option<String>,
	pub log_level: Option<String>,
	pub log_format: Option<String>,
	pub config_file: Option<PathBuf>,
	pub home: Option<PathBuf>,
}

impl CliSource {
	pub fn new(overrides: CliOverrides) -> Self {
		Self { overrides }
	}
}

impl ConfigSource for CliSource {
	fn name(&self) -> &'static str {
		"cli"
	}
	fn precedence(&self) -> Precedence {
		Precedence::Cli
	}

	fn load(&self) -> Result<ConfigLayer, ConfigError> {
		debug!("loading CLI overrides");
		let o = self.overrides.clone();

		let cluster = ClusterLayer {
			namespace: o.namespace,
			cluster_domain: o.cluster_domain,
		};
		let connect = ConnectLayer {
			dns_mode: o.dns_mode,
			method: o.connect_method,
			shared_shadow: o.shared_shadow,
			use_global_proxy: o.use_global_proxy,
			disable_dns: o.disable_dns,
			cidrs: o.cidrs,
			socks_port: o.socks_port,
		};
		let exchange = ExchangeLayer {
			method: o.exchange_method,
			recover_wait_secs: o.recover_wait_secs,
		};
		let shadow = ShadowLayer {
			image: o.shadow_image,
			..Default::default()
		};
		let logging = LoggingLayer {
			level: o.log_level,
			format: o.log_format,
		};

		Ok(ConfigLayer {
			cluster: Some(cluster),
			connect: Some(connect),
			exchange: Some(exchange),
			shadow: Some(shadow),
			logging: Some(logging),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use tempfile::NamedTempFile;

	#[test]
	fn test_file_source_missing_file_is_empty() {
		let source = FileSource::explicit(PathBuf::from("/nonexistent/tether.toml"));
		let layer = source.load().unwrap();
		assert!(layer.cluster.is_none());
	}

	#[test]
	fn test_file_source_reports_parse_errors_with_path() {
		let mut file = NamedTempFile::new().unwrap();
		writeln!(file, "[cluster\nnamespace = 1").unwrap();

		let err = FileSource::explicit(file.path().to_path_buf())
			.load()
			.unwrap_err();
		match err {
			ConfigError::TomlParse { path, .. } => assert_eq!(path, file.path()),
			other => panic!("expected TomlParse, got {other:?}"),
		}
	}

	#[test]
	fn test_env_source_maps_known_vars() {
		let source = EnvSource::from_vars([
			("TETHER_NAMESPACE", "dev"),
			("TETHER_DNS_MODE", "pod-dns"),
			("TETHER_SHARED_SHADOW", "true"),
			("TETHER_RECOVER_WAIT_SECS", "30"),
			("TETHER_LOG_FORMAT", "json"),
			("PATH", "/usr/bin"),
			("TETHER_CLUSTER_DOMAIN", "   "),
		]);

		let layer = source.load().unwrap();
		let cluster = layer.cluster.unwrap();
		assert_eq!(cluster.namespace.as_deref(), Some("dev"));
		assert_eq!(cluster.cluster_domain, None);
		let connect = layer.connect.unwrap();
		assert_eq!(connect.dns_mode.as_deref(), Some("pod-dns"));
		assert_eq!(connect.shared_shadow, Some(true));
		assert_eq!(layer.exchange.unwrap().recover_wait_secs, Some(30));
		assert_eq!(layer.logging.unwrap().format.as_deref(), Some("json"));
	}

	#[test]
	fn test_env_source_rejects_bad_numbers() {
		let source = EnvSource::from_vars([("TETHER_RECOVER_WAIT_SECS", "soon")]);
		assert!(source.load().is_err());

		let source = EnvSource::from_vars([("TETHER_SHARED_SHADOW", "maybe")]);
		assert!(source.load().is_err());
	}

	#[test]
	fn test_cli_source_only_sets_given_fields() {
		let source = CliSource::new(CliOverrides {
			namespace: Some("qa".to_string()),
			..Default::default()
		});
		let layer = source.load().unwrap();
		assert_eq!(layer.cluster.unwrap().namespace.as_deref(), Some("qa"));
		assert_eq!(layer.connect.unwrap().dns_mode, None);
	}

	#[test]
	fn test_precedence_ordering() {
		assert!(Precedence::Cli > Precedence::Environment);
		assert!(Precedence::Environment > Precedence::UserFile);
		assert!(Precedence::UserFile > Precedence::Defaults);
	}
}
