// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration validation rules.

use std::net::Ipv4Addr;

use tracing::warn;

use crate::runtime::{ConnectMethod, TetherConfig};
use crate::ConfigError;

/// Validate the configuration.
///
/// Returns Ok(()) if valid, or a ConfigError describing the first problem.
pub fn validate_config(config: &TetherConfig) -> Result<(), ConfigError> {
	validate_cluster(config)?;
	validate_connect(config)?;
	validate_exchange(config)?;
	validate_shadow(config)?;

	Ok(())
}

fn validate_cluster(config: &TetherConfig) -> Result<(), ConfigError> {
	if config.cluster.namespace.trim().is_empty() {
		return Err(ConfigError::invalid_value(
			"cluster.namespace",
			"namespace cannot be empty",
		));
	}
	if config.cluster.cluster_domain.trim().is_empty() {
		return Err(ConfigError::invalid_value(
			"cluster.cluster_domain",
			"cluster_domain cannot be empty",
		));
	}
	Ok(())
}

fn validate_connect(config: &TetherConfig) -> Result<(), ConfigError> {
	let connect = &config.connect;
	if connect.socks_port == 0 {
		return Err(ConfigError::invalid_value(
			"connect.socks_port",
			"socks_port must be non-zero",
		));
	}
	for cidr in &connect.cidrs {
		validate_cidr(cidr)?;
	}
	if connect.use_global_proxy && connect.method != ConnectMethod::Socks {
		warn!("use_global_proxy only applies to the socks connect method, ignoring");
	}
	Ok(())
}

fn validate_cidr(cidr: &str) -> Result<(), ConfigError> {
	let invalid = || ConfigError::invalid_value("connect.cidrs", format!("invalid range '{cidr}'"));
	let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
	addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
	match prefix.parse::<u8>() {
		Ok(p) if p <= 32 => Ok(()),
		_ => Err(invalid()),
	}
}

fn validate_exchange(config: &TetherConfig) -> Result<(), ConfigError> {
	if config.exchange.recover_wait_secs < 5 {
		warn!(
			recover_wait_secs = config.exchange.recover_wait_secs,
			"recover_wait_secs below one poll interval, recovery will not wait for readiness"
		);
	}
	Ok(())
}

fn validate_shadow(config: &TetherConfig) -> Result<(), ConfigError> {
	let shadow = &config.shadow;
	if shadow.image.is_empty() || shadow.router_image.is_empty() {
		return Err(ConfigError::validation("shadow images cannot be empty"));
	}
	if shadow.poll_interval.is_zero() {
		return Err(ConfigError::invalid_value(
			"shadow.poll_interval_ms",
			"poll interval must be positive",
		));
	}
	if shadow.poll_interval > shadow.ready_timeout {
		return Err(ConfigError::invalid_value(
			"shadow.poll_interval_ms",
			"poll interval cannot exceed ready_timeout_secs",
		));
	}
	Ok(())
}
