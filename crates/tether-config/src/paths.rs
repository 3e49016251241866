// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Path resolution for the tether home and config file.

use std::path::PathBuf;

use crate::ConfigError;

/// Resolved paths for tether.
#[derive(Debug, Clone)]
pub struct PathsConfig {
	/// User config file: ~/.config/tether/config.toml
	pub user_config_file: PathBuf,
	/// Session home: $TETHER_HOME or ~/.tether
	pub home_dir: PathBuf,
}

impl PathsConfig {
	/// Build paths rooted at an explicit home directory (used by tests and `--home`).
	pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
		let home_dir = home_dir.into();
		Self {
			user_config_file: home_dir.join("config.toml"),
			home_dir,
		}
	}

	/// Directory holding locally stored private keys.
	pub fn key_dir(&self) -> PathBuf {
		self.home_dir.join("key")
	}
}

impl Default for PathsConfig {
	fn default() -> Self {
		Self {
			user_config_file: PathBuf::from("~/.config/tether/config.toml"),
			home_dir: PathBuf::from("~/.tether"),
		}
	}
}

/// Resolve the config file and session home.
///
/// - XDG_CONFIG_HOME or ~/.config for the config file
/// - TETHER_HOME or ~/.tether for session state
pub fn resolve_paths() -> Result<PathsConfig, ConfigError> {
	let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;

	let config_home = std::env::var_os("XDG_CONFIG_HOME")
		.map(PathBuf::from)
		.unwrap_or_else(|| home.join(".config"));

	let home_dir = std::env::var_os("TETHER_HOME")
		.map(PathBuf::from)
		.unwrap_or_else(|| home.join(".tether"));

	tracing::debug!(
			config_home = %config_home.display(),
			home_dir = %home_dir.display(),
			"resolved tether paths"
	);

	Ok(PathsConfig {
		user_config_file: config_home.join("tether/config.toml"),
		home_dir,
	})
}
