// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Layered configuration for tether.
//!
//! Precedence, lowest to highest: built-in defaults, the user TOML file,
//! `TETHER_*` environment variables, then command-line overrides.

mod error;
mod layer;
mod paths;
mod registry;
mod runtime;
mod sources;
mod validation;

pub use error::ConfigError;
pub use layer::*;
pub use paths::{resolve_paths, PathsConfig};
pub use registry::ConfigRegistry;
pub use runtime::*;
pub use sources::{
	CliOverrides, CliSource, ConfigSource, DefaultsSource, EnvSource, FileSource, Precedence,
};
pub use validation::validate_config;

/// Load configuration from the standard sources plus CLI overrides.
pub fn load_config_with_cli(overrides: CliOverrides) -> Result<TetherConfig, ConfigError> {
	let paths = match overrides.home.clone() {
		Some(home) => {
			let mut paths = resolve_paths()?;
			paths.home_dir = home;
			paths
		}
		None => resolve_paths()?,
	};

	let mut registry = ConfigRegistry::new();
	registry.register(Box::new(DefaultsSource));
	match overrides.config_file.clone() {
		Some(path) => registry.register(Box::new(FileSource::explicit(path))),
		None => registry.register(Box::new(FileSource::user(&paths))),
	}
	registry.register(Box::new(EnvSource::new()));
	registry.register(Box::new(CliSource::new(overrides)));

	registry.load(paths)
}
