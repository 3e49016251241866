// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Well-known labels, annotation keys and object names.

use std::collections::BTreeMap;

use rand::distributions::Alphanumeric;
use rand::Rng;

pub const CONTROL_BY_LABEL: &str = "tether.dev/control-by";
pub const CONTROL_BY_VALUE: &str = "tether";
pub const ROLE_LABEL: &str = "tether.dev/role";
pub const ROUTER_FOR_LABEL: &str = "tether.dev/router-for";

pub const ROLE_CONNECT_SHADOW: &str = "connect-shadow";
pub const ROLE_EXCHANGE_SHADOW: &str = "exchange-shadow";
pub const ROLE_MESH_SHADOW: &str = "mesh-shadow";
pub const ROLE_ROUTER: &str = "router";

pub const REF_COUNT_ANNOTATION: &str = "tether.dev/ref-count";
pub const ORIGINAL_SELECTOR_ANNOTATION: &str = "tether.dev/original-selector";
pub const ROUTER_CONFIG_ANNOTATION: &str = "tether.dev/router-config";
pub const KEY_STORE_ANNOTATION: &str = "tether.dev/key-store";

pub const SHARED_SHADOW_NAME: &str = "tether-shadow-daemon";
pub const SHADOW_NAME_PREFIX: &str = "tether-shadow-";
pub const SHADOW_CONTAINER: &str = "shadow";
pub const ROUTER_CONTAINER: &str = "router";
pub const EXCHANGE_CONTAINER: &str = "tether-exchange";
pub const ROUTER_BIN: &str = "/usr/sbin/router";

pub const ROUTER_SUFFIX: &str = "-router";
pub const ORIGIN_SUFFIX: &str = "-origin";
pub const DEFAULT_VERSION_KEY: &str = "tether-version";

pub const ENV_LOCAL_DOMAINS: &str = "LOCAL_DOMAINS";
pub const ENV_DNS_PROTOCOL: &str = "DNS_PROTOCOL";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const ENV_ROUTER_SERVICE: &str = "ROUTER_SERVICE";
pub const ENV_ROUTER_PORTS: &str = "ROUTER_PORTS";
pub const ENV_ROUTER_HEADER: &str = "ROUTER_HEADER";

/// Random lowercase alphanumeric suffix for exclusive object names.
pub fn random_suffix(len: usize) -> String {
	rand::thread_rng()
		.sample_iter(&Alphanumeric)
		.take(len)
		.map(|b| char::from(b).to_ascii_lowercase())
		.collect()
}

/// Name of the shadow pod for a connect session.
pub fn connect_shadow_name(shared: bool) -> String {
	if shared {
		SHARED_SHADOW_NAME.to_string()
	} else {
		format!("{SHADOW_NAME_PREFIX}{}", random_suffix(5))
	}
}

pub fn router_name(service: &str) -> String {
	format!("{service}{ROUTER_SUFFIX}")
}

pub fn origin_service_name(service: &str) -> String {
	format!("{service}{ORIGIN_SUFFIX}")
}

/// Service and shadow name for one mesh version of `service`.
pub fn mesh_object_name(service: &str, version: &str) -> String {
	format!("{service}-tether-{version}")
}

/// Labels every object created by tether carries.
pub fn role_labels(role: &str) -> BTreeMap<String, String> {
	BTreeMap::from([
		(CONTROL_BY_LABEL.to_string(), CONTROL_BY_VALUE.to_string()),
		(ROLE_LABEL.to_string(), role.to_string()),
	])
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn random_suffix_is_lowercase_alphanumeric() {
		let suffix = random_suffix(5);
		assert_eq!(suffix.len(), 5);
		assert!(suffix
			.chars()
			.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
	}

	#[test]
	fn connect_shadow_names() {
		assert_eq!(connect_shadow_name(true), "tether-shadow-daemon");
		let exclusive = connect_shadow_name(false);
		assert!(exclusive.starts_with("tether-shadow-"));
		assert_eq!(exclusive.len(), "tether-shadow-".len() + 5);
	}

	#[test]
	fn mesh_names() {
		assert_eq!(router_name("web"), "web-router");
		assert_eq!(origin_service_name("web"), "web-origin");
		assert_eq!(mesh_object_name("web", "v1"), "web-tether-v1");
	}
}
