// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Typed codecs for the configuration tether stores in object annotations.
//!
//! Decoding never guesses: a missing or unparsable annotation is a
//! [`SessionError::Annotation`] naming the object and key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tether_k8s::ObjectMeta;

use crate::error::{Result, SessionError};
use crate::names::{ORIGINAL_SELECTOR_ANNOTATION, REF_COUNT_ANNOTATION, ROUTER_CONFIG_ANNOTATION};

fn object_name(meta: &ObjectMeta) -> String {
	meta.name.clone().unwrap_or_else(|| "<unnamed>".to_string())
}

fn raw<'a>(meta: &'a ObjectMeta, key: &str) -> Result<&'a str> {
	meta
		.annotations
		.as_ref()
		.and_then(|a| a.get(key))
		.map(String::as_str)
		.ok_or_else(|| SessionError::annotation(object_name(meta), key, "annotation is missing"))
}

fn set(meta: &mut ObjectMeta, key: &str, value: String) {
	meta
		.annotations
		.get_or_insert_with(BTreeMap::new)
		.insert(key.to_string(), value);
}

/// A service's selector as it was before tether redirected it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OriginalSelector(pub BTreeMap<String, String>);

impl OriginalSelector {
	pub fn encode(&self) -> Result<String> {
		Ok(serde_json::to_string(&self.0)?)
	}

	pub fn decode(object: &str, value: &str) -> Result<Self> {
		serde_json::from_str(value)
			.map(OriginalSelector)
			.map_err(|e| SessionError::annotation(object, ORIGINAL_SELECTOR_ANNOTATION, e.to_string()))
	}

	pub fn read(meta: &ObjectMeta) -> Result<Self> {
		Self::decode(&object_name(meta), raw(meta, ORIGINAL_SELECTOR_ANNOTATION)?)
	}

	pub fn write(&self, meta: &mut ObjectMeta) -> Result<()> {
		set(meta, ORIGINAL_SELECTOR_ANNOTATION, self.encode()?);
		Ok(())
	}
}

/// Configuration a router pod carries about the service it fronts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
	pub service: String,
	#[serde(flatten)]
	pub extra: BTreeMap<String, String>,
}

impl RouterConfig {
	pub fn new(service: impl Into<String>) -> Self {
		Self {
			service: service.into(),
			extra: BTreeMap::new(),
		}
	}

	pub fn encode(&self) -> Result<String> {
		Ok(serde_json::to_string(self)?)
	}

	pub fn decode(object: &str, value: &str) -> Result<Self> {
		let config: RouterConfig = serde_json::from_str(value)
			.map_err(|e| SessionError::annotation(object, ROUTER_CONFIG_ANNOTATION, e.to_string()))?;
		if config.service.is_empty() {
			return Err(SessionError::annotation(
				object,
				ROUTER_CONFIG_ANNOTATION,
				"service name is empty",
			));
		}
		Ok(config)
	}

	pub fn read(meta: &ObjectMeta) -> Result<Self> {
		Self::decode(&object_name(meta), raw(meta, ROUTER_CONFIG_ANNOTATION)?)
	}

	pub fn write(&self, meta: &mut ObjectMeta) -> Result<()> {
		set(meta, ROUTER_CONFIG_ANNOTATION, self.encode()?);
		Ok(())
	}
}

/// Read the reference count stored on an object.
pub fn read_ref_count(meta: &ObjectMeta) -> Result<i64> {
	let value = raw(meta, REF_COUNT_ANNOTATION)?;
	value.trim().parse().map_err(|_| {
		SessionError::annotation(
			object_name(meta),
			REF_COUNT_ANNOTATION,
			format!("'{value}' is not an integer"),
		)
	})
}

pub fn write_ref_count(meta: &mut ObjectMeta, count: i64) {
	set(meta, REF_COUNT_ANNOTATION, count.to_string());
}
