// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use tether_config::ConfigError;
use tether_k8s::K8sError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
	#[error("cluster error: {0}")]
	K8s(#[from] K8sError),

	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("annotation {key} on {object} is unusable: {reason}")]
	Annotation {
		object: String,
		key: String,
		reason: String,
	},

	#[error("session state is missing {0}")]
	MissingField(&'static str),

	#[error("pod {name} did not become ready within {timeout_secs}s")]
	NotReady { name: String, timeout_secs: u64 },

	#[error("pod {name} failed to start: phase {phase}")]
	PodFailed { name: String, phase: String },

	#[error("gave up updating reference count of {name} after {attempts} conflicts")]
	RefCountExhausted { name: String, attempts: usize },

	#[error("invalid key: {0}")]
	Key(String),

	#[error("invalid argument: {0}")]
	InvalidArgument(String),

	#[error("command `{command}` failed: {message}")]
	Command { command: String, message: String },

	#[error("dns error: {0}")]
	Dns(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl SessionError {
	pub fn annotation(
		object: impl Into<String>,
		key: impl Into<String>,
		reason: impl Into<String>,
	) -> Self {
		Self::Annotation {
			object: object.into(),
			key: key.into(),
			reason: reason.into(),
		}
	}

	/// Whether the error means the addressed cluster object does not exist.
	pub fn is_not_found(&self) -> bool {
		matches!(self, SessionError::K8s(e) if e.is_not_found())
	}
}
