// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use thiserror::Error;

/// Result type alias for K8s operations.
pub type K8sResult<T> = Result<T, K8sError>;

/// Errors that can occur during K8s operations.
#[derive(Error, Debug)]
pub enum K8sError {
	#[error("K8s API error: {message}")]
	ApiError { message: String },

	#[error("Pod not found: {name}")]
	PodNotFound { name: String },

	#[error("Service not found: {name}")]
	ServiceNotFound { name: String },

	#[error("Deployment not found: {name}")]
	DeploymentNotFound { name: String },

	#[error("ConfigMap not found: {name}")]
	ConfigMapNotFound { name: String },

	/// Object already exists (HTTP 409 on create).
	#[error("Object already exists: {name}")]
	AlreadyExists { name: String },

	/// Resource version mismatch (HTTP 409 on replace).
	#[error("Conflicting update on {name}")]
	Conflict { name: String },

	#[error("Exec error: {message}")]
	ExecError { message: String },

	#[error("Failed to build K8s client: {message}")]
	ClientInit { message: String },
}

impl K8sError {
	/// True for any of the typed not-found variants.
	pub fn is_not_found(&self) -> bool {
		matches!(
			self,
			K8sError::PodNotFound { .. }
				| K8sError::ServiceNotFound { .. }
				| K8sError::DeploymentNotFound { .. }
				| K8sError::ConfigMapNotFound { .. }
		)
	}

	pub fn is_conflict(&self) -> bool {
		matches!(self, K8sError::Conflict { .. })
	}
}

impl From<kube::Error> for K8sError {
	fn from(err: kube::Error) -> Self {
		K8sError::ApiError {
			message: err.to_string(),
		}
	}
}
