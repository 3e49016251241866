// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use std::collections::BTreeMap;

pub use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
pub use k8s_openapi::api::core::v1::{
	ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EphemeralContainer,
	Namespace, Pod, PodSpec, PodStatus, PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume,
	VolumeMount,
};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

/// Captured output of a command executed inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
	pub stdout: String,
	pub stderr: String,
}

/// Render a label map as a K8s label selector (`k1=v1,k2=v2`).
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
	labels
		.iter()
		.map(|(k, v)| format!("{k}={v}"))
		.collect::<Vec<_>>()
		.join(",")
}

/// Parse a label selector of the `k1=v1,k2=v2` form back into a map.
///
/// Only equality terms are understood; anything else is ignored.
pub fn parse_label_selector(selector: &str) -> BTreeMap<String, String> {
	selector
		.split(',')
		.filter_map(|term| {
			let (k, v) = term.split_once('=')?;
			let k = k.trim();
			if k.is_empty() {
				return None;
			}
			Some((k.to_string(), v.trim().to_string()))
		})
		.collect()
}

/// Phase of a pod, `Unknown` when no status has been reported.
pub fn pod_phase(pod: &Pod) -> &str {
	pod
		.status
		.as_ref()
		.and_then(|s| s.phase.as_deref())
		.unwrap_or("Unknown")
}

/// Pod IP from status, if assigned.
pub fn pod_ip(pod: &Pod) -> Option<&str> {
	pod.status.as_ref().and_then(|s| s.pod_ip.as_deref())
}

/// Whether every container in the pod reports ready.
pub fn pod_is_ready(pod: &Pod) -> bool {
	if pod_phase(pod) != "Running" {
		return false;
	}
	pod
		.status
		.as_ref()
		.and_then(|s| s.container_statuses.as_ref())
		.map(|statuses| statuses.iter().all(|c| c.ready))
		.unwrap_or(true)
}
