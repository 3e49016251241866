// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use async_trait::async_trait;

use crate::error::K8sError;
use crate::types::{ConfigMap, Deployment, EphemeralContainer, ExecOutput, Pod, Service};

/// Trait for the K8s object store operations a tether session needs.
///
/// This abstraction allows for easy mocking in tests while providing
/// a clean interface over pods, services, deployments and config maps.
#[async_trait]
pub trait K8sClient: Send + Sync {
	/// Get a specific pod by name from the specified namespace.
	async fn get_pod(&self, name: &str, namespace: &str) -> Result<Pod, K8sError>;

	/// Create a new pod. Fails with `AlreadyExists` if the name is taken.
	async fn create_pod(&self, namespace: &str, pod: Pod) -> Result<Pod, K8sError>;

	/// Replace a pod, guarded by the `resourceVersion` carried in its metadata.
	///
	/// Returns `Conflict` when the stored version has moved on.
	async fn replace_pod(&self, namespace: &str, pod: Pod) -> Result<Pod, K8sError>;

	/// Delete a pod by name from the specified namespace.
	async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), K8sError>;

	/// List pods in a namespace matching the given label selector.
	async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, K8sError>;

	/// Inject an ephemeral container into a running pod.
	async fn add_ephemeral_container(
		&self,
		name: &str,
		namespace: &str,
		container: EphemeralContainer,
	) -> Result<(), K8sError>;

	/// Stop an ephemeral container previously injected into a pod.
	///
	/// K8s does not allow removing ephemeral containers from the pod spec, so
	/// this terminates the container's main process instead.
	async fn remove_ephemeral_container(
		&self,
		container: &str,
		name: &str,
		namespace: &str,
	) -> Result<(), K8sError>;

	/// Run a command in a container and capture its output.
	async fn exec_in_pod(
		&self,
		container: &str,
		name: &str,
		namespace: &str,
		command: &[String],
	) -> Result<ExecOutput, K8sError>;

	async fn get_service(&self, name: &str, namespace: &str) -> Result<Service, K8sError>;

	async fn create_service(&self, namespace: &str, service: Service) -> Result<Service, K8sError>;

	/// Replace a service, guarded by its `resourceVersion`.
	async fn replace_service(&self, namespace: &str, service: Service)
		-> Result<Service, K8sError>;

	async fn delete_service(&self, name: &str, namespace: &str) -> Result<(), K8sError>;

	async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, K8sError>;

	async fn get_deployment(&self, name: &str, namespace: &str) -> Result<Deployment, K8sError>;

	/// Set the replica count of a deployment through its scale subresource.
	async fn scale_deployment(
		&self,
		name: &str,
		namespace: &str,
		replicas: i32,
	) -> Result<(), K8sError>;

	async fn get_config_map(&self, name: &str, namespace: &str) -> Result<ConfigMap, K8sError>;

	async fn create_config_map(
		&self,
		namespace: &str,
		config_map: ConfigMap,
	) -> Result<ConfigMap, K8sError>;

	async fn delete_config_map(&self, name: &str, namespace: &str) -> Result<(), K8sError>;
}
