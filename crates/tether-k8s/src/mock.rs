// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! In-memory K8s client for tests.
//!
//! Objects are stored per `(namespace, name)` and stamped with a monotonically
//! increasing `resourceVersion`, so replace calls see the same optimistic
//! concurrency behaviour as the real API server.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{ConfigMap, EphemeralContainer, Pod, PodSpec, PodStatus, Service};

use crate::client::K8sClient;
use crate::error::K8sError;
use crate::types::{parse_label_selector, ExecOutput};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
	(namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct MockState {
	next_version: u64,
	next_ip: u8,
	pods: HashMap<Key, Pod>,
	services: HashMap<Key, Service>,
	deployments: HashMap<Key, Deployment>,
	config_maps: HashMap<Key, ConfigMap>,
	new_pod_phase: Option<String>,
	ready_after_scale: bool,
	pending_conflicts: u32,
	exec_failures: HashSet<String>,
	exec_output: ExecOutput,
	ephemeral_failures: HashSet<String>,
	ephemeral_add_failures: HashSet<String>,
	created_pods: Vec<String>,
	deleted_pods: Vec<String>,
	deleted_services: Vec<String>,
	deleted_config_maps: Vec<String>,
	scale_calls: Vec<(String, i32)>,
	exec_calls: Vec<(String, Vec<String>)>,
	ephemeral_removals: Vec<(String, String)>,
	replace_attempts: u32,
}

impl MockState {
	fn bump(&mut self) -> String {
		self.next_version += 1;
		self.next_version.to_string()
	}
}

/// A mock K8s client backed by in-memory maps.
#[derive(Clone)]
pub struct MockK8sClient {
	state: Arc<Mutex<MockState>>,
}

impl Default for MockK8sClient {
	fn default() -> Self {
		Self::new()
	}
}

impl MockK8sClient {
	/// Create an empty mock where newly created pods start out `Running`.
	pub fn new() -> Self {
		let state = MockState {
			new_pod_phase: Some("Running".to_string()),
			ready_after_scale: true,
			..Default::default()
		};
		Self {
			state: Arc::new(Mutex::new(state)),
		}
	}

	/// Phase assigned to pods created through `create_pod`.
	pub fn set_new_pod_phase(&self, phase: &str) {
		self.state.lock().unwrap().new_pod_phase = Some(phase.to_string());
	}

	/// Whether `scale_deployment` immediately reports the new replicas as ready.
	pub fn set_ready_after_scale(&self, ready: bool) {
		self.state.lock().unwrap().ready_after_scale = ready;
	}

	/// Make the next `count` pod/service replace calls fail with `Conflict`.
	pub fn inject_conflicts(&self, count: u32) {
		self.state.lock().unwrap().pending_conflicts = count;
	}

	/// Make exec calls against `pod` fail.
	pub fn fail_exec_in(&self, pod: &str) {
		self.state.lock().unwrap().exec_failures.insert(pod.to_string());
	}

	/// Output returned by successful exec calls.
	pub fn set_exec_output(&self, stdout: &str, stderr: &str) {
		self.state.lock().unwrap().exec_output = ExecOutput {
			stdout: stdout.to_string(),
			stderr: stderr.to_string(),
		};
	}

	/// Make ephemeral container removal fail for `pod`.
	pub fn fail_ephemeral_removal_in(&self, pod: &str) {
		self
			.state
			.lock()
			.unwrap()
			.ephemeral_failures
			.insert(pod.to_string());
	}

	/// Make ephemeral container injection fail for `pod`.
	pub fn fail_ephemeral_add_in(&self, pod: &str) {
		self
			.state
			.lock()
			.unwrap()
			.ephemeral_add_failures
			.insert(pod.to_string());
	}

	/// Seed a pod directly, bypassing `create_pod` bookkeeping.
	pub fn insert_pod(&self, namespace: &str, mut pod: Pod) {
		let mut state = self.state.lock().unwrap();
		let name = pod.metadata.name.clone().unwrap_or_default();
		pod.metadata.namespace = Some(namespace.to_string());
		pod.metadata.resource_version = Some(state.bump());
		state.pods.insert(key(namespace, &name), pod);
	}

	pub fn insert_service(&self, namespace: &str, mut service: Service) {
		let mut state = self.state.lock().unwrap();
		let name = service.metadata.name.clone().unwrap_or_default();
		service.metadata.namespace = Some(namespace.to_string());
		service.metadata.resource_version = Some(state.bump());
		state.services.insert(key(namespace, &name), service);
	}

	pub fn insert_deployment(&self, namespace: &str, mut deployment: Deployment) {
		let mut state = self.state.lock().unwrap();
		let name = deployment.metadata.name.clone().unwrap_or_default();
		deployment.metadata.namespace = Some(namespace.to_string());
		deployment.metadata.resource_version = Some(state.bump());
		state.deployments.insert(key(namespace, &name), deployment);
	}

	pub fn insert_config_map(&self, namespace: &str, mut config_map: ConfigMap) {
		let mut state = self.state.lock().unwrap();
		let name = config_map.metadata.name.clone().unwrap_or_default();
		config_map.metadata.namespace = Some(namespace.to_string());
		config_map.metadata.resource_version = Some(state.bump());
		state.config_maps.insert(key(namespace, &name), config_map);
	}

	pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
		self.state.lock().unwrap().pods.get(&key(namespace, name)).cloned()
	}

	pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
		self
			.state
			.lock()
			.unwrap()
			.services
			.get(&key(namespace, name))
			.cloned()
	}

	pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
		self
			.state
			.lock()
			.unwrap()
			.config_maps
			.get(&key(namespace, name))
			.cloned()
	}

	pub fn config_map_names(&self, namespace: &str) -> Vec<String> {
		let state = self.state.lock().unwrap();
		let mut names: Vec<String> = state
			.config_maps
			.keys()
			.filter(|(ns, _)| ns == namespace)
			.map(|(_, name)| name.clone())
			.collect();
		names.sort();
		names
	}

	pub fn created_pods(&self) -> Vec<String> {
		self.state.lock().unwrap().created_pods.clone()
	}

	pub fn deleted_pods(&self) -> Vec<String> {
		self.state.lock().unwrap().deleted_pods.clone()
	}

	pub fn deleted_services(&self) -> Vec<String> {
		self.state.lock().unwrap().deleted_services.clone()
	}

	pub fn deleted_config_maps(&self) -> Vec<String> {
		self.state.lock().unwrap().deleted_config_maps.clone()
	}

	pub fn scale_calls(&self) -> Vec<(String, i32)> {
		self.state.lock().unwrap().scale_calls.clone()
	}

	pub fn exec_calls(&self) -> Vec<(String, Vec<String>)> {
		self.state.lock().unwrap().exec_calls.clone()
	}

	pub fn ephemeral_removals(&self) -> Vec<(String, String)> {
		self.state.lock().unwrap().ephemeral_removals.clone()
	}

	/// Number of replace calls seen, including the ones rejected as conflicts.
	pub fn replace_attempts(&self) -> u32 {
		self.state.lock().unwrap().replace_attempts
	}
}

fn labels_match(labels: Option<&BTreeMap<String, String>>, selector: &BTreeMap<String, String>) -> bool {
	selector
		.iter()
		.all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

fn check_version(
	stored: Option<&String>,
	incoming: Option<&String>,
	name: &str,
) -> Result<(), K8sError> {
	match incoming {
		Some(version) if Some(version) != stored => Err(K8sError::Conflict { name: name.into() }),
		_ => Ok(()),
	}
}

#[async_trait]
impl K8sClient for MockK8sClient {
	async fn get_pod(&self, name: &str, namespace: &str) -> Result<Pod, K8sError> {
		tokio::task::yield_now().await;
		self
			.pod(namespace, name)
			.ok_or_else(|| K8sError::PodNotFound { name: name.into() })
	}

	async fn create_pod(&self, namespace: &str, mut pod: Pod) -> Result<Pod, K8sError> {
		tokio::task::yield_now().await;
		let mut state = self.state.lock().unwrap();
		let name = pod.metadata.name.clone().unwrap_or_default();
		if state.pods.contains_key(&key(namespace, &name)) {
			return Err(K8sError::AlreadyExists { name });
		}
		state.next_ip = state.next_ip.wrapping_add(1);
		pod.metadata.namespace = Some(namespace.to_string());
		pod.metadata.resource_version = Some(state.bump());
		pod.status = Some(PodStatus {
			phase: state.new_pod_phase.clone(),
			pod_ip: Some(format!("10.0.0.{}", state.next_ip)),
			..Default::default()
		});
		state.created_pods.push(name.clone());
		state.pods.insert(key(namespace, &name), pod.clone());
		Ok(pod)
	}

	async fn replace_pod(&self, namespace: &str, mut pod: Pod) -> Result<Pod, K8sError> {
		tokio::task::yield_now().await;
		let mut state = self.state.lock().unwrap();
		state.replace_attempts += 1;
		let name = pod.metadata.name.clone().unwrap_or_default();
		if state.pending_conflicts > 0 {
			state.pending_conflicts -= 1;
			return Err(K8sError::Conflict { name });
		}
		let stored = state
			.pods
			.get(&key(namespace, &name))
			.ok_or_else(|| K8sError::PodNotFound { name: name.clone() })?;
		check_version(
			stored.metadata.resource_version.as_ref(),
			pod.metadata.resource_version.as_ref(),
			&name,
		)?;
		if pod.status.is_none() {
			pod.status = stored.status.clone();
		}
		pod.metadata.resource_version = Some(state.bump());
		state.pods.insert(key(namespace, &name), pod.clone());
		Ok(pod)
	}

	async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), K8sError> {
		tokio::task::yield_now().await;
		let mut state = self.state.lock().unwrap();
		state
			.pods
			.remove(&key(namespace, name))
			.ok_or_else(|| K8sError::PodNotFound { name: name.into() })?;
		state.deleted_pods.push(name.to_string());
		Ok(())
	}

	async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, K8sError> {
		tokio::task::yield_now().await;
		let selector = parse_label_selector(label_selector);
		let state = self.state.lock().unwrap();
		let mut pods: Vec<Pod> = state
			.pods
			.iter()
			.filter(|((ns, _), pod)| ns == namespace && labels_match(pod.metadata.labels.as_ref(), &selector))
			.map(|(_, pod)| pod.clone())
			.collect();
		pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
		Ok(pods)
	}

	async fn add_ephemeral_container(
		&self,
		name: &str,
		namespace: &str,
		container: EphemeralContainer,
	) -> Result<(), K8sError> {
		tokio::task::yield_now().await;
		let mut state = self.state.lock().unwrap();
		if state.ephemeral_add_failures.contains(name) {
			return Err(K8sError::ApiError {
				message: format!("pods \"{name}\" is forbidden: ephemeral containers are disabled"),
			});
		}
		let pod = state
			.pods
			.get_mut(&key(namespace, name))
			.ok_or_else(|| K8sError::PodNotFound { name: name.into() })?;
		let spec = pod.spec.get_or_insert_with(PodSpec::default);
		spec
			.ephemeral_containers
			.get_or_insert_with(Vec::new)
			.push(container);
		Ok(())
	}

	async fn remove_ephemeral_container(
		&self,
		container: &str,
		name: &str,
		namespace: &str,
	) -> Result<(), K8sError> {
		tokio::task::yield_now().await;
		let mut state = self.state.lock().unwrap();
		state
			.ephemeral_removals
			.push((container.to_string(), name.to_string()));
		if state.ephemeral_failures.contains(name) {
			return Err(K8sError::ExecError {
				message: format!("container {container} not running"),
			});
		}
		if !state.pods.contains_key(&key(namespace, name)) {
			return Err(K8sError::PodNotFound { name: name.into() });
		}
		Ok(())
	}

	async fn exec_in_pod(
		&self,
		_container: &str,
		name: &str,
		namespace: &str,
		command: &[String],
	) -> Result<ExecOutput, K8sError> {
		tokio::task::yield_now().await;
		let mut state = self.state.lock().unwrap();
		state.exec_calls.push((name.to_string(), command.to_vec()));
		if !state.pods.contains_key(&key(namespace, name)) {
			return Err(K8sError::PodNotFound { name: name.into() });
		}
		if state.exec_failures.contains(name) {
			return Err(K8sError::ExecError {
				message: "command terminated with exit code 1".to_string(),
			});
		}
		Ok(state.exec_output.clone())
	}

	async fn get_service(&self, name: &str, namespace: &str) -> Result<Service, K8sError> {
		tokio::task::yield_now().await;
		self
			.service(namespace, name)
			.ok_or_else(|| K8sError::ServiceNotFound { name: name.into() })
	}

	async fn create_service(&self, namespace: &str, mut service: Service) -> Result<Service, K8sError> {
		tokio::task::yield_now().await;
		let mut state = self.state.lock().unwrap();
		let name = service.metadata.name.clone().unwrap_or_default();
		if state.services.contains_key(&key(namespace, &name)) {
			return Err(K8sError::AlreadyExists { name });
		}
		service.metadata.namespace = Some(namespace.to_string());
		service.metadata.resource_version = Some(state.bump());
		state.services.insert(key(namespace, &name), service.clone());
		Ok(service)
	}

	async fn replace_service(
		&self,
		namespace: &str,
		mut service: Service,
	) -> Result<Service, K8sError> {
		tokio::task::yield_now().await;
		let mut state = self.state.lock().unwrap();
		state.replace_attempts += 1;
		let name = service.metadata.name.clone().unwrap_or_default();
		if state.pending_conflicts > 0 {
			state.pending_conflicts -= 1;
			return Err(K8sError::Conflict { name });
		}
		let stored = state
			.services
			.get(&key(namespace, &name))
			.ok_or_else(|| K8sError::ServiceNotFound { name: name.clone() })?;
		check_version(
			stored.metadata.resource_version.as_ref(),
			service.metadata.resource_version.as_ref(),
			&name,
		)?;
		service.metadata.resource_version = Some(state.bump());
		state.services.insert(key(namespace, &name), service.clone());
		Ok(service)
	}

	async fn delete_service(&self, name: &str, namespace: &str) -> Result<(), K8sError> {
		tokio::task::yield_now().await;
		let mut state = self.state.lock().unwrap();
		state
			.services
			.remove(&key(namespace, name))
			.ok_or_else(|| K8sError::ServiceNotFound { name: name.into() })?;
		state.deleted_services.push(name.to_string());
		Ok(())
	}

	async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, K8sError> {
		tokio::task::yield_now().await;
		let state = self.state.lock().unwrap();
		let mut services: Vec<Service> = state
			.services
			.iter()
			.filter(|((ns, _), _)| ns == namespace)
			.map(|(_, svc)| svc.clone())
			.collect();
		services.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
		Ok(services)
	}

	async fn get_deployment(&self, name: &str, namespace: &str) -> Result<Deployment, K8sError> {
		tokio::task::yield_now().await;
		self
			.state
			.lock()
			.unwrap()
			.deployments
			.get(&key(namespace, name))
			.cloned()
			.ok_or_else(|| K8sError::DeploymentNotFound { name: name.into() })
	}

	async fn scale_deployment(
		&self,
		name: &str,
		namespace: &str,
		replicas: i32,
	) -> Result<(), K8sError> {
		tokio::task::yield_now().await;
		let mut state = self.state.lock().unwrap();
		state.scale_calls.push((name.to_string(), replicas));
		let ready = state.ready_after_scale;
		let version = state.bump();
		let deployment = state
			.deployments
			.get_mut(&key(namespace, name))
			.ok_or_else(|| K8sError::DeploymentNotFound { name: name.into() })?;
		deployment.metadata.resource_version = Some(version);
		deployment.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
		if ready {
			deployment
				.status
				.get_or_insert_with(DeploymentStatus::default)
				.ready_replicas = Some(replicas);
		}
		Ok(())
	}

	async fn get_config_map(&self, name: &str, namespace: &str) -> Result<ConfigMap, K8sError> {
		tokio::task::yield_now().await;
		self
			.config_map(namespace, name)
			.ok_or_else(|| K8sError::ConfigMapNotFound { name: name.into() })
	}

	async fn create_config_map(
		&self,
		namespace: &str,
		mut config_map: ConfigMap,
	) -> Result<ConfigMap, K8sError> {
		tokio::task::yield_now().await;
		let mut state = self.state.lock().unwrap();
		let name = config_map.metadata.name.clone().unwrap_or_default();
		if state.config_maps.contains_key(&key(namespace, &name)) {
			return Err(K8sError::AlreadyExists { name });
		}
		config_map.metadata.namespace = Some(namespace.to_string());
		config_map.metadata.resource_version = Some(state.bump());
		state.config_maps.insert(key(namespace, &name), config_map.clone());
		Ok(config_map)
	}

	async fn delete_config_map(&self, name: &str, namespace: &str) -> Result<(), K8sError> {
		tokio::task::yield_now().await;
		let mut state = self.state.lock().unwrap();
		state
			.config_maps
			.remove(&key(namespace, name))
			.ok_or_else(|| K8sError::ConfigMapNotFound { name: name.into() })?;
		state.deleted_config_maps.push(name.to_string());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

	fn named_pod(name: &str, labels: &[(&str, &str)]) -> Pod {
		Pod {
			metadata: ObjectMeta {
				name: Some(name.to_string()),
				labels: Some(
					labels
						.iter()
						.map(|(k, v)| (k.to_string(), v.to_string()))
						.collect(),
				),
				..Default::default()
			},
			..Default::default()
		}
	}

	#[tokio::test]
	async fn create_twice_reports_already_exists() {
		let mock = MockK8sClient::new();
		mock.create_pod("ns", named_pod("a", &[])).await.unwrap();
		let err = mock.create_pod("ns", named_pod("a", &[])).await.unwrap_err();
		assert!(matches!(err, K8sError::AlreadyExists { .. }));
	}

	#[tokio::test]
	async fn stale_replace_is_a_conflict() {
		let mock = MockK8sClient::new();
		let created = mock.create_pod("ns", named_pod("a", &[])).await.unwrap();

		let mut first = created.clone();
		first.metadata.labels = Some(BTreeMap::from([("x".to_string(), "1".to_string())]));
		mock.replace_pod("ns", first).await.unwrap();

		let err = mock.replace_pod("ns", created).await.unwrap_err();
		assert!(err.is_conflict());
	}

	#[tokio::test]
	async fn list_pods_filters_by_selector_and_namespace() {
		let mock = MockK8sClient::new();
		mock.insert_pod("ns", named_pod("web-1", &[("app", "web")]));
		mock.insert_pod("ns", named_pod("db-1", &[("app", "db")]));
		mock.insert_pod("other", named_pod("web-2", &[("app", "web")]));

		let pods = mock.list_pods("ns", "app=web").await.unwrap();
		assert_eq!(pods.len(), 1);
		assert_eq!(pods[0].metadata.name.as_deref(), Some("web-1"));
	}

	#[tokio::test]
	async fn injected_conflicts_are_consumed() {
		let mock = MockK8sClient::new();
		let created = mock.create_pod("ns", named_pod("a", &[])).await.unwrap();
		mock.inject_conflicts(1);

		assert!(mock.replace_pod("ns", created.clone()).await.is_err());
		assert!(mock.replace_pod("ns", created).await.is_ok());
		assert_eq!(mock.replace_attempts(), 2);
	}
}
