// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, EphemeralContainer, Pod, Service};
use kube::{
	api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams},
	Client,
};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, instrument};

use crate::client::K8sClient;
use crate::error::K8sError;
use crate::types::ExecOutput;

/// Production K8s client implementation using the kube crate.
pub struct KubeClient {
	client: Client,
}

impl KubeClient {
	/// Create a new KubeClient that auto-discovers cluster configuration.
	///
	/// This will attempt to load config from:
	/// 1. In-cluster service account (when running in K8s)
	/// 2. KUBECONFIG environment variable
	/// 3. ~/.kube/config
	pub async fn new() -> Result<Self, K8sError> {
		let client = Client::try_default()
			.await
			.map_err(|e| K8sError::ClientInit {
				message: e.to_string(),
			})?;
		debug!("K8s client initialized");
		Ok(Self { client })
	}

	fn pods(&self, namespace: &str) -> Api<Pod> {
		Api::namespaced(self.client.clone(), namespace)
	}

	fn services(&self, namespace: &str) -> Api<Service> {
		Api::namespaced(self.client.clone(), namespace)
	}
}

/// Map a 404 to the supplied typed error and everything else to `ApiError`.
fn not_found_or(err: kube::Error, not_found: impl FnOnce() -> K8sError) -> K8sError {
	match err {
		kube::Error::Api(ref resp) if resp.code == 404 => not_found(),
		e => e.into(),
	}
}

fn create_error(err: kube::Error, name: &str) -> K8sError {
	match err {
		kube::Error::Api(ref resp) if resp.code == 409 => K8sError::AlreadyExists { name: name.into() },
		e => e.into(),
	}
}

fn replace_error(err: kube::Error, name: &str, not_found: impl FnOnce() -> K8sError) -> K8sError {
	match err {
		kube::Error::Api(ref resp) if resp.code == 409 => K8sError::Conflict { name: name.into() },
		kube::Error::Api(ref resp) if resp.code == 404 => not_found(),
		e => e.into(),
	}
}

async fn read_all(reader: Option<impl AsyncRead + Unpin>) -> Result<String, K8sError> {
	let mut out = String::new();
	if let Some(mut reader) = reader {
		reader
			.read_to_string(&mut out)
			.await
			.map_err(|e| K8sError::ExecError {
				message: e.to_string(),
			})?;
	}
	Ok(out)
}

#[async_trait]
impl K8sClient for KubeClient {
	async fn get_pod(&self, name: &str, namespace: &str) -> Result<Pod, K8sError> {
		self
			.pods(namespace)
			.get(name)
			.await
			.map_err(|e| not_found_or(e, || K8sError::PodNotFound { name: name.into() }))
	}

	async fn create_pod(&self, namespace: &str, pod: Pod) -> Result<Pod, K8sError> {
		let name = pod.metadata.name.clone().unwrap_or_default();
		self
			.pods(namespace)
			.create(&PostParams::default(), &pod)
			.await
			.map_err(|e| create_error(e, &name))
	}

	async fn replace_pod(&self, namespace: &str, pod: Pod) -> Result<Pod, K8sError> {
		let name = pod.metadata.name.clone().unwrap_or_default();
		self
			.pods(namespace)
			.replace(&name, &PostParams::default(), &pod)
			.await
			.map_err(|e| replace_error(e, &name, || K8sError::PodNotFound { name: name.clone() }))
	}

	async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), K8sError> {
		self
			.pods(namespace)
			.delete(name, &DeleteParams::default())
			.await
			.map(|_| ())
			.map_err(|e| not_found_or(e, || K8sError::PodNotFound { name: name.into() }))
	}

	async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, K8sError> {
		let lp = ListParams::default().labels(label_selector);
		let pod_list = self.pods(namespace).list(&lp).await?;
		Ok(pod_list.items)
	}

	#[instrument(skip(self, container), fields(container = %container.name))]
	async fn add_ephemeral_container(
		&self,
		name: &str,
		namespace: &str,
		container: EphemeralContainer,
	) -> Result<(), K8sError> {
		let patch = json!({
			"spec": {
				"ephemeralContainers": [container]
			}
		});
		self
			.pods(namespace)
			.patch_ephemeral_containers(name, &PatchParams::default(), &Patch::Strategic(&patch))
			.await
			.map(|_| ())
			.map_err(|e| not_found_or(e, || K8sError::PodNotFound { name: name.into() }))
	}

	async fn remove_ephemeral_container(
		&self,
		container: &str,
		name: &str,
		namespace: &str,
	) -> Result<(), K8sError> {
		let command = ["kill".to_string(), "-15".to_string(), "1".to_string()];
		self.exec_in_pod(container, name, namespace, &command).await?;
		Ok(())
	}

	#[instrument(skip(self), fields(pod = %name))]
	async fn exec_in_pod(
		&self,
		container: &str,
		name: &str,
		namespace: &str,
		command: &[String],
	) -> Result<ExecOutput, K8sError> {
		let ap = AttachParams::default()
			.container(container)
			.stdin(false)
			.stdout(true)
			.stderr(true);

		let mut attached = self
			.pods(namespace)
			.exec(name, command.to_vec(), &ap)
			.await
			.map_err(|e| match e {
				kube::Error::Api(ref err) if err.code == 404 => K8sError::PodNotFound { name: name.into() },
				_ => K8sError::ExecError {
					message: e.to_string(),
				},
			})?;

		let status = attached.take_status();
		let stdout_reader = attached.stdout();
		let stderr_reader = attached.stderr();
		let (stdout, stderr) = tokio::join!(read_all(stdout_reader), read_all(stderr_reader));
		let output = ExecOutput {
			stdout: stdout?,
			stderr: stderr?,
		};

		if let Some(status) = status {
			if let Some(status) = status.await {
				if status.status.as_deref() == Some("Failure") {
					return Err(K8sError::ExecError {
						message: status
							.message
							.unwrap_or_else(|| format!("command failed: {}", output.stderr.trim())),
					});
				}
			}
		}

		attached.join().await.map_err(|e| K8sError::ExecError {
			message: e.to_string(),
		})?;

		Ok(output)
	}

	async fn get_service(&self, name: &str, namespace: &str) -> Result<Service, K8sError> {
		self
			.services(namespace)
			.get(name)
			.await
			.map_err(|e| not_found_or(e, || K8sError::ServiceNotFound { name: name.into() }))
	}

	async fn create_service(&self, namespace: &str, service: Service) -> Result<Service, K8sError> {
		let name = service.metadata.name.clone().unwrap_or_default();
		self
			.services(namespace)
			.create(&PostParams::default(), &service)
			.await
			.map_err(|e| create_error(e, &name))
	}

	async fn replace_service(
		&self,
		namespace: &str,
		service: Service,
	) -> Result<Service, K8sError> {
		let name = service.metadata.name.clone().unwrap_or_default();
		self
			.services(namespace)
			.replace(&name, &PostParams::default(), &service)
			.await
			.map_err(|e| replace_error(e, &name, || K8sError::ServiceNotFound { name: name.clone() }))
	}

	async fn delete_service(&self, name: &str, namespace: &str) -> Result<(), K8sError> {
		self
			.services(namespace)
			.delete(name, &DeleteParams::default())
			.await
			.map(|_| ())
			.map_err(|e| not_found_or(e, || K8sError::ServiceNotFound { name: name.into() }))
	}

	async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, K8sError> {
		let list = self.services(namespace).list(&ListParams::default()).await?;
		Ok(list.items)
	}

	async fn get_deployment(&self, name: &str, namespace: &str) -> Result<Deployment, K8sError> {
		let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
		deployments
			.get(name)
			.await
			.map_err(|e| not_found_or(e, || K8sError::DeploymentNotFound { name: name.into() }))
	}

	#[instrument(skip(self))]
	async fn scale_deployment(
		&self,
		name: &str,
		namespace: &str,
		replicas: i32,
	) -> Result<(), K8sError> {
		let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
		let patch = json!({ "spec": { "replicas": replicas } });
		deployments
			.patch_scale(name, &PatchParams::default(), &Patch::Merge(&patch))
			.await
			.map(|_| ())
			.map_err(|e| not_found_or(e, || K8sError::DeploymentNotFound { name: name.into() }))
	}

	async fn get_config_map(&self, name: &str, namespace: &str) -> Result<ConfigMap, K8sError> {
		let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
		config_maps
			.get(name)
			.await
			.map_err(|e| not_found_or(e, || K8sError::ConfigMapNotFound { name: name.into() }))
	}

	async fn create_config_map(
		&self,
		namespace: &str,
		config_map: ConfigMap,
	) -> Result<ConfigMap, K8sError> {
		let name = config_map.metadata.name.clone().unwrap_or_default();
		let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
		config_maps
			.create(&PostParams::default(), &config_map)
			.await
			.map_err(|e| create_error(e, &name))
	}

	async fn delete_config_map(&self, name: &str, namespace: &str) -> Result<(), K8sError> {
		let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
		config_maps
			.delete(name, &DeleteParams::default())
			.await
			.map(|_| ())
			.map_err(|e| not_found_or(e, || K8sError::ConfigMapNotFound { name: name.into() }))
	}
}
