// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shadow pods: the cluster-side end of the bridge.
//!
//! Shared shadows use one well-known name per cluster. Concurrent sessions
//! converge on it through get-or-create: whoever loses the create race
//! attaches to the winner's pod and bumps its reference count. Exclusive
//! shadows carry a random suffix and are always deleted on detach.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_config::ShadowConfig;
use tether_k8s::{
	pod_ip, pod_is_ready, pod_phase, ConfigMapVolumeSource, Container, ContainerPort, EnvVar,
	K8sClient, K8sError, ObjectMeta, Pod, PodSpec, Volume, VolumeMount,
};
use tracing::{debug, error, info, instrument, warn};

use crate::annotations::write_ref_count;
use crate::error::{Result, SessionError};
use crate::keys::{
	key_pair_from_config_map, key_store_config_map, key_store_name, private_key_path, KeyStore,
	SshKeyPair,
};
use crate::names::{random_suffix, KEY_STORE_ANNOTATION, ROLE_LABEL, SHADOW_CONTAINER};
use crate::refcount;
use crate::state::ComponentKind;

const KEY_VOLUME: &str = "tether-keys";
const KEY_MOUNT_PATH: &str = "/etc/tether/keys";

/// What to create when no shadow with this name exists yet.
#[derive(Debug, Clone)]
pub struct ShadowSpec {
	pub name: String,
	pub namespace: String,
	pub component: ComponentKind,
	pub shared: bool,
	pub image: String,
	pub labels: BTreeMap<String, String>,
	pub annotations: BTreeMap<String, String>,
	pub env: BTreeMap<String, String>,
	pub ports: Vec<i32>,
}

/// A ready shadow pod this session is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowEndpoint {
	pub pod_name: String,
	pub ip: String,
	pub private_key_path: PathBuf,
	pub key_store: String,
}

/// A cluster object the pool took on for the caller before the shadow is
/// ready.
///
/// Claims are reported as soon as the cluster accepts them so a setup that is
/// interrupted while waiting for readiness still leaves a record to tear down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowClaim {
	/// A credential store config map was created, or adopted from the shadow.
	KeyStore(String),
	/// A credential store created for a lost create race was deleted again.
	KeyStoreDiscarded(String),
	/// The shadow pod was created, or a reference to it taken.
	Pod(String),
}

pub struct ShadowPool {
	client: Arc<dyn K8sClient>,
	keys: Arc<dyn KeyStore>,
	key_dir: PathBuf,
	ready_timeout: Duration,
	poll_interval: Duration,
}

impl ShadowPool {
	pub fn new(
		client: Arc<dyn K8sClient>,
		keys: Arc<dyn KeyStore>,
		key_dir: impl Into<PathBuf>,
		config: &ShadowConfig,
	) -> Self {
		Self {
			client,
			keys,
			key_dir: key_dir.into(),
			ready_timeout: config.ready_timeout,
			poll_interval: config.poll_interval,
		}
	}

	/// Attach to the shadow named in `spec`, creating it if it does not exist.
	pub async fn get_or_create(&self, spec: &ShadowSpec) -> Result<ShadowEndpoint> {
		self.get_or_create_recorded(spec, |_| Ok(())).await
	}

	/// [`get_or_create`](Self::get_or_create), handing every [`ShadowClaim`]
	/// to `record` the moment it exists.
	///
	/// If `record` fails the claim is rolled back and its error returned. On
	/// any error the pool has released what it claimed, so the caller can
	/// forget the claims it recorded.
	#[instrument(skip(self, spec, record), fields(pod = %spec.name, namespace = %spec.namespace))]
	pub async fn get_or_create_recorded<R>(
		&self,
		spec: &ShadowSpec,
		mut record: R,
	) -> Result<ShadowEndpoint>
	where
		R: FnMut(ShadowClaim) -> Result<()> + Send,
	{
		match self.client.get_pod(&spec.name, &spec.namespace).await {
			Ok(_) if spec.shared => self.attach(spec, &mut record).await,
			Ok(_) => Err(K8sError::AlreadyExists {
				name: spec.name.clone(),
			}
			.into()),
			Err(e) if e.is_not_found() => self.create(spec, &mut record).await,
			Err(e) => Err(e.into()),
		}
	}

	/// Detach from a shadow. Returns true when the caller must delete it.
	pub async fn release(&self, name: &str, namespace: &str, shared: bool) -> Result<bool> {
		if !shared {
			return Ok(true);
		}
		refcount::decrease_ref(self.client.as_ref(), name, namespace).await
	}

	/// Delete a shadow pod and its credential store. Already-deleted objects are fine.
	pub async fn remove(&self, name: &str, namespace: &str, key_store: Option<&str>) -> Result<()> {
		match self.client.delete_pod(name, namespace).await {
			Ok(()) => info!(pod = %name, "shadow pod deleted"),
			Err(e) if e.is_not_found() => debug!(pod = %name, "shadow pod already gone"),
			Err(e) => return Err(e.into()),
		}
		if let Some(store) = key_store {
			match self.client.delete_config_map(store, namespace).await {
				Ok(()) => info!(configmap = %store, "credential store deleted"),
				Err(e) if e.is_not_found() => debug!(configmap = %store, "credential store already gone"),
				Err(e) => return Err(e.into()),
			}
		}
		Ok(())
	}

	async fn create<R>(&self, spec: &ShadowSpec, record: &mut R) -> Result<ShadowEndpoint>
	where
		R: FnMut(ShadowClaim) -> Result<()> + Send,
	{
		let version = random_suffix(5);
		let store = key_store_name(spec.component.as_str(), &version);
		let keys = SshKeyPair::generate()?;
		let role = spec
			.labels
			.get(ROLE_LABEL)
			.map(String::as_str)
			.unwrap_or_default();

		self
			.client
			.create_config_map(&spec.namespace, key_store_config_map(&store, role, &keys)?)
			.await?;
		if let Err(e) = record(ShadowClaim::KeyStore(store.clone())) {
			self.discard_key_store(&store, &spec.namespace).await;
			return Err(e);
		}

		let pod = shadow_pod(spec, &store);
		match self.client.create_pod(&spec.namespace, pod).await {
			Ok(_) => info!(pod = %spec.name, shared = spec.shared, "shadow pod created"),
			Err(K8sError::AlreadyExists { .. }) if spec.shared => {
				debug!(pod = %spec.name, "lost create race, attaching to existing shadow");
				self.discard_key_store(&store, &spec.namespace).await;
				record(ShadowClaim::KeyStoreDiscarded(store))?;
				return self.attach(spec, record).await;
			}
			Err(e) => {
				self.discard_key_store(&store, &spec.namespace).await;
				return Err(e.into());
			}
		}

		match self.settle_created(spec, &store, &keys, record).await {
			Ok(endpoint) => Ok(endpoint),
			Err(e) => {
				self.abandon(spec, &store).await;
				Err(e)
			}
		}
	}

	async fn settle_created<R>(
		&self,
		spec: &ShadowSpec,
		store: &str,
		keys: &SshKeyPair,
		record: &mut R,
	) -> Result<ShadowEndpoint>
	where
		R: FnMut(ShadowClaim) -> Result<()> + Send,
	{
		record(ShadowClaim::Pod(spec.name.clone()))?;
		let key_path = self.store_private_key(store, keys)?;
		let ip = self.wait_until_ready(&spec.name, &spec.namespace).await?;
		Ok(ShadowEndpoint {
			pod_name: spec.name.clone(),
			ip,
			private_key_path: key_path,
			key_store: store.to_string(),
		})
	}

	async fn attach<R>(&self, spec: &ShadowSpec, record: &mut R) -> Result<ShadowEndpoint>
	where
		R: FnMut(ShadowClaim) -> Result<()> + Send,
	{
		let count = refcount::increase_ref(self.client.as_ref(), &spec.name, &spec.namespace).await?;
		info!(pod = %spec.name, count, "attached to shared shadow");

		let attached = match record(ShadowClaim::Pod(spec.name.clone())) {
			Ok(()) => self.attached_endpoint(spec, record).await,
			Err(e) => Err(e),
		};

		if attached.is_err() {
			if let Err(e) =
				refcount::decrease_ref(self.client.as_ref(), &spec.name, &spec.namespace).await
			{
				error!(pod = %spec.name, error = %e, "failed to drop reference after failed attach");
			}
		}
		attached
	}

	async fn attached_endpoint<R>(&self, spec: &ShadowSpec, record: &mut R) -> Result<ShadowEndpoint>
	where
		R: FnMut(ShadowClaim) -> Result<()> + Send,
	{
		let pod = self.client.get_pod(&spec.name, &spec.namespace).await?;
		let store = pod
			.metadata
			.annotations
			.as_ref()
			.and_then(|a| a.get(KEY_STORE_ANNOTATION))
			.cloned()
			.ok_or_else(|| {
				SessionError::annotation(&spec.name, KEY_STORE_ANNOTATION, "annotation is missing")
			})?;
		let config_map = self.client.get_config_map(&store, &spec.namespace).await?;
		let keys = key_pair_from_config_map(&config_map)?;
		record(ShadowClaim::KeyStore(store.clone()))?;
		let key_path = self.store_private_key(&store, &keys)?;
		let ip = self.wait_until_ready(&spec.name, &spec.namespace).await?;
		Ok(ShadowEndpoint {
			pod_name: spec.name.clone(),
			ip,
			private_key_path: key_path,
			key_store: store,
		})
	}

	fn store_private_key(&self, store: &str, keys: &SshKeyPair) -> Result<PathBuf> {
		let path = private_key_path(&self.key_dir, store)
			.ok_or_else(|| SessionError::Key(format!("cannot derive key path from '{store}'")))?;
		self.keys.write(&path, keys)?;
		Ok(path)
	}

	async fn discard_key_store(&self, store: &str, namespace: &str) {
		if let Err(e) = self.client.delete_config_map(store, namespace).await {
			warn!(configmap = %store, error = %e, "failed to delete unused credential store");
		}
	}

	async fn abandon(&self, spec: &ShadowSpec, store: &str) {
		let delete = match self.release(&spec.name, &spec.namespace, spec.shared).await {
			Ok(delete) => delete,
			Err(e) => {
				error!(pod = %spec.name, error = %e, "failed to release shadow that never became ready");
				false
			}
		};
		if delete {
			if let Err(e) = self.remove(&spec.name, &spec.namespace, Some(store)).await {
				error!(pod = %spec.name, error = %e, "failed to delete shadow that never became ready");
			}
		}
		if let Some(path) = private_key_path(&self.key_dir, store) {
			if path.exists() {
				if let Err(e) = self.keys.remove(&path) {
					warn!(path = %path.display(), error = %e, "failed to remove key of shadow that never became ready");
				}
			}
		}
	}

	/// Poll until the pod runs with an IP. Returns the IP.
	pub async fn wait_until_ready(&self, name: &str, namespace: &str) -> Result<String> {
		let start = Instant::now();
		loop {
			let pod = self.client.get_pod(name, namespace).await?;
			match pod_phase(&pod) {
				"Failed" | "Succeeded" => {
					return Err(SessionError::PodFailed {
						name: name.to_string(),
						phase: pod_phase(&pod).to_string(),
					})
				}
				_ => {}
			}
			if pod_is_ready(&pod) {
				if let Some(ip) = pod_ip(&pod) {
					debug!(pod = %name, ip = %ip, elapsed_ms = start.elapsed().as_millis() as u64, "shadow ready");
					return Ok(ip.to_string());
				}
			}

			if start.elapsed() >= self.ready_timeout {
				return Err(SessionError::NotReady {
					name: name.to_string(),
					timeout_secs: self.ready_timeout.as_secs(),
				});
			}
			debug!(pod = %name, phase = %pod_phase(&pod), "waiting for shadow pod");
			tokio::time::sleep(self.poll_interval).await;
		}
	}
}

fn shadow_pod(spec: &ShadowSpec, store: &str) -> Pod {
	let mut annotations = spec.annotations.clone();
	annotations.insert(KEY_STORE_ANNOTATION.to_string(), store.to_string());
	let mut metadata = ObjectMeta {
		name: Some(spec.name.clone()),
		labels: Some(spec.labels.clone()),
		annotations: Some(annotations),
		..Default::default()
	};
	write_ref_count(&mut metadata, 1);

	let env = spec
		.env
		.iter()
		.map(|(name, value)| EnvVar {
			name: name.clone(),
			value: Some(value.clone()),
			..Default::default()
		})
		.collect();
	let ports = spec
		.ports
		.iter()
		.map(|port| ContainerPort {
			container_port: *port,
			..Default::default()
		})
		.collect::<Vec<_>>();

	Pod {
		metadata,
		spec: Some(PodSpec {
			containers: vec![Container {
				name: SHADOW_CONTAINER.to_string(),
				image: Some(spec.image.clone()),
				image_pull_policy: Some("IfNotPresent".to_string()),
				env: Some(env),
				ports: (!ports.is_empty()).then_some(ports),
				volume_mounts: Some(vec![VolumeMount {
					name: KEY_VOLUME.to_string(),
					mount_path: KEY_MOUNT_PATH.to_string(),
					read_only: Some(true),
					..Default::default()
				}]),
				..Default::default()
			}],
			volumes: Some(vec![Volume {
				name: KEY_VOLUME.to_string(),
				config_map: Some(ConfigMapVolumeSource {
					name: store.to_string(),
					..Default::default()
				}),
				..Default::default()
			}]),
			..Default::default()
		}),
		..Default::default()
	}
}
