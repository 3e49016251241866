// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Mesh: route one tagged version of a service's traffic to the workstation.
//!
//! The first mesh session against a service creates `<svc>-router`, copies
//! the service's endpoints into `<svc>-origin` and points the service at the
//! router. Later sessions only attach to the router and register their
//! version with it. The router is reference counted like a shared shadow.

use std::collections::BTreeMap;

use tether_k8s::{
	Container, ContainerPort, EnvVar, K8sClient, K8sError, ObjectMeta, Pod, PodSpec, Service,
	ServicePort, ServiceSpec,
};
use tracing::{debug, error, info, instrument};

use crate::annotations::{write_ref_count, OriginalSelector, RouterConfig};
use crate::error::{Result, SessionError};
use crate::names::{
	mesh_object_name, origin_service_name, random_suffix, role_labels, router_name,
	DEFAULT_VERSION_KEY, ENV_ROUTER_HEADER, ENV_ROUTER_PORTS, ENV_ROUTER_SERVICE,
	ORIGINAL_SELECTOR_ANNOTATION, ROLE_MESH_SHADOW, ROLE_ROUTER, ROUTER_BIN, ROUTER_CONTAINER,
	ROUTER_FOR_LABEL,
};
use crate::ports::PortMap;
use crate::refcount;

/// Header key and value that select a mesh version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMark {
	pub key: String,
	pub version: String,
}

/// Parse `[key:]version`. A missing key defaults to `tether-version` and a
/// missing version is generated.
pub fn parse_version_mark(mark: &str) -> Result<VersionMark> {
	let (key, version) = match mark.split_once(':') {
		Some((key, version)) => (key, version),
		None => (DEFAULT_VERSION_KEY, mark),
	};
	if !is_valid_key(key) {
		return Err(SessionError::InvalidArgument(format!(
			"mesh version key '{key}' must start with a letter and contain only letters, digits, '-' or '_'"
		)));
	}
	let version = if version.is_empty() {
		random_suffix(5)
	} else {
		version.to_string()
	};
	Ok(VersionMark {
		key: key.to_string(),
		version,
	})
}

/// `^[a-zA-Z][a-zA-Z0-9_-]*$`
pub fn is_valid_key(key: &str) -> bool {
	let mut chars = key.chars();
	match chars.next() {
		Some(first) if first.is_ascii_alphabetic() => {
			chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
		}
		_ => false,
	}
}

/// Labels the redirected service selects while routed.
pub fn router_labels(service: &str) -> BTreeMap<String, String> {
	let mut labels = role_labels(ROLE_ROUTER);
	labels.insert(ROUTER_FOR_LABEL.to_string(), service.to_string());
	labels
}

/// Labels of the mesh shadow serving one version.
pub fn version_labels(mark: &VersionMark) -> BTreeMap<String, String> {
	let mut labels = role_labels(ROLE_MESH_SHADOW);
	labels.insert(mark.key.clone(), mark.version.clone());
	labels
}

/// Result of attaching to a service's router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterLease {
	pub name: String,
	pub created: bool,
}

/// Create the router for `service` or take another reference on it.
#[instrument(skip(client, ports))]
pub async fn acquire_router(
	client: &dyn K8sClient,
	service: &str,
	namespace: &str,
	image: &str,
	ports: &PortMap,
	version_key: &str,
) -> Result<RouterLease> {
	let name = router_name(service);
	match client.get_pod(&name, namespace).await {
		Ok(_) => {}
		Err(e) if e.is_not_found() => {
			let pod = router_pod(&name, service, image, ports, version_key)?;
			match client.create_pod(namespace, pod).await {
				Ok(_) => {
					info!(router = %name, "router pod created");
					return Ok(RouterLease {
						name,
						created: true,
					});
				}
				Err(K8sError::AlreadyExists { .. }) => {
					debug!(router = %name, "router created concurrently, attaching");
				}
				Err(e) => return Err(e.into()),
			}
		}
		Err(e) => return Err(e.into()),
	}

	let count = refcount::increase_ref(client, &name, namespace).await?;
	info!(router = %name, count, "attached to existing router");
	Ok(RouterLease {
		name,
		created: false,
	})
}

fn router_pod(
	name: &str,
	service: &str,
	image: &str,
	ports: &PortMap,
	version_key: &str,
) -> Result<Pod> {
	let mut metadata = ObjectMeta {
		name: Some(name.to_string()),
		labels: Some(router_labels(service)),
		..Default::default()
	};
	let mut config = RouterConfig::new(service);
	config
		.extra
		.insert("ports".to_string(), ports.to_string());
	config
		.extra
		.insert("header".to_string(), version_key.to_string());
	config.write(&mut metadata)?;
	write_ref_count(&mut metadata, 1);

	let env = [
		(ENV_ROUTER_SERVICE, service.to_string()),
		(ENV_ROUTER_PORTS, ports.to_string()),
		(ENV_ROUTER_HEADER, version_key.to_string()),
	]
	.into_iter()
	.map(|(name, value)| EnvVar {
		name: name.to_string(),
		value: Some(value),
		..Default::default()
	})
	.collect();

	Ok(Pod {
		metadata,
		spec: Some(PodSpec {
			containers: vec![Container {
				name: ROUTER_CONTAINER.to_string(),
				image: Some(image.to_string()),
				image_pull_policy: Some("IfNotPresent".to_string()),
				env: Some(env),
				ports: Some(
					ports
						.remote_ports()
						.into_iter()
						.map(|port| ContainerPort {
							container_port: port,
							..Default::default()
						})
						.collect(),
				),
				..Default::default()
			}],
			..Default::default()
		}),
		..Default::default()
	})
}

/// Point `service` at the router, keeping its endpoints reachable through
/// `<service>-origin`.
///
/// Returns false when the service was already redirected by another session.
#[instrument(skip(client))]
pub async fn redirect_service(client: &dyn K8sClient, service: &str, namespace: &str) -> Result<bool> {
	let mut svc = client.get_service(service, namespace).await?;
	let already = svc
		.metadata
		.annotations
		.as_ref()
		.is_some_and(|a| a.contains_key(ORIGINAL_SELECTOR_ANNOTATION));
	if already {
		debug!(service = %service, "service already routed through router");
		return Ok(false);
	}

	let spec = svc
		.spec
		.clone()
		.ok_or(SessionError::MissingField("service spec"))?;
	let selector = spec.selector.clone().unwrap_or_default();
	if selector.is_empty() {
		return Err(SessionError::InvalidArgument(format!(
			"service {service} has no selector to take over"
		)));
	}

	let origin = origin_service(service, &spec, &selector);
	match client.create_service(namespace, origin).await {
		Ok(_) => info!(service = %origin_service_name(service), "origin service created"),
		Err(K8sError::AlreadyExists { .. }) => {
			debug!(service = %origin_service_name(service), "origin service already exists")
		}
		Err(e) => return Err(e.into()),
	}

	OriginalSelector(selector).write(&mut svc.metadata)?;
	if let Some(spec) = svc.spec.as_mut() {
		spec.selector = Some(router_labels(service));
	}
	client.replace_service(namespace, svc).await?;
	info!(service = %service, "service routed through router");
	Ok(true)
}

fn origin_service(service: &str, spec: &ServiceSpec, selector: &BTreeMap<String, String>) -> Service {
	Service {
		metadata: ObjectMeta {
			name: Some(origin_service_name(service)),
			labels: Some(role_labels(ROLE_ROUTER)),
			..Default::default()
		},
		spec: Some(ServiceSpec {
			selector: Some(selector.clone()),
			ports: spec.ports.as_ref().map(|ports| {
				ports
					.iter()
					.map(|p| ServicePort {
						name: p.name.clone(),
						port: p.port,
						protocol: p.protocol.clone(),
						target_port: p.target_port.clone(),
						..Default::default()
					})
					.collect()
			}),
			..Default::default()
		}),
		..Default::default()
	}
}

/// Service fronting the mesh shadow of one version.
pub fn version_service(service: &str, mark: &VersionMark, ports: &PortMap) -> Service {
	Service {
		metadata: ObjectMeta {
			name: Some(mesh_object_name(service, &mark.version)),
			labels: Some(role_labels(ROLE_MESH_SHADOW)),
			..Default::default()
		},
		spec: Some(ServiceSpec {
			selector: Some(version_labels(mark)),
			ports: Some(
				ports
					.pairs()
					.iter()
					.map(|(_, remote)| ServicePort {
						name: Some(format!("tcp-{remote}")),
						port: i32::from(*remote),
						..Default::default()
					})
					.collect(),
			),
			..Default::default()
		}),
		..Default::default()
	}
}

/// Register a version with the router.
pub async fn add_version(
	client: &dyn K8sClient,
	router: &str,
	namespace: &str,
	version: &str,
) -> Result<()> {
	let output = client
		.exec_in_pod(ROUTER_CONTAINER, router, namespace, &router_command("add", version))
		.await?;
	debug!(stdout = %output.stdout, stderr = %output.stderr, "router add finished");
	info!(router = %router, version = %version, "version registered with router");
	Ok(())
}

fn router_command(action: &str, version: &str) -> Vec<String> {
	vec![
		ROUTER_BIN.to_string(),
		action.to_string(),
		version.to_string(),
	]
}

/// How mesh recovery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshRecovery {
	/// The router was already gone; nothing to undo.
	RouterGone,
	/// Last owner: the service selector was restored and the router removed.
	Restored,
	/// Other sessions remain: only this version was removed from the router.
	VersionRemoved,
}

#[instrument(skip(client))]
pub async fn recover(
	client: &dyn K8sClient,
	router: &str,
	namespace: &str,
	version: &str,
) -> Result<MeshRecovery> {
	let router_pod = match client.get_pod(router, namespace).await {
		Ok(pod) => pod,
		Err(e) => {
			error!(router = %router, error = %e, "router pod has been removed unexpectedly");
			return Ok(MeshRecovery::RouterGone);
		}
	};

	if refcount::decrease_ref(client, router, namespace).await? {
		let config = RouterConfig::read(&router_pod.metadata)?;
		restore_service(client, &config.service, namespace).await?;

		let origin = origin_service_name(&config.service);
		match client.delete_service(&origin, namespace).await {
			Ok(()) => info!(service = %origin, "origin service removed"),
			Err(e) => error!(service = %origin, error = %e, "failed to remove origin service"),
		}
		match client.delete_pod(router, namespace).await {
			Ok(()) => info!(router = %router, "router pod removed"),
			Err(e) => error!(router = %router, error = %e, "failed to remove router pod"),
		}
		return Ok(MeshRecovery::Restored);
	}

	match client
		.exec_in_pod(ROUTER_CONTAINER, router, namespace, &router_command("remove", version))
		.await
	{
		Ok(output) => {
			debug!(stdout = %output.stdout, stderr = %output.stderr, "router remove finished");
			info!(router = %router, version = %version, "version removed from router");
		}
		Err(e) => {
			error!(router = %router, version = %version, error = %e, "failed to remove version from router")
		}
	}
	Ok(MeshRecovery::VersionRemoved)
}

/// Put back the selector saved in the service's annotation.
pub async fn restore_service(client: &dyn K8sClient, service: &str, namespace: &str) -> Result<()> {
	let mut svc = client.get_service(service, namespace).await?;
	let selector = OriginalSelector::read(&svc.metadata)?;
	if let Some(annotations) = svc.metadata.annotations.as_mut() {
		annotations.remove(ORIGINAL_SELECTOR_ANNOTATION);
	}
	svc.spec.get_or_insert_with(ServiceSpec::default).selector = Some(selector.0);
	client.replace_service(namespace, svc).await?;
	info!(service = %service, "original service selector restored");
	Ok(())
}
