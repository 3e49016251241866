// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Exchange: move a deployment's traffic to the local workstation.
//!
//! Two methods are supported:
//! - scale: a shadow pod carrying the deployment's pod labels takes over its
//!   service endpoints while the deployment is scaled to zero
//! - ephemeral: an exchange container is injected into every running pod of
//!   the deployment, leaving the replica count alone

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tether_k8s::{label_selector, Deployment, EphemeralContainer, K8sClient};
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use crate::error::{Result, SessionError};
use crate::names::{random_suffix, role_labels, EXCHANGE_CONTAINER, ROLE_EXCHANGE_SHADOW};

/// How a scale recovery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
	/// The deployment reported all replicas ready.
	Ready,
	/// Readiness was not observed in time; the deployment was left to settle.
	TimedOut,
	/// An interrupt arrived before the wait finished.
	Interrupted,
}

/// What scale mode needs to know about the origin deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleTarget {
	pub name: String,
	pub replicas: i32,
	pub pod_labels: BTreeMap<String, String>,
}

impl ScaleTarget {
	pub fn from_deployment(deployment: &Deployment) -> Result<Self> {
		let name = deployment
			.metadata
			.name
			.clone()
			.ok_or(SessionError::MissingField("deployment name"))?;
		let spec = deployment
			.spec
			.as_ref()
			.ok_or(SessionError::MissingField("deployment spec"))?;
		let pod_labels = spec
			.template
			.metadata
			.as_ref()
			.and_then(|m| m.labels.clone())
			.unwrap_or_default();
		if pod_labels.is_empty() {
			return Err(SessionError::InvalidArgument(format!(
				"deployment {name} has no pod template labels to take over"
			)));
		}
		Ok(Self {
			name,
			replicas: spec.replicas.unwrap_or(1),
			pod_labels,
		})
	}

	/// Labels for the shadow that stands in for the deployment's pods.
	pub fn shadow_labels(&self) -> BTreeMap<String, String> {
		let mut labels = self.pod_labels.clone();
		labels.extend(role_labels(ROLE_EXCHANGE_SHADOW));
		labels
	}

	pub fn shadow_name(&self) -> String {
		format!("{}-tether-exchange-{}", self.name, random_suffix(5))
	}
}

pub async fn scale_target(client: &dyn K8sClient, name: &str, namespace: &str) -> Result<ScaleTarget> {
	let deployment = client.get_deployment(name, namespace).await?;
	ScaleTarget::from_deployment(&deployment)
}

#[instrument(skip(client))]
pub async fn scale_down(client: &dyn K8sClient, name: &str, namespace: &str) -> Result<()> {
	client.scale_deployment(name, namespace, 0).await?;
	info!(deployment = %name, "origin deployment scaled to zero");
	Ok(())
}

/// Scale the origin back and wait for it to become ready.
///
/// The scale call is made exactly once. The readiness wait runs as its own
/// task for at most `iterations` polls; `interrupt` races it into the same
/// completion channel and whichever arrives first ends the wait.
#[instrument(skip(client, interrupt))]
pub async fn recover_scale<F>(
	client: Arc<dyn K8sClient>,
	name: &str,
	namespace: &str,
	replicas: i32,
	poll_interval: Duration,
	iterations: u64,
	interrupt: F,
) -> RecoveryOutcome
where
	F: Future<Output = ()> + Send + 'static,
{
	info!(deployment = %name, replicas, "recovering origin deployment");
	if let Err(e) = client.scale_deployment(name, namespace, replicas).await {
		error!(deployment = %name, replicas, error = %e, "failed to scale origin deployment back");
	}

	let (tx, mut rx) = mpsc::channel::<RecoveryOutcome>(2);

	let wait_tx = tx.clone();
	let wait_client = client.clone();
	let (wait_name, wait_ns) = (name.to_string(), namespace.to_string());
	let waiter = tokio::spawn(async move {
		let ready = wait_for_replicas(
			wait_client.as_ref(),
			&wait_name,
			&wait_ns,
			replicas,
			poll_interval,
			iterations,
		)
		.await;
		let outcome = if ready {
			RecoveryOutcome::Ready
		} else {
			RecoveryOutcome::TimedOut
		};
		let _ = wait_tx.send(outcome).await;
	});

	let signal = tokio::spawn(async move {
		interrupt.await;
		let _ = tx.send(RecoveryOutcome::Interrupted).await;
	});

	let outcome = rx.recv().await.unwrap_or(RecoveryOutcome::TimedOut);
	waiter.abort();
	signal.abort();

	match outcome {
		RecoveryOutcome::Ready => info!(deployment = %name, "origin deployment recovered"),
		RecoveryOutcome::TimedOut => warn!(deployment = %name, "origin deployment recover timeout"),
		RecoveryOutcome::Interrupted => {
			warn!(deployment = %name, "interrupted while waiting for origin deployment")
		}
	}
	outcome
}

async fn wait_for_replicas(
	client: &dyn K8sClient,
	name: &str,
	namespace: &str,
	replicas: i32,
	poll_interval: Duration,
	iterations: u64,
) -> bool {
	for _ in 0..iterations {
		let deployment = match client.get_deployment(name, namespace).await {
			Ok(d) => d,
			Err(e) => {
				error!(deployment = %name, error = %e, "cannot fetch origin deployment");
				return false;
			}
		};
		let ready = deployment
			.status
			.as_ref()
			.and_then(|s| s.ready_replicas)
			.unwrap_or(0);
		if ready == replicas {
			return true;
		}
		info!(deployment = %name, ready, wanted = replicas, "waiting for deployment to recover");
		tokio::time::sleep(poll_interval).await;
	}
	false
}

/// Inject the exchange container into every pod of a deployment.
///
/// Each pod is handed to `on_injected` as soon as it carries the container,
/// so pods injected before a later failure can still be recovered. Returns
/// the names of all injected pods.
#[instrument(skip(client, on_injected))]
pub async fn inject_ephemeral<F>(
	client: &dyn K8sClient,
	deployment: &str,
	namespace: &str,
	image: &str,
	env: &BTreeMap<String, String>,
	mut on_injected: F,
) -> Result<Vec<String>>
where
	F: FnMut(&str) -> Result<()> + Send,
{
	let target = client.get_deployment(deployment, namespace).await?;
	let selector = target
		.spec
		.as_ref()
		.and_then(|s| s.selector.match_labels.clone())
		.unwrap_or_default();
	if selector.is_empty() {
		return Err(SessionError::InvalidArgument(format!(
			"deployment {deployment} has no match labels"
		)));
	}

	let pods = client
		.list_pods(namespace, &label_selector(&selector))
		.await?;
	let mut injected = Vec::new();
	for pod in pods {
		let Some(pod_name) = pod.metadata.name.clone() else {
			continue;
		};
		client
			.add_ephemeral_container(&pod_name, namespace, exchange_container(image, env))
			.await?;
		info!(pod = %pod_name, "exchange container injected");
		on_injected(&pod_name)?;
		injected.push(pod_name);
	}
	if injected.is_empty() {
		return Err(SessionError::InvalidArgument(format!(
			"deployment {deployment} has no running pods"
		)));
	}
	Ok(injected)
}

fn exchange_container(image: &str, env: &BTreeMap<String, String>) -> EphemeralContainer {
	EphemeralContainer {
		name: EXCHANGE_CONTAINER.to_string(),
		image: Some(image.to_string()),
		env: Some(
			env
				.iter()
				.map(|(name, value)| tether_k8s::EnvVar {
					name: name.clone(),
					value: Some(value.clone()),
					..Default::default()
				})
				.collect(),
		),
		..Default::default()
	}
}

/// Remove the exchange container from each pod. Failures are logged and the
/// remaining pods are still attempted. Returns how many removals failed.
pub async fn recover_ephemeral(client: &dyn K8sClient, pods: &[String], namespace: &str) -> usize {
	let mut failed = 0;
	for pod in pods {
		info!(pod = %pod, "removing exchange container");
		if let Err(e) = client
			.remove_ephemeral_container(EXCHANGE_CONTAINER, pod, namespace)
			.await
		{
			error!(pod = %pod, error = %e, "failed to remove exchange container");
			failed += 1;
		}
	}
	failed
}
