// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Ordered, best-effort reversal of a session.
//!
//! Teardown starts from the session marker: without one there is nothing to
//! do. Otherwise every step runs even when an earlier one failed, failures are
//! logged and collected into a [`TeardownReport`], and nothing is propagated.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tether_config::{ConnectMethod, ExchangeMethod};
use tether_k8s::K8sClient;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::exchange::{self, RecoveryOutcome};
use crate::keys::private_key_path;
use crate::mesh::{self, MeshRecovery};
use crate::refcount;
use crate::state::{ComponentKind, RuntimeState, SessionHandle, SessionStore};
use crate::workstation::Workstation;

/// Readiness poll period during scale recovery.
pub const RECOVER_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Builds a cluster client on demand, so a broken kubeconfig only costs the
/// cluster-side steps.
#[async_trait]
pub trait ClientFactory: Send + Sync {
	async fn client(&self) -> Result<Arc<dyn K8sClient>>;
}

/// Always hands out the same client.
pub struct FixedClient(pub Arc<dyn K8sClient>);

#[async_trait]
impl ClientFactory for FixedClient {
	async fn client(&self) -> Result<Arc<dyn K8sClient>> {
		Ok(self.0.clone())
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
	/// No marker existed, so nothing was touched.
	pub skipped: bool,
	/// Names of the steps that failed.
	pub failures: Vec<String>,
	pub exchange: Option<RecoveryOutcome>,
	pub mesh: Option<MeshRecovery>,
	/// Cluster objects that may need manual cleanup.
	pub leftovers: Vec<String>,
}

impl TeardownReport {
	pub fn is_clean(&self) -> bool {
		self.failures.is_empty()
	}

	fn record(&mut self, step: &str, result: Result<()>) {
		if let Err(e) = result {
			error!(step = %step, error = %e, "teardown step failed");
			self.failures.push(step.to_string());
		}
	}
}

pub struct TeardownCoordinator {
	store: SessionStore,
	workstation: Workstation,
	clients: Arc<dyn ClientFactory>,
	recover_wait_secs: u64,
	poll_interval: Duration,
}

impl TeardownCoordinator {
	pub fn new(
		store: SessionStore,
		workstation: Workstation,
		clients: Arc<dyn ClientFactory>,
		recover_wait_secs: u64,
	) -> Self {
		Self {
			store,
			workstation,
			clients,
			recover_wait_secs,
			poll_interval: RECOVER_POLL_INTERVAL,
		}
	}

	pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
		self.poll_interval = poll_interval;
		self
	}

	/// Tear down the session identified by `handle`.
	///
	/// `interrupt` resolves when the user asks to stop waiting; it only cuts
	/// short the readiness wait of a scale recovery.
	#[instrument(skip(self, interrupt), fields(session = %handle))]
	pub async fn run<F>(&self, handle: SessionHandle, interrupt: F) -> TeardownReport
	where
		F: Future<Output = ()> + Send + 'static,
	{
		if !self.store.has_marker(handle) {
			debug!("no session marker, nothing to clean up");
			return TeardownReport {
				skipped: true,
				..Default::default()
			};
		}

		let mut report = TeardownReport::default();
		let state = match self.store.load(handle) {
			Ok(Some(state)) => state,
			Ok(None) => {
				warn!("session state is missing, only local markers can be removed");
				RuntimeState::for_pid(handle.component, String::new(), handle.pid)
			}
			Err(e) => {
				error!(error = %e, "session state is unreadable, only local markers can be removed");
				report.failures.push("load state".to_string());
				RuntimeState::for_pid(handle.component, String::new(), handle.pid)
			}
		};
		info!(component = %state.component, namespace = %state.namespace, "tearing down session");

		report.record("local files", self.clean_local_files(handle, &state));
		self.remove_private_keys(&state);
		if state.component == ComponentKind::Connect {
			self.restore_workstation(&state, &mut report).await;
		}

		if !state.namespace.is_empty() {
			self.clean_cluster(&state, interrupt, &mut report).await;
		}

		if let Err(e) = self.store.remove_state(handle) {
			warn!(error = %e, "failed to remove session state file");
		}

		if !report.is_clean() {
			report.leftovers = state.cluster_footprint();
			warn!(
				objects = %report.leftovers.join(", "),
				namespace = %state.namespace,
				"teardown finished with errors, these objects may need manual cleanup"
			);
		} else {
			info!("session torn down");
		}
		report
	}

	fn clean_local_files(&self, handle: SessionHandle, state: &RuntimeState) -> Result<()> {
		if self.store.remove_marker(handle)? {
			info!(marker = %self.store.marker_path(handle).display(), "pid marker removed");
		}
		let mut last_err = None;
		for file in &state.scratch_files {
			match std::fs::remove_file(file) {
				Ok(()) => info!(file = %file.display(), "scratch file removed"),
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
				Err(e) => {
					error!(file = %file.display(), error = %e, "failed to remove scratch file");
					last_err = Some(e);
				}
			}
		}
		last_err.map_or(Ok(()), |e| Err(e.into()))
	}

	fn remove_private_keys(&self, state: &RuntimeState) {
		for store in &state.key_stores {
			let Some(path) = private_key_path(&self.workstation.key_dir, store) else {
				warn!(key_store = %store, "cannot derive private key path");
				continue;
			};
			if !path.exists() {
				error!(path = %path.display(), "key file does not exist");
				continue;
			}
			if let Err(e) = self.workstation.keys.remove(&path) {
				error!(path = %path.display(), error = %e, "failed to remove private key");
			}
		}
	}

	async fn restore_workstation(&self, state: &RuntimeState, report: &mut TeardownReport) {
		if state.dump_to_hosts {
			debug!("dropping hosts records");
			report.record("hosts", self.workstation.hosts.drop_hosts());
		}

		if let Some(proxy) = &state.proxy {
			debug!("cleaning up global proxy and environment variables");
			if proxy.global && state.connect_method == Some(ConnectMethod::Socks) {
				report.record(
					"global proxy",
					self.workstation.proxy.clean_global_proxy(proxy).await,
				);
			}
			report.record(
				"proxy environment",
				self.workstation.proxy.clean_http_proxy_env(proxy).await,
			);
		}

		if state.connect_method == Some(ConnectMethod::Tun) {
			self.workstation.local_dns.stop().await;
			if state.name_server_set {
				report.record("name server", self.workstation.name_server.restore().await);
			}
			if state.tun_device.is_some() {
				report.record("tun device", self.workstation.tunnel.remove_device().await);
			}
		}
	}

	async fn clean_cluster<F>(&self, state: &RuntimeState, interrupt: F, report: &mut TeardownReport)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let client = match self.clients.client().await {
			Ok(client) => client,
			Err(e) => {
				error!(error = %e, "cannot build cluster client, skipping cluster cleanup");
				report.failures.push("cluster client".to_string());
				return;
			}
		};
		let ns = state.namespace.as_str();

		if state.component == ComponentKind::Exchange
			&& state.exchange_method == Some(ExchangeMethod::Scale)
		{
			if let Some(origin) = &state.origin {
				let outcome = exchange::recover_scale(
					client.clone(),
					origin,
					ns,
					state.replicas,
					self.poll_interval,
					self.recover_wait_secs / 5,
					interrupt,
				)
				.await;
				report.exchange = Some(outcome);
			}
		}

		if state.component == ComponentKind::Mesh {
			if let (Some(router), Some(version)) = (&state.router, &state.mesh_version) {
				match mesh::recover(client.as_ref(), router, ns, version).await {
					Ok(outcome) => report.mesh = Some(outcome),
					Err(e) => {
						error!(router = %router, error = %e, "mesh recovery abandoned");
						report.failures.push("mesh recovery".to_string());
					}
				}
			}
		}

		if let Some(service) = &state.service {
			info!(service = %service, "cleaning service");
			let result = match client.delete_service(service, ns).await {
				Err(e) if e.is_not_found() => Ok(()),
				other => other.map_err(Into::into),
			};
			report.record("service", result);
		}

		self.clean_shadows(client.as_ref(), state, report).await;
	}

	async fn clean_shadows(&self, client: &dyn K8sClient, state: &RuntimeState, report: &mut TeardownReport) {
		let ns = state.namespace.as_str();
		let mut last_owner = false;

		if state.shared_shadow {
			for shadow in &state.shadows {
				match refcount::decrease_ref(client, shadow, ns).await {
					Ok(true) => {
						last_owner = true;
						report.record("shadow pod", delete_pod(client, shadow, ns).await);
					}
					Ok(false) => info!(pod = %shadow, "shared shadow still in use"),
					Err(e) if e.is_not_found() => {
						warn!(pod = %shadow, "shared shadow already gone");
						last_owner = true;
					}
					Err(e) => {
						error!(pod = %shadow, error = %e, "failed to decrease shadow reference count");
						report.failures.push("shadow reference".to_string());
					}
				}
			}
		} else if state.exchange_method == Some(ExchangeMethod::Ephemeral) {
			if exchange::recover_ephemeral(client, &state.shadows, ns).await > 0 {
				report.failures.push("ephemeral containers".to_string());
			}
		} else {
			for shadow in &state.shadows {
				info!(pod = %shadow, "cleaning shadow pod");
				report.record("shadow pod", delete_pod(client, shadow, ns).await);
			}
		}

		if !state.shared_shadow || last_owner {
			for store in &state.key_stores {
				info!(configmap = %store, "cleaning credential store");
				let result = match client.delete_config_map(store, ns).await {
					Err(e) if e.is_not_found() => Ok(()),
					other => other.map_err(Into::into),
				};
				report.record("credential store", result);
			}
		}
	}
}

async fn delete_pod(client: &dyn K8sClient, name: &str, namespace: &str) -> Result<()> {
	match client.delete_pod(name, namespace).await {
		Ok(()) => {
			info!(pod = %name, "shadow pod deleted");
			Ok(())
		}
		Err(e) if e.is_not_found() => Ok(()),
		Err(e) => Err(e.into()),
	}
}
