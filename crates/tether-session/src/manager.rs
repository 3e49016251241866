// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Drives one connect, exchange or mesh session.
//!
//! Every change to the cluster or the workstation is recorded in the
//! session's [`RuntimeState`] and saved before the next step runs, so a
//! failure at any point can be reversed by [`TeardownCoordinator`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tether_config::{ConnectMethod, DnsMode, ExchangeMethod, TetherConfig};
use tether_k8s::K8sClient;
use tracing::{info, instrument, warn};

use crate::dns::{shadow_env, AppliedDns, DnsStrategy};
use crate::error::Result;
use crate::exchange;
use crate::mesh::{self, VersionMark};
use crate::names::{connect_shadow_name, mesh_object_name, role_labels, ENV_LOG_LEVEL, ROLE_CONNECT_SHADOW};
use crate::ports::PortMap;
use crate::proxy::write_jvmrc;
use crate::shadow::{ShadowClaim, ShadowEndpoint, ShadowPool, ShadowSpec};
use crate::state::{ComponentKind, ProxyRecord, RuntimeState, SessionHandle, SessionStore};
use crate::teardown::{FixedClient, TeardownCoordinator};
use crate::workstation::Workstation;

/// Per-invocation connect settings that do not live in the config file.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
	/// Search domains of the workstation, passed on to the shadow.
	pub local_domains: Vec<String>,
	/// Where to write a `.jvmrc` for socks sessions.
	pub jvmrc_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ConnectSession {
	pub handle: SessionHandle,
	pub endpoint: ShadowEndpoint,
	pub dns: AppliedDns,
}

#[derive(Debug, Clone)]
pub struct ExchangeSession {
	pub handle: SessionHandle,
	pub method: ExchangeMethod,
	pub endpoint: Option<ShadowEndpoint>,
	pub pods: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MeshSession {
	pub handle: SessionHandle,
	pub endpoint: ShadowEndpoint,
	pub router: String,
	pub mark: VersionMark,
}

pub struct SessionManager {
	config: TetherConfig,
	client: Arc<dyn K8sClient>,
	store: SessionStore,
	workstation: Workstation,
	pool: ShadowPool,
	debug: bool,
}

impl SessionManager {
	pub fn new(config: TetherConfig, client: Arc<dyn K8sClient>, workstation: Workstation) -> Self {
		let pool = ShadowPool::new(
			client.clone(),
			workstation.keys.clone(),
			workstation.key_dir.clone(),
			&config.shadow,
		);
		Self {
			store: SessionStore::new(config.paths.home_dir.clone()),
			config,
			client,
			workstation,
			pool,
			debug: false,
		}
	}

	pub fn with_debug(mut self, debug: bool) -> Self {
		self.debug = debug;
		self
	}

	pub fn store(&self) -> &SessionStore {
		&self.store
	}

	/// Handle of a session of `component` owned by this process.
	pub fn handle(component: ComponentKind) -> SessionHandle {
		SessionHandle {
			component,
			pid: std::process::id(),
		}
	}

	pub fn teardown_coordinator(&self) -> TeardownCoordinator {
		TeardownCoordinator::new(
			self.store.clone(),
			self.workstation.clone(),
			Arc::new(FixedClient(self.client.clone())),
			self.config.exchange.recover_wait_secs,
		)
	}

	fn log_level_env(&self) -> BTreeMap<String, String> {
		let level = if self.debug { "debug" } else { "info" };
		BTreeMap::from([(ENV_LOG_LEVEL.to_string(), level.to_string())])
	}

	/// Get or create a shadow, saving each claim the pool makes into `state`
	/// before the pool waits on it.
	async fn claim_shadow(&self, state: &mut RuntimeState, spec: &ShadowSpec) -> Result<ShadowEndpoint> {
		let shadows = state.shadows.len();
		let key_stores = state.key_stores.len();
		let store = &self.store;
		let claimed = self
			.pool
			.get_or_create_recorded(spec, |claim| {
				apply_claim(state, claim);
				store.save(state)
			})
			.await;

		if claimed.is_err() {
			state.shadows.truncate(shadows);
			state.key_stores.truncate(key_stores);
			if let Err(e) = self.store.save(state) {
				warn!(error = %e, "failed to forget shadow claims after rollback");
			}
		}
		claimed
	}

	#[instrument(skip(self, options))]
	pub async fn connect(&self, options: &ConnectOptions) -> Result<ConnectSession> {
		let cfg = &self.config.connect;
		let namespace = self.config.cluster.namespace.clone();
		let mut state = RuntimeState::new(ComponentKind::Connect, &namespace);
		state.shared_shadow = cfg.shared_shadow;
		state.connect_method = Some(cfg.method);
		self.store.create(&state)?;

		let spec = ShadowSpec {
			name: connect_shadow_name(cfg.shared_shadow),
			namespace: namespace.clone(),
			component: ComponentKind::Connect,
			shared: cfg.shared_shadow,
			image: self.config.shadow.image.clone(),
			labels: role_labels(ROLE_CONNECT_SHADOW),
			annotations: BTreeMap::new(),
			env: shadow_env(&cfg.dns_mode, self.debug, &options.local_domains),
			ports: Vec::new(),
		};
		let endpoint = self.claim_shadow(&mut state, &spec).await?;

		match cfg.method {
			ConnectMethod::Tun => {
				let tunnel = &self.workstation.tunnel;
				tunnel.create_device().await?;
				state.tun_device = Some(tunnel.device_name().to_string());
				self.store.save(&state)?;
				if cfg.cidrs.is_empty() {
					warn!("no cidrs configured, no routes added to the tun device");
				} else {
					tunnel.set_route(&cfg.cidrs).await?;
				}
			}
			ConnectMethod::Socks => {
				if cfg.use_global_proxy {
					let mut record = ProxyRecord {
						socks_port: cfg.socks_port,
						global: true,
						env_file: None,
					};
					state.proxy = Some(record.clone());
					self.store.save(&state)?;
					self.workstation.proxy.set_global_proxy(cfg.socks_port).await?;
					record.env_file = Some(
						self
							.workstation
							.proxy
							.set_http_proxy_env(cfg.socks_port)
							.await?,
					);
					state.proxy = Some(record);
					self.store.save(&state)?;
				}
				if let Some(dir) = &options.jvmrc_dir {
					state.scratch_files.push(write_jvmrc(dir, cfg.socks_port)?);
					self.store.save(&state)?;
				}
			}
		}

		let mut dns = AppliedDns::default();
		if cfg.disable_dns {
			info!("dns setup disabled");
		} else {
			let mode = match (&cfg.method, &cfg.dns_mode) {
				(ConnectMethod::Socks, DnsMode::PodDns | DnsMode::LocalDns) => {
					warn!(mode = %cfg.dns_mode, "socks sessions can only dump hosts, using hosts mode");
					DnsMode::Hosts {
						namespaces: Vec::new(),
					}
				}
				(_, mode) => mode.clone(),
			};
			state.dump_to_hosts = !matches!(mode, DnsMode::PodDns);
			state.name_server_set = !matches!(mode, DnsMode::Hosts { .. });
			self.store.save(&state)?;

			let strategy = DnsStrategy::new(
				self.client.clone(),
				self.workstation.hosts.clone(),
				self.workstation.name_server.clone(),
				self.workstation.local_dns.clone(),
				self.config.cluster.cluster_domain.clone(),
			);
			dns = strategy.apply(&mode, &namespace, &endpoint.ip).await?;
		}

		info!(shadow = %endpoint.pod_name, ip = %endpoint.ip, "connected");
		Ok(ConnectSession {
			handle: state.handle(),
			endpoint,
			dns,
		})
	}

	#[instrument(skip(self, ports), fields(ports = %ports))]
	pub async fn exchange(&self, deployment: &str, ports: &PortMap) -> Result<ExchangeSession> {
		let method = self.config.exchange.method;
		let namespace = self.config.cluster.namespace.clone();
		let mut state = RuntimeState::new(ComponentKind::Exchange, &namespace);
		state.exchange_method = Some(method);
		self.store.create(&state)?;

		match method {
			ExchangeMethod::Scale => {
				let target = exchange::scale_target(self.client.as_ref(), deployment, &namespace).await?;
				let spec = ShadowSpec {
					name: target.shadow_name(),
					namespace: namespace.clone(),
					component: ComponentKind::Exchange,
					shared: false,
					image: self.config.shadow.image.clone(),
					labels: target.shadow_labels(),
					annotations: BTreeMap::new(),
					env: self.log_level_env(),
					ports: ports.remote_ports(),
				};
				let endpoint = self.claim_shadow(&mut state, &spec).await?;
				state.origin = Some(target.name.clone());
				state.replicas = target.replicas;
				self.store.save(&state)?;

				exchange::scale_down(self.client.as_ref(), &target.name, &namespace).await?;
				info!(deployment = %target.name, shadow = %endpoint.pod_name, "traffic exchanged");
				Ok(ExchangeSession {
					handle: state.handle(),
					method,
					endpoint: Some(endpoint),
					pods: Vec::new(),
				})
			}
			ExchangeMethod::Ephemeral => {
				let store = &self.store;
				let pods = exchange::inject_ephemeral(
					self.client.as_ref(),
					deployment,
					&namespace,
					&self.config.shadow.image,
					&self.log_level_env(),
					|pod| {
						state.shadows.push(pod.to_string());
						store.save(&state)
					},
				)
				.await?;
				info!(deployment = %deployment, pods = pods.len(), "traffic exchanged");
				Ok(ExchangeSession {
					handle: state.handle(),
					method,
					endpoint: None,
					pods,
				})
			}
		}
	}

	#[instrument(skip(self, ports), fields(ports = %ports))]
	pub async fn mesh(&self, service: &str, ports: &PortMap, version_mark: &str) -> Result<MeshSession> {
		let mark = mesh::parse_version_mark(version_mark)?;
		let namespace = self.config.cluster.namespace.clone();
		let client = self.client.as_ref();
		let mut state = RuntimeState::new(ComponentKind::Mesh, &namespace);
		state.mesh_version = Some(mark.version.clone());
		self.store.create(&state)?;

		let lease = mesh::acquire_router(
			client,
			service,
			&namespace,
			&self.config.shadow.router_image,
			ports,
			&mark.key,
		)
		.await?;
		state.router = Some(lease.name.clone());
		self.store.save(&state)?;
		self.pool.wait_until_ready(&lease.name, &namespace).await?;

		let spec = ShadowSpec {
			name: mesh_object_name(service, &mark.version),
			namespace: namespace.clone(),
			component: ComponentKind::Mesh,
			shared: false,
			image: self.config.shadow.image.clone(),
			labels: mesh::version_labels(&mark),
			annotations: BTreeMap::new(),
			env: self.log_level_env(),
			ports: ports.remote_ports(),
		};
		let endpoint = self.claim_shadow(&mut state, &spec).await?;

		let version_service = mesh::version_service(service, &mark, ports);
		let version_service_name = version_service.metadata.name.clone();
		client.create_service(&namespace, version_service).await?;
		state.service = version_service_name;
		self.store.save(&state)?;

		mesh::redirect_service(client, service, &namespace).await?;
		mesh::add_version(client, &lease.name, &namespace, &mark.version).await?;

		info!(
			service = %service,
			header = %format!("{}: {}", mark.key, mark.version),
			"mesh routed"
		);
		Ok(MeshSession {
			handle: state.handle(),
			endpoint,
			router: lease.name,
			mark,
		})
	}
}

fn apply_claim(state: &mut RuntimeState, claim: ShadowClaim) {
	match claim {
		ShadowClaim::KeyStore(store) => state.key_stores.push(store),
		ShadowClaim::KeyStoreDiscarded(store) => state.key_stores.retain(|s| *s != store),
		ShadowClaim::Pod(pod) => state.shadows.push(pod),
	}
}
