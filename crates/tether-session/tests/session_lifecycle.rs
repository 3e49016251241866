// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end session tests against the in-memory cluster.
//!
//! Tests cover:
//! - Shared shadow creation races and reference counting
//! - Hosts, pod-dns and local-dns setup through a connect session
//! - Exchange scale recovery, with and without readiness
//! - Mesh recovery for shared and last-owner routers
//! - Teardown idempotency and partial failure
//! - Setups interrupted while the shadow is still starting

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tether_config::{
	ClusterLayer, ConfigLayer, ConnectLayer, ExchangeLayer, PathsConfig, ShadowLayer, TetherConfig,
};
use tether_k8s::{
	Deployment, DeploymentSpec, K8sClient, LabelSelector, MockK8sClient, ObjectMeta, Pod,
	PodTemplateSpec, Service, ServiceSpec,
};
use tether_session::annotations::read_ref_count;
use tether_session::command::RecordingRunner;
use tether_session::hosts::HostsFile;
use tether_session::keys::FileKeyStore;
use tether_session::local_dns::LocalDnsServer;
use tether_session::mesh::router_labels;
use tether_session::names::{role_labels, ROLE_CONNECT_SHADOW, SHARED_SHADOW_NAME};
use tether_session::proxy::DesktopProxyRegistry;
use tether_session::refcount::decrease_ref;
use tether_session::resolver::ResolvedDropIn;
use tether_session::tunnel::IpCommandTunnel;
use tether_session::{
	ClientFactory, ComponentKind, ConnectOptions, MeshRecovery, PortMap, RecoveryOutcome,
	RuntimeState, SessionError, SessionHandle, SessionManager, SessionStore, ShadowPool,
	ShadowSpec, TeardownCoordinator, Workstation,
};

const NS: &str = "dev";

#[derive(Default)]
struct FakeLocalDns {
	started: Mutex<Vec<(String, u16)>>,
}

#[async_trait]
impl LocalDnsServer for FakeLocalDns {
	async fn start(&self, upstream_ip: &str, port: u16) -> tether_session::Result<()> {
		self
			.started
			.lock()
			.unwrap()
			.push((upstream_ip.to_string(), port));
		Ok(())
	}

	async fn stop(&self) {}
}

struct NoCluster;

#[async_trait]
impl ClientFactory for NoCluster {
	async fn client(&self) -> tether_session::Result<Arc<dyn K8sClient>> {
		Err(SessionError::InvalidArgument("no kubeconfig".to_string()))
	}
}

struct Harness {
	dir: TempDir,
	client: MockK8sClient,
	runner: RecordingRunner,
	local_dns: Arc<FakeLocalDns>,
	config: TetherConfig,
}

impl Harness {
	fn new(client: &MockK8sClient, connect: ConnectLayer, exchange: ExchangeLayer) -> Self {
		let dir = TempDir::new().unwrap();
		let layer = ConfigLayer {
			cluster: Some(ClusterLayer {
				namespace: Some(NS.to_string()),
				..Default::default()
			}),
			connect: Some(connect),
			exchange: Some(exchange),
			shadow: Some(ShadowLayer {
				ready_timeout_secs: Some(1),
				poll_interval_ms: Some(10),
				..Default::default()
			}),
			..Default::default()
		};
		let config =
			TetherConfig::from_layer(layer, PathsConfig::with_home(dir.path().join("home"))).unwrap();
		Self {
			dir,
			client: client.clone(),
			runner: RecordingRunner::new(),
			local_dns: Arc::new(FakeLocalDns::default()),
			config,
		}
	}

	fn hosts_path(&self) -> PathBuf {
		self.dir.path().join("hosts")
	}

	fn resolver_path(&self) -> PathBuf {
		self.dir.path().join("resolved.conf.d").join("tether.conf")
	}

	fn workstation(&self) -> Workstation {
		let runner = Arc::new(self.runner.clone());
		Workstation {
			hosts: Arc::new(HostsFile::new(self.hosts_path())),
			name_server: Arc::new(ResolvedDropIn::at(self.resolver_path(), "cluster.local")),
			local_dns: self.local_dns.clone(),
			tunnel: Arc::new(IpCommandTunnel::new(runner.clone(), "tether0")),
			proxy: Arc::new(DesktopProxyRegistry::new(
				self.config.paths.home_dir.clone(),
				runner,
			)),
			keys: Arc::new(FileKeyStore),
			key_dir: self.config.paths.key_dir(),
		}
	}

	fn manager(&self) -> SessionManager {
		SessionManager::new(
			self.config.clone(),
			Arc::new(self.client.clone()),
			self.workstation(),
		)
	}

	fn teardown(&self) -> TeardownCoordinator {
		self
			.manager()
			.teardown_coordinator()
			.with_poll_interval(Duration::from_millis(5))
	}
}

fn connect_layer(dns_mode: &str, shared: bool) -> ConnectLayer {
	ConnectLayer {
		dns_mode: Some(dns_mode.to_string()),
		shared_shadow: Some(shared),
		cidrs: Some(vec!["10.96.0.0/12".to_string()]),
		..Default::default()
	}
}

fn service(name: &str, ip: &str, app: &str) -> Service {
	Service {
		metadata: ObjectMeta {
			name: Some(name.to_string()),
			..Default::default()
		},
		spec: Some(ServiceSpec {
			cluster_ip: Some(ip.to_string()),
			selector: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
			..Default::default()
		}),
		..Default::default()
	}
}

fn deployment(name: &str, replicas: i32) -> Deployment {
	let labels = BTreeMap::from([("app".to_string(), name.to_string())]);
	Deployment {
		metadata: ObjectMeta {
			name: Some(name.to_string()),
			..Default::default()
		},
		spec: Some(DeploymentSpec {
			replicas: Some(replicas),
			selector: LabelSelector {
				match_labels: Some(labels.clone()),
				..Default::default()
			},
			template: PodTemplateSpec {
				metadata: Some(ObjectMeta {
					labels: Some(labels),
					..Default::default()
				}),
				..Default::default()
			},
			..Default::default()
		}),
		..Default::default()
	}
}

fn shared_spec() -> ShadowSpec {
	ShadowSpec {
		name: SHARED_SHADOW_NAME.to_string(),
		namespace: NS.to_string(),
		component: ComponentKind::Connect,
		shared: true,
		image: "shadow:latest".to_string(),
		labels: role_labels(ROLE_CONNECT_SHADOW),
		annotations: BTreeMap::new(),
		env: BTreeMap::new(),
		ports: Vec::new(),
	}
}

fn pool(client: &MockK8sClient, key_dir: &Path) -> ShadowPool {
	let mut config = tether_config::ShadowConfig::default();
	config.ready_timeout = Duration::from_secs(1);
	config.poll_interval = Duration::from_millis(10);
	ShadowPool::new(
		Arc::new(client.clone()),
		Arc::new(FileKeyStore),
		key_dir,
		&config,
	)
}

fn selector_of(client: &MockK8sClient, name: &str) -> BTreeMap<String, String> {
	client
		.service(NS, name)
		.unwrap()
		.spec
		.unwrap()
		.selector
		.unwrap()
}

#[tokio::test]
async fn concurrent_shared_requests_create_one_pod() {
	let client = MockK8sClient::new();
	let dir = TempDir::new().unwrap();
	let first = pool(&client, &dir.path().join("a"));
	let second = pool(&client, &dir.path().join("b"));
	let spec = shared_spec();

	let (a, b) = tokio::join!(first.get_or_create(&spec), second.get_or_create(&spec));
	let (a, b) = (a.unwrap(), b.unwrap());

	assert_eq!(client.created_pods(), vec![SHARED_SHADOW_NAME.to_string()]);
	assert_eq!(a.ip, b.ip);
	assert_eq!(a.key_store, b.key_store);
	let pod = client.pod(NS, SHARED_SHADOW_NAME).unwrap();
	assert!(read_ref_count(&pod.metadata).unwrap() >= 2);
	assert_eq!(client.config_map_names(NS), vec![a.key_store.clone()]);
}

#[tokio::test]
async fn last_release_is_the_only_one_that_deletes() {
	let client = MockK8sClient::new();
	let dir = TempDir::new().unwrap();
	let pool = pool(&client, dir.path());
	for _ in 0..3 {
		pool.get_or_create(&shared_spec()).await.unwrap();
	}

	let mut results = Vec::new();
	for _ in 0..3 {
		results.push(
			decrease_ref(&client, SHARED_SHADOW_NAME, NS)
				.await
				.unwrap(),
		);
	}
	assert_eq!(results, vec![false, false, true]);
}

#[tokio::test]
async fn connect_dumps_hosts_and_teardown_removes_them() {
	let client = MockK8sClient::new();
	client.insert_service(NS, service("svc", "10.0.0.1", "svc"));
	client.insert_service(NS, service("headless", "None", "nothing"));
	let harness = Harness::new(&client, connect_layer("hosts", false), ExchangeLayer::default());
	std::fs::write(harness.hosts_path(), "127.0.0.1 localhost\n").unwrap();

	let manager = harness.manager();
	let session = manager.connect(&ConnectOptions::default()).await.unwrap();
	assert!(session.dns.dumped_hosts);

	let hosts = std::fs::read_to_string(harness.hosts_path()).unwrap();
	assert!(hosts.contains("10.0.0.1 svc\n"));
	assert!(hosts.contains("10.0.0.1 svc.dev\n"));
	assert!(hosts.contains("10.0.0.1 svc.dev.svc.cluster.local\n"));
	assert!(!hosts.contains("headless"));
	assert!(harness
		.runner
		.calls()
		.contains(&"ip route add 10.96.0.0/12 dev tether0".to_string()));

	let report = harness
		.teardown()
		.run(session.handle, std::future::pending())
		.await;
	assert!(report.is_clean(), "{report:?}");
	assert_eq!(
		std::fs::read_to_string(harness.hosts_path()).unwrap(),
		"127.0.0.1 localhost\n"
	);
	assert!(client.pod(NS, &session.endpoint.pod_name).is_none());
	assert!(client.config_map_names(NS).is_empty());
	assert!(!session.endpoint.private_key_path.exists());
	assert!(harness
		.runner
		.calls()
		.contains(&"ip link del tether0".to_string()));
}

#[tokio::test]
async fn local_dns_points_resolver_at_forwarder() {
	let client = MockK8sClient::new();
	let harness = Harness::new(&client, connect_layer("local-dns", false), ExchangeLayer::default());

	let session = harness
		.manager()
		.connect(&ConnectOptions::default())
		.await
		.unwrap();

	let expected_port = if cfg!(windows) { 53 } else { 10053 };
	assert_eq!(
		harness.local_dns.started.lock().unwrap().clone(),
		vec![(session.endpoint.ip.clone(), expected_port)]
	);
	let resolver = std::fs::read_to_string(harness.resolver_path()).unwrap();
	assert!(resolver.contains(&format!("DNS=127.0.0.1:{expected_port}")));

	harness
		.teardown()
		.run(session.handle, std::future::pending())
		.await;
	assert!(!harness.resolver_path().exists());
}

#[tokio::test]
async fn shared_connect_sessions_keep_shadow_until_last_teardown() {
	let client = MockK8sClient::new();
	let first = Harness::new(&client, connect_layer("pod-dns", true), ExchangeLayer::default());
	let second = Harness::new(&client, connect_layer("pod-dns", true), ExchangeLayer::default());

	let a = first.manager().connect(&ConnectOptions::default()).await.unwrap();
	let b = second.manager().connect(&ConnectOptions::default()).await.unwrap();
	assert_eq!(a.endpoint.pod_name, SHARED_SHADOW_NAME);
	assert_eq!(a.endpoint.ip, b.endpoint.ip);

	first.teardown().run(a.handle, std::future::pending()).await;
	assert!(client.pod(NS, SHARED_SHADOW_NAME).is_some());
	assert_eq!(client.config_map_names(NS).len(), 1);

	second.teardown().run(b.handle, std::future::pending()).await;
	assert!(client.pod(NS, SHARED_SHADOW_NAME).is_none());
	assert!(client.config_map_names(NS).is_empty());
}

async fn exchange_and_recover(ready: bool) -> (MockK8sClient, RecoveryOutcome) {
	let client = MockK8sClient::new();
	client.insert_deployment(NS, deployment("web", 3));
	let harness = Harness::new(
		&client,
		ConnectLayer::default(),
		ExchangeLayer {
			method: Some("scale".to_string()),
			recover_wait_secs: Some(15),
		},
	);

	let ports: PortMap = "8080".parse().unwrap();
	let session = harness.manager().exchange("web", &ports).await.unwrap();
	let shadow = session.endpoint.clone().unwrap();
	assert_eq!(client.scale_calls(), vec![("web".to_string(), 0)]);
	let shadow_pod = client.pod(NS, &shadow.pod_name).unwrap();
	assert_eq!(shadow_pod.metadata.labels.unwrap()["app"], "web");

	client.set_ready_after_scale(ready);
	let report = harness
		.teardown()
		.run(session.handle, std::future::pending())
		.await;
	assert!(client.pod(NS, &shadow.pod_name).is_none());
	(client, report.exchange.unwrap())
}

#[tokio::test]
async fn scale_recovery_restores_replicas_once() {
	let (client, outcome) = exchange_and_recover(true).await;
	assert_eq!(outcome, RecoveryOutcome::Ready);
	assert_eq!(
		client.scale_calls(),
		vec![("web".to_string(), 0), ("web".to_string(), 3)]
	);
}

#[tokio::test]
async fn scale_recovery_times_out_without_readiness() {
	let (client, outcome) = exchange_and_recover(false).await;
	assert_eq!(outcome, RecoveryOutcome::TimedOut);
	let restores: Vec<_> = client
		.scale_calls()
		.into_iter()
		.filter(|(_, replicas)| *replicas == 3)
		.collect();
	assert_eq!(restores.len(), 1);
}

#[tokio::test]
async fn ephemeral_exchange_leaves_pods_in_place() {
	let client = MockK8sClient::new();
	client.insert_deployment(NS, deployment("web", 2));
	for name in ["web-1", "web-2"] {
		client.insert_pod(
			NS,
			Pod {
				metadata: ObjectMeta {
					name: Some(name.to_string()),
					labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
					..Default::default()
				},
				..Default::default()
			},
		);
	}
	let harness = Harness::new(
		&client,
		ConnectLayer::default(),
		ExchangeLayer {
			method: Some("ephemeral".to_string()),
			..Default::default()
		},
	);

	let session = harness
		.manager()
		.exchange("web", &"8080".parse().unwrap())
		.await
		.unwrap();
	assert_eq!(session.pods, vec!["web-1", "web-2"]);

	let report = harness
		.teardown()
		.run(session.handle, std::future::pending())
		.await;
	assert!(report.is_clean());
	assert_eq!(client.ephemeral_removals().len(), 2);
	assert!(client.deleted_pods().is_empty());
	assert!(client.scale_calls().is_empty());
}

#[tokio::test]
async fn mesh_recovery_depends_on_router_owners() {
	let client = MockK8sClient::new();
	client.insert_service(NS, service("web", "10.0.0.1", "web"));
	let first = Harness::new(&client, ConnectLayer::default(), ExchangeLayer::default());
	let second = Harness::new(&client, ConnectLayer::default(), ExchangeLayer::default());
	let ports: PortMap = "80:8080".parse().unwrap();

	let a = first.manager().mesh("web", &ports, "v1").await.unwrap();
	let b = second.manager().mesh("web", &ports, "v2").await.unwrap();
	assert_eq!(a.router, "web-router");
	assert_eq!(selector_of(&client, "web"), router_labels("web"));
	assert!(client.service(NS, "web-tether-v1").is_some());

	let report = second.teardown().run(b.handle, std::future::pending()).await;
	assert_eq!(report.mesh, Some(MeshRecovery::VersionRemoved));
	assert_eq!(selector_of(&client, "web"), router_labels("web"));
	let (pod, command) = client.exec_calls().last().cloned().unwrap();
	assert_eq!(pod, "web-router");
	assert_eq!(command[1..], ["remove".to_string(), "v2".to_string()]);
	assert!(client.service(NS, "web-tether-v2").is_none());

	let report = first.teardown().run(a.handle, std::future::pending()).await;
	assert_eq!(report.mesh, Some(MeshRecovery::Restored));
	assert_eq!(selector_of(&client, "web")["app"], "web");
	assert!(client.service(NS, "web-origin").is_none());
	assert!(client.pod(NS, "web-router").is_none());
	assert!(client.pod(NS, &a.endpoint.pod_name).is_none());
}

#[tokio::test]
async fn teardown_without_marker_is_a_noop() {
	let client = MockK8sClient::new();
	let harness = Harness::new(&client, ConnectLayer::default(), ExchangeLayer::default());
	let coordinator = harness.teardown();
	let handle = SessionHandle {
		component: ComponentKind::Connect,
		pid: 12345,
	};

	for _ in 0..2 {
		let report = coordinator.run(handle, std::future::pending()).await;
		assert!(report.skipped);
		assert!(report.is_clean());
	}
	assert!(client.deleted_pods().is_empty());
	assert!(harness.runner.calls().is_empty());
}

#[tokio::test]
async fn missing_cluster_still_cleans_local_state() {
	let client = MockK8sClient::new();
	let harness = Harness::new(&client, ConnectLayer::default(), ExchangeLayer::default());
	let store = SessionStore::new(harness.config.paths.home_dir.clone());
	let mut state = RuntimeState::for_pid(ComponentKind::Exchange, NS, 777);
	state.shadows.push("web-tether-exchange-abcde".to_string());
	store.create(&state).unwrap();

	let coordinator = TeardownCoordinator::new(
		store.clone(),
		harness.workstation(),
		Arc::new(NoCluster),
		15,
	);
	let report = coordinator.run(state.handle(), std::future::pending()).await;

	assert_eq!(report.failures, vec!["cluster client"]);
	assert_eq!(report.leftovers, vec!["pod/web-tether-exchange-abcde"]);
	assert!(!store.has_marker(state.handle()));
	assert!(store.load(state.handle()).unwrap().is_none());
}

#[tokio::test]
async fn failed_setup_is_reversed_by_teardown() {
	let client = MockK8sClient::new();
	client.insert_deployment(NS, deployment("web", 1));
	client.set_new_pod_phase("Failed");
	let harness = Harness::new(&client, ConnectLayer::default(), ExchangeLayer::default());

	let manager = harness.manager();
	let err = manager
		.exchange("web", &"8080".parse().unwrap())
		.await
		.unwrap_err();
	assert!(matches!(err, SessionError::PodFailed { .. }));
	assert!(client.scale_calls().is_empty());

	let handle = SessionManager::handle(ComponentKind::Exchange);
	assert!(manager.store().has_marker(handle));
	let report = harness.teardown().run(handle, std::future::pending()).await;
	assert!(!report.skipped);
	assert!(report.exchange.is_none());
	assert!(!manager.store().has_marker(handle));
}

fn key_files(harness: &Harness) -> usize {
	std::fs::read_dir(harness.config.paths.key_dir())
		.map(|dir| dir.count())
		.unwrap_or(0)
}

/// Run `setup` until it finishes or `after` elapses, whichever comes first.
async fn interrupt_after<F: std::future::Future>(setup: F, after: Duration) -> Option<F::Output> {
	tokio::select! {
		out = setup => Some(out),
		_ = tokio::time::sleep(after) => None,
	}
}

#[tokio::test]
async fn connect_interrupted_before_ready_is_reversed_by_teardown() {
	let client = MockK8sClient::new();
	client.set_new_pod_phase("Pending");
	let harness = Harness::new(&client, connect_layer("pod-dns", false), ExchangeLayer::default());
	let manager = harness.manager();

	let finished = interrupt_after(
		manager.connect(&ConnectOptions::default()),
		Duration::from_millis(100),
	)
	.await;
	assert!(finished.is_none());
	let created = client.created_pods();
	assert_eq!(created.len(), 1);
	assert_eq!(client.config_map_names(NS).len(), 1);
	assert_eq!(key_files(&harness), 1);

	let handle = SessionManager::handle(ComponentKind::Connect);
	let state = manager.store().load(handle).unwrap().unwrap();
	assert_eq!(state.shadows, created);
	assert_eq!(state.key_stores, client.config_map_names(NS));

	harness.teardown().run(handle, std::future::pending()).await;
	assert!(client.pod(NS, &created[0]).is_none());
	assert!(client.config_map_names(NS).is_empty());
	assert_eq!(key_files(&harness), 0);
	assert!(!manager.store().has_marker(handle));
}

#[tokio::test]
async fn interrupted_shared_attach_gives_back_its_reference() {
	let client = MockK8sClient::new();
	client.set_new_pod_phase("Pending");
	let first = Harness::new(&client, connect_layer("pod-dns", true), ExchangeLayer::default());
	let second = Harness::new(&client, connect_layer("pod-dns", true), ExchangeLayer::default());
	let handle = SessionManager::handle(ComponentKind::Connect);
	let wait = Duration::from_millis(100);

	let first_manager = first.manager();
	let second_manager = second.manager();
	assert!(interrupt_after(first_manager.connect(&ConnectOptions::default()), wait)
		.await
		.is_none());
	assert!(interrupt_after(second_manager.connect(&ConnectOptions::default()), wait)
		.await
		.is_none());
	let pod = client.pod(NS, SHARED_SHADOW_NAME).unwrap();
	assert_eq!(read_ref_count(&pod.metadata).unwrap(), 2);

	second.teardown().run(handle, std::future::pending()).await;
	let pod = client.pod(NS, SHARED_SHADOW_NAME).unwrap();
	assert_eq!(read_ref_count(&pod.metadata).unwrap(), 1);
	assert_eq!(client.config_map_names(NS).len(), 1);
	assert_eq!(key_files(&second), 0);

	first.teardown().run(handle, std::future::pending()).await;
	assert!(client.pod(NS, SHARED_SHADOW_NAME).is_none());
	assert!(client.config_map_names(NS).is_empty());
	assert_eq!(key_files(&first), 0);
}

#[tokio::test]
async fn partial_ephemeral_injection_is_recovered() {
	let client = MockK8sClient::new();
	client.insert_deployment(NS, deployment("web", 2));
	for name in ["web-1", "web-2"] {
		client.insert_pod(
			NS,
			Pod {
				metadata: ObjectMeta {
					name: Some(name.to_string()),
					labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
					..Default::default()
				},
				..Default::default()
			},
		);
	}
	client.fail_ephemeral_add_in("web-2");
	let harness = Harness::new(
		&client,
		ConnectLayer::default(),
		ExchangeLayer {
			method: Some("ephemeral".to_string()),
			..Default::default()
		},
	);

	let manager = harness.manager();
	assert!(manager
		.exchange("web", &"8080".parse().unwrap())
		.await
		.is_err());
	let handle = SessionManager::handle(ComponentKind::Exchange);
	let state = manager.store().load(handle).unwrap().unwrap();
	assert_eq!(state.shadows, vec!["web-1"]);

	harness.teardown().run(handle, std::future::pending()).await;
	let removed: Vec<String> = client
		.ephemeral_removals()
		.into_iter()
		.map(|(_, pod)| pod)
		.collect();
	assert_eq!(removed, vec!["web-1"]);
}
