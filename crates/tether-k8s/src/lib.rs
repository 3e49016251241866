// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! K8s object store abstraction for tether sessions.
//!
//! This crate provides:
//! - A trait-based K8s client abstraction for testability
//! - Production implementation using the kube crate
//! - An in-memory mock with optimistic concurrency for tests
//! - Common types and helpers for pods, services and selectors
//!
//! # Example
//!
//! ```
//! use tether_k8s::{pod_phase, K8sClient, MockK8sClient, ObjectMeta, Pod};
//!
//! # tokio_test::block_on(async {
//! let client = MockK8sClient::new();
//! let pod = Pod {
//!     metadata: ObjectMeta {
//!         name: Some("web".to_string()),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! client.create_pod("dev", pod).await.unwrap();
//!
//! let pod = client.get_pod("web", "dev").await.unwrap();
//! assert_eq!(pod_phase(&pod), "Running");
//! # });
//! ```

mod client;
mod error;
mod kube_client;
mod mock;
mod types;

pub use client::K8sClient;
pub use error::{K8sError, K8sResult};
pub use kube_client::KubeClient;
pub use mock::MockK8sClient;
pub use types::{
	label_selector, parse_label_selector, pod_ip, pod_is_ready, pod_phase, ConfigMap,
	ConfigMapVolumeSource, Container, ContainerPort, Deployment, DeploymentSpec, DeploymentStatus,
	EnvVar, EphemeralContainer, ExecOutput, LabelSelector, Namespace, ObjectMeta, Pod, PodSpec,
	PodStatus, PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
