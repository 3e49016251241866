// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reference counts on shared pods.
//!
//! The count lives in an annotation and is only ever changed through a
//! replace guarded by the pod's `resourceVersion`. A conflict means another
//! process got there first, so the pod is fetched again and the change is
//! reapplied.
//!
//! ```
//! use std::collections::BTreeMap;
//! use tether_k8s::{K8sClient, MockK8sClient, ObjectMeta, Pod};
//! use tether_session::names::REF_COUNT_ANNOTATION;
//! use tether_session::refcount::{decrease_ref, increase_ref};
//!
//! # tokio_test::block_on(async {
//! let client = MockK8sClient::new();
//! client.insert_pod("dev", Pod {
//!     metadata: ObjectMeta {
//!         name: Some("shared".to_string()),
//!         annotations: Some(BTreeMap::from([(REF_COUNT_ANNOTATION.to_string(), "1".to_string())])),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! });
//!
//! assert_eq!(increase_ref(&client, "shared", "dev").await.unwrap(), 2);
//! assert!(!decrease_ref(&client, "shared", "dev").await.unwrap());
//! assert!(decrease_ref(&client, "shared", "dev").await.unwrap());
//! # });
//! ```

use tether_k8s::{K8sClient, K8sError};
use tracing::{debug, instrument};

use crate::annotations::{read_ref_count, write_ref_count};
use crate::error::{Result, SessionError};

pub const MAX_REF_ATTEMPTS: usize = 10;

/// Increment the count on `name` and return the new value.
#[instrument(skip(client))]
pub async fn increase_ref(client: &dyn K8sClient, name: &str, namespace: &str) -> Result<i64> {
	update_ref(client, name, namespace, 1).await
}

/// Decrement the count on `name`.
///
/// Returns true when the count reached zero or below, meaning the caller was
/// the last owner and must delete the pod.
#[instrument(skip(client))]
pub async fn decrease_ref(client: &dyn K8sClient, name: &str, namespace: &str) -> Result<bool> {
	let count = update_ref(client, name, namespace, -1).await?;
	Ok(count <= 0)
}

async fn update_ref(client: &dyn K8sClient, name: &str, namespace: &str, delta: i64) -> Result<i64> {
	for attempt in 1..=MAX_REF_ATTEMPTS {
		let mut pod = client.get_pod(name, namespace).await?;
		let count = read_ref_count(&pod.metadata)? + delta;
		write_ref_count(&mut pod.metadata, count);

		match client.replace_pod(namespace, pod).await {
			Ok(_) => {
				debug!(pod = %name, count, "reference count updated");
				return Ok(count);
			}
			Err(K8sError::Conflict { .. }) => {
				debug!(pod = %name, attempt, "reference count update conflicted, retrying");
			}
			Err(e) => return Err(e.into()),
		}
	}

	Err(SessionError::RefCountExhausted {
		name: name.to_string(),
		attempts: MAX_REF_ATTEMPTS,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::names::REF_COUNT_ANNOTATION;
	use std::collections::BTreeMap;
	use tether_k8s::{MockK8sClient, ObjectMeta, Pod};

	fn shared_pod(count: &str) -> Pod {
		Pod {
			metadata: ObjectMeta {
				name: Some("tether-shadow-daemon".to_string()),
				annotations: Some(BTreeMap::from([(
					REF_COUNT_ANNOTATION.to_string(),
					count.to_string(),
				)])),
				..Default::default()
			},
			..Default::default()
		}
	}

	#[tokio::test]
	async fn increase_then_decrease() {
		let client = MockK8sClient::new();
		client.insert_pod("dev", shared_pod("1"));

		assert_eq!(
			increase_ref(&client, "tether-shadow-daemon", "dev")
				.await
				.unwrap(),
			2
		);
		assert!(!decrease_ref(&client, "tether-shadow-daemon", "dev")
			.await
			.unwrap());
		assert!(decrease_ref(&client, "tether-shadow-daemon", "dev")
			.await
			.unwrap());
	}

	#[tokio::test]
	async fn conflicts_are_retried() {
		let client = MockK8sClient::new();
		client.insert_pod("dev", shared_pod("1"));
		client.inject_conflicts(3);

		let count = increase_ref(&client, "tether-shadow-daemon", "dev")
			.await
			.unwrap();
		assert_eq!(count, 2);
		assert_eq!(client.replace_attempts(), 4);
	}

	#[tokio::test]
	async fn retries_are_bounded() {
		let client = MockK8sClient::new();
		client.insert_pod("dev", shared_pod("1"));
		client.inject_conflicts(MAX_REF_ATTEMPTS as u32 + 1);

		let err = increase_ref(&client, "tether-shadow-daemon", "dev")
			.await
			.unwrap_err();
		assert!(matches!(err, SessionError::RefCountExhausted { attempts, .. } if attempts == MAX_REF_ATTEMPTS));
	}

	#[tokio::test]
	async fn concurrent_updates_do_not_lose_increments() {
		let client = MockK8sClient::new();
		client.insert_pod("dev", shared_pod("1"));

		let mut handles = Vec::new();
		for _ in 0..4 {
			let client = client.clone();
			handles.push(tokio::spawn(async move {
				increase_ref(&client, "tether-shadow-daemon", "dev").await
			}));
		}
		for handle in handles {
			handle.await.unwrap().unwrap();
		}

		let pod = client.pod("dev", "tether-shadow-daemon").unwrap();
		assert_eq!(read_ref_count(&pod.metadata).unwrap(), 5);
	}

	#[tokio::test]
	async fn missing_pod_is_not_found() {
		let client = MockK8sClient::new();
		let err = decrease_ref(&client, "gone", "dev").await.unwrap_err();
		assert!(err.is_not_found());
	}
}
