// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use tether_config::TetherConfig;
use tether_session::{SessionStore, TeardownCoordinator};
use tracing::{info, warn};

use super::{workstation, KubeClients};

/// Tear down every session whose owning process is gone.
pub async fn run(config: TetherConfig) -> anyhow::Result<()> {
	let store = SessionStore::new(config.paths.home_dir.clone());
	let stale = store.stale()?;
	if stale.is_empty() {
		info!(home = %store.home().display(), "no stale sessions");
		return Ok(());
	}

	let coordinator = TeardownCoordinator::new(
		store,
		workstation(&config),
		Arc::new(KubeClients),
		config.exchange.recover_wait_secs,
	);
	let mut dirty = 0;
	for handle in stale {
		info!(session = %handle, "cleaning stale session");
		let report = coordinator
			.run(handle, async {
				let _ = tokio::signal::ctrl_c().await;
			})
			.await;
		if !report.is_clean() {
			dirty += 1;
			warn!(session = %handle, failed = %report.failures.join(", "), "stale session cleaned with errors");
		}
	}
	if dirty > 0 {
		warn!(sessions = dirty, "some sessions need manual cleanup");
	}
	Ok(())
}
