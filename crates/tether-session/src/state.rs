// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Runtime state of a session and its on-disk store.
//!
//! Each session owns two files in the tether home directory:
//! `<component>-<pid>.pid` (the marker teardown checks first) and
//! `<component>-<pid>.json` (the serialized [`RuntimeState`]). The state file
//! is rewritten as setup progresses so a later `tether clean` can reverse a
//! session whose process died.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tether_config::{ConnectMethod, ExchangeMethod};
use tracing::{debug, warn};

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
	Connect,
	Exchange,
	Mesh,
}

impl ComponentKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ComponentKind::Connect => "connect",
			ComponentKind::Exchange => "exchange",
			ComponentKind::Mesh => "mesh",
		}
	}
}

impl fmt::Display for ComponentKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ComponentKind {
	type Err = SessionError;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"connect" => Ok(ComponentKind::Connect),
			"exchange" => Ok(ComponentKind::Exchange),
			"mesh" => Ok(ComponentKind::Mesh),
			other => Err(SessionError::InvalidArgument(format!(
				"unknown component '{other}'"
			))),
		}
	}
}

/// Proxy settings a connect session applied to the workstation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRecord {
	pub socks_port: u16,
	pub global: bool,
	#[serde(default)]
	pub env_file: Option<PathBuf>,
}

/// The cluster-side and local footprint of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeState {
	pub component: ComponentKind,
	pub pid: u32,
	pub namespace: String,
	#[serde(default)]
	pub shadows: Vec<String>,
	#[serde(default)]
	pub shared_shadow: bool,
	#[serde(default)]
	pub key_stores: Vec<String>,
	#[serde(default)]
	pub origin: Option<String>,
	#[serde(default)]
	pub replicas: i32,
	#[serde(default)]
	pub exchange_method: Option<ExchangeMethod>,
	#[serde(default)]
	pub router: Option<String>,
	#[serde(default)]
	pub mesh_version: Option<String>,
	#[serde(default)]
	pub service: Option<String>,
	#[serde(default)]
	pub dump_to_hosts: bool,
	#[serde(default)]
	pub connect_method: Option<ConnectMethod>,
	#[serde(default)]
	pub tun_device: Option<String>,
	#[serde(default)]
	pub name_server_set: bool,
	#[serde(default)]
	pub proxy: Option<ProxyRecord>,
	#[serde(default)]
	pub scratch_files: Vec<PathBuf>,
}

impl RuntimeState {
	/// Fresh state for the current process.
	pub fn new(component: ComponentKind, namespace: impl Into<String>) -> Self {
		Self::for_pid(component, namespace, std::process::id())
	}

	pub fn for_pid(component: ComponentKind, namespace: impl Into<String>, pid: u32) -> Self {
		Self {
			component,
			pid,
			namespace: namespace.into(),
			shadows: Vec::new(),
			shared_shadow: false,
			key_stores: Vec::new(),
			origin: None,
			replicas: 0,
			exchange_method: None,
			router: None,
			mesh_version: None,
			service: None,
			dump_to_hosts: false,
			connect_method: None,
			tun_device: None,
			name_server_set: false,
			proxy: None,
			scratch_files: Vec::new(),
		}
	}

	pub fn handle(&self) -> SessionHandle {
		SessionHandle {
			component: self.component,
			pid: self.pid,
		}
	}

	/// Cluster objects this session may have left behind, for operator messages.
	pub fn cluster_footprint(&self) -> Vec<String> {
		let mut objects: Vec<String> = Vec::new();
		objects.extend(self.shadows.iter().map(|s| format!("pod/{s}")));
		objects.extend(self.key_stores.iter().map(|s| format!("configmap/{s}")));
		if let Some(router) = &self.router {
			objects.push(format!("pod/{router}"));
		}
		if let Some(service) = &self.service {
			objects.push(format!("service/{service}"));
		}
		if let Some(origin) = &self.origin {
			objects.push(format!("deployment/{origin}"));
		}
		objects
	}
}

/// Identifies a session by component and owning process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
	pub component: ComponentKind,
	pub pid: u32,
}

impl fmt::Display for SessionHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}-{}", self.component, self.pid)
	}
}

/// Files in the tether home directory that describe live sessions.
#[derive(Debug, Clone)]
pub struct SessionStore {
	home: PathBuf,
}

impl SessionStore {
	pub fn new(home: impl Into<PathBuf>) -> Self {
		Self { home: home.into() }
	}

	pub fn home(&self) -> &Path {
		&self.home
	}

	pub fn marker_path(&self, handle: SessionHandle) -> PathBuf {
		self.home.join(format!("{handle}.pid"))
	}

	pub fn state_path(&self, handle: SessionHandle) -> PathBuf {
		self.home.join(format!("{handle}.json"))
	}

	/// Write the marker and the initial state of a new session.
	pub fn create(&self, state: &RuntimeState) -> Result<()> {
		std::fs::create_dir_all(&self.home)?;
		let handle = state.handle();
		std::fs::write(self.marker_path(handle), format!("{}\n", state.pid))?;
		self.save(state)?;
		debug!(session = %handle, "session marker created");
		Ok(())
	}

	/// Persist the current state, replacing any previous copy atomically.
	pub fn save(&self, state: &RuntimeState) -> Result<()> {
		let path = self.state_path(state.handle());
		let tmp = path.with_extension("json.tmp");
		std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
		std::fs::rename(&tmp, &path)?;
		Ok(())
	}

	pub fn has_marker(&self, handle: SessionHandle) -> bool {
		self.marker_path(handle).exists()
	}

	pub fn load(&self, handle: SessionHandle) -> Result<Option<RuntimeState>> {
		let path = self.state_path(handle);
		match std::fs::read(&path) {
			Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	/// Remove the marker. Returns false when it was already gone.
	pub fn remove_marker(&self, handle: SessionHandle) -> Result<bool> {
		remove_if_exists(&self.marker_path(handle))
	}

	pub fn remove_state(&self, handle: SessionHandle) -> Result<bool> {
		remove_if_exists(&self.state_path(handle))
	}

	/// All sessions that still have a marker file.
	pub fn list(&self) -> Result<Vec<SessionHandle>> {
		let entries = match std::fs::read_dir(&self.home) {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(e.into()),
		};

		let mut sessions = Vec::new();
		for entry in entries {
			let entry = entry?;
			let file_name = entry.file_name();
			let Some(name) = file_name.to_str() else {
				continue;
			};
			match parse_marker_name(name) {
				Some(handle) => sessions.push(handle),
				None if name.ends_with(".pid") => {
					warn!(file = %name, "ignoring unrecognised marker file");
				}
				None => {}
			}
		}
		sessions.sort_by_key(|h| (h.pid, h.component.as_str()));
		Ok(sessions)
	}

	/// Sessions whose owning process no longer runs.
	pub fn stale(&self) -> Result<Vec<SessionHandle>> {
		Ok(self
			.list()?
			.into_iter()
			.filter(|h| !process_alive(h.pid))
			.collect())
	}
}

fn parse_marker_name(name: &str) -> Option<SessionHandle> {
	let stem = name.strip_suffix(".pid")?;
	let (component, pid) = stem.rsplit_once('-')?;
	Some(SessionHandle {
		component: component.parse().ok()?,
		pid: pid.parse().ok()?,
	})
}

fn remove_if_exists(path: &Path) -> Result<bool> {
	match std::fs::remove_file(path) {
		Ok(()) => Ok(true),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
		Err(e) => Err(e.into()),
	}
}

/// Whether a process with this pid is still running.
#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
	Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn process_alive(pid: u32) -> bool {
	std::process::Command::new("kill")
		.args(["-0", &pid.to_string()])
		.stdout(std::process::Stdio::null())
		.stderr(std::process::Stdio::null())
		.status()
		.map(|s| s.success())
		.unwrap_or(true)
}

#[cfg(windows)]
pub fn process_alive(pid: u32) -> bool {
	std::process::Command::new("tasklist")
		.args(["/FI", &format!("PID eq {pid}"), "/NH"])
		.output()
		.map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
		.unwrap_or(true)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn create_load_and_remove() {
		let dir = TempDir::new().unwrap();
		let store = SessionStore::new(dir.path());
		let mut state = RuntimeState::for_pid(ComponentKind::Mesh, "dev", 4242);
		state.router = Some("web-router".to_string());
		state.mesh_version = Some("v1".to_string());

		store.create(&state).unwrap();
		let handle = state.handle();
		assert!(store.has_marker(handle));
		assert_eq!(store.marker_path(handle), dir.path().join("mesh-4242.pid"));
		assert_eq!(store.load(handle).unwrap(), Some(state));

		assert!(store.remove_marker(handle).unwrap());
		assert!(!store.remove_marker(handle).unwrap());
		assert!(!store.has_marker(handle));
	}

	#[test]
	fn save_overwrites_previous_state() {
		let dir = TempDir::new().unwrap();
		let store = SessionStore::new(dir.path());
		let mut state = RuntimeState::for_pid(ComponentKind::Connect, "dev", 7);
		store.create(&state).unwrap();

		state.shadows.push("tether-shadow-daemon".to_string());
		store.save(&state).unwrap();

		let loaded = store.load(state.handle()).unwrap().unwrap();
		assert_eq!(loaded.shadows, vec!["tether-shadow-daemon".to_string()]);
	}

	#[test]
	fn list_parses_markers_and_ignores_other_files() {
		let dir = TempDir::new().unwrap();
		std::fs::write(dir.path().join("connect-10.pid"), "10").unwrap();
		std::fs::write(dir.path().join("exchange-3.pid"), "3").unwrap();
		std::fs::write(dir.path().join("exchange-3.json"), "{}").unwrap();
		std::fs::write(dir.path().join("garbage.pid"), "").unwrap();
		std::fs::write(dir.path().join("proxy.env"), "").unwrap();

		let store = SessionStore::new(dir.path());
		let handles = store.list().unwrap();
		assert_eq!(
			handles,
			vec![
				SessionHandle {
					component: ComponentKind::Exchange,
					pid: 3
				},
				SessionHandle {
					component: ComponentKind::Connect,
					pid: 10
				},
			]
		);
	}

	#[test]
	fn list_of_missing_home_is_empty() {
		let store = SessionStore::new("/nonexistent/tether-home");
		assert!(store.list().unwrap().is_empty());
	}

	#[test]
	fn old_state_files_load_with_defaults() {
		let dir = TempDir::new().unwrap();
		std::fs::write(
			dir.path().join("exchange-9.json"),
			r#"{"component":"exchange","pid":9,"namespace":"dev","origin":"web","replicas":3}"#,
		)
		.unwrap();

		let store = SessionStore::new(dir.path());
		let state = store
			.load(SessionHandle {
				component: ComponentKind::Exchange,
				pid: 9,
			})
			.unwrap()
			.unwrap();
		assert_eq!(state.origin.as_deref(), Some("web"));
		assert_eq!(state.replicas, 3);
		assert!(state.shadows.is_empty());
	}

	#[test]
	fn current_process_is_alive() {
		assert!(process_alive(std::process::id()));
	}

	#[test]
	fn footprint_names_cluster_objects() {
		let mut state = RuntimeState::for_pid(ComponentKind::Exchange, "dev", 1);
		state.shadows = vec!["web-tether-exchange-abcde".to_string()];
		state.key_stores = vec!["tether-exchange-key-abcde".to_string()];
		state.origin = Some("web".to_string());
		assert_eq!(
			state.cluster_footprint(),
			vec![
				"pod/web-tether-exchange-abcde".to_string(),
				"configmap/tether-exchange-key-abcde".to_string(),
				"deployment/web".to_string(),
			]
		);
	}
}
