// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Hosts file writer.
//!
//! Entries are kept in one marker-delimited block so they can be removed
//! without touching anything else in the file. Dropping the block restores
//! the file byte for byte: line endings, blank lines and a missing final
//! newline all survive.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::Result;

const BLOCK_BEGIN: &str = "# tether begin";
const BLOCK_END: &str = "# tether end";
/// Opens a block that had to add a line break after an unterminated last line.
const BLOCK_BEGIN_JOINED: &str = "# tether begin (newline added)";

pub trait HostsWriter: Send + Sync {
	/// Replace any previously dumped entries with `hosts` (hostname to IP).
	fn dump_hosts(&self, hosts: &BTreeMap<String, String>) -> Result<()>;

	/// Remove exactly the entries previously dumped.
	fn drop_hosts(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct HostsFile {
	path: PathBuf,
}

impl HostsFile {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	/// The operating system's hosts file.
	pub fn system() -> Self {
		if cfg!(windows) {
			Self::new(r"C:\Windows\System32\drivers\etc\hosts")
		} else {
			Self::new("/etc/hosts")
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn read(&self) -> Result<String> {
		match std::fs::read_to_string(&self.path) {
			Ok(content) => Ok(content),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
			Err(e) => Err(e.into()),
		}
	}
}

fn line_ending(content: &str) -> &'static str {
	if content.contains("\r\n") {
		"\r\n"
	} else {
		"\n"
	}
}

/// Strip the tether block, leaving every other byte as it was.
fn strip_block(content: &str) -> String {
	let mut out = String::with_capacity(content.len());
	let mut inside = false;
	for line in content.split_inclusive('\n') {
		match line.trim() {
			BLOCK_BEGIN => inside = true,
			BLOCK_BEGIN_JOINED => {
				inside = true;
				if out.ends_with("\r\n") {
					out.truncate(out.len() - 2);
				} else if out.ends_with('\n') {
					out.pop();
				}
			}
			BLOCK_END if inside => inside = false,
			_ if inside => {}
			_ => out.push_str(line),
		}
	}
	out
}

impl HostsWriter for HostsFile {
	fn dump_hosts(&self, hosts: &BTreeMap<String, String>) -> Result<()> {
		let mut content = strip_block(&self.read()?);
		if !hosts.is_empty() {
			let eol = line_ending(&content);
			if content.is_empty() || content.ends_with('\n') {
				content.push_str(BLOCK_BEGIN);
			} else {
				content.push_str(eol);
				content.push_str(BLOCK_BEGIN_JOINED);
			}
			content.push_str(eol);
			for (host, ip) in hosts {
				content.push_str(&format!("{ip} {host}{eol}"));
			}
			content.push_str(BLOCK_END);
			content.push_str(eol);
		}
		std::fs::write(&self.path, content)?;
		info!(path = %self.path.display(), entries = hosts.len(), "hosts entries written");
		Ok(())
	}

	fn drop_hosts(&self) -> Result<()> {
		let original = self.read()?;
		let stripped = strip_block(&original);
		if stripped == original {
			debug!(path = %self.path.display(), "no tether hosts entries to drop");
			return Ok(());
		}
		std::fs::write(&self.path, stripped)?;
		info!(path = %self.path.display(), "hosts entries dropped");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	const ORIGINAL: &str = "127.0.0.1 localhost\n::1 localhost\n";

	fn hosts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
		pairs
			.iter()
			.map(|(h, ip)| (h.to_string(), ip.to_string()))
			.collect()
	}

	#[test]
	fn dump_then_drop_restores_original() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("hosts");
		std::fs::write(&path, ORIGINAL).unwrap();
		let file = HostsFile::new(&path);

		file
			.dump_hosts(&hosts(&[("web", "10.0.0.1"), ("web.dev", "10.0.0.1")]))
			.unwrap();
		let written = std::fs::read_to_string(&path).unwrap();
		assert!(written.starts_with(ORIGINAL));
		assert!(written.contains("# tether begin\n10.0.0.1 web\n10.0.0.1 web.dev\n# tether end\n"));

		file.drop_hosts().unwrap();
		assert_eq!(std::fs::read_to_string(&path).unwrap(), ORIGINAL);
	}

	#[test]
	fn dump_replaces_previous_block() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("hosts");
		std::fs::write(&path, ORIGINAL).unwrap();
		let file = HostsFile::new(&path);

		file.dump_hosts(&hosts(&[("old", "10.0.0.9")])).unwrap();
		file.dump_hosts(&hosts(&[("new", "10.0.0.2")])).unwrap();

		let written = std::fs::read_to_string(&path).unwrap();
		assert!(!written.contains("old"));
		assert_eq!(written.matches(BLOCK_BEGIN).count(), 1);
	}

	#[test]
	fn drop_leaves_foreign_entries_alone() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("hosts");
		let content = format!("{ORIGINAL}\n{BLOCK_BEGIN}\n10.0.0.1 web\n{BLOCK_END}\n192.168.1.5 nas\n");
		std::fs::write(&path, content).unwrap();

		HostsFile::new(&path).drop_hosts().unwrap();
		let written = std::fs::read_to_string(&path).unwrap();
		assert!(written.contains("192.168.1.5 nas"));
		assert!(written.contains("127.0.0.1 localhost"));
		assert!(!written.contains("10.0.0.1 web"));
	}

	#[test]
	fn drop_without_block_is_noop() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("hosts");
		std::fs::write(&path, ORIGINAL).unwrap();

		HostsFile::new(&path).drop_hosts().unwrap();
		HostsFile::new(&path).drop_hosts().unwrap();
		assert_eq!(std::fs::read_to_string(&path).unwrap(), ORIGINAL);
	}

	fn round_trip(original: &str) -> String {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("hosts");
		std::fs::write(&path, original).unwrap();
		let file = HostsFile::new(&path);

		file.dump_hosts(&hosts(&[("web", "10.0.0.1")])).unwrap();
		let dumped = std::fs::read_to_string(&path).unwrap();
		file.drop_hosts().unwrap();
		assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
		dumped
	}

	#[test]
	fn crlf_file_keeps_its_line_endings() {
		let dumped = round_trip("127.0.0.1 localhost\r\n::1 localhost\r\n");
		assert!(dumped.ends_with("# tether begin\r\n10.0.0.1 web\r\n# tether end\r\n"));
	}

	#[test]
	fn missing_final_newline_survives() {
		let dumped = round_trip("127.0.0.1 localhost");
		assert_eq!(
			dumped,
			"127.0.0.1 localhost\n# tether begin (newline added)\n10.0.0.1 web\n# tether end\n"
		);
	}

	#[test]
	fn blank_lines_survive() {
		round_trip("127.0.0.1 localhost\n\n\n");
		round_trip("\n127.0.0.1 localhost\n\n# comment\n\n");
		round_trip("");
	}

	#[test]
	fn repeated_dumps_on_unterminated_file_stay_reversible() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("hosts");
		std::fs::write(&path, "127.0.0.1 localhost").unwrap();
		let file = HostsFile::new(&path);

		file.dump_hosts(&hosts(&[("old", "10.0.0.9")])).unwrap();
		file.dump_hosts(&hosts(&[("new", "10.0.0.2")])).unwrap();
		file.drop_hosts().unwrap();
		assert_eq!(std::fs::read_to_string(&path).unwrap(), "127.0.0.1 localhost");
	}
}
