// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Local command execution.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::{Result, SessionError};

#[async_trait]
pub trait CommandRunner: Send + Sync {
	/// Run a program to completion and return its stdout.
	///
	/// A non-zero exit status is an error carrying stderr.
	async fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Runs commands on the local machine.
#[derive(Debug, Default, Clone)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
	#[instrument(skip(self), fields(program = %program))]
	async fn run(&self, program: &str, args: &[String]) -> Result<String> {
		let output = Command::new(program).args(args).output().await?;
		let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
		if !output.status.success() {
			return Err(SessionError::Command {
				command: render(program, args),
				message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
			});
		}
		debug!(status = %output.status, "command finished");
		Ok(stdout)
	}
}

fn render(program: &str, args: &[String]) -> String {
	std::iter::once(program.to_string())
		.chain(args.iter().cloned())
		.collect::<Vec<_>>()
		.join(" ")
}

/// Records commands instead of running them.
#[derive(Debug, Default, Clone)]
pub struct RecordingRunner {
	calls: Arc<Mutex<Vec<String>>>,
	failing: Arc<Mutex<Vec<String>>>,
}

impl RecordingRunner {
	pub fn new() -> Self {
		Self::default()
	}

	/// Fail every command whose rendered form contains `pattern`.
	pub fn fail_when(&self, pattern: &str) {
		if let Ok(mut failing) = self.failing.lock() {
			failing.push(pattern.to_string());
		}
	}

	pub fn calls(&self) -> Vec<String> {
		self.calls.lock().map(|c| c.clone()).unwrap_or_default()
	}
}

#[async_trait]
impl CommandRunner for RecordingRunner {
	async fn run(&self, program: &str, args: &[String]) -> Result<String> {
		let rendered = render(program, args);
		if let Ok(mut calls) = self.calls.lock() {
			calls.push(rendered.clone());
		}
		let fails = self
			.failing
			.lock()
			.map(|f| f.iter().any(|p| rendered.contains(p.as_str())))
			.unwrap_or(false);
		if fails {
			return Err(SessionError::Command {
				command: rendered,
				message: "exit status 1".to_string(),
			});
		}
		Ok(String::new())
	}
}

/// Build an argument vector from string slices.
pub fn args(parts: &[&str]) -> Vec<String> {
	parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn recording_runner_records_and_fails_on_pattern() {
		let runner = RecordingRunner::new();
		runner.fail_when("route add");

		runner.run("ip", &args(&["link", "del", "tun0"])).await.unwrap();
		let err = runner
			.run("ip", &args(&["route", "add", "10.96.0.0/12"]))
			.await
			.unwrap_err();
		assert!(matches!(err, SessionError::Command { .. }));
		assert_eq!(
			runner.calls(),
			vec!["ip link del tun0", "ip route add 10.96.0.0/12"]
		);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn system_runner_reports_failures() {
		let runner = SystemCommandRunner;
		assert!(runner.run("true", &[]).await.is_ok());
		assert!(runner.run("false", &[]).await.is_err());
	}
}
