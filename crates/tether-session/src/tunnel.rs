// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Tun device driver.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::command::{args, CommandRunner};
use crate::error::{Result, SessionError};

pub const DEFAULT_DEVICE: &str = "tether0";
pub const WINDOWS_DEVICE: &str = "TetherTunnel";

#[async_trait]
pub trait TunnelDriver: Send + Sync {
	fn device_name(&self) -> &str;

	async fn create_device(&self) -> Result<()>;

	async fn remove_device(&self) -> Result<()>;

	/// Route each range through the device. Every range is attempted; the
	/// last failure is returned.
	async fn set_route(&self, ip_ranges: &[String]) -> Result<()>;

	async fn set_dns_server(&self, addresses: &[String]) -> Result<()>;
}

/// Split `10.96.0.0/12` into the address and a dotted netmask.
pub fn ip_and_mask(range: &str) -> Result<(String, String)> {
	let invalid = || SessionError::InvalidArgument(format!("invalid ip range '{range}'"));
	let (addr, prefix) = range.split_once('/').ok_or_else(invalid)?;
	let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
	let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
	if prefix > 32 {
		return Err(invalid());
	}
	let mask = if prefix == 0 {
		0
	} else {
		u32::MAX << (32 - prefix)
	};
	Ok((addr.to_string(), Ipv4Addr::from(mask).to_string()))
}

/// Linux driver built on `ip` and `resolvectl`.
pub struct IpCommandTunnel {
	runner: Arc<dyn CommandRunner>,
	device: String,
}

impl IpCommandTunnel {
	pub fn new(runner: Arc<dyn CommandRunner>, device: impl Into<String>) -> Self {
		Self {
			runner,
			device: device.into(),
		}
	}
}

#[async_trait]
impl TunnelDriver for IpCommandTunnel {
	fn device_name(&self) -> &str {
		&self.device
	}

	async fn create_device(&self) -> Result<()> {
		self
			.runner
			.run("ip", &args(&["tuntap", "add", "dev", &self.device, "mode", "tun"]))
			.await?;
		self
			.runner
			.run("ip", &args(&["link", "set", "dev", &self.device, "up"]))
			.await?;
		info!(device = %self.device, "tun device created");
		Ok(())
	}

	async fn remove_device(&self) -> Result<()> {
		self
			.runner
			.run("ip", &args(&["link", "del", &self.device]))
			.await?;
		info!(device = %self.device, "tun device removed");
		Ok(())
	}

	async fn set_route(&self, ip_ranges: &[String]) -> Result<()> {
		let mut last_err = None;
		for (i, range) in ip_ranges.iter().enumerate() {
			if i == 0 {
				let (addr, _) = ip_and_mask(range)?;
				let addr = format!("{addr}/32");
				if let Err(e) = self
					.runner
					.run("ip", &args(&["addr", "add", &addr, "dev", &self.device]))
					.await
				{
					warn!(device = %self.device, error = %e, "failed to assign tun address");
					last_err = Some(e);
					continue;
				}
			}
			if let Err(e) = self
				.runner
				.run("ip", &args(&["route", "add", range, "dev", &self.device]))
				.await
			{
				warn!(range = %range, error = %e, "failed to set route to tun device");
				last_err = Some(e);
			}
		}
		last_err.map_or(Ok(()), Err)
	}

	async fn set_dns_server(&self, addresses: &[String]) -> Result<()> {
		let mut cmd = vec!["dns".to_string(), self.device.clone()];
		cmd.extend(addresses.iter().cloned());
		self.runner.run("resolvectl", &cmd).await?;
		Ok(())
	}
}

/// Windows driver built on `netsh` and `route`.
pub struct NetshTunnel {
	runner: Arc<dyn CommandRunner>,
	device: String,
}

impl NetshTunnel {
	pub fn new(runner: Arc<dyn CommandRunner>, device: impl Into<String>) -> Self {
		Self {
			runner,
			device: device.into(),
		}
	}
}

#[async_trait]
impl TunnelDriver for NetshTunnel {
	fn device_name(&self) -> &str {
		&self.device
	}

	// The wintun adapter is created by the tunnel process itself.
	async fn create_device(&self) -> Result<()> {
		Ok(())
	}

	async fn remove_device(&self) -> Result<()> {
		Ok(())
	}

	async fn set_route(&self, ip_ranges: &[String]) -> Result<()> {
		let mut last_err = None;
		for (i, range) in ip_ranges.iter().enumerate() {
			let (ip, mask) = ip_and_mask(range)?;
			let tun_ip = ip.clone();
			let assign = if i == 0 {
				args(&[
					"interface", "ip", "set", "address", &self.device, "static", &tun_ip, &mask,
				])
			} else {
				args(&["interface", "ip", "add", "address", &self.device, &tun_ip, &mask])
			};
			if let Err(e) = self.runner.run("netsh", &assign).await {
				warn!(ip = %tun_ip, error = %e, "failed to add ip addr to tun device");
				last_err = Some(e);
				continue;
			}
			if let Err(e) = self
				.runner
				.run("route", &args(&["add", &ip, "mask", &mask, &tun_ip]))
				.await
			{
				warn!(range = %range, error = %e, "failed to set route to tun device");
				last_err = Some(e);
			}
		}
		last_err.map_or(Ok(()), Err)
	}

	async fn set_dns_server(&self, addresses: &[String]) -> Result<()> {
		let name = format!("name={}", self.device);
		for (i, dns) in addresses.iter().enumerate() {
			let address = format!("address={dns}");
			let cmd = if i == 0 {
				args(&[
					"interface",
					"ip",
					"set",
					"dnsservers",
					&name,
					"source=static",
					&address,
				])
			} else {
				args(&["interface", "ip", "add", "dnsservers", &name, &address])
			};
			self.runner.run("netsh", &cmd).await?;
		}
		Ok(())
	}
}

/// The driver for the platform tether is running on.
pub fn platform_tunnel(runner: Arc<dyn CommandRunner>) -> Box<dyn TunnelDriver> {
	if cfg!(windows) {
		Box::new(NetshTunnel::new(runner, WINDOWS_DEVICE))
	} else {
		Box::new(IpCommandTunnel::new(runner, DEFAULT_DEVICE))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::command::RecordingRunner;

	fn ranges(r: &[&str]) -> Vec<String> {
		r.iter().map(|s| s.to_string()).collect()
	}

	#[test]
	fn masks_from_prefixes() {
		assert_eq!(
			ip_and_mask("172.20.0.0/16").unwrap(),
			("172.20.0.0".to_string(), "255.255.0.0".to_string())
		);
		assert_eq!(ip_and_mask("10.96.0.0/12").unwrap().1, "255.240.0.0");
		assert_eq!(ip_and_mask("0.0.0.0/0").unwrap().1, "0.0.0.0");
		assert!(ip_and_mask("10.0.0.0").is_err());
		assert!(ip_and_mask("10.0.0.0/40").is_err());
	}

	#[tokio::test]
	async fn netsh_uses_set_then_add() {
		let runner = RecordingRunner::new();
		let tunnel = NetshTunnel::new(Arc::new(runner.clone()), WINDOWS_DEVICE);

		tunnel
			.set_route(&ranges(&["172.20.0.0/16", "172.21.0.0/16"]))
			.await
			.unwrap();
		tunnel
			.set_dns_server(&ranges(&["10.0.0.10", "10.0.0.11"]))
			.await
			.unwrap();

		assert_eq!(
			runner.calls(),
			vec![
				"netsh interface ip set address TetherTunnel static 172.20.0.0 255.255.0.0",
				"route add 172.20.0.0 mask 255.255.0.0 172.20.0.0",
				"netsh interface ip add address TetherTunnel 172.21.0.0 255.255.0.0",
				"route add 172.21.0.0 mask 255.255.0.0 172.21.0.0",
				"netsh interface ip set dnsservers name=TetherTunnel source=static address=10.0.0.10",
				"netsh interface ip add dnsservers name=TetherTunnel address=10.0.0.11",
			]
		);
	}

	#[tokio::test]
	async fn route_failures_continue_and_return_last_error() {
		let runner = RecordingRunner::new();
		runner.fail_when("route add 172.20.0.0");
		let tunnel = NetshTunnel::new(Arc::new(runner.clone()), WINDOWS_DEVICE);

		let err = tunnel
			.set_route(&ranges(&["172.20.0.0/16", "172.21.0.0/16"]))
			.await
			.unwrap_err();
		assert!(err.to_string().contains("172.20.0.0"));
		assert_eq!(runner.calls().len(), 4);
	}

	#[tokio::test]
	async fn ip_driver_commands() {
		let runner = RecordingRunner::new();
		let tunnel = IpCommandTunnel::new(Arc::new(runner.clone()), DEFAULT_DEVICE);

		tunnel.create_device().await.unwrap();
		tunnel
			.set_route(&ranges(&["10.96.0.0/12", "10.244.0.0/16"]))
			.await
			.unwrap();
		tunnel.remove_device().await.unwrap();

		assert_eq!(
			runner.calls(),
			vec![
				"ip tuntap add dev tether0 mode tun",
				"ip link set dev tether0 up",
				"ip addr add 10.96.0.0/32 dev tether0",
				"ip route add 10.96.0.0/12 dev tether0",
				"ip route add 10.244.0.0/16 dev tether0",
				"ip link del tether0",
			]
		);
	}
}
