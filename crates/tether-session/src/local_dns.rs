// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Local DNS forwarder.
//!
//! Listens for UDP queries on the loopback address and relays each one to the
//! shadow pod over TCP, using the two-byte length prefix DNS over TCP needs.
//! It does no resolving of its own.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};

pub const STANDARD_DNS_PORT: u16 = 53;
pub const ALTERNATIVE_DNS_PORT: u16 = 10053;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_UDP_MESSAGE: usize = 4096;

/// Listen port for the local forwarder on this platform.
pub fn local_dns_port(windows: bool) -> u16 {
	if windows {
		STANDARD_DNS_PORT
	} else {
		ALTERNATIVE_DNS_PORT
	}
}

#[async_trait]
pub trait LocalDnsServer: Send + Sync {
	/// Start serving on `127.0.0.1:port`, forwarding to `upstream_ip`.
	///
	/// Returns once the listener is bound.
	async fn start(&self, upstream_ip: &str, port: u16) -> Result<()>;

	async fn stop(&self);
}

pub struct TcpForwardingDns {
	upstream_port: u16,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpForwardingDns {
	pub fn new() -> Self {
		Self::with_upstream_port(STANDARD_DNS_PORT)
	}

	pub fn with_upstream_port(upstream_port: u16) -> Self {
		Self {
			upstream_port,
			task: Mutex::new(None),
		}
	}
}

impl Default for TcpForwardingDns {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl LocalDnsServer for TcpForwardingDns {
	async fn start(&self, upstream_ip: &str, port: u16) -> Result<()> {
		let upstream: SocketAddr = format!("{upstream_ip}:{}", self.upstream_port)
			.parse()
			.map_err(|e| SessionError::Dns(format!("invalid upstream {upstream_ip}: {e}")))?;
		let socket = Arc::new(UdpSocket::bind(("127.0.0.1", port)).await?);
		info!(listen = %socket.local_addr()?, upstream = %upstream, "local dns forwarder started");

		let handle = tokio::spawn(serve(socket, upstream));
		if let Ok(mut task) = self.task.lock() {
			if let Some(previous) = task.replace(handle) {
				previous.abort();
			}
		}
		Ok(())
	}

	async fn stop(&self) {
		if let Ok(mut task) = self.task.lock() {
			if let Some(handle) = task.take() {
				handle.abort();
				debug!("local dns forwarder stopped");
			}
		}
	}
}

async fn serve(socket: Arc<UdpSocket>, upstream: SocketAddr) {
	let mut buf = vec![0u8; MAX_UDP_MESSAGE];
	loop {
		let (len, client) = match socket.recv_from(&mut buf).await {
			Ok(received) => received,
			Err(e) => {
				warn!(error = %e, "local dns receive failed");
				continue;
			}
		};
		let query = buf[..len].to_vec();
		let socket = socket.clone();
		tokio::spawn(async move {
			match tokio::time::timeout(UPSTREAM_TIMEOUT, forward(&query, upstream)).await {
				Ok(Ok(reply)) => {
					if let Err(e) = socket.send_to(&reply, client).await {
						warn!(client = %client, error = %e, "failed to return dns reply");
					}
				}
				Ok(Err(e)) => warn!(upstream = %upstream, error = %e, "dns forward failed"),
				Err(_) => warn!(upstream = %upstream, "dns forward timed out"),
			}
		});
	}
}

/// Send one query over TCP and read one reply.
async fn forward(query: &[u8], upstream: SocketAddr) -> std::io::Result<Vec<u8>> {
	let mut stream = TcpStream::connect(upstream).await?;
	let len = u16::try_from(query.len())
		.map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "query too large"))?;
	stream.write_all(&len.to_be_bytes()).await?;
	stream.write_all(query).await?;

	let mut len_buf = [0u8; 2];
	stream.read_exact(&mut len_buf).await?;
	let mut reply = vec![0u8; u16::from_be_bytes(len_buf) as usize];
	stream.read_exact(&mut reply).await?;
	Ok(reply)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::net::TcpListener;

	#[test]
	fn platform_ports() {
		assert_eq!(local_dns_port(true), 53);
		assert_eq!(local_dns_port(false), 10053);
	}

	#[tokio::test]
	async fn forwards_udp_queries_over_tcp() {
		let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let upstream_port = upstream.local_addr().unwrap().port();
		tokio::spawn(async move {
			let (mut conn, _) = upstream.accept().await.unwrap();
			let mut len = [0u8; 2];
			conn.read_exact(&mut len).await.unwrap();
			let mut query = vec![0u8; u16::from_be_bytes(len) as usize];
			conn.read_exact(&mut query).await.unwrap();
			let mut reply = query.clone();
			reply.extend_from_slice(b"-answer");
			conn
				.write_all(&(reply.len() as u16).to_be_bytes())
				.await
				.unwrap();
			conn.write_all(&reply).await.unwrap();
		});

		let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
		let listen_port = socket.local_addr().unwrap().port();
		drop(socket);

		let server = TcpForwardingDns::with_upstream_port(upstream_port);
		server.start("127.0.0.1", listen_port).await.unwrap();

		let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		client
			.send_to(b"query", ("127.0.0.1", listen_port))
			.await
			.unwrap();
		let mut buf = [0u8; 64];
		let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
			.await
			.unwrap()
			.unwrap();
		assert_eq!(&buf[..len], b"query-answer");

		server.stop().await;
	}

	#[tokio::test]
	async fn bad_upstream_fails_before_binding() {
		let server = TcpForwardingDns::new();
		assert!(matches!(
			server.start("not-an-ip", 0).await,
			Err(SessionError::Dns(_))
		));
	}
}
