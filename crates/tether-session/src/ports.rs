// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::fmt;
use std::str::FromStr;

use crate::error::SessionError;

/// Ordered `local:remote` port pairs, written as `80:8080,70:7000`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMap(Vec<(u16, u16)>);

impl PortMap {
	pub fn pairs(&self) -> &[(u16, u16)] {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Remote ports, in declaration order.
	pub fn remote_ports(&self) -> Vec<i32> {
		self.0.iter().map(|(_, remote)| i32::from(*remote)).collect()
	}
}

fn parse_port(raw: &str, entry: &str) -> Result<u16, SessionError> {
	raw
		.trim()
		.parse::<u16>()
		.ok()
		.filter(|p| *p != 0)
		.ok_or_else(|| SessionError::InvalidArgument(format!("invalid port mapping '{entry}'")))
}

impl FromStr for PortMap {
	type Err = SessionError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut pairs = Vec::new();
		for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
			let pair = match entry.split_once(':') {
				Some((local, remote)) => (parse_port(local, entry)?, parse_port(remote, entry)?),
				None => {
					let port = parse_port(entry, entry)?;
					(port, port)
				}
			};
			pairs.push(pair);
		}
		Ok(Self(pairs))
	}
}

impl fmt::Display for PortMap {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let rendered = self
			.0
			.iter()
			.map(|(local, remote)| format!("{local}:{remote}"))
			.collect::<Vec<_>>()
			.join(",");
		f.write_str(&rendered)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_pairs_in_order() {
		let map: PortMap = "80:8080,70:7000".parse().unwrap();
		assert_eq!(map.pairs(), &[(80, 8080), (70, 7000)]);
		assert_eq!(map.to_string(), "80:8080,70:7000");
		assert_eq!(map.remote_ports(), vec![8080, 7000]);
	}

	#[test]
	fn bare_port_maps_to_itself() {
		let map: PortMap = "8080".parse().unwrap();
		assert_eq!(map.pairs(), &[(8080, 8080)]);
		assert_eq!(map.to_string(), "8080:8080");
	}

	#[test]
	fn empty_map_formats_empty() {
		let map: PortMap = "".parse().unwrap();
		assert!(map.is_empty());
		assert_eq!(map.to_string(), "");
	}

	#[test]
	fn rejects_garbage() {
		assert!("80:http".parse::<PortMap>().is_err());
		assert!("0".parse::<PortMap>().is_err());
		assert!("70000".parse::<PortMap>().is_err());
	}
}
