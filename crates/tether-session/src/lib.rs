// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Session lifecycle for tether.
//!
//! A session bridges the workstation and a cluster: a shadow pod is the
//! cluster-side endpoint, DNS is pointed at the cluster, and exchange or mesh
//! sessions redirect live service traffic to the workstation. Everything a
//! session changes is recorded in its [`RuntimeState`] so the
//! [`TeardownCoordinator`] can reverse it, even from another process.

pub mod annotations;
pub mod command;
pub mod dns;
mod error;
pub mod exchange;
pub mod hosts;
pub mod keys;
pub mod local_dns;
mod manager;
pub mod mesh;
pub mod names;
pub mod ports;
pub mod proxy;
pub mod refcount;
pub mod resolver;
pub mod shadow;
pub mod state;
pub mod teardown;
pub mod tunnel;
mod workstation;

pub use dns::{AppliedDns, DnsStrategy};
pub use error::{Result, SessionError};
pub use exchange::RecoveryOutcome;
pub use manager::{ConnectOptions, ConnectSession, ExchangeSession, MeshSession, SessionManager};
pub use mesh::{MeshRecovery, VersionMark};
pub use ports::PortMap;
pub use shadow::{ShadowClaim, ShadowEndpoint, ShadowPool, ShadowSpec};
pub use state::{ComponentKind, RuntimeState, SessionHandle, SessionStore};
pub use teardown::{ClientFactory, FixedClient, TeardownCoordinator, TeardownReport};
pub use workstation::Workstation;
