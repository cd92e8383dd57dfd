//! workspace-ports: port management core of a workspace supervisor
//!
//! This crate reconciles three independent streams of truth about the
//! TCP ports of a developer workspace into one authoritative view:
//!
//! - **Served ports**: sockets user processes are listening on,
//!   discovered from the kernel tables.
//! - **Exposed ports**: ports the control plane has assigned a public
//!   URL and global port to.
//! - **Configured ports**: ports declared in workspace or instance
//!   configuration, including ranges.
//!
//! The [`Manager`] consumes all three, maintains the derived
//! [`PortStatus`] table, opens local→global TCP proxies for
//! loopback-bound servers, requests missing exposures, and broadcasts
//! [`Diff`]s to subscribers.
//!
//! # Architecture
//!
//! - **Manager**: single-writer reconciliation loop; owns all state
//! - **Config**: TOML port configuration with range matching
//! - **Subscriptions**: bounded per-subscriber backlogs with coalescing
//! - **Proxy**: registry of local TCP forwarders on allocated globals
//! - **Allocator**: deterministic descending global-port pool

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod allocator;
pub mod config;
pub mod diff;
pub mod error;
pub mod exposed;
pub mod manager;
pub mod proxy;
pub mod served;
pub mod status;
pub mod subscriptions;

pub use allocator::GlobalPortAllocator;
pub use config::{ConfigObserver, Configs, FileConfigObserver, OnOpenAction, PortVisibility};
pub use diff::Diff;
pub use error::{PortsError, PortsResult};
pub use exposed::{ExposedPort, ExposedPortObserver, NoopExposedPorts};
pub use manager::{Manager, ManagerHandle};
pub use proxy::{ProxyHandle, ProxyRegistry, ProxyStarter, local_proxy_starter};
pub use served::{ProcNetObserver, ServedPort, ServedPortObserver};
pub use status::{ExposedInfo, PortStatus};
pub use subscriptions::Subscription;
