//! Workspace and instance port configuration.
//!
//! Ports can be declared in two places:
//!
//! - **Workspace configuration**: checked into the repository, one entry
//!   per port number.
//! - **Instance configuration**: ad-hoc configuration of the running
//!   workspace instance; entries are single ports or inclusive ranges
//!   like `"4000-5000"`.
//!
//! Raw entries are parsed into two lookup structures (see [`Configs`]):
//! a per-port map and an ordered list of ranges. Lookup for a port
//! consults the workspace map first, then the instance single-port map,
//! then scans the ranges in declaration order.

pub mod error;
pub mod parser;
pub mod provider;
pub mod schema;

pub use error::ConfigError;
pub use parser::{Configs, parse_instance_configs, parse_workspace_configs};
pub use provider::{ConfigObserver, FileConfigObserver};
pub use schema::{
    ConfigEntry, InstancePort, InstancePortsFile, OnOpenAction, PortSpec, PortVisibility,
    RangeConfig, WorkspacePort, WorkspacePortsFile,
};
