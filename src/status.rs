//! Derived per-port status reported to subscribers.

use serde::{Deserialize, Serialize};

use crate::config::{ConfigEntry, OnOpenAction, PortVisibility};

/// Exposure details of a port, present once the control plane reflects
/// an exposure on the port's current global port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExposedInfo {
    /// Public URL under which the port is reachable.
    pub url: String,
    /// Who can reach the URL.
    pub visibility: PortVisibility,
    /// Action the UI should take now that the port is exposed.
    pub on_exposed: OnOpenAction,
}

/// Authoritative status of a single workspace port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PortStatus {
    /// The port a process binds (or configuration declares) inside the
    /// workspace.
    pub local_port: u16,
    /// The externally reachable port: the local port itself, the
    /// exposure's global port, or an allocated proxy port.
    pub global_port: u16,
    /// Whether a user process is currently listening on the local port.
    pub served: bool,
    /// Exposure details, if the control plane exposes this port on the
    /// expected global port.
    pub exposed: Option<ExposedInfo>,
}

/// Derives the reported on-exposed action from a port's configuration.
///
/// Unconfigured ports default to the private notification. A configured
/// `notify` on a privately visible port is reported as `notify-private`
/// so the notification stays with the workspace owner.
pub(crate) fn on_exposed_action(
    config: Option<&ConfigEntry>,
    visibility: PortVisibility,
) -> OnOpenAction {
    match config {
        None => OnOpenAction::NotifyPrivate,
        Some(entry) => match entry.on_open {
            OnOpenAction::Notify if visibility == PortVisibility::Private => {
                OnOpenAction::NotifyPrivate
            }
            action => action,
        },
    }
}
