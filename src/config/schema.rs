//! Configuration schema definitions.
//!
//! This module defines the raw shape of the port configuration files and
//! the parsed per-port settings. Raw entries keep their `on-open` and
//! `visibility` values as plain strings so a single unknown value never
//! fails the whole document; the parser maps them onto [`OnOpenAction`]
//! and [`PortVisibility`] with defaults.

use serde::{Deserialize, Serialize};

/// Action to take when a configured port starts being served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnOpenAction {
    /// Open the port's URL in a browser tab.
    OpenBrowser,
    /// Show a notification to everyone with access to the workspace.
    Notify,
    /// Show a notification to the workspace owner only.
    #[default]
    NotifyPrivate,
    /// Do nothing.
    Ignore,
}

impl OnOpenAction {
    /// Maps a raw configuration string onto an action.
    ///
    /// Unknown or missing values fall back to the default rather than
    /// failing the entry.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("open-browser") => OnOpenAction::OpenBrowser,
            Some("notify") => OnOpenAction::Notify,
            Some("notify-private") | None => OnOpenAction::NotifyPrivate,
            Some("ignore") => OnOpenAction::Ignore,
            Some(other) => {
                tracing::debug!(action = other, "unknown on-open action, using default");
                OnOpenAction::default()
            }
        }
    }
}

/// Who can reach an exposed port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortVisibility {
    /// Only the workspace owner.
    #[default]
    Private,
    /// Anyone with the URL.
    Public,
}

impl PortVisibility {
    /// Maps a raw configuration string onto a visibility.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("public") => PortVisibility::Public,
            Some("private") | None => PortVisibility::Private,
            Some(other) => {
                tracing::debug!(visibility = other, "unknown visibility, using default");
                PortVisibility::default()
            }
        }
    }
}

/// Parsed per-port configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigEntry {
    /// Action on first serve.
    pub on_open: OnOpenAction,
    /// Requested exposure visibility.
    pub visibility: PortVisibility,
}

/// Parsed instance-level port range with its settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeConfig {
    /// First port of the range (inclusive).
    pub start: u16,
    /// Last port of the range (inclusive).
    pub end: u16,
    /// Settings applied to every port in the range.
    pub entry: ConfigEntry,
}

impl RangeConfig {
    /// Whether the range contains the given port.
    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

/// A single raw workspace port entry.
///
/// Workspace configuration only supports single ports; ranges are an
/// instance-level feature.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkspacePort {
    /// The port number.
    pub port: u16,
    /// Raw on-open action, mapped by [`OnOpenAction::parse`].
    #[serde(default)]
    pub on_open: Option<String>,
    /// Raw visibility, mapped by [`PortVisibility::parse`].
    #[serde(default)]
    pub visibility: Option<String>,
}

/// A port number or a `"start-end"` range string.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PortSpec {
    /// A single port given as a number.
    Number(u16),
    /// A single port or inclusive range given as a string.
    Text(String),
}

/// A single raw instance port entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstancePort {
    /// Port number or range.
    pub port: PortSpec,
    /// Raw on-open action, mapped by [`OnOpenAction::parse`].
    #[serde(default)]
    pub on_open: Option<String>,
    /// Raw visibility, mapped by [`PortVisibility::parse`].
    #[serde(default)]
    pub visibility: Option<String>,
}

/// Top-level shape of the workspace ports configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorkspacePortsFile {
    /// Declared ports.
    #[serde(default)]
    pub ports: Vec<WorkspacePort>,
}

/// Top-level shape of the instance ports configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InstancePortsFile {
    /// Declared ports and ranges.
    #[serde(default)]
    pub ports: Vec<InstancePort>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_open_parse_known_values() {
        assert_eq!(
            OnOpenAction::parse(Some("open-browser")),
            OnOpenAction::OpenBrowser
        );
        assert_eq!(OnOpenAction::parse(Some("notify")), OnOpenAction::Notify);
        assert_eq!(
            OnOpenAction::parse(Some("notify-private")),
            OnOpenAction::NotifyPrivate
        );
        assert_eq!(OnOpenAction::parse(Some("ignore")), OnOpenAction::Ignore);
    }

    #[test]
    fn test_on_open_parse_falls_back_to_default() {
        assert_eq!(OnOpenAction::parse(None), OnOpenAction::NotifyPrivate);
        assert_eq!(
            OnOpenAction::parse(Some("open-portal")),
            OnOpenAction::NotifyPrivate
        );
    }

    #[test]
    fn test_visibility_parse() {
        assert_eq!(
            PortVisibility::parse(Some("public")),
            PortVisibility::Public
        );
        assert_eq!(
            PortVisibility::parse(Some("private")),
            PortVisibility::Private
        );
        assert_eq!(PortVisibility::parse(None), PortVisibility::Private);
        assert_eq!(
            PortVisibility::parse(Some("shared")),
            PortVisibility::Private
        );
    }

    #[test]
    fn test_range_contains_is_inclusive() {
        let range = RangeConfig {
            start: 4000,
            end: 5000,
            entry: ConfigEntry::default(),
        };
        assert!(range.contains(4000));
        assert!(range.contains(4500));
        assert!(range.contains(5000));
        assert!(!range.contains(3999));
        assert!(!range.contains(5001));
    }

    #[test]
    fn test_workspace_file_from_toml() {
        let raw = r#"
            [[ports]]
            port = 8080
            on-open = "open-browser"

            [[ports]]
            port = 9229
            on-open = "ignore"
            visibility = "private"
        "#;
        let file: WorkspacePortsFile = toml::from_str(raw).unwrap();
        assert_eq!(file.ports.len(), 2);
        assert_eq!(file.ports[0].port, 8080);
        assert_eq!(file.ports[0].on_open.as_deref(), Some("open-browser"));
        assert!(file.ports[0].visibility.is_none());
    }

    #[test]
    fn test_instance_file_accepts_numbers_and_ranges() {
        let raw = r#"
            [[ports]]
            port = 3000

            [[ports]]
            port = "4000-5000"
            on-open = "open-browser"
        "#;
        let file: InstancePortsFile = toml::from_str(raw).unwrap();
        assert_eq!(file.ports.len(), 2);
        assert!(matches!(file.ports[0].port, PortSpec::Number(3000)));
        assert!(matches!(file.ports[1].port, PortSpec::Text(ref s) if s == "4000-5000"));
    }

    #[test]
    fn test_empty_document_parses() {
        let file: WorkspacePortsFile = toml::from_str("").unwrap();
        assert!(file.ports.is_empty());
    }
}
