//! Parsing of raw port configuration into lookup structures.
//!
//! Workspace entries produce a per-port map. Instance entries produce a
//! per-port map for single ports plus an ordered list of ranges.
//! Malformed port specifications are dropped with a debug log; the rest
//! of the document is processed.

use std::collections::HashMap;

use tracing::debug;

use super::schema::{
    ConfigEntry, InstancePort, OnOpenAction, PortSpec, PortVisibility, RangeConfig, WorkspacePort,
};

/// Parsed port configuration of a workspace instance.
///
/// Holds both configuration sources and answers per-port lookups.
/// Lookup order: workspace map, instance single-port map, instance
/// ranges in declaration order (first containing range wins).
#[derive(Debug, Clone, Default)]
pub struct Configs {
    workspace: HashMap<u16, ConfigEntry>,
    instance_single: HashMap<u16, ConfigEntry>,
    instance_ranges: Vec<RangeConfig>,
}

impl Configs {
    /// Builds a `Configs` from already-parsed parts.
    pub fn from_parts(
        workspace: HashMap<u16, ConfigEntry>,
        instance_single: HashMap<u16, ConfigEntry>,
        instance_ranges: Vec<RangeConfig>,
    ) -> Self {
        Self {
            workspace,
            instance_single,
            instance_ranges,
        }
    }

    /// Parses raw workspace and instance entries into a `Configs`.
    pub fn parse(workspace: &[WorkspacePort], instance: &[InstancePort]) -> Self {
        let (instance_single, instance_ranges) = parse_instance_configs(instance);
        Self::from_parts(
            parse_workspace_configs(workspace),
            instance_single,
            instance_ranges,
        )
    }

    /// Looks up the configuration for a port.
    pub fn get(&self, port: u16) -> Option<ConfigEntry> {
        if let Some(entry) = self.workspace.get(&port) {
            return Some(*entry);
        }
        if let Some(entry) = self.instance_single.get(&port) {
            return Some(*entry);
        }
        self.instance_ranges
            .iter()
            .find(|range| range.contains(port))
            .map(|range| range.entry)
    }

    /// All explicitly declared single ports (workspace and instance).
    ///
    /// Ranges do not enumerate: a range only matters once one of its
    /// ports shows up as served or exposed.
    pub fn single_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.workspace
            .keys()
            .chain(self.instance_single.keys())
            .copied()
    }
}

/// Parses workspace port entries into a per-port map.
///
/// Later duplicates of the same port override earlier ones.
pub fn parse_workspace_configs(entries: &[WorkspacePort]) -> HashMap<u16, ConfigEntry> {
    let mut configs = HashMap::with_capacity(entries.len());
    for entry in entries {
        if entry.port == 0 {
            debug!("dropping workspace port entry with port 0");
            continue;
        }
        configs.insert(entry.port, config_entry(&entry.on_open, &entry.visibility));
    }
    configs
}

/// Parses instance port entries into a single-port map and an ordered
/// range list.
pub fn parse_instance_configs(
    entries: &[InstancePort],
) -> (HashMap<u16, ConfigEntry>, Vec<RangeConfig>) {
    let mut singles = HashMap::new();
    let mut ranges = Vec::new();
    for raw in entries {
        let entry = config_entry(&raw.on_open, &raw.visibility);
        match parse_port_spec(&raw.port) {
            Some((start, end)) if start == end => {
                singles.insert(start, entry);
            }
            Some((start, end)) => {
                ranges.push(RangeConfig { start, end, entry });
            }
            None => {
                debug!(spec = ?raw.port, "dropping malformed instance port entry");
            }
        }
    }
    (singles, ranges)
}

fn config_entry(on_open: &Option<String>, visibility: &Option<String>) -> ConfigEntry {
    ConfigEntry {
        on_open: OnOpenAction::parse(on_open.as_deref()),
        visibility: PortVisibility::parse(visibility.as_deref()),
    }
}

/// Parses a port spec into an inclusive `(start, end)` pair.
///
/// A bare port yields `start == end`. Returns `None` for malformed
/// specs: non-numeric parts, port 0, or an inverted range.
fn parse_port_spec(spec: &PortSpec) -> Option<(u16, u16)> {
    let (start, end) = match spec {
        PortSpec::Number(port) => (*port, *port),
        PortSpec::Text(text) => match text.split_once('-') {
            Some((start, end)) => (
                start.trim().parse::<u16>().ok()?,
                end.trim().parse::<u16>().ok()?,
            ),
            None => {
                let port = text.trim().parse::<u16>().ok()?;
                (port, port)
            }
        },
    };
    if start == 0 || end < start {
        return None;
    }
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_entry(port: u16, on_open: Option<&str>) -> WorkspacePort {
        WorkspacePort {
            port,
            on_open: on_open.map(String::from),
            visibility: None,
        }
    }

    fn instance_entry(spec: PortSpec, on_open: Option<&str>) -> InstancePort {
        InstancePort {
            port: spec,
            on_open: on_open.map(String::from),
            visibility: None,
        }
    }

    #[test]
    fn test_workspace_map_keyed_by_port() {
        let configs = parse_workspace_configs(&[
            workspace_entry(8080, Some("open-browser")),
            workspace_entry(9229, Some("ignore")),
        ]);
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[&8080].on_open, OnOpenAction::OpenBrowser);
        assert_eq!(configs[&9229].on_open, OnOpenAction::Ignore);
    }

    #[test]
    fn test_instance_ranges_preserve_declaration_order() {
        let (singles, ranges) = parse_instance_configs(&[
            instance_entry(PortSpec::Text("4000-5000".into()), Some("open-browser")),
            instance_entry(PortSpec::Text("4500-6000".into()), Some("ignore")),
            instance_entry(PortSpec::Number(3000), None),
        ]);
        assert_eq!(singles.len(), 1);
        assert!(singles.contains_key(&3000));
        assert_eq!(ranges.len(), 2);
        assert_eq!((ranges[0].start, ranges[0].end), (4000, 5000));
        assert_eq!((ranges[1].start, ranges[1].end), (4500, 6000));
    }

    #[test]
    fn test_lookup_order_workspace_wins() {
        let configs = Configs::parse(
            &[workspace_entry(4040, Some("notify"))],
            &[
                instance_entry(PortSpec::Number(4040), Some("ignore")),
                instance_entry(PortSpec::Text("4000-5000".into()), Some("open-browser")),
            ],
        );
        assert_eq!(configs.get(4040).unwrap().on_open, OnOpenAction::Notify);
    }

    #[test]
    fn test_lookup_first_containing_range_wins() {
        let configs = Configs::parse(
            &[],
            &[
                instance_entry(PortSpec::Text("4000-5000".into()), Some("open-browser")),
                instance_entry(PortSpec::Text("4500-6000".into()), Some("ignore")),
            ],
        );
        // 4001 only matches the first range; 4500 matches both but the
        // first declared wins; 5500 only matches the second.
        assert_eq!(
            configs.get(4001).unwrap().on_open,
            OnOpenAction::OpenBrowser
        );
        assert_eq!(
            configs.get(4500).unwrap().on_open,
            OnOpenAction::OpenBrowser
        );
        assert_eq!(configs.get(5500).unwrap().on_open, OnOpenAction::Ignore);
        assert!(configs.get(3999).is_none());
    }

    #[test]
    fn test_range_bounds_inclusive() {
        let configs = Configs::parse(
            &[],
            &[instance_entry(
                PortSpec::Text("4000-5000".into()),
                Some("open-browser"),
            )],
        );
        assert!(configs.get(4000).is_some());
        assert!(configs.get(5000).is_some());
        assert!(configs.get(5001).is_none());
    }

    #[test]
    fn test_malformed_entries_dropped() {
        let (singles, ranges) = parse_instance_configs(&[
            instance_entry(PortSpec::Text("5000-4000".into()), None),
            instance_entry(PortSpec::Text("eight".into()), None),
            instance_entry(PortSpec::Text("0".into()), None),
            instance_entry(PortSpec::Text("70000-70100".into()), None),
            instance_entry(PortSpec::Number(3000), None),
        ]);
        assert_eq!(singles.len(), 1);
        assert!(ranges.is_empty());
    }

    #[test]
    fn test_numeric_string_is_single_port() {
        let (singles, ranges) =
            parse_instance_configs(&[instance_entry(PortSpec::Text(" 8080 ".into()), None)]);
        assert!(singles.contains_key(&8080));
        assert!(ranges.is_empty());
    }

    #[test]
    fn test_single_ports_does_not_enumerate_ranges() {
        let configs = Configs::parse(
            &[workspace_entry(8080, None)],
            &[
                instance_entry(PortSpec::Number(3000), None),
                instance_entry(PortSpec::Text("4000-5000".into()), None),
            ],
        );
        let mut ports: Vec<u16> = configs.single_ports().collect();
        ports.sort_unstable();
        assert_eq!(ports, vec![3000, 8080]);
    }
}
