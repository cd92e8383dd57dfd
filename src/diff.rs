//! Diffs between consecutive port status snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::status::PortStatus;

/// The change between two consecutive port status snapshots.
///
/// Applying a diff to the older snapshot yields the newer one. All
/// slices are sorted by local port ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Diff {
    /// Ports present in the new snapshot only.
    pub added: Vec<PortStatus>,
    /// Ports present in both snapshots whose fields changed.
    pub updated: Vec<PortStatus>,
    /// Local ports present in the old snapshot only.
    pub removed: Vec<u16>,
}

enum Change {
    Added(PortStatus),
    Updated(PortStatus),
    Removed,
}

impl Diff {
    /// Computes the diff between two snapshots.
    pub fn between(old: &BTreeMap<u16, PortStatus>, new: &BTreeMap<u16, PortStatus>) -> Self {
        let mut diff = Diff::default();
        for (port, status) in new {
            match old.get(port) {
                None => diff.added.push(status.clone()),
                Some(previous) if previous != status => diff.updated.push(status.clone()),
                Some(_) => {}
            }
        }
        diff.removed
            .extend(old.keys().filter(|port| !new.contains_key(port)));
        diff
    }

    /// Whether the diff carries no change at all.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Collapses this diff and a newer one into a single diff with the
    /// same net effect.
    ///
    /// Used when a subscriber's backlog overflows: instead of dropping
    /// the oldest diff, it is folded into its successor. A removal
    /// cancels an earlier addition; an addition after a removal becomes
    /// an update; for everything else the newer value wins.
    pub fn merge(self, newer: Diff) -> Diff {
        let mut net: BTreeMap<u16, Change> = self.into_changes().collect();
        for (port, change) in newer.into_changes() {
            let combined = match (net.remove(&port), change) {
                // Never delivered, now gone again: no change at all.
                (Some(Change::Added(_)), Change::Removed) => None,
                (Some(Change::Added(_)), Change::Updated(status)) => Some(Change::Added(status)),
                // Existed before the removal, so its return reads as an
                // update from the subscriber's point of view.
                (Some(Change::Removed), Change::Added(status))
                | (Some(Change::Removed), Change::Updated(status)) => {
                    Some(Change::Updated(status))
                }
                (Some(Change::Updated(_)), Change::Added(status)) => {
                    Some(Change::Updated(status))
                }
                (_, change) => Some(change),
            };
            if let Some(combined) = combined {
                net.insert(port, combined);
            }
        }

        let mut merged = Diff::default();
        for (port, change) in net {
            match change {
                Change::Added(status) => merged.added.push(status),
                Change::Updated(status) => merged.updated.push(status),
                Change::Removed => merged.removed.push(port),
            }
        }
        merged
    }

    fn into_changes(self) -> impl Iterator<Item = (u16, Change)> {
        let added = self
            .added
            .into_iter()
            .map(|s| (s.local_port, Change::Added(s)));
        let updated = self
            .updated
            .into_iter()
            .map(|s| (s.local_port, Change::Updated(s)));
        let removed = self.removed.into_iter().map(|p| (p, Change::Removed));
        added.chain(updated).chain(removed)
    }
}
