use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::config::YearRange;
use crate::model::YearSnapshot;
use crate::{Error, Result};

/// Holds the immutable per-year snapshots.
///
/// Every insertion bumps a generation counter so derived graphs can tell
/// whether they were built from an older set of snapshots.
pub struct GeoEntityStore {
    snapshots: RwLock<BTreeMap<i32, Arc<YearSnapshot>>>,
    range: YearRange,
    generation: AtomicU64,
}

impl GeoEntityStore {
    pub fn new(range: YearRange) -> Self {
        Self {
            snapshots: RwLock::new(BTreeMap::new()),
            range,
            generation: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn range(&self) -> YearRange {
        self.range
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Adds a new year. Existing years are never replaced.
    ///
    /// Node kinds are checked against the neighbouring years so that the
    /// only change ever observed is under-construction -> station.
    pub fn insert(&self, snapshot: YearSnapshot) -> Result<Arc<YearSnapshot>> {
        let year = snapshot.year();
        self.range.check(year)?;

        let mut snapshots = self.snapshots.write();
        if snapshots.contains_key(&year) {
            return Err(Error::SnapshotExists(year));
        }

        let previous = snapshots.range(..year).next_back().map(|(_, s)| s.clone());
        let next = snapshots.range(year + 1..).next().map(|(_, s)| s.clone());

        for node in snapshot.nodes() {
            if let Some(before) = previous.as_ref().and_then(|p| p.node(&node.id)) {
                if !before.kind.can_transition_to(node.kind) {
                    return Err(Error::InvalidTransition {
                        node: node.id.clone(),
                        from: before.kind,
                        to: node.kind,
                    });
                }
            }
            if let Some(after) = next.as_ref().and_then(|n| n.node(&node.id)) {
                if !node.kind.can_transition_to(after.kind) {
                    return Err(Error::InvalidTransition {
                        node: node.id.clone(),
                        from: node.kind,
                        to: after.kind,
                    });
                }
            }
        }

        let snapshot = Arc::new(snapshot);
        info!(
            "Snapshot {} stored: {} nodes, {} edges, {} trips",
            year,
            snapshot.nodes().len(),
            snapshot.edges().len(),
            snapshot.trips().len()
        );
        snapshots.insert(year, snapshot.clone());
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(snapshot)
    }

    /// Newest snapshot at or before `year`.
    pub fn snapshot_for(&self, year: i32) -> Result<Arc<YearSnapshot>> {
        self.range.check(year)?;
        self.snapshots
            .read()
            .range(..=year)
            .next_back()
            .map(|(_, s)| s.clone())
            .ok_or(Error::OutOfRangeYear {
                year,
                min: self.range.min,
                max: self.range.max,
            })
    }

    pub fn exact(&self, year: i32) -> Option<Arc<YearSnapshot>> {
        self.snapshots.read().get(&year).cloned()
    }

    pub fn latest(&self) -> Option<Arc<YearSnapshot>> {
        self.snapshots.read().values().next_back().cloned()
    }

    pub fn years(&self) -> Vec<i32> {
        self.snapshots.read().keys().copied().collect()
    }

    /// All snapshots in ascending year order.
    pub fn all(&self) -> Vec<Arc<YearSnapshot>> {
        self.snapshots.read().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }
}
