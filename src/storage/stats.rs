use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

macro_rules! tree_counters {
    ($( $(#[$doc:meta])* $name:ident => $inc:ident ),* $(,)?) => {
        /// Snapshot of tree statistics at a point in time.
        #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
        pub struct TreeStatsSnapshot {
            $( $(#[$doc])* pub $name: u64, )*
        }

        /// Thread-safe structure-modification counters shared by a tree.
        #[derive(Default, Debug)]
        pub struct TreeStats {
            $( $name: AtomicU64, )*
        }

        impl TreeStats {
            $(
                $(#[$doc])*
                pub fn $name(&self) -> u64 {
                    self.$name.load(AtomicOrdering::Relaxed)
                }

                #[allow(dead_code)]
                pub(crate) fn $inc(&self) {
                    self.$name.fetch_add(1, AtomicOrdering::Relaxed);
                }
            )*

            /// Creates a snapshot of all current statistics.
            pub fn snapshot(&self) -> TreeStatsSnapshot {
                TreeStatsSnapshot {
                    $( $name: self.$name(), )*
                }
            }
        }
    };
}

tree_counters! {
    /// Single-version page splits.
    splits => inc_splits,
    /// Single-version merges that absorbed a sibling.
    merges => inc_merges,
    /// Single-version merges that redistributed entries instead.
    redistributions => inc_redistributions,
    /// Root promotions that added a level.
    height_increases => inc_height_increases,
    /// Root collapses that removed a level.
    height_decreases => inc_height_decreases,
    /// Copy-on-write snapshots of inactive pages.
    version_splits => inc_version_splits,
    /// Key splits of live content into several pages.
    key_splits => inc_key_splits,
    /// Merges enforcing the minimum fill of freshly restructured pages.
    strong_merges => inc_strong_merges,
    /// Merges repairing a live page that fell below its minimum fill.
    weak_merges => inc_weak_merges,
    /// Completed maintenance transactions.
    maintenance_runs => inc_maintenance_runs,
    /// Transient markers folded into the stable tree.
    migrated_markers => inc_migrated_markers,
}

impl TreeStats {
    pub(crate) fn add_migrated_markers(&self, count: u64) {
        self.migrated_markers.fetch_add(count, AtomicOrdering::Relaxed);
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "mvtree::stats",
            splits = snapshot.splits,
            merges = snapshot.merges,
            redistributions = snapshot.redistributions,
            height_increases = snapshot.height_increases,
            height_decreases = snapshot.height_decreases,
            version_splits = snapshot.version_splits,
            key_splits = snapshot.key_splits,
            strong_merges = snapshot.strong_merges,
            weak_merges = snapshot.weak_merges,
            maintenance_runs = snapshot.maintenance_runs,
            migrated_markers = snapshot.migrated_markers,
            "tree stats snapshot"
        );
    }
}
