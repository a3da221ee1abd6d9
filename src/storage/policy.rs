//! Fill policies deciding when pages split or merge.
//!
//! A policy maps a page capacity to four thresholds. `min_entries` and
//! `max_entries` trigger structure modifications; `min_after_smo` and
//! `max_after_smo` bound the fill of every page produced by one, so that a
//! freshly split page cannot immediately underflow and a freshly merged page
//! cannot immediately overflow.

use std::fmt;

use crate::types::{Result, TreeError};

/// Derived occupancy thresholds for pages of one capacity.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Thresholds {
    /// Non-root pages with fewer live entries underflow.
    pub min_entries: usize,
    /// Pages holding this many entries are about to overflow.
    pub max_entries: usize,
    /// Lower bound for pages produced by a split or merge.
    pub min_after_smo: usize,
    /// Upper bound for pages produced by a split or merge.
    pub max_after_smo: usize,
}

/// Occupancy of a page as seen by a policy.
///
/// Multiversion trees report only entries alive at the active version.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageFill {
    /// Counted entries.
    pub entries: usize,
    /// Slot capacity of the page.
    pub capacity: usize,
    /// Whether the page is the current root.
    pub root: bool,
}

/// Structure-modification policy.
pub trait SmoPolicy: fmt::Debug + Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Thresholds for pages with `capacity` slots.
    fn thresholds(&self, capacity: usize) -> Thresholds;

    /// Returns `true` if one more entry would not fit.
    fn is_about_to_overflow(&self, fill: &PageFill) -> bool {
        fill.entries >= self.thresholds(fill.capacity).max_entries
    }

    /// Returns `true` if removing one entry would underflow the page.
    fn is_about_to_underflow(&self, fill: &PageFill) -> bool {
        !fill.root && fill.entries <= self.thresholds(fill.capacity).min_entries
    }

    /// Returns `true` if a non-root page holds fewer entries than allowed.
    fn is_underflow(&self, fill: &PageFill) -> bool {
        !fill.root && fill.entries < self.thresholds(fill.capacity).min_entries
    }

    /// Checks that the thresholds for `capacity` are internally consistent.
    fn validate(&self, capacity: usize) -> Result<Thresholds> {
        let t = self.thresholds(capacity);
        if capacity < 4 {
            return Err(TreeError::Invalid("page must hold at least four entries"));
        }
        if t.min_entries == 0 || t.min_entries >= t.min_after_smo {
            return Err(TreeError::Invalid(
                "policy requires 0 < min_entries < min_after_smo",
            ));
        }
        if 2 * t.min_after_smo > t.max_after_smo {
            return Err(TreeError::Invalid(
                "policy requires 2 * min_after_smo <= max_after_smo",
            ));
        }
        if t.max_after_smo > capacity || t.max_entries > capacity {
            return Err(TreeError::Invalid("policy thresholds exceed page capacity"));
        }
        Ok(t)
    }
}

/// Splits only when a page is physically full and merges only when it is empty.
#[derive(Copy, Clone, Debug, Default)]
pub struct FixedPolicy;

impl SmoPolicy for FixedPolicy {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn thresholds(&self, capacity: usize) -> Thresholds {
        Thresholds {
            min_entries: 1,
            max_entries: capacity,
            min_after_smo: 2,
            max_after_smo: capacity,
        }
    }
}

/// Fill-ratio policy: underflow below `min_fill_rate`, post-SMO pages filled
/// up to `split_fill_rate`.
#[derive(Copy, Clone, Debug)]
pub struct RatioPolicy {
    min_fill_rate: f64,
    split_fill_rate: f64,
}

impl RatioPolicy {
    /// Creates the policy; both rates are fractions of the page capacity.
    pub fn new(min_fill_rate: f64, split_fill_rate: f64) -> Result<Self> {
        if !(0.0..0.5).contains(&min_fill_rate) || !(0.0..=1.0).contains(&split_fill_rate) {
            return Err(TreeError::Invalid("fill rates out of range"));
        }
        Ok(Self {
            min_fill_rate,
            split_fill_rate,
        })
    }
}

impl SmoPolicy for RatioPolicy {
    fn name(&self) -> &'static str {
        "ratio"
    }

    fn thresholds(&self, capacity: usize) -> Thresholds {
        let c = capacity as f64;
        let min_entries = ((c * self.min_fill_rate).floor() as usize).max(1);
        let min_after_smo = min_entries + 1;
        let max_after_smo = ((c * self.split_fill_rate).ceil() as usize)
            .max(2 * min_after_smo)
            .min(capacity);
        Thresholds {
            min_entries,
            max_entries: capacity,
            min_after_smo,
            max_after_smo,
        }
    }
}

/// Hysteresis policy parameterised by `(min_fill_rate, tolerance)`.
///
/// The band between `min_entries` and `min_after_smo` (and between
/// `max_after_smo` and the capacity) is wide enough that alternating inserts
/// and deletes at a boundary cannot bounce a page between split and merge.
#[derive(Copy, Clone, Debug)]
pub struct NonThrashingPolicy {
    min_fill_rate: f64,
    tolerance: f64,
}

impl NonThrashingPolicy {
    /// Creates the policy; `min_fill_rate < 0.5` and `0 < tolerance <= 1`.
    pub fn new(min_fill_rate: f64, tolerance: f64) -> Result<Self> {
        if !(min_fill_rate > 0.0 && min_fill_rate < 0.5) {
            return Err(TreeError::Invalid("min fill rate must lie in (0, 0.5)"));
        }
        if !(tolerance > 0.0 && tolerance <= 1.0) {
            return Err(TreeError::Invalid("tolerance must lie in (0, 1]"));
        }
        Ok(Self {
            min_fill_rate,
            tolerance,
        })
    }
}

impl SmoPolicy for NonThrashingPolicy {
    fn name(&self) -> &'static str {
        "non-thrashing"
    }

    fn thresholds(&self, capacity: usize) -> Thresholds {
        let c = capacity as f64;
        let m = self.min_fill_rate;
        let min_entries = ((c * m).floor() as usize).max(1);
        let min_after_smo = ((c * m * (1.0 + self.tolerance)).ceil() as usize).max(min_entries + 1);
        let max_after_smo = ((c * (1.0 - m * self.tolerance)).floor() as usize)
            .max(2 * min_after_smo)
            .min(capacity);
        Thresholds {
            min_entries,
            max_entries: capacity,
            min_after_smo,
            max_after_smo,
        }
    }
}

/// Part sizes for laying out `total` entries in pages of at most `max_after`.
///
/// Sizes differ by at most one. No parts are produced for zero entries.
pub fn partition_counts(total: usize, max_after: usize) -> Vec<usize> {
    if total == 0 {
        return Vec::new();
    }
    let parts = total.div_ceil(max_after.max(1));
    let base = total / parts;
    let extra = total % parts;
    (0..parts)
        .map(|i| if i < extra { base + 1 } else { base })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fill(entries: usize, capacity: usize) -> PageFill {
        PageFill {
            entries,
            capacity,
            root: false,
        }
    }

    #[test]
    fn fixed_policy_splits_when_full_and_merges_when_empty() {
        let policy = FixedPolicy;
        assert!(policy.is_about_to_overflow(&fill(4, 4)));
        assert!(!policy.is_about_to_overflow(&fill(3, 4)));
        assert!(policy.is_underflow(&fill(0, 4)));
        assert!(!policy.is_underflow(&fill(1, 4)));
        assert!(policy.is_about_to_underflow(&fill(1, 4)));
        assert!(!policy.is_about_to_underflow(&fill(2, 4)));
        let root = PageFill {
            root: true,
            ..fill(0, 4)
        };
        assert!(!policy.is_underflow(&root));
        policy.validate(4).unwrap();
    }

    #[test]
    fn non_thrashing_thresholds_for_common_capacities() {
        let policy = NonThrashingPolicy::new(0.25, 0.5).unwrap();
        assert_eq!(
            policy.thresholds(10),
            Thresholds {
                min_entries: 2,
                max_entries: 10,
                min_after_smo: 4,
                max_after_smo: 8,
            }
        );
        assert_eq!(policy.thresholds(100).min_entries, 25);
        assert_eq!(policy.thresholds(100).min_after_smo, 38);
        assert_eq!(policy.thresholds(100).max_after_smo, 87);
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(NonThrashingPolicy::new(0.6, 0.5).is_err());
        assert!(NonThrashingPolicy::new(0.2, 0.0).is_err());
        assert!(RatioPolicy::new(0.7, 0.9).is_err());
        assert!(FixedPolicy.validate(3).is_err());
    }

    #[test]
    fn partition_counts_are_balanced() {
        assert_eq!(partition_counts(0, 4), Vec::<usize>::new());
        assert_eq!(partition_counts(3, 4), vec![3]);
        assert_eq!(partition_counts(5, 4), vec![3, 2]);
        assert_eq!(partition_counts(9, 4), vec![3, 3, 3]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]
        #[test]
        fn derived_thresholds_keep_hysteresis(
            capacity in 8usize..400,
            min_fill in 0.05f64..0.45,
            tolerance in 0.1f64..1.0,
        ) {
            let policy = NonThrashingPolicy::new(min_fill, tolerance).unwrap();
            let t = policy.thresholds(capacity);
            prop_assert!(t.min_entries < t.min_after_smo);
            prop_assert!(t.max_after_smo <= capacity);
            if 2 * t.min_after_smo <= capacity {
                prop_assert!(2 * t.min_after_smo <= t.max_after_smo);
                for total in t.max_after_smo + 1..=capacity + 1 {
                    for part in partition_counts(total, t.max_after_smo) {
                        prop_assert!(part >= t.min_after_smo);
                        prop_assert!(part <= t.max_after_smo);
                    }
                }
            }
        }
    }
}
