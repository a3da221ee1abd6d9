use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::policy::{FixedPolicy, NonThrashingPolicy, RatioPolicy, SmoPolicy};
use crate::types::{page::DEFAULT_PAGE_SIZE, Result, TreeError};

/// Which structure-modification policy a tree uses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Split when full, merge when empty.
    Fixed,
    /// Fill-ratio thresholds.
    Ratio,
    /// Hysteresis thresholds derived from `min_fill_rate` and `tolerance`.
    #[default]
    NonThrashing,
}

/// Configuration supplied when creating or opening a tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeOptions {
    /// Page size in bytes.
    pub page_size: usize,
    /// Frames the page cache keeps resident once unfixed.
    pub cache_pages: usize,
    /// Optional cap on entries per page, below what the page size allows.
    pub max_entries_per_page: Option<usize>,
    /// Fraction of capacity below which a page underflows.
    pub min_fill_rate: f64,
    /// Hysteresis width of the non-thrashing policy.
    pub tolerance: f64,
    /// Target fill of pages produced by a split under the ratio policy.
    pub split_fill_rate: f64,
    /// Policy used to derive occupancy thresholds.
    pub policy: PolicyKind,
    /// Whether inserting an existing key replaces its value.
    pub overwrite_duplicates: bool,
    /// Concurrent-tree actions between maintenance runs.
    pub maintenance_interval: usize,
    /// Whether page checksums are verified when pages are read.
    pub checksum_verify_on_read: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 1024,
            max_entries_per_page: None,
            min_fill_rate: 0.25,
            tolerance: 0.5,
            split_fill_rate: 0.9,
            policy: PolicyKind::NonThrashing,
            overwrite_duplicates: true,
            maintenance_interval: 16,
            checksum_verify_on_read: true,
        }
    }
}

impl TreeOptions {
    /// Parses options from TOML; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| TreeError::Config(err.to_string()))
    }

    /// Sets the page size.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the number of resident cache frames.
    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Caps the number of entries per page.
    pub fn max_entries_per_page(mut self, entries: usize) -> Self {
        self.max_entries_per_page = Some(entries);
        self
    }

    /// Sets the minimum fill rate.
    pub fn min_fill_rate(mut self, rate: f64) -> Self {
        self.min_fill_rate = rate;
        self
    }

    /// Sets the hysteresis tolerance.
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Sets the post-split fill rate of the ratio policy.
    pub fn split_fill_rate(mut self, rate: f64) -> Self {
        self.split_fill_rate = rate;
        self
    }

    /// Selects the structure-modification policy.
    pub fn policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }

    /// Enables or disables overwriting on duplicate inserts.
    pub fn overwrite_duplicates(mut self, enabled: bool) -> Self {
        self.overwrite_duplicates = enabled;
        self
    }

    /// Sets the number of actions between maintenance runs.
    pub fn maintenance_interval(mut self, actions: usize) -> Self {
        self.maintenance_interval = actions;
        self
    }

    /// Enables or disables checksum verification on read.
    pub fn checksum_verify_on_read(mut self, enabled: bool) -> Self {
        self.checksum_verify_on_read = enabled;
        self
    }

    /// Builds the configured policy.
    pub fn build_policy(&self) -> Result<Arc<dyn SmoPolicy>> {
        Ok(match self.policy {
            PolicyKind::Fixed => Arc::new(FixedPolicy),
            PolicyKind::Ratio => {
                Arc::new(RatioPolicy::new(self.min_fill_rate, self.split_fill_rate)?)
            }
            PolicyKind::NonThrashing => {
                Arc::new(NonThrashingPolicy::new(self.min_fill_rate, self.tolerance)?)
            }
        })
    }

    /// Slot capacity for entries of `entry_len` bytes after `fixed_len` bytes of header.
    pub(crate) fn capacity_for(&self, fixed_len: usize, entry_len: usize) -> Result<usize> {
        let physical = self.page_size.saturating_sub(fixed_len) / entry_len.max(1);
        let capacity = match self.max_entries_per_page {
            Some(cap) => physical.min(cap),
            None => physical,
        };
        if capacity < 4 {
            return Err(TreeError::Invalid("page must hold at least four entries"));
        }
        Ok(capacity.min(u16::MAX as usize))
    }

    /// Checks the options against the storage page size.
    pub(crate) fn check_page_size(&self, storage_page_size: usize) -> Result<()> {
        if self.page_size != storage_page_size {
            return Err(TreeError::Invalid("options page size differs from storage"));
        }
        if self.maintenance_interval == 0 {
            return Err(TreeError::Invalid("maintenance interval must be positive"));
        }
        Ok(())
    }
}
