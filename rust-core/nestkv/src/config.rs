// SPDX-License-Identifier: PMPL-1.0-or-later
//! Storage configuration.
//!
//! Defaults:
//! - change_channel_capacity: 256
//! - merge_strategy: existing_wins

use serde::{Deserialize, Serialize};

use crate::strategy::InitializerStrategy;

/// Built-in merge behaviour used when a default value meets existing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategyKind {
    /// Shallow merge where fields already in storage override the default.
    #[default]
    ExistingWins,
    /// Shallow merge where the default's fields override what is stored.
    DefaultsWin,
}

impl From<MergeStrategyKind> for InitializerStrategy {
    fn from(kind: MergeStrategyKind) -> Self {
        match kind {
            MergeStrategyKind::ExistingWins => InitializerStrategy::existing_wins(),
            MergeStrategyKind::DefaultsWin => InitializerStrategy::defaults_win(),
        }
    }
}

/// Configuration for a [`crate::RootStorage`] and every scope beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Capacity of each broadcast change channel (root and every scope).
    /// Slow subscribers past this many events observe a lag.
    pub change_channel_capacity: usize,
    /// Merge behaviour applied when initializing scopes.
    pub merge_strategy: MergeStrategyKind,
}

impl StorageConfig {
    /// Channel capacity clamped to the minimum tokio accepts.
    pub(crate) fn channel_capacity(&self) -> usize {
        self.change_channel_capacity.max(1)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            change_channel_capacity: 256,
            merge_strategy: MergeStrategyKind::ExistingWins,
        }
    }
}
