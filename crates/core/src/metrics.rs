//! Derived, read-only queue metrics.

use serde::{Deserialize, Serialize};

use crate::priority::Priority;

/// Per-tier depth counts.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDepths {
    #[serde(rename = "HIGH")]
    pub high: usize,
    #[serde(rename = "NORMAL")]
    pub normal: usize,
    #[serde(rename = "LOW")]
    pub low: usize,
}

impl TierDepths {
    pub fn new(high: usize, normal: usize, low: usize) -> Self {
        Self { high, normal, low }
    }

    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }

    pub fn set(&mut self, priority: Priority, depth: usize) {
        match priority {
            Priority::High => self.high = depth,
            Priority::Normal => self.normal = depth,
            Priority::Low => self.low = depth,
        }
    }

    pub fn total(&self) -> usize {
        self.high + self.normal + self.low
    }
}

/// Snapshot of the main tiers.
///
/// Never persisted. Built only through [`QueueMetrics::from_depths`], so
/// `total_depth` always equals the sum of the tiers.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub queue_depth: TierDepths,
    pub total_depth: usize,
}

impl QueueMetrics {
    pub fn from_depths(queue_depth: TierDepths) -> Self {
        Self {
            total_depth: queue_depth.total(),
            queue_depth,
        }
    }

    pub fn depth(&self, priority: Priority) -> usize {
        self.queue_depth.get(priority)
    }

    pub fn is_empty(&self) -> bool {
        self.total_depth == 0
    }
}
