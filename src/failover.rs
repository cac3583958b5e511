//! Failover eligibility hook
//!
//! A node whose state table is not yet synchronized should not win a
//! failover election. The engine reports this through [`FailoverHook`];
//! the carrier/priority system behind it is outside this crate.

use std::sync::atomic::{AtomicI32, Ordering};

/// Receives demotion changes from the sync engine
pub trait FailoverHook: Send + Sync {
    /// Adjust the demotion counter; positive values make the node less
    /// eligible to become active
    fn adjust(&self, delta: i32, reason: &str);
}

/// Demotion counter that only records and logs adjustments
#[derive(Debug, Default)]
pub struct DemotionCounter {
    value: AtomicI32,
}

impl DemotionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current demotion
    pub fn value(&self) -> i32 {
        self.value.load(Ordering::Acquire)
    }
}

impl FailoverHook for DemotionCounter {
    fn adjust(&self, delta: i32, reason: &str) {
        let value = self.value.fetch_add(delta, Ordering::AcqRel) + delta;
        tracing::info!(delta, demotion = value, reason, "Failover demotion adjusted");
    }
}
