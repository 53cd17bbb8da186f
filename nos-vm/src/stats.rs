//! Paging statistics
//!
//! Lock-free counters bumped on the fault and eviction paths. A consistent
//! copy is taken with [`VmStats::snapshot`].

use core::sync::atomic::{AtomicUsize, Ordering};

/// Live counters
#[derive(Debug, Default)]
pub struct VmStats {
    faults: AtomicUsize,
    claims: AtomicUsize,
    stack_growths: AtomicUsize,
    evictions: AtomicUsize,
    fatal_faults: AtomicUsize,
}

/// Point-in-time copy of [`VmStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStatsSnapshot {
    /// Page faults delivered to the handler
    pub faults: usize,
    /// Pages brought into a frame
    pub claims: usize,
    /// Stack pages created by growth
    pub stack_growths: usize,
    /// Frames reclaimed from a resident page
    pub evictions: usize,
    /// Faults that terminated the process
    pub fatal_faults: usize,
}

impl VmStats {
    pub const fn new() -> Self {
        Self {
            faults: AtomicUsize::new(0),
            claims: AtomicUsize::new(0),
            stack_growths: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
            fatal_faults: AtomicUsize::new(0),
        }
    }

    pub(crate) fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_claim(&self) {
        self.claims.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stack_growth(&self) {
        self.stack_growths.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fatal_fault(&self) {
        self.fatal_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> VmStatsSnapshot {
        VmStatsSnapshot {
            faults: self.faults.load(Ordering::Relaxed),
            claims: self.claims.load(Ordering::Relaxed),
            stack_growths: self.stack_growths.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            fatal_faults: self.fatal_faults.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = VmStats::new();
        stats.record_fault();
        stats.record_fault();
        stats.record_eviction();
        stats.record_fatal_fault();

        let snap = stats.snapshot();
        assert_eq!(snap.faults, 2);
        assert_eq!(snap.evictions, 1);
        assert_eq!(snap.fatal_faults, 1);
        assert_eq!(snap.claims, 0);
    }
}
