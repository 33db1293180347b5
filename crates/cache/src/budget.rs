//! Memory budget tracking for the two cache dimensions
//!
//! Cached objects cost memory in two independent pools: process memory (VM)
//! and graphics-device memory (GPU). Each pool has its own [`BudgetState`]
//! with a ceiling that triggers cleanup and a low-water mark that cleanup
//! tries to reach. Both default to unbounded.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel for "no limit configured"
const UNBOUNDED: u64 = u64::MAX;

/// Low-water mark used when only a ceiling is configured, as a fraction of it
pub const DEFAULT_LOW_WATER_RATIO: f64 = 0.80;

/// A tracked memory pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// General process memory
    Vm,
    /// Graphics-device memory
    Gpu,
}

impl Dimension {
    /// Both dimensions, in the order cleanup visits them
    pub const ALL: [Dimension; 2] = [Dimension::Vm, Dimension::Gpu];

    pub fn name(&self) -> &'static str {
        match self {
            Dimension::Vm => "vm",
            Dimension::Gpu => "gpu",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Memory pressure level indicating cache health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Memory usage is low (< 50% of the ceiling)
    Low,
    /// Memory usage is moderate (50-75% of the ceiling)
    Moderate,
    /// Memory usage is high (75-90% of the ceiling)
    High,
    /// Memory usage is critical (> 90% of the ceiling)
    Critical,
}

impl MemoryPressure {
    /// Get the memory pressure level from a utilization ratio (0.0 to 1.0)
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization < 0.90 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }

    /// Returns true if the next cleanup is likely to evict (High or Critical)
    pub fn needs_eviction(&self) -> bool {
        matches!(self, MemoryPressure::High | MemoryPressure::Critical)
    }
}

/// Usage, ceiling and low-water mark of one dimension.
///
/// `current` is only changed by the recency tracker while it holds its lock,
/// and always by the delta of a single entry, never by recounting. Limits
/// can be changed at any time and are read at the start of each cleanup.
#[derive(Debug)]
pub struct BudgetState {
    dimension: Dimension,
    current: AtomicU64,
    ceiling: AtomicU64,
    low_water: AtomicU64,
}

impl BudgetState {
    /// Create an unbounded budget for `dimension`
    pub fn new(dimension: Dimension) -> Self {
        Self {
            dimension,
            current: AtomicU64::new(0),
            ceiling: AtomicU64::new(UNBOUNDED),
            low_water: AtomicU64::new(UNBOUNDED),
        }
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    /// Get the current usage in bytes
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Get the ceiling in bytes, or `None` when unbounded
    pub fn ceiling(&self) -> Option<u64> {
        match self.ceiling.load(Ordering::Acquire) {
            UNBOUNDED => None,
            bytes => Some(bytes),
        }
    }

    /// Get the low-water mark cleanup aims for, or `None` when unbounded
    ///
    /// Falls back to [`DEFAULT_LOW_WATER_RATIO`] of the ceiling when no
    /// low-water mark was configured.
    pub fn low_water(&self) -> Option<u64> {
        match self.low_water.load(Ordering::Acquire) {
            UNBOUNDED => self
                .ceiling()
                .map(|ceiling| (ceiling as f64 * DEFAULT_LOW_WATER_RATIO) as u64),
            bytes => Some(bytes),
        }
    }

    /// Set the ceiling that triggers cleanup
    ///
    /// No validation against the low-water mark is done; a ceiling below the
    /// low-water mark makes every cleanup evict down to the ceiling.
    pub fn set_ceiling(&self, bytes: u64) {
        self.ceiling.store(bytes, Ordering::Release);
        self.warn_if_inverted();
    }

    /// Set the level cleanup tries to reach once triggered
    pub fn set_low_water(&self, bytes: u64) {
        self.low_water.store(bytes, Ordering::Release);
        self.warn_if_inverted();
    }

    /// Remove the ceiling and low-water mark
    pub fn set_unbounded(&self) {
        self.ceiling.store(UNBOUNDED, Ordering::Release);
        self.low_water.store(UNBOUNDED, Ordering::Release);
    }

    fn warn_if_inverted(&self) {
        let low_water = self.low_water.load(Ordering::Acquire);
        if let Some(ceiling) = self.ceiling() {
            if low_water != UNBOUNDED && ceiling < low_water {
                tracing::warn!(
                    dimension = %self.dimension,
                    ceiling,
                    low_water,
                    "cache ceiling is below its low-water mark"
                );
            }
        }
    }

    /// Returns true if usage exceeds the ceiling
    pub fn is_over_ceiling(&self) -> bool {
        self.ceiling()
            .is_some_and(|ceiling| self.current() > ceiling)
    }

    /// Get the current utilization of the ceiling (0.0 when unbounded)
    pub fn utilization(&self) -> f64 {
        utilization(self.current(), self.ceiling())
    }

    /// Get the current memory pressure level
    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_utilization(self.utilization())
    }

    /// Record bytes that became tracked
    pub(crate) fn record_allocation(&self, bytes: u64) {
        if bytes > 0 {
            self.current.fetch_add(bytes, Ordering::AcqRel);
        }
    }

    /// Record bytes that stopped being tracked
    pub(crate) fn record_deallocation(&self, bytes: u64) {
        if bytes > 0 {
            self.current
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    Some(current.saturating_sub(bytes))
                })
                .ok();
        }
    }

    /// Snapshot for statistics
    pub fn stats(&self) -> BudgetStats {
        BudgetStats {
            dimension: self.dimension,
            current: self.current(),
            ceiling: self.ceiling(),
            low_water: self.low_water(),
        }
    }
}

fn utilization(current: u64, ceiling: Option<u64>) -> f64 {
    match ceiling {
        None => 0.0,
        Some(0) => {
            if current == 0 {
                0.0
            } else {
                1.0
            }
        }
        Some(ceiling) => current as f64 / ceiling as f64,
    }
}

/// Point-in-time view of one budget
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetStats {
    pub dimension: Dimension,
    /// Tracked bytes
    pub current: u64,
    /// Ceiling in bytes, `None` when unbounded
    pub ceiling: Option<u64>,
    /// Effective low-water mark in bytes, `None` when unbounded
    pub low_water: Option<u64>,
}

impl BudgetStats {
    /// Calculate utilization of the ceiling (0.0 when unbounded)
    pub fn utilization(&self) -> f64 {
        utilization(self.current, self.ceiling)
    }

    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_utilization(self.utilization())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_pressure_levels() {
        assert_eq!(MemoryPressure::from_utilization(0.3), MemoryPressure::Low);
        assert_eq!(
            MemoryPressure::from_utilization(0.6),
            MemoryPressure::Moderate
        );
        assert_eq!(MemoryPressure::from_utilization(0.8), MemoryPressure::High);
        assert_eq!(
            MemoryPressure::from_utilization(0.95),
            MemoryPressure::Critical
        );
    }

    #[test]
    fn test_pressure_needs_eviction() {
        assert!(!MemoryPressure::Low.needs_eviction());
        assert!(!MemoryPressure::Moderate.needs_eviction());
        assert!(MemoryPressure::High.needs_eviction());
        assert!(MemoryPressure::Critical.needs_eviction());
    }

    #[test]
    fn test_budget_defaults_to_unbounded() {
        let budget = BudgetState::new(Dimension::Vm);

        assert_eq!(budget.current(), 0);
        assert_eq!(budget.ceiling(), None);
        assert_eq!(budget.low_water(), None);
        assert_eq!(budget.utilization(), 0.0);

        budget.record_allocation(u64::MAX / 2);
        assert!(!budget.is_over_ceiling());
    }

    #[test]
    fn test_low_water_falls_back_to_ratio() {
        let budget = BudgetState::new(Dimension::Gpu);
        budget.set_ceiling(1000);
        assert_eq!(budget.low_water(), Some(800));

        budget.set_low_water(250);
        assert_eq!(budget.low_water(), Some(250));

        budget.set_unbounded();
        assert_eq!(budget.ceiling(), None);
        assert_eq!(budget.low_water(), None);
    }

    #[test]
    fn test_inverted_limits_are_accepted() {
        let budget = BudgetState::new(Dimension::Vm);
        budget.set_low_water(900);
        budget.set_ceiling(500);

        assert_eq!(budget.ceiling(), Some(500));
        assert_eq!(budget.low_water(), Some(900));
    }

    #[test]
    fn test_allocation_tracking() {
        let budget = BudgetState::new(Dimension::Vm);
        budget.set_ceiling(100);

        budget.record_allocation(60);
        assert_eq!(budget.current(), 60);
        assert_eq!(budget.pressure(), MemoryPressure::Moderate);
        assert!(!budget.is_over_ceiling());

        budget.record_allocation(50);
        assert!(budget.is_over_ceiling());
        assert_eq!(budget.pressure(), MemoryPressure::Critical);

        budget.record_deallocation(30);
        assert_eq!(budget.current(), 80);
        assert_eq!(budget.pressure(), MemoryPressure::High);

        // Never wraps below zero
        budget.record_deallocation(1000);
        assert_eq!(budget.current(), 0);
    }

    #[test]
    fn test_zero_ceiling_utilization() {
        let budget = BudgetState::new(Dimension::Gpu);
        budget.set_ceiling(0);
        assert_eq!(budget.utilization(), 0.0);

        budget.record_allocation(1);
        assert_eq!(budget.utilization(), 1.0);
        assert!(budget.is_over_ceiling());
    }

    #[test]
    fn test_budget_stats_snapshot() {
        let budget = BudgetState::new(Dimension::Gpu);
        budget.set_ceiling(400);
        budget.set_low_water(100);
        budget.record_allocation(200);

        let stats = budget.stats();
        assert_eq!(stats.dimension, Dimension::Gpu);
        assert_eq!(stats.current, 200);
        assert_eq!(stats.ceiling, Some(400));
        assert_eq!(stats.low_water, Some(100));
        assert_eq!(stats.utilization(), 0.5);
        assert_eq!(stats.pressure(), MemoryPressure::Moderate);
    }

    #[test]
    fn test_budget_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let budget = Arc::new(BudgetState::new(Dimension::Vm));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let budget_clone = Arc::clone(&budget);
                thread::spawn(move || {
                    for _ in 0..100 {
                        budget_clone.record_allocation(1024);
                        budget_clone.record_deallocation(1024);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(budget.current(), 0);
    }
}
