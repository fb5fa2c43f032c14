//! Graph pruning: stochastic sweep scheduling and sweep bookkeeping.

use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::FunctionId;

/// Result of a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Registry entries visited.
    pub entries_scanned: usize,
    /// Dead registry entries removed.
    pub entries_removed: usize,
    /// Stale dependent edges removed from live values.
    pub edges_removed: usize,
}

impl AddAssign for PruneStats {
    fn add_assign(&mut self, other: Self) {
        self.entries_scanned += other.entries_scanned;
        self.entries_removed += other.entries_removed;
        self.edges_removed += other.edges_removed;
    }
}

/// Something that can be swept: one function's registry.
pub trait Sweep: Send + Sync {
    /// The function owning the swept entries.
    fn function(&self) -> FunctionId;

    /// Remove dead entries and stale edges.
    fn sweep(&self) -> PruneStats;
}

/// Sweep tuning shared by every registry of a runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PruneConfig {
    /// Minimum number of registry operations between sweeps.
    pub capacity: usize,
    /// Multiplier applied to `max(capacity, live entries)` to get the sweep threshold.
    pub factor: f64,
    /// Period of the runtime-wide background sweep, if any.
    pub interval: Option<Duration>,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            factor: 1.0,
            interval: None,
        }
    }
}

const PRECISION: u64 = 16;

/// One uniform draw from the thread's generator, mixed with the key hash.
fn sample(seed: u64) -> u64 {
    rand::thread_rng().gen::<u64>() ^ seed
}

/// Approximate operation counter.
///
/// Only one in `PRECISION` bumps touches the shared atomic, and it adds `PRECISION`.
#[derive(Debug, Default)]
pub(crate) struct StochasticCounter {
    value: AtomicU64,
}

impl StochasticCounter {
    /// Count one operation. Returns the new approximate value if the shared counter moved.
    pub fn bump(&self, seed: u64) -> Option<u64> {
        if sample(seed) % PRECISION != 0 {
            return None;
        }
        Some(self.value.fetch_add(PRECISION, Ordering::Relaxed) + PRECISION)
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Decides when a registry needs a sweep.
///
/// Concurrent triggers collapse into exactly one scheduled sweep.
pub(crate) struct SweepTrigger {
    counter: StochasticCounter,
    threshold: AtomicU64,
    scheduled: AtomicBool,
    gate: Mutex<()>,
    config: PruneConfig,
}

impl SweepTrigger {
    pub fn new(config: PruneConfig) -> Self {
        Self {
            counter: StochasticCounter::default(),
            threshold: AtomicU64::new(Self::threshold_for(&config, 0)),
            scheduled: AtomicBool::new(false),
            gate: Mutex::new(()),
            config,
        }
    }

    fn threshold_for(config: &PruneConfig, live: usize) -> u64 {
        let base = config.capacity.max(live).max(1) as f64;
        (base * config.factor.max(0.01)).ceil() as u64
    }

    /// Count one registry operation. Returns true if the caller must run a sweep.
    pub fn record(&self, seed: u64) -> bool {
        let Some(count) = self.counter.bump(seed) else {
            return false;
        };
        if count < self.threshold.load(Ordering::Relaxed) {
            return false;
        }
        let _gate = self.gate.lock();
        if self.scheduled.load(Ordering::Acquire)
            || self.counter.get() < self.threshold.load(Ordering::Relaxed)
        {
            return false;
        }
        self.scheduled.store(true, Ordering::Release);
        self.counter.reset();
        true
    }

    /// Mark the scheduled sweep as done and rescale the threshold to the surviving size.
    pub fn finish(&self, live: usize) {
        let _gate = self.gate.lock();
        self.threshold
            .store(Self::threshold_for(&self.config, live), Ordering::Relaxed);
        self.scheduled.store(false, Ordering::Release);
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }
}

/// Sweep every live registry in `sweepers`, dropping the ones whose function is gone.
pub(crate) fn sweep_all(sweepers: &Mutex<Vec<Weak<dyn Sweep>>>) -> PruneStats {
    let live: Vec<_> = {
        let mut sweepers = sweepers.lock();
        sweepers.retain(|s| s.strong_count() > 0);
        sweepers.iter().filter_map(Weak::upgrade).collect()
    };
    let mut total = PruneStats::default();
    for sweeper in live {
        let stats = sweeper.sweep();
        tracing::trace!(
            function = %sweeper.function(),
            removed = stats.entries_removed,
            "memo.sweep_function"
        );
        total += stats;
    }
    total
}
