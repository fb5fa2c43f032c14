//! Weak-reference cache of computed values, one per function.

use std::sync::{Arc, Weak};

use papaya::{Compute, HashMap, Operation};

use crate::function::Input;
use crate::pruner::{PruneConfig, PruneStats, Sweep, SweepTrigger};
use crate::tracer::Tracer;
use crate::{Computed, FunctionId};

/// Maps inputs to weak handles of their latest computed value.
///
/// The registry never keeps a value alive; a dead handle reads as a miss and is
/// evicted lazily or by a sweep.
pub(crate) struct Registry<I, O> {
    function: FunctionId,
    entries: HashMap<I, Weak<Computed<I, O>>, ahash::RandomState>,
    hasher: ahash::RandomState,
    trigger: SweepTrigger,
    tracer: Arc<dyn Tracer>,
}

impl<I, O> Registry<I, O>
where
    I: Input,
    O: Send + Sync + 'static,
{
    pub fn new(function: FunctionId, config: PruneConfig, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            function,
            entries: HashMap::with_capacity_and_hasher(config.capacity, ahash::RandomState::new()),
            hasher: ahash::RandomState::new(),
            trigger: SweepTrigger::new(config),
            tracer,
        }
    }

    /// Look up the live value for `key`, evicting a dead handle if one is found.
    pub fn get(self: &Arc<Self>, key: &I) -> Option<Arc<Computed<I, O>>> {
        self.touch(key);
        let pinned = self.entries.pin();
        let weak = pinned.get(key)?;
        if let Some(computed) = weak.upgrade() {
            return Some(computed);
        }
        let _ = pinned.compute(key.clone(), |entry| match entry {
            Some((_, weak)) if weak.strong_count() == 0 => Operation::Remove,
            _ => Operation::Abort(()),
        });
        None
    }

    /// Insert or replace the handle for `key`. Last write wins.
    pub fn store(self: &Arc<Self>, key: I, value: &Arc<Computed<I, O>>) {
        self.touch(&key);
        self.entries.pin().insert(key, Arc::downgrade(value));
    }

    /// Remove the entry for `key` only if it is dead or points at `value`.
    pub fn remove(self: &Arc<Self>, key: &I, value: &Computed<I, O>) -> bool {
        self.touch(key);
        let tag = value.tag();
        let pinned = self.entries.pin();
        let result = pinned.compute(key.clone(), |entry| {
            let Some((_, weak)) = entry else {
                return Operation::Abort(());
            };
            match weak.upgrade() {
                None => Operation::Remove,
                Some(current) if current.tag() == tag => Operation::Remove,
                Some(_) => Operation::Abort(()),
            }
        });
        matches!(result, Compute::Removed(_, _))
    }

    /// Number of entries, including dead handles not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.pin().len()
    }

    fn touch(self: &Arc<Self>, key: &I) {
        if !self.trigger.record(self.hasher.hash_one(key)) {
            return;
        }
        let scheduled = ScheduledSweep(self.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    scheduled.0.sweep();
                });
            }
            Err(_) => {
                scheduled.0.sweep();
            }
        }
    }

    fn sweep_entries(&self) -> PruneStats {
        let mut stats = PruneStats::default();
        let mut dead = Vec::new();
        {
            let pinned = self.entries.pin();
            for (key, weak) in pinned.iter() {
                stats.entries_scanned += 1;
                match weak.upgrade() {
                    Some(computed) => stats.edges_removed += computed.prune_used_by(),
                    None => dead.push(key.clone()),
                }
            }
        }

        let pinned = self.entries.pin();
        for key in dead {
            let result = pinned.compute(key, |entry| match entry {
                Some((_, weak)) if weak.strong_count() == 0 => Operation::Remove,
                _ => Operation::Abort(()),
            });
            if matches!(result, Compute::Removed(_, _)) {
                stats.entries_removed += 1;
            }
        }
        stats
    }
}

/// A sweep claimed through the trigger. Releases the claim when dropped, whether the
/// sweep ran or its task was dropped with a shut-down tokio runtime.
struct ScheduledSweep<I: Input, O: Send + Sync + 'static>(Arc<Registry<I, O>>);

impl<I: Input, O: Send + Sync + 'static> Drop for ScheduledSweep<I, O> {
    fn drop(&mut self) {
        self.0.trigger.finish(self.0.len());
    }
}

impl<I, O> Sweep for Registry<I, O>
where
    I: Input,
    O: Send + Sync + 'static,
{
    fn function(&self) -> FunctionId {
        self.function
    }

    fn sweep(&self) -> PruneStats {
        let stats = self.sweep_entries();
        tracing::debug!(
            function = self.function.name(),
            scanned = stats.entries_scanned,
            removed = stats.entries_removed,
            edges = stats.edges_removed,
            "registry.sweep"
        );
        self.tracer.on_prune(self.function, stats);
        stats
    }
}
