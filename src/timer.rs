//! Keep-alive and output-release timers.
//!
//! Deadlines are quantized into ticks of a fixed quantum and grouped into buckets, so
//! renewing a hot value is a map lookup and firing is a range split. A background tokio
//! task drives the wheel; it is started lazily and stops once the wheel is dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};

use crate::tracer::Tracer;
use crate::{AnyComputed, Invalidation, InvalidationReason, Tag};

/// Which lifecycle timer an entry belongs to. A value has at most one timer of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Holds the value alive until the keep-alive period elapses.
    KeepAlive,
    /// Drops the value's output payload when it elapses.
    OutputRelease,
}

/// What happens to a value when its keep-alive period elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpirationPolicy {
    /// Drop the timer's strong reference; the value stays valid while anything else holds it.
    #[default]
    Release,
    /// Invalidate the value, cascading to its dependents.
    Invalidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerAction {
    ReleaseReference,
    Invalidate,
    ReleaseOutput,
}

impl TimerAction {
    fn for_kind(kind: TimerKind, policy: ExpirationPolicy) -> Self {
        match (kind, policy) {
            (TimerKind::OutputRelease, _) => TimerAction::ReleaseOutput,
            (TimerKind::KeepAlive, ExpirationPolicy::Release) => TimerAction::ReleaseReference,
            (TimerKind::KeepAlive, ExpirationPolicy::Invalidate) => TimerAction::Invalidate,
        }
    }
}

struct Entry {
    computed: Arc<dyn AnyComputed>,
    action: TimerAction,
}

type EntryKey = (Tag, TimerKind);

#[derive(Default)]
struct WheelState {
    buckets: BTreeMap<u64, HashMap<EntryKey, Entry, ahash::RandomState>>,
    ticks: HashMap<EntryKey, u64, ahash::RandomState>,
}

impl WheelState {
    fn detach(&mut self, key: &EntryKey) -> Option<Entry> {
        let tick = self.ticks.remove(key)?;
        let bucket = self.buckets.get_mut(&tick)?;
        let entry = bucket.remove(key);
        if bucket.is_empty() {
            self.buckets.remove(&tick);
        }
        entry
    }
}

/// A coarse time wheel keyed by quantized deadlines.
pub struct TimerWheel {
    quantum: Duration,
    origin: Instant,
    state: Mutex<WheelState>,
    driver_started: AtomicBool,
    tracer: Arc<dyn Tracer>,
}

impl TimerWheel {
    /// Create a wheel with the given tick quantum.
    pub fn new(quantum: Duration, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            quantum: quantum.max(Duration::from_millis(1)),
            origin: Instant::now(),
            state: Mutex::new(WheelState::default()),
            driver_started: AtomicBool::new(false),
            tracer,
        }
    }

    /// The tick quantum.
    pub fn quantum(&self) -> Duration {
        self.quantum
    }

    fn tick_ceil(&self, deadline: Instant) -> u64 {
        let elapsed = deadline.saturating_duration_since(self.origin).as_nanos();
        let quantum = self.quantum.as_nanos();
        u64::try_from(elapsed.div_ceil(quantum)).unwrap_or(u64::MAX)
    }

    fn tick_floor(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        u64::try_from(elapsed / self.quantum.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Schedule or push back the `kind` timer of `computed` to fire no earlier than `delay` from now.
    ///
    /// A timer is never moved to an earlier bucket. A delay too large to represent parks
    /// the timer in the last bucket, where it never fires. Returns false if the value is
    /// not consistent, in which case nothing is scheduled.
    pub fn renew(
        self: &Arc<Self>,
        computed: Arc<dyn AnyComputed>,
        kind: TimerKind,
        policy: ExpirationPolicy,
        delay: Duration,
    ) -> bool {
        let tick = match Instant::now().checked_add(delay) {
            Some(deadline) => self.tick_ceil(deadline),
            None => u64::MAX,
        };
        let key = (computed.tag(), kind);
        {
            let mut state = self.state.lock();
            // Checked under the wheel lock: invalidation flips the state before it cancels,
            // so either this check fails or the later cancel removes the entry.
            if !computed.is_consistent() {
                return false;
            }
            match state.ticks.get(&key) {
                Some(&scheduled) if scheduled >= tick => return true,
                Some(_) => {
                    state.detach(&key);
                }
                None => {}
            }
            state.ticks.insert(key, tick);
            state.buckets.entry(tick).or_default().insert(
                key,
                Entry {
                    computed,
                    action: TimerAction::for_kind(kind, policy),
                },
            );
        }
        self.ensure_driver();
        true
    }

    /// Remove every pending timer of the value tagged `tag`.
    pub fn cancel(&self, tag: Tag) -> bool {
        let mut state = self.state.lock();
        let keep_alive = state.detach(&(tag, TimerKind::KeepAlive));
        let release = state.detach(&(tag, TimerKind::OutputRelease));
        drop(state);
        // Entries are dropped outside the lock; they may hold the last reference.
        keep_alive.is_some() || release.is_some()
    }

    /// Returns true if the value tagged `tag` has a pending timer of `kind`.
    pub fn is_scheduled(&self, tag: Tag, kind: TimerKind) -> bool {
        self.state.lock().ticks.contains_key(&(tag, kind))
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.state.lock().ticks.len()
    }

    /// Returns true if no timer is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire every timer whose bucket is due at `now`. Returns the number of fired timers.
    pub fn fire_due(&self, now: Instant) -> usize {
        let now_tick = self.tick_floor(now);
        let due = {
            let mut state = self.state.lock();
            let later = state.buckets.split_off(&now_tick.saturating_add(1));
            let due = std::mem::replace(&mut state.buckets, later);
            for key in due.values().flat_map(|bucket| bucket.keys()) {
                state.ticks.remove(key);
            }
            due
        };

        let mut fired = 0;
        for ((tag, kind), entry) in due.into_values().flatten() {
            fired += 1;
            tracing::trace!(tag = %tag, ?kind, action = ?entry.action, "timer.fired");
            self.tracer.on_timer_fired(tag, kind);
            match entry.action {
                TimerAction::ReleaseReference => {}
                TimerAction::Invalidate => {
                    entry.computed.invalidate_with(Invalidation::new_source(
                        None,
                        InvalidationReason::KeepAliveExpired,
                    ));
                }
                TimerAction::ReleaseOutput => {
                    entry.computed.release_output();
                }
            }
        }
        fired
    }

    fn ensure_driver(self: &Arc<Self>) {
        if self.driver_started.swap(true, Ordering::AcqRel) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(drive(DriverRunning(Arc::downgrade(self)), self.quantum));
            }
            Err(_) => {
                self.driver_started.store(false, Ordering::Release);
                tracing::warn!("no tokio runtime; lifecycle timers fire only through fire_due");
            }
        }
    }
}

/// Clears `driver_started` when the driver ends, including when its tokio runtime shuts
/// down and drops the task, so the next renewal spawns a fresh driver.
struct DriverRunning(Weak<TimerWheel>);

impl Drop for DriverRunning {
    fn drop(&mut self) {
        if let Some(wheel) = self.0.upgrade() {
            wheel.driver_started.store(false, Ordering::Release);
        }
    }
}

async fn drive(running: DriverRunning, quantum: Duration) {
    let mut interval = tokio::time::interval(quantum);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(wheel) = running.0.upgrade() else {
            break;
        };
        wheel.fire_due(Instant::now());
    }
}
