// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A min-ordered set of deadlines with one-shot, recurring, and
//! witness-gated conditional timers.
//!
//! Deadlines are tracked against [`SystemTime`] rather than a monotonic
//! clock on purpose: the rollback-detection rule in [`TimerManager::list_expired`]
//! only makes sense against a clock that can actually jump backward.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Treat a backward jump larger than this as a clock reset rather than
/// ordinary NTP drift.
const ROLLBACK_THRESHOLD_MS: u64 = 60 * 60 * 1000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Timer callbacks are `Fn`, not `FnOnce`: a recurring timer invokes the
/// same callback on every firing, so it must be callable through a shared
/// reference rather than consumed.
type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    id: u64,
    deadline_ms: AtomicU64,
    period_ms: AtomicU64,
    recurring: bool,
    cancelled: AtomicBool,
    cb: Callback,
    manager: Weak<TimerManager>,
}

/// A handle to a single scheduled timer.
///
/// Cloning shares the same underlying timer; dropping every clone does not
/// cancel it, matching the corpus's shared-ownership model (the manager's
/// set holds one reference, callers hold another).
#[derive(Clone)]
pub struct Timer(Arc<Inner>);

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.0.id)
            .field("deadline_ms", &self.0.deadline_ms.load(Ordering::Relaxed))
            .field("recurring", &self.0.recurring)
            .finish()
    }
}

/// Ordering key used by the manager's set: strictly by deadline, ties broken
/// by insertion-stable id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    deadline_ms: u64,
    id: u64,
}

impl Timer {
    fn key(&self) -> Key {
        Key {
            deadline_ms: self.0.deadline_ms.load(Ordering::Acquire),
            id: self.0.id,
        }
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Cancels the timer: it is removed from the manager's set and will not
    /// fire. Returns `false` if it had already fired or already been
    /// cancelled.
    pub fn cancel(&self) -> bool {
        if self.0.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(manager) = self.0.manager.upgrade() {
            manager.remove(&self.key());
        }
        true
    }

    /// Pushes the deadline forward by one more period from now. Valid for
    /// any timer (recurring or not); forward-only.
    pub fn refresh(&self) {
        let Some(manager) = self.0.manager.upgrade() else {
            return;
        };
        manager.remove(&self.key());
        let period = self.0.period_ms.load(Ordering::Acquire);
        self.0
            .deadline_ms
            .store(now_ms() + period, Ordering::Release);
        manager.reinsert(self.clone());
    }

    /// Reschedules the timer to fire `ms` from now (`from_now = true`) or
    /// `ms` after its previous base deadline (`from_now = false`), updating
    /// its period to `ms`.
    pub fn reset(&self, ms: u64, from_now: bool) {
        let Some(manager) = self.0.manager.upgrade() else {
            return;
        };
        manager.remove(&self.key());
        let base = if from_now {
            now_ms()
        } else {
            let old_period = self.0.period_ms.load(Ordering::Acquire);
            self.0
                .deadline_ms
                .load(Ordering::Acquire)
                .saturating_sub(old_period)
        };
        self.0.period_ms.store(ms, Ordering::Release);
        self.0.deadline_ms.store(base + ms, Ordering::Release);
        manager.reinsert(self.clone());
    }
}

/// Invoked when the idle reactor loop should recompute its wait timeout
/// because a new earliest deadline was just inserted.
pub trait OnTimerInsertedAtFront: Send + Sync {
    fn on_timer_inserted_at_front(&self);
}

struct NoopHook;
impl OnTimerInsertedAtFront for NoopHook {
    fn on_timer_inserted_at_front(&self) {}
}

struct TimerSet {
    keys: BTreeSet<Key>,
    by_key: HashMap<u64, Timer>,
    /// Gates redundant wakeups: cleared once a reactor pass drains the head.
    tickled: bool,
    previous_time_ms: u64,
}

/// An ordered set of timers plus the rollback-detection state needed to
/// drain them correctly after a backward clock jump.
pub struct TimerManager {
    set: Mutex<TimerSet>,
    hook: Box<dyn OnTimerInsertedAtFront>,
}

impl TimerManager {
    pub fn new() -> Arc<Self> {
        Self::with_hook(Box::new(NoopHook))
    }

    pub fn with_hook(hook: Box<dyn OnTimerInsertedAtFront>) -> Arc<Self> {
        Arc::new(Self {
            set: Mutex::new(TimerSet {
                keys: BTreeSet::new(),
                by_key: HashMap::new(),
                tickled: false,
                previous_time_ms: now_ms(),
            }),
            hook,
        })
    }

    /// Inserts a new timer firing `ms` from now, recurring with period `ms`
    /// if `recurring` is set.
    pub fn add_timer(
        self: &Arc<Self>,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        let timer = Timer(Arc::new(Inner {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            deadline_ms: AtomicU64::new(now_ms() + ms),
            period_ms: AtomicU64::new(ms),
            recurring,
            cancelled: AtomicBool::new(false),
            cb: Arc::new(cb),
            manager: Arc::downgrade(self),
        }));
        self.insert(timer.clone());
        timer
    }

    /// Inserts a timer whose callback only runs if `witness` is still alive
    /// when it fires; otherwise the callback is dropped silently.
    pub fn add_conditional_timer<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        witness: Weak<T>,
        recurring: bool,
    ) -> Timer {
        let wrapped = move || {
            if witness.upgrade().is_some() {
                cb();
            }
        };
        self.add_timer(ms, wrapped, recurring)
    }

    fn insert(&self, timer: Timer) {
        let mut set = self.set.lock().unwrap();
        let was_front = set.keys.iter().next().copied();
        let key = timer.key();
        set.keys.insert(key);
        set.by_key.insert(key.id, timer);

        let is_new_front = was_front.map(|f| key < f).unwrap_or(true);
        if is_new_front && !set.tickled {
            set.tickled = true;
            drop(set);
            self.hook.on_timer_inserted_at_front();
        }
    }

    fn reinsert(&self, timer: Timer) {
        self.insert(timer);
    }

    fn remove(&self, key: &Key) {
        let mut set = self.set.lock().unwrap();
        set.keys.remove(key);
        set.by_key.remove(&key.id);
    }

    /// Milliseconds until the earliest deadline: `0` if already due, `None`
    /// if the set is empty (meaning "wait forever").
    pub fn next_timeout(&self) -> Option<u64> {
        let set = self.set.lock().unwrap();
        let front = set.keys.iter().next()?;
        let now = now_ms();
        Some(front.deadline_ms.saturating_sub(now))
    }

    pub fn is_empty(&self) -> bool {
        self.set.lock().unwrap().keys.is_empty()
    }

    /// Collects every timer whose deadline has passed, in non-decreasing
    /// deadline order, re-arming recurring ones and dropping the rest.
    /// Detects a backward clock jump of more than an hour and expires
    /// everything in that case.
    pub fn list_expired(&self) -> Vec<Callback> {
        let now = now_ms();
        let mut expired = Vec::new();

        let mut set = self.set.lock().unwrap();
        let rollback = now + ROLLBACK_THRESHOLD_MS < set.previous_time_ms;
        set.previous_time_ms = now;

        let due: Vec<Key> = if rollback {
            tracing::warn!(now_ms = now, "wall clock rollback detected, expiring all timers");
            set.keys.iter().copied().collect()
        } else {
            set.keys
                .iter()
                .take_while(|k| k.deadline_ms <= now)
                .copied()
                .collect()
        };

        for key in due {
            set.keys.remove(&key);
            let Some(timer) = set.by_key.remove(&key.id) else {
                continue;
            };
            if timer.0.cancelled.load(Ordering::Acquire) {
                continue;
            }
            expired.push(timer.0.cb.clone());

            if timer.0.recurring {
                let period = timer.0.period_ms.load(Ordering::Acquire);
                let base = if rollback { now } else { key.deadline_ms };
                timer.0.deadline_ms.store(base + period, Ordering::Release);
                let new_key = Key {
                    deadline_ms: timer.0.deadline_ms.load(Ordering::Acquire),
                    id: key.id,
                };
                set.keys.insert(new_key);
                set.by_key.insert(key.id, timer);
            }
        }

        set.tickled = false;
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration as StdDuration;

    #[test]
    fn fires_once_after_delay() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        mgr.add_timer(10, move || fired2.store(true, Ordering::SeqCst), false);

        thread::sleep(StdDuration::from_millis(30));
        let cbs = mgr.list_expired();
        assert_eq!(cbs.len(), 1);
        cbs[0]();
        assert!(fired.load(Ordering::SeqCst));
        assert!(mgr.is_empty());
    }

    #[test]
    fn cancel_prevents_firing() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(10, || panic!("should not fire"), false);
        assert!(timer.cancel());
        thread::sleep(StdDuration::from_millis(30));
        assert!(mgr.list_expired().is_empty());
    }

    #[test]
    fn recurring_rearms_after_each_fire() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let timer = mgr.add_timer(5, move || { count2.fetch_add(1, Ordering::SeqCst); }, true);

        thread::sleep(StdDuration::from_millis(20));
        let cbs = mgr.list_expired();
        assert_eq!(cbs.len(), 1);
        cbs[0]();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!mgr.is_empty());
        timer.cancel();
    }

    #[test]
    fn conditional_timer_skips_dead_witness() {
        let mgr = TimerManager::new();
        let witness = Arc::new(());
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        mgr.add_conditional_timer(5, move || ran2.store(true, Ordering::SeqCst), Arc::downgrade(&witness), false);
        drop(witness);

        thread::sleep(StdDuration::from_millis(20));
        let cbs = mgr.list_expired();
        assert_eq!(cbs.len(), 1);
        cbs[0]();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn next_timeout_reports_none_when_empty() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timeout(), None);
    }
}
