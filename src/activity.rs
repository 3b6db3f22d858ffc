//! Per-backend activity bookkeeping.
//!
//! Three maps keyed by backend name drive the lifecycle decisions:
//! last-activity stamps, a self-expiring start-debounce registry, and
//! the stop guard. Check-and-set on the guard maps is a single
//! critical section per key (the dashmap entry API), so concurrent
//! callers cannot both win.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::debug;

/// Window after a dispatcher-initiated start during which further
/// starts for the same backend are suppressed.
pub const START_DEBOUNCE: Duration = Duration::from_secs(30);

/// Minimum spacing between activity log lines per backend. The stored
/// stamp itself is updated on every request.
const ACTIVITY_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// A last-activity stamp: monotonic for timeout math, wall clock for
/// reporting.
#[derive(Debug, Clone, Copy)]
pub struct ActivityStamp {
    pub at: Instant,
    pub wall: DateTime<Utc>,
}

impl ActivityStamp {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Utc::now(),
        }
    }
}

/// Runtime activity state shared by the dispatcher, reaper, and
/// scheduler. Entries are created lazily and dropped when a
/// configuration reload no longer mentions the name.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    last_activity: DashMap<String, ActivityStamp>,
    recently_started: DashMap<String, Instant>,
    stopping: DashMap<String, ()>,
    last_logged: DashMap<String, Instant>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record inbound traffic for `name`.
    pub fn touch(&self, name: &str) {
        self.last_activity.insert(name.to_string(), ActivityStamp::now());

        let should_log = match self.last_logged.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().elapsed() >= ACTIVITY_LOG_INTERVAL {
                    entry.insert(Instant::now());
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
                true
            }
        };
        if should_log {
            debug!(name, "Traffic observed");
        }
    }

    pub fn last_activity(&self, name: &str) -> Option<ActivityStamp> {
        self.last_activity.get(name).map(|stamp| *stamp)
    }

    /// Initialize the activity stamp if `name` has never been seen.
    /// Returns `true` on first sighting.
    pub fn observe(&self, name: &str) -> bool {
        match self.last_activity.entry(name.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(ActivityStamp::now());
                true
            }
        }
    }

    /// Claim the right to issue a start for `name`. Returns `false`
    /// when a start was already initiated within [`START_DEBOUNCE`].
    pub fn mark_started(&self, name: &str) -> bool {
        match self.recently_started.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().elapsed() < START_DEBOUNCE {
                    false
                } else {
                    entry.insert(Instant::now());
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
                true
            }
        }
    }

    /// Whether a start initiated within the debounce window is pending.
    pub fn start_pending(&self, name: &str) -> bool {
        self.recently_started
            .get(name)
            .is_some_and(|at| at.elapsed() < START_DEBOUNCE)
    }

    /// Acquire the stop guard for `name`. Returns `false` when a stop
    /// is already in flight.
    pub fn begin_stop(&self, name: &str) -> bool {
        match self.stopping.entry(name.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(());
                true
            }
        }
    }

    /// Release the stop guard. A no-op when the entry was already
    /// dropped by a configuration reload.
    pub fn end_stop(&self, name: &str) {
        self.stopping.remove(name);
    }

    pub fn is_stopping(&self, name: &str) -> bool {
        self.stopping.contains_key(name)
    }

    /// Drop all state for names absent from `keep`. Returns the names
    /// that were dropped.
    pub fn retain_names(&self, keep: &HashSet<String>) -> Vec<String> {
        let dropped: Vec<String> = self
            .last_activity
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|name| !keep.contains(name))
            .collect();
        for name in &dropped {
            self.last_activity.remove(name);
            self.recently_started.remove(name);
            self.stopping.remove(name);
            self.last_logged.remove(name);
        }
        dropped
    }
}
