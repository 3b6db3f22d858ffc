//! The lifecycle engine.
//!
//! One shared bundle ties the dispatcher, reaper, scheduler, config
//! watcher, and admin server together: the current configuration
//! snapshot, the activity tracker, and the workload driver. The engine
//! serializes per-backend lifecycle operations through the tracker's
//! guards; across backends there is no ordering.

use crate::activity::ActivityTracker;
use crate::config::{Backend, ConfigSnapshot, Group};
use crate::driver::WorkloadControl;
use crate::groups::startable_members;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared engine state.
///
/// Constructed once at startup and shared behind an `Arc`; the
/// constructor returns `Arc<Self>` to enforce the pattern.
pub struct Engine {
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    activity: ActivityTracker,
    driver: Arc<dyn WorkloadControl>,
}

impl Engine {
    pub fn new(snapshot: ConfigSnapshot, driver: Arc<dyn WorkloadControl>) -> Arc<Self> {
        let engine = Arc::new(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            activity: ActivityTracker::new(),
            driver,
        });
        for backend in engine.snapshot().backends() {
            engine.activity.observe(&backend.name);
        }
        engine
    }

    /// The current configuration snapshot. Callers hold the returned
    /// `Arc` for the duration of one request or tick.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    pub fn driver(&self) -> &Arc<dyn WorkloadControl> {
        &self.driver
    }

    /// Swap in a fresh snapshot and reconcile runtime state: names new
    /// to the configuration get an activity stamp, names that vanished
    /// lose their activity and guard entries. In-flight operations on
    /// dropped names complete; their guard release no-ops.
    pub fn install_snapshot(&self, next: ConfigSnapshot) {
        let next = Arc::new(next);
        let keep = next.backend_names();
        *self.snapshot.write() = Arc::clone(&next);

        for backend in next.backends() {
            self.activity.observe(&backend.name);
        }
        let dropped = self.activity.retain_names(&keep);
        if !dropped.is_empty() {
            info!(dropped = ?dropped, "Removed activity state for vanished backends");
        }
    }

    /// Dispatcher-initiated start: debounced, and group-aware — a
    /// backend in an active group wakes the whole group.
    pub async fn request_start(&self, name: &str) {
        let snapshot = self.snapshot();
        let Some(backend) = snapshot.backend(name) else {
            return;
        };
        if !backend.active {
            return;
        }

        match snapshot.active_group_of(name) {
            Some(group) => self.start_group(&snapshot, group).await,
            None => self.start_backend(backend).await,
        }
    }

    /// Start one backend, honoring the debounce window.
    async fn start_backend(&self, backend: &Backend) {
        if !self.activity.mark_started(&backend.name) {
            debug!(name = %backend.name, "Start suppressed, recently initiated");
            return;
        }
        if self.driver.is_running(&backend.name).await {
            debug!(name = %backend.name, "Start skipped, already running");
            return;
        }
        info!(name = %backend.name, "Starting workload");
        if let Err(e) = self.driver.start(&backend.name).await {
            warn!(name = %backend.name, error = %e, "Workload start failed");
        }
    }

    /// Start every eligible group member. Starts are initiated in
    /// declared order but run concurrently; a member's completion is
    /// not awaited before the next is initiated.
    pub async fn start_group(&self, snapshot: &ConfigSnapshot, group: &Group) {
        let mut probes = Vec::new();
        for backend in group
            .members
            .iter()
            .filter_map(|name| snapshot.backend(name))
        {
            probes.push((backend.name.clone(), self.driver.is_running(&backend.name).await));
        }
        let running = |name: &str| {
            probes
                .iter()
                .any(|(probed, is_up)| probed == name && *is_up)
        };

        for backend in startable_members(snapshot, group, running) {
            if !self.activity.mark_started(&backend.name) {
                debug!(name = %backend.name, group = %group.name, "Member start suppressed, recently initiated");
                continue;
            }
            info!(name = %backend.name, group = %group.name, "Starting group member");
            let driver = Arc::clone(&self.driver);
            let name = backend.name.clone();
            let group_name = group.name.clone();
            tokio::spawn(async move {
                if let Err(e) = driver.start(&name).await {
                    warn!(name = %name, group = %group_name, error = %e, "Group member start failed");
                }
            });
        }
    }

    /// Scheduler-initiated start: unconditional, bypassing the
    /// debounce window. Inactive backends are still never started.
    pub async fn scheduled_start(&self, name: &str) {
        let snapshot = self.snapshot();
        let Some(backend) = snapshot.backend(name) else {
            debug!(name, "Scheduled start for unknown backend, ignoring");
            return;
        };
        if !backend.active {
            debug!(name, "Scheduled start skipped, backend inactive");
            return;
        }
        if self.driver.is_running(name).await {
            return;
        }
        info!(name, "Starting workload on schedule");
        if let Err(e) = self.driver.start(name).await {
            warn!(name, error = %e, "Scheduled start failed");
        }
    }

    /// Stop one workload under the per-name stop guard. Returns `true`
    /// when this call performed the stop, `false` when another stop
    /// was already in flight or the driver call failed.
    pub async fn stop_guarded(&self, name: &str) -> bool {
        if !self.activity.begin_stop(name) {
            debug!(name, "Stop skipped, already in progress");
            return false;
        }
        let result = self.driver.stop(name).await;
        self.activity.end_stop(name);
        match result {
            Ok(()) => {
                info!(name, "Workload stopped");
                true
            }
            Err(e) => {
                warn!(name, error = %e, "Workload stop failed");
                false
            }
        }
    }

    /// Stop every running, active group member sequentially, each
    /// under its own guard.
    pub async fn stop_group(&self, snapshot: &ConfigSnapshot, group: &Group) {
        for backend in group
            .members
            .iter()
            .filter_map(|name| snapshot.backend(name))
        {
            if !backend.active {
                continue;
            }
            if self.activity.is_stopping(&backend.name) {
                debug!(name = %backend.name, group = %group.name, "Member stop skipped, already in progress");
                continue;
            }
            if !self.driver.is_running(&backend.name).await {
                continue;
            }
            info!(name = %backend.name, group = %group.name, "Stopping group member");
            self.stop_guarded(&backend.name).await;
        }
    }
}
