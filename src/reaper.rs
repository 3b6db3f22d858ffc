//! Periodic idle sweep.
//!
//! Every 10 seconds the reaper snapshots the configuration, probes
//! workload status in bounded batches, and stops whatever has been
//! idle past its timeout. The stop clauses are deliberately
//! conservative: a workload started or re-activated moments ago is
//! never reaped, and group members are only ever stopped through the
//! group path.

use crate::config::Backend;
use crate::engine::Engine;
use crate::groups::{group_idle, MemberProbe};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Spacing between sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Cap on concurrent status probes per sweep.
const STATUS_BATCH: usize = 10;

pub struct IdleReaper {
    engine: Arc<Engine>,
    shutdown_rx: watch::Receiver<bool>,
}

impl IdleReaper {
    pub fn new(engine: Arc<Engine>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            engine,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                    self.sweep().await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        debug!("Idle reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full sweep. Idempotent; failures are logged and retried on
    /// the next tick.
    pub async fn sweep(&self) {
        let snapshot = self.engine.snapshot();
        let driver = self.engine.driver();

        // Probe everything up front, at most STATUS_BATCH at a time.
        let names: Vec<String> = snapshot.backends().iter().map(|b| b.name.clone()).collect();
        let running: HashMap<String, bool> = stream::iter(names)
            .map(|name| async move {
                let up = driver.is_running(&name).await;
                (name, up)
            })
            .buffer_unordered(STATUS_BATCH)
            .collect()
            .await;
        let is_up = |name: &str| running.get(name).copied().unwrap_or(false);

        let now = Utc::now();

        // Individual path.
        for backend in snapshot.backends() {
            if !backend.active || backend.idle_timeout == 0 {
                continue;
            }
            if snapshot.in_active_group(&backend.name) {
                continue;
            }
            // First observation only arms the timer.
            if self.engine.activity().observe(&backend.name) {
                continue;
            }
            let Some(stamp) = self.engine.activity().last_activity(&backend.name) else {
                continue;
            };

            let timeout = Duration::from_secs(backend.idle_timeout);
            let idle_for = stamp.at.elapsed();
            if !(is_up(&backend.name) && idle_for > timeout) {
                continue;
            }
            if self.engine.activity().is_stopping(&backend.name) {
                continue;
            }

            let started_age = age_of(now, driver.started_at(&backend.name).await);
            if !idle_stop_due(idle_for, timeout, started_age, activation_age(now, backend)) {
                continue;
            }

            info!(
                name = %backend.name,
                idle_secs = idle_for.as_secs(),
                timeout_secs = backend.idle_timeout,
                "Idle timeout reached, stopping workload"
            );
            self.engine.stop_guarded(&backend.name).await;
        }

        // Group path.
        for group in snapshot.groups() {
            if !group.active || group.idle_timeout == 0 {
                continue;
            }

            let mut probes: HashMap<String, MemberProbe> = HashMap::new();
            for name in &group.members {
                let started_age = if is_up(name) {
                    age_of(now, driver.started_at(name).await)
                } else {
                    None
                };
                probes.insert(
                    name.clone(),
                    MemberProbe {
                        running: is_up(name),
                        idle_for: self
                            .engine
                            .activity()
                            .last_activity(name)
                            .map(|stamp| stamp.at.elapsed()),
                        started_age,
                    },
                );
            }

            let probe_of = |name: &str| probes.get(name).copied().unwrap_or_default();
            if group_idle(group, &snapshot, probe_of) {
                info!(group = %group.name, "Group idle, stopping all members");
                self.engine.stop_group(&snapshot, group).await;
            }
        }
    }
}

/// The final stop clauses for an individually-timed backend, applied
/// after the running and guard checks. `None` ages fail their clause:
/// a workload with an unknown start time or a backend that was never
/// activated is left alone.
fn idle_stop_due(
    idle_for: Duration,
    timeout: Duration,
    started_age: Option<Duration>,
    activation_age: Option<Duration>,
) -> bool {
    idle_for > timeout
        && started_age.is_some_and(|age| age > timeout)
        && activation_age.is_some_and(|age| age > timeout)
}

fn age_of(now: DateTime<Utc>, instant: Option<DateTime<Utc>>) -> Option<Duration> {
    instant.and_then(|t| now.signed_duration_since(t).to_std().ok())
}

fn activation_age(now: DateTime<Utc>, backend: &Backend) -> Option<Duration> {
    age_of(now, backend.activated_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_stop_due_when_all_clauses_hold() {
        assert!(idle_stop_due(secs(40), TIMEOUT, Some(secs(120)), Some(secs(120))));
    }

    #[test]
    fn test_not_due_while_within_timeout() {
        assert!(!idle_stop_due(secs(20), TIMEOUT, Some(secs(120)), Some(secs(120))));
        assert!(!idle_stop_due(secs(30), TIMEOUT, Some(secs(120)), Some(secs(120))));
    }

    #[test]
    fn test_recent_manual_start_wins() {
        // Started 10 s ago, e.g. by hand: the idle clock is stale.
        assert!(!idle_stop_due(secs(40), TIMEOUT, Some(secs(10)), Some(secs(120))));
    }

    #[test]
    fn test_recent_activation_wins() {
        // Re-activated via admin 5 s ago.
        assert!(!idle_stop_due(secs(40), TIMEOUT, Some(secs(120)), Some(secs(5))));
    }

    #[test]
    fn test_unknown_start_time_blocks_stop() {
        assert!(!idle_stop_due(secs(40), TIMEOUT, None, Some(secs(120))));
    }

    #[test]
    fn test_never_activated_blocks_stop() {
        assert!(!idle_stop_due(secs(40), TIMEOUT, Some(secs(120)), None));
    }

    #[test]
    fn test_age_of_future_instant_is_none() {
        let now = Utc::now();
        assert!(age_of(now, Some(now + chrono::Duration::seconds(60))).is_none());
        assert_eq!(
            age_of(now, Some(now - chrono::Duration::seconds(60))),
            Some(secs(60))
        );
        assert!(age_of(now, None).is_none());
    }

    mod sweep {
        use super::*;
        use crate::config::{ConfigDocument, ConfigSnapshot};
        use crate::driver::WorkloadControl;
        use async_trait::async_trait;
        use parking_lot::Mutex;
        use std::collections::HashSet;

        struct SweepDriver {
            running: Mutex<HashSet<String>>,
            started_at: Mutex<HashMap<String, DateTime<Utc>>>,
            stops: Mutex<Vec<String>>,
        }

        impl SweepDriver {
            fn new() -> Self {
                Self {
                    running: Mutex::new(HashSet::new()),
                    started_at: Mutex::new(HashMap::new()),
                    stops: Mutex::new(Vec::new()),
                }
            }

            fn running_since(&self, name: &str, secs_ago: i64) {
                self.running.lock().insert(name.to_string());
                self.started_at
                    .lock()
                    .insert(name.to_string(), Utc::now() - chrono::Duration::seconds(secs_ago));
            }

            fn stops(&self) -> Vec<String> {
                self.stops.lock().clone()
            }
        }

        #[async_trait]
        impl WorkloadControl for SweepDriver {
            async fn is_running(&self, name: &str) -> bool {
                self.running.lock().contains(name)
            }

            async fn start(&self, _name: &str) -> anyhow::Result<()> {
                Ok(())
            }

            async fn stop(&self, name: &str) -> anyhow::Result<()> {
                self.stops.lock().push(name.to_string());
                self.running.lock().remove(name);
                Ok(())
            }

            async fn list(&self) -> HashSet<String> {
                self.running.lock().clone()
            }

            async fn started_at(&self, name: &str) -> Option<DateTime<Utc>> {
                self.started_at.lock().get(name).copied()
            }
        }

        fn snapshot(json: &str) -> ConfigSnapshot {
            let document: ConfigDocument = serde_json::from_str(json).unwrap();
            ConfigSnapshot::from_document(document)
        }

        fn reaper_with(json: &str) -> (IdleReaper, Arc<Engine>, Arc<SweepDriver>) {
            let driver = Arc::new(SweepDriver::new());
            let engine = Engine::new(snapshot(json), driver.clone());
            let (_tx, rx) = watch::channel(false);
            (IdleReaper::new(engine.clone(), rx), engine, driver)
        }

        fn long_ago() -> String {
            (Utc::now() - chrono::Duration::seconds(3600)).to_rfc3339()
        }

        #[tokio::test]
        async fn test_sweep_stops_idle_backend() {
            let json = format!(
                r#"{{
                "containers": {{
                    "b": {{"host": "b.lan", "path": "b", "url": "http://b:80",
                           "idleTimeout": 1, "activatedAt": "{}"}}
                }}
            }}"#,
                long_ago()
            );
            let (reaper, engine, driver) = reaper_with(&json);
            driver.running_since("b", 120);

            // Engine seeded the stamp at construction; age it past the
            // one-second timeout.
            tokio::time::sleep(Duration::from_millis(1100)).await;
            reaper.sweep().await;

            assert_eq!(driver.stops(), vec!["b"]);
            assert!(!engine.activity().is_stopping("b"), "guard cleared afterwards");
        }

        #[tokio::test]
        async fn test_sweep_leaves_recently_started_backend() {
            let json = format!(
                r#"{{
                "containers": {{
                    "b": {{"host": "b.lan", "path": "b", "url": "http://b:80",
                           "idleTimeout": 1, "activatedAt": "{}"}}
                }}
            }}"#,
                long_ago()
            );
            let (reaper, _engine, driver) = reaper_with(&json);
            // Running, but only just started: the startedAt clause vetoes.
            driver.running_since("b", 0);

            tokio::time::sleep(Duration::from_millis(1100)).await;
            reaper.sweep().await;
            assert!(driver.stops().is_empty());
        }

        #[tokio::test]
        async fn test_sweep_ignores_group_members_individually() {
            let json = format!(
                r#"{{
                "containers": {{
                    "m": {{"host": "m.lan", "path": "m", "url": "http://m:80",
                           "idleTimeout": 1, "activatedAt": "{}"}}
                }},
                "groups": {{
                    "g": {{"active": true, "idleTimeout": 0, "containers": ["m"]}}
                }}
            }}"#,
                long_ago()
            );
            let (reaper, _engine, driver) = reaper_with(&json);
            driver.running_since("m", 3600);

            tokio::time::sleep(Duration::from_millis(1100)).await;
            reaper.sweep().await;
            // Member of an active group: individual path must not touch
            // it, and the group timeout of 0 disables the group path.
            assert!(driver.stops().is_empty());
        }

        #[tokio::test]
        async fn test_sweep_group_stop_requires_all_idle() {
            let json = r#"{
                "containers": {
                    "x": {"host": "x.lan", "path": "x", "url": "http://x:80"},
                    "y": {"host": "y.lan", "path": "y", "url": "http://y:80"}
                },
                "order": ["x", "y"],
                "groups": {
                    "g": {"active": true, "idleTimeout": 1, "containers": ["x", "y"]}
                }
            }"#;
            let (reaper, engine, driver) = reaper_with(json);
            driver.running_since("x", 3600);
            driver.running_since("y", 3600);

            tokio::time::sleep(Duration::from_millis(1100)).await;

            // One member just saw traffic: nobody is stopped.
            engine.activity().touch("y");
            reaper.sweep().await;
            assert!(driver.stops().is_empty());

            // Once the fresh member ages past the timeout, the whole
            // group goes down in declared order.
            tokio::time::sleep(Duration::from_millis(1100)).await;
            reaper.sweep().await;
            assert_eq!(driver.stops(), vec!["x", "y"]);
        }

        #[tokio::test]
        async fn test_sweep_zero_timeout_disables_individual_stop() {
            let json = format!(
                r#"{{
                "containers": {{
                    "b": {{"host": "b.lan", "path": "b", "url": "http://b:80",
                           "idleTimeout": 0, "activatedAt": "{}"}}
                }}
            }}"#,
                long_ago()
            );
            let (reaper, _engine, driver) = reaper_with(&json);
            driver.running_since("b", 3600);

            tokio::time::sleep(Duration::from_millis(50)).await;
            reaper.sweep().await;
            assert!(driver.stops().is_empty());
        }
    }
}
