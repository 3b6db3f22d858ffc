//! Group lifecycle rules.
//!
//! Groups move together: a start touches every eligible member in
//! declared order, and a group stop fires only when every single
//! member satisfies the idle predicate. The decision logic lives here
//! as pure functions; the engine and reaper execute the results.

use crate::config::{Backend, ConfigSnapshot, Group};
use std::time::Duration;

/// Observations about one group member gathered during a sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemberProbe {
    pub running: bool,
    /// Time since the member last saw traffic; `None` if never seen.
    pub idle_for: Option<Duration>,
    /// Age of the workload's last start; `None` when unknown.
    pub started_age: Option<Duration>,
}

/// Members eligible for a group start: active and not already running,
/// in declared order.
pub fn startable_members<'a>(
    snapshot: &'a ConfigSnapshot,
    group: &Group,
    running: impl Fn(&str) -> bool,
) -> Vec<&'a Backend> {
    group
        .members
        .iter()
        .filter_map(|name| snapshot.backend(name))
        .filter(|backend| backend.active && !running(&backend.name))
        .collect()
}

/// One member's contribution to the group-idle predicate. Every clause
/// must hold: running, backend-active, idle beyond the group timeout,
/// and started longer ago than the group timeout.
pub fn member_idle(backend: &Backend, probe: &MemberProbe, group_timeout: Duration) -> bool {
    backend.active
        && probe.running
        && probe.idle_for.is_some_and(|idle| idle > group_timeout)
        && probe.started_age.is_some_and(|age| age > group_timeout)
}

/// The group-idle predicate: true only when every member individually
/// passes [`member_idle`]. Any failing member vetoes the stop.
pub fn group_idle(
    group: &Group,
    snapshot: &ConfigSnapshot,
    probe_of: impl Fn(&str) -> MemberProbe,
) -> bool {
    if group.idle_timeout == 0 || group.members.is_empty() {
        return false;
    }
    let timeout = Duration::from_secs(group.idle_timeout);
    group.members.iter().all(|name| match snapshot.backend(name) {
        Some(backend) => member_idle(backend, &probe_of(name), timeout),
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigDocument, ConfigSnapshot};

    fn snapshot() -> ConfigSnapshot {
        let document: ConfigDocument = serde_json::from_str(
            r#"{
            "containers": {
                "x": {"host": "x.lan", "path": "x", "url": "http://x", "idleTimeout": 30},
                "y": {"host": "y.lan", "path": "y", "url": "http://y", "idleTimeout": 30},
                "off": {"host": "off.lan", "path": "off", "url": "http://off", "active": false}
            },
            "order": ["x", "y", "off"],
            "groups": {
                "g": {"active": true, "idleTimeout": 30, "containers": ["x", "y"]},
                "empty": {"active": true, "idleTimeout": 30},
                "zero": {"active": true, "idleTimeout": 0, "containers": ["x"]}
            }
        }"#,
        )
        .unwrap();
        ConfigSnapshot::from_document(document)
    }

    fn idle_probe() -> MemberProbe {
        MemberProbe {
            running: true,
            idle_for: Some(Duration::from_secs(40)),
            started_age: Some(Duration::from_secs(120)),
        }
    }

    #[test]
    fn test_startable_skips_inactive_and_running() {
        let snapshot = snapshot();
        let group = Group {
            name: "g".to_string(),
            active: true,
            idle_timeout: 30,
            members: vec!["x".to_string(), "y".to_string(), "off".to_string()],
        };

        let eligible = startable_members(&snapshot, &group, |name| name == "x");
        let names: Vec<&str> = eligible.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["y"], "x is running, off is inactive");
    }

    #[test]
    fn test_group_idle_all_members_idle() {
        let snapshot = snapshot();
        let group = snapshot.group("g").unwrap();
        assert!(group_idle(group, &snapshot, |_| idle_probe()));
    }

    #[test]
    fn test_group_idle_vetoed_by_fresh_member() {
        let snapshot = snapshot();
        let group = snapshot.group("g").unwrap();
        let fresh = MemberProbe {
            running: true,
            idle_for: Some(Duration::from_secs(10)),
            started_age: Some(Duration::from_secs(120)),
        };
        assert!(!group_idle(group, &snapshot, |name| {
            if name == "y" {
                fresh
            } else {
                idle_probe()
            }
        }));
    }

    #[test]
    fn test_group_idle_vetoed_by_recent_start() {
        let snapshot = snapshot();
        let group = snapshot.group("g").unwrap();
        let just_started = MemberProbe {
            running: true,
            idle_for: Some(Duration::from_secs(40)),
            started_age: Some(Duration::from_secs(5)),
        };
        assert!(!group_idle(group, &snapshot, |name| {
            if name == "x" {
                just_started
            } else {
                idle_probe()
            }
        }));
    }

    #[test]
    fn test_group_idle_vetoed_by_stopped_member() {
        let snapshot = snapshot();
        let group = snapshot.group("g").unwrap();
        let stopped = MemberProbe {
            running: false,
            ..idle_probe()
        };
        assert!(!group_idle(group, &snapshot, |name| {
            if name == "x" {
                stopped
            } else {
                idle_probe()
            }
        }));
    }

    #[test]
    fn test_group_idle_requires_started_age() {
        let snapshot = snapshot();
        let group = snapshot.group("g").unwrap();
        let unknown_start = MemberProbe {
            started_age: None,
            ..idle_probe()
        };
        assert!(!group_idle(group, &snapshot, |_| unknown_start));
    }

    #[test]
    fn test_empty_group_never_idle() {
        let snapshot = snapshot();
        let group = snapshot.group("empty").unwrap();
        assert!(!group_idle(group, &snapshot, |_| idle_probe()));
    }

    #[test]
    fn test_zero_timeout_disables_group_stop() {
        let snapshot = snapshot();
        let group = snapshot.group("zero").unwrap();
        assert!(!group_idle(group, &snapshot, |_| idle_probe()));
    }
}
