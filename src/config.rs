//! Configuration document handling.
//!
//! The proxy consumes a JSON document owned by the admin layer. It is
//! read-only from the engine's point of view: this module parses it,
//! normalizes it into an immutable [`ConfigSnapshot`], and watches the
//! file for changes. Documents that fail to parse are rejected and the
//! previous snapshot stays in effect.

use anyhow::Context;
use chrono::{DateTime, Utc};
use notify::{RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Poll interval for configuration change detection.
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The configuration document as persisted by the admin layer.
///
/// All keys are camelCase on disk. Unknown fields are ignored so the
/// admin layer can evolve the document without breaking the engine.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigDocument {
    /// Backends keyed by name.
    pub containers: HashMap<String, BackendConfig>,
    /// Display/iteration order for backends; names missing from the
    /// vector are appended in sorted order.
    pub order: Vec<String>,
    /// Groups keyed by name.
    pub groups: HashMap<String, GroupConfig>,
    /// Display/iteration order for groups.
    pub group_order: Vec<String>,
    /// Time-based start/stop rules.
    pub schedules: Vec<ScheduleRule>,
    /// Credentials for external control planes.
    pub api_keys: ApiKeys,
}

/// A single backend entry in the document.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Display name only; never used for routing.
    pub friendly_name: Option<String>,

    /// Inbound `Host` header that maps to this backend.
    pub host: Option<String>,

    /// First-path-segment key, used when `Host` matching fails.
    pub path: Option<String>,

    /// Upstream origin traffic is forwarded to, e.g. `http://app:8080`.
    pub url: Option<String>,

    /// Idle timeout in seconds; `0` disables idle-based stopping.
    #[serde(default)]
    pub idle_timeout: u64,

    /// Inactive backends are never auto-started and reject traffic.
    #[serde(default = "default_active")]
    pub active: bool,

    /// Instant `active` most recently transitioned to `true`; written
    /// by the admin layer, only ever read here.
    pub activated_at: Option<DateTime<Utc>>,
}

/// A group entry: lifecycle operations apply to all members together.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    #[serde(default = "default_active")]
    pub active: bool,

    /// Group-level idle timeout in seconds; `0` disables group stops.
    #[serde(default)]
    pub idle_timeout: u64,

    /// Member backend names, a single name or a list.
    #[serde(default)]
    pub containers: Members,
}

/// Group membership as written by the admin layer: one name or many.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum Members {
    One(String),
    Many(Vec<String>),
}

impl Default for Members {
    fn default() -> Self {
        Members::Many(Vec::new())
    }
}

impl Members {
    /// Normalize to an ordered list of names.
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Members::One(name) => vec![name],
            Members::Many(names) => names,
        }
    }
}

/// A schedule rule: a target plus its timers.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRule {
    /// Backend or group name the rule applies to.
    pub target: String,
    pub target_type: TargetType,
    #[serde(default)]
    pub timers: Vec<Timer>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Container,
    Group,
}

/// A single wall-clock timer within a schedule rule.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Timer {
    /// Days of week the timer applies to; 0 = Sunday.
    #[serde(default)]
    pub days: Vec<u8>,
    /// Local time to start the target, as `HH:MM`.
    pub start_time: Option<String>,
    /// Local time to stop the target, as `HH:MM`.
    pub stop_time: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

/// External control-plane credentials.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ApiKeys {
    /// Proxmox VE API token; absent disables the virtualization driver.
    pub pve: Option<PveApiConfig>,
}

/// Proxmox VE connection settings.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PveApiConfig {
    pub hostname: String,
    #[serde(default = "default_pve_port")]
    pub port: u16,
    /// Default node, used when listing known instances.
    pub node: String,
    /// API user including realm, e.g. `root@pam`.
    pub user: String,
    pub token_id: String,
    pub token: String,
}

fn default_active() -> bool {
    true
}

fn default_pve_port() -> u16 {
    8006
}

/// A backend after normalization, carrying its name.
#[derive(Debug, Clone)]
pub struct Backend {
    pub name: String,
    pub friendly_name: Option<String>,
    pub host: Option<String>,
    pub path: Option<String>,
    pub url: Option<String>,
    pub idle_timeout: u64,
    pub active: bool,
    pub activated_at: Option<DateTime<Utc>>,
}

/// A group after normalization: members resolved to an ordered list.
#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub active: bool,
    pub idle_timeout: u64,
    pub members: Vec<String>,
}

/// An immutable view of one configuration generation.
///
/// Snapshots are swapped atomically behind the engine's lock; a reader
/// holds one coherent snapshot for the duration of a request or tick.
#[derive(Debug, Default)]
pub struct ConfigSnapshot {
    backends: Vec<Backend>,
    by_name: HashMap<String, usize>,
    groups: Vec<Group>,
    group_by_name: HashMap<String, usize>,
    pub schedules: Vec<ScheduleRule>,
    pub pve: Option<PveApiConfig>,
}

impl ConfigSnapshot {
    /// Load and normalize the document at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        let document: ConfigDocument = serde_json::from_str(&content)
            .with_context(|| format!("parsing configuration file {}", path.display()))?;
        Ok(Self::from_document(document))
    }

    /// Normalize a parsed document.
    pub fn from_document(document: ConfigDocument) -> Self {
        let backend_order = ordered_names(document.containers.keys(), &document.order);
        let mut backends = Vec::with_capacity(backend_order.len());
        let mut by_name = HashMap::with_capacity(backend_order.len());
        let mut containers = document.containers;
        for name in backend_order {
            let Some(config) = containers.remove(&name) else {
                continue;
            };
            by_name.insert(name.clone(), backends.len());
            backends.push(Backend {
                name,
                friendly_name: config.friendly_name,
                host: config.host,
                path: config.path,
                url: config.url,
                idle_timeout: config.idle_timeout,
                active: config.active,
                activated_at: config.activated_at,
            });
        }

        let group_order = ordered_names(document.groups.keys(), &document.group_order);
        let mut groups = Vec::with_capacity(group_order.len());
        let mut group_by_name = HashMap::with_capacity(group_order.len());
        let mut group_configs = document.groups;
        for name in group_order {
            let Some(config) = group_configs.remove(&name) else {
                continue;
            };
            group_by_name.insert(name.clone(), groups.len());
            groups.push(Group {
                name,
                active: config.active,
                idle_timeout: config.idle_timeout,
                members: config.containers.into_vec(),
            });
        }

        Self {
            backends,
            by_name,
            groups,
            group_by_name,
            schedules: document.schedules,
            pve: document.api_keys.pve,
        }
    }

    /// All backends in document order.
    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn backend(&self, name: &str) -> Option<&Backend> {
        self.by_name.get(name).map(|&i| &self.backends[i])
    }

    /// All groups in document order.
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.group_by_name.get(name).map(|&i| &self.groups[i])
    }

    /// Exact (case-insensitive) match of an inbound host.
    pub fn match_host(&self, host: &str) -> Option<&Backend> {
        self.backends.iter().find(|b| {
            b.host
                .as_deref()
                .is_some_and(|h| h.eq_ignore_ascii_case(host))
        })
    }

    /// Match by first path segment.
    pub fn match_path_segment(&self, segment: &str) -> Option<&Backend> {
        self.backends
            .iter()
            .find(|b| b.path.as_deref().is_some_and(|p| p == segment))
    }

    /// Whether `name` is a member of any active group. Such backends
    /// are exempt from individual idle evaluation.
    pub fn in_active_group(&self, name: &str) -> bool {
        self.groups
            .iter()
            .any(|g| g.active && g.members.iter().any(|m| m == name))
    }

    /// The first active group containing `name`, if any.
    pub fn active_group_of(&self, name: &str) -> Option<&Group> {
        self.groups
            .iter()
            .find(|g| g.active && g.members.iter().any(|m| m == name))
    }

    /// Set of all configured backend names.
    pub fn backend_names(&self) -> HashSet<String> {
        self.backends.iter().map(|b| b.name.clone()).collect()
    }
}

/// Names from `order` first (skipping unknowns), then the remainder in
/// sorted order so iteration stays deterministic.
fn ordered_names<'a>(
    keys: impl Iterator<Item = &'a String>,
    order: &[String],
) -> Vec<String> {
    let known: HashSet<&String> = keys.collect();
    let mut out: Vec<String> = order
        .iter()
        .filter(|n| known.contains(n))
        .cloned()
        .collect();
    let placed: HashSet<&String> = out.iter().collect();
    let mut rest: Vec<String> = known
        .iter()
        .filter(|n| !placed.contains(*n))
        .map(|n| (*n).clone())
        .collect();
    rest.sort();
    out.extend(rest);
    out
}

/// Watch the configuration file and invoke `on_reload` with each
/// successfully parsed snapshot. Parse failures keep the previous
/// snapshot in effect and are only logged.
pub fn spawn_config_watcher<F>(
    path: PathBuf,
    mut shutdown_rx: watch::Receiver<bool>,
    on_reload: F,
) -> anyhow::Result<()>
where
    F: Fn(ConfigSnapshot) + Send + Sync + 'static,
{
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(8);

    let mut watcher = notify::PollWatcher::new(
        move |result: Result<notify::Event, notify::Error>| {
            if result.is_ok() {
                let _ = tx.blocking_send(());
            }
        },
        notify::Config::default().with_poll_interval(WATCH_POLL_INTERVAL),
    )?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;
    info!(path = %path.display(), "Watching configuration file");

    tokio::spawn(async move {
        // The watcher must stay alive for as long as this task runs.
        let _watcher = watcher;
        loop {
            tokio::select! {
                event = rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                    // Collapse bursts of events into one reload.
                    while rx.try_recv().is_ok() {}
                    match ConfigSnapshot::load(&path) {
                        Ok(snapshot) => {
                            info!(
                                path = %path.display(),
                                backends = snapshot.backends().len(),
                                groups = snapshot.groups().len(),
                                "Configuration reloaded"
                            );
                            on_reload(snapshot);
                        }
                        Err(e) => {
                            error!(path = %path.display(), error = %e, "Configuration reload failed, keeping previous snapshot");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Configuration watcher shutting down");
                        break;
                    }
                }
            }
        }
    });

    Ok(())
}
