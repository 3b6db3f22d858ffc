//! The workload-control abstraction.
//!
//! Two control planes hide behind one capability trait: the container
//! runtime (Docker, local socket or remote daemon) and the Proxmox VE
//! REST API. Which one handles a backend is decided purely by the
//! shape of its name: composite `label:vmid@node` names belong to the
//! virtualization driver, everything else to the runtime driver.

use crate::config::PveApiConfig;
use crate::docker::DockerDriver;
use crate::proxmox::PveDriver;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Deadline for status queries (`is_running`, `started_at`, `list`).
pub const STATUS_DEADLINE: Duration = Duration::from_secs(3);

/// Deadline for issuing a start/stop call.
pub const CONTROL_DEADLINE: Duration = Duration::from_secs(10);

/// Overall cap on confirming a start/stop transition.
pub const CONFIRM_DEADLINE: Duration = Duration::from_secs(30);

/// Poll spacing while confirming a transition.
pub const CONFIRM_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Uniform control contract over heterogeneous workloads.
///
/// Status queries degrade rather than fail: an unreachable control
/// plane reads as "not running" / "unknown". Start and stop are
/// no-ops when the workload is already in the requested state.
#[async_trait]
pub trait WorkloadControl: Send + Sync {
    async fn is_running(&self, name: &str) -> bool;
    async fn start(&self, name: &str) -> anyhow::Result<()>;
    async fn stop(&self, name: &str) -> anyhow::Result<()>;
    /// Names known to the control plane; empty on error.
    async fn list(&self) -> HashSet<String>;
    /// Instant the workload was last started, if it can be determined.
    async fn started_at(&self, name: &str) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Runtime,
    Virtualization,
}

/// Select a driver from the backend name alone. Composite
/// `label:vmid@node` names route to the virtualization driver.
pub fn driver_kind(name: &str) -> DriverKind {
    if name.contains(':') && name.contains('@') {
        DriverKind::Virtualization
    } else {
        DriverKind::Runtime
    }
}

/// The concrete driver pair behind [`WorkloadControl`].
///
/// The runtime half is fixed at startup; the virtualization half is
/// rebuilt whenever `apiKeys.pve` changes in the configuration.
pub struct DriverSet {
    docker: Option<Arc<DockerDriver>>,
    pve: RwLock<Option<(PveApiConfig, Arc<PveDriver>)>>,
}

impl DriverSet {
    pub fn new(docker: Option<Arc<DockerDriver>>) -> Self {
        Self {
            docker,
            pve: RwLock::new(None),
        }
    }

    /// Apply the virtualization credentials from a fresh snapshot.
    /// Rebuilds the client only when the settings actually changed.
    pub fn reconfigure_pve(&self, config: Option<&PveApiConfig>) {
        let mut slot = self.pve.write();
        match config {
            None => {
                if slot.take().is_some() {
                    info!("Virtualization driver disabled, apiKeys.pve removed");
                }
            }
            Some(config) => {
                if slot.as_ref().is_some_and(|(held, _)| held == config) {
                    return;
                }
                match PveDriver::new(config) {
                    Ok(driver) => {
                        info!(
                            hostname = %config.hostname,
                            node = %config.node,
                            "Virtualization driver configured"
                        );
                        *slot = Some((config.clone(), Arc::new(driver)));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to build virtualization driver");
                        *slot = None;
                    }
                }
            }
        }
    }

    fn pve(&self) -> Option<Arc<PveDriver>> {
        self.pve.read().as_ref().map(|(_, driver)| Arc::clone(driver))
    }
}

#[async_trait]
impl WorkloadControl for DriverSet {
    async fn is_running(&self, name: &str) -> bool {
        match driver_kind(name) {
            DriverKind::Runtime => match &self.docker {
                Some(docker) => docker.is_running(name).await,
                None => false,
            },
            DriverKind::Virtualization => match self.pve() {
                Some(pve) => pve.is_running(name).await,
                None => false,
            },
        }
    }

    async fn start(&self, name: &str) -> anyhow::Result<()> {
        match driver_kind(name) {
            DriverKind::Runtime => match &self.docker {
                Some(docker) => docker.start(name).await,
                None => anyhow::bail!("no container runtime available for '{}'", name),
            },
            DriverKind::Virtualization => match self.pve() {
                Some(pve) => pve.start(name).await,
                None => anyhow::bail!("virtualization driver not configured for '{}'", name),
            },
        }
    }

    async fn stop(&self, name: &str) -> anyhow::Result<()> {
        match driver_kind(name) {
            DriverKind::Runtime => match &self.docker {
                Some(docker) => docker.stop(name).await,
                None => anyhow::bail!("no container runtime available for '{}'", name),
            },
            DriverKind::Virtualization => match self.pve() {
                Some(pve) => pve.stop(name).await,
                None => anyhow::bail!("virtualization driver not configured for '{}'", name),
            },
        }
    }

    async fn list(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        if let Some(docker) = &self.docker {
            names.extend(docker.list().await);
        }
        if let Some(pve) = self.pve() {
            names.extend(pve.list().await);
        }
        names
    }

    async fn started_at(&self, name: &str) -> Option<DateTime<Utc>> {
        match driver_kind(name) {
            DriverKind::Runtime => match &self.docker {
                Some(docker) => docker.started_at(name).await,
                None => None,
            },
            DriverKind::Virtualization => match self.pve() {
                Some(pve) => pve.started_at(name).await,
                None => None,
            },
        }
    }
}

/// Bound a status future by [`STATUS_DEADLINE`], defaulting on expiry.
pub async fn with_status_deadline<T, F>(fut: F, fallback: T) -> T
where
    F: std::future::Future<Output = T>,
{
    match tokio::time::timeout(STATUS_DEADLINE, fut).await {
        Ok(value) => value,
        Err(_) => {
            warn!("Driver status call exceeded deadline");
            fallback
        }
    }
}
