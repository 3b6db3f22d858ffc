//! Virtualization driver for Proxmox VE LXC backends.
//!
//! Backends named `label:vmid@node` are controlled through the PVE
//! REST API over TLS, authenticated by a static API token. Start and
//! stop issue the endpoint call and then poll the instance status at
//! 1 Hz until the transition is confirmed or the 30 s cap expires.

use crate::config::PveApiConfig;
use crate::driver::{
    WorkloadControl, CONFIRM_DEADLINE, CONFIRM_POLL_INTERVAL, CONTROL_DEADLINE, STATUS_DEADLINE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// A parsed composite backend name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PveTarget {
    pub label: String,
    pub vmid: u32,
    pub node: String,
}

/// Parse `label:vmid@node`. Returns `None` for any other shape.
pub fn parse_target(name: &str) -> Option<PveTarget> {
    let (label, rest) = name.split_once(':')?;
    let (vmid, node) = rest.split_once('@')?;
    if label.is_empty() || node.is_empty() {
        return None;
    }
    let vmid: u32 = vmid.parse().ok()?;
    Some(PveTarget {
        label: label.to_string(),
        vmid,
        node: node.to_string(),
    })
}

/// The PVE response envelope: everything lives under `data`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct LxcStatus {
    status: Option<String>,
    uptime: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct LxcEntry {
    vmid: Option<serde_json::Value>,
    name: Option<String>,
}

/// Driver over the Proxmox VE REST API.
pub struct PveDriver {
    client: reqwest::Client,
    base: String,
    node: String,
    auth: String,
}

impl PveDriver {
    pub fn new(config: &PveApiConfig) -> anyhow::Result<Self> {
        // Hypervisor nodes commonly run self-signed certificates.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            client,
            base: format!("https://{}:{}", config.hostname, config.port),
            node: config.node.clone(),
            auth: format!(
                "PVEAPIToken={}!{}={}",
                config.user, config.token_id, config.token
            ),
        })
    }

    fn status_url(&self, target: &PveTarget) -> String {
        format!(
            "{}/api2/json/nodes/{}/lxc/{}/status/current",
            self.base, target.node, target.vmid
        )
    }

    fn action_url(&self, target: &PveTarget, action: &str) -> String {
        format!(
            "{}/api2/json/nodes/{}/lxc/{}/status/{}",
            self.base, target.node, target.vmid, action
        )
    }

    async fn current_status(&self, target: &PveTarget) -> Option<LxcStatus> {
        let response = self
            .client
            .get(self.status_url(target))
            .header(reqwest::header::AUTHORIZATION, &self.auth)
            .timeout(STATUS_DEADLINE)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!(vmid = target.vmid, status = %response.status(), "Status query rejected");
            return None;
        }
        response
            .json::<Envelope<LxcStatus>>()
            .await
            .ok()
            .and_then(|envelope| envelope.data)
    }

    async fn running(&self, target: &PveTarget) -> bool {
        self.current_status(target)
            .await
            .and_then(|s| s.status)
            .is_some_and(|s| s == "running")
    }

    async fn post_action(&self, target: &PveTarget, action: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .post(self.action_url(target, action))
            .header(reqwest::header::AUTHORIZATION, &self.auth)
            .timeout(CONTROL_DEADLINE)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("PVE {} call for vmid {} failed: {}", action, target.vmid, e))?;
        if !response.status().is_success() {
            anyhow::bail!(
                "PVE {} call for vmid {} returned {}",
                action,
                target.vmid,
                response.status()
            );
        }
        Ok(())
    }

    /// Poll until the instance reports the wanted state, at most
    /// [`CONFIRM_DEADLINE`] / [`CONFIRM_POLL_INTERVAL`] iterations.
    async fn confirm_transition(&self, target: &PveTarget, want_running: bool) -> bool {
        let attempts = (CONFIRM_DEADLINE.as_secs() / CONFIRM_POLL_INTERVAL.as_secs()).max(1);
        for _ in 0..attempts {
            if self.running(target).await == want_running {
                return true;
            }
            tokio::time::sleep(CONFIRM_POLL_INTERVAL).await;
        }
        false
    }
}

#[async_trait]
impl WorkloadControl for PveDriver {
    async fn is_running(&self, name: &str) -> bool {
        match parse_target(name) {
            Some(target) => self.running(&target).await,
            None => false,
        }
    }

    async fn start(&self, name: &str) -> anyhow::Result<()> {
        let target = parse_target(name)
            .ok_or_else(|| anyhow::anyhow!("'{}' is not a valid PVE backend name", name))?;
        if self.running(&target).await {
            debug!(name, "Instance already running");
            return Ok(());
        }
        self.post_action(&target, "start").await?;
        if self.confirm_transition(&target, true).await {
            info!(name, vmid = target.vmid, node = %target.node, "Instance started");
            Ok(())
        } else {
            anyhow::bail!(
                "instance '{}' did not reach running within {:?}",
                name,
                CONFIRM_DEADLINE
            )
        }
    }

    async fn stop(&self, name: &str) -> anyhow::Result<()> {
        let target = parse_target(name)
            .ok_or_else(|| anyhow::anyhow!("'{}' is not a valid PVE backend name", name))?;
        if !self.running(&target).await {
            debug!(name, "Instance already stopped");
            return Ok(());
        }
        self.post_action(&target, "stop").await?;
        if self.confirm_transition(&target, false).await {
            info!(name, vmid = target.vmid, node = %target.node, "Instance stopped");
            Ok(())
        } else {
            anyhow::bail!(
                "instance '{}' did not stop within {:?}",
                name,
                CONFIRM_DEADLINE
            )
        }
    }

    async fn list(&self) -> HashSet<String> {
        let url = format!("{}/api2/json/nodes/{}/lxc", self.base, self.node);
        let response = match self
            .client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, &self.auth)
            .timeout(STATUS_DEADLINE)
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(status = %r.status(), "Instance list rejected");
                return HashSet::new();
            }
            Err(e) => {
                warn!(error = %e, "Instance list failed");
                return HashSet::new();
            }
        };

        let entries = match response.json::<Envelope<Vec<LxcEntry>>>().await {
            Ok(envelope) => envelope.data.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Instance list unreadable");
                return HashSet::new();
            }
        };

        entries
            .into_iter()
            .filter_map(|entry| {
                let vmid = vmid_string(entry.vmid.as_ref())?;
                let label = entry.name.unwrap_or_else(|| format!("lxc{}", vmid));
                Some(format!("{}:{}@{}", label, vmid, self.node))
            })
            .collect()
    }

    async fn started_at(&self, name: &str) -> Option<DateTime<Utc>> {
        let target = parse_target(name)?;
        let status = self.current_status(&target).await?;
        let uptime = status.uptime.filter(|&u| u > 0)?;
        Some(uptime_to_started_at(Utc::now(), uptime))
    }
}

/// The API reports uptime in seconds; the start instant is `now − uptime`.
fn uptime_to_started_at(now: DateTime<Utc>, uptime_secs: i64) -> DateTime<Utc> {
    now - chrono::Duration::seconds(uptime_secs)
}

/// The list endpoint reports `vmid` as a number on current releases
/// and as a string on some older ones.
fn vmid_string(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_target() {
        let target = parse_target("ubuntu:104@pve1").unwrap();
        assert_eq!(target.label, "ubuntu");
        assert_eq!(target.vmid, 104);
        assert_eq!(target.node, "pve1");
    }

    #[test]
    fn test_parse_target_rejects_other_shapes() {
        assert!(parse_target("nginx").is_none());
        assert!(parse_target("registry:5000").is_none());
        assert!(parse_target("user@host").is_none());
        assert!(parse_target(":104@pve1").is_none());
        assert!(parse_target("ubuntu:104@").is_none());
        assert!(parse_target("ubuntu:vm@pve1").is_none(), "vmid must be numeric");
    }

    #[test]
    fn test_urls_and_auth_header() {
        let driver = PveDriver::new(&PveApiConfig {
            hostname: "pve.lan".to_string(),
            port: 8006,
            node: "pve1".to_string(),
            user: "root@pam".to_string(),
            token_id: "proxy".to_string(),
            token: "secret".to_string(),
        })
        .unwrap();

        let target = parse_target("ubuntu:104@pve1").unwrap();
        assert_eq!(
            driver.status_url(&target),
            "https://pve.lan:8006/api2/json/nodes/pve1/lxc/104/status/current"
        );
        assert_eq!(
            driver.action_url(&target, "start"),
            "https://pve.lan:8006/api2/json/nodes/pve1/lxc/104/status/start"
        );
        assert_eq!(driver.auth, "PVEAPIToken=root@pam!proxy=secret");
    }

    #[test]
    fn test_uptime_to_started_at() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let started = uptime_to_started_at(now, 3600);
        assert_eq!(started, Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_vmid_string_accepts_number_and_string() {
        assert_eq!(
            vmid_string(Some(&serde_json::json!(104))).as_deref(),
            Some("104")
        );
        assert_eq!(
            vmid_string(Some(&serde_json::json!("104"))).as_deref(),
            Some("104")
        );
        assert!(vmid_string(Some(&serde_json::json!(null))).is_none());
        assert!(vmid_string(None).is_none());
    }

    #[test]
    fn test_status_envelope_parses() {
        let status: Envelope<LxcStatus> =
            serde_json::from_str(r#"{"data": {"status": "running", "uptime": 120}}"#).unwrap();
        let data = status.data.unwrap();
        assert_eq!(data.status.as_deref(), Some("running"));
        assert_eq!(data.uptime, Some(120));
    }
}
