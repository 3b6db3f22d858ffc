//! Container-runtime driver for Docker-managed backends.
//!
//! Talks to the daemon either over the local unix socket or via a
//! remote socket-proxy daemon (`DOCKER_PROXY_URL`). When both are
//! available the remote path wins.

use crate::driver::{with_status_deadline, WorkloadControl, CONTROL_DEADLINE};
use async_trait::async_trait;
use bollard::container::{ListContainersOptions, StartContainerOptions, StopContainerOptions};
use bollard::Docker;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Well-known local control socket. Its presence enables the local
/// driver when no remote daemon is configured.
pub const LOCAL_SOCKET: &str = "/var/run/docker.sock";

/// Seconds the daemon is given before force-killing on stop.
const STOP_GRACE_SECS: i64 = 10;

/// Driver over the Docker API.
pub struct DockerDriver {
    client: Docker,
}

impl DockerDriver {
    /// Connect to the runtime. A remote socket-proxy daemon is
    /// preferred when configured; otherwise the local socket is used
    /// if present.
    pub fn connect(proxy_url: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(url) = proxy_url {
            let url = normalize_proxy_url(url);
            info!(url = %url, "Using remote Docker daemon");
            Docker::connect_with_http(&url, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to remote daemon '{}': {}", url, e))?
        } else if Path::new(LOCAL_SOCKET).exists() {
            info!(socket = LOCAL_SOCKET, "Using local Docker socket");
            Docker::connect_with_socket(LOCAL_SOCKET, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| {
                    anyhow::anyhow!("Cannot connect to socket '{}': {}", LOCAL_SOCKET, e)
                })?
        } else {
            anyhow::bail!(
                "No container runtime reachable: set DOCKER_PROXY_URL or provide {}",
                LOCAL_SOCKET
            );
        };

        Ok(Self { client })
    }

    async fn inspect_running(&self, name: &str) -> bool {
        match self.client.inspect_container(name, None).await {
            Ok(info) => info.state.and_then(|s| s.running).unwrap_or(false),
            Err(e) => {
                debug!(name, error = %e, "Container inspect failed, treating as not running");
                false
            }
        }
    }
}

#[async_trait]
impl WorkloadControl for DockerDriver {
    async fn is_running(&self, name: &str) -> bool {
        with_status_deadline(self.inspect_running(name), false).await
    }

    async fn start(&self, name: &str) -> anyhow::Result<()> {
        let call = self
            .client
            .start_container(name, None::<StartContainerOptions<String>>);
        match tokio::time::timeout(CONTROL_DEADLINE, call).await {
            Ok(Ok(())) => {
                info!(name, "Container started");
                Ok(())
            }
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304,
                ..
            })) => {
                debug!(name, "Container was already running");
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow::anyhow!("Failed to start container '{}': {}", name, e)),
            Err(_) => Err(anyhow::anyhow!(
                "Timed out starting container '{}' after {:?}",
                name,
                CONTROL_DEADLINE
            )),
        }
    }

    async fn stop(&self, name: &str) -> anyhow::Result<()> {
        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        let call = self.client.stop_container(name, Some(options));
        match tokio::time::timeout(CONTROL_DEADLINE, call).await {
            Ok(Ok(())) => {
                info!(name, "Container stopped");
                Ok(())
            }
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304,
                ..
            })) => {
                debug!(name, "Container was already stopped");
                Ok(())
            }
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            })) => {
                debug!(name, "Container not found");
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow::anyhow!("Failed to stop container '{}': {}", name, e)),
            Err(_) => Err(anyhow::anyhow!(
                "Timed out stopping container '{}' after {:?}",
                name,
                CONTROL_DEADLINE
            )),
        }
    }

    async fn list(&self) -> HashSet<String> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let call = self.client.list_containers(Some(options));
        match with_status_deadline(call, Ok(Vec::new())).await {
            Ok(containers) => containers
                .into_iter()
                .flat_map(|c| c.names.unwrap_or_default())
                .map(|n| strip_name_prefix(&n).to_string())
                .collect(),
            Err(e) => {
                warn!(error = %e, "Container list failed");
                HashSet::new()
            }
        }
    }

    async fn started_at(&self, name: &str) -> Option<DateTime<Utc>> {
        let call = self.client.inspect_container(name, None);
        match with_status_deadline(call, Err(bollard::errors::Error::RequestTimeoutError)).await {
            Ok(info) => info
                .state
                .and_then(|s| s.started_at)
                .and_then(|raw| parse_started_at(&raw)),
            Err(e) => {
                debug!(name, error = %e, "Container inspect failed, no start time");
                None
            }
        }
    }
}

/// Remote daemons are configured as `tcp://host:port`; bollard wants
/// an http scheme.
fn normalize_proxy_url(url: &str) -> String {
    match url.strip_prefix("tcp://") {
        Some(rest) => format!("http://{}", rest),
        None => url.to_string(),
    }
}

/// The API reports names with a leading slash.
fn strip_name_prefix(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

/// The daemon's `StartedAt` is RFC 3339; containers that never ran
/// report a zero timestamp, which counts as "no start time".
fn parse_started_at(raw: &str) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw).ok()?.with_timezone(&Utc);
    if parsed.timestamp() <= 0 {
        return None;
    }
    Some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_proxy_url() {
        assert_eq!(
            normalize_proxy_url("tcp://docker-proxy:2375"),
            "http://docker-proxy:2375"
        );
        assert_eq!(
            normalize_proxy_url("http://docker-proxy:2375"),
            "http://docker-proxy:2375"
        );
    }

    #[test]
    fn test_strip_name_prefix() {
        assert_eq!(strip_name_prefix("/nginx"), "nginx");
        assert_eq!(strip_name_prefix("nginx"), "nginx");
    }

    #[test]
    fn test_parse_started_at() {
        let parsed = parse_started_at("2026-03-01T12:00:00.000000000Z").unwrap();
        assert_eq!(parsed.timestamp(), 1772366400);

        // Never-started containers report the zero instant.
        assert!(parse_started_at("0001-01-01T00:00:00Z").is_none());
        assert!(parse_started_at("garbage").is_none());
    }
}
