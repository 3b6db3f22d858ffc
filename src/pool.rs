//! Pooled HTTP client for upstream backends.
//!
//! One shared client keeps idle connections per upstream origin so
//! repeat traffic to a woken backend skips the TCP handshake. A
//! dedicated client with an empty body type serves readiness probes.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Deadline for the admin readiness probe.
const PROBE_DEADLINE: Duration = Duration::from_secs(5);

/// Configuration for the upstream pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per upstream origin.
    pub max_idle_per_host: usize,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A pooled client for forwarding requests to backend origins.
pub struct UpstreamPool {
    client: Client<HttpConnector, Incoming>,
    probe_client: Client<HttpConnector, Empty<Bytes>>,
}

impl UpstreamPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        // Both clients share one tuned builder; they differ only in
        // their body type.
        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream pool initialized"
        );

        Self {
            client: builder.build(connector.clone()),
            probe_client: builder.build(connector),
        }
    }

    /// Forward `req` to `origin` (e.g. `http://app:8080`), preserving
    /// the original path and query.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        origin: &str,
    ) -> anyhow::Result<Response<BoxBody<Bytes, hyper::Error>>> {
        let uri = join_origin(origin, req.uri().path_and_query().map(|pq| pq.as_str()));

        let (parts, body) = req.into_parts();
        let mut forwarded = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            forwarded = forwarded.header(key, value);
        }
        let forwarded = forwarded
            .body(body)
            .map_err(|e| anyhow::anyhow!("assembling upstream request for {}: {}", uri, e))?;

        let response = self
            .client
            .request(forwarded)
            .await
            .map_err(|e| anyhow::anyhow!("forwarding to {}: {}", uri, e))?;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Readiness probe: `GET {origin}/` answered with 200 within 5 s.
    pub async fn probe(&self, origin: &str) -> bool {
        let uri = join_origin(origin, Some("/"));
        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        match tokio::time::timeout(PROBE_DEADLINE, self.probe_client.request(req)).await {
            Ok(Ok(response)) => response.status() == StatusCode::OK,
            Ok(Err(_)) | Err(_) => false,
        }
    }
}

/// Join an upstream origin with a request path-and-query.
fn join_origin(origin: &str, path_and_query: Option<&str>) -> String {
    format!(
        "{}{}",
        origin.trim_end_matches('/'),
        path_and_query.unwrap_or("/")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_origin() {
        assert_eq!(
            join_origin("http://app:8080", Some("/a/b?x=1")),
            "http://app:8080/a/b?x=1"
        );
        assert_eq!(join_origin("http://app:8080/", Some("/")), "http://app:8080/");
        assert_eq!(join_origin("http://app:8080", None), "http://app:8080/");
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }
}
