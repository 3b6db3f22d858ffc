//! Companion admin API.
//!
//! Listens on `UI_PORT` when configured. The CRUD surface and browser
//! UI live elsewhere; this server exposes the engine-facing summary:
//! per-backend status, readiness, and direct start/stop controls.

use crate::engine::Engine;
use crate::pool::UpstreamPool;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// JSON reply; every admin route answers through this.
fn reply_json(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(value.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Plain-text reply for routes with nothing structured to say.
fn reply_text(status: StatusCode, text: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(text.as_bytes())));
    *response.status_mut() = status;
    response
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    engine: Arc<Engine>,
    pool: Arc<UpstreamPool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        engine: Arc<Engine>,
        pool: Arc<UpstreamPool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            engine,
            pool,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API listening");

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Admin accept failed");
                        continue;
                    }
                },
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Admin server stopping");
                        return Ok(());
                    }
                    continue;
                }
            };

            let engine = Arc::clone(&self.engine);
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let engine = Arc::clone(&engine);
                    let pool = Arc::clone(&pool);
                    async move { handle_admin_request(req, engine, pool).await }
                });

                let served = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
                if let Err(e) = served {
                    debug!(peer = %peer, error = %e, "Admin connection ended with error");
                }
            });
        }
    }
}

/// Parse `/api/containers/{name}/{action}` into its two variable parts.
fn parse_container_route(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/api/containers/")?;
    let (name, action) = rest.split_once('/')?;
    if name.is_empty() || action.is_empty() || action.contains('/') {
        return None;
    }
    Some((name, action))
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    engine: Arc<Engine>,
    pool: Arc<UpstreamPool>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    if method == Method::GET && path == "/version" {
        let body = serde_json::json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        });
        return Ok(reply_json(StatusCode::OK, body));
    }

    let Some((name, action)) = parse_container_route(&path) else {
        return Ok(reply_text(StatusCode::NOT_FOUND, "not found"));
    };

    let snapshot = engine.snapshot();
    let Some(backend) = snapshot.backend(name) else {
        return Ok(reply_text(StatusCode::NOT_FOUND, "unknown container"));
    };

    let reply = match (method, action) {
        (Method::GET, "status") => {
            let running = engine.driver().is_running(name).await;
            let last_activity = engine
                .activity()
                .last_activity(name)
                .map(|stamp| stamp.wall.to_rfc3339());
            reply_json(
                StatusCode::OK,
                serde_json::json!({
                    "name": name,
                    "running": running,
                    "lastActivity": last_activity,
                }),
            )
        }

        (Method::GET, "ready") => {
            let ready = match backend.url.as_deref() {
                Some(url) => engine.driver().is_running(name).await && pool.probe(url).await,
                None => false,
            };
            reply_json(StatusCode::OK, serde_json::json!({ "ready": ready }))
        }

        (Method::POST, "start") => match engine.driver().start(name).await {
            Ok(()) => {
                info!(name, "Container started via admin API");
                reply_json(StatusCode::OK, serde_json::json!({ "ok": true }))
            }
            Err(e) => {
                error!(name, error = %e, "Admin start failed");
                reply_json(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "ok": false, "error": e.to_string() }),
                )
            }
        },

        (Method::POST, "stop") => match engine.driver().stop(name).await {
            Ok(()) => {
                info!(name, "Container stopped via admin API");
                reply_json(StatusCode::OK, serde_json::json!({ "ok": true }))
            }
            Err(e) => {
                error!(name, error = %e, "Admin stop failed");
                reply_json(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "ok": false, "error": e.to_string() }),
                )
            }
        },

        _ => reply_text(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_container_route() {
        assert_eq!(
            parse_container_route("/api/containers/blog/status"),
            Some(("blog", "status"))
        );
        assert_eq!(
            parse_container_route("/api/containers/ubuntu:104@pve1/start"),
            Some(("ubuntu:104@pve1", "start"))
        );
        assert!(parse_container_route("/api/containers/blog").is_none());
        assert!(parse_container_route("/api/containers//status").is_none());
        assert!(parse_container_route("/api/containers/a/b/c").is_none());
        assert!(parse_container_route("/api/other/a/status").is_none());
    }

    #[test]
    fn test_reply_helpers() {
        let json = reply_json(StatusCode::OK, serde_json::json!({ "ready": true }));
        assert_eq!(json.status(), StatusCode::OK);
        assert_eq!(
            json.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let text = reply_text(StatusCode::NOT_FOUND, "not found");
        assert_eq!(text.status(), StatusCode::NOT_FOUND);
        assert!(text.headers().get(hyper::header::CONTENT_TYPE).is_none());
    }
}
