//! The request dispatcher.
//!
//! One entry point handles plain HTTP and WebSocket upgrades: match
//! the request to a backend, make sure its workload is awake, and
//! forward. A backend that is still waking gets the holding page and
//! an asynchronous, debounced start trigger.

use crate::config::{Backend, ConfigSnapshot};
use crate::engine::Engine;
use crate::error::{json_error_response, DispatchErrorCode};
use crate::page::HoldingPage;
use crate::pool::UpstreamPool;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The main reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    engine: Arc<Engine>,
    pool: Arc<UpstreamPool>,
    page: HoldingPage,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        engine: Arc<Engine>,
        pool: Arc<UpstreamPool>,
        page: HoldingPage,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            engine,
            pool,
            page,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy listening (HTTP/1.1 and HTTP/2)");

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Proxy server stopping");
                        return Ok(());
                    }
                    continue;
                }
            };

            let engine = Arc::clone(&self.engine);
            let pool = Arc::clone(&self.pool);
            let page = self.page.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_client(stream, peer, engine, pool, page).await {
                    debug!(peer = %peer, error = %e, "Connection ended with error");
                }
            });
        }
    }
}

/// Serve one client connection. HTTP/1.1 and HTTP/2 share the
/// listener, and HTTP/1.1 connections may still escalate to a
/// WebSocket bridge.
async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<Engine>,
    pool: Arc<UpstreamPool>,
    page: HoldingPage,
) -> anyhow::Result<()> {
    let service = service_fn(move |req: Request<Incoming>| {
        let engine = Arc::clone(&engine);
        let pool = Arc::clone(&pool);
        let page = page.clone();
        async move { handle_request(req, engine, pool, page, peer).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
        .map_err(|e| anyhow::anyhow!("serving connection: {}", e))
}

/// The route a request resolved to.
struct RouteMatch<'a> {
    backend: &'a Backend,
    /// Set when the request matched through a group name.
    via_group: Option<&'a str>,
}

/// Resolve a request to a backend: exact host match first, then the
/// first path segment against backend paths, then against active
/// group names (picking the first active member with both host and
/// path defined).
fn match_backend<'a>(
    snapshot: &'a ConfigSnapshot,
    host: Option<&str>,
    path: &str,
) -> Option<RouteMatch<'a>> {
    if let Some(host) = host {
        if let Some(backend) = snapshot.match_host(host) {
            return Some(RouteMatch {
                backend,
                via_group: None,
            });
        }
    }

    let segment = first_path_segment(path)?;
    if let Some(backend) = snapshot.match_path_segment(segment) {
        return Some(RouteMatch {
            backend,
            via_group: None,
        });
    }

    let group = snapshot.group(segment).filter(|g| g.active)?;
    let backend = group
        .members
        .iter()
        .filter_map(|name| snapshot.backend(name))
        .find(|b| b.active && b.host.is_some() && b.path.is_some())?;
    Some(RouteMatch {
        backend,
        via_group: Some(group.name.as_str()),
    })
}

fn first_path_segment(path: &str) -> Option<&str> {
    path.split('/').find(|segment| !segment.is_empty())
}

async fn handle_request(
    mut req: Request<Incoming>,
    engine: Arc<Engine>,
    pool: Arc<UpstreamPool>,
    page: HoldingPage,
    peer: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Reuse the caller's request ID when it sent one.
    let request_id = match req.headers().get("x-request-id").and_then(|v| v.to_str().ok()) {
        Some(id) => id.to_string(),
        None => Uuid::new_v4().to_string(),
    };

    let hostname = extract_hostname(&req);
    let snapshot = engine.snapshot();

    debug!(
        host = hostname.as_deref().unwrap_or("-"),
        method = %req.method(),
        uri = %req.uri(),
        request_id = %request_id,
        "Incoming request"
    );

    let Some(route) = match_backend(&snapshot, hostname.as_deref(), req.uri().path()) else {
        return Ok(json_error_response(
            DispatchErrorCode::NoBackendMatch,
            "No backend matches this host or path",
        ));
    };
    let backend = route.backend;

    let (Some(host), Some(path)) = (backend.host.as_deref(), backend.path.as_deref()) else {
        error!(name = %backend.name, "Backend is missing its host or path mapping");
        return Ok(json_error_response(
            DispatchErrorCode::BackendMisconfigured,
            "Backend is misconfigured",
        ));
    };

    if !backend.active {
        warn!(name = %backend.name, "Request for inactive backend rejected");
        return Ok(json_error_response(
            DispatchErrorCode::BackendInactive,
            "Backend is inactive",
        ));
    }

    engine.activity().touch(&backend.name);

    let running = engine.driver().is_running(&backend.name).await;
    if !running {
        // Wake the workload in the background; the debounce registry
        // collapses repeat triggers while it comes up.
        if let Some(group) = route.via_group {
            debug!(name = %backend.name, group, "Start trigger via group match");
        }
        let starter = Arc::clone(&engine);
        let name = backend.name.clone();
        tokio::spawn(async move {
            starter.request_start(&name).await;
        });

        return Ok(holding_response(
            &page,
            &backend.name,
            host,
            path,
            StatusCode::OK,
            None,
        ));
    }

    let Some(url) = backend.url.as_deref() else {
        error!(name = %backend.name, "Backend has no upstream url");
        return Ok(json_error_response(
            DispatchErrorCode::BackendMisconfigured,
            "Backend is misconfigured",
        ));
    };
    let url = url.to_string();
    let name = backend.name.clone();
    let holding = (host.to_string(), path.to_string());
    drop(snapshot);

    stamp_proxy_headers(&mut req, &request_id, peer.ip());

    if is_upgrade_request(&req) {
        return handle_upgrade(req, engine, name, url, request_id).await;
    }

    match pool.send_request(req, &url).await {
        Ok(response) => {
            engine.activity().touch(&name);
            Ok(response)
        }
        Err(e) => {
            // Headers have not been sent yet, so the client gets the
            // holding page with a 502.
            error!(name = %name, url = %url, error = %e, "Upstream request failed");
            let (host, path) = holding;
            Ok(holding_response(
                &page,
                &name,
                &host,
                &path,
                StatusCode::BAD_GATEWAY,
                Some(DispatchErrorCode::UpstreamUnavailable),
            ))
        }
    }
}

/// Overwrite the forwarding headers. This proxy is the first trusted
/// hop, so client-supplied values are replaced, never extended.
fn stamp_proxy_headers(req: &mut Request<Incoming>, request_id: &str, client_ip: IpAddr) {
    let headers = req.headers_mut();
    if let Ok(id) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", id);
    }
    if let Ok(addr) = HeaderValue::from_str(&client_ip.to_string()) {
        headers.insert("x-forwarded-for", addr);
    }
    if let Some(original_host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert("x-forwarded-host", original_host);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
}

/// Build a holding-page response. The redirect target follows the
/// `https://{path}.{host}` convention of the configuration layout.
fn holding_response(
    page: &HoldingPage,
    name: &str,
    host: &str,
    path: &str,
    status: StatusCode,
    error_code: Option<DispatchErrorCode>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let redirect_url = format!("https://{}.{}", path, host);
    let body = page.render(name, &redirect_url);

    let mut response = Response::new(
        Full::new(Bytes::from(body))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    if let Some(code) = error_code {
        response
            .headers_mut()
            .insert("x-proxy-error", HeaderValue::from_static(code.as_header_value()));
    }
    response
}

/// The routable hostname of a request, from its Host header.
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req.headers().get(hyper::header::HOST)?.to_str().ok()?;
    normalize_host(raw)
}

/// Longest hostname DNS permits.
const MAX_HOSTNAME_LEN: usize = 253;

/// Strip the port, check the remainder against plain DNS-name syntax
/// (which also keeps junk out of the logs), and lowercase it.
fn normalize_host(raw: &str) -> Option<String> {
    let host = match raw.split_once(':') {
        Some((before_port, _port)) => before_port,
        None => raw,
    };
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    let plain_dns = host
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.');
    if !plain_dns {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

/// A protocol upgrade asks for an Upgrade header plus a Connection
/// header listing the `upgrade` option.
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    if !req.headers().contains_key(hyper::header::UPGRADE) {
        return false;
    }
    req.headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|option| option.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false)
}

/// Host:port of an upstream origin url.
fn upstream_authority(url: &str) -> Option<String> {
    let uri: hyper::Uri = url.parse().ok()?;
    let host = uri.host()?;
    let port = uri.port_u16().unwrap_or(80);
    Some(format!("{}:{}", host, port))
}

/// Serialize the client's upgrade request for the upstream socket,
/// with the Host header pointed at the upstream authority.
fn build_upgrade_request<B>(req: &Request<B>, authority: &str) -> Vec<u8> {
    let target = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());

    let mut lines = vec![format!("{} {} HTTP/1.1", req.method(), target)];
    lines.push(format!("Host: {}", authority));
    for (header, value) in req.headers() {
        if header == hyper::header::HOST {
            continue;
        }
        if let Ok(value) = value.to_str() {
            lines.push(format!("{}: {}", header, value));
        }
    }
    lines.push(String::new());
    lines.push(String::new());

    lines.join("\r\n").into_bytes()
}

/// Read the status line and headers of the upstream's reply to the
/// upgrade request.
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let head = std::str::from_utf8(data).ok()?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next()?;
    let mut words = status_line.split_whitespace();
    if !words.next()?.starts_with("HTTP/") {
        return None;
    }
    let status = StatusCode::from_bytes(words.next()?.as_bytes()).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    Some((status, headers))
}

/// Connect to the upstream, replay the upgrade request, and read its
/// reply head.
async fn open_upgrade<B>(
    req: &Request<B>,
    authority: &str,
) -> anyhow::Result<(TcpStream, StatusCode, Vec<(String, String)>)> {
    let mut upstream = TcpStream::connect(authority)
        .await
        .map_err(|e| anyhow::anyhow!("connecting to {}: {}", authority, e))?;

    upstream
        .write_all(&build_upgrade_request(req, authority))
        .await
        .map_err(|e| anyhow::anyhow!("replaying upgrade request: {}", e))?;

    let mut head = vec![0u8; 4096];
    let n = upstream
        .read(&mut head)
        .await
        .map_err(|e| anyhow::anyhow!("reading upgrade reply: {}", e))?;
    if n == 0 {
        anyhow::bail!("upstream closed before replying to the upgrade");
    }

    let (status, headers) = parse_upgrade_response(&head[..n])
        .ok_or_else(|| anyhow::anyhow!("unreadable upgrade reply"))?;
    Ok((upstream, status, headers))
}

/// Re-emit the upstream's reply head toward the client, dropping the
/// framing headers hyper manages itself.
fn relay_response_head(
    status: StatusCode,
    headers: &[(String, String)],
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

/// Pump bytes both ways until either peer hangs up.
async fn bridge_streams(client: Upgraded, upstream: TcpStream, name: &str, request_id: &str) {
    let mut client = TokioIo::new(client);
    let mut upstream = upstream;

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => {
            debug!(
                name = %name,
                request_id = %request_id,
                sent,
                received,
                "WebSocket bridge closed"
            );
        }
        Err(e) => {
            debug!(name = %name, request_id = %request_id, error = %e, "WebSocket bridge closed with error");
        }
    }
}

/// Handle a WebSocket upgrade request
async fn handle_upgrade(
    req: Request<Incoming>,
    engine: Arc<Engine>,
    name: String,
    url: String,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    debug!(name = %name, request_id = %request_id, "Handling upgrade request");

    let Some(authority) = upstream_authority(&url) else {
        error!(name = %name, url = %url, "Upgrade target has no usable authority");
        return Ok(json_error_response(
            DispatchErrorCode::UpstreamUnavailable,
            "Upstream unavailable",
        ));
    };

    let (upstream, status, upstream_headers) = match open_upgrade(&req, &authority).await {
        Ok(opened) => opened,
        Err(e) => {
            error!(name = %name, authority = %authority, error = %e, "Upgrade handshake with upstream failed");
            return Ok(json_error_response(
                DispatchErrorCode::UpstreamUnavailable,
                "Upstream unavailable",
            ));
        }
    };

    // The upstream answered; that counts as activity.
    engine.activity().touch(&name);

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(name = %name, status = %status, "Upstream rejected upgrade request");
        return Ok(relay_response_head(status, &upstream_headers));
    }

    info!(name = %name, request_id = %request_id, "WebSocket upgrade successful");
    let reply = relay_response_head(status, &upstream_headers);

    // Bridge the streams once the client side finishes its upgrade.
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(name = %name, request_id = %request_id, "Client upgrade complete, bridging");
                bridge_streams(upgraded, upstream, &name, &request_id).await;
            }
            Err(e) => {
                error!(name = %name, error = %e, "Failed to upgrade client connection");
            }
        }
        engine.activity().touch(&name);
    });

    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDocument;

    fn snapshot(json: &str) -> ConfigSnapshot {
        let document: ConfigDocument = serde_json::from_str(json).unwrap();
        ConfigSnapshot::from_document(document)
    }

    const ROUTED: &str = r#"{
        "containers": {
            "blog": {"host": "blog.example.com", "path": "blog", "url": "http://blog:80"},
            "wiki": {"host": "wiki.example.com", "path": "wiki", "url": "http://wiki:80"},
            "bare": {"url": "http://bare:80"},
            "hidden": {"host": "hidden.lan", "path": "hidden", "url": "http://hidden:80", "active": false}
        },
        "order": ["blog", "wiki", "bare", "hidden"],
        "groups": {
            "tools": {"active": true, "containers": ["bare", "wiki"]},
            "dark": {"active": false, "containers": ["wiki"]}
        }
    }"#;

    #[test]
    fn test_first_path_segment() {
        assert_eq!(first_path_segment("/blog/post/1"), Some("blog"));
        assert_eq!(first_path_segment("/blog"), Some("blog"));
        assert_eq!(first_path_segment("//blog"), Some("blog"));
        assert_eq!(first_path_segment("/"), None);
        assert_eq!(first_path_segment(""), None);
    }

    #[test]
    fn test_match_by_host_wins() {
        let snapshot = snapshot(ROUTED);
        let route = match_backend(&snapshot, Some("blog.example.com"), "/wiki/page").unwrap();
        assert_eq!(route.backend.name, "blog");
        assert!(route.via_group.is_none());
    }

    #[test]
    fn test_match_falls_back_to_path_segment() {
        let snapshot = snapshot(ROUTED);
        let route = match_backend(&snapshot, Some("unknown.example.com"), "/wiki/page").unwrap();
        assert_eq!(route.backend.name, "wiki");
        assert!(route.via_group.is_none());
    }

    #[test]
    fn test_match_falls_back_to_group_name() {
        let snapshot = snapshot(ROUTED);
        // First member "bare" lacks host/path, so the group picks "wiki".
        let route = match_backend(&snapshot, None, "/tools/dashboard").unwrap();
        assert_eq!(route.backend.name, "wiki");
        assert_eq!(route.via_group, Some("tools"));
    }

    #[test]
    fn test_inactive_group_does_not_match() {
        let snapshot = snapshot(ROUTED);
        assert!(match_backend(&snapshot, None, "/dark/x").is_none());
    }

    #[test]
    fn test_no_match_is_none() {
        let snapshot = snapshot(ROUTED);
        assert!(match_backend(&snapshot, Some("nope.example.com"), "/nope").is_none());
    }

    #[test]
    fn test_inactive_backend_still_matches() {
        // 403 handling needs the match to succeed first.
        let snapshot = snapshot(ROUTED);
        let route = match_backend(&snapshot, Some("hidden.lan"), "/").unwrap();
        assert_eq!(route.backend.name, "hidden");
        assert!(!route.backend.active);
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(
            normalize_host("Blog.Example.com:8080").as_deref(),
            Some("blog.example.com")
        );
        assert_eq!(normalize_host("app.lan").as_deref(), Some("app.lan"));
        assert!(normalize_host("bad host!").is_none());
        assert!(normalize_host("").is_none());
        assert!(normalize_host(":8080").is_none());
    }

    #[test]
    fn test_extract_hostname() {
        let req = Request::builder()
            .uri("/x")
            .header("host", "Blog.Example.com:8080")
            .body(())
            .unwrap();
        assert_eq!(extract_hostname(&req).as_deref(), Some("blog.example.com"));

        let missing = Request::builder().uri("/x").body(()).unwrap();
        assert!(extract_hostname(&missing).is_none());
    }

    #[test]
    fn test_is_upgrade_request() {
        let upgrade = Request::builder()
            .uri("/ws")
            .header("connection", "keep-alive, Upgrade")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&upgrade));

        let plain = Request::builder()
            .uri("/ws")
            .header("connection", "keep-alive")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&plain));

        // An Upgrade header alone is not enough.
        let no_connection = Request::builder()
            .uri("/ws")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&no_connection));
    }

    #[test]
    fn test_upstream_authority() {
        assert_eq!(
            upstream_authority("http://app:8080").as_deref(),
            Some("app:8080")
        );
        assert_eq!(upstream_authority("http://app").as_deref(), Some("app:80"));
        assert!(upstream_authority("not a url").is_none());
    }

    #[test]
    fn test_build_upgrade_request_rewrites_host() {
        let req = Request::builder()
            .method("GET")
            .uri("/socket?room=1")
            .header("host", "blog.example.com")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        let raw = String::from_utf8(build_upgrade_request(&req, "blog:8080")).unwrap();
        assert!(raw.starts_with("GET /socket?room=1 HTTP/1.1\r\n"));
        assert!(raw.contains("Host: blog:8080\r\n"));
        assert!(!raw.contains("blog.example.com"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(headers
            .iter()
            .any(|(n, v)| n == "Upgrade" && v == "websocket"));

        assert!(parse_upgrade_response(b"garbage").is_none());
    }

    #[test]
    fn test_relay_response_head_drops_framing_headers() {
        let headers = vec![
            ("Upgrade".to_string(), "websocket".to_string()),
            ("Content-Length".to_string(), "0".to_string()),
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
        ];
        let response = relay_response_head(StatusCode::SWITCHING_PROTOCOLS, &headers);
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers().get("upgrade").unwrap(), "websocket");
        assert!(response.headers().get("content-length").is_none());
        assert!(response.headers().get("transfer-encoding").is_none());
    }

    #[test]
    fn test_holding_response_shape() {
        let page = HoldingPage::built_in();
        let response = holding_response(&page, "blog", "example.com", "blog", StatusCode::OK, None);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );

        let gateway = holding_response(
            &page,
            "blog",
            "example.com",
            "blog",
            StatusCode::BAD_GATEWAY,
            Some(DispatchErrorCode::UpstreamUnavailable),
        );
        assert_eq!(gateway.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            gateway.headers().get("x-proxy-error").unwrap(),
            "UPSTREAM_UNAVAILABLE"
        );
    }
}
