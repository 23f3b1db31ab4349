//! HTTP front-end
//!
//! Accepts every request on one listener, reads the routing headers, asks
//! the controller for a running backend, and forwards. Plain requests go
//! through a pooled HTTP client; upgrade requests are tunneled raw so
//! websocket and other persistent streams survive end-to-end.

use crate::controller::Controller;
use crate::error::GateErrorCode;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header naming the backend service to route to
pub const TARGET_SERVICE_HEADER: &str = "x-target-service";
/// Header naming the backend TCP port to route to
pub const TARGET_PORT_HEADER: &str = "x-target-port";

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Hop-by-hop response headers stripped from everything except a 101.
const HOP_BY_HOP_HEADERS: [&str; 6] = [
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
];

/// Maximum service name length per DNS specification
const MAX_SERVICE_NAME_LEN: usize = 253;

type ProxyClient = Client<HttpConnector, Incoming>;

/// The front-end server: one listener, one handler for all paths and methods
pub struct ProxyServer {
    bind_addr: SocketAddr,
    controller: Arc<Controller>,
    shutdown_rx: watch::Receiver<bool>,
    client: ProxyClient,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        controller: Arc<Controller>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .build(connector);

        Self {
            bind_addr,
            controller,
            shutdown_rx,
            client,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "proxy listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let controller = Arc::clone(&self.controller);
                            let client = self.client.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, controller, client).await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    controller: Arc<Controller>,
    client: ProxyClient,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let controller = Arc::clone(&controller);
        let client = client.clone();
        async move { handle_request(req, controller, client, addr).await }
    });

    // auto::Builder serves HTTP/1.1 (with upgrades) and h2c on one port
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

/// Counts a request as in-flight for its service until dropped.
struct ActivityGuard {
    controller: Arc<Controller>,
    service: String,
}

impl ActivityGuard {
    fn begin(controller: Arc<Controller>, service: &str) -> Self {
        controller.registry().begin_request(service);
        Self {
            controller,
            service: service.to_string(),
        }
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.controller.registry().end_request(&self.service);
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    controller: Arc<Controller>,
    client: ProxyClient,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let RouteTarget { service, port } = match extract_route(&req) {
        Ok(route) => route,
        Err(message) => {
            return Ok(GateErrorCode::MissingRoutingHeaders.respond(message));
        }
    };

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    debug!(service, port, method = %req.method(), uri = %req.uri(), request_id, "incoming request");

    // In-flight from here until the response (or tunnel) is done, so the
    // reaper cannot stop the backend underneath us.
    let activity = ActivityGuard::begin(Arc::clone(&controller), &service);

    if let Err(e) = controller.ensure_running(&service, port).await {
        error!(service, error = %e, "activation failed");
        return Ok(e.code().respond(e.to_string()));
    }

    {
        let headers = req.headers_mut();
        headers.remove(TARGET_SERVICE_HEADER);
        headers.remove(TARGET_PORT_HEADER);
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        // Overwrite rather than append; this proxy is the first trusted hop.
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if is_upgrade_request(&req) {
        return handle_upgrade(req, service, port, request_id, activity).await;
    }

    let result = forward(req, &client, &service, port).await;
    drop(activity);

    match result {
        Ok(response) => Ok(strip_hop_by_hop(response)),
        Err(e) => {
            error!(service, port, error = %e, "failed to forward request");
            Ok(GateErrorCode::ConnectionFailed
                .respond(format!("failed to reach backend {}:{}: {}", service, port, e)))
        }
    }
}

#[derive(Debug)]
struct RouteTarget {
    service: String,
    port: u16,
}

/// Read and validate the routing headers. Header lookup is case-insensitive.
fn extract_route<B>(req: &Request<B>) -> Result<RouteTarget, String> {
    let service = header_value(req, TARGET_SERVICE_HEADER)
        .ok_or_else(|| format!("missing or empty {} header", TARGET_SERVICE_HEADER))?;
    let port_raw = header_value(req, TARGET_PORT_HEADER)
        .ok_or_else(|| format!("missing or empty {} header", TARGET_PORT_HEADER))?;

    // The name goes into container filters, DNS lookups, and logs; reject
    // anything that is not a plausible service name.
    if service.len() > MAX_SERVICE_NAME_LEN
        || !service
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    {
        return Err(format!(
            "invalid service name in {} header",
            TARGET_SERVICE_HEADER
        ));
    }

    let port = port_raw
        .parse::<u16>()
        .map_err(|_| format!("invalid TCP port in {} header", TARGET_PORT_HEADER))?;

    Ok(RouteTarget {
        service: service.to_lowercase(),
        port,
    })
}

fn header_value<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Forward a plain request to `http://<service>:<port>` through the pooled
/// client.
async fn forward(
    req: Request<Incoming>,
    client: &ProxyClient,
    service: &str,
    port: u16,
) -> anyhow::Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("http://{}:{}{}", service, port, path);

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(&uri);
    for (name, value) in parts.headers.iter() {
        builder = builder.header(name, value);
    }
    let backend_req = builder
        .body(body)
        .map_err(|e| anyhow::anyhow!("failed to build backend request: {}", e))?;

    let response = client.request(backend_req).await?;

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, body.boxed()))
}

/// Remove hop-by-hop headers. A 101 passes through untouched so the upgrade
/// handshake the backend produced reaches the client intact.
fn strip_hop_by_hop(
    mut response: Response<BoxBody<Bytes, hyper::Error>>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        return response;
    }
    let headers = response.headers_mut();
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    response
}

/// Check if a request is an upgrade request (Connection: upgrade + Upgrade)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Build the raw HTTP request relayed to the backend for an upgrade.
/// Routing headers are dropped and Host is rewritten to the backend origin;
/// the Connection/Upgrade pair passes through untouched.
fn build_upgrade_request<B>(req: &Request<B>, service: &str, port: u16) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        let name = name.as_str();
        if name == "host" || name == TARGET_SERVICE_HEADER || name == TARGET_PORT_HEADER {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}:{}\r\n", service, port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the backend's response head to an upgrade request.
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Forward bytes bidirectionally between the upgraded client connection and
/// the backend stream.
async fn forward_bidirectional(
    client: Upgraded,
    mut backend: TcpStream,
    service: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                service,
                request_id,
                client_to_backend,
                backend_to_client,
                "upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(service, request_id, error = %e, "upgraded connection closed with error");
        }
    }
}

/// Tunnel an upgrade request: relay the handshake to the backend over raw
/// TCP, hand the 101 back to the client, then copy bytes both ways until
/// either side closes.
async fn handle_upgrade(
    req: Request<Incoming>,
    service: String,
    port: u16,
    request_id: String,
    activity: ActivityGuard,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_lowercase();
    debug!(service, request_id, upgrade_type, "handling upgrade request");

    let raw_request = build_upgrade_request(&req, &service, port);

    let backend_addr = format!("{}:{}", service, port);
    let mut backend_stream = match TcpStream::connect(&backend_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(service, port, error = %e, "failed to connect to backend for upgrade");
            return Ok(GateErrorCode::ConnectionFailed
                .respond(format!("failed to connect to backend: {}", e)));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(service, error = %e, "failed to send upgrade request to backend");
        return Ok(GateErrorCode::ConnectionFailed
            .respond(format!("failed to send upgrade request: {}", e)));
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match backend_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            error!(service, "backend closed connection before responding to upgrade");
            return Ok(GateErrorCode::ConnectionFailed.respond("backend closed connection"));
        }
        Err(e) => {
            error!(service, error = %e, "failed to read upgrade response from backend");
            return Ok(GateErrorCode::ConnectionFailed
                .respond(format!("failed to read backend response: {}", e)));
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&response_buf[..n]) {
        Some(parsed) => parsed,
        None => {
            error!(service, "failed to parse backend upgrade response");
            return Ok(
                GateErrorCode::ConnectionFailed.respond("invalid upgrade response from backend")
            );
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(service, status = %status, "backend rejected upgrade request");
        // Relay the refusal; it is a plain response, so hop-by-hop headers go.
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if HOP_BY_HOP_HEADERS.contains(&name.to_lowercase().as_str()) {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(service, request_id, upgrade_type, "upgrade accepted by backend");

    // The 101 head is relayed verbatim so the client sees the exact
    // Connection/Upgrade pair the backend produced.
    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(service, request_id, "client upgrade complete, forwarding");
                forward_bidirectional(upgraded, backend_stream, &service, &request_id).await;
            }
            Err(e) => {
                error!(service, error = %e, "failed to upgrade client connection");
            }
        }
        // The stream counted as in-flight until here.
        drop(activity);
    });

    Ok(response)
}
