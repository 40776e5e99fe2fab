//! Proxy server core: listeners, per-connection workers, auth, rewrite,
//! streaming.
//!
//! One loopback listener per provider route; every accepted connection is
//! handled on its own worker thread and serves exactly one request:
//!
//! ```text
//! ReadRequestLine ─► ReadHeaders ─► ReadBody ─► ForwardOpen ─► StreamResponse ─► Close
//!        │               │             │            │
//!        └───────────────┴─────────────┴────────────┴──► error status ──► Close
//! ```
//!
//! Workers share nothing mutable beyond an atomic request counter used for
//! debug logging. The route's real secret is held by reference only.

use std::io::{BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use subtle::ConstantTimeEq;

use crate::manifest::AuthStyle;
use crate::proxy::http::{self, HttpError, Request};
use crate::proxy::tls::UpstreamConnect;
use crate::proxy::{MAX_BODY_BYTES, ProxyConfig, RouteConfig, SOCKET_TIMEOUT, STREAM_CHUNK_SIZE};

/// Response headers safe to forward to the agent. Everything else is
/// dropped: upstream auth echoes, cookies, server implementation banners.
const RESPONSE_HEADER_ALLOWLIST: &[&str] = &[
    "content-type",
    "content-length",
    "content-encoding",
    "date",
    "x-request-id",
    "x-ratelimit-limit",
    "x-ratelimit-remaining",
    "x-ratelimit-reset",
    "retry-after",
    "cache-control",
];

/// Request headers never forwarded upstream: hop-by-hop plus every way a
/// client could smuggle framing or auth past the rewrite.
const REQUEST_HEADER_DENYLIST: &[&str] = &[
    "host",
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "upgrade",
    "transfer-encoding",
    "content-length",
    "authorization",
    "proxy-authorization",
    "cookie",
];

/// Terminal per-request outcomes. Bodies are fixed strings; the 401 body is
/// byte-identical for the missing-token and wrong-token cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reject {
    BadRequest,
    Unauthorized,
    PayloadTooLarge,
    BadGateway,
}

impl Reject {
    fn status(self) -> (u16, &'static str, &'static str) {
        match self {
            Reject::BadRequest => (400, "Bad Request", "bad request\n"),
            Reject::Unauthorized => (401, "Unauthorized", "unauthorized\n"),
            Reject::PayloadTooLarge => (413, "Payload Too Large", "request body too large\n"),
            Reject::BadGateway => (502, "Bad Gateway", "upstream connection failed\n"),
        }
    }
}

struct RouteState {
    route: RouteConfig,
    session_token: Arc<str>,
    connector: Arc<dyn UpstreamConnect>,
    requests: AtomicU64,
}

/// A running proxy: all listeners bound, accept loops live.
pub struct RunningProxy {
    ports: Vec<u16>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl RunningProxy {
    /// The bound loopback ports, in route order.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Stop accepting and unblock the accept loops.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for port in &self.ports {
            // Wake each accept() so it observes the flag.
            let _ = TcpStream::connect(("127.0.0.1", *port));
        }
    }

    /// Block until every accept loop has exited.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Bind every route's listener, then start serving.
///
/// Returns only after *all* listeners are bound; no request is served
/// before that point, which is what makes the readiness marker meaningful.
pub fn serve(
    config: ProxyConfig,
    connector: Arc<dyn UpstreamConnect>,
) -> std::io::Result<RunningProxy> {
    let session_token: Arc<str> = Arc::from(config.session_token.as_str());
    let shutdown = Arc::new(AtomicBool::new(false));

    // Bind phase: fail before serving anything if any port is taken.
    let mut bound = Vec::with_capacity(config.routes.len());
    for mut route in config.routes {
        let listener = TcpListener::bind(("127.0.0.1", route.port))?;
        route.port = listener.local_addr()?.port();
        bound.push((listener, route));
    }

    let ports: Vec<u16> = bound.iter().map(|(_, r)| r.port).collect();
    let mut handles = Vec::with_capacity(bound.len());

    for (listener, route) in bound {
        let state = Arc::new(RouteState {
            route,
            session_token: session_token.clone(),
            connector: connector.clone(),
            requests: AtomicU64::new(0),
        });
        let shutdown = shutdown.clone();
        handles.push(std::thread::spawn(move || {
            accept_loop(listener, state, shutdown)
        }));
    }

    Ok(RunningProxy {
        ports,
        shutdown,
        handles,
    })
}

fn accept_loop(listener: TcpListener, state: Arc<RouteState>, shutdown: Arc<AtomicBool>) {
    loop {
        let (stream, _) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(_) => continue,
        };
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let state = state.clone();
        std::thread::spawn(move || {
            let n = state.requests.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(provider = %state.route.provider, request = n, "proxy connection");
            handle_connection(stream, &state);
        });
    }
}

/// Serve one request on one connection, then close.
fn handle_connection(stream: TcpStream, state: &RouteState) {
    let _ = stream.set_read_timeout(Some(SOCKET_TIMEOUT));
    let _ = stream.set_write_timeout(Some(SOCKET_TIMEOUT));
    let _ = stream.set_nodelay(true);

    let mut writer = match stream.try_clone() {
        Ok(clone) => clone,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);

    let request = match http::read_request(&mut reader, MAX_BODY_BYTES) {
        Ok(request) => request,
        Err(HttpError::PayloadTooLarge) => {
            respond(&mut writer, Reject::PayloadTooLarge);
            return;
        }
        Err(HttpError::BadRequest(_)) => {
            respond(&mut writer, Reject::BadRequest);
            return;
        }
        // Timeout or peer gone: nothing useful to write.
        Err(HttpError::Closed) | Err(HttpError::Io(_)) => return,
    };

    if let Err(reject) = forward(&request, state, &mut writer) {
        respond(&mut writer, reject);
    }
}

/// Validate, rewrite, and forward one request; stream the response back.
fn forward(request: &Request, state: &RouteState, client: &mut TcpStream) -> Result<(), Reject> {
    authenticate(request, state)?;
    check_host(request, &state.route.upstream_host)?;

    let upstream_headers = rewrite_headers(request, &state.route);

    let mut upstream = state
        .connector
        .connect(&state.route.upstream_host, 443)
        .map_err(|_| Reject::BadGateway)?;

    // The inbound auth header was removed by rewrite_headers before this
    // write; the upstream sees exactly one auth header, ours.
    let mut head = format!("{} {} HTTP/1.1\r\n", request.method, request.target);
    for (name, value) in &upstream_headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    upstream
        .write_all(head.as_bytes())
        .and_then(|_| upstream.write_all(&request.body))
        .and_then(|_| upstream.flush())
        .map_err(|_| Reject::BadGateway)?;

    let mut upstream_reader = BufReader::new(upstream);
    let head = http::read_response_head(&mut upstream_reader).map_err(|_| Reject::BadGateway)?;
    let body_kind = http::response_body_kind(&request.method, &head);

    // From here the status line is committed; stream errors just close.
    let mut response = format!("HTTP/1.1 {} {}\r\n", head.status, head.reason);
    for (name, value) in &head.headers {
        if RESPONSE_HEADER_ALLOWLIST.contains(&name.as_str()) {
            response.push_str(name);
            response.push_str(": ");
            response.push_str(value);
            response.push_str("\r\n");
        }
    }
    response.push_str("connection: close\r\n\r\n");
    if client.write_all(response.as_bytes()).is_err() {
        return Ok(());
    }
    let _ = client.flush();

    let _ = http::stream_body(&mut upstream_reader, client, body_kind, STREAM_CHUNK_SIZE);
    Ok(())
}

/// Check the per-session placeholder token.
///
/// Both the route's canonical auth header and `Authorization: Bearer` are
/// accepted. Comparison is constant-time; missing and wrong tokens are
/// indistinguishable to the client.
fn authenticate(request: &Request, state: &RouteState) -> Result<(), Reject> {
    let expected = state.session_token.as_bytes();

    let presented: Option<&str> = match &state.route.auth_style {
        AuthStyle::Header(name) => request.header(name).or_else(|| bearer_value(request)),
        AuthStyle::Bearer => bearer_value(request),
    };

    match presented {
        Some(value) if ct_eq(value.as_bytes(), expected) => Ok(()),
        _ => Err(Reject::Unauthorized),
    }
}

fn bearer_value(request: &Request) -> Option<&str> {
    request
        .header("authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}

/// Reject a `Host:` override that names anything but the loopback listener
/// or the pinned upstream itself.
fn check_host(request: &Request, pinned: &str) -> Result<(), Reject> {
    let Some(host) = request.header("host") else {
        return Ok(());
    };
    let bare = host.rsplit_once(':').map_or(host, |(h, _)| h);
    match bare {
        "127.0.0.1" | "localhost" | "[::1]" => Ok(()),
        h if h == pinned => Ok(()),
        _ => Err(Reject::BadRequest),
    }
}

/// Build the upstream header set: strip hop-by-hop and every auth header,
/// pin `Host`, restate the body length, and inject the real key.
fn rewrite_headers(request: &Request, route: &RouteConfig) -> Vec<(String, String)> {
    let custom_auth = match &route.auth_style {
        AuthStyle::Header(name) => Some(name.as_str()),
        AuthStyle::Bearer => None,
    };

    let mut headers: Vec<(String, String)> = request
        .headers
        .iter()
        .filter(|(name, _)| {
            !REQUEST_HEADER_DENYLIST.contains(&name.as_str()) && Some(name.as_str()) != custom_auth
        })
        .cloned()
        .collect();

    headers.push(("host".to_string(), route.upstream_host.clone()));
    headers.push(("content-length".to_string(), request.body.len().to_string()));
    headers.push(("connection".to_string(), "close".to_string()));

    match &route.auth_style {
        AuthStyle::Bearer => {
            headers.push((
                "authorization".to_string(),
                format!("Bearer {}", route.secret),
            ));
        }
        AuthStyle::Header(name) => {
            headers.push((name.clone(), route.secret.clone()));
        }
    }
    headers
}

fn respond(writer: &mut TcpStream, reject: Reject) {
    let (status, reason, body) = reject.status();
    let _ = http::write_error(writer, status, reason, body);
}
