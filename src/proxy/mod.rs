//! In-sandbox credential proxy.
//!
//! A small HTTP/1.1 reverse proxy that runs as the privileged user inside
//! the VM. Agent code talks to loopback ports carrying a per-session
//! placeholder token; the proxy validates the token, strips every inbound
//! auth header, injects the real key, and forwards over TLS to the
//! provider's pinned upstream. It is the only process inside the VM that
//! ever holds real secrets.
//!
//! Deployed as the self-contained `primordial-proxy` binary. Configuration
//! arrives once, as a single JSON line on stdin, never via argv, env, or
//! disk:
//!
//! ```text
//! {"session_token":"sess-…","routes":[
//!   {"provider":"anthropic","listen_port":9001,
//!    "upstream_host":"api.anthropic.com","auth_header":"x-api-key",
//!    "secret":"sk-…"}]}
//! ```
//!
//! After every listener is bound the proxy emits one readiness line on
//! stderr; the orchestrator waits for it before letting any agent-
//! controlled code run.

pub mod http;
pub mod server;
pub mod tls;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::manifest::AuthStyle;

pub use server::{RunningProxy, serve};
pub use tls::{TlsConnect, UpstreamConnect};

/// Fixed prefix of the readiness marker on the proxy's stderr.
pub const READY_PREFIX: &str = "primordial-proxy ready";

/// Maximum accepted request body.
pub const MAX_BODY_BYTES: u64 = 100 * 1024 * 1024;

/// Read/write deadline on every proxy socket.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(60);

/// Response bodies are streamed to the agent in chunks of this size, with
/// an explicit flush per chunk. Required for server-sent-event streams.
pub const STREAM_CHUNK_SIZE: usize = 8192;

/// Full proxy configuration, delivered once on stdin.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub session_token: String,
    pub routes: Vec<RouteConfig>,
}

/// One provider route: a loopback listener bound to a pinned upstream.
#[derive(Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub provider: String,
    /// Loopback port to listen on. `0` lets the OS assign one (tests).
    #[serde(rename = "listen_port")]
    pub port: u16,
    pub upstream_host: String,
    /// `"bearer"` or a custom header name on the wire.
    #[serde(rename = "auth_header")]
    pub auth_style: AuthStyle,
    /// The real API key. Exists only in the proxy process for the session.
    pub secret: String,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("session_token", &"[REDACTED]")
            .field("routes", &self.routes)
            .finish()
    }
}

impl fmt::Debug for RouteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteConfig")
            .field("provider", &self.provider)
            .field("port", &self.port)
            .field("upstream_host", &self.upstream_host)
            .field("auth_style", &self.auth_style)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Render the readiness marker for a set of bound ports.
pub fn ready_line(ports: &[u16]) -> String {
    let ports = ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!("{} ports={}", READY_PREFIX, ports)
}

/// Parse a readiness marker line. Returns the bound ports.
pub fn parse_ready_line(line: &str) -> Option<Vec<u16>> {
    let rest = line.trim().strip_prefix(READY_PREFIX)?.trim();
    let ports = rest.strip_prefix("ports=")?;
    ports
        .split(',')
        .map(|p| p.parse::<u16>().ok())
        .collect::<Option<Vec<_>>>()
}
