//! Upstream connection seam for the proxy.
//!
//! The server core talks to upstreams through [`UpstreamConnect`]; the
//! production implementation is [`TlsConnect`] (rustls, system trust
//! store). Tests plug in a plaintext connector aimed at a local fake
//! upstream so the full request path is exercised without certificates.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use rustls::pki_types::ServerName;

use crate::proxy::SOCKET_TIMEOUT;

/// A bidirectional byte stream to an upstream.
pub trait UpstreamStream: Read + Write + Send {}

impl<T: Read + Write + Send> UpstreamStream for T {}

/// Opens connections to pinned upstream hosts.
pub trait UpstreamConnect: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn UpstreamStream>>;
}

/// TLS connector using the system trust store.
pub struct TlsConnect {
    config: Arc<rustls::ClientConfig>,
}

impl TlsConnect {
    pub fn new() -> io::Result<TlsConnect> {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            // Individual unparsable certs in the store are skipped; an
            // empty store fails below.
            let _ = roots.add(cert);
        }
        if roots.is_empty() {
            return Err(io::Error::other("no usable roots in the system trust store"));
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(TlsConnect {
            config: Arc::new(config),
        })
    }
}

impl UpstreamConnect for TlsConnect {
    fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn UpstreamStream>> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| io::Error::other("invalid upstream host name"))?;
        let conn = rustls::ClientConnection::new(self.config.clone(), server_name)
            .map_err(io::Error::other)?;

        let tcp = TcpStream::connect((host, port))?;
        tcp.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        tcp.set_write_timeout(Some(SOCKET_TIMEOUT))?;
        tcp.set_nodelay(true)?;

        Ok(Box::new(rustls::StreamOwned::new(conn, tcp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_host_name() {
        // An empty host can never be a valid SNI name; the connector must
        // fail before opening any socket.
        if let Ok(connector) = TlsConnect::new() {
            assert!(connector.connect("", 443).is_err());
        }
    }
}
