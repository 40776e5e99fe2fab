//! In-sandbox credential proxy binary.
//!
//! Runs as the privileged user inside the VM at a `0700` path. Reads its
//! configuration (session token plus one route per provider, including the
//! real API keys) as a single JSON line on stdin, binds every loopback
//! listener, then emits the readiness marker on stderr and serves until the
//! orchestrator signals the process.
//!
//! Secrets arrive on stdin only; they are never present in argv, the
//! environment, or on disk, and they never appear in anything this process
//! writes out.

use std::io::BufRead;
use std::process::ExitCode;
use std::sync::Arc;

use primordial::proxy::{self, ProxyConfig, TlsConnect};

fn main() -> ExitCode {
    let stdin = std::io::stdin();
    let mut line = String::new();
    if stdin.lock().read_line(&mut line).is_err() || line.trim().is_empty() {
        eprintln!("primordial-proxy: no configuration on stdin");
        return ExitCode::FAILURE;
    }

    let config: ProxyConfig = match serde_json::from_str(line.trim()) {
        Ok(config) => config,
        Err(_) => {
            // Parse errors are not echoed: the raw line holds key material.
            eprintln!("primordial-proxy: invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    if config.routes.is_empty() {
        eprintln!("primordial-proxy: no routes configured");
        return ExitCode::FAILURE;
    }

    let connector = match TlsConnect::new() {
        Ok(connector) => Arc::new(connector),
        Err(err) => {
            eprintln!("primordial-proxy: tls init failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    let running = match proxy::serve(config, connector) {
        Ok(running) => running,
        Err(err) => {
            eprintln!("primordial-proxy: bind failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    // Every listener is bound; requests are now being served.
    eprintln!("{}", proxy::ready_line(running.ports()));

    // Serve until the orchestrator terminates the process. SIGTERM's
    // default disposition kills us with a nonzero status and the kernel
    // closes the listeners, which is exactly the contract.
    running.join();
    ExitCode::FAILURE
}
