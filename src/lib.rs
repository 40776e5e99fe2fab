//! Primordial runs untrusted AI-agent code inside fresh, network-isolated
//! microVMs while letting those agents call real third-party HTTP APIs with
//! credentials the agent can never see.
//!
//! The security core, in dependency order:
//!
//! - [`manifest`]: strict parsing and validation of an agent's declaration
//!   of keys, domains, and permissions.
//! - [`vault`]: encrypted, machine-bound at-rest store of API keys.
//! - [`proxy`]: the in-sandbox credential proxy with token auth, header
//!   sanitization, upstream pinning, streaming. Ships as the
//!   `primordial-proxy` binary.
//! - [`orchestrator`]: the strict-ordered bring-up from empty VM to
//!   running agent: create, upload, restore, harden, proxy, setup, exec.
//! - [`snapshot`]: safe tar pack/unpack of allowlisted session state.
//!
//! The microVM provider and the agent-registry resolver are external
//! collaborators behind the traits in [`sandbox`].
//!
//! The core invariant: real secrets cross the VM boundary exactly once,
//! from the vault through the orchestrator onto the proxy's stdin. The
//! agent only ever sees a per-session placeholder token and a loopback
//! base URL per provider.

pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod proxy;
pub mod sandbox;
pub mod snapshot;
pub mod vault;

pub use error::SandboxError;
pub use manifest::{Manifest, ValidationError};
pub use orchestrator::{Orchestrator, OrchestratorConfig, SessionHandle};
pub use vault::{Vault, VaultError};
