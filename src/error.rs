//! Session-level error types.
//!
//! Everything that can go wrong between "run this agent" and "the agent
//! process is executing" is a [`SandboxError`]. Before the agent starts,
//! every variant is fatal for the session and the VM is destroyed; there is
//! no partial start. Messages are short and fixed plus opaque identifiers,
//! never secret bytes, ciphertext, or upstream error bodies.

use crate::manifest::ValidationError;
use crate::snapshot::SnapshotError;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The manifest failed re-validation at orchestration time.
    #[error(transparent)]
    Manifest(#[from] ValidationError),

    /// No secret was supplied for a required provider.
    #[error("no key available for required provider '{provider}'")]
    MissingKey { provider: String },

    /// Route derivation found a conflict the validator could not have
    /// caught statically.
    #[error("provider route conflict: {reason}")]
    RouteConflict { reason: String },

    /// The VM provider failed to create or operate a VM.
    #[error("vm provider failure: {reason}")]
    Provider { reason: String },

    /// Uploading agent code or state into the VM failed.
    #[error("upload into vm failed: {reason}")]
    Upload { reason: String },

    /// In-VM hardening could not be applied.
    #[error("sandbox hardening failed: {reason}")]
    Harden { reason: String },

    /// The credential proxy did not come up.
    #[error("credential proxy start failed: {reason}")]
    ProxyStart { reason: String },

    /// The manifest's setup command exited nonzero.
    #[error("setup command failed with exit code {exit_code}")]
    Setup { exit_code: i32, detail: String },

    /// A prior-state archive violated the safe-extraction rules.
    #[error("state restore rejected: {0}")]
    StateRestore(#[from] SnapshotError),

    /// Packing session state at close failed.
    #[error("state save failed: {reason}")]
    StateSave { reason: String },

    /// A bounded wait expired.
    #[error("timed out after {secs}s during {step}")]
    Timeout { step: &'static str, secs: u64 },

    /// I/O with a process inside the VM failed.
    #[error("vm process I/O failed: {reason}")]
    Process { reason: String },
}

impl SandboxError {
    pub fn provider(reason: impl Into<String>) -> Self {
        SandboxError::Provider {
            reason: reason.into(),
        }
    }

    pub fn timeout(step: &'static str, timeout: std::time::Duration) -> Self {
        SandboxError::Timeout {
            step,
            secs: timeout.as_secs(),
        }
    }
}
