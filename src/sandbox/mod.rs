//! Contracts for the external collaborators of the orchestrator.
//!
//! The microVM/firewall provider and the agent-registry resolver are not
//! implemented here; the orchestrator drives them through these traits.
//! Tests use a scripted in-memory provider; production wires in whatever
//! backs the fleet (Firecracker, a container engine, a remote API).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SandboxError;

/// Egress policy for a new VM, derived from the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressPolicy {
    /// No outbound traffic at all.
    DenyAll,
    /// Deny `0.0.0.0/0`, then allow exactly these domains.
    Allowlist(Vec<String>),
    /// No filtering. Requires prior user consent at the calling layer.
    Unrestricted,
}

/// Request to create one VM.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub egress: EgressPolicy,
    /// Environment visible to every process in the VM. Already filtered
    /// through the host env allowlist; never contains secrets.
    pub env: HashMap<String, String>,
    /// Advisory resource limits from the manifest.
    pub max_memory_mb: u64,
    pub max_cpu: u32,
}

/// Which in-VM user account runs a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmUser {
    /// Root (or equivalent). Runs hardening and the credential proxy.
    Privileged,
    /// The agent account. Runs setup and the agent itself.
    Unprivileged,
}

/// Captured result of a command run to completion inside the VM.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Creates VMs with a given egress policy.
#[async_trait]
pub trait VmProvider: Send + Sync {
    async fn create(&self, spec: VmSpec) -> Result<Box<dyn Vm>, SandboxError>;
}

/// One running VM.
#[async_trait]
pub trait Vm: Send + Sync {
    /// Write a file into the VM with the given owner and mode.
    async fn upload(
        &self,
        path: &str,
        contents: &[u8],
        user: VmUser,
        mode: u32,
    ) -> Result<(), SandboxError>;

    /// Read a file out of the VM.
    async fn download(&self, path: &str) -> Result<Vec<u8>, SandboxError>;

    /// Run a shell command to completion, capturing output. The provider
    /// enforces `timeout` inside the VM.
    async fn run(
        &self,
        command: &str,
        user: VmUser,
        timeout: Duration,
    ) -> Result<CommandOutput, SandboxError>;

    /// Start a long-lived process with a stdin pipe.
    async fn spawn(&self, command: &str, user: VmUser) -> Result<Box<dyn VmProcess>, SandboxError>;

    /// Tear the VM down. Must be safe to call more than once.
    async fn destroy(&self) -> Result<(), SandboxError>;
}

/// A long-lived process inside a VM (the proxy, the agent).
#[async_trait]
pub trait VmProcess: Send {
    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), SandboxError>;

    /// Next line of stdout, or `None` once the process has exited and the
    /// stream is drained.
    async fn read_stdout_line(&mut self) -> Result<Option<String>, SandboxError>;

    /// Next line of stderr, or `None` at end of stream.
    async fn read_stderr_line(&mut self) -> Result<Option<String>, SandboxError>;

    /// Exit code if the process has finished.
    async fn try_wait(&mut self) -> Result<Option<i32>, SandboxError>;

    async fn kill(&mut self) -> Result<(), SandboxError>;
}

/// Resolves an agent reference to a local directory containing its code
/// and manifest. Implemented by the registry layer, not here.
#[async_trait]
pub trait AgentResolver: Send + Sync {
    async fn resolve(&self, url: &str, reference: Option<&str>)
    -> Result<PathBuf, SandboxError>;
}
