//! Sandbox orchestrator: the ordered, security-critical bring-up sequence.
//!
//! One invocation takes `(manifest, agent_dir, prior_state, secrets)` and
//! produces a running agent inside a fresh VM whose environment contains
//! only placeholder tokens and loopback base URLs. The ordering below is a
//! total order with happens-before; each step must complete before the
//! next begins, and any failure before the agent starts destroys the VM:
//!
//! ```text
//! env allowlist ─► create VM ─► upload code ─► restore state
//!      ─► harden ─► start proxy ─► setup command ─► exec agent
//! ```
//!
//! The two steps that must never be reordered past agent start are harden
//! and proxy-ready: no agent byte executes until both have completed, and
//! that invariant is asserted in code as well as recorded in the session
//! event log.

pub mod env;
pub mod network;
pub mod routes;
pub mod session;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::error::SandboxError;
use crate::manifest::Manifest;
use crate::proxy::parse_ready_line;
use crate::sandbox::{Vm, VmProcess, VmProvider, VmSpec, VmUser};
use crate::snapshot;

pub use routes::{BASE_PORT, RoutePlan, build_plan, generate_session_token};
pub use session::{AgentMessage, SessionHandle};

/// Agent home inside the VM.
pub const AGENT_HOME: &str = "/home/user";

/// Where agent code lands inside the VM.
pub const AGENT_DIR: &str = "/home/user/agent";

/// Workspace directory created for every session.
pub const WORKSPACE_DIR: &str = "/home/user/workspace";

/// Privileged path the proxy binary is uploaded to, mode `0700`.
pub const PROXY_PATH: &str = "/opt/primordial-proxy";

/// One completed bring-up step. The log order is the execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    EnvFiltered,
    VmCreated,
    CodeUploaded,
    StateRestored,
    Hardened,
    ProxyReady,
    SetupFinished,
    AgentStarted,
}

/// Timeouts and paths for the orchestrator. All waits are bounded.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub vm_create_timeout: Duration,
    pub upload_timeout: Duration,
    pub proxy_ready_timeout: Duration,
    pub setup_timeout: Duration,
    /// Host path of the `primordial-proxy` binary uploaded into each VM.
    pub proxy_binary: PathBuf,
    /// First loopback port assigned to provider routes.
    pub base_port: u16,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            vm_create_timeout: Duration::from_secs(120),
            upload_timeout: Duration::from_secs(60),
            proxy_ready_timeout: Duration::from_secs(10),
            setup_timeout: Duration::from_secs(600),
            proxy_binary: default_proxy_binary(),
            base_port: BASE_PORT,
        }
    }
}

/// The proxy binary ships beside the host executable.
fn default_proxy_binary() -> PathBuf {
    std::env::current_exe()
        .map(|exe| exe.with_file_name("primordial-proxy"))
        .unwrap_or_else(|_| PathBuf::from("primordial-proxy"))
}

/// Drives sessions against a VM provider. Sessions are independent; the
/// orchestrator itself holds no per-session state.
pub struct Orchestrator {
    provider: Arc<dyn VmProvider>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn VmProvider>, config: OrchestratorConfig) -> Orchestrator {
        Orchestrator { provider, config }
    }

    /// Bring up one session. `secrets` is the vault-resolved subset for
    /// this manifest; the orchestrator drops its copy once the proxy has
    /// received the routes on stdin.
    pub async fn run(
        &self,
        manifest: &Manifest,
        agent_dir: &Path,
        prior_state: Option<&[u8]>,
        secrets: HashMap<String, SecretString>,
    ) -> Result<SessionHandle, SandboxError> {
        // Re-check the manifest invariants; programmatic callers may not
        // have gone through `Manifest::from_yaml`.
        manifest.validate()?;

        let session_id = Uuid::new_v4();
        let session_token = generate_session_token();
        let plan = build_plan(manifest, &secrets, &session_token, self.config.base_port)?;
        drop(secrets);

        // Step 1: host env allowlist. Nothing else crosses the boundary.
        let safe_env = env::filter_host_env(std::env::vars());
        let mut events = vec![SessionEvent::EnvFiltered];

        // Step 2: create the VM with the derived egress policy.
        let spec = VmSpec {
            egress: network::egress_policy(manifest),
            env: safe_env,
            max_memory_mb: manifest.runtime.resources.max_memory_mb,
            max_cpu: manifest.runtime.resources.max_cpu,
        };
        let vm = tokio::time::timeout(self.config.vm_create_timeout, self.provider.create(spec))
            .await
            .map_err(|_| SandboxError::timeout("vm_create", self.config.vm_create_timeout))??;
        events.push(SessionEvent::VmCreated);
        tracing::info!(session_id = %session_id, agent = %manifest.name, "vm created");

        // Steps 3-8. Any failure destroys the VM; there is no partial start.
        match self
            .bring_up(vm.as_ref(), manifest, agent_dir, prior_state, plan, &mut events)
            .await
        {
            Ok(agent) => {
                tracing::info!(session_id = %session_id, agent = %manifest.name, "agent started");
                Ok(SessionHandle::new(session_id, vm, agent, events))
            }
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "bring-up failed; destroying vm");
                let _ = vm.destroy().await;
                Err(err)
            }
        }
    }

    async fn bring_up(
        &self,
        vm: &dyn Vm,
        manifest: &Manifest,
        agent_dir: &Path,
        prior_state: Option<&[u8]>,
        plan: RoutePlan,
        events: &mut Vec<SessionEvent>,
    ) -> Result<Box<dyn VmProcess>, SandboxError> {
        let has_routes = plan.has_routes();

        // Step 3: upload agent code as the unprivileged user.
        self.upload_agent_code(vm, agent_dir).await?;
        events.push(SessionEvent::CodeUploaded);

        // Step 4: restore prior state through the safe filter.
        if let Some(bytes) = prior_state {
            self.restore_state(vm, bytes).await?;
            events.push(SessionEvent::StateRestored);
        }

        // Step 5: harden before any agent-controlled code can run.
        self.harden(vm, has_routes).await?;
        events.push(SessionEvent::Hardened);

        // Step 6: start the proxy. After this the host holds no secrets.
        let agent_env = plan.agent_env.clone();
        if has_routes {
            self.start_proxy(vm, plan).await?;
            events.push(SessionEvent::ProxyReady);
        }

        // Step 7: setup, after the proxy owns its ports so a malicious
        // setup script cannot squat them.
        if let Some(setup) = &manifest.runtime.setup_command {
            self.run_setup(vm, setup).await?;
            events.push(SessionEvent::SetupFinished);
        }

        // Step 8: exec the agent. The happens-before invariant is the
        // heart of the security model; assert it, don't just trust it.
        assert!(
            events.contains(&SessionEvent::Hardened),
            "agent exec ordered before hardening"
        );
        assert!(
            !has_routes || events.contains(&SessionEvent::ProxyReady),
            "agent exec ordered before proxy readiness"
        );

        let command = env::build_run_command(AGENT_DIR, &manifest.runtime.run_command, &agent_env);
        let agent = vm.spawn(&command, VmUser::Unprivileged).await?;
        events.push(SessionEvent::AgentStarted);
        Ok(agent)
    }

    async fn upload_agent_code(&self, vm: &dyn Vm, agent_dir: &Path) -> Result<(), SandboxError> {
        let dir = agent_dir.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || snapshot::archive_dir(&dir))
            .await
            .map_err(|_| SandboxError::Upload {
                reason: "archive task failed".to_string(),
            })?
            .map_err(|err| SandboxError::Upload {
                reason: err.to_string(),
            })?;

        let tmp = scratch_path("upload");
        tokio::time::timeout(
            self.config.upload_timeout,
            vm.upload(&tmp, &archive, VmUser::Unprivileged, 0o600),
        )
        .await
        .map_err(|_| SandboxError::timeout("upload", self.config.upload_timeout))??;

        let extract = format!(
            "mkdir -p {dir} {workspace} && tar xzf {tmp} -C {dir} && rm {tmp}",
            dir = AGENT_DIR,
            workspace = WORKSPACE_DIR,
        );
        let output = vm
            .run(&extract, VmUser::Unprivileged, self.config.upload_timeout)
            .await?;
        if !output.success() {
            return Err(SandboxError::Upload {
                reason: "agent code extraction failed".to_string(),
            });
        }
        Ok(())
    }

    async fn restore_state(&self, vm: &dyn Vm, bytes: &[u8]) -> Result<(), SandboxError> {
        // Validate-and-rewrite on the host; a clean archive comes out or
        // the whole restore fails before anything reaches the VM.
        let raw = bytes.to_vec();
        let clean = tokio::task::spawn_blocking(move || snapshot::sanitize(&raw))
            .await
            .map_err(|_| SandboxError::Process {
                reason: "snapshot task failed".to_string(),
            })??;

        let tmp = scratch_path("state");
        tokio::time::timeout(
            self.config.upload_timeout,
            vm.upload(&tmp, &clean, VmUser::Unprivileged, 0o600),
        )
        .await
        .map_err(|_| SandboxError::timeout("state_restore", self.config.upload_timeout))??;

        let extract = format!("cd {} && tar xzf {tmp} && rm {tmp}", AGENT_HOME);
        let output = vm
            .run(&extract, VmUser::Unprivileged, self.config.upload_timeout)
            .await?;
        if !output.success() {
            return Err(SandboxError::Upload {
                reason: "state extraction failed".to_string(),
            });
        }
        Ok(())
    }

    /// Neutralize privilege escalation and hide the process table.
    ///
    /// Fail-closed: if `hidepid=2` cannot be applied while provider keys
    /// are in use, the proxy's environment would be readable from `/proc`
    /// and the session must not proceed.
    async fn harden(&self, vm: &dyn Vm, has_routes: bool) -> Result<(), SandboxError> {
        let neutralize = "chmod o-rx /usr/bin/sudo /usr/bin/su /usr/sbin/su 2>/dev/null; \
                          deluser user sudo 2>/dev/null; true";
        vm.run(neutralize, VmUser::Privileged, Duration::from_secs(30))
            .await?;

        let hide = vm
            .run(
                "mount -o remount,hidepid=2 /proc",
                VmUser::Privileged,
                Duration::from_secs(30),
            )
            .await?;
        if !hide.success() {
            if has_routes {
                return Err(SandboxError::Harden {
                    reason: "cannot hide process table while provider keys are in use".to_string(),
                });
            }
            tracing::warn!("hidepid remount failed; no provider keys in use, continuing");
        }
        Ok(())
    }

    /// Upload, launch, and confirm the credential proxy.
    ///
    /// The route table (with real secrets) goes to the proxy's stdin only.
    /// Once the write completes the host's serialized copy is zeroed and
    /// the plan dropped; from here the secrets live solely in the proxy
    /// process inside the VM.
    async fn start_proxy(&self, vm: &dyn Vm, plan: RoutePlan) -> Result<(), SandboxError> {
        let binary = tokio::fs::read(&self.config.proxy_binary)
            .await
            .map_err(|_| SandboxError::ProxyStart {
                reason: "proxy binary unavailable on host".to_string(),
            })?;

        tokio::time::timeout(
            self.config.upload_timeout,
            vm.upload(PROXY_PATH, &binary, VmUser::Privileged, 0o700),
        )
        .await
        .map_err(|_| SandboxError::timeout("proxy_upload", self.config.upload_timeout))??;

        let first_port = plan.proxy_config.routes[0].port;
        let mut proxy = vm.spawn(PROXY_PATH, VmUser::Privileged).await?;

        let mut config_line =
            serde_json::to_string(&plan.proxy_config).map_err(|_| SandboxError::ProxyStart {
                reason: "route table encoding failed".to_string(),
            })?;
        config_line.push('\n');
        let write_result = proxy.write_stdin(config_line.as_bytes()).await;
        config_line.zeroize();
        drop(plan);
        write_result?;

        // Readiness marker on stderr, then a TCP poll of the first port.
        let deadline = tokio::time::Instant::now() + self.config.proxy_ready_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(SandboxError::timeout(
                    "proxy_ready",
                    self.config.proxy_ready_timeout,
                ));
            }
            let line = tokio::time::timeout(remaining, proxy.read_stderr_line())
                .await
                .map_err(|_| {
                    SandboxError::timeout("proxy_ready", self.config.proxy_ready_timeout)
                })??;
            match line {
                Some(line) => {
                    if parse_ready_line(&line).is_some() {
                        break;
                    }
                }
                None => {
                    return Err(SandboxError::ProxyStart {
                        reason: "proxy exited before readiness".to_string(),
                    });
                }
            }
        }

        let poll = format!(
            "bash -c 'for i in $(seq 1 50); do (exec 3<>/dev/tcp/127.0.0.1/{port}) 2>/dev/null && exit 0; sleep 0.2; done; exit 1'",
            port = first_port,
        );
        let output = vm
            .run(&poll, VmUser::Privileged, Duration::from_secs(30))
            .await?;
        if !output.success() {
            return Err(SandboxError::ProxyStart {
                reason: "proxy port is not accepting connections".to_string(),
            });
        }
        Ok(())
    }

    async fn run_setup(&self, vm: &dyn Vm, setup: &str) -> Result<(), SandboxError> {
        let command = format!("cd {} && {}", AGENT_DIR, setup);
        let output = vm
            .run(&command, VmUser::Unprivileged, self.config.setup_timeout)
            .await?;
        if !output.success() {
            let mut detail = if output.stderr.is_empty() {
                output.stdout
            } else {
                output.stderr
            };
            detail.truncate(500);
            return Err(SandboxError::Setup {
                exit_code: output.exit_code,
                detail,
            });
        }
        Ok(())
    }
}

fn scratch_path(kind: &str) -> String {
    let mut nonce = [0u8; 8];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);
    format!("/tmp/_{}_{}.tar.gz", kind, hex::encode(nonce))
}
