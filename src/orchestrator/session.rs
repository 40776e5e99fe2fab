//! A running agent session and its NDJSON message channel.

use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::SandboxError;
use crate::orchestrator::{AGENT_HOME, SessionEvent};
use crate::sandbox::{Vm, VmProcess, VmUser};
use crate::snapshot;

/// One message from the agent, read as NDJSON off its stdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// The agent finished initializing and is accepting input.
    Ready,
    Message {
        content: String,
        message_id: String,
    },
    /// Any other well-formed message type; passed through untyped.
    #[serde(other)]
    Unknown,
}

/// Handle to a live session: the VM, the agent process, and the recorded
/// bring-up event log.
///
/// [`SessionHandle::close`] is idempotent and always destroys the VM.
pub struct SessionHandle {
    session_id: Uuid,
    vm: Box<dyn Vm>,
    agent: Box<dyn VmProcess>,
    events: Vec<SessionEvent>,
    closed: bool,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("events", &self.events)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: Uuid,
        vm: Box<dyn Vm>,
        agent: Box<dyn VmProcess>,
        events: Vec<SessionEvent>,
    ) -> SessionHandle {
        SessionHandle {
            session_id,
            vm,
            agent,
            events,
            closed: false,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// The bring-up steps that completed, in order.
    pub fn events(&self) -> &[SessionEvent] {
        &self.events
    }

    /// The underlying VM, for provider-specific inspection.
    pub fn vm(&self) -> &dyn Vm {
        self.vm.as_ref()
    }

    /// Send one user message to the agent.
    pub async fn send_message(
        &mut self,
        content: &str,
        message_id: &str,
    ) -> Result<(), SandboxError> {
        let mut line = serde_json::json!({
            "type": "message",
            "content": content,
            "message_id": message_id,
        })
        .to_string();
        line.push('\n');
        self.agent.write_stdin(line.as_bytes()).await
    }

    /// Next well-formed message from the agent, or `None` on timeout or
    /// process exit. Unparsable stdout lines (prints, logs) are skipped.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Option<AgentMessage>, SandboxError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let line = match tokio::time::timeout(remaining, self.agent.read_stdout_line()).await {
                Err(_) => return Ok(None),
                Ok(result) => match result? {
                    Some(line) => line,
                    None => return Ok(None),
                },
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<AgentMessage>(line) {
                Ok(message) => return Ok(Some(message)),
                Err(_) => continue,
            }
        }
    }

    /// Wait for the agent's ready signal, draining earlier messages.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<bool, SandboxError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            match self.receive(remaining).await? {
                Some(AgentMessage::Ready) => return Ok(true),
                Some(_) => continue,
                None => return Ok(false),
            }
        }
    }

    /// Exit code of the agent process, if it has finished.
    pub async fn exit_code(&mut self) -> Result<Option<i32>, SandboxError> {
        self.agent.try_wait().await
    }

    /// End the session: send the shutdown message, pack session state, then
    /// destroy the VM unconditionally.
    ///
    /// Returns the packed state for durable storage. Idempotent: a second
    /// call is a no-op returning `Ok(None)`. A state-pack failure still
    /// destroys the VM and surfaces the error.
    pub async fn close(&mut self) -> Result<Option<Vec<u8>>, SandboxError> {
        if self.closed {
            return Ok(None);
        }
        self.closed = true;

        // Best effort: a hung or exited agent must not block teardown.
        let _ = self.agent.write_stdin(b"{\"type\":\"shutdown\"}\n").await;

        let state = self.save_state().await;

        let destroy = self.vm.destroy().await;
        tracing::info!(session_id = %self.session_id, "session closed");

        match state {
            Ok(bytes) => {
                destroy?;
                Ok(Some(bytes))
            }
            Err(err) => Err(err),
        }
    }

    /// Pack the allowlisted state directories inside the VM and pull the
    /// archive out, re-filtered host-side before anything trusts it.
    async fn save_state(&self) -> Result<Vec<u8>, SandboxError> {
        let mut nonce = [0u8; 8];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);
        let tmp = format!("/tmp/_state_{}.tar.gz", hex::encode(nonce));

        let dirs = snapshot::STATE_ALLOW_DIRS
            .iter()
            .map(|d| format!("./{}", d))
            .collect::<Vec<_>>()
            .join(" ");
        let pack_cmd = format!(
            "cd {} && tar czf {} {} 2>/dev/null; true",
            AGENT_HOME, tmp, dirs
        );
        self.vm
            .run(&pack_cmd, VmUser::Privileged, Duration::from_secs(60))
            .await?;

        let raw = self.vm.download(&tmp).await?;

        // The archive was produced inside an agent-controlled VM; treat it
        // as hostile and rewrite it through the safe filter.
        tokio::task::spawn_blocking(move || snapshot::sanitize(&raw))
            .await
            .map_err(|_| SandboxError::StateSave {
                reason: "snapshot task failed".to_string(),
            })?
            .map_err(|err| SandboxError::StateSave {
                reason: err.to_string(),
            })
    }
}
