//! Serde structs for agent manifests (`agent.yaml`).
//!
//! A manifest declares what an agent needs (API keys, network egress,
//! filesystem access) and is the input the whole security model hangs off.
//! Parsing is strict: unknown top-level fields are ignored for forward
//! compatibility, but unknown fields inside `providers[]` and
//! `permissions.*` are rejected because a typo there would silently widen
//! the sandbox.

pub mod providers;
pub mod validate;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use providers::{KNOWN_PROVIDERS, KnownProvider, known_provider, protected_env_vars};
pub use validate::{ValidationError, Violation};

/// How a provider expects its API key on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` (the reserved token `"bearer"`).
    Bearer,
    /// A custom header, e.g. `x-api-key: <key>`.
    Header(String),
}

impl AuthStyle {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("bearer") {
            AuthStyle::Bearer
        } else {
            AuthStyle::Header(s.to_ascii_lowercase())
        }
    }

    /// The wire form: `"bearer"` or the header name.
    pub fn as_str(&self) -> &str {
        match self {
            AuthStyle::Bearer => "bearer",
            AuthStyle::Header(name) => name,
        }
    }
}

impl fmt::Display for AuthStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AuthStyle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AuthStyle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(AuthStyle::parse(&s))
    }
}

/// One API key the agent needs, and how the proxy should route it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderRequirement {
    /// Lowercase provider identifier (`anthropic`, `my-billing-api`, ...).
    pub name: String,

    /// Upstream host for unknown providers. Ignored for known providers,
    /// whose domain is pinned in [`providers::KNOWN_PROVIDERS`].
    #[serde(default)]
    pub domain: Option<String>,

    /// `"bearer"` or a custom header name. Defaults to the known provider's
    /// canonical style, or bearer for unknown providers.
    #[serde(default)]
    pub auth_style: Option<AuthStyle>,

    /// Env var the agent reads the (placeholder) key from.
    /// Defaults to `<NAME>_API_KEY`.
    #[serde(default)]
    pub env_var: Option<String>,

    /// Env var carrying the localhost proxy URL.
    /// Defaults to `<NAME>_BASE_URL`.
    #[serde(default)]
    pub base_url_env: Option<String>,

    /// When false, a missing vault entry skips the route instead of
    /// failing the session.
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

impl ProviderRequirement {
    /// The env var this provider's placeholder token is delivered in.
    pub fn resolved_env_var(&self) -> String {
        self.env_var
            .clone()
            .unwrap_or_else(|| providers::derive_env_var(&self.name))
    }

    /// The env var this provider's proxy base URL is delivered in.
    pub fn resolved_base_url_env(&self) -> String {
        if let Some(ref explicit) = self.base_url_env {
            return explicit.clone();
        }
        if let Some(known) = known_provider(&self.name) {
            return known.base_url_env.to_string();
        }
        providers::derive_base_url_env(&self.name)
    }

    /// The auth style the proxy uses for this route. A manifest override is
    /// honored; otherwise known providers get their canonical style and
    /// unknown providers default to bearer.
    pub fn resolved_auth_style(&self) -> AuthStyle {
        if let Some(ref style) = self.auth_style {
            return style.clone();
        }
        match known_provider(&self.name) {
            Some(known) => known.auth_style(),
            None => AuthStyle::Bearer,
        }
    }

    /// The pinned upstream host. Known providers always use the table
    /// domain; unknown providers use their declared one.
    pub fn resolved_domain(&self) -> Option<String> {
        match known_provider(&self.name) {
            Some(known) => Some(known.domain.to_string()),
            None => self.domain.clone(),
        }
    }

    pub fn is_known(&self) -> bool {
        known_provider(&self.name).is_some()
    }
}

/// One domain the agent is allowed to reach directly, with a human reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkPermission {
    pub domain: String,
    pub reason: String,
}

/// Workspace mount mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceAccess {
    None,
    Readonly,
    Readwrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesystemPermission {
    #[serde(default = "default_workspace_access")]
    pub workspace: WorkspaceAccess,
}

fn default_workspace_access() -> WorkspaceAccess {
    WorkspaceAccess::Readwrite
}

impl Default for FilesystemPermission {
    fn default() -> Self {
        Self {
            workspace: WorkspaceAccess::Readwrite,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DelegationPermission {
    #[serde(default)]
    pub enabled: bool,
    /// Opaque agent identifiers; not interpreted by the core.
    #[serde(default)]
    pub allowed_agents: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Permissions {
    #[serde(default)]
    pub network: Vec<NetworkPermission>,
    /// Full internet access. Requires explicit user consent upstream.
    #[serde(default)]
    pub network_unrestricted: bool,
    #[serde(default)]
    pub filesystem: FilesystemPermission,
    #[serde(default)]
    pub delegation: DelegationPermission,
}

/// Advisory resource limits, passed through to the VM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    #[serde(default = "default_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_max_cpu")]
    pub max_cpu: u32,
}

fn default_memory_mb() -> u64 {
    2048
}

fn default_max_cpu() -> u32 {
    2
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 2048,
            max_cpu: 2,
        }
    }
}

/// How the agent is installed and started inside the VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Command that starts the agent process (unprivileged user).
    pub run_command: String,

    /// Optional one-shot install command (pip install, npm ci, ...).
    #[serde(default)]
    pub setup_command: Option<String>,

    /// Path to a dependency declaration, relative to the agent dir.
    #[serde(default)]
    pub dependencies: Option<String>,

    #[serde(default)]
    pub resources: ResourceLimits,
}

/// Complete agent manifest parsed from `agent.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,

    #[serde(default)]
    pub description: Option<String>,

    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub permissions: Permissions,

    /// API keys the agent needs, routed through the credential proxy.
    #[serde(default)]
    pub providers: Vec<ProviderRequirement>,
}

impl Manifest {
    /// Parse and strictly validate a manifest from YAML.
    ///
    /// Validation is batched: the error lists every violation so authors
    /// can fix the file in one pass.
    pub fn from_yaml(raw: &str) -> Result<Manifest, ValidationError> {
        let manifest: Manifest =
            serde_yaml::from_str(raw).map_err(ValidationError::from_parse)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Re-run the §3 invariants on an already-parsed manifest.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate::validate(self)
    }
}
