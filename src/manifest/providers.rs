//! Known-provider table and the protected environment variable set.
//!
//! The table is the *only* source of truth for a known provider's upstream
//! domain: manifest-supplied domains for these providers are discarded, so a
//! malicious manifest cannot redirect a real key to an attacker-controlled
//! host. It is initialized once at startup and never mutated.

use std::collections::HashSet;

use once_cell::sync::Lazy;

use crate::manifest::AuthStyle;

/// Pinned upstream and auth defaults for one well-known API provider.
#[derive(Debug, Clone, Copy)]
pub struct KnownProvider {
    pub name: &'static str,
    /// Authoritative upstream host. Manifest overrides are ignored.
    pub domain: &'static str,
    /// `"bearer"` or a custom header name such as `x-api-key`.
    pub auth_header: &'static str,
    /// Base-URL env var the provider's client SDKs read natively.
    pub base_url_env: &'static str,
}

impl KnownProvider {
    /// The env var that carries this provider's key (`<NAME>_API_KEY`).
    pub fn env_var(&self) -> String {
        derive_env_var(self.name)
    }

    pub fn auth_style(&self) -> AuthStyle {
        AuthStyle::parse(self.auth_header)
    }
}

/// Well-known providers with pinned domains.
///
/// Adding an entry here automatically widens [`protected_env_vars`], so a
/// manifest can never claim the new provider's env names for itself.
pub const KNOWN_PROVIDERS: &[KnownProvider] = &[
    KnownProvider {
        name: "anthropic",
        domain: "api.anthropic.com",
        auth_header: "x-api-key",
        base_url_env: "ANTHROPIC_BASE_URL",
    },
    KnownProvider {
        name: "openai",
        domain: "api.openai.com",
        auth_header: "bearer",
        base_url_env: "OPENAI_BASE_URL",
    },
    KnownProvider {
        name: "google",
        domain: "generativelanguage.googleapis.com",
        auth_header: "bearer",
        base_url_env: "GOOGLE_BASE_URL",
    },
    KnownProvider {
        name: "groq",
        domain: "api.groq.com",
        auth_header: "bearer",
        base_url_env: "GROQ_BASE_URL",
    },
    KnownProvider {
        name: "mistral",
        domain: "api.mistral.ai",
        auth_header: "bearer",
        base_url_env: "MISTRAL_BASE_URL",
    },
    KnownProvider {
        name: "deepseek",
        domain: "api.deepseek.com",
        auth_header: "bearer",
        base_url_env: "DEEPSEEK_BASE_URL",
    },
];

/// Look up a known provider by (lowercase) name.
pub fn known_provider(name: &str) -> Option<&'static KnownProvider> {
    KNOWN_PROVIDERS.iter().find(|p| p.name == name)
}

/// Derive the default key env var for a provider name (`foo-bar` -> `FOO_BAR_API_KEY`).
pub fn derive_env_var(provider: &str) -> String {
    format!("{}_API_KEY", provider.to_uppercase().replace('-', "_"))
}

/// Derive the default base-URL env var for a provider name.
pub fn derive_base_url_env(provider: &str) -> String {
    format!("{}_BASE_URL", provider.to_uppercase().replace('-', "_"))
}

/// Host-critical env vars a manifest may never claim for key delivery.
///
/// Claiming one of these would let an agent manifest clobber the loader
/// path, shell startup, or interpreter search path of every process in the
/// sandbox, including the privileged proxy.
const PROTECTED_BASE: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "SHELL",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TERM",
    "TZ",
    "IFS",
    "ENV",
    "BASH_ENV",
    "PROMPT_COMMAND",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "DYLD_FRAMEWORK_PATH",
    "PYTHONPATH",
    "PYTHONSTARTUP",
    "NODE_PATH",
    "NODE_OPTIONS",
];

/// The full protected set: host-critical names plus every known provider's
/// key and base-URL env vars.
pub fn protected_env_vars() -> &'static HashSet<&'static str> {
    static SET: Lazy<HashSet<&'static str>> = Lazy::new(|| {
        let mut set: HashSet<&'static str> = PROTECTED_BASE.iter().copied().collect();
        for p in KNOWN_PROVIDERS {
            // Leak the derived names once; the set lives for the process.
            set.insert(Box::leak(p.env_var().into_boxed_str()));
            set.insert(p.base_url_env);
        }
        set
    });
    &SET
}

/// Env vars that belong to some known provider (key or base URL), mapped
/// back to the owning provider name. Used to detect cross-provider theft.
pub fn known_provider_owning(env: &str) -> Option<&'static str> {
    static OWNERS: Lazy<Vec<(String, &'static str)>> = Lazy::new(|| {
        let mut owners = Vec::new();
        for p in KNOWN_PROVIDERS {
            owners.push((p.env_var(), p.name));
            owners.push((p.base_url_env.to_string(), p.name));
        }
        owners
    });
    OWNERS
        .iter()
        .find(|(var, _)| var == env)
        .map(|(_, name)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_provider_lookup() {
        let anthropic = known_provider("anthropic").unwrap();
        assert_eq!(anthropic.domain, "api.anthropic.com");
        assert_eq!(anthropic.auth_header, "x-api-key");
        assert!(known_provider("evilcorp").is_none());
    }

    #[test]
    fn test_derive_env_var_replaces_dashes() {
        assert_eq!(derive_env_var("my-provider"), "MY_PROVIDER_API_KEY");
        assert_eq!(derive_base_url_env("my-provider"), "MY_PROVIDER_BASE_URL");
    }

    #[test]
    fn test_protected_set_includes_known_providers() {
        let set = protected_env_vars();
        assert!(set.contains("PATH"));
        assert!(set.contains("LD_PRELOAD"));
        assert!(set.contains("ANTHROPIC_API_KEY"));
        assert!(set.contains("OPENAI_BASE_URL"));
    }

    #[test]
    fn test_known_provider_owning() {
        assert_eq!(known_provider_owning("ANTHROPIC_API_KEY"), Some("anthropic"));
        assert_eq!(known_provider_owning("OPENAI_BASE_URL"), Some("openai"));
        assert_eq!(known_provider_owning("CUSTOM_API_KEY"), None);
    }
}
