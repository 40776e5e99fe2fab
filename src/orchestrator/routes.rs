//! Proxy route derivation.
//!
//! Turns the manifest's provider declarations plus the vault-resolved
//! secrets into the proxy's route table and the agent's placeholder
//! environment. The §3 namespace invariants are re-checked here even though
//! the validator enforces them at parse time: a manifest constructed
//! programmatically never went through `from_yaml`.

use std::collections::HashMap;

use secrecy::{ExposeSecret, SecretString};

use crate::error::SandboxError;
use crate::manifest::providers::known_provider_owning;
use crate::manifest::{Manifest, protected_env_vars};
use crate::proxy::{ProxyConfig, RouteConfig};

/// First loopback port assigned to a provider route.
pub const BASE_PORT: u16 = 9001;

/// The derived per-session route table and agent environment.
#[derive(Debug)]
pub struct RoutePlan {
    /// Proxy configuration, including real secrets. Dropped by the
    /// orchestrator immediately after the write to the proxy's stdin.
    pub proxy_config: ProxyConfig,
    /// Placeholder env for the agent: `env_var` -> session token,
    /// `base_url_env` -> loopback URL.
    pub agent_env: HashMap<String, String>,
}

impl RoutePlan {
    pub fn has_routes(&self) -> bool {
        !self.proxy_config.routes.is_empty()
    }
}

/// Generate a fresh 128-bit session token, hex encoded.
pub fn generate_session_token() -> String {
    let mut bytes = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    format!("sess-{}", hex::encode(bytes))
}

/// Build the route plan for one session.
///
/// `secrets` comes from [`crate::vault::Vault::resolve_for`] and holds only
/// providers this manifest declares. Required providers without a secret
/// fail with [`SandboxError::MissingKey`].
pub fn build_plan(
    manifest: &Manifest,
    secrets: &HashMap<String, SecretString>,
    session_token: &str,
    base_port: u16,
) -> Result<RoutePlan, SandboxError> {
    let mut routes = Vec::new();
    let mut agent_env: HashMap<String, String> = HashMap::new();
    let mut port = base_port;

    for req in &manifest.providers {
        let Some(secret) = secrets.get(&req.name) else {
            if req.required {
                return Err(SandboxError::MissingKey {
                    provider: req.name.clone(),
                });
            }
            continue;
        };

        let env_var = req.resolved_env_var();
        let base_url_env = req.resolved_base_url_env();

        // An unknown provider claiming a known provider's env var would
        // receive that provider's real key and route it to its own domain.
        // A provider's own canonical names are exempt; everything else in
        // the protected set is off limits.
        for var in [&env_var, &base_url_env] {
            match known_provider_owning(var) {
                Some(owner) if owner != req.name => {
                    return Err(SandboxError::RouteConflict {
                        reason: format!(
                            "provider '{}' cannot use env var '{}' owned by '{}'",
                            req.name, var, owner
                        ),
                    });
                }
                None if protected_env_vars().contains(var.as_str()) => {
                    return Err(SandboxError::RouteConflict {
                        reason: format!("env var '{}' is protected", var),
                    });
                }
                _ => {}
            }
        }

        // Duplicate env names would silently hijack an existing route.
        for var in [&env_var, &base_url_env] {
            if agent_env.contains_key(var.as_str()) {
                return Err(SandboxError::RouteConflict {
                    reason: format!("duplicate env var '{}' across providers", var),
                });
            }
        }

        let Some(upstream_host) = req.resolved_domain() else {
            return Err(SandboxError::RouteConflict {
                reason: format!("provider '{}' has no upstream domain", req.name),
            });
        };

        routes.push(RouteConfig {
            provider: req.name.clone(),
            port,
            upstream_host,
            auth_style: req.resolved_auth_style(),
            secret: secret.expose_secret().to_string(),
        });
        agent_env.insert(env_var, session_token.to_string());
        agent_env.insert(base_url_env, format!("http://127.0.0.1:{}", port));
        port += 1;
    }

    Ok(RoutePlan {
        proxy_config: ProxyConfig {
            session_token: session_token.to_string(),
            routes,
        },
        agent_env,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{AuthStyle, Manifest};

    fn secrets(pairs: &[(&str, &str)]) -> HashMap<String, SecretString> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), SecretString::from(v.to_string())))
            .collect()
    }

    fn manifest(providers_yaml: &str) -> Manifest {
        Manifest::from_yaml(&format!(
            "name: test-agent\nversion: '1'\nruntime:\n  run_command: ./run\nproviders:\n{}",
            providers_yaml
        ))
        .unwrap()
    }

    #[test]
    fn test_session_token_shape() {
        let token = generate_session_token();
        assert!(token.starts_with("sess-"));
        assert_eq!(token.len(), 5 + 32);
        assert_ne!(token, generate_session_token());
    }

    #[test]
    fn test_single_known_provider_plan() {
        let m = manifest("  - name: anthropic\n");
        let plan = build_plan(&m, &secrets(&[("anthropic", "sk-REAL")]), "sess-ff", 9001).unwrap();

        assert_eq!(plan.proxy_config.routes.len(), 1);
        let route = &plan.proxy_config.routes[0];
        assert_eq!(route.port, 9001);
        assert_eq!(route.upstream_host, "api.anthropic.com");
        assert_eq!(route.auth_style, AuthStyle::Header("x-api-key".to_string()));
        assert_eq!(route.secret, "sk-REAL");

        assert_eq!(plan.agent_env["ANTHROPIC_API_KEY"], "sess-ff");
        assert_eq!(plan.agent_env["ANTHROPIC_BASE_URL"], "http://127.0.0.1:9001");
    }

    #[test]
    fn test_ports_assigned_sequentially() {
        let m = manifest("  - name: anthropic\n  - name: openai\n");
        let plan = build_plan(
            &m,
            &secrets(&[("anthropic", "a"), ("openai", "b")]),
            "sess-ff",
            9001,
        )
        .unwrap();
        let ports: Vec<u16> = plan.proxy_config.routes.iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![9001, 9002]);
    }

    #[test]
    fn test_missing_required_key() {
        let m = manifest("  - name: anthropic\n");
        let err = build_plan(&m, &secrets(&[]), "sess-ff", 9001).unwrap_err();
        assert!(matches!(err, SandboxError::MissingKey { provider } if provider == "anthropic"));
    }

    #[test]
    fn test_missing_optional_key_skipped() {
        let m = manifest("  - name: anthropic\n    required: false\n");
        let plan = build_plan(&m, &secrets(&[]), "sess-ff", 9001).unwrap();
        assert!(!plan.has_routes());
        assert!(plan.agent_env.is_empty());
    }

    #[test]
    fn test_placeholders_disjoint_from_secrets() {
        let m = manifest("  - name: anthropic\n  - name: openai\n");
        let real = secrets(&[("anthropic", "sk-a"), ("openai", "sk-o")]);
        let token = generate_session_token();
        let plan = build_plan(&m, &real, &token, 9001).unwrap();

        for value in plan.agent_env.values() {
            for route in &plan.proxy_config.routes {
                assert_ne!(value, &route.secret);
            }
        }
    }

    #[test]
    fn test_unknown_provider_uses_declared_domain() {
        let m = manifest("  - name: billing\n    domain: api.billing.dev\n    auth_style: x-billing-key\n");
        let plan = build_plan(&m, &secrets(&[("billing", "bk")]), "sess-ff", 9001).unwrap();
        assert_eq!(plan.proxy_config.routes[0].upstream_host, "api.billing.dev");
        assert_eq!(
            plan.proxy_config.routes[0].auth_style,
            AuthStyle::Header("x-billing-key".to_string())
        );
    }

    #[test]
    fn test_cross_provider_theft_rechecked() {
        // Bypass the validator: construct the requirement programmatically.
        let mut m = manifest("  - name: anthropic\n");
        m.providers[0].name = "evil".to_string();
        m.providers[0].domain = Some("evil.example.com".to_string());
        m.providers[0].env_var = Some("ANTHROPIC_API_KEY".to_string());

        let err = build_plan(&m, &secrets(&[("evil", "stolen")]), "sess-ff", 9001).unwrap_err();
        assert!(matches!(err, SandboxError::RouteConflict { .. }), "{err}");
    }

    #[test]
    fn test_protected_env_var_rechecked() {
        let mut m = manifest("  - name: custom\n    domain: api.custom.dev\n");
        m.providers[0].base_url_env = Some("LD_PRELOAD".to_string());

        let err = build_plan(&m, &secrets(&[("custom", "ck")]), "sess-ff", 9001).unwrap_err();
        assert!(matches!(err, SandboxError::RouteConflict { .. }), "{err}");
    }

    #[test]
    fn test_duplicate_env_var_rechecked() {
        let mut m = manifest(
            "  - name: alpha\n    domain: api.alpha.dev\n  - name: beta\n    domain: api.beta.dev\n",
        );
        m.providers[1].env_var = Some("ALPHA_API_KEY".to_string());

        let err = build_plan(
            &m,
            &secrets(&[("alpha", "a"), ("beta", "b")]),
            "sess-ff",
            9001,
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::RouteConflict { .. }), "{err}");
    }
}
