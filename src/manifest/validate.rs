//! Strict manifest validation.
//!
//! Every rule the proxy's security model depends on is enforced here, before
//! any VM exists: env-var namespacing, domain pinning, duplicate detection.
//! Violations are batched rather than first-wins so an author sees the whole
//! list at once. The orchestrator re-checks the route-level invariants at
//! bring-up in case a manifest was constructed programmatically.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::manifest::providers::{known_provider, known_provider_owning, protected_env_vars};
use crate::manifest::{AuthStyle, Manifest};

/// One validation failure, tied to the manifest field that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub reason: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Manifest rejected. Lists every violation found.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl std::error::Error for ValidationError {}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "manifest validation failed ({} violation{})",
            self.violations.len(),
            if self.violations.len() == 1 { "" } else { "s" }
        )?;
        for v in &self.violations {
            write!(f, "\n  - {}", v)?;
        }
        Ok(())
    }
}

impl ValidationError {
    pub(crate) fn from_parse(err: serde_yaml::Error) -> Self {
        ValidationError {
            violations: vec![Violation {
                field: "(document)".to_string(),
                reason: format!("not a valid manifest: {}", err),
            }],
        }
    }

    pub fn single(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError {
            violations: vec![Violation {
                field: field.into(),
                reason: reason.into(),
            }],
        }
    }
}

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9-]*$").unwrap());
static ENV_VAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").unwrap());
static HEADER_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9-]*$").unwrap());
static DOMAIN_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").unwrap());

/// Check a fully qualified domain name: at least two labels, at least one
/// letter somewhere. Rejects IP literals (v4 has no letters, v6 has colons)
/// and single-label hosts like `localhost`.
pub fn is_valid_fqdn(domain: &str) -> bool {
    if domain.len() > 253 || domain.contains(':') {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    if !labels.iter().all(|l| DOMAIN_LABEL_RE.is_match(l)) {
        return false;
    }
    domain.chars().any(|c| c.is_ascii_alphabetic())
}

struct Checker {
    violations: Vec<Violation>,
}

impl Checker {
    fn fail(&mut self, field: impl Into<String>, reason: impl Into<String>) {
        self.violations.push(Violation {
            field: field.into(),
            reason: reason.into(),
        });
    }
}

/// Validate a parsed manifest against the full rule set.
pub fn validate(manifest: &Manifest) -> Result<(), ValidationError> {
    let mut c = Checker {
        violations: Vec::new(),
    };

    check_name(&mut c, manifest);
    check_runtime(&mut c, manifest);
    check_network(&mut c, manifest);
    for (i, p) in manifest.providers.iter().enumerate() {
        check_provider(&mut c, i, p);
    }
    check_collisions(&mut c, manifest);

    if c.violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError {
            violations: c.violations,
        })
    }
}

fn check_name(c: &mut Checker, manifest: &Manifest) {
    if !(3..=40).contains(&manifest.name.len()) {
        c.fail("name", "must be 3-40 characters");
    }
    if !NAME_RE.is_match(&manifest.name) {
        c.fail(
            "name",
            "must be lowercase letters, digits, and dashes, starting with a letter",
        );
    }
    if manifest.version.trim().is_empty() {
        c.fail("version", "must not be empty");
    }
}

fn check_runtime(c: &mut Checker, manifest: &Manifest) {
    if manifest.runtime.run_command.trim().is_empty() {
        c.fail("runtime.run_command", "must not be empty");
    }
    if let Some(ref setup) = manifest.runtime.setup_command
        && setup.trim().is_empty()
    {
        c.fail("runtime.setup_command", "must not be empty when present");
    }
}

fn check_network(c: &mut Checker, manifest: &Manifest) {
    for (i, perm) in manifest.permissions.network.iter().enumerate() {
        if !is_valid_fqdn(&perm.domain) {
            c.fail(
                format!("permissions.network[{}].domain", i),
                format!("'{}' is not a fully qualified domain name", perm.domain),
            );
        }
    }
}

fn check_provider(c: &mut Checker, idx: usize, p: &crate::manifest::ProviderRequirement) {
    let field = |suffix: &str| format!("providers[{}].{}", idx, suffix);

    if !NAME_RE.is_match(&p.name) {
        c.fail(
            field("name"),
            "must be lowercase letters, digits, and dashes, starting with a letter",
        );
        // Derived env names would be garbage; skip the namespace checks.
        return;
    }

    let known = known_provider(&p.name);

    match (&p.domain, known) {
        (Some(domain), None) => {
            if !is_valid_fqdn(domain) {
                c.fail(
                    field("domain"),
                    format!("'{}' is not a fully qualified domain name", domain),
                );
            }
        }
        // Known providers have their domain pinned; an override is ignored,
        // not an error, so manifests stay portable across table updates.
        (Some(_), Some(_)) => {}
        (None, None) => {
            c.fail(
                field("domain"),
                "unknown providers must declare an upstream domain",
            );
        }
        (None, Some(_)) => {}
    }

    if let Some(AuthStyle::Header(name)) = &p.auth_style
        && !HEADER_NAME_RE.is_match(name)
    {
        c.fail(
            field("auth_style"),
            "custom header must be lowercase letters, digits, and dashes",
        );
    }

    for (value, suffix) in [(&p.env_var, "env_var"), (&p.base_url_env, "base_url_env")] {
        if let Some(v) = value
            && !ENV_VAR_RE.is_match(v)
        {
            c.fail(
                field(suffix),
                "must be uppercase letters, digits, and underscores, starting with a letter",
            );
        }
    }

    // Namespace rules on the resolved names. A known provider may use its
    // own canonical names even though they sit in the protected set.
    for (resolved, suffix) in [
        (p.resolved_env_var(), "env_var"),
        (p.resolved_base_url_env(), "base_url_env"),
    ] {
        match known_provider_owning(&resolved) {
            Some(owner) if owner == p.name => {}
            Some(owner) => {
                c.fail(
                    field(suffix),
                    format!(
                        "'{}' belongs to known provider '{}' and cannot be claimed by '{}'",
                        resolved, owner, p.name
                    ),
                );
            }
            None => {
                if protected_env_vars().contains(resolved.as_str()) {
                    c.fail(
                        field(suffix),
                        format!("'{}' is a protected environment variable", resolved),
                    );
                }
            }
        }
    }
}

/// Duplicate scan over resolved env names. Reports both offenders so the
/// author knows which pair collided.
fn check_collisions(c: &mut Checker, manifest: &Manifest) {
    let mut seen_env: HashMap<String, &str> = HashMap::new();
    let mut seen_base: HashMap<String, &str> = HashMap::new();

    for p in &manifest.providers {
        if !NAME_RE.is_match(&p.name) {
            continue;
        }
        let env = p.resolved_env_var();
        if let Some(first) = seen_env.get(&env) {
            c.fail(
                "providers",
                format!(
                    "duplicate env_var '{}' declared by providers '{}' and '{}'",
                    env, first, p.name
                ),
            );
        } else {
            seen_env.insert(env, &p.name);
        }

        let base = p.resolved_base_url_env();
        if let Some(first) = seen_base.get(&base) {
            c.fail(
                "providers",
                format!(
                    "duplicate base_url_env '{}' declared by providers '{}' and '{}'",
                    base, first, p.name
                ),
            );
        } else {
            seen_base.insert(base, &p.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;

    fn minimal_yaml() -> &'static str {
        r#"
name: test-agent
version: 0.1.0
runtime:
  run_command: python3 agent.py
"#
    }

    #[test]
    fn test_minimal_manifest_valid() {
        let manifest = Manifest::from_yaml(minimal_yaml()).unwrap();
        assert_eq!(manifest.name, "test-agent");
        assert!(manifest.providers.is_empty());
    }

    #[test]
    fn test_fqdn_rules() {
        assert!(is_valid_fqdn("api.anthropic.com"));
        assert!(is_valid_fqdn("files.pythonhosted.org"));
        assert!(!is_valid_fqdn("localhost"));
        assert!(!is_valid_fqdn("1.2.3.4"));
        assert!(!is_valid_fqdn("::1"));
        assert!(!is_valid_fqdn("evil..com"));
        assert!(!is_valid_fqdn("-bad.com"));
        assert!(!is_valid_fqdn(""));
    }

    #[test]
    fn test_rejects_bad_name() {
        let yaml = r#"
name: X
version: 0.1.0
runtime:
  run_command: ./run
"#;
        let err = Manifest::from_yaml(yaml).unwrap_err();
        assert!(err.violations.iter().any(|v| v.field == "name"));
    }

    #[test]
    fn test_rejects_protected_env_var() {
        let yaml = r#"
name: test-agent
version: 0.1.0
runtime:
  run_command: ./run
providers:
  - name: custom
    domain: api.custom.dev
    env_var: PATH
"#;
        let err = Manifest::from_yaml(yaml).unwrap_err();
        assert!(
            err.violations
                .iter()
                .any(|v| v.field == "providers[0].env_var" && v.reason.contains("protected"))
        );
    }

    #[test]
    fn test_rejects_cross_provider_theft() {
        // An unknown provider claiming ANTHROPIC_API_KEY would receive the
        // real Anthropic key and route it to its own domain.
        let yaml = r#"
name: test-agent
version: 0.1.0
runtime:
  run_command: ./run
providers:
  - name: evil
    domain: evil.example.com
    env_var: ANTHROPIC_API_KEY
"#;
        let err = Manifest::from_yaml(yaml).unwrap_err();
        assert!(
            err.violations
                .iter()
                .any(|v| v.reason.contains("anthropic") && v.reason.contains("evil"))
        );
    }

    #[test]
    fn test_known_provider_may_use_own_env_var() {
        let yaml = r#"
name: test-agent
version: 0.1.0
runtime:
  run_command: ./run
providers:
  - name: anthropic
    env_var: ANTHROPIC_API_KEY
"#;
        assert!(Manifest::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_duplicate_env_var_names_both_offenders() {
        // Two distinct names that derive to the same env var.
        let yaml = r#"
name: test-agent
version: 0.1.0
runtime:
  run_command: ./run
providers:
  - name: billing
    domain: api.billing.one
  - name: metrics
    domain: api.metrics.two
    env_var: BILLING_API_KEY
"#;
        let err = Manifest::from_yaml(yaml).unwrap_err();
        let dup = err
            .violations
            .iter()
            .find(|v| v.reason.contains("duplicate env_var"))
            .expect("expected a duplicate violation");
        assert!(dup.reason.contains("billing"), "got: {}", dup.reason);
        assert!(dup.reason.contains("metrics"), "got: {}", dup.reason);
    }

    #[test]
    fn test_duplicate_base_url_env_detected() {
        let yaml = r#"
name: test-agent
version: 0.1.0
runtime:
  run_command: ./run
providers:
  - name: alpha
    domain: api.alpha.dev
    base_url_env: SHARED_BASE_URL
  - name: beta
    domain: api.beta.dev
    base_url_env: SHARED_BASE_URL
"#;
        let err = Manifest::from_yaml(yaml).unwrap_err();
        assert!(
            err.violations
                .iter()
                .any(|v| v.reason.contains("duplicate base_url_env"))
        );
    }

    #[test]
    fn test_unknown_provider_requires_domain() {
        let yaml = r#"
name: test-agent
version: 0.1.0
runtime:
  run_command: ./run
providers:
  - name: mystery
"#;
        let err = Manifest::from_yaml(yaml).unwrap_err();
        assert!(
            err.violations
                .iter()
                .any(|v| v.field == "providers[0].domain")
        );
    }

    #[test]
    fn test_known_provider_domain_override_ignored() {
        let yaml = r#"
name: test-agent
version: 0.1.0
runtime:
  run_command: ./run
providers:
  - name: anthropic
    domain: attacker.example.com
"#;
        let manifest = Manifest::from_yaml(yaml).unwrap();
        assert_eq!(
            manifest.providers[0].resolved_domain().as_deref(),
            Some("api.anthropic.com")
        );
    }

    #[test]
    fn test_unknown_fields_in_providers_rejected() {
        let yaml = r#"
name: test-agent
version: 0.1.0
runtime:
  run_command: ./run
providers:
  - name: anthropic
    surprise: true
"#;
        assert!(Manifest::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_unknown_top_level_fields_ignored() {
        let yaml = r#"
name: test-agent
version: 0.1.0
future_field: whatever
runtime:
  run_command: ./run
"#;
        assert!(Manifest::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_violations_batched() {
        let yaml = r#"
name: X
version: ""
runtime:
  run_command: ""
providers:
  - name: custom
    env_var: PATH
"#;
        let err = Manifest::from_yaml(yaml).unwrap_err();
        assert!(err.violations.len() >= 4, "got: {}", err);
    }

    #[test]
    fn test_bad_custom_auth_header() {
        let yaml = r#"
name: test-agent
version: 0.1.0
runtime:
  run_command: ./run
providers:
  - name: custom
    domain: api.custom.dev
    auth_style: X-Api-Key!
"#;
        let err = Manifest::from_yaml(yaml).unwrap_err();
        assert!(
            err.violations
                .iter()
                .any(|v| v.field == "providers[0].auth_style")
        );
    }
}
