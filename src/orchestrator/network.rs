//! Egress policy derivation from a manifest.

use crate::manifest::{Manifest, known_provider};
use crate::sandbox::EgressPolicy;

/// Package registries auto-allowed when the agent declares a setup command,
/// so `pip install` / `npm ci` work inside the egress firewall.
pub const PACKAGE_REGISTRY_DOMAINS: &[&str] = &[
    // Python
    "pypi.org",
    "files.pythonhosted.org",
    // Node
    "registry.npmjs.org",
    "registry.yarnpkg.com",
    "nodejs.org",
];

/// Build the VM egress policy.
///
/// Three modes:
/// - `network_unrestricted: true` -> no filtering (consent handled upstream);
/// - any allowed domains -> deny all except the union of declared domains,
///   package registries (only with a setup command), and the *pinned*
///   domains of declared known providers;
/// - nothing -> deny-all.
///
/// Unknown providers get no auto-allow: their declared domain must appear
/// in `permissions.network` explicitly, so a manifest cannot open an
/// arbitrary egress hole just by inventing a provider.
pub fn egress_policy(manifest: &Manifest) -> EgressPolicy {
    if manifest.permissions.network_unrestricted {
        return EgressPolicy::Unrestricted;
    }

    let mut allowed: Vec<String> = Vec::new();
    let mut push = |domain: &str| {
        if !allowed.iter().any(|d| d == domain) {
            allowed.push(domain.to_string());
        }
    };

    for perm in &manifest.permissions.network {
        push(&perm.domain);
    }

    if manifest.runtime.setup_command.is_some() {
        for domain in PACKAGE_REGISTRY_DOMAINS {
            push(domain);
        }
    }

    for req in &manifest.providers {
        if let Some(known) = known_provider(&req.name) {
            push(known.domain);
        }
    }

    if allowed.is_empty() {
        EgressPolicy::DenyAll
    } else {
        EgressPolicy::Allowlist(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;

    fn manifest(yaml: &str) -> Manifest {
        Manifest::from_yaml(yaml).unwrap()
    }

    #[test]
    fn test_no_network_is_deny_all() {
        let m = manifest("name: test-agent\nversion: '1'\nruntime:\n  run_command: ./run\n");
        assert_eq!(egress_policy(&m), EgressPolicy::DenyAll);
    }

    #[test]
    fn test_unrestricted_wins() {
        let m = manifest(
            "name: test-agent\nversion: '1'\nruntime:\n  run_command: ./run\npermissions:\n  network_unrestricted: true\n  network:\n    - domain: api.example.com\n      reason: data\n",
        );
        assert_eq!(egress_policy(&m), EgressPolicy::Unrestricted);
    }

    #[test]
    fn test_declared_domains_allowlisted() {
        let m = manifest(
            "name: test-agent\nversion: '1'\nruntime:\n  run_command: ./run\npermissions:\n  network:\n    - domain: api.example.com\n      reason: data\n",
        );
        assert_eq!(
            egress_policy(&m),
            EgressPolicy::Allowlist(vec!["api.example.com".to_string()])
        );
    }

    #[test]
    fn test_registries_only_with_setup_command() {
        let without = manifest(
            "name: test-agent\nversion: '1'\nruntime:\n  run_command: ./run\npermissions:\n  network:\n    - domain: api.example.com\n      reason: data\n",
        );
        let EgressPolicy::Allowlist(domains) = egress_policy(&without) else {
            panic!("expected allowlist");
        };
        assert!(!domains.iter().any(|d| d == "pypi.org"));

        let with = manifest(
            "name: test-agent\nversion: '1'\nruntime:\n  run_command: ./run\n  setup_command: pip install -r requirements.txt\npermissions:\n  network:\n    - domain: api.example.com\n      reason: data\n",
        );
        let EgressPolicy::Allowlist(domains) = egress_policy(&with) else {
            panic!("expected allowlist");
        };
        assert!(domains.iter().any(|d| d == "pypi.org"));
        assert!(domains.iter().any(|d| d == "registry.npmjs.org"));
    }

    #[test]
    fn test_known_provider_domain_auto_allowed() {
        let m = manifest(
            "name: test-agent\nversion: '1'\nruntime:\n  run_command: ./run\nproviders:\n  - name: anthropic\n",
        );
        let EgressPolicy::Allowlist(domains) = egress_policy(&m) else {
            panic!("expected allowlist");
        };
        assert_eq!(domains, vec!["api.anthropic.com".to_string()]);
    }

    #[test]
    fn test_unknown_provider_domain_not_auto_allowed() {
        let m = manifest(
            "name: test-agent\nversion: '1'\nruntime:\n  run_command: ./run\nproviders:\n  - name: custom\n    domain: api.custom.dev\n",
        );
        // Declared providers alone do not open egress for unknown domains.
        assert_eq!(egress_policy(&m), EgressPolicy::DenyAll);
    }

    #[test]
    fn test_no_duplicate_domains() {
        let m = manifest(
            "name: test-agent\nversion: '1'\nruntime:\n  run_command: ./run\npermissions:\n  network:\n    - domain: api.anthropic.com\n      reason: direct\nproviders:\n  - name: anthropic\n",
        );
        let EgressPolicy::Allowlist(domains) = egress_policy(&m) else {
            panic!("expected allowlist");
        };
        assert_eq!(domains.len(), 1);
    }
}
