//! Host environment filtering and agent launch-command construction.

use std::collections::HashMap;

/// Host env vars allowed to cross into the VM. Everything else stays
/// outside: `AWS_ACCESS_KEY_ID`, `DATABASE_URL`, whatever the operator's
/// shell happens to hold.
pub const SAFE_ENV_ALLOWLIST: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "LANG", "LC_ALL", "LC_CTYPE", "TERM", "TZ",
];

/// Filter an environment down to the allowlist.
pub fn filter_host_env(
    vars: impl Iterator<Item = (String, String)>,
) -> HashMap<String, String> {
    vars.filter(|(key, _)| SAFE_ENV_ALLOWLIST.contains(&key.as_str()))
        .collect()
}

/// Escape a value for a single-quoted shell assignment.
pub fn shell_escape(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Build the agent launch command: inline env assignments (shell-escaped)
/// followed by `exec` of the manifest's run command.
///
/// Inline assignment instead of a wrapper script keeps the proxy env vars
/// off the filesystem, and `exec` keeps the process tree flat so signals
/// reach the agent directly.
pub fn build_run_command(
    agent_dir: &str,
    run_command: &str,
    agent_env: &HashMap<String, String>,
) -> String {
    if agent_env.is_empty() {
        return format!("cd {} && {}", agent_dir, run_command);
    }
    let mut pairs: Vec<(&String, &String)> = agent_env.iter().collect();
    pairs.sort();
    let assignments = pairs
        .iter()
        .map(|(key, value)| format!("{}={}", key, shell_escape(value)))
        .collect::<Vec<_>>()
        .join(" ");
    format!("cd {} && {} exec {}", agent_dir, assignments, run_command)
}
