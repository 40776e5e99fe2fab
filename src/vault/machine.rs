//! Machine-binding factors for the vault key.
//!
//! The vault key is derived from three factors (§ vault design): a stable
//! machine identifier, a per-install secret, and an optional passphrase.
//! This module produces the first two. The factor *kind* used for the
//! machine identifier is recorded in the vault header so a load on a host
//! where a different kind would be picked refuses instead of silently
//! deriving a wrong key.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::process::Command;

use secrecy::SecretString;

use crate::vault::VaultError;

/// Which machine-identifier source was used when the vault was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineFactor {
    /// macOS `IOPlatformUUID`.
    HardwareUuid,
    /// Linux `/etc/machine-id` (or the dbus copy).
    MachineId,
    /// Hostname plus first non-loopback MAC address. Weakest factor; only
    /// used when the platform sources are unavailable.
    HostnameMac,
}

impl MachineFactor {
    pub fn tag(self) -> u8 {
        match self {
            MachineFactor::HardwareUuid => 1,
            MachineFactor::MachineId => 2,
            MachineFactor::HostnameMac => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<MachineFactor> {
        match tag {
            1 => Some(MachineFactor::HardwareUuid),
            2 => Some(MachineFactor::MachineId),
            3 => Some(MachineFactor::HostnameMac),
            _ => None,
        }
    }
}

/// Resolve the machine identifier for this host.
///
/// Returns the factor kind alongside the value; the kind goes into the
/// vault header.
pub fn machine_identifier() -> Result<(MachineFactor, String), VaultError> {
    if cfg!(target_os = "macos")
        && let Some(uuid) = hardware_uuid()
    {
        return Ok((MachineFactor::HardwareUuid, uuid));
    }

    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(id) = fs::read_to_string(path) {
            let id = id.trim().to_string();
            if !id.is_empty() {
                return Ok((MachineFactor::MachineId, id));
            }
        }
    }

    let hostname = hostname().unwrap_or_else(|| "unknown-host".to_string());
    let mac = first_mac_address().unwrap_or_else(|| "00:00:00:00:00:00".to_string());
    Ok((MachineFactor::HostnameMac, format!("{}-{}", hostname, mac)))
}

/// Query `ioreg` for the platform UUID (macOS).
fn hardware_uuid() -> Option<String> {
    let output = Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8(output.stdout).ok()?;
    for line in stdout.lines() {
        if line.contains("IOPlatformUUID") {
            return line.split('"').rev().nth(1).map(String::from);
        }
    }
    None
}

fn hostname() -> Option<String> {
    if let Ok(name) = fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim().to_string();
        if !name.is_empty() {
            return Some(name);
        }
    }
    let output = Command::new("hostname").output().ok()?;
    let name = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!name.is_empty()).then_some(name)
}

/// First non-loopback interface MAC, via sysfs.
fn first_mac_address() -> Option<String> {
    let entries = fs::read_dir("/sys/class/net").ok()?;
    let mut names: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n != "lo")
        .collect();
    names.sort();
    for name in names {
        if let Ok(mac) = fs::read_to_string(format!("/sys/class/net/{}/address", name)) {
            let mac = mac.trim().to_string();
            if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                return Some(mac);
            }
        }
    }
    None
}

/// Keychain service and account names for the install secret on macOS.
const KEYCHAIN_SERVICE: &str = "primordial-vault";
const KEYCHAIN_ACCOUNT: &str = "install-secret";

/// File name of the install secret beside the vault on non-keychain OSes.
const SECRET_FILE_NAME: &str = "vault.secret";

/// Load (or create on first use) the per-install secret.
///
/// macOS: generic password in the login keychain via the `security` CLI.
/// A keychain that is present but refuses is a hard error; there is no
/// silent downgrade to the file factor.
///
/// Elsewhere: a `0600` file created with exclusive-create/no-follow
/// semantics in the vault directory, mode re-verified on every read.
pub fn install_secret(vault_dir: &Path) -> Result<SecretString, VaultError> {
    if cfg!(target_os = "macos") {
        return keychain_secret();
    }
    file_secret(vault_dir)
}

fn keychain_secret() -> Result<SecretString, VaultError> {
    let lookup = Command::new("security")
        .args([
            "find-generic-password",
            "-s",
            KEYCHAIN_SERVICE,
            "-a",
            KEYCHAIN_ACCOUNT,
            "-w",
        ])
        .output()
        .map_err(|_| VaultError::KeychainUnavailable)?;

    if lookup.status.success() {
        let secret = String::from_utf8(lookup.stdout)
            .map_err(|_| VaultError::KeychainUnavailable)?
            .trim()
            .to_string();
        if secret.is_empty() {
            return Err(VaultError::KeychainUnavailable);
        }
        return Ok(SecretString::from(secret));
    }

    // Not found: create one. Exit code 44 is errSecItemNotFound; any other
    // failure means the keychain refused and we abort.
    if lookup.status.code() != Some(44) {
        return Err(VaultError::KeychainUnavailable);
    }

    let secret = fresh_secret();
    let added = Command::new("security")
        .args([
            "add-generic-password",
            "-s",
            KEYCHAIN_SERVICE,
            "-a",
            KEYCHAIN_ACCOUNT,
            "-w",
            &secret,
        ])
        .output()
        .map_err(|_| VaultError::KeychainUnavailable)?;
    if !added.status.success() {
        return Err(VaultError::KeychainUnavailable);
    }
    Ok(SecretString::from(secret))
}

fn file_secret(vault_dir: &Path) -> Result<SecretString, VaultError> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::fs::PermissionsExt;

    let path = vault_dir.join(SECRET_FILE_NAME);

    match fs::symlink_metadata(&path) {
        Ok(meta) => {
            if !meta.is_file() {
                return Err(VaultError::PermissionTooOpen {
                    path: path.display().to_string(),
                });
            }
            let mode = meta.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                return Err(VaultError::PermissionTooOpen {
                    path: path.display().to_string(),
                });
            }
            let mut file = fs::OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NOFOLLOW)
                .open(&path)?;
            let mut secret = String::new();
            file.read_to_string(&mut secret)?;
            let secret = secret.trim().to_string();
            if secret.is_empty() {
                return Err(VaultError::Corrupt);
            }
            Ok(SecretString::from(secret))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let secret = fresh_secret();
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .custom_flags(libc::O_NOFOLLOW)
                .open(&path)?;
            file.write_all(secret.as_bytes())?;
            file.sync_all()?;
            Ok(SecretString::from(secret))
        }
        Err(err) => Err(err.into()),
    }
}

/// 32 bytes of fresh randomness, hex encoded.
fn fresh_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factor_tag_roundtrip() {
        for factor in [
            MachineFactor::HardwareUuid,
            MachineFactor::MachineId,
            MachineFactor::HostnameMac,
        ] {
            assert_eq!(MachineFactor::from_tag(factor.tag()), Some(factor));
        }
        assert_eq!(MachineFactor::from_tag(0), None);
        assert_eq!(MachineFactor::from_tag(9), None);
    }

    #[test]
    fn test_machine_identifier_stable() {
        let (factor_a, id_a) = machine_identifier().unwrap();
        let (factor_b, id_b) = machine_identifier().unwrap();
        assert_eq!(factor_a, factor_b);
        assert_eq!(id_a, id_b);
        assert!(!id_a.is_empty());
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_file_secret_created_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = install_secret(dir.path()).unwrap();
        let second = install_secret(dir.path()).unwrap();
        use secrecy::ExposeSecret;
        assert_eq!(first.expose_secret(), second.expose_secret());
        assert_eq!(first.expose_secret().len(), 64);
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_file_secret_rejects_open_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        install_secret(dir.path()).unwrap();

        let path = dir.path().join(SECRET_FILE_NAME);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let err = install_secret(dir.path()).unwrap_err();
        assert!(matches!(err, VaultError::PermissionTooOpen { .. }));
    }
}
