//! Encrypted, machine-bound API key vault.
//!
//! Entries are `(provider, key_id) -> secret`, encrypted at rest with a key
//! derived from this machine's identity (see [`machine`]) plus a per-install
//! secret and an optional passphrase. The on-disk file is opaque: a short
//! fixed header followed by AES-256-GCM ciphertext of the serialized entry
//! table.
//!
//! File safety rules, verified on every read and failing closed:
//! - vault file mode `0600`, parent directory `0700`;
//! - writes are atomic (exclusive-create temp in the same directory, fsync,
//!   rename over the target);
//! - a header whose machine-factor kind differs from the current host's is
//!   refused before any decryption is attempted.

pub mod crypto;
pub mod machine;

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::manifest::Manifest;
use crate::vault::crypto::VaultCrypto;
use crate::vault::machine::MachineFactor;

/// Magic bytes at the start of every vault file.
const MAGIC: &[u8; 4] = b"PMVT";

/// Current on-disk format version.
const FORMAT_VERSION: u8 = 1;

/// Header length: magic + version + factor tag + iterations + salt.
const HEADER_LEN: usize = 4 + 1 + 1 + 4 + 16;

/// Env var for the optional third key factor.
pub const PASSPHRASE_ENV: &str = "PRIMORDIAL_VAULT_PASSPHRASE";

/// The `key_id` used when a caller does not name one.
pub const DEFAULT_KEY_ID: &str = "default";

/// Errors from vault operations. Messages are fixed strings plus the
/// offending provider/key_id; never secret bytes or ciphertext.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("no key stored for provider '{provider}' (key id '{key_id}')")]
    MissingKey { provider: String, key_id: String },

    #[error("vault file is corrupt or was encrypted with a different key")]
    Corrupt,

    #[error("vault was created on a different machine")]
    WrongMachine,

    #[error("permissions too open on '{path}'")]
    PermissionTooOpen { path: String },

    #[error("OS keychain is present but refused the vault install secret")]
    KeychainUnavailable,

    #[error("vault I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One stored credential. Only ever serialized inside the ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultEntry {
    provider: String,
    key_id: String,
    secret: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    last_used: Option<DateTime<Utc>>,
}

/// Entry metadata returned by [`Vault::list`]. Carries no secret material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub provider: String,
    pub key_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct Header {
    factor: MachineFactor,
    iterations: u32,
    salt: [u8; 16],
}

impl Header {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..4].copy_from_slice(MAGIC);
        buf[4] = FORMAT_VERSION;
        buf[5] = self.factor.tag();
        buf[6..10].copy_from_slice(&self.iterations.to_be_bytes());
        buf[10..].copy_from_slice(&self.salt);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Header, VaultError> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC || bytes[4] != FORMAT_VERSION {
            return Err(VaultError::Corrupt);
        }
        let factor = MachineFactor::from_tag(bytes[5]).ok_or(VaultError::Corrupt)?;
        let iterations = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        if iterations == 0 {
            return Err(VaultError::Corrupt);
        }
        let mut salt = [0u8; 16];
        salt.copy_from_slice(&bytes[10..HEADER_LEN]);
        Ok(Header {
            factor,
            iterations,
            salt,
        })
    }
}

/// The default vault location under the platform data directory.
pub fn default_vault_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("primordial")
        .join("vault.bin")
}

/// Encrypted key-value store of API keys, bound to this machine.
///
/// Synchronous and single-caller: concurrent writers must serialize
/// externally. Async code should wrap calls in `spawn_blocking`; the KDF
/// alone can take seconds.
pub struct Vault {
    path: PathBuf,
    header: Header,
    crypto: VaultCrypto,
    entries: Vec<VaultEntry>,
}

impl Vault {
    /// Open the vault at `path`, creating an empty one on first use.
    ///
    /// The passphrase factor is read from [`PASSPHRASE_ENV`] when set.
    pub fn open(path: impl Into<PathBuf>) -> Result<Vault, VaultError> {
        let passphrase = std::env::var(PASSPHRASE_ENV).ok().map(SecretString::from);
        Self::open_with_passphrase(path, passphrase)
    }

    pub fn open_with_passphrase(
        path: impl Into<PathBuf>,
        passphrase: Option<SecretString>,
    ) -> Result<Vault, VaultError> {
        Self::open_with_options(path, passphrase, crypto::KDF_ITERATIONS)
    }

    /// Open with an explicit KDF iteration count for newly created vaults.
    ///
    /// Existing vaults always use the count recorded in their header. Counts
    /// below [`crypto::KDF_ITERATIONS`] are for tests only.
    pub fn open_with_options(
        path: impl Into<PathBuf>,
        passphrase: Option<SecretString>,
        new_vault_iterations: u32,
    ) -> Result<Vault, VaultError> {
        let path = path.into();
        let dir = parent_dir(&path)?;
        ensure_private_dir(&dir)?;

        let (current_factor, machine_id) = machine::machine_identifier()?;
        let install = machine::install_secret(&dir)?;

        if path.exists() {
            verify_file_mode(&path)?;
            let raw = fs::read(&path)?;
            let header = Header::decode(&raw)?;
            if header.factor != current_factor {
                return Err(VaultError::WrongMachine);
            }
            let crypto = VaultCrypto::derive(
                &machine_id,
                &install,
                passphrase.as_ref(),
                &header.salt,
                header.iterations,
            );
            let plaintext = crypto.decrypt(&raw[HEADER_LEN..])?;
            let entries: Vec<VaultEntry> =
                serde_json::from_slice(&plaintext).map_err(|_| VaultError::Corrupt)?;
            Ok(Vault {
                path,
                header,
                crypto,
                entries,
            })
        } else {
            let header = Header {
                factor: current_factor,
                iterations: new_vault_iterations.max(1),
                salt: VaultCrypto::generate_salt(),
            };
            let crypto = VaultCrypto::derive(
                &machine_id,
                &install,
                passphrase.as_ref(),
                &header.salt,
                header.iterations,
            );
            let vault = Vault {
                path,
                header,
                crypto,
                entries: Vec::new(),
            };
            vault.persist()?;
            Ok(vault)
        }
    }

    /// Store or replace a key. Atomic on disk; last write wins.
    pub fn put(
        &mut self,
        provider: &str,
        key_id: Option<&str>,
        secret: SecretString,
    ) -> Result<(), VaultError> {
        let key_id = key_id.unwrap_or(DEFAULT_KEY_ID);
        self.entries
            .retain(|e| !(e.provider == provider && e.key_id == key_id));
        self.entries.push(VaultEntry {
            provider: provider.to_string(),
            key_id: key_id.to_string(),
            secret: secret.expose_secret().to_string(),
            created_at: Utc::now(),
            last_used: None,
        });
        self.persist()
    }

    /// Fetch a key. Updates the entry's `last_used` stamp (best effort:
    /// a failed persist does not fail the lookup).
    pub fn get(&mut self, provider: &str, key_id: Option<&str>) -> Result<SecretString, VaultError> {
        let key_id = key_id.unwrap_or(DEFAULT_KEY_ID);
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.provider == provider && e.key_id == key_id)
            .ok_or_else(|| VaultError::MissingKey {
                provider: provider.to_string(),
                key_id: key_id.to_string(),
            })?;
        entry.last_used = Some(Utc::now());
        let secret = SecretString::from(entry.secret.clone());
        if let Err(err) = self.persist() {
            tracing::warn!(provider, "failed to record vault key use: {err}");
        }
        Ok(secret)
    }

    /// List entry metadata. Never reveals secrets.
    pub fn list(&self) -> Vec<EntryInfo> {
        self.entries
            .iter()
            .map(|e| EntryInfo {
                provider: e.provider.clone(),
                key_id: e.key_id.clone(),
                created_at: e.created_at,
                last_used: e.last_used,
            })
            .collect()
    }

    /// Remove a key. Returns whether an entry was removed.
    pub fn remove(&mut self, provider: &str, key_id: Option<&str>) -> Result<bool, VaultError> {
        let key_id = key_id.unwrap_or(DEFAULT_KEY_ID);
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.provider == provider && e.key_id == key_id));
        if self.entries.len() < before {
            self.persist()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Resolve the secrets for exactly the providers a manifest declares.
    ///
    /// Providers not declared in the manifest are never returned, whatever
    /// the vault holds. A declared, required provider with no entry fails
    /// with [`VaultError::MissingKey`]; optional providers are skipped.
    pub fn resolve_for(
        &mut self,
        manifest: &Manifest,
    ) -> Result<HashMap<String, SecretString>, VaultError> {
        let mut resolved = HashMap::new();
        for req in &manifest.providers {
            match self.get(&req.name, None) {
                Ok(secret) => {
                    resolved.insert(req.name.clone(), secret);
                }
                Err(VaultError::MissingKey { .. }) if !req.required => {
                    tracing::debug!(provider = %req.name, "optional provider has no key; skipping");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(resolved)
    }

    /// Serialize, encrypt, and atomically replace the on-disk file.
    fn persist(&self) -> Result<(), VaultError> {
        let plaintext = serde_json::to_vec(&self.entries).map_err(|_| VaultError::Corrupt)?;
        let ciphertext = self.crypto.encrypt(&plaintext)?;

        let mut blob = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        blob.extend_from_slice(&self.header.encode());
        blob.extend_from_slice(&ciphertext);

        atomic_write(&self.path, &blob)
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .finish()
    }
}

fn parent_dir(path: &Path) -> Result<PathBuf, VaultError> {
    path.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| VaultError::PermissionTooOpen {
            path: path.display().to_string(),
        })
}

/// Create the vault directory at `0700` if missing, and refuse wider modes.
fn ensure_private_dir(dir: &Path) -> Result<(), VaultError> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    if !dir.exists() {
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    }
    let meta = fs::metadata(dir)?;
    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(VaultError::PermissionTooOpen {
            path: dir.display().to_string(),
        });
    }
    Ok(())
}

/// Refuse vault files wider than `0600` or that are not regular files.
fn verify_file_mode(path: &Path) -> Result<(), VaultError> {
    use std::os::unix::fs::PermissionsExt;

    let meta = fs::symlink_metadata(path)?;
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
    Ok(())
}

/// Write via an exclusive-create `0600` temp file in the same directory,
/// fsync, then rename over the target. Readers see the old file or the new
/// one, never a truncated intermediate.
fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), VaultError> {
    use std::os::unix::fs::OpenOptionsExt;

    let dir = parent_dir(path)?;
    let mut nonce = [0u8; 8];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);
    let tmp = dir.join(format!(".vault.tmp-{}", hex::encode(nonce)));

    let result = (|| -> Result<(), VaultError> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        if let Ok(dir_handle) = fs::File::open(&dir) {
            let _ = dir_handle.sync_all();
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use secrecy::{ExposeSecret, SecretString};

    use super::*;
    use crate::manifest::Manifest;

    fn temp_vault() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store").join("vault.bin");
        (dir, path)
    }

    // Low iteration count so the suite stays fast; the production constant
    // is exercised by the default-path open.
    fn open_fast(path: &Path) -> Result<Vault, VaultError> {
        Vault::open_with_options(path, None, 1_000)
    }

    fn manifest_with_providers(yaml_providers: &str) -> Manifest {
        let yaml = format!(
            "name: test-agent\nversion: 0.1.0\nruntime:\n  run_command: ./run\nproviders:\n{}",
            yaml_providers
        );
        Manifest::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, path) = temp_vault();
        let mut vault = open_fast(&path).unwrap();
        vault
            .put("anthropic", None, SecretString::from("sk-REAL".to_string()))
            .unwrap();

        let secret = vault.get("anthropic", None).unwrap();
        assert_eq!(secret.expose_secret(), "sk-REAL");

        // Reopen from disk: read(write(x)) == x on the same machine.
        drop(vault);
        let mut reopened = open_fast(&path).unwrap();
        let secret = reopened.get("anthropic", None).unwrap();
        assert_eq!(secret.expose_secret(), "sk-REAL");
    }

    #[test]
    fn test_put_is_idempotent_by_key() {
        let (_dir, path) = temp_vault();
        let mut vault = open_fast(&path).unwrap();
        vault
            .put("openai", None, SecretString::from("first".to_string()))
            .unwrap();
        vault
            .put("openai", None, SecretString::from("second".to_string()))
            .unwrap();

        assert_eq!(vault.list().len(), 1);
        assert_eq!(vault.get("openai", None).unwrap().expose_secret(), "second");
    }

    #[test]
    fn test_missing_key() {
        let (_dir, path) = temp_vault();
        let mut vault = open_fast(&path).unwrap();
        let err = vault.get("nowhere", None).unwrap_err();
        assert!(matches!(err, VaultError::MissingKey { .. }));
        let msg = err.to_string();
        assert!(msg.contains("nowhere"));
    }

    #[test]
    fn test_remove() {
        let (_dir, path) = temp_vault();
        let mut vault = open_fast(&path).unwrap();
        vault
            .put("groq", None, SecretString::from("gk".to_string()))
            .unwrap();
        assert!(vault.remove("groq", None).unwrap());
        assert!(!vault.remove("groq", None).unwrap());
        assert!(vault.get("groq", None).is_err());
    }

    #[test]
    fn test_list_reveals_no_secrets() {
        let (_dir, path) = temp_vault();
        let mut vault = open_fast(&path).unwrap();
        vault
            .put("mistral", Some("work"), SecretString::from("mk-secret".to_string()))
            .unwrap();

        let entries = vault.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].provider, "mistral");
        assert_eq!(entries[0].key_id, "work");
        let debug = format!("{:?}", entries);
        assert!(!debug.contains("mk-secret"));
    }

    #[test]
    fn test_resolve_for_returns_only_declared_providers() {
        let (_dir, path) = temp_vault();
        let mut vault = open_fast(&path).unwrap();
        vault
            .put("anthropic", None, SecretString::from("sk-a".to_string()))
            .unwrap();
        vault
            .put("openai", None, SecretString::from("sk-o".to_string()))
            .unwrap();

        let manifest = manifest_with_providers("  - name: anthropic\n");
        let resolved = vault.resolve_for(&manifest).unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved.contains_key("anthropic"));
        assert!(!resolved.contains_key("openai"));
    }

    #[test]
    fn test_resolve_for_missing_required() {
        let (_dir, path) = temp_vault();
        let mut vault = open_fast(&path).unwrap();

        let manifest = manifest_with_providers("  - name: anthropic\n");
        let err = vault.resolve_for(&manifest).unwrap_err();
        assert!(matches!(err, VaultError::MissingKey { .. }));
    }

    #[test]
    fn test_resolve_for_optional_skipped() {
        let (_dir, path) = temp_vault();
        let mut vault = open_fast(&path).unwrap();

        let manifest = manifest_with_providers("  - name: anthropic\n    required: false\n");
        let resolved = vault.resolve_for(&manifest).unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn test_wrong_passphrase_fails_closed() {
        let (_dir, path) = temp_vault();
        let mut vault = Vault::open_with_options(
            &path,
            Some(SecretString::from("correct horse".to_string())),
            1_000,
        )
        .unwrap();
        vault
            .put("anthropic", None, SecretString::from("sk".to_string()))
            .unwrap();
        drop(vault);

        let err = Vault::open_with_options(
            &path,
            Some(SecretString::from("battery staple".to_string())),
            1_000,
        )
        .unwrap_err();
        assert!(matches!(err, VaultError::Corrupt));
    }

    #[test]
    fn test_rejects_open_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, path) = temp_vault();
        open_fast(&path).unwrap();

        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        let err = open_fast(&path).unwrap_err();
        assert!(matches!(err, VaultError::PermissionTooOpen { .. }));
    }

    #[test]
    fn test_rejects_open_parent_mode() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, path) = temp_vault();
        open_fast(&path).unwrap();

        let parent = path.parent().unwrap();
        fs::set_permissions(parent, fs::Permissions::from_mode(0o755)).unwrap();
        let err = open_fast(&path).unwrap_err();
        assert!(matches!(err, VaultError::PermissionTooOpen { .. }));
    }

    #[test]
    fn test_rejects_wrong_machine_factor() {
        let (_dir, path) = temp_vault();
        open_fast(&path).unwrap();

        // Flip the recorded factor tag to a kind this host will not pick.
        let mut raw = fs::read(&path).unwrap();
        let (current, _) = machine::machine_identifier().unwrap();
        raw[5] = if current == MachineFactor::HardwareUuid {
            MachineFactor::MachineId.tag()
        } else {
            MachineFactor::HardwareUuid.tag()
        };
        fs::write(&path, &raw).unwrap();
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

        let err = open_fast(&path).unwrap_err();
        assert!(matches!(err, VaultError::WrongMachine));
    }

    #[test]
    fn test_rejects_truncated_file() {
        let (_dir, path) = temp_vault();
        open_fast(&path).unwrap();

        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..10]).unwrap();
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

        let err = open_fast(&path).unwrap_err();
        assert!(matches!(err, VaultError::Corrupt));
    }

    #[test]
    fn test_error_messages_are_fixed() {
        assert_eq!(
            VaultError::Corrupt.to_string(),
            "vault file is corrupt or was encrypted with a different key"
        );
        assert_eq!(
            VaultError::WrongMachine.to_string(),
            "vault was created on a different machine"
        );
    }
}
