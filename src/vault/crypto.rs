//! Cryptographic operations for the credential vault.
//!
//! Uses AES-256-GCM for authenticated encryption. The key is derived once
//! per vault with PBKDF2-HMAC-SHA256 from the machine-bound key material:
//!
//! ```text
//! machine_id \x1f install_secret \x1f passphrase ──► PBKDF2 ──► vault key
//!                                    per-vault salt ──┘
//! ```
//!
//! The KDF runs at 600k iterations and can take on the order of a second;
//! async callers must move derivation onto a blocking worker.

use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, AeadCore, OsRng},
};
use pbkdf2::pbkdf2_hmac;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::vault::VaultError;

/// Size of the AES-256 key in bytes.
const KEY_SIZE: usize = 32;

/// Size of the GCM nonce in bytes.
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag.
const TAG_SIZE: usize = 16;

/// PBKDF2-HMAC-SHA256 iteration count for new vaults.
pub const KDF_ITERATIONS: u32 = 600_000;

/// Separator between the key-material factors. Not a valid byte in any of
/// the factors themselves, so concatenation is unambiguous.
const FACTOR_SEPARATOR: u8 = 0x1f;

/// Vault cipher holding the derived key.
///
/// The key only exists here and is zeroed when the struct drops.
pub struct VaultCrypto {
    key: secrecy::SecretBox<[u8; KEY_SIZE]>,
}

impl VaultCrypto {
    /// Derive the vault key from the three key-material factors and the
    /// per-vault salt. CPU-bound; seconds at the default iteration count.
    pub fn derive(
        machine_id: &str,
        install_secret: &SecretString,
        passphrase: Option<&SecretString>,
        salt: &[u8],
        iterations: u32,
    ) -> VaultCrypto {
        let mut material = Vec::with_capacity(64);
        material.extend_from_slice(machine_id.as_bytes());
        material.push(FACTOR_SEPARATOR);
        material.extend_from_slice(install_secret.expose_secret().as_bytes());
        material.push(FACTOR_SEPARATOR);
        if let Some(pass) = passphrase {
            material.extend_from_slice(pass.expose_secret().as_bytes());
        }

        let mut key = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha256>(&material, salt, iterations, &mut key);

        VaultCrypto {
            key: secrecy::SecretBox::new(Box::new(key)),
        }
    }

    /// Generate a fresh random salt for a new vault.
    pub fn generate_salt() -> [u8; 16] {
        let mut salt = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut salt);
        salt
    }

    /// Encrypt a serialized entry table. Returns `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(self.key.expose_secret())
            .map_err(|_| VaultError::Corrupt)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| VaultError::Corrupt)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt `nonce || ciphertext || tag`. Authentication failure means
    /// either corruption or a different key (wrong machine / passphrase);
    /// the caller distinguishes via the header's machine-factor tag.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, VaultError> {
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(VaultError::Corrupt);
        }
        let cipher = Aes256Gcm::new_from_slice(self.key.expose_secret())
            .map_err(|_| VaultError::Corrupt)?;
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::Corrupt)
    }
}

impl std::fmt::Debug for VaultCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultCrypto")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
