//! Privacy guard: pseudonymization, reversible PII encryption and key erasure.
//!
//! Wallet addresses are replaced by salted SHA-256 pseudonyms; the original
//! values travel only inside AES-256-GCM ciphertext. Erasing the key file makes
//! every ciphertext produced under it permanently unrecoverable, which is how a
//! right-to-erasure request is served without touching stored records.
//!
//! Key state sits behind a single-writer/multi-reader lock: encrypt and decrypt
//! share read access while generation, erasure and regeneration take the write
//! side.

use crate::address::canonical_address;
use crate::config::PrivacyConfig;
use crate::schemas::{AuditEvent, PrivacyEnvelope, UNKNOWN_PSEUDONYM};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Lower bound on the random overwrite applied before deleting a key file
const MIN_OVERWRITE_LEN: usize = 256;

#[derive(Error, Debug)]
pub enum PrivacyError {
    /// Wrong key, erased key, tampered or malformed ciphertext.
    #[error("Ciphertext failed authentication")]
    Authentication,

    #[error("Encryption key has been erased; regenerate a key before encrypting")]
    KeyErased,

    #[error("Invalid key material at {path}: {reason}")]
    KeyMaterial { path: PathBuf, reason: String },

    #[error("Pseudonymization salt must not be empty")]
    EmptySalt,

    #[error("Key file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PII bundle serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    fn cipher(&self) -> Result<Aes256Gcm, PrivacyError> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|_| PrivacyError::Authentication)
    }
}

enum KeyState {
    Absent,
    Present(SecretKey),
    Erased,
}

/// Operations reported through [`PrivacyGuard::audit_entry_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivacyOperation {
    Pseudonymize,
    Encrypt,
    Decrypt,
    ProcessWallet,
    EraseKey,
    RegenerateKey,
}

impl PrivacyOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivacyOperation::Pseudonymize => "pseudonymize",
            PrivacyOperation::Encrypt => "encrypt",
            PrivacyOperation::Decrypt => "decrypt",
            PrivacyOperation::ProcessWallet => "process_wallet",
            PrivacyOperation::EraseKey => "erase_key",
            PrivacyOperation::RegenerateKey => "regenerate_key",
        }
    }
}

impl std::fmt::Display for PrivacyOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner of the pseudonymization salt and the symmetric key.
pub struct PrivacyGuard {
    salt: String,
    key_path: PathBuf,
    state: RwLock<KeyState>,
}

impl std::fmt::Debug for PrivacyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivacyGuard")
            .field("key_path", &self.key_path)
            .field("salt_fingerprint", &self.salt_fingerprint())
            .finish()
    }
}

impl PrivacyGuard {
    /// Create a guard. Key material is loaded or generated on first use.
    pub fn new(
        salt: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Result<Self, PrivacyError> {
        let salt = salt.into();
        if salt.is_empty() {
            return Err(PrivacyError::EmptySalt);
        }
        Ok(Self {
            salt,
            key_path: key_path.into(),
            state: RwLock::new(KeyState::Absent),
        })
    }

    pub fn from_config(config: &PrivacyConfig) -> Result<Self, PrivacyError> {
        Self::new(config.salt.clone(), config.key_path.clone())
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn is_erased(&self) -> bool {
        matches!(*self.state.read(), KeyState::Erased)
    }

    /// First 16 hex chars of SHA-256(salt): identifies the salt epoch without revealing it.
    pub fn salt_fingerprint(&self) -> String {
        let digest = Sha256::digest(self.salt.as_bytes());
        hex::encode(&digest[..8])
    }

    /// Hex SHA-256 of `salt ‖ canonical_address(address)`.
    ///
    /// Spellings of one wallet that differ only in case (EIP-55 checksum,
    /// uppercase bech32) or surrounding whitespace share a pseudonym.
    pub fn pseudonymize(&self, address: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(canonical_address(address).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Encrypt to base64(nonce ‖ ciphertext ‖ tag).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, PrivacyError> {
        let state = self.key_for_use()?;
        let KeyState::Present(key) = &*state else {
            return Err(PrivacyError::KeyErased);
        };

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = key
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| PrivacyError::Authentication)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Decrypt a value produced by [`encrypt`](Self::encrypt).
    ///
    /// Every failure mode (erased key, foreign key, tampering, bad encoding)
    /// maps to [`PrivacyError::Authentication`]; no partial plaintext escapes.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, PrivacyError> {
        let state = self.key_for_use()?;
        let KeyState::Present(key) = &*state else {
            return Err(PrivacyError::Authentication);
        };

        let raw = BASE64
            .decode(ciphertext.trim().as_bytes())
            .map_err(|_| PrivacyError::Authentication)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(PrivacyError::Authentication);
        }
        let (nonce, body) = raw.split_at(NONCE_LEN);
        let plaintext = key
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| PrivacyError::Authentication)?;

        String::from_utf8(plaintext).map_err(|_| PrivacyError::Authentication)
    }

    /// Pseudonymize an address and encrypt it with any extra PII as one bundle.
    ///
    /// `wallet_address` in the bundle always carries `address`, even if
    /// `extra_pii` supplies a key of the same name.
    pub fn process_wallet(
        &self,
        address: &str,
        extra_pii: Option<&Map<String, Value>>,
    ) -> Result<(String, String), PrivacyError> {
        let mut bundle = extra_pii.cloned().unwrap_or_default();
        bundle.insert("wallet_address".to_string(), Value::String(address.to_string()));

        // Serialize fully before encrypting so a bundle is never half-protected
        let serialized = serde_json::to_string(&Value::Object(bundle))?;
        let encrypted = self.encrypt(&serialized)?;
        let pseudonym = self.pseudonymize(address);

        debug!("Processed wallet {}", &pseudonym[..16]);
        Ok((pseudonym, encrypted))
    }

    /// Build the envelope for one transaction's counterparties.
    ///
    /// A missing side gets the `UNKNOWN` pseudonym; the ciphertext bundles
    /// whichever addresses are present.
    pub fn envelope_for(
        &self,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<PrivacyEnvelope, PrivacyError> {
        let bundle = json!({
            "from_address": from,
            "to_address": to,
        });
        let encrypted_pii = self.encrypt(&serde_json::to_string(&bundle)?)?;

        Ok(PrivacyEnvelope {
            pseudonym_from: from
                .map(|a| self.pseudonymize(a))
                .unwrap_or_else(|| UNKNOWN_PSEUDONYM.to_string()),
            pseudonym_to: to
                .map(|a| self.pseudonymize(a))
                .unwrap_or_else(|| UNKNOWN_PSEUDONYM.to_string()),
            encrypted_pii,
        })
    }

    /// Log-ready record of a privacy operation. Does not append anywhere.
    ///
    /// `subject` should already be a pseudonym or other non-identifying value.
    pub fn audit_entry_for(&self, operation: PrivacyOperation, subject: &str) -> AuditEvent {
        AuditEvent::new(
            format!("privacy.{}", operation),
            json!({
                "operation": operation.as_str(),
                "subject": subject,
                "salt_fingerprint": self.salt_fingerprint(),
                "key_erased": self.is_erased(),
            }),
        )
    }

    /// Overwrite the key file with random bytes, sync, then delete it.
    ///
    /// Irreversible: ciphertext produced under the key can no longer be
    /// decrypted. Returns whether any key material existed.
    pub fn erase(&self) -> Result<bool, PrivacyError> {
        let mut state = self.state.write();
        let had_file = self.key_path.exists();
        let had_memory = matches!(*state, KeyState::Present(_));

        if had_file {
            overwrite_and_remove(&self.key_path)?;
        }
        // Dropping the previous Present key zeroizes it
        *state = KeyState::Erased;

        warn!(
            "Encryption key at {} erased; all data encrypted under it is permanently unrecoverable",
            self.key_path.display()
        );
        Ok(had_file || had_memory)
    }

    /// Generate and persist fresh key material, replacing any existing key.
    pub fn regenerate_key(&self) -> Result<(), PrivacyError> {
        let mut state = self.state.write();
        if self.key_path.exists() {
            overwrite_and_remove(&self.key_path)?;
        }
        let key = SecretKey::generate();
        write_key_file(&self.key_path, &key)?;
        *state = KeyState::Present(key);

        info!("Generated new encryption key at {}", self.key_path.display());
        Ok(())
    }

    /// Read access to key state, loading or generating the key on first use.
    fn key_for_use(&self) -> Result<RwLockReadGuard<'_, KeyState>, PrivacyError> {
        {
            let state = self.state.read();
            if !matches!(*state, KeyState::Absent) {
                return Ok(state);
            }
        }

        let mut state = self.state.write();
        // Another caller may have initialized while we waited
        if matches!(*state, KeyState::Absent) {
            *state = KeyState::Present(self.load_or_create()?);
        }
        Ok(RwLockWriteGuard::downgrade(state))
    }

    fn load_or_create(&self) -> Result<SecretKey, PrivacyError> {
        if self.key_path.exists() {
            let mut bytes = fs::read(&self.key_path)?;
            if bytes.len() != KEY_LEN {
                let len = bytes.len();
                bytes.zeroize();
                return Err(PrivacyError::KeyMaterial {
                    path: self.key_path.clone(),
                    reason: format!("expected {} bytes, found {}", KEY_LEN, len),
                });
            }
            let mut key = SecretKey([0u8; KEY_LEN]);
            key.0.copy_from_slice(&bytes);
            bytes.zeroize();
            debug!("Loaded encryption key from {}", self.key_path.display());
            return Ok(key);
        }

        let key = SecretKey::generate();
        write_key_file(&self.key_path, &key)?;
        info!("Generated new encryption key at {}", self.key_path.display());
        Ok(key)
    }
}

fn write_key_file(path: &Path, key: &SecretKey) -> Result<(), PrivacyError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut options = OpenOptions::new();
    options.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(&key.0)?;
    file.sync_all()?;
    Ok(())
}

fn overwrite_and_remove(path: &Path) -> Result<(), PrivacyError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut existing = Vec::new();
    file.read_to_end(&mut existing)?;
    let len = existing.len().max(MIN_OVERWRITE_LEN);
    existing.zeroize();

    let mut noise = vec![0u8; len];
    OsRng.fill_bytes(&mut noise);
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&noise)?;
    file.sync_all()?;
    drop(file);

    fs::remove_file(path)?;
    Ok(())
}
