use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const MIN_MASTER_KEY_LEN: usize = 32;

const ENCRYPTION_KEY_INFO: &[u8] = b"certificate-vault/field-encryption/v1";
const HASH_KEY_INFO: &[u8] = b"certificate-vault/field-hash/v1";

/// Error type for crypto operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encrypt(String),
    #[error("Decryption failed: {0}")]
    Decrypt(String),
    #[error("Key management error: {0}")]
    KeyManagement(String),
    #[error("Encryption keys are not configured")]
    NotConfigured,
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Reversible encryption plus a deterministic keyed hash for field values.
///
/// `hash` must return the same digest for the same input across calls and
/// processes; it is what equality lookups search on.
pub trait CryptoProvider: Send + Sync {
    fn is_configured(&self) -> bool;
    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError>;
    fn hash(&self, plaintext: &str) -> Result<String, CryptoError>;
}

// ---------------------------------------------------------------------------
// Key Management
// ---------------------------------------------------------------------------

#[derive(Zeroize, ZeroizeOnDrop)]
struct FieldKeys {
    encryption: [u8; 32],
    hash: [u8; 32],
}

impl FieldKeys {
    /// Derive independent encryption and HMAC keys from one master secret.
    fn derive(master: &[u8]) -> Result<Self, CryptoError> {
        if master.len() < MIN_MASTER_KEY_LEN {
            return Err(CryptoError::KeyManagement(format!(
                "Master key too short: {} bytes (expected at least {})",
                master.len(),
                MIN_MASTER_KEY_LEN
            )));
        }

        let hk = Hkdf::<Sha256>::new(None, master);
        let mut keys = FieldKeys {
            encryption: [0u8; 32],
            hash: [0u8; 32],
        };
        hk.expand(ENCRYPTION_KEY_INFO, &mut keys.encryption)
            .map_err(|e| CryptoError::KeyManagement(format!("HKDF expand failed: {}", e)))?;
        hk.expand(HASH_KEY_INFO, &mut keys.hash)
            .map_err(|e| CryptoError::KeyManagement(format!("HKDF expand failed: {}", e)))?;
        Ok(keys)
    }
}

/// AES-256-GCM encryption with HMAC-SHA256 hashing.
///
/// Ciphertext is stored as `base64(nonce || ciphertext)` in a single column.
pub struct AesGcmProvider {
    keys: Option<FieldKeys>,
}

impl AesGcmProvider {
    /// Build a provider from raw master key bytes.
    pub fn from_master_key(master: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            keys: Some(FieldKeys::derive(master)?),
        })
    }

    /// Build a provider from a base64-encoded master key, as found in config.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let mut bytes = B64.decode(encoded.trim())?;
        let result = Self::from_master_key(&bytes);
        bytes.zeroize();
        result
    }

    /// A provider with no keys. Every operation fails with `NotConfigured`.
    pub fn unconfigured() -> Self {
        Self { keys: None }
    }

    fn keys(&self) -> Result<&FieldKeys, CryptoError> {
        self.keys.as_ref().ok_or(CryptoError::NotConfigured)
    }
}

impl std::fmt::Debug for AesGcmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmProvider")
            .field("configured", &self.keys.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Core Encryption / Decryption / Hashing
// ---------------------------------------------------------------------------

impl CryptoProvider for AesGcmProvider {
    fn is_configured(&self) -> bool {
        self.keys.is_some()
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let keys = self.keys()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&keys.encryption));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(&nonce_bytes);
        packed.extend_from_slice(&ciphertext);
        Ok(B64.encode(packed))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let keys = self.keys()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&keys.encryption));

        let packed = B64.decode(ciphertext.trim())?;
        if packed.len() <= NONCE_LEN {
            return Err(CryptoError::Decrypt(format!(
                "Ciphertext too short: {} bytes",
                packed.len()
            )));
        }

        let (nonce_bytes, body) = packed.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::Decrypt(format!("Invalid UTF-8 in decrypted data: {}", e)))
    }

    fn hash(&self, plaintext: &str) -> Result<String, CryptoError> {
        let keys = self.keys()?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&keys.hash)
            .map_err(|e| CryptoError::KeyManagement(format!("Invalid HMAC key: {}", e)))?;
        mac.update(plaintext.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Canonical form of an email before hashing, so lookups are case-insensitive.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
