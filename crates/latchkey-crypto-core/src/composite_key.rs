//! Credential Composer.
//!
//! This module provides:
//! - [`CompositeKey`] — password, key-file and hardware-key factors plus the
//!   lazily cached [`FinalKeys`]
//! - [`StoredCompositeKey`] — the serializable form kept in per-database
//!   settings when the user opts in to remembering the key
//!
//! # Derivation
//!
//! ```text
//! composite   = SHA-256( SHA-256(password) || key_file_component )
//! transformed = KDF(composite)
//! response    = SHA-256( challenge_response(master_seed) )      (optional)
//! cipher_key  = SHA-256( master_seed || response || transformed )
//! hmac_base   = SHA-512( master_seed || transformed || 0x01 )
//! ```
//!
//! The response only reaches the cipher key, as in other KeePass clients, so
//! a wrong hardware key passes the header HMAC and fails at decryption.
//!
//! `transformed` and `response` form the final keys. They are computed once
//! and reused until [`CompositeKey::erase_final_keys`] drops them; the raw
//! factor hashes survive the erase so a full re-derivation needs no user input.

use std::fmt;

use data_encoding::BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cancel::CancellationToken;
use crate::error::CryptoError;
use crate::hardware_key::{ChallengeHandler, HardwareKeyDescriptor, HardwareKeyError};
use crate::kdf::{self, KdfParams, OUTPUT_LEN};
use crate::keyfile;
use crate::memory::SecretBytes;

/// Length of a cipher key / transformed key.
pub const FINAL_KEY_LEN: usize = OUTPUT_LEN;

/// Length of the modern-format HMAC base key.
pub const HMAC_BASE_KEY_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Final keys
// ---------------------------------------------------------------------------

/// KDF output plus the hashed challenge response, if any.
#[derive(Clone)]
pub struct FinalKeys {
    transformed_key: SecretBytes<FINAL_KEY_LEN>,
    challenge_response: Option<SecretBytes<FINAL_KEY_LEN>>,
}

impl FinalKeys {
    /// Key for the outer cipher of a container with `master_seed`.
    #[must_use]
    pub fn cipher_key(&self, master_seed: &[u8]) -> SecretBytes<FINAL_KEY_LEN> {
        let mut hasher = Sha256::new();
        hasher.update(master_seed);
        if let Some(response) = &self.challenge_response {
            hasher.update(response.expose());
        }
        hasher.update(self.transformed_key.expose());
        let mut out: [u8; FINAL_KEY_LEN] = hasher.finalize().into();
        let key = SecretBytes::new(out);
        out.zeroize();
        key
    }

    /// Base key for the modern format's header and block HMACs.
    #[must_use]
    pub fn hmac_base_key(&self, master_seed: &[u8]) -> SecretBytes<HMAC_BASE_KEY_LEN> {
        let mut hasher = Sha512::new();
        hasher.update(master_seed);
        hasher.update(self.transformed_key.expose());
        hasher.update([0x01]);
        let mut digest = hasher.finalize();
        let mut out = [0u8; HMAC_BASE_KEY_LEN];
        out.copy_from_slice(&digest);
        digest.as_mut_slice().zeroize();
        let key = SecretBytes::new(out);
        out.zeroize();
        key
    }

    /// Whether a hardware response is mixed into the cipher key.
    #[must_use]
    pub const fn has_challenge_response(&self) -> bool {
        self.challenge_response.is_some()
    }
}

impl fmt::Debug for FinalKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FinalKeys(***)")
    }
}

// ---------------------------------------------------------------------------
// CompositeKey
// ---------------------------------------------------------------------------

/// Merged credential factors for one database.
///
/// Owned by a single unlock attempt; not `Clone` so two attempts never share
/// cached final keys.
#[derive(Default)]
pub struct CompositeKey {
    password: Option<SecretBytes<32>>,
    key_file: Option<SecretBytes<32>>,
    hardware_key: Option<HardwareKeyDescriptor>,
    final_keys: Option<FinalKeys>,
}

impl fmt::Debug for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeKey")
            .field("password", &self.password.is_some())
            .field("key_file", &self.key_file.is_some())
            .field("hardware_key", &self.hardware_key)
            .field("final_keys", &self.final_keys.is_some())
            .finish()
    }
}

/// Build a composite key from raw credentials.
///
/// `key_file` holds the raw contents of the key file; it is reduced to its
/// 32-byte component here and not retained.
///
/// # Errors
///
/// - [`CryptoError::KeyFile`] if the key file cannot be interpreted
/// - [`CryptoError::InvalidKeyMaterial`] if no factor at all is given
pub fn compose(
    password: Option<&str>,
    key_file: Option<&[u8]>,
    hardware_key: Option<HardwareKeyDescriptor>,
) -> Result<CompositeKey, CryptoError> {
    let mut key = CompositeKey::new();
    if let Some(password) = password {
        key.set_password(password);
    }
    if let Some(contents) = key_file {
        key.key_file = Some(keyfile::load_key_file(contents)?);
    }
    key.hardware_key = hardware_key;
    if key.is_empty() {
        return Err(CryptoError::InvalidKeyMaterial(
            "a password, key file or hardware key is required".into(),
        ));
    }
    Ok(key)
}

impl CompositeKey {
    /// An empty key with no factors.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the password factor. An empty string is a valid
    /// password and differs from no password.
    pub fn set_password(&mut self, password: &str) {
        let mut digest: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        self.password = Some(SecretBytes::new(digest));
        digest.zeroize();
        self.final_keys = None;
    }

    /// Set (or replace) the key-file component directly.
    pub fn set_key_file_component(&mut self, component: SecretBytes<32>) {
        self.key_file = Some(component);
        self.final_keys = None;
    }

    /// Associate (or clear) a hardware key.
    pub fn set_hardware_key(&mut self, descriptor: Option<HardwareKeyDescriptor>) {
        self.hardware_key = descriptor;
        self.final_keys = None;
    }

    /// Whether no factor is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.password.is_none() && self.key_file.is_none() && self.hardware_key.is_none()
    }

    /// Whether a password factor is present.
    #[must_use]
    pub const fn has_password(&self) -> bool {
        self.password.is_some()
    }

    /// Whether a key-file factor is present.
    #[must_use]
    pub const fn has_key_file(&self) -> bool {
        self.key_file.is_some()
    }

    /// Associated hardware key, if any.
    #[must_use]
    pub const fn hardware_key(&self) -> Option<HardwareKeyDescriptor> {
        self.hardware_key
    }

    /// Cached final keys, if derived.
    #[must_use]
    pub const fn final_keys(&self) -> Option<&FinalKeys> {
        self.final_keys.as_ref()
    }

    /// Whether cached final keys are present.
    #[must_use]
    pub const fn has_final_keys(&self) -> bool {
        self.final_keys.is_some()
    }

    /// Drop cached final keys. Factors are kept.
    pub fn erase_final_keys(&mut self) {
        if self.final_keys.take().is_some() {
            tracing::debug!("final keys erased");
        }
    }

    /// Hash of the password and key-file factors.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the key has no factor.
    pub fn composite_hash(&self) -> Result<SecretBytes<32>, CryptoError> {
        if self.is_empty() {
            return Err(CryptoError::InvalidKeyMaterial("composite key is empty".into()));
        }
        let mut hasher = Sha256::new();
        if let Some(password) = &self.password {
            hasher.update(password.expose());
        }
        if let Some(key_file) = &self.key_file {
            hasher.update(key_file.expose());
        }
        let mut out: [u8; 32] = hasher.finalize().into();
        let hash = SecretBytes::new(out);
        out.zeroize();
        Ok(hash)
    }

    /// Return the final keys, deriving and caching them if absent.
    ///
    /// Cached keys are returned as is, whatever `kdf` and `master_seed` say;
    /// whether they still fit the container is only known once decryption is
    /// tried.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::Cancelled`] if `cancel` fires during the KDF
    /// - [`CryptoError::HardwareKey`] if a hardware key is associated and the
    ///   handler is missing or fails
    /// - [`CryptoError::KeyDerivation`] for invalid KDF parameters
    pub fn final_keys_for(
        &mut self,
        kdf_params: &KdfParams,
        master_seed: &[u8],
        challenge_handler: Option<&dyn ChallengeHandler>,
        cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<&FinalKeys, CryptoError> {
        if self.final_keys.is_none() {
            let challenge_response = match self.hardware_key {
                Some(descriptor) => {
                    let handler = challenge_handler.ok_or(HardwareKeyError::NotAvailable)?;
                    tracing::debug!(slot = descriptor.slot, "requesting challenge response");
                    let response = handler.respond(master_seed)?;
                    cancel.check()?;
                    let mut digest: [u8; 32] = Sha256::digest(response.expose()).into();
                    let hashed = SecretBytes::new(digest);
                    digest.zeroize();
                    Some(hashed)
                }
                None => None,
            };
            let composite = self.composite_hash()?;
            let transformed_key = kdf::transform(&composite, kdf_params, cancel, on_progress)?;
            self.final_keys = Some(FinalKeys {
                transformed_key,
                challenge_response,
            });
        } else {
            on_progress(1.0);
        }
        self.final_keys
            .as_ref()
            .ok_or_else(|| CryptoError::KeyDerivation("final keys missing after derivation".into()))
    }

    /// Serializable snapshot for remembering this key.
    #[must_use]
    pub fn to_stored(&self) -> StoredCompositeKey {
        StoredCompositeKey {
            password: self.password.as_ref().map(|k| BASE64.encode(k.expose())),
            key_file: self.key_file.as_ref().map(|k| BASE64.encode(k.expose())),
            hardware_key: self.hardware_key,
            transformed_key: self
                .final_keys
                .as_ref()
                .map(|f| BASE64.encode(f.transformed_key.expose())),
            challenge_response: self
                .final_keys
                .as_ref()
                .and_then(|f| f.challenge_response.as_ref())
                .map(|r| BASE64.encode(r.expose())),
        }
    }

    /// Rebuild a key from its stored snapshot, cached final keys included.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] on malformed fields or an
    /// empty snapshot.
    pub fn from_stored(stored: &StoredCompositeKey) -> Result<Self, CryptoError> {
        let password = stored.password.as_deref().map(decode_32).transpose()?;
        let key_file = stored.key_file.as_deref().map(decode_32).transpose()?;
        let transformed = stored.transformed_key.as_deref().map(decode_32).transpose()?;
        let response = stored.challenge_response.as_deref().map(decode_32).transpose()?;

        let final_keys = match (transformed, response) {
            (Some(transformed_key), challenge_response) => Some(FinalKeys {
                transformed_key,
                challenge_response,
            }),
            (None, None) => None,
            (None, Some(_)) => {
                return Err(CryptoError::InvalidKeyMaterial(
                    "stored challenge response without transformed key".into(),
                ))
            }
        };
        let key = Self {
            password,
            key_file,
            hardware_key: stored.hardware_key,
            final_keys,
        };
        if key.is_empty() {
            return Err(CryptoError::InvalidKeyMaterial("stored key is empty".into()));
        }
        Ok(key)
    }
}

fn decode_32(encoded: &str) -> Result<SecretBytes<32>, CryptoError> {
    let mut raw = BASE64
        .decode(encoded.as_bytes())
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("invalid base64: {e}")))?;
    let result = SecretBytes::from_slice(&raw);
    raw.zeroize();
    result
}

// ---------------------------------------------------------------------------
// StoredCompositeKey
// ---------------------------------------------------------------------------

/// Remembered composite key, as persisted in database settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct StoredCompositeKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_file: Option<String>,
    #[zeroize(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hardware_key: Option<HardwareKeyDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transformed_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    challenge_response: Option<String>,
}

impl StoredCompositeKey {
    /// Whether cached final keys were remembered too.
    #[must_use]
    pub const fn has_final_keys(&self) -> bool {
        self.transformed_key.is_some()
    }
}

impl fmt::Debug for StoredCompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StoredCompositeKey(***)")
    }
}
