//! Cryptographic error types for `latchkey-crypto-core`.

use thiserror::Error;

use crate::hardware_key::HardwareKeyError;

/// Errors produced by cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key derivation failed (invalid KDF parameters, memory allocation).
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// The operation observed a cancellation request and stopped early.
    #[error("operation cancelled")]
    Cancelled,

    /// Cipher setup or encryption failure.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Padding or authentication check failed. Almost always a wrong key.
    #[error("decryption failed: key mismatch")]
    Decryption,

    /// Invalid key material (wrong length, missing components).
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Secure memory allocation failure.
    #[error("secure memory error: {0}")]
    SecureMemory(String),

    /// Key file could not be interpreted.
    #[error("key file error: {0}")]
    KeyFile(String),

    /// Challenge-response hardware key failure.
    #[error("hardware key error: {0}")]
    HardwareKey(#[from] HardwareKeyError),
}
