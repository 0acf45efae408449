//! Container codec.
//!
//! This module provides:
//! - [`decode`] — header, key derivation, integrity checks and payload, for
//!   both generations
//! - [`encode`] — the inverse, with fresh seeds and IVs on every call
//! - [`ContainerSettings`] — the choices made when writing a container
//!
//! Integrity failures are split by cause: anything that proves the key wrong
//! is [`UnlockError::InvalidKey`], anything that proves the bytes damaged is
//! [`UnlockError::FileCorrupted`].

mod blocks;
mod header;
mod legacy;
mod modern;
mod reader;
mod variant_dict;
pub(crate) mod xml;

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use latchkey_crypto_core::composite_key::HMAC_BASE_KEY_LEN;
use latchkey_crypto_core::{
    Argon2Variant, CancellationToken, ChallengeHandler, CompositeKey, CryptoError, InnerStream,
    InnerStreamAlgorithm, KdfParams, OuterCipher, SecretBytes,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub use header::Generation;

use crate::database::{Database, LoadWarning};
use crate::error::{SaveError, UnlockError};
use crate::progress::ProgressReporter;
use header::Header;
use xml::ProtectedStream;

/// How a new container is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSettings {
    /// Format generation.
    pub generation: Generation,
    /// Outer cipher.
    pub cipher: OuterCipher,
    /// KDF costs. The seed or salt is replaced on every save.
    pub kdf: KdfParams,
    /// Gzip the payload.
    pub compress: bool,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            generation: Generation::Modern,
            cipher: OuterCipher::Aes256Cbc,
            kdf: KdfParams::argon2(Argon2Variant::Argon2d, 64 * 1024 * 1024, 10, 2),
            compress: true,
        }
    }
}

/// A successfully decoded container.
#[derive(Debug)]
pub struct Decoded {
    /// The loaded database.
    pub database: Database,
    /// Non-fatal issues repaired or skipped while loading.
    pub warnings: Vec<LoadWarning>,
    /// Generation the container was written in.
    pub generation: Generation,
}

/// Decode a container with `key`.
///
/// Progress runs from 0 to 1 over key derivation, decryption and parsing.
/// Cached final keys on `key` are used as is; if they do not fit this
/// container the result is [`UnlockError::InvalidKey`].
///
/// # Errors
///
/// - [`UnlockError::UnsupportedFormat`] for foreign or unknown formats
/// - [`UnlockError::InvalidKey`] when the key does not open the container
/// - [`UnlockError::FileCorrupted`] when a checksum or structure test fails
/// - [`UnlockError::CancelledByUser`] if `cancel` fires
/// - [`UnlockError::HardwareKeyUnavailable`] if a hardware key is needed and
///   cannot answer
pub fn decode(
    bytes: &[u8],
    key: &mut CompositeKey,
    challenge_handler: Option<&dyn ChallengeHandler>,
    cancel: &CancellationToken,
    progress: &mut ProgressReporter<'_>,
) -> Result<Decoded, UnlockError> {
    cancel.check()?;
    let header = Header::parse(bytes)?;
    let decoded = match header.generation {
        Generation::Legacy => {
            legacy::decode(bytes, &header, key, challenge_handler, cancel, progress)?
        }
        Generation::Modern => {
            modern::decode(bytes, &header, key, challenge_handler, cancel, progress)?
        }
    };
    progress.report(1.0);
    tracing::debug!(
        generation = ?decoded.generation,
        entries = decoded.database.root.entry_count(),
        warnings = decoded.warnings.len(),
        "container decoded"
    );
    Ok(decoded)
}

/// Encode `database` under `key`.
///
/// The KDF seed, master seed, IV and inner stream key are freshly random, so
/// final keys cached on `key` are erased and derived again.
///
/// # Errors
///
/// - [`SaveError::Crypto`] if key derivation or encryption fails
/// - [`SaveError::Serialize`] if the payload cannot be produced, or a legacy
///   container is asked for with a KDF other than AES-KDF
pub fn encode(
    database: &Database,
    key: &mut CompositeKey,
    settings: &ContainerSettings,
    challenge_handler: Option<&dyn ChallengeHandler>,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, SaveError> {
    key.erase_final_keys();
    let bytes = match settings.generation {
        Generation::Legacy => legacy::encode(database, key, settings, challenge_handler, cancel)?,
        Generation::Modern => modern::encode(database, key, settings, challenge_handler, cancel)?,
    };
    tracing::debug!(
        generation = ?settings.generation,
        bytes = bytes.len(),
        "container encoded"
    );
    Ok(bytes)
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Keys for one container, derived from the final keys and its master seed.
struct ContainerKeys {
    cipher: SecretBytes<32>,
    hmac_base: SecretBytes<HMAC_BASE_KEY_LEN>,
    /// A hardware response went into `cipher` but not into `hmac_base`.
    challenge_response: bool,
}

fn derive_keys(
    key: &mut CompositeKey,
    kdf: &KdfParams,
    master_seed: &[u8],
    challenge_handler: Option<&dyn ChallengeHandler>,
    cancel: &CancellationToken,
    on_progress: &mut dyn FnMut(f32),
) -> Result<ContainerKeys, CryptoError> {
    let final_keys = key.final_keys_for(kdf, master_seed, challenge_handler, cancel, on_progress)?;
    Ok(ContainerKeys {
        cipher: final_keys.cipher_key(master_seed),
        hmac_base: final_keys.hmac_base_key(master_seed),
        challenge_response: final_keys.has_challenge_response(),
    })
}

fn decompress(data: &[u8]) -> Result<Zeroizing<Vec<u8>>, UnlockError> {
    let mut out = Zeroizing::new(Vec::new());
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| UnlockError::corrupted(format!("payload decompression failed: {e}")))?;
    Ok(out)
}

fn compress(data: &[u8]) -> Result<Zeroizing<Vec<u8>>, SaveError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(SaveError::serialize)?;
    Ok(Zeroizing::new(encoder.finish().map_err(SaveError::serialize)?))
}

fn protected_stream(id: u32, stream_key: &[u8]) -> Result<ProtectedStream, UnlockError> {
    match InnerStreamAlgorithm::from_id(id) {
        Some(algorithm) => Ok(ProtectedStream::Known(InnerStream::new(algorithm, stream_key)?)),
        None => {
            tracing::warn!(id, "unknown inner stream, protected values will be skipped");
            Ok(ProtectedStream::Unknown(id))
        }
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    OsRng.fill_bytes(&mut out);
    out
}
