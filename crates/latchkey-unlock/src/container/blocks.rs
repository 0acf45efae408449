//! Block framing.
//!
//! This module provides:
//! - Hashed blocks (legacy): `u32 index | sha256 | u32 size | data`, closed by
//!   an empty block with an all-zero hash
//! - HMAC blocks (modern): `hmac-sha256 | u32 size | data`, closed by an empty
//!   block whose HMAC is still checked
//! - The modern header HMAC

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use latchkey_crypto_core::{CancellationToken, SecretBytes};
use sha2::{Digest, Sha256, Sha512};
use zeroize::{Zeroize, Zeroizing};

use super::reader::ByteReader;
use crate::error::{SaveError, UnlockError};

type HmacSha256 = Hmac<Sha256>;

/// Payload bytes per block when writing.
pub(super) const BLOCK_SIZE: usize = 1024 * 1024;

/// Block index reserved for the header HMAC.
const HEADER_INDEX: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Hashed blocks
// ---------------------------------------------------------------------------

/// Reassemble a hashed block stream.
///
/// # Errors
///
/// [`UnlockError::FileCorrupted`] on a bad index, hash or truncation.
pub(super) fn read_hashed(
    data: &[u8],
    cancel: &CancellationToken,
) -> Result<Zeroizing<Vec<u8>>, UnlockError> {
    let mut r = ByteReader::new(data);
    let mut out = Zeroizing::new(Vec::with_capacity(data.len()));
    let mut expected: u32 = 0;
    loop {
        cancel.check()?;
        let index = r.u32()?;
        if index != expected {
            return Err(UnlockError::corrupted(format!(
                "block {index} out of order (expected {expected})"
            )));
        }
        let hash: [u8; 32] = r.array()?;
        let size = usize::try_from(r.u32()?)
            .map_err(|_| UnlockError::corrupted("block too large"))?;
        if size == 0 {
            if hash != [0u8; 32] {
                return Err(UnlockError::corrupted("final block hash is not zero"));
            }
            return Ok(out);
        }
        let block = r.take(size)?;
        if Sha256::digest(block).as_slice() != hash {
            return Err(UnlockError::corrupted(format!("block {index} hash mismatch")));
        }
        out.extend_from_slice(block);
        expected = expected
            .checked_add(1)
            .ok_or_else(|| UnlockError::corrupted("too many blocks"))?;
    }
}

/// Frame `payload` as hashed blocks.
///
/// # Errors
///
/// [`SaveError::Serialize`] if the payload needs more than `u32::MAX` blocks.
pub(super) fn write_hashed(payload: &[u8]) -> Result<Vec<u8>, SaveError> {
    let mut out = Vec::with_capacity(payload.len().saturating_add(128));
    let mut index: u32 = 0;
    for chunk in payload.chunks(BLOCK_SIZE) {
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(&Sha256::digest(chunk));
        out.extend_from_slice(&block_len(chunk)?.to_le_bytes());
        out.extend_from_slice(chunk);
        index = index
            .checked_add(1)
            .ok_or_else(|| SaveError::serialize("too many blocks"))?;
    }
    out.extend_from_slice(&index.to_le_bytes());
    out.extend_from_slice(&[0u8; 32]);
    out.extend_from_slice(&0u32.to_le_bytes());
    Ok(out)
}

fn block_len(chunk: &[u8]) -> Result<u32, SaveError> {
    u32::try_from(chunk.len()).map_err(|_| SaveError::serialize("block too large"))
}

// ---------------------------------------------------------------------------
// HMAC blocks
// ---------------------------------------------------------------------------

fn block_key(base: &SecretBytes<64>, index: u64) -> Zeroizing<[u8; 64]> {
    let mut hasher = Sha512::new();
    hasher.update(index.to_le_bytes());
    hasher.update(base.expose());
    let mut digest = hasher.finalize();
    let mut key = Zeroizing::new([0u8; 64]);
    key.copy_from_slice(&digest);
    digest.as_mut_slice().zeroize();
    key
}

fn block_mac(base: &SecretBytes<64>, index: u64) -> Result<HmacSha256, InvalidLength> {
    let key = block_key(base, index);
    <HmacSha256 as Mac>::new_from_slice(key.as_slice())
}

/// HMAC over the serialized header.
///
/// # Errors
///
/// [`SaveError::Serialize`] if the MAC cannot be keyed.
pub(super) fn header_hmac(base: &SecretBytes<64>, header: &[u8]) -> Result<[u8; 32], SaveError> {
    let mut mac = block_mac(base, HEADER_INDEX).map_err(SaveError::serialize)?;
    mac.update(header);
    Ok(mac.finalize().into_bytes().into())
}

/// Check the header HMAC. A mismatch means the key is wrong.
///
/// # Errors
///
/// [`UnlockError::InvalidKey`] on mismatch.
pub(super) fn verify_header_hmac(
    base: &SecretBytes<64>,
    header: &[u8],
    expected: &[u8],
) -> Result<(), UnlockError> {
    let mut mac = block_mac(base, HEADER_INDEX)
        .map_err(|e| UnlockError::corrupted(format!("header HMAC: {e}")))?;
    mac.update(header);
    mac.verify_slice(expected)
        .map_err(|_| UnlockError::InvalidKey("header HMAC mismatch".into()))
}

/// Reassemble and authenticate an HMAC block stream.
///
/// # Errors
///
/// [`UnlockError::FileCorrupted`] on a block HMAC mismatch or truncation.
pub(super) fn read_hmac(
    data: &[u8],
    base: &SecretBytes<64>,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, UnlockError> {
    let mut r = ByteReader::new(data);
    let mut out = Vec::with_capacity(data.len());
    let mut index: u64 = 0;
    loop {
        cancel.check()?;
        let tag: [u8; 32] = r.array()?;
        let size_bytes: [u8; 4] = r.array()?;
        let size = usize::try_from(i32::from_le_bytes(size_bytes))
            .map_err(|_| UnlockError::corrupted(format!("block {index} has a negative size")))?;
        let block = r.take(size)?;

        let mut mac = block_mac(base, index)
            .map_err(|e| UnlockError::corrupted(format!("block HMAC: {e}")))?;
        mac.update(&index.to_le_bytes());
        mac.update(&size_bytes);
        mac.update(block);
        mac.verify_slice(&tag)
            .map_err(|_| UnlockError::corrupted(format!("block {index} HMAC mismatch")))?;

        if size == 0 {
            return Ok(out);
        }
        out.extend_from_slice(block);
        index = index
            .checked_add(1)
            .ok_or_else(|| UnlockError::corrupted("too many blocks"))?;
    }
}

/// Frame `ciphertext` as HMAC blocks.
///
/// # Errors
///
/// [`SaveError::Serialize`] if a block length does not fit the frame.
pub(super) fn write_hmac(ciphertext: &[u8], base: &SecretBytes<64>) -> Result<Vec<u8>, SaveError> {
    let mut out = Vec::with_capacity(ciphertext.len().saturating_add(128));
    let mut index: u64 = 0;
    let mut push = |index: u64, chunk: &[u8]| -> Result<(), SaveError> {
        let size = block_len(chunk)?.to_le_bytes();
        let mut mac = block_mac(base, index).map_err(SaveError::serialize)?;
        mac.update(&index.to_le_bytes());
        mac.update(&size);
        mac.update(chunk);
        out.extend_from_slice(&mac.finalize().into_bytes());
        out.extend_from_slice(&size);
        out.extend_from_slice(chunk);
        Ok(())
    };
    for chunk in ciphertext.chunks(BLOCK_SIZE) {
        push(index, chunk)?;
        index = index.saturating_add(1);
    }
    push(index, &[])?;
    Ok(out)
}
