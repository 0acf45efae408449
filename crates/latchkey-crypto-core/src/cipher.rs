//! Outer payload ciphers.
//!
//! This module provides:
//! - [`OuterCipher`] — the cipher named by a container header
//! - [`decrypt`] / [`encrypt`] — whole-payload transforms
//!
//! AES-256-CBC carries PKCS#7 padding; a padding failure is reported as
//! [`CryptoError::Decryption`] because with an unauthenticated legacy
//! container it is the first visible symptom of a wrong key.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use aes::Aes256;
use chacha20::ChaCha20;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::memory::{SecretBuffer, SecretBytes};

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;

/// Cipher identifier for AES-256 in CBC mode.
pub const AES256_UUID: [u8; 16] = [
    0x31, 0xc1, 0xf2, 0xe6, 0xbf, 0x71, 0x43, 0x50, 0xbe, 0x58, 0x05, 0x21, 0x6a, 0xfc, 0x5a, 0xff,
];

/// Cipher identifier for ChaCha20.
pub const CHACHA20_UUID: [u8; 16] = [
    0xd6, 0x03, 0x8a, 0x2b, 0x8b, 0x6f, 0x4c, 0xb5, 0xa5, 0x24, 0x33, 0x9a, 0x31, 0xdb, 0xb5, 0x9a,
];

/// Cipher identifier for Twofish-CBC. Recognised, not supported.
pub const TWOFISH_UUID: [u8; 16] = [
    0xad, 0x68, 0xf2, 0x9f, 0x57, 0x6f, 0x4b, 0xb9, 0xa3, 0x6a, 0xd4, 0x7a, 0xf9, 0x65, 0x34, 0x6c,
];

/// Cipher key length for every supported cipher.
pub const KEY_LEN: usize = 32;

/// Outer payload cipher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OuterCipher {
    /// AES-256-CBC with PKCS#7 padding.
    Aes256Cbc,
    /// ChaCha20 stream cipher (RFC 7539 nonce).
    ChaCha20,
}

impl OuterCipher {
    /// Map a header cipher identifier. Unknown and Twofish yield `None`.
    #[must_use]
    pub fn from_uuid(uuid: &[u8]) -> Option<Self> {
        if uuid == AES256_UUID {
            Some(Self::Aes256Cbc)
        } else if uuid == CHACHA20_UUID {
            Some(Self::ChaCha20)
        } else {
            None
        }
    }

    /// Header identifier for this cipher.
    #[must_use]
    pub const fn uuid(self) -> [u8; 16] {
        match self {
            Self::Aes256Cbc => AES256_UUID,
            Self::ChaCha20 => CHACHA20_UUID,
        }
    }

    /// Required IV / nonce length.
    #[must_use]
    pub const fn iv_len(self) -> usize {
        match self {
            Self::Aes256Cbc => 16,
            Self::ChaCha20 => 12,
        }
    }
}

fn check_iv(cipher: OuterCipher, iv: &[u8]) -> Result<(), CryptoError> {
    if iv.len() == cipher.iv_len() {
        Ok(())
    } else {
        Err(CryptoError::Encryption(format!(
            "invalid IV length for {cipher:?}: {} bytes (expected {})",
            iv.len(),
            cipher.iv_len()
        )))
    }
}

/// Decrypt a whole payload.
///
/// # Errors
///
/// - [`CryptoError::Encryption`] for a malformed IV
/// - [`CryptoError::Decryption`] when CBC padding does not verify
pub fn decrypt(
    cipher: OuterCipher,
    key: &SecretBytes<KEY_LEN>,
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<SecretBuffer, CryptoError> {
    check_iv(cipher, iv)?;
    match cipher {
        OuterCipher::Aes256Cbc => {
            let dec = Aes256CbcDec::new_from_slices(key.expose(), iv)
                .map_err(|_| CryptoError::Encryption("failed to initialise AES-CBC".into()))?;
            let plain = dec
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CryptoError::Decryption)?;
            SecretBuffer::from_vec(plain)
        }
        OuterCipher::ChaCha20 => {
            let mut buf = ciphertext.to_vec();
            apply_chacha20(key, iv, &mut buf)?;
            SecretBuffer::from_vec(buf)
        }
    }
}

/// Encrypt a whole payload.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] for a malformed IV.
pub fn encrypt(
    cipher: OuterCipher,
    key: &SecretBytes<KEY_LEN>,
    iv: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    check_iv(cipher, iv)?;
    match cipher {
        OuterCipher::Aes256Cbc => {
            let enc = Aes256CbcEnc::new_from_slices(key.expose(), iv)
                .map_err(|_| CryptoError::Encryption("failed to initialise AES-CBC".into()))?;
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        }
        OuterCipher::ChaCha20 => {
            let mut buf = plaintext.to_vec();
            apply_chacha20(key, iv, &mut buf)?;
            Ok(buf)
        }
    }
}

fn apply_chacha20(
    key: &SecretBytes<KEY_LEN>,
    nonce: &[u8],
    buf: &mut [u8],
) -> Result<(), CryptoError> {
    let mut stream = ChaCha20::new_from_slices(key.expose(), nonce)
        .map_err(|_| CryptoError::Encryption("failed to initialise ChaCha20".into()))?;
    stream.apply_keystream(buf);
    Ok(())
}
