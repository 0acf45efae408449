//! Keystream for in-payload protected values.
//!
//! Protected strings inside the decrypted XML are XOR-ed with a keystream
//! seeded from the container's protected stream key. The stream is consumed
//! in document order, so every protected value must pass through the same
//! [`InnerStream`] exactly once, in order.

use aes::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use salsa20::Salsa20;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Fixed Salsa20 nonce used by legacy containers.
const SALSA20_NONCE: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

/// Inner stream algorithm identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InnerStreamAlgorithm {
    /// Values are stored as plain base64.
    None,
    /// Salsa20 (legacy default).
    Salsa20,
    /// ChaCha20 (modern default).
    ChaCha20,
}

impl InnerStreamAlgorithm {
    /// Map the numeric header id. `1` (ArcFour variant) and unknown ids yield `None`.
    #[must_use]
    pub const fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(Self::None),
            2 => Some(Self::Salsa20),
            3 => Some(Self::ChaCha20),
            _ => None,
        }
    }

    /// Numeric header id.
    #[must_use]
    pub const fn id(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Salsa20 => 2,
            Self::ChaCha20 => 3,
        }
    }
}

enum Keystream {
    Plain,
    Salsa(Box<Salsa20>),
    ChaCha(Box<ChaCha20>),
}

/// Stateful protected-value keystream.
pub struct InnerStream {
    keystream: Keystream,
}

impl std::fmt::Debug for InnerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InnerStream(***)")
    }
}

impl InnerStream {
    /// Initialise the stream from the raw protected stream key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if cipher initialisation fails.
    pub fn new(algorithm: InnerStreamAlgorithm, stream_key: &[u8]) -> Result<Self, CryptoError> {
        let keystream = match algorithm {
            InnerStreamAlgorithm::None => Keystream::Plain,
            InnerStreamAlgorithm::Salsa20 => {
                let mut key: [u8; 32] = Sha256::digest(stream_key).into();
                let cipher = Salsa20::new_from_slices(&key, &SALSA20_NONCE)
                    .map_err(|_| CryptoError::Encryption("failed to initialise Salsa20".into()));
                key.zeroize();
                Keystream::Salsa(Box::new(cipher?))
            }
            InnerStreamAlgorithm::ChaCha20 => {
                let mut hash = Sha512::digest(stream_key);
                let cipher = ChaCha20::new_from_slices(&hash[..32], &hash[32..44])
                    .map_err(|_| CryptoError::Encryption("failed to initialise ChaCha20".into()));
                hash.as_mut_slice().zeroize();
                Keystream::ChaCha(Box::new(cipher?))
            }
        };
        Ok(Self { keystream })
    }

    /// XOR `data` with the next `data.len()` keystream bytes (in place).
    pub fn apply(&mut self, data: &mut [u8]) {
        match &mut self.keystream {
            Keystream::Plain => {}
            Keystream::Salsa(c) => c.apply_keystream(data),
            Keystream::ChaCha(c) => c.apply_keystream(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applying_twice_with_fresh_streams_restores_plaintext() {
        for alg in [InnerStreamAlgorithm::Salsa20, InnerStreamAlgorithm::ChaCha20] {
            let mut data = b"correct horse".to_vec();
            InnerStream::new(alg, b"stream key").expect("init").apply(&mut data);
            assert_ne!(data.as_slice(), b"correct horse");
            InnerStream::new(alg, b"stream key").expect("init").apply(&mut data);
            assert_eq!(data.as_slice(), b"correct horse");
        }
    }

    #[test]
    fn stream_position_advances_across_values() {
        let mut whole = vec![0u8; 10];
        InnerStream::new(InnerStreamAlgorithm::ChaCha20, b"k")
            .expect("init")
            .apply(&mut whole);

        let mut split = InnerStream::new(InnerStreamAlgorithm::ChaCha20, b"k").expect("init");
        let mut first = vec![0u8; 4];
        let mut second = vec![0u8; 6];
        split.apply(&mut first);
        split.apply(&mut second);
        first.extend_from_slice(&second);
        assert_eq!(first, whole);
    }

    #[test]
    fn plain_stream_is_identity() {
        let mut data = b"visible".to_vec();
        InnerStream::new(InnerStreamAlgorithm::None, &[])
            .expect("init")
            .apply(&mut data);
        assert_eq!(data.as_slice(), b"visible");
    }

    #[test]
    fn id_mapping() {
        assert_eq!(InnerStreamAlgorithm::from_id(2), Some(InnerStreamAlgorithm::Salsa20));
        assert_eq!(InnerStreamAlgorithm::from_id(3), Some(InnerStreamAlgorithm::ChaCha20));
        assert_eq!(InnerStreamAlgorithm::from_id(1), None);
        assert_eq!(InnerStreamAlgorithm::ChaCha20.id(), 3);
    }
}
