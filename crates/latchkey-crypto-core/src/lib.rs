//! `latchkey-crypto-core` — Key material and cryptographic primitives for latchkey.
//!
//! This crate is the audit target: no file system, no network, no async.
//! Threads are used only to bound blocking work (Argon2, hardware challenges)
//! so that cancellation and timeouts stay responsive.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod cancel;
pub mod error;
pub mod memory;

pub mod kdf;

pub mod cipher;
pub mod inner_stream;

pub mod keyfile;

pub mod hardware_key;

pub mod composite_key;

pub use cancel::{CancelReason, CancellationToken};
pub use cipher::OuterCipher;
pub use composite_key::{compose, CompositeKey, FinalKeys, StoredCompositeKey};
pub use error::CryptoError;
pub use hardware_key::{
    ChallengeHandler, HardwareKeyDescriptor, HardwareKeyError, HardwareKeyKind,
    SoftwareHmacKey, TimeoutChallengeHandler, UnavailableChallengeHandler,
};
pub use inner_stream::{InnerStream, InnerStreamAlgorithm};
pub use kdf::{transform, Argon2Variant, KdfParams};
pub use keyfile::load_key_file;
pub use memory::{disable_core_dumps, SecretBuffer, SecretBytes};
