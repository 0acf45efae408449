//! Container key-derivation functions.
//!
//! This module provides:
//! - [`KdfParams`] — the tunable KDF recorded in a container header
//! - [`transform`] — composite hash → 32-byte transformed key
//!
//! Two families are supported:
//! - **AES-KDF** — the composite hash is AES-256-ECB encrypted `rounds` times
//!   under a 32-byte seed, then hashed with SHA-256
//! - **Argon2d / Argon2id** — memory-hard, computed by the `argon2` crate
//!
//! Derivation is the dominant cost of an unlock. Both paths poll a
//! [`CancellationToken`] at bounded intervals and report progress in `[0, 1]`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::cancel::CancellationToken;
use crate::error::CryptoError;
use crate::memory::{SecretBuffer, SecretBytes};

/// Output length of every KDF (256 bits).
pub const OUTPUT_LEN: usize = 32;

/// AES-KDF rounds between two cancellation/progress checks.
pub const AES_KDF_ROUNDS_PER_CHECK: u64 = 10_000;

/// Interval at which the Argon2 waiter polls for cancellation.
const ARGON2_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Progress ceiling while Argon2 is still running.
const ARGON2_PROGRESS_CAP: f32 = 0.95;

/// Rough Argon2 throughput used for progress estimates (bytes·passes per second).
const ARGON2_THROUGHPUT: f64 = 1.0e9;

/// Minimum salt length accepted for Argon2.
const MIN_ARGON2_SALT_LEN: usize = 8;

/// Largest Argon2 memory cost accepted from a header (32 GiB).
pub const MAX_ARGON2_MEMORY_BYTES: u64 = 34_359_738_368;

/// Argon2 workers still hashing after their caller gave up on them.
static ABANDONED_ARGON2_RUNS: AtomicUsize = AtomicUsize::new(0);

/// KDF identifier for AES-KDF.
pub const AES_KDF_UUID: [u8; 16] = [
    0xc9, 0xd9, 0xf3, 0x9a, 0x62, 0x8a, 0x44, 0x60, 0xbf, 0x74, 0x0d, 0x08, 0xc1, 0x8a, 0x4f, 0xea,
];

/// KDF identifier for Argon2d.
pub const ARGON2D_UUID: [u8; 16] = [
    0xef, 0x63, 0x6d, 0xdf, 0x8c, 0x29, 0x44, 0x4b, 0x91, 0xf7, 0xa9, 0xa4, 0x03, 0xe3, 0x0a, 0x0c,
];

/// KDF identifier for Argon2id.
pub const ARGON2ID_UUID: [u8; 16] = [
    0x9e, 0x29, 0x8b, 0x19, 0x56, 0xdb, 0x47, 0x73, 0xb2, 0x3d, 0xfc, 0x3e, 0xc6, 0xf0, 0xa1, 0xe6,
];

/// Argon2 version byte for 1.3.
pub const ARGON2_VERSION_13: u32 = 0x13;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Argon2 flavour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Argon2Variant {
    /// Data-dependent addressing (KeePass default).
    Argon2d,
    /// Hybrid addressing.
    Argon2id,
}

/// KDF parameters read from (or written to) a container header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KdfParams {
    /// AES-KDF with a 32-byte seed.
    AesKdf {
        /// AES-256 key used for the rounds.
        seed: [u8; 32],
        /// Number of encryption rounds.
        rounds: u64,
    },
    /// Argon2d or Argon2id.
    Argon2 {
        /// Flavour.
        variant: Argon2Variant,
        /// Salt (usually 32 bytes).
        salt: Vec<u8>,
        /// Memory cost in **bytes** (the container stores bytes, not KiB).
        memory_bytes: u64,
        /// Number of passes.
        iterations: u64,
        /// Lanes.
        parallelism: u32,
        /// Algorithm version (`0x10` or `0x13`).
        version: u32,
    },
}

impl KdfParams {
    /// AES-KDF with a random seed.
    #[must_use]
    pub fn aes_kdf(rounds: u64) -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::AesKdf { seed, rounds }
    }

    /// Argon2 (version 1.3) with a random 32-byte salt.
    #[must_use]
    pub fn argon2(
        variant: Argon2Variant,
        memory_bytes: u64,
        iterations: u64,
        parallelism: u32,
    ) -> Self {
        let mut salt = vec![0u8; 32];
        OsRng.fill_bytes(&mut salt);
        Self::Argon2 {
            variant,
            salt,
            memory_bytes,
            iterations,
            parallelism,
            version: ARGON2_VERSION_13,
        }
    }

    /// Same cost parameters with a fresh random seed/salt, as done on every save.
    #[must_use]
    pub fn reseeded(&self) -> Self {
        match self {
            Self::AesKdf { rounds, .. } => Self::aes_kdf(*rounds),
            Self::Argon2 {
                variant,
                salt,
                memory_bytes,
                iterations,
                parallelism,
                version,
            } => {
                let mut fresh = vec![0u8; salt.len().max(MIN_ARGON2_SALT_LEN)];
                OsRng.fill_bytes(&mut fresh);
                Self::Argon2 {
                    variant: *variant,
                    salt: fresh,
                    memory_bytes: *memory_bytes,
                    iterations: *iterations,
                    parallelism: *parallelism,
                    version: *version,
                }
            }
        }
    }

    /// The 16-byte identifier stored in modern headers.
    #[must_use]
    pub const fn uuid(&self) -> [u8; 16] {
        match self {
            Self::AesKdf { .. } => AES_KDF_UUID,
            Self::Argon2 {
                variant: Argon2Variant::Argon2d,
                ..
            } => ARGON2D_UUID,
            Self::Argon2 {
                variant: Argon2Variant::Argon2id,
                ..
            } => ARGON2ID_UUID,
        }
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Transform a composite hash into the 32-byte transformed key.
///
/// `on_progress` receives non-decreasing fractions in `[0, 1]`; the final
/// call is always `1.0` on success.
///
/// AES-KDF stops within [`AES_KDF_ROUNDS_PER_CHECK`] rounds of a cancel.
/// Argon2 returns within one poll interval, but the `argon2` crate has no
/// interrupt point: the abandoned hash keeps its thread and its memory until
/// the current run completes. A run started meanwhile logs a warning.
///
/// # Errors
///
/// - [`CryptoError::Cancelled`] if `cancel` fires during derivation
/// - [`CryptoError::KeyDerivation`] for invalid parameters, a memory cost the
///   process cannot allocate, or an Argon2 failure
pub fn transform(
    composite: &SecretBytes<OUTPUT_LEN>,
    params: &KdfParams,
    cancel: &CancellationToken,
    on_progress: &mut dyn FnMut(f32),
) -> Result<SecretBytes<OUTPUT_LEN>, CryptoError> {
    cancel.check()?;
    on_progress(0.0);
    let key = match params {
        KdfParams::AesKdf { seed, rounds } => {
            aes_kdf(composite.expose(), seed, *rounds, cancel, on_progress)?
        }
        KdfParams::Argon2 { .. } => argon2_kdf(composite, params, cancel, on_progress)?,
    };
    on_progress(1.0);
    Ok(key)
}

fn aes_kdf(
    composite: &[u8; OUTPUT_LEN],
    seed: &[u8; 32],
    rounds: u64,
    cancel: &CancellationToken,
    on_progress: &mut dyn FnMut(f32),
) -> Result<SecretBytes<OUTPUT_LEN>, CryptoError> {
    let cipher = Aes256::new_from_slice(seed)
        .map_err(|_| CryptoError::KeyDerivation("invalid AES-KDF seed length".into()))?;

    let mut blocks = [
        aes::Block::clone_from_slice(&composite[..16]),
        aes::Block::clone_from_slice(&composite[16..]),
    ];

    let mut done: u64 = 0;
    while done < rounds {
        let batch = AES_KDF_ROUNDS_PER_CHECK.min(rounds.saturating_sub(done));
        for _ in 0..batch {
            cipher.encrypt_blocks(&mut blocks);
        }
        done = done.saturating_add(batch);
        cancel.check()?;
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        on_progress((done as f64 / rounds as f64) as f32);
    }

    let mut hasher = Sha256::new();
    hasher.update(blocks[0]);
    hasher.update(blocks[1]);
    let mut out: [u8; OUTPUT_LEN] = hasher.finalize().into();
    for block in &mut blocks {
        block.as_mut_slice().zeroize();
    }
    let key = SecretBytes::new(out);
    out.zeroize();
    Ok(key)
}

fn argon2_kdf(
    composite: &SecretBytes<OUTPUT_LEN>,
    params: &KdfParams,
    cancel: &CancellationToken,
    on_progress: &mut dyn FnMut(f32),
) -> Result<SecretBytes<OUTPUT_LEN>, CryptoError> {
    let KdfParams::Argon2 {
        variant,
        salt,
        memory_bytes,
        iterations,
        parallelism,
        version,
    } = params
    else {
        return Err(CryptoError::KeyDerivation("not an Argon2 parameter set".into()));
    };

    if salt.len() < MIN_ARGON2_SALT_LEN {
        return Err(CryptoError::KeyDerivation(format!(
            "argon2 salt too short: {} bytes (minimum {MIN_ARGON2_SALT_LEN})",
            salt.len()
        )));
    }

    if *memory_bytes > MAX_ARGON2_MEMORY_BYTES {
        return Err(CryptoError::KeyDerivation(format!(
            "argon2 memory cost of {memory_bytes} bytes exceeds the {MAX_ARGON2_MEMORY_BYTES} byte limit"
        )));
    }
    let m_cost = u32::try_from(memory_bytes / 1024)
        .map_err(|_| CryptoError::KeyDerivation("argon2 memory cost too large".into()))?;
    let t_cost = u32::try_from(*iterations)
        .map_err(|_| CryptoError::KeyDerivation("argon2 iteration count too large".into()))?;
    let argon2_params = argon2::Params::new(m_cost, t_cost, *parallelism, Some(OUTPUT_LEN))
        .map_err(|e| CryptoError::KeyDerivation(format!("invalid argon2 params: {e}")))?;
    let algorithm = match variant {
        Argon2Variant::Argon2d => argon2::Algorithm::Argon2d,
        Argon2Variant::Argon2id => argon2::Algorithm::Argon2id,
    };
    let argon2_version = match version {
        0x10 => argon2::Version::V0x10,
        0x13 => argon2::Version::V0x13,
        other => {
            return Err(CryptoError::KeyDerivation(format!(
                "unsupported argon2 version {other:#x}"
            )))
        }
    };

    let abandoned = abandoned_argon2_runs();
    if abandoned > 0 {
        tracing::warn!(abandoned, "cancelled argon2 derivations are still running");
    }
    let mut memory = allocate_blocks(argon2_params.block_count())?;

    // The argon2 crate cannot be interrupted mid-pass. The hash runs on a
    // helper thread so the caller can abandon it as soon as cancel fires.
    // The channel is a rendezvous: a send fails only once the caller is gone.
    let password = SecretBuffer::new(composite.expose())?;
    let salt = salt.clone();
    let (tx, rx) = mpsc::sync_channel(0);
    std::thread::Builder::new()
        .name("latchkey-argon2".into())
        .spawn(move || {
            let ctx = argon2::Argon2::new(algorithm, argon2_version, argon2_params);
            let mut out = [0u8; OUTPUT_LEN];
            let result = ctx
                .hash_password_into_with_memory(password.expose(), &salt, &mut out, &mut memory)
                .map(|()| SecretBytes::new(out))
                .map_err(|e| e.to_string());
            out.zeroize();
            drop(memory);
            if tx.send(result).is_err() {
                ABANDONED_ARGON2_RUNS.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .map_err(|e| CryptoError::KeyDerivation(format!("failed to spawn argon2 worker: {e}")))?;

    #[allow(clippy::cast_precision_loss)]
    let estimate_secs = ((*memory_bytes as f64) * (*iterations as f64) / ARGON2_THROUGHPUT)
        .max(ARGON2_POLL_INTERVAL.as_secs_f64());
    let started = Instant::now();

    loop {
        match rx.recv_timeout(ARGON2_POLL_INTERVAL) {
            Ok(Ok(key)) => return Ok(key),
            Ok(Err(msg)) => {
                return Err(CryptoError::KeyDerivation(format!(
                    "argon2 derivation failed: {msg}"
                )))
            }
            Err(RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() {
                    ABANDONED_ARGON2_RUNS.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!("argon2 derivation abandoned after cancellation");
                    return Err(CryptoError::Cancelled);
                }
                #[allow(clippy::cast_possible_truncation)]
                let fraction =
                    ((started.elapsed().as_secs_f64() / estimate_secs) as f32).min(ARGON2_PROGRESS_CAP);
                on_progress(fraction);
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(CryptoError::KeyDerivation(
                    "argon2 worker exited without a result".into(),
                ))
            }
        }
    }
}

/// Reserve Argon2's working memory up front so an oversized cost is an
/// error instead of an allocation abort.
fn allocate_blocks(count: usize) -> Result<Vec<argon2::Block>, CryptoError> {
    let mut blocks = Vec::new();
    blocks.try_reserve_exact(count).map_err(|e| {
        CryptoError::KeyDerivation(format!("cannot allocate argon2 memory ({count} KiB): {e}"))
    })?;
    blocks.resize(count, argon2::Block::default());
    Ok(blocks)
}

fn abandoned_argon2_runs() -> usize {
    ABANDONED_ARGON2_RUNS.load(Ordering::SeqCst)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelReason;

    fn composite() -> SecretBytes<32> {
        SecretBytes::new([0x42; 32])
    }

    fn small_argon2(variant: Argon2Variant) -> KdfParams {
        KdfParams::Argon2 {
            variant,
            salt: vec![0x11; 32],
            memory_bytes: 64 * 1024,
            iterations: 2,
            parallelism: 1,
            version: ARGON2_VERSION_13,
        }
    }

    fn run(params: &KdfParams) -> Result<SecretBytes<32>, CryptoError> {
        transform(&composite(), params, &CancellationToken::new(), &mut |_| {})
    }

    #[test]
    fn aes_kdf_zero_rounds_is_plain_sha256() {
        let params = KdfParams::AesKdf {
            seed: [0u8; 32],
            rounds: 0,
        };
        let key = run(&params).expect("derive should succeed");
        let expected: [u8; 32] = Sha256::digest([0x42u8; 32]).into();
        assert_eq!(key.expose(), &expected);
    }

    #[test]
    fn aes_kdf_is_deterministic() {
        let params = KdfParams::AesKdf {
            seed: [7u8; 32],
            rounds: 25_000,
        };
        let a = run(&params).expect("derive should succeed");
        let b = run(&params).expect("derive should succeed");
        assert_eq!(a, b);
    }

    #[test]
    fn aes_kdf_seed_changes_output() {
        let a = run(&KdfParams::AesKdf {
            seed: [1u8; 32],
            rounds: 100,
        })
        .expect("derive should succeed");
        let b = run(&KdfParams::AesKdf {
            seed: [2u8; 32],
            rounds: 100,
        })
        .expect("derive should succeed");
        assert_ne!(a, b);
    }

    #[test]
    fn argon2_variants_are_deterministic_and_distinct() {
        let d1 = run(&small_argon2(Argon2Variant::Argon2d)).expect("argon2d should succeed");
        let d2 = run(&small_argon2(Argon2Variant::Argon2d)).expect("argon2d should succeed");
        let id = run(&small_argon2(Argon2Variant::Argon2id)).expect("argon2id should succeed");
        assert_eq!(d1, d2);
        assert_ne!(d1, id);
    }

    #[test]
    fn argon2_rejects_short_salt() {
        let params = KdfParams::Argon2 {
            variant: Argon2Variant::Argon2id,
            salt: vec![1, 2, 3],
            memory_bytes: 64 * 1024,
            iterations: 1,
            parallelism: 1,
            version: ARGON2_VERSION_13,
        };
        assert!(matches!(run(&params), Err(CryptoError::KeyDerivation(_))));
    }

    #[test]
    fn argon2_rejects_unknown_version() {
        let mut params = small_argon2(Argon2Variant::Argon2d);
        if let KdfParams::Argon2 { version, .. } = &mut params {
            *version = 0x42;
        }
        let err = run(&params).expect_err("unknown version must fail");
        assert!(format!("{err}").contains("unsupported argon2 version"));
    }

    #[test]
    fn argon2_rejects_oversized_memory_cost() {
        let mut params = small_argon2(Argon2Variant::Argon2d);
        if let KdfParams::Argon2 { memory_bytes, .. } = &mut params {
            // 2 TiB, still a valid u32 KiB count.
            *memory_bytes = (1u64 << 31) * 1024;
        }
        let err = run(&params).expect_err("must refuse before allocating");
        assert!(matches!(err, CryptoError::KeyDerivation(_)));
    }

    #[test]
    fn unallocatable_block_count_is_an_error() {
        let err = allocate_blocks(usize::MAX / 2).expect_err("capacity overflow");
        assert!(format!("{err}").contains("cannot allocate argon2 memory"));
        assert_eq!(allocate_blocks(8).unwrap().len(), 8);
    }

    #[test]
    fn cancellation_during_argon2_returns_promptly() {
        let params = KdfParams::Argon2 {
            variant: Argon2Variant::Argon2d,
            salt: vec![0x22; 32],
            memory_bytes: 32 << 20,
            iterations: 20,
            parallelism: 1,
            version: ARGON2_VERSION_13,
        };
        let token = CancellationToken::new();
        let canceller = token.clone();
        let mut seen = Vec::new();
        let started = Instant::now();
        let result = transform(&composite(), &params, &token, &mut |p| {
            seen.push(p);
            if p > 0.0 {
                canceller.cancel(CancelReason::UserRequest);
            }
        });
        assert!(matches!(result, Err(CryptoError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(seen.iter().any(|&p| p > 0.0 && p < ARGON2_PROGRESS_CAP));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        // The worker is still hashing and has been written off.
        assert!(abandoned_argon2_runs() >= 1);
    }

    #[test]
    fn cancelled_token_stops_before_work() {
        let token = CancellationToken::new();
        token.cancel(CancelReason::UserRequest);
        let params = KdfParams::AesKdf {
            seed: [0u8; 32],
            rounds: u64::MAX,
        };
        let result = transform(&composite(), &params, &token, &mut |_| {});
        assert!(matches!(result, Err(CryptoError::Cancelled)));
    }

    #[test]
    fn cancellation_during_aes_rounds_aborts() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        let mut calls = 0u32;
        let params = KdfParams::AesKdf {
            seed: [0u8; 32],
            rounds: u64::MAX,
        };
        let result = transform(&composite(), &params, &token, &mut |_| {
            calls += 1;
            if calls == 3 {
                canceller.cancel(CancelReason::UserRequest);
            }
        });
        assert!(matches!(result, Err(CryptoError::Cancelled)));
        assert!(calls <= 4, "must stop within one check interval, got {calls} calls");
    }

    #[test]
    fn progress_is_monotonic_and_completes() {
        let mut seen = Vec::new();
        let params = KdfParams::AesKdf {
            seed: [3u8; 32],
            rounds: 45_000,
        };
        transform(&composite(), &params, &CancellationToken::new(), &mut |p| {
            seen.push(p);
        })
        .expect("derive should succeed");
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.first().copied(), Some(0.0));
        assert_eq!(seen.last().copied(), Some(1.0));
    }

    #[test]
    fn reseeded_keeps_costs_and_changes_seed() {
        let original = KdfParams::aes_kdf(6_000);
        let fresh = original.reseeded();
        match (&original, &fresh) {
            (
                KdfParams::AesKdf { seed: a, rounds: ra },
                KdfParams::AesKdf { seed: b, rounds: rb },
            ) => {
                assert_eq!(ra, rb);
                assert_ne!(a, b);
            }
            _ => panic!("reseeded must keep the KDF family"),
        }
    }

    #[test]
    fn uuid_matches_family() {
        assert_eq!(KdfParams::aes_kdf(1).uuid(), AES_KDF_UUID);
        assert_eq!(small_argon2(Argon2Variant::Argon2d).uuid(), ARGON2D_UUID);
        assert_eq!(small_argon2(Argon2Variant::Argon2id).uuid(), ARGON2ID_UUID);
    }
}
