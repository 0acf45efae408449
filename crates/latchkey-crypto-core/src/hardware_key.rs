//! Challenge-response hardware keys.
//!
//! A database may require a hardware token (YubiKey-style HMAC-SHA1 slot) as
//! an additional factor. The unlock pipeline sends the container's master
//! seed as the challenge; the response is hashed and mixed into the final
//! cipher key.
//!
//! The transport is supplied by the caller as a [`ChallengeHandler`]. Handlers
//! are blocking from the pipeline's point of view; [`TimeoutChallengeHandler`]
//! bounds any handler so a missing device can never hang an unlock.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use ring::hmac;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::SecretBuffer;

/// Length of an HMAC-SHA1 challenge response.
pub const HMAC_SHA1_RESPONSE_LEN: usize = 20;

/// Failures reported by a [`ChallengeHandler`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HardwareKeyError {
    /// No hardware interaction is possible in this context (e.g. an extension
    /// process without USB/NFC access).
    #[error("hardware key is not available")]
    NotAvailable,

    /// The device did not answer within the allotted time.
    #[error("hardware key did not respond within {0:?}")]
    Timeout(Duration),

    /// The user declined the touch prompt or dismissed the NFC sheet.
    #[error("hardware key interaction was cancelled")]
    Cancelled,

    /// Transport or device-level failure.
    #[error("hardware key failure: {0}")]
    Device(String),
}

/// How the hardware key is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HardwareKeyKind {
    /// USB-attached token.
    Usb,
    /// NFC token.
    Nfc,
    /// Software emulation (testing, migration).
    Software,
}

/// Which hardware key (and slot) a database is associated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareKeyDescriptor {
    /// Transport.
    pub kind: HardwareKeyKind,
    /// Challenge-response slot (1 or 2 on common tokens).
    pub slot: u8,
}

/// Capability that answers a challenge with a response.
pub trait ChallengeHandler: Send + Sync {
    /// Produce the response for `challenge`.
    ///
    /// # Errors
    ///
    /// Implementations fail with [`HardwareKeyError::NotAvailable`] when no
    /// device can be reached, never by blocking indefinitely.
    fn respond(&self, challenge: &[u8]) -> Result<SecretBuffer, HardwareKeyError>;
}

/// Handler for contexts without hardware access. Always `NotAvailable`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableChallengeHandler;

impl ChallengeHandler for UnavailableChallengeHandler {
    fn respond(&self, _challenge: &[u8]) -> Result<SecretBuffer, HardwareKeyError> {
        Err(HardwareKeyError::NotAvailable)
    }
}

/// Software HMAC-SHA1 slot, byte-compatible with a programmed hardware slot
/// holding the same secret.
pub struct SoftwareHmacKey {
    key: hmac::Key,
}

impl SoftwareHmacKey {
    /// Build from the slot secret (20 bytes on typical tokens).
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret),
        }
    }
}

impl std::fmt::Debug for SoftwareHmacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SoftwareHmacKey(***)")
    }
}

impl ChallengeHandler for SoftwareHmacKey {
    fn respond(&self, challenge: &[u8]) -> Result<SecretBuffer, HardwareKeyError> {
        let tag = hmac::sign(&self.key, challenge);
        SecretBuffer::new(tag.as_ref()).map_err(|e| HardwareKeyError::Device(e.to_string()))
    }
}

/// Wraps another handler and gives up after `timeout`.
///
/// The inner call runs on a helper thread; if it overruns, its eventual
/// result is dropped.
pub struct TimeoutChallengeHandler {
    inner: Arc<dyn ChallengeHandler>,
    timeout: Duration,
}

impl TimeoutChallengeHandler {
    /// Bound `inner` by `timeout`.
    #[must_use]
    pub fn new(inner: Arc<dyn ChallengeHandler>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl ChallengeHandler for TimeoutChallengeHandler {
    fn respond(&self, challenge: &[u8]) -> Result<SecretBuffer, HardwareKeyError> {
        let inner = Arc::clone(&self.inner);
        let challenge = challenge.to_vec();
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("latchkey-challenge".into())
            .spawn(move || {
                let _ = tx.send(inner.respond(&challenge));
            })
            .map_err(|e| HardwareKeyError::Device(format!("failed to spawn: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(timeout = ?self.timeout, "hardware key challenge timed out");
                Err(HardwareKeyError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(HardwareKeyError::Device(
                "challenge handler exited without a response".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowHandler(Duration);

    impl ChallengeHandler for SlowHandler {
        fn respond(&self, _challenge: &[u8]) -> Result<SecretBuffer, HardwareKeyError> {
            std::thread::sleep(self.0);
            SecretBuffer::new(&[1u8; 20]).map_err(|e| HardwareKeyError::Device(e.to_string()))
        }
    }

    #[test]
    fn unavailable_handler_fails_fast() {
        let result = UnavailableChallengeHandler.respond(b"seed");
        assert_eq!(result.expect_err("must fail"), HardwareKeyError::NotAvailable);
    }

    #[test]
    fn software_key_matches_rfc2202_vector() {
        // RFC 2202 test case 2.
        let key = SoftwareHmacKey::new(b"Jefe");
        let response = key
            .respond(b"what do ya want for nothing?")
            .expect("software key should respond");
        assert_eq!(response.len(), HMAC_SHA1_RESPONSE_LEN);
        assert_eq!(
            data_encoding::HEXLOWER.encode(response.expose()),
            "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"
        );
    }

    #[test]
    fn timeout_wrapper_passes_fast_responses() {
        let handler = TimeoutChallengeHandler::new(
            Arc::new(SlowHandler(Duration::from_millis(1))),
            Duration::from_secs(5),
        );
        assert!(handler.respond(b"c").is_ok());
    }

    #[test]
    fn timeout_wrapper_gives_up() {
        let handler = TimeoutChallengeHandler::new(
            Arc::new(SlowHandler(Duration::from_secs(2))),
            Duration::from_millis(20),
        );
        assert!(matches!(
            handler.respond(b"c"),
            Err(HardwareKeyError::Timeout(_))
        ));
    }

    #[test]
    fn descriptor_serde_roundtrip() {
        let descriptor = HardwareKeyDescriptor {
            kind: HardwareKeyKind::Usb,
            slot: 2,
        };
        let json = serde_json::to_string(&descriptor).expect("serialize");
        assert_eq!(json, r#"{"kind":"usb","slot":2}"#);
        let back: HardwareKeyDescriptor = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, descriptor);
    }
}
