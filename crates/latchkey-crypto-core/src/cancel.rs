//! Cooperative cancellation shared between an unlock engine and its worker.
//!
//! Long-running code (KDF rounds, payload parsing) polls [`CancellationToken::check`]
//! at bounded intervals and unwinds with [`CryptoError::Cancelled`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// Why an attempt was cancelled. Informational only; every reason yields the
/// same cancelled outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CancelReason {
    /// The user dismissed the unlock.
    UserRequest,
    /// The host app went to the background.
    AppBackgrounded,
    /// A newer request replaced this one.
    Superseded,
}

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
}

/// Cloneable cancellation flag. All clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// A fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        if let Ok(mut slot) = self.inner.reason.lock() {
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.inner.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// The reason passed to the first [`cancel`](Self::cancel) call.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.reason.lock().ok().and_then(|slot| *slot)
    }

    /// Polling helper for worker loops.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> Result<(), CryptoError> {
        if self.is_cancelled() {
            Err(CryptoError::Cancelled)
        } else {
            Ok(())
        }
    }
}
