//! Zeroizing containers for key material.
//!
//! Every intermediate secret of an unlock attempt (component hashes,
//! transformed keys, cipher keys, challenge responses) lives in one of these
//! types so it is wiped when the attempt drops it:
//!
//! - [`SecretBuffer`] — variable length, heap allocated, pages pinned
//! - [`SecretBytes`] — fixed length, inline
//!
//! Pinning uses `mlock` where available and silently degrades elsewhere.

use std::fmt;

use secrecy::{ExposeSecret, SecretSlice};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Pinned heap range, released on drop.
struct PageLock {
    addr: usize,
    len: usize,
}

impl PageLock {
    /// Pin `len` bytes at `ptr`; `None` when the OS refuses.
    fn pin(ptr: *const u8, len: usize) -> Option<Self> {
        if len == 0 || !sys::lock(ptr, len) {
            return None;
        }
        Some(Self {
            addr: ptr as usize,
            len,
        })
    }
}

impl Drop for PageLock {
    fn drop(&mut self) {
        sys::unlock(self.addr as *const u8, self.len);
    }
}

// ---------------------------------------------------------------------------
// SecretBuffer
// ---------------------------------------------------------------------------

/// Variable-length secret, zeroized on drop.
pub struct SecretBuffer {
    inner: SecretSlice<u8>,
    // Declared last so the pages stay pinned while the slice is wiped.
    _pin: Option<PageLock>,
}

impl SecretBuffer {
    /// Copy `data` into a new pinned allocation. The caller still owns (and
    /// must wipe) its own copy.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::SecureMemory` if the allocation cannot be made.
    pub fn new(data: &[u8]) -> Result<Self, CryptoError> {
        let mut owned = Vec::new();
        owned
            .try_reserve_exact(data.len())
            .map_err(|e| CryptoError::SecureMemory(format!("cannot allocate secret: {e}")))?;
        owned.extend_from_slice(data);
        let inner = SecretSlice::from(owned);
        let exposed = inner.expose_secret();
        let pin = PageLock::pin(exposed.as_ptr(), exposed.len());
        if pin.is_none() && !exposed.is_empty() {
            static WARNED: std::sync::Once = std::sync::Once::new();
            WARNED.call_once(|| tracing::warn!("mlock refused; key material may reach swap"));
        }
        Ok(Self { inner, _pin: pin })
    }

    /// Move `data` in, wiping the original vector.
    ///
    /// # Errors
    ///
    /// Same as [`SecretBuffer::new`].
    pub fn from_vec(mut data: Vec<u8>) -> Result<Self, CryptoError> {
        let result = Self::new(&data);
        data.zeroize();
        result
    }

    /// Borrow the secret bytes. Keep the borrow short.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        self.inner.expose_secret()
    }

    /// Number of bytes held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.expose().len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBuffer({} bytes, ***)", self.len())
    }
}

// ---------------------------------------------------------------------------
// SecretBytes<N>
// ---------------------------------------------------------------------------

/// Fixed-size secret (keys, seeds, digests), zeroized on drop.
///
/// Inline values move with their owner, so they are not pinned.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes<const N: usize>([u8; N]);

impl<const N: usize> SecretBytes<N> {
    /// Take ownership of `data`.
    #[must_use]
    pub const fn new(data: [u8; N]) -> Self {
        Self(data)
    }

    /// Copy an exactly-`N`-byte slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyMaterial` on a length mismatch.
    pub fn from_slice(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() != N {
            return Err(CryptoError::InvalidKeyMaterial(format!(
                "expected {N} bytes, got {}",
                data.len()
            )));
        }
        let mut out = Self([0u8; N]);
        out.0.copy_from_slice(data);
        Ok(out)
    }

    /// Borrow the secret bytes.
    #[must_use]
    pub const fn expose(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> Clone for SecretBytes<N> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

/// Constant-time comparison.
impl<const N: usize> PartialEq for SecretBytes<N> {
    fn eq(&self, other: &Self) -> bool {
        ring::constant_time::verify_slices_are_equal(&self.0, &other.0).is_ok()
    }
}

impl<const N: usize> Eq for SecretBytes<N> {}

impl<const N: usize> fmt::Debug for SecretBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes<{N}>(***)")
    }
}

// ---------------------------------------------------------------------------
// Process hardening
// ---------------------------------------------------------------------------

/// Stop the process from writing core files that could hold decrypted
/// databases. A no-op off Unix.
///
/// # Errors
///
/// Returns `CryptoError::SecureMemory` if the limit cannot be lowered.
pub fn disable_core_dumps() -> Result<(), CryptoError> {
    sys::no_core_dumps()
}

#[cfg(unix)]
mod sys {
    use crate::error::CryptoError;

    pub(super) fn lock(ptr: *const u8, len: usize) -> bool {
        // SAFETY: mlock reads no memory; a bad range only yields an error code.
        unsafe { libc::mlock(ptr.cast(), len) == 0 }
    }

    pub(super) fn unlock(ptr: *const u8, len: usize) {
        // SAFETY: as above; the range was locked by `lock`.
        unsafe {
            libc::munlock(ptr.cast(), len);
        }
    }

    pub(super) fn no_core_dumps() -> Result<(), CryptoError> {
        let zero = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: valid pointer to an initialised rlimit.
        if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &zero) } == 0 {
            Ok(())
        } else {
            Err(CryptoError::SecureMemory(format!(
                "setrlimit(RLIMIT_CORE): {}",
                std::io::Error::last_os_error()
            )))
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use crate::error::CryptoError;

    pub(super) const fn lock(_ptr: *const u8, _len: usize) -> bool {
        false
    }

    pub(super) const fn unlock(_ptr: *const u8, _len: usize) {}

    pub(super) const fn no_core_dumps() -> Result<(), CryptoError> {
        Ok(())
    }
}
