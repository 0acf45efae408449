//! Unlock State Machine.
//!
//! One request runs at most three attempts:
//!
//! ```text
//!   remembered key, auto-unlock allowed
//!   ───────────────────────────────────▶ Fast ──invalid key, cached keys──▶ Slow
//!   otherwise ─────────────────────────▶ Slow
//!   Fast | Slow ──unreachable, policy says use cache, copy exists──▶ Fallback
//! ```
//!
//! Each arrow is taken at most once per request. Every other failure is
//! terminal. The engine owns no policy: auto-unlock and fallback decisions
//! come from the caller's [`UnlockPolicy`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use latchkey_crypto_core::{
    compose, CancelReason, CancellationToken, ChallengeHandler, CompositeKey,
    HardwareKeyDescriptor,
};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::config::EngineConfig;
use crate::container::{self, Decoded};
use crate::error::{AttemptInFlight, StartError, UnlockError};
use crate::events::{AttemptKind, DatabaseStatus, UnlockEvent, UnlockOutcome, UnlockedDatabase};
use crate::fallback::{self, FallbackStore, FallbackStrategy};
use crate::file_ref::{FileProvider, FileReference};
use crate::progress::ProgressReporter;
use crate::settings::{DatabaseSettings, SettingsStore};

// ── Requests and policy ────────────────────────────────────────────

/// Credentials typed or picked by the user.
///
/// Missing factors are filled from the file's associated key file and
/// hardware key.
#[derive(Debug, Default)]
pub struct Credentials {
    /// Master password.
    pub password: Option<SecretString>,
    /// Key file to read.
    pub key_file: Option<FileReference>,
    /// Hardware key to challenge.
    pub hardware_key: Option<HardwareKeyDescriptor>,
}

impl Credentials {
    /// Password-only credentials.
    #[must_use]
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(SecretString::from(password.into())),
            ..Self::default()
        }
    }

    /// Add a key file.
    #[must_use]
    pub fn with_key_file(mut self, key_file: FileReference) -> Self {
        self.key_file = Some(key_file);
        self
    }

    /// Add a hardware key.
    #[must_use]
    pub fn with_hardware_key(mut self, descriptor: HardwareKeyDescriptor) -> Self {
        self.hardware_key = Some(descriptor);
        self
    }
}

/// One unlock request.
pub struct UnlockRequest {
    /// Database to open.
    pub file: FileReference,
    /// Entered credentials; `None` to rely on the remembered key.
    pub credentials: Option<Credentials>,
    /// Answers hardware key challenges. Wrap slow devices in a
    /// `TimeoutChallengeHandler`.
    pub challenge_handler: Option<Arc<dyn ChallengeHandler>>,
    /// Flags requested by the caller, e.g. read-only.
    pub status: DatabaseStatus,
    /// Remember the composite key after success.
    pub remember_key: bool,
}

impl UnlockRequest {
    /// Request for `file` with no credentials.
    #[must_use]
    pub fn new(file: FileReference) -> Self {
        Self {
            file,
            credentials: None,
            challenge_handler: None,
            status: DatabaseStatus::default(),
            remember_key: false,
        }
    }

    /// Use `credentials`.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Use `handler` for hardware key challenges.
    #[must_use]
    pub fn with_challenge_handler(mut self, handler: Arc<dyn ChallengeHandler>) -> Self {
        self.challenge_handler = Some(handler);
        self
    }

    /// Remember the key after a successful unlock.
    #[must_use]
    pub fn remembering_key(mut self) -> Self {
        self.remember_key = true;
        self
    }
}

impl fmt::Debug for UnlockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockRequest")
            .field("file", &self.file)
            .field("has_credentials", &self.credentials.is_some())
            .field("has_challenge_handler", &self.challenge_handler.is_some())
            .field("status", &self.status)
            .field("remember_key", &self.remember_key)
            .finish()
    }
}

/// Decisions the engine delegates to its caller.
pub trait UnlockPolicy: Send + Sync {
    /// Whether a remembered key may be used without asking the user.
    fn should_auto_unlock(&self, file: &FileReference) -> bool;

    /// What to do when `file` cannot be reached.
    fn choose_fallback_strategy(
        &self,
        file: &FileReference,
        has_fallback_copy: bool,
    ) -> FallbackStrategy;
}

/// Fixed answers, for non-interactive callers.
#[derive(Debug, Clone, Copy)]
pub struct StaticPolicy {
    /// Answer to [`UnlockPolicy::should_auto_unlock`].
    pub auto_unlock: bool,
    /// Answer to [`UnlockPolicy::choose_fallback_strategy`].
    pub fallback: FallbackStrategy,
}

impl Default for StaticPolicy {
    fn default() -> Self {
        Self {
            auto_unlock: true,
            fallback: FallbackStrategy::ShowError,
        }
    }
}

impl UnlockPolicy for StaticPolicy {
    fn should_auto_unlock(&self, _file: &FileReference) -> bool {
        self.auto_unlock
    }

    fn choose_fallback_strategy(
        &self,
        _file: &FileReference,
        _has_fallback_copy: bool,
    ) -> FallbackStrategy {
        self.fallback
    }
}

// ── Engine ─────────────────────────────────────────────────────────

/// Collaborators injected into the engine.
pub struct EngineDeps {
    /// Reads database and key files.
    pub provider: Arc<dyn FileProvider>,
    /// Per-file settings.
    pub settings: Arc<dyn SettingsStore>,
    /// Local fallback copies.
    pub fallback: Arc<dyn FallbackStore>,
    /// Engine-wide configuration.
    pub config: EngineConfig,
}

struct Inner {
    deps: EngineDeps,
    busy: AtomicBool,
    current: Mutex<Option<CancellationToken>>,
}

/// Serializes unlock attempts and runs the state machine.
///
/// Cloning is cheap; clones share the in-flight slot.
#[derive(Clone)]
pub struct UnlockEngine {
    inner: Arc<Inner>,
}

/// Handle to an attempt started with [`UnlockEngine::start`].
#[derive(Debug)]
pub struct UnlockHandle {
    worker: JoinHandle<()>,
    cancel: CancellationToken,
}

impl UnlockHandle {
    /// Ask the attempt to stop. It ends with [`UnlockError::CancelledByUser`].
    pub fn cancel(&self, reason: CancelReason) {
        self.cancel.cancel(reason);
    }

    /// Whether the worker has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the worker. Returns `false` if it panicked.
    pub fn join(self) -> bool {
        self.worker.join().is_ok()
    }
}

/// Releases the in-flight slot when dropped.
struct BusyGuard {
    inner: Arc<Inner>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if let Ok(mut current) = self.inner.current.lock() {
            *current = None;
        }
        self.inner.busy.store(false, Ordering::Release);
    }
}

impl UnlockEngine {
    /// Build an engine around its collaborators.
    #[must_use]
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                busy: AtomicBool::new(false),
                current: Mutex::new(None),
            }),
        }
    }

    /// Whether an attempt is in flight.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    /// Cancel the in-flight attempt, if any.
    pub fn cancel(&self, reason: CancelReason) {
        if let Ok(current) = self.inner.current.lock() {
            if let Some(token) = current.as_ref() {
                tracing::info!(?reason, "cancelling unlock");
                token.cancel(reason);
            }
        }
    }

    fn acquire(&self) -> Result<(BusyGuard, CancellationToken), AttemptInFlight> {
        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("unlock rejected: another attempt is in flight");
            return Err(AttemptInFlight);
        }
        let guard = BusyGuard {
            inner: Arc::clone(&self.inner),
        };
        let token = CancellationToken::new();
        if let Ok(mut current) = self.inner.current.lock() {
            *current = Some(token.clone());
        }
        Ok((guard, token))
    }

    /// Run `request` on the calling thread.
    ///
    /// Lifecycle and progress events go to `events`; the outcome is returned
    /// instead of being sent as a terminal event.
    ///
    /// # Errors
    ///
    /// Returns [`AttemptInFlight`] if another attempt is running.
    pub fn unlock_blocking(
        &self,
        request: UnlockRequest,
        policy: &dyn UnlockPolicy,
        events: &Sender<UnlockEvent>,
    ) -> Result<UnlockOutcome, AttemptInFlight> {
        let (guard, cancel) = self.acquire()?;
        let outcome = self.inner.run(request, policy, &cancel, events);
        drop(guard);
        Ok(outcome)
    }

    /// Run `request` on a worker thread.
    ///
    /// Every event, ending with exactly one `DidSucceed` or `DidFail`, goes to
    /// `events`. The engine is idle again before the terminal event is sent.
    ///
    /// # Errors
    ///
    /// - [`StartError::InFlight`] if another attempt is running
    /// - [`StartError::Spawn`] if the worker thread cannot be created
    pub fn start(
        &self,
        request: UnlockRequest,
        policy: Arc<dyn UnlockPolicy>,
        events: Sender<UnlockEvent>,
    ) -> Result<UnlockHandle, StartError> {
        let (guard, cancel) = self.acquire()?;
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let worker = std::thread::Builder::new()
            .name("latchkey-unlock".into())
            .spawn(move || {
                let outcome = inner.run(request, policy.as_ref(), &cancel, &events);
                drop(guard);
                emit(&events, UnlockEvent::from(outcome));
            })?;
        Ok(UnlockHandle {
            worker,
            cancel: token,
        })
    }
}

fn emit(events: &Sender<UnlockEvent>, event: UnlockEvent) {
    if events.send(event).is_err() {
        tracing::trace!("event receiver dropped");
    }
}

// ── State machine ──────────────────────────────────────────────────

/// Successful attempt plus the raw bytes, kept for the fallback copy.
struct Loaded {
    decoded: Decoded,
    bytes: Vec<u8>,
}

impl Inner {
    fn run(
        &self,
        request: UnlockRequest,
        policy: &dyn UnlockPolicy,
        cancel: &CancellationToken,
        events: &Sender<UnlockEvent>,
    ) -> UnlockOutcome {
        emit(events, UnlockEvent::WillUnlock);
        let mut file = request.file.clone();
        let settings = self.deps.settings.get(&file).unwrap_or_default();
        let timeout = settings
            .fallback_timeout_ms
            .map_or_else(|| self.deps.config.default_fallback_timeout(), Duration::from_millis);
        tracing::info!(file = %file.display_name, "unlock requested");

        let remembered = settings
            .master_key
            .as_ref()
            .filter(|_| policy.should_auto_unlock(&file));
        let (mut key, mut attempt) = match remembered.map(CompositeKey::from_stored) {
            Some(Ok(key)) => (key, AttemptKind::Fast),
            Some(Err(err)) => {
                tracing::warn!("remembered key is unusable, forgetting it: {err}");
                self.clear_master_key(&file);
                (self.compose(&request, &settings, timeout)?, AttemptKind::Slow)
            }
            None => (self.compose(&request, &settings, timeout)?, AttemptKind::Slow),
        };
        let mut key_from_store = attempt == AttemptKind::Fast;

        loop {
            let used_cached_keys = key.has_final_keys();
            tracing::info!(?attempt, cached = used_cached_keys, "attempt started");
            emit(events, UnlockEvent::AttemptStarted(attempt));

            let result = self.attempt(&mut file, attempt, &mut key, &request, timeout, cancel, events);
            match result {
                Ok(loaded) => {
                    return Ok(self.succeed(file, &request, &settings, &key, attempt, loaded));
                }
                Err(UnlockError::InvalidKey(detail))
                    if attempt == AttemptKind::Fast && used_cached_keys =>
                {
                    tracing::warn!(
                        "remembered key rejected ({detail}), retrying with full derivation"
                    );
                    self.clear_master_key(&file);
                    if request.credentials.is_some() {
                        key = self.compose(&request, &settings, timeout)?;
                        key_from_store = false;
                    } else {
                        key.erase_final_keys();
                    }
                    attempt = AttemptKind::Slow;
                }
                Err(UnlockError::DatabaseUnreachable(err)) if attempt != AttemptKind::Fallback => {
                    let has_copy = self.deps.fallback.has_copy(&file);
                    let requested = policy.choose_fallback_strategy(&file, has_copy);
                    match fallback::resolve(requested, has_copy) {
                        FallbackStrategy::UseCache => {
                            tracing::warn!(error = %err, "database unreachable, opening local copy");
                            attempt = AttemptKind::Fallback;
                        }
                        FallbackStrategy::ShowError => {
                            tracing::info!(error = %err, "database unreachable, no fallback");
                            return Err(UnlockError::DatabaseUnreachable(err));
                        }
                    }
                }
                Err(err) => {
                    match &err {
                        UnlockError::CancelledByUser => self.clear_master_key(&file),
                        UnlockError::InvalidKey(_) if key_from_store => {
                            self.clear_master_key(&file);
                        }
                        _ => {}
                    }
                    tracing::info!(?attempt, error = %err, "unlock failed");
                    return Err(err);
                }
            }
        }
    }

    /// Build a key from the entered credentials, filling in associated
    /// factors from `settings`.
    fn compose(
        &self,
        request: &UnlockRequest,
        settings: &DatabaseSettings,
        timeout: Duration,
    ) -> Result<CompositeKey, UnlockError> {
        let credentials = request
            .credentials
            .as_ref()
            .ok_or_else(|| UnlockError::InvalidKey("no credentials entered".into()))?;
        let key_file = credentials
            .key_file
            .as_ref()
            .or(settings.associated_key_file.as_ref());
        let key_file_bytes = match key_file {
            Some(reference) => Some(Zeroizing::new(
                self.deps
                    .provider
                    .fetch(reference, timeout)
                    .map_err(|e| UnlockError::KeyFileUnreadable(e.to_string()))?,
            )),
            None => None,
        };
        let hardware_key = credentials
            .hardware_key
            .or(settings.associated_hardware_key);
        Ok(compose(
            credentials.password.as_ref().map(|p| p.expose_secret()),
            key_file_bytes.as_ref().map(|bytes| bytes.as_slice()),
            hardware_key,
        )?)
    }

    /// Fetch the bytes for `attempt` and decode them.
    #[allow(clippy::too_many_arguments)]
    fn attempt(
        &self,
        file: &mut FileReference,
        attempt: AttemptKind,
        key: &mut CompositeKey,
        request: &UnlockRequest,
        timeout: Duration,
        cancel: &CancellationToken,
        events: &Sender<UnlockEvent>,
    ) -> Result<Loaded, UnlockError> {
        cancel.check()?;
        let fetched = if attempt == AttemptKind::Fallback {
            self.deps.fallback.load(file)
        } else {
            let fetched = self.deps.provider.fetch(file, timeout);
            file.record_access(fetched.as_ref().map(|_| ()));
            fetched
        };
        let bytes = fetched.map_err(UnlockError::DatabaseUnreachable)?;
        cancel.check()?;

        let mut sink =
            |fraction: f32| emit(events, UnlockEvent::ProgressChanged { attempt, fraction });
        let mut progress = ProgressReporter::new(&mut sink);
        let decoded = container::decode(
            &bytes,
            key,
            request.challenge_handler.as_deref(),
            cancel,
            &mut progress,
        )?;
        Ok(Loaded { decoded, bytes })
    }

    fn succeed(
        &self,
        file: FileReference,
        request: &UnlockRequest,
        settings: &DatabaseSettings,
        key: &CompositeKey,
        attempt: AttemptKind,
        loaded: Loaded,
    ) -> UnlockedDatabase {
        let config = &self.deps.config;
        let store_key =
            config.remember_master_keys && (request.remember_key || settings.has_master_key());
        let credentials = request.credentials.as_ref();
        let key_file = credentials
            .and_then(|c| c.key_file.clone())
            .filter(|_| config.remember_key_files);
        let hardware_key = credentials
            .and_then(|c| c.hardware_key)
            .filter(|_| config.remember_hardware_keys);

        let stored = store_key.then(|| key.to_stored());
        let result = self.deps.settings.update(&file, &mut |s: &mut DatabaseSettings| {
            if let Some(stored) = &stored {
                s.set_master_key(stored.clone());
            }
            if let Some(key_file) = &key_file {
                s.associated_key_file = Some(key_file.clone());
            }
            if hardware_key.is_some() {
                s.associated_hardware_key = hardware_key;
            }
        });
        if let Err(err) = result {
            tracing::warn!("failed to save database settings: {err}");
        }

        if attempt != AttemptKind::Fallback && config.update_fallback_copy {
            if let Err(err) = self.deps.fallback.save(&file, &loaded.bytes) {
                tracing::warn!("failed to refresh fallback copy: {err}");
            }
        }

        let local_fallback = attempt == AttemptKind::Fallback;
        let status = DatabaseStatus {
            read_only: request.status.read_only || settings.read_only || local_fallback,
            local_fallback: request.status.local_fallback || local_fallback,
        };
        let Decoded {
            database,
            warnings,
            generation,
        } = loaded.decoded;
        tracing::info!(
            ?attempt,
            ?generation,
            warnings = warnings.len(),
            remembered = store_key,
            "unlock succeeded"
        );
        UnlockedDatabase {
            database,
            warnings,
            status,
            attempt,
            generation,
            file,
        }
    }

    fn clear_master_key(&self, file: &FileReference) {
        let result = self
            .deps
            .settings
            .update(file, &mut DatabaseSettings::clear_master_key);
        if let Err(err) = result {
            tracing::warn!("failed to clear remembered key: {err}");
        }
    }
}
