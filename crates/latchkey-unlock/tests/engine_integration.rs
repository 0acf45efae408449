#![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

//! Integration tests for the unlock state machine: fast, slow and fallback
//! attempts against real container files in a temp directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use latchkey_crypto_core::{
    compose, Argon2Variant, CancelReason, HardwareKeyDescriptor, HardwareKeyKind, KdfParams,
    OuterCipher, SoftwareHmacKey,
};
use latchkey_unlock::database::{PASSWORD, TITLE};
use latchkey_unlock::{
    encode, AttemptKind, ContainerSettings, Credentials, Database, DatabaseSettings,
    DirectoryFallbackStore, EngineConfig, EngineDeps, Entry, FallbackStore, FallbackStrategy,
    FieldValue, FileAccessError, FileAccessErrorKind, FileProvider, FileReference, Generation,
    JsonSettingsStore, LocalFileProvider, MemorySettingsStore, SettingsStore, StartError,
    StaticPolicy, UnlockEngine, UnlockError, UnlockEvent, UnlockPolicy, UnlockRequest,
    UnlockedDatabase,
};
use secrecy::SecretString;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

const ROUNDS: u64 = 200;

fn cheap_settings(generation: Generation) -> ContainerSettings {
    ContainerSettings {
        generation,
        cipher: OuterCipher::Aes256Cbc,
        kdf: KdfParams::aes_kdf(ROUNDS),
        compress: true,
    }
}

fn sample_database() -> Database {
    let mut db = Database::new("Personal");
    let mut entry = Entry::new();
    entry.set(TITLE, FieldValue::Plain("Mail".into()));
    entry.set(
        PASSWORD,
        FieldValue::Protected(SecretString::from("hunter2".to_owned())),
    );
    db.root.entries.push(entry);
    db
}

/// Write a container protected by `password` (and optionally more factors).
fn write_database(
    path: &Path,
    generation: Generation,
    password: &str,
    key_file: Option<&[u8]>,
    hardware: Option<(HardwareKeyDescriptor, &SoftwareHmacKey)>,
) {
    let mut key = compose(Some(password), key_file, hardware.map(|(d, _)| d)).unwrap();
    let handler = hardware.map(|(_, h)| h as &dyn latchkey_crypto_core::ChallengeHandler);
    let bytes = encode(
        &sample_database(),
        &mut key,
        &cheap_settings(generation),
        handler,
        &latchkey_crypto_core::CancellationToken::new(),
    )
    .unwrap();
    std::fs::write(path, bytes).unwrap();
}

/// Provider that can be switched off to simulate a network drop.
struct FlakyProvider {
    inner: LocalFileProvider,
    down: AtomicBool,
    fetches: AtomicUsize,
}

impl FlakyProvider {
    fn new() -> Self {
        Self {
            inner: LocalFileProvider::new(),
            down: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

impl FileProvider for FlakyProvider {
    fn fetch(&self, file: &FileReference, timeout: Duration) -> Result<Vec<u8>, FileAccessError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(FileAccessError::timeout("network unreachable"));
        }
        self.inner.fetch(file, timeout)
    }
}

/// Policy that records what it was asked.
struct RecordingPolicy {
    auto_unlock: bool,
    fallback: FallbackStrategy,
    fallback_queries: Mutex<Vec<bool>>,
}

impl RecordingPolicy {
    fn new(auto_unlock: bool, fallback: FallbackStrategy) -> Self {
        Self {
            auto_unlock,
            fallback,
            fallback_queries: Mutex::new(Vec::new()),
        }
    }
}

impl UnlockPolicy for RecordingPolicy {
    fn should_auto_unlock(&self, _file: &FileReference) -> bool {
        self.auto_unlock
    }

    fn choose_fallback_strategy(
        &self,
        _file: &FileReference,
        has_fallback_copy: bool,
    ) -> FallbackStrategy {
        self.fallback_queries.lock().unwrap().push(has_fallback_copy);
        self.fallback
    }
}

struct Fixture {
    dir: TempDir,
    provider: Arc<FlakyProvider>,
    settings: Arc<MemorySettingsStore>,
    fallback: Arc<DirectoryFallbackStore>,
    engine: UnlockEngine,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    fn with_config(config: EngineConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FlakyProvider::new());
        let settings = Arc::new(MemorySettingsStore::new());
        std::fs::create_dir_all(dir.path().join("fallback")).unwrap();
        let fallback = Arc::new(DirectoryFallbackStore::new(dir.path().join("fallback")));
        let engine = UnlockEngine::new(EngineDeps {
            provider: provider.clone(),
            settings: settings.clone(),
            fallback: fallback.clone(),
            config,
        });
        Self {
            dir,
            provider,
            settings,
            fallback,
            engine,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn file(&self) -> FileReference {
        FileReference::local(self.path("db.kdbx"))
    }

    fn unlock(
        &self,
        request: UnlockRequest,
        policy: &dyn UnlockPolicy,
    ) -> (Result<UnlockedDatabase, UnlockError>, Vec<UnlockEvent>) {
        let (tx, rx) = mpsc::channel();
        let outcome = self.engine.unlock_blocking(request, policy, &tx).unwrap();
        drop(tx);
        (outcome, rx.into_iter().collect())
    }
}

fn attempts(events: &[UnlockEvent]) -> Vec<AttemptKind> {
    events
        .iter()
        .filter_map(|e| match e {
            UnlockEvent::AttemptStarted(kind) => Some(*kind),
            _ => None,
        })
        .collect()
}

fn with_password(file: FileReference, password: &str) -> UnlockRequest {
    UnlockRequest::new(file).with_credentials(Credentials::password(password))
}

fn auto() -> StaticPolicy {
    StaticPolicy::default()
}

/// Inflate the AES-KDF round count of a legacy container so derivation
/// runs until cancelled. The legacy header is not checksummed before the
/// KDF runs.
fn make_derivation_endless(path: &Path) {
    let mut bytes = std::fs::read(path).unwrap();
    let mut needle = vec![6u8, 8, 0];
    needle.extend_from_slice(&ROUNDS.to_le_bytes());
    let at = bytes.windows(needle.len()).position(|w| w == needle).unwrap() + 3;
    bytes[at..at + 8].copy_from_slice(&(1u64 << 40).to_le_bytes());
    std::fs::write(path, bytes).unwrap();
}

/// Write a modern Argon2d container, then raise its pass count so
/// derivation runs until cancelled. The header checksum is recomputed so
/// the file still passes the pre-KDF integrity check.
fn write_endless_argon2_database(path: &Path, password: &str) {
    let settings = ContainerSettings {
        generation: Generation::Modern,
        cipher: OuterCipher::ChaCha20,
        kdf: KdfParams::argon2(Argon2Variant::Argon2d, 1 << 20, 1, 1),
        compress: true,
    };
    let mut key = compose(Some(password), None, None).unwrap();
    let mut bytes = encode(
        &sample_database(),
        &mut key,
        &settings,
        None,
        &latchkey_crypto_core::CancellationToken::new(),
    )
    .unwrap();

    let mut needle = vec![0x05, 1, 0, 0, 0, b'I', 8, 0, 0, 0];
    needle.extend_from_slice(&1u64.to_le_bytes());
    let at = bytes.windows(needle.len()).position(|w| w == needle).unwrap() + 10;
    bytes[at..at + 8].copy_from_slice(&(1u64 << 20).to_le_bytes());

    let end = [0u8, 4, 0, 0, 0, b'\r', b'\n', b'\r', b'\n'];
    let header_len = bytes.windows(end.len()).position(|w| w == end).unwrap() + end.len();
    let checksum = Sha256::digest(&bytes[..header_len]);
    bytes[header_len..header_len + 32].copy_from_slice(&checksum);
    std::fs::write(path, bytes).unwrap();
}

fn wait_for_progress(rx: &Receiver<UnlockEvent>) {
    wait_for_progress_above(rx, -1.0);
}

fn wait_for_progress_above(rx: &Receiver<UnlockEvent>, floor: f32) {
    loop {
        match rx.recv_timeout(Duration::from_secs(30)).unwrap() {
            UnlockEvent::ProgressChanged { fraction, .. } if fraction > floor => return,
            event => assert!(!event.is_terminal(), "finished early: {event:?}"),
        }
    }
}

fn drain_to_terminal(rx: &Receiver<UnlockEvent>) -> UnlockEvent {
    loop {
        let event = rx.recv_timeout(Duration::from_secs(30)).unwrap();
        if event.is_terminal() {
            return event;
        }
    }
}

// ---------------------------------------------------------------------------
// Slow path
// ---------------------------------------------------------------------------

#[test]
fn password_unlock_succeeds_with_no_warnings() {
    let fx = Fixture::new();
    write_database(&fx.path("db.kdbx"), Generation::Modern, "correct", None, None);

    let (outcome, events) = fx.unlock(with_password(fx.file(), "correct"), &auto());
    let unlocked = outcome.unwrap();
    assert!(unlocked.warnings.is_empty());
    assert_eq!(unlocked.attempt, AttemptKind::Slow);
    assert_eq!(unlocked.database.root.entries[0].title(), "Mail");
    assert!(!unlocked.status.local_fallback);
    assert!(!unlocked.status.read_only);

    assert!(matches!(events.first(), Some(UnlockEvent::WillUnlock)));
    assert_eq!(attempts(&events), vec![AttemptKind::Slow]);
    let fractions: Vec<f32> = events
        .iter()
        .filter_map(|e| match e {
            UnlockEvent::ProgressChanged { fraction, .. } => Some(*fraction),
            _ => None,
        })
        .collect();
    assert!(fractions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(fractions.last().copied(), Some(1.0));
    // Blocking unlocks return the outcome instead of sending it.
    assert!(!events.iter().any(UnlockEvent::is_terminal));
    assert!(!fx.engine.is_busy());
}

#[test]
fn legacy_container_unlocks_too() {
    let fx = Fixture::new();
    write_database(&fx.path("db.kdbx"), Generation::Legacy, "correct", None, None);
    let (outcome, _) = fx.unlock(with_password(fx.file(), "correct"), &auto());
    assert_eq!(outcome.unwrap().generation, Generation::Legacy);
}

#[test]
fn wrong_password_fails_after_a_single_attempt() {
    let fx = Fixture::new();
    write_database(&fx.path("db.kdbx"), Generation::Modern, "correct", None, None);

    let (outcome, events) = fx.unlock(with_password(fx.file(), "wrong"), &auto());
    assert!(matches!(outcome, Err(UnlockError::InvalidKey(_))));
    assert_eq!(attempts(&events), vec![AttemptKind::Slow]);
    assert!(!fx.settings.get(&fx.file()).unwrap_or_default().has_master_key());
}

#[test]
fn no_credentials_and_nothing_remembered_is_invalid_key() {
    let fx = Fixture::new();
    write_database(&fx.path("db.kdbx"), Generation::Modern, "correct", None, None);
    let (outcome, events) = fx.unlock(UnlockRequest::new(fx.file()), &auto());
    assert!(matches!(outcome, Err(UnlockError::InvalidKey(_))));
    assert!(attempts(&events).is_empty());
}

#[test]
fn read_only_setting_is_applied_to_status() {
    let fx = Fixture::new();
    write_database(&fx.path("db.kdbx"), Generation::Modern, "correct", None, None);
    fx.settings
        .update(&fx.file(), &mut |s: &mut DatabaseSettings| s.read_only = true)
        .unwrap();
    let (outcome, _) = fx.unlock(with_password(fx.file(), "correct"), &auto());
    assert!(outcome.unwrap().status.read_only);
}

// ---------------------------------------------------------------------------
// Fast path
// ---------------------------------------------------------------------------

#[test]
fn remembered_key_opens_on_the_fast_path() {
    let fx = Fixture::new();
    write_database(&fx.path("db.kdbx"), Generation::Modern, "correct", None, None);

    let (first, _) = fx.unlock(
        with_password(fx.file(), "correct").remembering_key(),
        &auto(),
    );
    first.unwrap();
    let stored = fx.settings.get(&fx.file()).unwrap().master_key.unwrap();
    assert!(stored.has_final_keys());

    let (second, events) = fx.unlock(UnlockRequest::new(fx.file()), &auto());
    assert_eq!(second.unwrap().attempt, AttemptKind::Fast);
    assert_eq!(attempts(&events), vec![AttemptKind::Fast]);
}

#[test]
fn key_is_not_remembered_unless_asked() {
    let fx = Fixture::new();
    write_database(&fx.path("db.kdbx"), Generation::Modern, "correct", None, None);
    let (outcome, _) = fx.unlock(with_password(fx.file(), "correct"), &auto());
    outcome.unwrap();
    assert!(!fx.settings.get(&fx.file()).unwrap().has_master_key());
}

#[test]
fn remembering_can_be_disabled_by_config() {
    let fx = Fixture::with_config(EngineConfig {
        remember_master_keys: false,
        ..EngineConfig::default()
    });
    write_database(&fx.path("db.kdbx"), Generation::Modern, "correct", None, None);
    let (outcome, _) = fx.unlock(
        with_password(fx.file(), "correct").remembering_key(),
        &auto(),
    );
    outcome.unwrap();
    assert!(!fx.settings.get(&fx.file()).unwrap().has_master_key());
}

#[test]
fn auto_unlock_refusal_skips_the_fast_path() {
    let fx = Fixture::new();
    write_database(&fx.path("db.kdbx"), Generation::Modern, "correct", None, None);
    let (first, _) = fx.unlock(
        with_password(fx.file(), "correct").remembering_key(),
        &auto(),
    );
    first.unwrap();

    let policy = RecordingPolicy::new(false, FallbackStrategy::ShowError);
    let (outcome, events) = fx.unlock(with_password(fx.file(), "correct"), &policy);
    assert_eq!(outcome.unwrap().attempt, AttemptKind::Slow);
    assert_eq!(attempts(&events), vec![AttemptKind::Slow]);
}

#[test]
fn stale_remembered_key_retries_once_with_the_new_password() {
    let fx = Fixture::new();
    let path = fx.path("db.kdbx");
    write_database(&path, Generation::Modern, "old", None, None);
    let (first, _) = fx.unlock(with_password(fx.file(), "old").remembering_key(), &auto());
    first.unwrap();
    let old_key = fx.settings.get(&fx.file()).unwrap().master_key.unwrap();

    // Another device changed the password.
    write_database(&path, Generation::Modern, "new", None, None);

    let (outcome, events) = fx.unlock(with_password(fx.file(), "new"), &auto());
    let unlocked = outcome.unwrap();
    assert_eq!(unlocked.attempt, AttemptKind::Slow);
    assert_eq!(attempts(&events), vec![AttemptKind::Fast, AttemptKind::Slow]);

    // The user had opted in, so the new key replaces the stale one.
    let new_key = fx.settings.get(&fx.file()).unwrap().master_key.unwrap();
    assert_ne!(new_key, old_key);
}

#[test]
fn stale_remembered_key_without_credentials_fails_after_one_retry() {
    let fx = Fixture::new();
    let path = fx.path("db.kdbx");
    write_database(&path, Generation::Modern, "old", None, None);
    let (first, _) = fx.unlock(with_password(fx.file(), "old").remembering_key(), &auto());
    first.unwrap();
    write_database(&path, Generation::Modern, "new", None, None);

    let (outcome, events) = fx.unlock(UnlockRequest::new(fx.file()), &auto());
    assert!(matches!(outcome, Err(UnlockError::InvalidKey(_))));
    assert_eq!(attempts(&events), vec![AttemptKind::Fast, AttemptKind::Slow]);
    assert!(!fx.settings.get(&fx.file()).unwrap().has_master_key());
}

#[test]
fn resave_with_same_password_is_recovered_by_rederivation() {
    // Same password, new seeds: the cached final keys are stale but the
    // remembered components are still right.
    let fx = Fixture::new();
    let path = fx.path("db.kdbx");
    write_database(&path, Generation::Modern, "same", None, None);
    let (first, _) = fx.unlock(with_password(fx.file(), "same").remembering_key(), &auto());
    first.unwrap();
    write_database(&path, Generation::Modern, "same", None, None);

    let (outcome, events) = fx.unlock(UnlockRequest::new(fx.file()), &auto());
    assert_eq!(outcome.unwrap().attempt, AttemptKind::Slow);
    assert_eq!(attempts(&events), vec![AttemptKind::Fast, AttemptKind::Slow]);
    // Remembered again with fresh final keys.
    assert!(fx.settings.get(&fx.file()).unwrap().has_master_key());
}

#[test]
fn remembered_key_survives_a_restart_with_json_settings() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("db.kdbx");
    write_database(&db_path, Generation::Modern, "correct", None, None);
    let file = FileReference::local(&db_path);

    let engine_at = |state: &Path| {
        UnlockEngine::new(EngineDeps {
            provider: Arc::new(LocalFileProvider::new()),
            settings: Arc::new(JsonSettingsStore::open(state)),
            fallback: Arc::new(DirectoryFallbackStore::new(state.join("fallback"))),
            config: EngineConfig::default(),
        })
    };
    let state = dir.path().join("state");
    std::fs::create_dir_all(&state).unwrap();

    let (tx, _rx) = mpsc::channel();
    engine_at(state.as_path())
        .unlock_blocking(with_password(file.clone(), "correct").remembering_key(), &auto(), &tx)
        .unwrap()
        .unwrap();

    let reopened = engine_at(state.as_path())
        .unlock_blocking(UnlockRequest::new(file), &auto(), &tx)
        .unwrap()
        .unwrap();
    assert_eq!(reopened.attempt, AttemptKind::Fast);
}

// ---------------------------------------------------------------------------
// Fallback
// ---------------------------------------------------------------------------

#[test]
fn unreachable_database_opens_local_copy_when_policy_allows() {
    let fx = Fixture::new();
    write_database(&fx.path("db.kdbx"), Generation::Modern, "correct", None, None);
    let (first, _) = fx.unlock(with_password(fx.file(), "correct"), &auto());
    first.unwrap();
    assert!(fx.fallback.has_copy(&fx.file()));

    fx.provider.set_down(true);
    let policy = RecordingPolicy::new(true, FallbackStrategy::UseCache);
    let (outcome, events) = fx.unlock(with_password(fx.file(), "correct"), &policy);
    let unlocked = outcome.unwrap();
    assert_eq!(unlocked.attempt, AttemptKind::Fallback);
    assert!(unlocked.status.local_fallback);
    assert!(unlocked.status.read_only);
    assert_eq!(unlocked.database.root.entries[0].title(), "Mail");
    assert_eq!(attempts(&events), vec![AttemptKind::Slow, AttemptKind::Fallback]);
    assert_eq!(*policy.fallback_queries.lock().unwrap(), vec![true]);
    assert!(unlocked.file.last_error.as_ref().unwrap().is_timeout());
}

#[test]
fn unreachable_database_without_copy_reports_error_despite_use_cache() {
    let fx = Fixture::new();
    write_database(&fx.path("db.kdbx"), Generation::Modern, "correct", None, None);
    fx.provider.set_down(true);

    let policy = RecordingPolicy::new(true, FallbackStrategy::UseCache);
    let (outcome, events) = fx.unlock(with_password(fx.file(), "correct"), &policy);
    match outcome {
        Err(UnlockError::DatabaseUnreachable(err)) => assert!(err.is_timeout()),
        other => panic!("expected unreachable, got {other:?}"),
    }
    assert_eq!(*policy.fallback_queries.lock().unwrap(), vec![false]);
    assert_eq!(attempts(&events), vec![AttemptKind::Slow]);
}

#[test]
fn show_error_policy_never_opens_the_copy() {
    let fx = Fixture::new();
    write_database(&fx.path("db.kdbx"), Generation::Modern, "correct", None, None);
    let (first, _) = fx.unlock(with_password(fx.file(), "correct"), &auto());
    first.unwrap();

    fx.provider.set_down(true);
    let (outcome, events) = fx.unlock(with_password(fx.file(), "correct"), &auto());
    assert!(matches!(outcome, Err(UnlockError::DatabaseUnreachable(_))));
    assert_eq!(attempts(&events), vec![AttemptKind::Slow]);
}

/// Fallback store whose copy is always missing at load time.
struct VanishingFallback;

impl FallbackStore for VanishingFallback {
    fn has_copy(&self, _file: &FileReference) -> bool {
        true
    }

    fn load(&self, _file: &FileReference) -> Result<Vec<u8>, FileAccessError> {
        Err(FileAccessError::new(FileAccessErrorKind::NotFound, "copy vanished"))
    }

    fn save(&self, _file: &FileReference, _bytes: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn fallback_is_attempted_at_most_once() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(FlakyProvider::new());
    provider.set_down(true);
    let engine = UnlockEngine::new(EngineDeps {
        provider,
        settings: Arc::new(MemorySettingsStore::new()),
        fallback: Arc::new(VanishingFallback),
        config: EngineConfig::default(),
    });
    let policy = RecordingPolicy::new(true, FallbackStrategy::UseCache);
    let (tx, rx) = mpsc::channel();
    let outcome = engine
        .unlock_blocking(
            with_password(FileReference::local(dir.path().join("db.kdbx")), "pw"),
            &policy,
            &tx,
        )
        .unwrap();
    drop(tx);
    let events: Vec<UnlockEvent> = rx.into_iter().collect();

    match outcome {
        Err(UnlockError::DatabaseUnreachable(err)) => {
            assert_eq!(err.kind, FileAccessErrorKind::NotFound);
        }
        other => panic!("expected unreachable, got {other:?}"),
    }
    assert_eq!(attempts(&events), vec![AttemptKind::Slow, AttemptKind::Fallback]);
    assert_eq!(policy.fallback_queries.lock().unwrap().len(), 1);
}

#[test]
fn fallback_copy_is_not_refreshed_when_disabled() {
    let fx = Fixture::with_config(EngineConfig {
        update_fallback_copy: false,
        ..EngineConfig::default()
    });
    write_database(&fx.path("db.kdbx"), Generation::Modern, "correct", None, None);
    let (outcome, _) = fx.unlock(with_password(fx.file(), "correct"), &auto());
    outcome.unwrap();
    assert!(!fx.fallback.has_copy(&fx.file()));
}

// ---------------------------------------------------------------------------
// Key files and hardware keys
// ---------------------------------------------------------------------------

#[test]
fn key_file_is_associated_and_reused() {
    let fx = Fixture::new();
    let key_file = [0x42u8; 32];
    std::fs::write(fx.path("key.bin"), key_file).unwrap();
    write_database(
        &fx.path("db.kdbx"),
        Generation::Modern,
        "correct",
        Some(&key_file),
        None,
    );

    let credentials =
        Credentials::password("correct").with_key_file(FileReference::local(fx.path("key.bin")));
    let (first, _) = fx.unlock(
        UnlockRequest::new(fx.file()).with_credentials(credentials),
        &auto(),
    );
    first.unwrap();
    assert!(fx
        .settings
        .get(&fx.file())
        .unwrap()
        .associated_key_file
        .is_some());

    // Password only: the associated key file fills in.
    let (second, _) = fx.unlock(with_password(fx.file(), "correct"), &auto());
    second.unwrap();
}

#[test]
fn unreadable_key_file_is_reported_without_fallback() {
    let fx = Fixture::new();
    write_database(&fx.path("db.kdbx"), Generation::Modern, "correct", None, None);
    let credentials =
        Credentials::password("correct").with_key_file(FileReference::local(fx.path("nope.key")));
    let policy = RecordingPolicy::new(true, FallbackStrategy::UseCache);
    let (outcome, events) = fx.unlock(
        UnlockRequest::new(fx.file()).with_credentials(credentials),
        &policy,
    );
    assert!(matches!(outcome, Err(UnlockError::KeyFileUnreadable(_))));
    assert!(attempts(&events).is_empty());
    assert!(policy.fallback_queries.lock().unwrap().is_empty());
}

#[test]
fn hardware_key_needs_a_handler() {
    let fx = Fixture::new();
    let descriptor = HardwareKeyDescriptor {
        kind: HardwareKeyKind::Usb,
        slot: 2,
    };
    let device = Arc::new(SoftwareHmacKey::new(b"yubikey slot secret"));
    write_database(
        &fx.path("db.kdbx"),
        Generation::Modern,
        "correct",
        None,
        Some((descriptor, device.as_ref())),
    );
    let credentials = || Credentials::password("correct").with_hardware_key(descriptor);

    let (missing, _) = fx.unlock(
        UnlockRequest::new(fx.file()).with_credentials(credentials()),
        &auto(),
    );
    assert_eq!(missing.unwrap_err(), UnlockError::HardwareKeyUnavailable);

    let (outcome, _) = fx.unlock(
        UnlockRequest::new(fx.file())
            .with_credentials(credentials())
            .with_challenge_handler(device),
        &auto(),
    );
    outcome.unwrap();
    assert_eq!(
        fx.settings.get(&fx.file()).unwrap().associated_hardware_key,
        Some(descriptor)
    );
}

// ---------------------------------------------------------------------------
// Background attempts and cancellation
// ---------------------------------------------------------------------------

#[test]
fn started_attempt_ends_with_one_terminal_event() {
    let fx = Fixture::new();
    write_database(&fx.path("db.kdbx"), Generation::Modern, "correct", None, None);
    let (tx, rx) = mpsc::channel();
    let handle = fx
        .engine
        .start(
            with_password(fx.file(), "correct"),
            Arc::new(auto()),
            tx,
        )
        .unwrap();
    assert!(handle.join());
    let events: Vec<UnlockEvent> = rx.into_iter().collect();
    assert!(matches!(events.first(), Some(UnlockEvent::WillUnlock)));
    assert!(matches!(events.last(), Some(UnlockEvent::DidSucceed(_))));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(!fx.engine.is_busy());
}

#[test]
fn cancellation_during_derivation_ends_in_cancelled_by_user() {
    let fx = Fixture::new();
    let path = fx.path("db.kdbx");
    write_database(&path, Generation::Legacy, "correct", None, None);
    make_derivation_endless(&path);

    // A remembered key that cancellation must clear.
    let stored = compose(Some("correct"), None, None).unwrap().to_stored();
    fx.settings
        .update(&fx.file(), &mut |s: &mut DatabaseSettings| {
            s.set_master_key(stored.clone());
        })
        .unwrap();
    let policy = Arc::new(RecordingPolicy::new(false, FallbackStrategy::UseCache));

    let (tx, rx) = mpsc::channel();
    let handle = fx
        .engine
        .start(with_password(fx.file(), "correct"), policy.clone(), tx)
        .unwrap();
    wait_for_progress(&rx);
    assert!(fx.engine.is_busy());
    fx.engine.cancel(CancelReason::UserRequest);

    let terminal = drain_to_terminal(&rx);
    assert!(matches!(
        terminal,
        UnlockEvent::DidFail(UnlockError::CancelledByUser)
    ));
    assert!(handle.join());
    assert!(!fx.engine.is_busy());
    assert!(!fx.settings.get(&fx.file()).unwrap().has_master_key());
    // Cancellation never leads to a fallback.
    assert!(policy.fallback_queries.lock().unwrap().is_empty());
}

#[test]
fn cancellation_during_argon2_derivation_ends_in_cancelled_by_user() {
    let fx = Fixture::new();
    write_endless_argon2_database(&fx.path("db.kdbx"), "correct");

    let (tx, rx) = mpsc::channel();
    let handle = fx
        .engine
        .start(with_password(fx.file(), "correct"), Arc::new(auto()), tx)
        .unwrap();
    // Past the initial report: the Argon2 waiter is polling.
    wait_for_progress_above(&rx, 0.0);
    let cancelled_at = std::time::Instant::now();
    fx.engine.cancel(CancelReason::UserRequest);

    assert!(matches!(
        drain_to_terminal(&rx),
        UnlockEvent::DidFail(UnlockError::CancelledByUser)
    ));
    assert!(cancelled_at.elapsed() < Duration::from_secs(2));
    assert!(handle.join());
    assert!(!fx.engine.is_busy());
}

#[test]
fn handle_cancel_stops_its_own_attempt() {
    let fx = Fixture::new();
    let path = fx.path("db.kdbx");
    write_database(&path, Generation::Legacy, "correct", None, None);
    make_derivation_endless(&path);

    let (tx, rx) = mpsc::channel();
    let handle = fx
        .engine
        .start(with_password(fx.file(), "correct"), Arc::new(auto()), tx)
        .unwrap();
    wait_for_progress(&rx);
    handle.cancel(CancelReason::AppBackgrounded);
    assert!(matches!(
        drain_to_terminal(&rx),
        UnlockEvent::DidFail(UnlockError::CancelledByUser)
    ));
    assert!(handle.join());
}

#[test]
fn second_request_is_rejected_while_one_is_in_flight() {
    let fx = Fixture::new();
    let path = fx.path("db.kdbx");
    write_database(&path, Generation::Legacy, "correct", None, None);
    make_derivation_endless(&path);

    let (tx, rx) = mpsc::channel();
    let handle = fx
        .engine
        .start(with_password(fx.file(), "correct"), Arc::new(auto()), tx)
        .unwrap();
    wait_for_progress(&rx);

    let (tx2, _rx2) = mpsc::channel();
    let rejected = fx
        .engine
        .unlock_blocking(with_password(fx.file(), "correct"), &auto(), &tx2);
    assert!(rejected.is_err());
    let (tx3, _rx3) = mpsc::channel();
    assert!(matches!(
        fx.engine
            .start(with_password(fx.file(), "correct"), Arc::new(auto()), tx3),
        Err(StartError::InFlight(_))
    ));

    fx.engine.cancel(CancelReason::Superseded);
    drain_to_terminal(&rx);
    assert!(handle.join());

    // The engine is reusable once idle.
    write_database(&path, Generation::Modern, "correct", None, None);
    let (outcome, _) = fx.unlock(with_password(fx.file(), "correct"), &auto());
    outcome.unwrap();
}

#[test]
fn cancel_while_idle_is_a_no_op() {
    let fx = Fixture::new();
    write_database(&fx.path("db.kdbx"), Generation::Modern, "correct", None, None);
    fx.engine.cancel(CancelReason::UserRequest);
    // Nothing in flight: cancelling is a no-op and the next request runs.
    let (outcome, _) = fx.unlock(with_password(fx.file(), "correct"), &auto());
    outcome.unwrap();
    assert_eq!(fx.provider.fetches.load(Ordering::SeqCst), 1);
}
