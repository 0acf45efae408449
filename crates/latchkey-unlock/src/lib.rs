//! `latchkey-unlock` — Composite-key database unlock engine.
//!
//! This crate provides:
//! - [`container`] — KDBX 3.x / 4.x decoding and encoding
//! - [`UnlockEngine`] — fast, slow and fallback attempts with progress,
//!   cancellation and typed failures
//! - [`settings`], [`fallback`], [`config`] — the stores the engine consumes
//!
//! Key material and primitives live in `latchkey-crypto-core`.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod config;
pub mod container;
pub mod database;
pub mod engine;
pub mod error;
pub mod events;
pub mod fallback;
pub mod file_ref;
pub mod progress;
pub mod settings;

pub use config::EngineConfig;
pub use container::{decode, encode, ContainerSettings, Decoded, Generation};
pub use database::{Binary, Database, Entry, Field, FieldValue, Group, LoadWarning, Meta};
pub use engine::{
    Credentials, EngineDeps, StaticPolicy, UnlockEngine, UnlockHandle, UnlockPolicy,
    UnlockRequest,
};
pub use error::{AttemptInFlight, FailureReason, SaveError, StartError, UnlockError};
pub use events::{AttemptKind, DatabaseStatus, UnlockEvent, UnlockOutcome, UnlockedDatabase};
pub use fallback::{resolve, DirectoryFallbackStore, FallbackStore, FallbackStrategy};
pub use file_ref::{
    FileAccessError, FileAccessErrorKind, FileLocation, FileProvider, FileReference,
    LocalFileProvider,
};
pub use progress::ProgressReporter;
pub use settings::{DatabaseSettings, JsonSettingsStore, MemorySettingsStore, SettingsStore};
