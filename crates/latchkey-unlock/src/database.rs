//! Decrypted database model.
//!
//! This module provides:
//! - [`Database`] — metadata plus the root [`Group`] tree
//! - [`Entry`] / [`Field`] — entries with plain and protected fields
//! - [`LoadWarning`] — non-fatal anomalies found while loading

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use uuid::Uuid;

/// Title field.
pub const TITLE: &str = "Title";
/// User name field.
pub const USERNAME: &str = "UserName";
/// Password field, protected by default.
pub const PASSWORD: &str = "Password";
/// URL field.
pub const URL: &str = "URL";
/// Notes field.
pub const NOTES: &str = "Notes";

/// Generator string written into new databases.
pub const GENERATOR: &str = "latchkey";

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Recoverable anomaly encountered while loading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadWarning {
    /// Two groups or entries share a UUID; the later one was given a new one.
    #[error("duplicate UUID {original}, reassigned to {replacement}")]
    DuplicateUuid {
        /// UUID found in the file.
        original: Uuid,
        /// UUID assigned on load.
        replacement: Uuid,
    },

    /// A group or entry had no UUID; one was generated.
    #[error("missing UUID in \"{name}\", assigned {assigned}")]
    MissingUuid {
        /// Name or title of the item.
        name: String,
        /// UUID assigned on load.
        assigned: Uuid,
    },

    /// A UUID element could not be decoded; a new one was generated.
    #[error("invalid UUID {value:?}, assigned {assigned}")]
    InvalidUuid {
        /// Raw element text.
        value: String,
        /// UUID assigned on load.
        assigned: Uuid,
    },

    /// Protected values use an unknown stream and were dropped.
    #[error("unknown inner stream algorithm {id}; {skipped} protected values skipped")]
    UnknownInnerStream {
        /// Stream id from the container.
        id: u32,
        /// Number of values left out.
        skipped: usize,
    },
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// A decrypted database.
#[derive(Debug, Default)]
pub struct Database {
    /// Metadata.
    pub meta: Meta,
    /// Root group.
    pub root: Group,
    /// Attachment pool from the inner header.
    pub binaries: Vec<Binary>,
}

/// Database metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta {
    /// Application that last wrote the file.
    pub generator: String,
    /// Database name shown to the user.
    pub database_name: String,
    /// Legacy header checksum stored in the payload.
    pub(crate) header_hash: Option<Vec<u8>>,
}

/// Attachment payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    /// Whether the attachment should be kept in protected memory.
    pub protected: bool,
    /// Raw content.
    pub data: Vec<u8>,
}

/// A group of entries and subgroups.
#[derive(Debug, Default)]
pub struct Group {
    /// Identifier.
    pub uuid: Uuid,
    /// Display name.
    pub name: String,
    /// Free-form notes.
    pub notes: String,
    /// Child groups.
    pub groups: Vec<Group>,
    /// Entries directly in this group.
    pub entries: Vec<Entry>,
}

impl Group {
    /// New empty group with a random UUID.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Number of entries in this group and all descendants.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.groups
            .iter()
            .fold(self.entries.len(), |n, g| n.saturating_add(g.entry_count()))
    }
}

/// Value of an entry field.
#[derive(Debug)]
pub enum FieldValue {
    /// Stored as plain text.
    Plain(String),
    /// Stored encrypted with the inner stream; kept secret in memory.
    Protected(SecretString),
}

impl FieldValue {
    /// Borrow the text.
    #[must_use]
    pub fn expose(&self) -> &str {
        match self {
            Self::Plain(s) => s,
            Self::Protected(s) => s.expose_secret(),
        }
    }

    /// Whether the value is protected.
    #[must_use]
    pub const fn is_protected(&self) -> bool {
        matches!(self, Self::Protected(_))
    }
}

/// Named field of an entry.
#[derive(Debug)]
pub struct Field {
    /// Field name.
    pub key: String,
    /// Field value.
    pub value: FieldValue,
}

/// A password entry.
#[derive(Debug, Default)]
pub struct Entry {
    /// Identifier. History items share their parent's.
    pub uuid: Uuid,
    /// Fields in file order.
    pub fields: Vec<Field>,
    /// Tags.
    pub tags: Vec<String>,
    /// Previous versions, oldest first.
    pub history: Vec<Entry>,
}

impl Entry {
    /// New entry with a random UUID and no fields.
    #[must_use]
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            ..Self::default()
        }
    }

    /// Look up a field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.key == key).map(|f| &f.value)
    }

    /// Insert or replace a field.
    pub fn set(&mut self, key: &str, value: FieldValue) {
        match self.fields.iter_mut().find(|f| f.key == key) {
            Some(field) => field.value = value,
            None => self.fields.push(Field {
                key: key.to_owned(),
                value,
            }),
        }
    }

    /// Title, or an empty string.
    #[must_use]
    pub fn title(&self) -> &str {
        self.get(TITLE).map_or("", FieldValue::expose)
    }

    /// User name, or an empty string.
    #[must_use]
    pub fn username(&self) -> &str {
        self.get(USERNAME).map_or("", FieldValue::expose)
    }
}

impl Database {
    /// Empty database with a root group named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            meta: Meta {
                generator: GENERATOR.to_owned(),
                database_name: name.clone(),
                header_hash: None,
            },
            root: Group::new(name),
            binaries: Vec::new(),
        }
    }
}
