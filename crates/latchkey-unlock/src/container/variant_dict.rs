//! Typed key/value dictionary used for modern KDF parameters.
//!
//! Layout: `u16` version (`0x0100`), then entries of
//! `u8 type | i32 key len | key | i32 value len | value`, terminated by a
//! zero type byte.

use std::collections::BTreeMap;

use latchkey_crypto_core::kdf::{Argon2Variant, KdfParams, AES_KDF_UUID, ARGON2D_UUID, ARGON2ID_UUID};

use super::reader::{le_u32, le_u64, ByteReader};
use crate::error::{SaveError, UnlockError};

const VERSION: u16 = 0x0100;
const CRITICAL_MASK: u16 = 0xFF00;

const TYPE_END: u8 = 0x00;
const TYPE_U32: u8 = 0x04;
const TYPE_U64: u8 = 0x05;
const TYPE_BOOL: u8 = 0x08;
const TYPE_I32: u8 = 0x0C;
const TYPE_I64: u8 = 0x0D;
const TYPE_STRING: u8 = 0x18;
const TYPE_BYTES: u8 = 0x42;

const KEY_UUID: &str = "$UUID";
const KEY_SALT: &str = "S";
const KEY_ROUNDS: &str = "R";
const KEY_MEMORY: &str = "M";
const KEY_ITERATIONS: &str = "I";
const KEY_PARALLELISM: &str = "P";
const KEY_VERSION: &str = "V";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Value {
    U32(u32),
    U64(u64),
    Bool(bool),
    I32(i32),
    I64(i64),
    String(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(super) struct VariantDictionary {
    entries: BTreeMap<String, Value>,
}

impl VariantDictionary {
    pub(super) fn parse(data: &[u8]) -> Result<Self, UnlockError> {
        let mut r = ByteReader::new(data);
        let version = r.u16()?;
        if version & CRITICAL_MASK > VERSION & CRITICAL_MASK {
            return Err(UnlockError::unsupported(format!(
                "KDF parameter dictionary version {version:#06x}"
            )));
        }
        let mut entries = BTreeMap::new();
        loop {
            let kind = r.u8()?;
            if kind == TYPE_END {
                break;
            }
            let key_len = r.len_i32()?;
            let key = String::from_utf8(r.take(key_len)?.to_vec())
                .map_err(|_| UnlockError::corrupted("dictionary key is not UTF-8"))?;
            let value_len = r.len_i32()?;
            let raw = r.take(value_len)?;
            let value = match kind {
                TYPE_U32 => Value::U32(le_u32(raw, &key)?),
                TYPE_U64 => Value::U64(le_u64(raw, &key)?),
                TYPE_BOOL => Value::Bool(raw.first().is_some_and(|b| *b != 0)),
                TYPE_I32 => Value::I32(i32::from_le_bytes(le_u32(raw, &key)?.to_le_bytes())),
                TYPE_I64 => Value::I64(i64::from_le_bytes(le_u64(raw, &key)?.to_le_bytes())),
                TYPE_STRING => Value::String(
                    String::from_utf8(raw.to_vec())
                        .map_err(|_| UnlockError::corrupted("dictionary string is not UTF-8"))?,
                ),
                TYPE_BYTES => Value::Bytes(raw.to_vec()),
                other => {
                    return Err(UnlockError::corrupted(format!(
                        "unknown dictionary value type {other:#04x}"
                    )))
                }
            };
            entries.insert(key, value);
        }
        Ok(Self { entries })
    }

    pub(super) fn to_bytes(&self) -> Result<Vec<u8>, SaveError> {
        let mut out = VERSION.to_le_bytes().to_vec();
        for (key, value) in &self.entries {
            let (kind, raw) = match value {
                Value::U32(v) => (TYPE_U32, v.to_le_bytes().to_vec()),
                Value::U64(v) => (TYPE_U64, v.to_le_bytes().to_vec()),
                Value::Bool(v) => (TYPE_BOOL, vec![u8::from(*v)]),
                Value::I32(v) => (TYPE_I32, v.to_le_bytes().to_vec()),
                Value::I64(v) => (TYPE_I64, v.to_le_bytes().to_vec()),
                Value::String(v) => (TYPE_STRING, v.as_bytes().to_vec()),
                Value::Bytes(v) => (TYPE_BYTES, v.clone()),
            };
            out.push(kind);
            out.extend_from_slice(&len_i32(key.len())?.to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(&len_i32(raw.len())?.to_le_bytes());
            out.extend_from_slice(&raw);
        }
        out.push(TYPE_END);
        Ok(out)
    }

    pub(super) fn insert(&mut self, key: &str, value: Value) {
        self.entries.insert(key.to_owned(), value);
    }

    fn get(&self, key: &str) -> Result<&Value, UnlockError> {
        self.entries
            .get(key)
            .ok_or_else(|| UnlockError::corrupted(format!("KDF parameter {key:?} missing")))
    }

    fn bytes(&self, key: &str) -> Result<&[u8], UnlockError> {
        match self.get(key)? {
            Value::Bytes(v) => Ok(v),
            _ => Err(UnlockError::corrupted(format!("KDF parameter {key:?} has the wrong type"))),
        }
    }

    fn uint(&self, key: &str) -> Result<u64, UnlockError> {
        match self.get(key)? {
            Value::U32(v) => Ok(u64::from(*v)),
            Value::U64(v) => Ok(*v),
            _ => Err(UnlockError::corrupted(format!("KDF parameter {key:?} has the wrong type"))),
        }
    }
}

fn len_i32(len: usize) -> Result<i32, SaveError> {
    i32::try_from(len).map_err(|_| SaveError::Serialize(format!("dictionary item too large: {len}")))
}

/// Read KDF parameters from the header dictionary.
pub(super) fn kdf_from_dict(dict: &VariantDictionary) -> Result<KdfParams, UnlockError> {
    let uuid = dict.bytes(KEY_UUID)?;
    if uuid == AES_KDF_UUID {
        let seed: [u8; 32] = dict
            .bytes(KEY_SALT)?
            .try_into()
            .map_err(|_| UnlockError::corrupted("AES-KDF seed must be 32 bytes"))?;
        return Ok(KdfParams::AesKdf {
            seed,
            rounds: dict.uint(KEY_ROUNDS)?,
        });
    }
    let variant = if uuid == ARGON2D_UUID {
        Argon2Variant::Argon2d
    } else if uuid == ARGON2ID_UUID {
        Argon2Variant::Argon2id
    } else {
        return Err(UnlockError::unsupported("unknown key derivation function"));
    };
    let parallelism = u32::try_from(dict.uint(KEY_PARALLELISM)?)
        .map_err(|_| UnlockError::corrupted("argon2 parallelism out of range"))?;
    let version = u32::try_from(dict.uint(KEY_VERSION)?)
        .map_err(|_| UnlockError::corrupted("argon2 version out of range"))?;
    Ok(KdfParams::Argon2 {
        variant,
        salt: dict.bytes(KEY_SALT)?.to_vec(),
        memory_bytes: dict.uint(KEY_MEMORY)?,
        iterations: dict.uint(KEY_ITERATIONS)?,
        parallelism,
        version,
    })
}

/// Encode KDF parameters for the header dictionary.
pub(super) fn kdf_to_dict(params: &KdfParams) -> VariantDictionary {
    let mut dict = VariantDictionary::default();
    dict.insert(KEY_UUID, Value::Bytes(params.uuid().to_vec()));
    match params {
        KdfParams::AesKdf { seed, rounds } => {
            dict.insert(KEY_SALT, Value::Bytes(seed.to_vec()));
            dict.insert(KEY_ROUNDS, Value::U64(*rounds));
        }
        KdfParams::Argon2 {
            salt,
            memory_bytes,
            iterations,
            parallelism,
            version,
            ..
        } => {
            dict.insert(KEY_SALT, Value::Bytes(salt.clone()));
            dict.insert(KEY_MEMORY, Value::U64(*memory_bytes));
            dict.insert(KEY_ITERATIONS, Value::U64(*iterations));
            dict.insert(KEY_PARALLELISM, Value::U32(*parallelism));
            dict.insert(KEY_VERSION, Value::U32(*version));
        }
    }
    dict
}
