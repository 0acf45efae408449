//! Outer container header, both generations.
//!
//! ```text
//! u32 signature 1 | u32 signature 2 | u16 minor | u16 major
//! repeated: u8 field id | u16 (legacy) or u32 (modern) length | data
//! ```

use latchkey_crypto_core::cipher::TWOFISH_UUID;
use latchkey_crypto_core::kdf::KdfParams;
use latchkey_crypto_core::OuterCipher;
use serde::{Deserialize, Serialize};

use super::reader::{le_u32, le_u64, ByteReader};
use super::variant_dict::{kdf_from_dict, kdf_to_dict, VariantDictionary};
use crate::error::{SaveError, UnlockError};

pub(super) const SIGNATURE_1: u32 = 0x9AA2_D903;
pub(super) const SIGNATURE_2: u32 = 0xB54B_FB67;
/// Second signature of KeePass 1.x files.
const SIGNATURE_2_KDB: u32 = 0xB54B_FB65;

const LEGACY_MAJOR: u16 = 3;
const LEGACY_MINOR: u16 = 1;
const MODERN_MAJOR: u16 = 4;
const MODERN_MINOR: u16 = 0;
const MODERN_MAX_MINOR: u16 = 1;

const END_MARKER: &[u8] = b"\r\n\r\n";

/// Header field identifiers.
mod field {
    pub const END: u8 = 0;
    pub const COMMENT: u8 = 1;
    pub const CIPHER_ID: u8 = 2;
    pub const COMPRESSION: u8 = 3;
    pub const MASTER_SEED: u8 = 4;
    pub const TRANSFORM_SEED: u8 = 5;
    pub const TRANSFORM_ROUNDS: u8 = 6;
    pub const ENCRYPTION_IV: u8 = 7;
    pub const PROTECTED_STREAM_KEY: u8 = 8;
    pub const STREAM_START_BYTES: u8 = 9;
    pub const INNER_RANDOM_STREAM_ID: u8 = 10;
    pub const KDF_PARAMETERS: u8 = 11;
    pub const PUBLIC_CUSTOM_DATA: u8 = 12;
}

/// Container generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Generation {
    /// Format 3.x: AES-KDF, stream-start check, hashed blocks.
    Legacy,
    /// Format 4.x: pluggable KDF, HMAC-authenticated blocks, inner header.
    Modern,
}

/// Fields only present in legacy headers.
#[derive(Clone)]
#[cfg_attr(test, derive(Debug))]
pub(super) struct LegacyFields {
    pub protected_stream_key: Vec<u8>,
    pub stream_start_bytes: Vec<u8>,
    pub inner_stream_id: u32,
}

/// Parsed outer header.
#[derive(Clone)]
#[cfg_attr(test, derive(Debug))]
pub(super) struct Header {
    pub generation: Generation,
    pub cipher: OuterCipher,
    pub compressed: bool,
    pub master_seed: Vec<u8>,
    pub iv: Vec<u8>,
    pub kdf: KdfParams,
    pub legacy: Option<LegacyFields>,
    /// Length of the serialized header, i.e. the offset of what follows it.
    pub len: usize,
}

#[derive(Default)]
struct RawFields {
    cipher: Option<OuterCipher>,
    compressed: Option<bool>,
    master_seed: Option<Vec<u8>>,
    transform_seed: Option<[u8; 32]>,
    transform_rounds: Option<u64>,
    iv: Option<Vec<u8>>,
    protected_stream_key: Option<Vec<u8>>,
    stream_start_bytes: Option<Vec<u8>>,
    inner_stream_id: Option<u32>,
    kdf: Option<KdfParams>,
}

fn missing(name: &str) -> UnlockError {
    UnlockError::corrupted(format!("header field {name} missing"))
}

impl Header {
    /// Parse the header at the start of `bytes`.
    pub(super) fn parse(bytes: &[u8]) -> Result<Self, UnlockError> {
        let mut r = ByteReader::new(bytes);
        let sig1 = r
            .u32()
            .map_err(|_| UnlockError::unsupported("file too short to be a database"))?;
        let sig2 = r
            .u32()
            .map_err(|_| UnlockError::unsupported("file too short to be a database"))?;
        if sig1 != SIGNATURE_1 {
            return Err(UnlockError::unsupported("not a KeePass database"));
        }
        if sig2 == SIGNATURE_2_KDB {
            return Err(UnlockError::unsupported("KeePass 1.x databases"));
        }
        if sig2 != SIGNATURE_2 {
            return Err(UnlockError::unsupported("unknown database signature"));
        }
        let minor = r.u16()?;
        let major = r.u16()?;
        let generation = match major {
            LEGACY_MAJOR => Generation::Legacy,
            MODERN_MAJOR if minor <= MODERN_MAX_MINOR => Generation::Modern,
            _ => {
                return Err(UnlockError::unsupported(format!(
                    "format version {major}.{minor}"
                )))
            }
        };
        tracing::debug!(major, minor, "container header");

        let mut raw = RawFields::default();
        loop {
            let id = r.u8()?;
            let len = match generation {
                Generation::Legacy => usize::from(r.u16()?),
                Generation::Modern => usize::try_from(r.u32()?)
                    .map_err(|_| UnlockError::corrupted("header field too large"))?,
            };
            let data = r.take(len)?;
            match id {
                field::END => break,
                field::CIPHER_ID => {
                    raw.cipher = Some(OuterCipher::from_uuid(data).ok_or_else(|| {
                        if data == TWOFISH_UUID {
                            UnlockError::unsupported("Twofish cipher")
                        } else {
                            UnlockError::unsupported("unknown cipher")
                        }
                    })?);
                }
                field::COMPRESSION => {
                    raw.compressed = Some(match le_u32(data, "compression flag")? {
                        0 => false,
                        1 => true,
                        other => {
                            return Err(UnlockError::unsupported(format!(
                                "compression algorithm {other}"
                            )))
                        }
                    });
                }
                field::MASTER_SEED => {
                    if data.len() != 32 {
                        return Err(UnlockError::corrupted("master seed must be 32 bytes"));
                    }
                    raw.master_seed = Some(data.to_vec());
                }
                field::TRANSFORM_SEED => {
                    raw.transform_seed = Some(
                        data.try_into()
                            .map_err(|_| UnlockError::corrupted("transform seed must be 32 bytes"))?,
                    );
                }
                field::TRANSFORM_ROUNDS => {
                    raw.transform_rounds = Some(le_u64(data, "transform rounds")?);
                }
                field::ENCRYPTION_IV => raw.iv = Some(data.to_vec()),
                field::PROTECTED_STREAM_KEY => raw.protected_stream_key = Some(data.to_vec()),
                field::STREAM_START_BYTES => raw.stream_start_bytes = Some(data.to_vec()),
                field::INNER_RANDOM_STREAM_ID => {
                    raw.inner_stream_id = Some(le_u32(data, "inner stream id")?);
                }
                field::KDF_PARAMETERS => {
                    raw.kdf = Some(kdf_from_dict(&VariantDictionary::parse(data)?)?);
                }
                field::COMMENT | field::PUBLIC_CUSTOM_DATA => {}
                other => tracing::debug!(id = other, "ignoring unknown header field"),
            }
        }

        let cipher = raw.cipher.ok_or_else(|| missing("CipherID"))?;
        let iv = raw.iv.ok_or_else(|| missing("EncryptionIV"))?;
        if iv.len() != cipher.iv_len() {
            return Err(UnlockError::corrupted(format!(
                "IV is {} bytes, cipher needs {}",
                iv.len(),
                cipher.iv_len()
            )));
        }

        let (kdf, legacy) = match generation {
            Generation::Legacy => {
                let kdf = KdfParams::AesKdf {
                    seed: raw.transform_seed.ok_or_else(|| missing("TransformSeed"))?,
                    rounds: raw.transform_rounds.ok_or_else(|| missing("TransformRounds"))?,
                };
                let legacy = LegacyFields {
                    protected_stream_key: raw.protected_stream_key.unwrap_or_default(),
                    stream_start_bytes: raw
                        .stream_start_bytes
                        .ok_or_else(|| missing("StreamStartBytes"))?,
                    inner_stream_id: raw.inner_stream_id.unwrap_or(0),
                };
                (kdf, Some(legacy))
            }
            Generation::Modern => (raw.kdf.ok_or_else(|| missing("KdfParameters"))?, None),
        };

        Ok(Self {
            generation,
            cipher,
            compressed: raw.compressed.unwrap_or(false),
            master_seed: raw.master_seed.ok_or_else(|| missing("MasterSeed"))?,
            iv,
            kdf,
            legacy,
            len: r.position(),
        })
    }

    /// Serialize the header. `len` is ignored.
    pub(super) fn to_bytes(&self) -> Result<Vec<u8>, SaveError> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(&SIGNATURE_1.to_le_bytes());
        out.extend_from_slice(&SIGNATURE_2.to_le_bytes());
        let (minor, major) = match self.generation {
            Generation::Legacy => (LEGACY_MINOR, LEGACY_MAJOR),
            Generation::Modern => (MODERN_MINOR, MODERN_MAJOR),
        };
        out.extend_from_slice(&minor.to_le_bytes());
        out.extend_from_slice(&major.to_le_bytes());

        let mut put = |id: u8, data: &[u8]| -> Result<(), SaveError> {
            out.push(id);
            match self.generation {
                Generation::Legacy => {
                    let len = u16::try_from(data.len())
                        .map_err(|_| SaveError::Serialize("header field too large".into()))?;
                    out.extend_from_slice(&len.to_le_bytes());
                }
                Generation::Modern => {
                    let len = u32::try_from(data.len())
                        .map_err(|_| SaveError::Serialize("header field too large".into()))?;
                    out.extend_from_slice(&len.to_le_bytes());
                }
            }
            out.extend_from_slice(data);
            Ok(())
        };

        put(field::CIPHER_ID, &self.cipher.uuid())?;
        put(field::COMPRESSION, &u32::from(self.compressed).to_le_bytes())?;
        put(field::MASTER_SEED, &self.master_seed)?;
        match (&self.generation, &self.kdf, &self.legacy) {
            (Generation::Legacy, KdfParams::AesKdf { seed, rounds }, Some(legacy)) => {
                put(field::TRANSFORM_SEED, seed)?;
                put(field::TRANSFORM_ROUNDS, &rounds.to_le_bytes())?;
                put(field::ENCRYPTION_IV, &self.iv)?;
                put(field::PROTECTED_STREAM_KEY, &legacy.protected_stream_key)?;
                put(field::STREAM_START_BYTES, &legacy.stream_start_bytes)?;
                put(
                    field::INNER_RANDOM_STREAM_ID,
                    &legacy.inner_stream_id.to_le_bytes(),
                )?;
            }
            (Generation::Legacy, _, _) => {
                return Err(SaveError::Serialize(
                    "legacy containers require AES-KDF".into(),
                ))
            }
            (Generation::Modern, kdf, _) => {
                put(field::ENCRYPTION_IV, &self.iv)?;
                put(field::KDF_PARAMETERS, &kdf_to_dict(kdf).to_bytes()?)?;
            }
        }
        put(field::END, END_MARKER)?;
        Ok(out)
    }
}
