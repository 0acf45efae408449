//! Legacy (3.x) containers.
//!
//! ```text
//! header | E(stream start bytes | hashed blocks(gzip?(xml)))
//! ```
//!
//! The key is proven by the stream start bytes at the front of the
//! decrypted payload. The header is authenticated only by the `HeaderHash`
//! the payload carries in its metadata.

use latchkey_crypto_core::{
    cipher, CancellationToken, ChallengeHandler, CompositeKey, InnerStream, InnerStreamAlgorithm,
    KdfParams,
};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::header::{Generation, Header, LegacyFields};
use super::{
    blocks, compress, decompress, derive_keys, protected_stream, random_bytes, xml,
    ContainerSettings, Decoded,
};
use crate::database::Database;
use crate::error::{SaveError, UnlockError};
use crate::progress::{ProgressReporter, DECRYPT_END, KDF_END};

const STREAM_START_LEN: usize = 32;
const STREAM_KEY_LEN: usize = 32;

pub(super) fn decode(
    bytes: &[u8],
    header: &Header,
    key: &mut CompositeKey,
    challenge_handler: Option<&dyn ChallengeHandler>,
    cancel: &CancellationToken,
    progress: &mut ProgressReporter<'_>,
) -> Result<Decoded, UnlockError> {
    let fields = header
        .legacy
        .as_ref()
        .ok_or_else(|| UnlockError::corrupted("legacy header fields missing"))?;
    let (header_bytes, payload) = bytes.split_at(header.len);

    let keys = derive_keys(
        key,
        &header.kdf,
        &header.master_seed,
        challenge_handler,
        cancel,
        &mut |f: f32| progress.report_in(0.0, KDF_END, f),
    )?;
    cancel.check()?;

    let plain = cipher::decrypt(header.cipher, &keys.cipher, &header.iv, payload)?;
    progress.report_in(KDF_END, DECRYPT_END, 0.5);

    let plain = plain.expose();
    if plain.len() < STREAM_START_LEN {
        return Err(UnlockError::InvalidKey("payload too short".into()));
    }
    let (start, framed) = plain.split_at(STREAM_START_LEN);
    if start != fields.stream_start_bytes.as_slice() {
        return Err(UnlockError::InvalidKey("stream start bytes mismatch".into()));
    }

    let content = blocks::read_hashed(framed, cancel)?;
    let xml_bytes = if header.compressed {
        decompress(&content)?
    } else {
        content
    };
    progress.report(DECRYPT_END);

    let stream = protected_stream(fields.inner_stream_id, &fields.protected_stream_key)?;
    let (database, warnings) = xml::parse(&xml_bytes, stream, cancel, progress)?;

    if let Some(stored) = &database.meta.header_hash {
        if Sha256::digest(header_bytes).as_slice() != stored.as_slice() {
            return Err(UnlockError::corrupted("header hash mismatch"));
        }
    }

    Ok(Decoded {
        database,
        warnings,
        generation: Generation::Legacy,
    })
}

pub(super) fn encode(
    database: &Database,
    key: &mut CompositeKey,
    settings: &ContainerSettings,
    challenge_handler: Option<&dyn ChallengeHandler>,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, SaveError> {
    let kdf = settings.kdf.reseeded();
    if !matches!(kdf, KdfParams::AesKdf { .. }) {
        return Err(SaveError::serialize("legacy containers require AES-KDF"));
    }
    let stream_key = random_bytes(STREAM_KEY_LEN);
    let header = Header {
        generation: Generation::Legacy,
        cipher: settings.cipher,
        compressed: settings.compress,
        master_seed: random_bytes(32),
        iv: random_bytes(settings.cipher.iv_len()),
        kdf,
        legacy: Some(LegacyFields {
            protected_stream_key: stream_key.clone(),
            stream_start_bytes: random_bytes(STREAM_START_LEN),
            inner_stream_id: InnerStreamAlgorithm::Salsa20.id(),
        }),
        len: 0,
    };
    let header_bytes = header.to_bytes()?;
    let header_hash = Sha256::digest(&header_bytes);

    let mut stream = InnerStream::new(InnerStreamAlgorithm::Salsa20, &stream_key)?;
    let xml_bytes = Zeroizing::new(xml::write(database, &mut stream, Some(header_hash.as_slice()))?);
    let content = if settings.compress {
        compress(&xml_bytes)?
    } else {
        xml_bytes
    };

    let mut plain = Zeroizing::new(Vec::with_capacity(content.len().saturating_add(64)));
    if let Some(fields) = &header.legacy {
        plain.extend_from_slice(&fields.stream_start_bytes);
    }
    plain.extend_from_slice(&blocks::write_hashed(&content)?);

    let keys = derive_keys(
        key,
        &header.kdf,
        &header.master_seed,
        challenge_handler,
        cancel,
        &mut |_: f32| {},
    )?;
    let ciphertext = cipher::encrypt(header.cipher, &keys.cipher, &header.iv, &plain)?;

    let mut out = header_bytes;
    out.extend_from_slice(&ciphertext);
    Ok(out)
}
