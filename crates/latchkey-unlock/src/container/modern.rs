//! Modern (4.x) containers.
//!
//! ```text
//! header | sha256(header) | hmac(header) | hmac blocks(E(gzip?(inner header | xml)))
//! ```
//!
//! The header checksum is checked before the KDF runs, so a damaged file is
//! reported as such without a long derivation. The header HMAC then proves
//! the key. The inner header carries the protected stream and attachments.

use latchkey_crypto_core::{
    cipher, CancellationToken, ChallengeHandler, CompositeKey, CryptoError, InnerStream,
    InnerStreamAlgorithm,
};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::header::{Generation, Header};
use super::reader::{le_u32, ByteReader};
use super::{
    blocks, compress, decompress, derive_keys, protected_stream, random_bytes, xml,
    ContainerSettings, Decoded,
};
use crate::database::{Binary, Database};
use crate::error::{SaveError, UnlockError};
use crate::progress::{ProgressReporter, DECRYPT_END, KDF_END};

const STREAM_KEY_LEN: usize = 64;

/// Inner header field identifiers.
mod inner_field {
    pub const END: u8 = 0;
    pub const STREAM_ID: u8 = 1;
    pub const STREAM_KEY: u8 = 2;
    pub const BINARY: u8 = 3;
}

/// Flag bit on an inner binary: keep in protected memory.
const BINARY_PROTECTED: u8 = 0x01;

struct InnerHeader {
    stream_id: u32,
    stream_key: Zeroizing<Vec<u8>>,
    binaries: Vec<Binary>,
}

pub(super) fn decode(
    bytes: &[u8],
    header: &Header,
    key: &mut CompositeKey,
    challenge_handler: Option<&dyn ChallengeHandler>,
    cancel: &CancellationToken,
    progress: &mut ProgressReporter<'_>,
) -> Result<Decoded, UnlockError> {
    let header_bytes = bytes
        .get(..header.len)
        .ok_or_else(|| UnlockError::corrupted("header truncated"))?;
    let mut r = ByteReader::at(bytes, header.len);
    let checksum: [u8; 32] = r.array()?;
    let header_mac: [u8; 32] = r.array()?;
    if Sha256::digest(header_bytes).as_slice() != checksum {
        return Err(UnlockError::corrupted("header checksum mismatch"));
    }

    let keys = derive_keys(
        key,
        &header.kdf,
        &header.master_seed,
        challenge_handler,
        cancel,
        &mut |f: f32| progress.report_in(0.0, KDF_END, f),
    )?;
    cancel.check()?;
    blocks::verify_header_hmac(&keys.hmac_base, header_bytes, &header_mac)?;

    let ciphertext = blocks::read_hmac(r.rest(), &keys.hmac_base, cancel)?;

    // The HMAC proves every factor but the hardware response. Without one, a
    // bad payload is damage; with one, it is most likely the wrong device.
    let keyed = |err: UnlockError| {
        if keys.challenge_response {
            tracing::debug!(%err, "payload unreadable with hardware response");
            UnlockError::InvalidKey("payload does not decrypt with this hardware key".into())
        } else {
            err
        }
    };
    let plain = cipher::decrypt(header.cipher, &keys.cipher, &header.iv, &ciphertext)
        .map_err(|e| match e {
            CryptoError::Decryption => UnlockError::corrupted("payload padding invalid"),
            other => other.into(),
        })
        .map_err(keyed)?;
    progress.report_in(KDF_END, DECRYPT_END, 0.5);

    let content = if header.compressed {
        decompress(plain.expose()).map_err(keyed)?
    } else {
        Zeroizing::new(plain.expose().to_vec())
    };
    drop(plain);

    let mut payload = ByteReader::new(&content);
    let inner = parse_inner_header(&mut payload).map_err(keyed)?;
    progress.report(DECRYPT_END);

    let stream = protected_stream(inner.stream_id, &inner.stream_key)?;
    let (mut database, warnings) = xml::parse(payload.rest(), stream, cancel, progress)?;
    database.binaries = inner.binaries;

    Ok(Decoded {
        database,
        warnings,
        generation: Generation::Modern,
    })
}

fn parse_inner_header(r: &mut ByteReader<'_>) -> Result<InnerHeader, UnlockError> {
    let mut stream_id = None;
    let mut stream_key = None;
    let mut binaries = Vec::new();
    loop {
        let id = r.u8()?;
        let len = r.len_i32()?;
        let data = r.take(len)?;
        match id {
            inner_field::END => break,
            inner_field::STREAM_ID => stream_id = Some(le_u32(data, "inner stream id")?),
            inner_field::STREAM_KEY => stream_key = Some(Zeroizing::new(data.to_vec())),
            inner_field::BINARY => {
                let (flags, content) = data
                    .split_first()
                    .ok_or_else(|| UnlockError::corrupted("empty inner binary"))?;
                binaries.push(Binary {
                    protected: flags & BINARY_PROTECTED != 0,
                    data: content.to_vec(),
                });
            }
            other => tracing::debug!(id = other, "ignoring unknown inner header field"),
        }
    }
    Ok(InnerHeader {
        stream_id: stream_id.ok_or_else(|| UnlockError::corrupted("inner stream id missing"))?,
        stream_key: stream_key
            .ok_or_else(|| UnlockError::corrupted("inner stream key missing"))?,
        binaries,
    })
}

fn write_inner_field(out: &mut Vec<u8>, id: u8, parts: &[&[u8]]) -> Result<(), SaveError> {
    let len: usize = parts.iter().map(|p| p.len()).fold(0, usize::saturating_add);
    let len = i32::try_from(len).map_err(|_| SaveError::serialize("inner header field too large"))?;
    out.push(id);
    out.extend_from_slice(&len.to_le_bytes());
    for part in parts {
        out.extend_from_slice(part);
    }
    Ok(())
}

pub(super) fn encode(
    database: &Database,
    key: &mut CompositeKey,
    settings: &ContainerSettings,
    challenge_handler: Option<&dyn ChallengeHandler>,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, SaveError> {
    let header = Header {
        generation: Generation::Modern,
        cipher: settings.cipher,
        compressed: settings.compress,
        master_seed: random_bytes(32),
        iv: random_bytes(settings.cipher.iv_len()),
        kdf: settings.kdf.reseeded(),
        legacy: None,
        len: 0,
    };
    let header_bytes = header.to_bytes()?;

    let keys = derive_keys(
        key,
        &header.kdf,
        &header.master_seed,
        challenge_handler,
        cancel,
        &mut |_: f32| {},
    )?;

    let stream_key = Zeroizing::new(random_bytes(STREAM_KEY_LEN));
    let algorithm = InnerStreamAlgorithm::ChaCha20;
    let mut payload = Zeroizing::new(Vec::new());
    let stream_id = algorithm.id().to_le_bytes();
    write_inner_field(&mut payload, inner_field::STREAM_ID, &[stream_id.as_slice()])?;
    write_inner_field(&mut payload, inner_field::STREAM_KEY, &[stream_key.as_slice()])?;
    for binary in &database.binaries {
        let flags = [if binary.protected { BINARY_PROTECTED } else { 0 }];
        write_inner_field(
            &mut payload,
            inner_field::BINARY,
            &[flags.as_slice(), binary.data.as_slice()],
        )?;
    }
    write_inner_field(&mut payload, inner_field::END, &[])?;

    let mut stream = InnerStream::new(algorithm, &stream_key)?;
    payload.extend_from_slice(&Zeroizing::new(xml::write(database, &mut stream, None)?));

    let content = if settings.compress {
        compress(&payload)?
    } else {
        payload
    };
    let ciphertext = cipher::encrypt(header.cipher, &keys.cipher, &header.iv, &content)?;

    let mut out = header_bytes.clone();
    out.extend_from_slice(&Sha256::digest(&header_bytes));
    out.extend_from_slice(&blocks::header_hmac(&keys.hmac_base, &header_bytes)?);
    out.extend_from_slice(&blocks::write_hmac(&ciphertext, &keys.hmac_base)?);
    Ok(out)
}
