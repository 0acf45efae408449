//! Key file → 32-byte key-file component.
//!
//! Accepted layouts, tried in order:
//!
//! 1. XML `<KeyFile>` version 1.0 — `<Key><Data>` holds base64 key bytes
//! 2. XML `<KeyFile>` version 2.0 — `<Data Hash="…">` holds hex key bytes,
//!    `Hash` is the first 4 bytes of SHA-256 over them
//! 3. exactly 32 raw bytes
//! 4. exactly 64 hexadecimal characters
//! 5. anything else — SHA-256 of the whole file

use data_encoding::{BASE64, HEXLOWER_PERMISSIVE};
use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::memory::SecretBytes;

/// Length of the key-file component.
pub const KEY_FILE_COMPONENT_LEN: usize = 32;

#[derive(Default)]
struct XmlKeyFile {
    version: Option<String>,
    data: Option<String>,
    hash: Option<String>,
}

impl Drop for XmlKeyFile {
    fn drop(&mut self) {
        if let Some(data) = self.data.as_mut() {
            data.zeroize();
        }
    }
}

/// Turn key file contents into the key-file component.
///
/// # Errors
///
/// Returns [`CryptoError::KeyFile`] for an empty file or an XML key file whose
/// data is malformed or fails its embedded hash check.
pub fn load_key_file(contents: &[u8]) -> Result<SecretBytes<KEY_FILE_COMPONENT_LEN>, CryptoError> {
    if contents.is_empty() {
        return Err(CryptoError::KeyFile("key file is empty".into()));
    }

    if let Some(xml) = parse_xml(contents)? {
        return component_from_xml(&xml);
    }

    if contents.len() == KEY_FILE_COMPONENT_LEN {
        return SecretBytes::from_slice(contents);
    }

    if contents.len() == KEY_FILE_COMPONENT_LEN * 2 {
        if let Ok(mut decoded) = HEXLOWER_PERMISSIVE.decode(contents) {
            let component = SecretBytes::from_slice(&decoded);
            decoded.zeroize();
            return component;
        }
    }

    let mut digest: [u8; KEY_FILE_COMPONENT_LEN] = Sha256::digest(contents).into();
    let component = SecretBytes::new(digest);
    digest.zeroize();
    Ok(component)
}

/// `Ok(None)` when the contents are not a `<KeyFile>` document.
fn parse_xml(contents: &[u8]) -> Result<Option<XmlKeyFile>, CryptoError> {
    let trimmed = trim_leading(contents);
    if !trimmed.starts_with(b"<") {
        return Ok(None);
    }

    let mut reader = Reader::from_reader(trimmed);
    reader.config_mut().trim_text(true);

    let mut parsed = XmlKeyFile::default();
    let mut seen_root = false;
    let mut current: Vec<u8> = Vec::new();

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            // Malformed markup before the root means this is not an XML key file.
            Err(_) if !seen_root => return Ok(None),
            Err(e) => return Err(CryptoError::KeyFile(format!("malformed XML key file: {e}"))),
        };
        match event {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                if !seen_root {
                    if name != b"KeyFile" {
                        return Ok(None);
                    }
                    seen_root = true;
                }
                if name == b"Data" {
                    parsed.hash = e
                        .try_get_attribute("Hash")
                        .ok()
                        .flatten()
                        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()));
                }
                current = name;
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| CryptoError::KeyFile(format!("malformed XML key file: {e}")))?;
                match current.as_slice() {
                    b"Version" => parsed.version = Some(text.trim().to_owned()),
                    b"Data" => parsed.data = Some(text.into_owned()),
                    _ => {}
                }
            }
            Event::End(_) => current.clear(),
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(seen_root.then_some(parsed))
}

fn component_from_xml(xml: &XmlKeyFile) -> Result<SecretBytes<KEY_FILE_COMPONENT_LEN>, CryptoError> {
    let data = xml
        .data
        .as_deref()
        .ok_or_else(|| CryptoError::KeyFile("XML key file has no <Data> element".into()))?;
    let major = xml
        .version
        .as_deref()
        .and_then(|v| v.split('.').next())
        .unwrap_or("1");

    match major {
        "1" => {
            let mut decoded = BASE64
                .decode(data.trim().as_bytes())
                .map_err(|e| CryptoError::KeyFile(format!("invalid base64 key data: {e}")))?;
            let component = SecretBytes::from_slice(&decoded)
                .map_err(|_| CryptoError::KeyFile("key data must decode to 32 bytes".into()));
            decoded.zeroize();
            component
        }
        "2" => {
            let mut hex: String = data.chars().filter(|c| !c.is_whitespace()).collect();
            let decoded = HEXLOWER_PERMISSIVE
                .decode(hex.as_bytes())
                .map_err(|e| CryptoError::KeyFile(format!("invalid hex key data: {e}")));
            hex.zeroize();
            let mut decoded = decoded?;
            if let Some(expected) = xml.hash.as_deref() {
                let digest = Sha256::digest(&decoded);
                let actual = HEXLOWER_PERMISSIVE.encode(&digest[..4]);
                if !actual.eq_ignore_ascii_case(expected.trim()) {
                    decoded.zeroize();
                    return Err(CryptoError::KeyFile("key data hash mismatch".into()));
                }
            }
            let component = SecretBytes::from_slice(&decoded)
                .map_err(|_| CryptoError::KeyFile("key data must decode to 32 bytes".into()));
            decoded.zeroize();
            component
        }
        other => Err(CryptoError::KeyFile(format!(
            "unsupported key file version {other}"
        ))),
    }
}

fn trim_leading(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}
