//! KeePass XML payload.
//!
//! Parsing is a single streaming pass with `quick-xml`. Protected values are
//! revealed as they are met, so the inner stream advances in document order;
//! the writer emits them in the same order.

use std::collections::HashSet;

use data_encoding::BASE64;
use latchkey_crypto_core::{CancellationToken, InnerStream};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::database::{Database, Entry, Field, FieldValue, Group, LoadWarning, Meta};
use crate::error::{SaveError, UnlockError};
use crate::progress::{ProgressReporter, DECRYPT_END};

/// XML events between two cancellation/progress checks.
const EVENTS_PER_CHECK: usize = 256;

/// Keystream for protected values, or the id of one we cannot produce.
pub(crate) enum ProtectedStream {
    Known(InnerStream),
    Unknown(u32),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a decrypted payload.
///
/// # Errors
///
/// - [`UnlockError::FileCorrupted`] for malformed XML, a missing root group or
///   an undecodable protected value
/// - [`UnlockError::CancelledByUser`] if `cancel` fires
pub(crate) fn parse(
    xml: &[u8],
    stream: ProtectedStream,
    cancel: &CancellationToken,
    progress: &mut ProgressReporter<'_>,
) -> Result<(Database, Vec<LoadWarning>), UnlockError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);

    let mut parser = Parser::new(stream);
    let mut events: usize = 0;

    loop {
        let event = reader.read_event().map_err(|e| {
            UnlockError::corrupted(format!("XML error at byte {}: {e}", reader.error_position()))
        })?;
        match event {
            Event::Start(e) => parser.open(&e)?,
            Event::Empty(e) => {
                parser.open(&e)?;
                parser.close()?;
            }
            Event::End(_) => parser.close()?,
            Event::Text(e) => {
                let text = e
                    .unescape()
                    .map_err(|err| UnlockError::corrupted(format!("bad XML text: {err}")))?;
                parser.text.push_str(&text);
            }
            Event::CData(e) => {
                let raw = e.into_inner();
                let text = std::str::from_utf8(&raw)
                    .map_err(|err| UnlockError::corrupted(format!("bad CDATA: {err}")))?;
                parser.text.push_str(text);
            }
            Event::Eof => break,
            _ => {}
        }

        events = events.wrapping_add(1);
        if events % EVENTS_PER_CHECK == 0 {
            cancel.check()?;
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
            let fraction = (reader.buffer_position() as f64 / xml.len().max(1) as f64) as f32;
            progress.report_in(DECRYPT_END, 1.0, fraction);
        }
    }

    parser.finish()
}

struct Parser {
    stream: ProtectedStream,
    path: Vec<Vec<u8>>,
    text: String,
    protected: bool,
    saw_document: bool,
    meta: Meta,
    root: Option<Group>,
    groups: Vec<Group>,
    entries: Vec<Entry>,
    string_key: Option<String>,
    string_value: Option<FieldValue>,
    seen: HashSet<Uuid>,
    warnings: Vec<LoadWarning>,
    skipped: usize,
}

impl Parser {
    fn new(stream: ProtectedStream) -> Self {
        Self {
            stream,
            path: Vec::new(),
            text: String::new(),
            protected: false,
            saw_document: false,
            meta: Meta::default(),
            root: None,
            groups: Vec::new(),
            entries: Vec::new(),
            string_key: None,
            string_value: None,
            seen: HashSet::new(),
            warnings: Vec::new(),
            skipped: 0,
        }
    }

    fn open(&mut self, e: &BytesStart<'_>) -> Result<(), UnlockError> {
        let name = e.name().as_ref().to_vec();
        if self.path.is_empty() {
            if name != b"KeePassFile" {
                return Err(UnlockError::corrupted("payload is not a KeePass document"));
            }
            self.saw_document = true;
        }
        match name.as_slice() {
            b"Group" => self.groups.push(Group::default()),
            b"Entry" => self.entries.push(Entry::default()),
            b"String" => {
                self.string_key = None;
                self.string_value = Some(FieldValue::Plain(String::new()));
            }
            _ => {}
        }
        self.protected = e
            .try_get_attribute("Protected")
            .ok()
            .flatten()
            .is_some_and(|a| a.value.eq_ignore_ascii_case(b"true"));
        self.text.clear();
        self.path.push(name);
        Ok(())
    }

    fn close(&mut self) -> Result<(), UnlockError> {
        let Some(name) = self.path.pop() else {
            return Err(UnlockError::corrupted("unbalanced XML"));
        };
        let parent = self.path.last().cloned().unwrap_or_default();
        let text = std::mem::take(&mut self.text);
        let value = if std::mem::replace(&mut self.protected, false) {
            self.reveal(&text)?
                .map(|plain| FieldValue::Protected(SecretString::from(plain)))
        } else {
            Some(FieldValue::Plain(text))
        };

        match (name.as_slice(), parent.as_slice()) {
            (b"Generator", b"Meta") => self.meta.generator = into_text(value),
            (b"DatabaseName", b"Meta") => self.meta.database_name = into_text(value),
            (b"HeaderHash", b"Meta") => {
                self.meta.header_hash = BASE64.decode(into_text(value).trim().as_bytes()).ok();
            }
            (b"UUID", b"Group") => {
                let uuid = self.decode_uuid(&into_text(value));
                if let Some(group) = self.groups.last_mut() {
                    group.uuid = uuid;
                }
            }
            (b"Name", b"Group") => {
                if let Some(group) = self.groups.last_mut() {
                    group.name = into_text(value);
                }
            }
            (b"Notes", b"Group") => {
                if let Some(group) = self.groups.last_mut() {
                    group.notes = into_text(value);
                }
            }
            (b"UUID", b"Entry") => {
                let uuid = self.decode_uuid(&into_text(value));
                if let Some(entry) = self.entries.last_mut() {
                    entry.uuid = uuid;
                }
            }
            (b"Tags", b"Entry") => {
                if let Some(entry) = self.entries.last_mut() {
                    entry.tags = into_text(value)
                        .split([',', ';'])
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_owned)
                        .collect();
                }
            }
            (b"Key", b"String") => self.string_key = Some(into_text(value)),
            (b"Value", b"String") => self.string_value = value,
            (b"String", b"Entry") => {
                let key = self.string_key.take();
                let value = self.string_value.take();
                if let (Some(key), Some(value), Some(entry)) = (key, value, self.entries.last_mut())
                {
                    entry.fields.push(Field { key, value });
                }
            }
            (b"Entry", _) => self.finish_entry(parent.as_slice() == b"History"),
            (b"Group", _) => self.finish_group(parent.as_slice() == b"Root"),
            _ => {}
        }
        Ok(())
    }

    /// Decrypt one protected value. `None` when the stream is unknown.
    fn reveal(&mut self, text: &str) -> Result<Option<String>, UnlockError> {
        let encoded = text.trim();
        if encoded.is_empty() {
            return Ok(Some(String::new()));
        }
        match &mut self.stream {
            ProtectedStream::Unknown(_) => {
                self.skipped = self.skipped.saturating_add(1);
                Ok(None)
            }
            ProtectedStream::Known(stream) => {
                let mut raw = BASE64
                    .decode(encoded.as_bytes())
                    .map_err(|e| UnlockError::corrupted(format!("protected value: {e}")))?;
                stream.apply(&mut raw);
                String::from_utf8(raw).map(Some).map_err(|e| {
                    e.into_bytes().zeroize();
                    UnlockError::corrupted("protected value is not UTF-8")
                })
            }
        }
    }

    fn decode_uuid(&mut self, text: &str) -> Uuid {
        let text = text.trim();
        if text.is_empty() {
            return Uuid::nil();
        }
        match BASE64
            .decode(text.as_bytes())
            .ok()
            .and_then(|raw| Uuid::from_slice(&raw).ok())
        {
            Some(uuid) => uuid,
            None => {
                let assigned = Uuid::new_v4();
                self.warnings.push(LoadWarning::InvalidUuid {
                    value: text.to_owned(),
                    assigned,
                });
                assigned
            }
        }
    }

    /// Replace a missing UUID and reassign duplicates.
    fn settle_uuid(&mut self, uuid: Uuid, name: &str) -> Uuid {
        let uuid = if uuid.is_nil() {
            let assigned = Uuid::new_v4();
            self.warnings.push(LoadWarning::MissingUuid {
                name: name.to_owned(),
                assigned,
            });
            assigned
        } else {
            uuid
        };
        if self.seen.insert(uuid) {
            return uuid;
        }
        let replacement = Uuid::new_v4();
        self.seen.insert(replacement);
        self.warnings.push(LoadWarning::DuplicateUuid {
            original: uuid,
            replacement,
        });
        replacement
    }

    fn finish_entry(&mut self, in_history: bool) {
        let Some(mut entry) = self.entries.pop() else {
            return;
        };
        if in_history {
            if let Some(owner) = self.entries.last_mut() {
                if entry.uuid.is_nil() {
                    entry.uuid = owner.uuid;
                }
                owner.history.push(entry);
            }
            return;
        }
        let title = entry.title().to_owned();
        entry.uuid = self.settle_uuid(entry.uuid, &title);
        if let Some(group) = self.groups.last_mut() {
            group.entries.push(entry);
        }
    }

    fn finish_group(&mut self, is_root: bool) {
        let Some(mut group) = self.groups.pop() else {
            return;
        };
        let name = group.name.clone();
        group.uuid = self.settle_uuid(group.uuid, &name);
        if let Some(parent) = self.groups.last_mut() {
            parent.groups.push(group);
        } else if is_root && self.root.is_none() {
            self.root = Some(group);
        }
    }

    fn finish(mut self) -> Result<(Database, Vec<LoadWarning>), UnlockError> {
        if !self.saw_document || !self.path.is_empty() {
            return Err(UnlockError::corrupted("truncated XML payload"));
        }
        let root = self
            .root
            .take()
            .ok_or_else(|| UnlockError::corrupted("payload has no root group"))?;
        if let ProtectedStream::Unknown(id) = self.stream {
            if self.skipped > 0 {
                tracing::warn!(id, skipped = self.skipped, "protected values skipped");
                self.warnings.push(LoadWarning::UnknownInnerStream {
                    id,
                    skipped: self.skipped,
                });
            }
        }
        let database = Database {
            meta: self.meta,
            root,
            binaries: Vec::new(),
        };
        Ok((database, self.warnings))
    }
}

fn into_text(value: Option<FieldValue>) -> String {
    match value {
        Some(FieldValue::Plain(text)) => text,
        Some(FieldValue::Protected(secret)) => secret.expose_secret().to_owned(),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Serialize `database`, protecting values with `stream`.
///
/// # Errors
///
/// Returns [`SaveError::Serialize`] if the writer fails.
pub(crate) fn write(
    database: &Database,
    stream: &mut InnerStream,
    header_hash: Option<&[u8]>,
) -> Result<Vec<u8>, SaveError> {
    let mut out = XmlOut {
        writer: Writer::new_with_indent(Vec::new(), b'\t', 1),
        stream,
    };
    out.event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), Some("yes"))))?;
    out.start("KeePassFile")?;

    out.start("Meta")?;
    out.leaf("Generator", &database.meta.generator)?;
    if let Some(hash) = header_hash {
        out.leaf("HeaderHash", &BASE64.encode(hash))?;
    }
    out.leaf("DatabaseName", &database.meta.database_name)?;
    out.end("Meta")?;

    out.start("Root")?;
    out.group(&database.root)?;
    out.event(Event::Empty(BytesStart::new("DeletedObjects")))?;
    out.end("Root")?;

    out.end("KeePassFile")?;
    Ok(out.writer.into_inner())
}

struct XmlOut<'s> {
    writer: Writer<Vec<u8>>,
    stream: &'s mut InnerStream,
}

impl XmlOut<'_> {
    fn event(&mut self, event: Event<'_>) -> Result<(), SaveError> {
        self.writer.write_event(event).map_err(SaveError::serialize)
    }

    fn start(&mut self, name: &str) -> Result<(), SaveError> {
        self.event(Event::Start(BytesStart::new(name)))
    }

    fn end(&mut self, name: &str) -> Result<(), SaveError> {
        self.event(Event::End(BytesEnd::new(name)))
    }

    fn leaf(&mut self, name: &str, text: &str) -> Result<(), SaveError> {
        self.start(name)?;
        self.event(Event::Text(BytesText::new(text)))?;
        self.end(name)
    }

    fn uuid(&mut self, uuid: &Uuid) -> Result<(), SaveError> {
        self.leaf("UUID", &BASE64.encode(uuid.as_bytes()))
    }

    fn group(&mut self, group: &Group) -> Result<(), SaveError> {
        self.start("Group")?;
        self.uuid(&group.uuid)?;
        self.leaf("Name", &group.name)?;
        self.leaf("Notes", &group.notes)?;
        for entry in &group.entries {
            self.entry(entry, true)?;
        }
        for child in &group.groups {
            self.group(child)?;
        }
        self.end("Group")
    }

    fn entry(&mut self, entry: &Entry, with_history: bool) -> Result<(), SaveError> {
        self.start("Entry")?;
        self.uuid(&entry.uuid)?;
        if !entry.tags.is_empty() {
            self.leaf("Tags", &entry.tags.join(";"))?;
        }
        for field in &entry.fields {
            self.start("String")?;
            self.leaf("Key", &field.key)?;
            match &field.value {
                FieldValue::Plain(text) => self.leaf("Value", text)?,
                FieldValue::Protected(_) => {
                    let mut raw = field.value.expose().as_bytes().to_vec();
                    self.stream.apply(&mut raw);
                    let mut start = BytesStart::new("Value");
                    start.push_attribute(("Protected", "True"));
                    self.event(Event::Start(start))?;
                    self.event(Event::Text(BytesText::new(&BASE64.encode(&raw))))?;
                    self.end("Value")?;
                }
            }
            self.end("String")?;
        }
        if with_history && !entry.history.is_empty() {
            self.start("History")?;
            for old in &entry.history {
                self.entry(old, false)?;
            }
            self.end("History")?;
        }
        self.end("Entry")
    }
}
