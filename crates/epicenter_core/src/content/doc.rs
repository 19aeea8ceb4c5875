//! Per-file content document with a polymorphic version timeline.
//!
//! Each file's content lives in its own CRDT document (guid = file id,
//! gc off so history survives) holding a single top-level array `timeline`.
//! Every timeline entry is a map with a `type` discriminant:
//!
//! | `type`       | keys                                         |
//! |--------------|----------------------------------------------|
//! | `"text"`     | `content`: nested Y.Text                     |
//! | `"richtext"` | `body`: Y.XmlFragment, `frontmatter`: Y.Map  |
//! | `"binary"`   | `data`: atomic byte buffer                   |
//!
//! The current version is always the entry at the last index — O(1) and
//! convergent, since concurrent pushes land in clientID-determined order.
//! Same-mode text edits mutate the nested text in place (preserving
//! character-level merge); every mode switch appends an entry with freshly
//! allocated nested types, so prior versions are never deleted and no
//! deletion tombstones accumulate across switches.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, GetString, In, Map, MapPrelim, MapRef, Options, Out, ReadTxn,
    StateVector, Subscription, Text, TextPrelim, TextRef, Transact, TransactionMut, Update,
    XmlFragmentPrelim, XmlFragmentRef,
};

use crate::error::{EpicenterError, Result};

/// Name of the top-level timeline array.
const TIMELINE_NAME: &str = "timeline";

const TYPE_FIELD: &str = "type";
const CONTENT_FIELD: &str = "content";
const BODY_FIELD: &str = "body";
const FRONTMATTER_FIELD: &str = "frontmatter";
const DATA_FIELD: &str = "data";

/// Discriminant of a timeline version entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Collaborative plain text (nested Y.Text)
    Text,
    /// Rich text: XML body plus frontmatter map
    RichText,
    /// Opaque bytes, written atomically
    Binary,
}

impl ContentKind {
    fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::RichText => "richtext",
            ContentKind::Binary => "binary",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ContentKind::Text),
            "richtext" => Some(ContentKind::RichText),
            "binary" => Some(ContentKind::Binary),
            _ => None,
        }
    }
}

/// Summary of one timeline version (history inspection).
#[derive(Debug, Clone, PartialEq)]
pub struct VersionInfo {
    /// Index in the timeline; the highest index is the current version
    pub index: u32,
    /// Discriminant, or `None` for a foreign/malformed entry
    pub kind: Option<ContentKind>,
    /// Byte length of the version's rendered content
    pub byte_len: u64,
}

/// A single file's content document.
pub struct ContentDoc {
    doc: Doc,
    timeline: ArrayRef,
}

impl ContentDoc {
    /// Create the content document for `file_id`. The document guid is the
    /// file id; garbage collection is off so every version stays inspectable.
    pub fn new(file_id: &str) -> Self {
        let mut options = Options::default();
        options.guid = file_id.into();
        options.skip_gc = true;
        Self::with_doc(Doc::with_options(options))
    }

    /// Like [`new`](Self::new) with a pinned client id (deterministic
    /// ordering in tests).
    pub fn with_client_id(file_id: &str, client_id: u64) -> Self {
        let mut options = Options::default();
        options.guid = file_id.into();
        options.skip_gc = true;
        options.client_id = client_id;
        Self::with_doc(Doc::with_options(options))
    }

    fn with_doc(doc: Doc) -> Self {
        let timeline = doc.get_or_insert_array(TIMELINE_NAME);
        Self { doc, timeline }
    }

    /// The file id (document guid).
    pub fn file_id(&self) -> String {
        self.doc.guid().to_string()
    }

    /// The underlying document (provider attachment point).
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Number of versions in the timeline.
    pub fn version_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.timeline.len(&txn)
    }

    fn entry_at<T: ReadTxn>(&self, txn: &T, index: u32) -> Option<MapRef> {
        match self.timeline.get(txn, index)? {
            Out::YMap(map) => Some(map),
            _ => None,
        }
    }

    fn current_entry<T: ReadTxn>(&self, txn: &T) -> Option<MapRef> {
        let len = self.timeline.len(txn);
        if len == 0 {
            return None;
        }
        self.entry_at(txn, len - 1)
    }

    fn kind_of<T: ReadTxn>(entry: &MapRef, txn: &T) -> Option<ContentKind> {
        match entry.get(txn, TYPE_FIELD)? {
            Out::Any(Any::String(s)) => ContentKind::parse(&s),
            _ => None,
        }
    }

    /// The discriminant of the current version, or `None` for an empty
    /// timeline.
    pub fn current_kind(&self) -> Option<ContentKind> {
        let txn = self.doc.transact();
        let entry = self.current_entry(&txn)?;
        Self::kind_of(&entry, &txn)
    }

    /// The discriminant of the version at `index` (history inspection).
    pub fn kind_at(&self, index: u32) -> Option<ContentKind> {
        let txn = self.doc.transact();
        let entry = self.entry_at(&txn, index)?;
        Self::kind_of(&entry, &txn)
    }

    // ==================== Reads ====================

    fn render_text<T: ReadTxn>(entry: &MapRef, txn: &T) -> String {
        match Self::kind_of(entry, txn) {
            Some(ContentKind::Text) => match entry.get(txn, CONTENT_FIELD) {
                Some(Out::YText(text)) => text.get_string(txn),
                _ => String::new(),
            },
            Some(ContentKind::RichText) => Self::render_richtext(entry, txn),
            Some(ContentKind::Binary) => match entry.get(txn, DATA_FIELD) {
                Some(Out::Any(Any::Buffer(bytes))) => {
                    String::from_utf8_lossy(&bytes).into_owned()
                }
                _ => String::new(),
            },
            None => String::new(),
        }
    }

    fn render_bytes<T: ReadTxn>(entry: &MapRef, txn: &T) -> Vec<u8> {
        match Self::kind_of(entry, txn) {
            Some(ContentKind::Binary) => match entry.get(txn, DATA_FIELD) {
                Some(Out::Any(Any::Buffer(bytes))) => bytes.to_vec(),
                _ => Vec::new(),
            },
            _ => Self::render_text(entry, txn).into_bytes(),
        }
    }

    fn render_richtext<T: ReadTxn>(entry: &MapRef, txn: &T) -> String {
        let mut out = String::new();
        if let Some(Out::YMap(front)) = entry.get(txn, FRONTMATTER_FIELD)
            && front.len(txn) > 0
        {
            out.push_str("---\n");
            let mut keys: Vec<String> = front.keys(txn).map(String::from).collect();
            keys.sort();
            for key in keys {
                let rendered = match front.get(txn, &key) {
                    Some(Out::Any(Any::String(s))) => s.to_string(),
                    Some(Out::Any(other)) => other.to_string(),
                    _ => continue,
                };
                out.push_str(&key);
                out.push_str(": ");
                out.push_str(&rendered);
                out.push('\n');
            }
            out.push_str("---\n");
        }
        if let Some(Out::YXmlFragment(body)) = entry.get(txn, BODY_FIELD) {
            out.push_str(&body.get_string(txn));
        }
        out
    }

    /// Read the current version as text. Binary versions decode as UTF-8
    /// (lossy); an empty timeline reads as the empty string.
    pub fn read_text(&self) -> String {
        let txn = self.doc.transact();
        match self.current_entry(&txn) {
            Some(entry) => Self::render_text(&entry, &txn),
            None => String::new(),
        }
    }

    /// Read the current version as bytes. Text versions encode as UTF-8; an
    /// empty timeline reads as empty bytes.
    pub fn read_bytes(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        match self.current_entry(&txn) {
            Some(entry) => Self::render_bytes(&entry, &txn),
            None => Vec::new(),
        }
    }

    /// Read a historical version as bytes.
    pub fn bytes_at(&self, index: u32) -> Option<Vec<u8>> {
        let txn = self.doc.transact();
        let entry = self.entry_at(&txn, index)?;
        Some(Self::render_bytes(&entry, &txn))
    }

    /// Summaries of every version, oldest first. Entries are never mutated
    /// after being superseded, so this is a stable view of the file's
    /// history.
    pub fn versions(&self) -> Vec<VersionInfo> {
        let txn = self.doc.transact();
        let len = self.timeline.len(&txn);
        (0..len)
            .map(|index| match self.entry_at(&txn, index) {
                Some(entry) => VersionInfo {
                    index,
                    kind: Self::kind_of(&entry, &txn),
                    byte_len: Self::render_bytes(&entry, &txn).len() as u64,
                },
                None => VersionInfo {
                    index,
                    kind: None,
                    byte_len: 0,
                },
            })
            .collect()
    }

    /// Byte length of the current version (size bookkeeping).
    pub fn current_byte_len(&self) -> u64 {
        let txn = self.doc.transact();
        match self.current_entry(&txn) {
            Some(entry) => match Self::kind_of(&entry, &txn) {
                Some(ContentKind::Text) => match entry.get(&txn, CONTENT_FIELD) {
                    Some(Out::YText(text)) => text.len(&txn) as u64,
                    _ => 0,
                },
                Some(ContentKind::Binary) => match entry.get(&txn, DATA_FIELD) {
                    Some(Out::Any(Any::Buffer(bytes))) => bytes.len() as u64,
                    _ => 0,
                },
                Some(ContentKind::RichText) => Self::render_richtext(&entry, &txn).len() as u64,
                None => 0,
            },
            None => 0,
        }
    }

    // ==================== Writes ====================

    /// Write text content.
    ///
    /// When the current version is already text, the nested Y.Text is edited
    /// in place with a minimal diff, preserving CRDT identity of unchanged
    /// runs. Otherwise a new text entry with a fresh nested Y.Text is
    /// appended (mode switch; prior entries stay untouched).
    pub fn write_text(&self, content: &str) {
        let mut txn = self.doc.transact_mut();
        if let Some(entry) = self.current_entry(&txn)
            && Self::kind_of(&entry, &txn) == Some(ContentKind::Text)
            && let Some(Out::YText(text)) = entry.get(&txn, CONTENT_FIELD)
        {
            apply_text_diff(&text, &mut txn, content);
            return;
        }
        let entry = MapPrelim::from_iter([
            (
                TYPE_FIELD,
                In::Any(Any::String(ContentKind::Text.as_str().into())),
            ),
            (CONTENT_FIELD, In::Text(TextPrelim::new(content.to_string()).into())),
        ]);
        self.timeline.push_back(&mut txn, entry);
    }

    /// Append a chunk of text.
    ///
    /// Text versions are extended in place; any other current version is
    /// rendered to text, concatenated, and appended as a new text entry. An
    /// empty timeline behaves like [`write_text`](Self::write_text).
    pub fn append_text(&self, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        match self.current_entry(&txn) {
            Some(entry) if Self::kind_of(&entry, &txn) == Some(ContentKind::Text) => {
                if let Some(Out::YText(text)) = entry.get(&txn, CONTENT_FIELD) {
                    let end = text.len(&txn);
                    text.insert(&mut txn, end, chunk);
                }
            }
            Some(entry) => {
                let mut combined = Self::render_text(&entry, &txn);
                combined.push_str(chunk);
                let new_entry = MapPrelim::from_iter([
                    (
                        TYPE_FIELD,
                        In::Any(Any::String(ContentKind::Text.as_str().into())),
                    ),
                    (CONTENT_FIELD, In::Text(TextPrelim::new(combined).into())),
                ]);
                self.timeline.push_back(&mut txn, new_entry);
            }
            None => {
                let new_entry = MapPrelim::from_iter([
                    (
                        TYPE_FIELD,
                        In::Any(Any::String(ContentKind::Text.as_str().into())),
                    ),
                    (CONTENT_FIELD, In::Text(TextPrelim::new(chunk.to_string()).into())),
                ]);
                self.timeline.push_back(&mut txn, new_entry);
            }
        }
    }

    /// Write binary content. Every binary write appends a new version entry;
    /// the bytes are atomic and never edited in place.
    pub fn write_binary(&self, data: &[u8]) {
        let mut txn = self.doc.transact_mut();
        let entry = MapPrelim::from_iter([
            (
                TYPE_FIELD,
                In::Any(Any::String(ContentKind::Binary.as_str().into())),
            ),
            (DATA_FIELD, In::Any(Any::Buffer(data.into()))),
        ]);
        self.timeline.push_back(&mut txn, entry);
    }

    /// Append a rich-text version with freshly allocated nested types and
    /// return its body and frontmatter handles for collaborative editing.
    pub fn push_richtext(&self) -> (XmlFragmentRef, MapRef) {
        let mut txn = self.doc.transact_mut();
        let entry = MapPrelim::from_iter([
            (
                TYPE_FIELD,
                In::Any(Any::String(ContentKind::RichText.as_str().into())),
            ),
            (BODY_FIELD, In::XmlFragment(XmlFragmentPrelim::default())),
            (FRONTMATTER_FIELD, In::Map(MapPrelim::default())),
        ]);
        let map: MapRef = self.timeline.push_back(&mut txn, entry);
        let body = match map.get(&txn, BODY_FIELD) {
            Some(Out::YXmlFragment(f)) => f,
            _ => unreachable!("freshly pushed richtext entry has a body fragment"),
        };
        (body, map)
    }

    /// The nested Y.Text of the current version, when it is text.
    pub fn current_text(&self) -> Option<TextRef> {
        let txn = self.doc.transact();
        let entry = self.current_entry(&txn)?;
        if Self::kind_of(&entry, &txn) != Some(ContentKind::Text) {
            return None;
        }
        match entry.get(&txn, CONTENT_FIELD) {
            Some(Out::YText(text)) => Some(text),
            _ => None,
        }
    }

    // ==================== Sync Operations ====================

    /// Encode the current state vector for sync.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full state as an update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the diff between the current state and a remote state vector.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| EpicenterError::Crdt(format!("failed to decode state vector: {}", e)))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply an update from a remote peer.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| EpicenterError::Crdt(format!("failed to decode update: {}", e)))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| EpicenterError::Crdt(format!("failed to apply update: {}", e)))?;
        Ok(())
    }

    /// Observe the raw v1 update stream (persistence and sync providers).
    pub fn observe_updates<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |_txn, event| {
                callback(&event.update);
            })
            .expect("Failed to observe document updates")
    }
}

impl std::fmt::Debug for ContentDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentDoc")
            .field("file_id", &self.file_id())
            .field("versions", &self.version_count())
            .finish()
    }
}

/// Mutate `text` into `new` with the minimal delete+insert, so unchanged runs
/// keep their CRDT identity. Offsets are UTF-8 bytes aligned to char
/// boundaries.
fn apply_text_diff(text: &TextRef, txn: &mut TransactionMut, new: &str) {
    let current = text.get_string(txn);
    if current == new {
        return;
    }
    let cur_bytes = current.as_bytes();
    let new_bytes = new.as_bytes();

    let mut prefix = cur_bytes
        .iter()
        .zip(new_bytes.iter())
        .take_while(|(a, b)| a == b)
        .count();
    while prefix > 0 && (!current.is_char_boundary(prefix) || !new.is_char_boundary(prefix)) {
        prefix -= 1;
    }

    let max_suffix = cur_bytes.len().min(new_bytes.len()) - prefix;
    let mut suffix = cur_bytes
        .iter()
        .rev()
        .zip(new_bytes.iter().rev())
        .take_while(|(a, b)| a == b)
        .count()
        .min(max_suffix);
    while suffix > 0
        && (!current.is_char_boundary(cur_bytes.len() - suffix)
            || !new.is_char_boundary(new_bytes.len() - suffix))
    {
        suffix -= 1;
    }

    let delete_len = cur_bytes.len() - prefix - suffix;
    if delete_len > 0 {
        text.remove_range(txn, prefix as u32, delete_len as u32);
    }
    let insert = &new[prefix..new_bytes.len() - suffix];
    if !insert.is_empty() {
        text.insert(txn, prefix as u32, insert);
    }
}
