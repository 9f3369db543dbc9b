use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Separator between the fields of a message payload, see [`Message::field`].
pub const FIELD_DELIMITER: u8 = b'\t';

/// An immutable record fetched from the external log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    partition: i32,
    offset: i64,
    key: Option<Bytes>,
    payload: Bytes,
}

impl Message {
    pub fn new(partition: i32, offset: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            payload: payload.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload decoded as UTF-8, replacing invalid sequences
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Get the `index`-th tab separated field of the payload.
    ///
    /// A payload without delimiters is a single field, so field 0 is the whole
    /// payload in that case.
    pub fn field(&self, index: usize) -> Option<&[u8]> {
        self.payload.split(|b| *b == FIELD_DELIMITER).nth(index)
    }

    /// Approximate number of bytes held by this message
    pub fn size(&self) -> usize {
        self.payload.len() + self.key.as_ref().map_or(0, |k| k.len())
    }
}

/// Durably recorded "last processed" offset for one partition of one source identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub source_id: String,
    pub partition: i32,
    pub committed_offset: i64,
}

impl Cursor {
    pub fn new(source_id: impl Into<String>, partition: i32, committed_offset: i64) -> Self {
        Self {
            source_id: source_id.into(),
            partition,
            committed_offset,
        }
    }

    /// The first offset a resumed reader should fetch
    pub fn resume_offset(&self) -> i64 {
        self.committed_offset + 1
    }
}
