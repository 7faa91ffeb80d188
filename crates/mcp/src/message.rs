//! The message model carried by frames.

use crate::codec;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// A protocol message: a context string, opaque content and string metadata.
///
/// Metadata keys are unique and kept in sorted order, which makes the wire
/// encoding of a message canonical.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    context: String,
    content: Bytes,
    metadata: BTreeMap<String, String>,
}

impl Message {
    /// Create an empty message for the given context.
    #[must_use]
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            content: Bytes::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Build a message from raw parts.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a metadata key appears more than once.
    pub fn from_parts<K, V>(
        context: impl Into<String>,
        content: impl Into<Bytes>,
        metadata: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut message = Self::new(context).with_content(content);
        for (key, value) in metadata {
            match message.metadata.entry(key.into()) {
                Entry::Occupied(entry) => {
                    return Err(Error::validation(format!(
                        "duplicate metadata key: {}",
                        entry.key()
                    )));
                }
                Entry::Vacant(entry) => {
                    entry.insert(value.into());
                }
            }
        }
        Ok(message)
    }

    /// Set the content.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = content.into();
        self
    }

    /// Add a metadata entry, replacing any previous value for the key.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The context string.
    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Replace the context string.
    pub fn set_context(&mut self, context: impl Into<String>) {
        self.context = context.into();
    }

    /// The content bytes.
    #[must_use]
    pub const fn content(&self) -> &Bytes {
        &self.content
    }

    /// Replace the content bytes.
    pub fn set_content(&mut self, content: impl Into<Bytes>) {
        self.content = content.into();
    }

    /// All metadata entries, sorted by key.
    #[must_use]
    pub const fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Look up a metadata value.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Insert a metadata entry, returning the value it replaced.
    pub fn insert_metadata(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Option<String> {
        self.metadata.insert(key.into(), value.into())
    }

    /// Remove a metadata entry.
    pub fn remove_metadata(&mut self, key: &str) -> Option<String> {
        self.metadata.remove(key)
    }

    /// Check that every length fits the wire format's fixed-width fields.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first field that is too long.
    pub fn validate(&self) -> Result<()> {
        check_len("context", self.context.len())?;
        check_len("content", self.content.len())?;
        check_len("metadata", self.metadata.len())?;
        for (key, value) in &self.metadata {
            check_len("metadata key", key.len())?;
            check_len("metadata value", value.len())?;
        }
        Ok(())
    }

    /// Encode the message on its own, without the frame envelope.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the message does not fit the wire format.
    pub fn serialize(&self) -> Result<Bytes> {
        codec::encode_payload(self)
    }

    /// Decode a message produced by [`Message::serialize`].
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the bytes are not a well-formed payload.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        codec::decode_payload(bytes)
    }
}

fn check_len(field: &str, len: usize) -> Result<()> {
    if u32::try_from(len).is_err() {
        return Err(Error::validation(format!(
            "{field} length {len} exceeds {}",
            u32::MAX
        )));
    }
    Ok(())
}
