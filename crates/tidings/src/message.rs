//! Message envelopes.
//!
//! A message is addressed by a `mask` bitset and an optional `tag`. Its `id`
//! is assigned once at construction and survives every transformation and
//! conversion between the synchronous and asynchronous kinds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// How a message is echoed to sibling instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareMode {
    /// Never leaves this instance.
    Disabled,
    /// Posted as handed to `send`, before any local listener runs.
    #[default]
    Immediate,
    /// Posted once local delivery finished, carrying the final value.
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: String,
    mask: u64,
    tag: Option<String>,
    value: Value,
    synchronous: bool,
    share: ShareMode,
    from_peer: bool,
    created_at: DateTime<Utc>,
}

impl Message {
    fn new(synchronous: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mask: 0,
            tag: None,
            value: Value::Null,
            synchronous,
            share: ShareMode::default(),
            from_peer: false,
            created_at: Utc::now(),
        }
    }

    /// An empty synchronous message.
    pub fn sync() -> Self {
        Self::new(true)
    }

    /// An empty asynchronous message.
    pub fn deferred() -> Self {
        Self::new(false)
    }

    /// An asynchronous message carrying `value`.
    pub fn from_value(value: impl Into<Value>) -> Self {
        Self::deferred().with_value(value)
    }

    /// Rebuild a message received from a peer instance.
    pub fn from_metadata(metadata: MessageMetadata) -> Self {
        Self {
            id: metadata.id,
            mask: metadata.mask,
            tag: metadata.tag,
            value: metadata.value,
            synchronous: metadata.sync,
            share: metadata.share,
            from_peer: true,
            created_at: metadata.created_at,
        }
    }

    /// Set the mask and tag. An empty tag is treated as no tag.
    pub fn mark(mut self, mask: u64, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.mask = mask;
        self.tag = (!tag.is_empty()).then_some(tag);
        self
    }

    pub fn with_mask(mut self, mask: u64) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_share(mut self, share: ShareMode) -> Self {
        self.share = share;
        self
    }

    /// Copy as an asynchronous message, keeping id, mask, tag and value.
    pub fn to_async(&self) -> Self {
        Self {
            synchronous: false,
            ..self.clone()
        }
    }

    /// Copy as a synchronous message, keeping id, mask, tag and value.
    pub fn to_sync(&self) -> Self {
        Self {
            synchronous: true,
            ..self.clone()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    pub fn share(&self) -> ShareMode {
        self.share
    }

    /// Whether this message arrived from a sibling instance.
    pub fn is_from_peer(&self) -> bool {
        self.from_peer
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            id: self.id.clone(),
            sync: self.synchronous,
            share: self.share,
            mask: self.mask,
            tag: self.tag.clone(),
            value: self.value.clone(),
            created_at: self.created_at,
        }
    }
}

/// Serializable snapshot of a message, used on the sharing channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub id: String,
    pub sync: bool,
    pub share: ShareMode,
    pub mask: u64,
    pub tag: Option<String>,
    pub value: Value,
    pub created_at: DateTime<Utc>,
}
