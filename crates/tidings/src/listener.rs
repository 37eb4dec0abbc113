//! Listeners: a filter, a priority, a cardinality and a transform.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::message::Message;

/// What a transform produced for one message.
///
/// `Ok(None)` forwards the incoming message unchanged.
pub enum Reply {
    Immediate(anyhow::Result<Option<Message>>),
    Deferred(BoxFuture<'static, anyhow::Result<Option<Message>>>),
}

impl Reply {
    pub fn pass() -> Self {
        Reply::Immediate(Ok(None))
    }

    pub fn message(message: Message) -> Self {
        Reply::Immediate(Ok(Some(message)))
    }

    pub fn fail(error: impl Into<anyhow::Error>) -> Self {
        Reply::Immediate(Err(error.into()))
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<Option<Message>>> + Send + 'static,
    {
        Reply::Deferred(future.boxed())
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Reply::Deferred(_))
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Immediate(result) => f.debug_tuple("Immediate").field(result).finish(),
            Reply::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

pub type Transform = Arc<dyn Fn(Message) -> Reply + Send + Sync>;

/// A message listener.
///
/// Clones share the same id, so registering a clone of an already registered
/// listener returns the existing node.
#[derive(Clone)]
pub struct Listener {
    id: String,
    mask: u64,
    tags: SmallVec<[String; 2]>,
    priority: i32,
    once: bool,
    enabled: bool,
    transform: Option<Transform>,
}

impl Listener {
    fn new(mask: u64, once: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mask,
            tags: SmallVec::new(),
            priority: 0,
            once,
            enabled: true,
            transform: None,
        }
    }

    /// A persistent listener for `mask`.
    pub fn on(mask: u64) -> Self {
        Self::new(mask, false)
    }

    /// A fire-once listener for `mask`.
    pub fn once(mask: u64) -> Self {
        Self::new(mask, true)
    }

    /// Replace the generated id.
    ///
    /// The queue keys nodes by id: registering a different listener under
    /// an id that is already in use fails with `DuplicateListener`.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Add a tag to the filter. Duplicates are ignored.
    pub fn listen(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    /// Match every tag under the mask.
    pub fn listen_all(mut self) -> Self {
        self.tags.clear();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn as_once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn as_persistent(mut self) -> Self {
        self.once = false;
        self
    }

    /// Register in disabled state.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn handle<F>(mut self, f: F) -> Self
    where
        F: Fn(Message) -> Reply + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }

    pub fn map<F>(self, f: F) -> Self
    where
        F: Fn(Message) -> Message + Send + Sync + 'static,
    {
        self.handle(move |message| Reply::message(f(message)))
    }

    pub fn try_map<F>(self, f: F) -> Self
    where
        F: Fn(Message) -> anyhow::Result<Message> + Send + Sync + 'static,
    {
        self.handle(move |message| Reply::Immediate(f(message).map(Some)))
    }

    /// Observe messages without changing them.
    pub fn inspect<F>(self, f: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.handle(move |message| {
            f(&message);
            Reply::pass()
        })
    }

    pub fn map_async<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Message>> + Send + 'static,
    {
        self.handle(move |message| {
            let fut = f(message);
            Reply::deferred(async move { fut.await.map(Some) })
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_once(&self) -> bool {
        self.once
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a message addressed by `mask` and `tag` reaches this listener.
    pub fn can_parse(&self, mask: u64, tag: Option<&str>) -> bool {
        if self.mask & mask == 0 {
            return false;
        }
        match tag {
            None => true,
            Some(tag) => self.tags.is_empty() || self.tags.iter().any(|t| t == tag),
        }
    }

    /// Whether `other` is this listener or a clone of it, possibly with
    /// different settings.
    pub(crate) fn is_same(&self, other: &Listener) -> bool {
        if self.id != other.id {
            return false;
        }
        match (&self.transform, &other.transform) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => self.mask == other.mask && self.tags == other.tags,
            _ => false,
        }
    }

    /// Apply the transform. Without one the message passes through.
    pub fn parse(&self, message: Message) -> Reply {
        match &self.transform {
            Some(transform) => transform(message),
            None => Reply::pass(),
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("mask", &self.mask)
            .field("tags", &self.tags)
            .field("priority", &self.priority)
            .field("once", &self.once)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}
