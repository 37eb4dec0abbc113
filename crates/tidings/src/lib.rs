//! # Tidings
//!
//! An in-process, priority-ordered publish/subscribe engine with a
//! protocol-agnostic resource request layer on top.
//!
//! ## Core Concepts
//!
//! - [`Message`] = an envelope addressed by a `mask` bitset and a `tag`
//! - [`Listener`] = a filter, a priority, a cardinality and a transform
//! - [`MessageQueue`] = the listener tree and the `send` walk over it
//! - [`ResourceManager`] = turns a [`ResourceRequest`] into a
//!   [`ResourceResponse`] through a pluggable [`ResourceProtocol`]
//!
//! A listener receives a message when `listener.mask & message.mask != 0`
//! and its tag set is empty, the message has no tag, or the tag is in the
//! set.
//!
//! ## Architecture
//!
//! ```text
//! producer
//!     │
//!     ▼ send()
//! MessageQueue ── pre-order walk ──► listener ─► listener ─► ... ─► Message
//!     ▲
//!     │ ViaDispatch (response metadata as an async message)
//!     │
//! ResourceManager
//!     │
//!     ├─► interceptors (AFTER_PREPARED)
//!     ├─► ResourceProtocol ─► interceptors (BEFORE_SEND, AFTER_SENT)
//!     └─► interceptors (ON_SUCCEED | ON_FAILED) ─► ResourceResponse
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Siblings are ordered** - Descending priority, newest first on ties
//! 2. **Children before siblings** - A listener's subtree runs before the next sibling
//! 3. **Disabled means invisible** - A disabled listener hides its whole subtree
//! 4. **Walks are snapshots** - Registrations during a send wait for the next one
//! 5. **Synchronous never suspends** - A deferred value there is an error, not a wait
//! 6. **Async delivery never aborts** - A failing listener is logged and skipped
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tidings::{
//!     Listener, MemoryProtocol, Message, MessageQueue, ResourceManager, ResourceRequest,
//! };
//!
//! let queue = MessageQueue::new();
//! queue.register(Listener::on(1).listen("X").with_priority(10).map(|m| {
//!     let n = m.value().as_i64().unwrap_or_default();
//!     m.with_value(n + 1)
//! }))?;
//! let result = queue.send_sync(Message::sync().mark(1, "X").with_value(0))?;
//! assert_eq!(result.value(), &serde_json::json!(1));
//!
//! let manager = ResourceManager::new(queue.clone());
//! manager.register_protocol(Arc::new(MemoryProtocol::new()));
//! let request = ResourceRequest::to(&manager, "storage:///a/b")?.submit(1);
//! let response = manager.require_sync(request)?;
//! assert!(response.is_success());
//! ```

mod component;
mod config;
mod error;
mod listener;
mod message;
mod queue;
mod share;
mod tree;

pub mod resource;

// Re-export configuration
pub use crate::config::{
    ComponentConfig, MessageIdentity, QueueConfig, ResourceConfig, TidingsConfig,
};

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export messaging types
pub use crate::listener::{Listener, Reply, Transform};
pub use crate::message::{Message, MessageMetadata, ShareMode};
pub use crate::queue::{ListenerHandle, MessageQueue, Sent};
pub use crate::tree::{NodeId, NodeRef, Tree};

// Re-export sharing types
pub use crate::share::{BroadcastShare, ShareTransport};

// Re-export component types
pub use crate::component::{Component, ComponentBuilder};

// Re-export resource types
pub use crate::resource::{
    interceptor_fn, Applied, Intercepted, Interceptor, InterceptorHook, MemoryProtocol,
    RequestKind, RequestMetadata, RequestMode, ResourceManager, ResourceProtocol, ResourceRequest,
    ResourceResponse, ResponseMetadata, ResponseStatus, Timepoint,
};

// Re-export commonly used external types
pub use async_trait::async_trait;
