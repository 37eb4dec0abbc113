//! Protocol-agnostic resource requests.
//!
//! A [`ResourceRequest`] names a resource by `protocol://address`. The
//! [`ResourceManager`] hands it to the [`ResourceProtocol`] registered for
//! that protocol and walks the response through its lifecycle:
//!
//! ```text
//! Preparing ──► Sending ──► Succeeded
//!                      └──► Failed
//! ```
//!
//! [`Interceptor`]s run at the lifecycle [`Timepoint`]s and may rewrite the
//! response data. Providers trigger the in-flight timepoints themselves
//! through the [`InterceptorHook`] they are given.

mod interceptor;
mod manager;
mod memory;
mod protocol;
mod request;
mod response;

pub use interceptor::{interceptor_fn, Intercepted, Interceptor, InterceptorHook, Timepoint};
pub use manager::{Applied, RequestMode, ResourceManager};
pub use memory::MemoryProtocol;
pub use protocol::ResourceProtocol;
pub use request::{RequestKind, RequestMetadata, ResourceRequest};
pub use response::{ResourceResponse, ResponseMetadata, ResponseStatus};
