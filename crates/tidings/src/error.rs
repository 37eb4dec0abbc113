//! Error types for the dispatch engine and the resource layer.
//!
//! Configuration errors and contract violations surface here. Failures that
//! belong to user code (listener transforms, protocol providers) are carried
//! as `anyhow::Error` and, outside of synchronous delivery, recovered into
//! data rather than returned.

use crate::resource::ResponseStatus;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A parent listener was given at registration but it has no tree node.
    #[error("cannot register listener {listener}: parent listener {parent} is not registered")]
    ParentNotFound { listener: String, parent: String },

    /// A different listener already holds this id.
    #[error("listener id {listener} is already taken by another listener")]
    DuplicateListener { listener: String },

    /// No protocol provider claims the requested protocol name.
    #[error("no provider registered for protocol `{protocol}`")]
    NoProvider { protocol: String },

    /// A resource URI without the `protocol://address` shape.
    #[error("invalid resource uri `{uri}`: expected protocol://address")]
    InvalidUri { uri: String },

    /// Deferred work was requested but no tokio runtime is running.
    #[error("deferred delivery requires a running tokio runtime")]
    NoRuntime,

    /// A deferred value appeared where a synchronous one was required.
    #[error("{origin} produced a deferred result during synchronous delivery")]
    DeferredInSync { origin: String },

    /// `send_sync` was called with an asynchronous message.
    #[error("message {message} is asynchronous and cannot be sent synchronously")]
    NotSynchronous { message: String },

    /// A listener transform failed during synchronous delivery.
    #[error("listener {listener} failed")]
    ListenerFailed {
        listener: String,
        #[source]
        source: anyhow::Error,
    },

    /// Response status transitions only move forward.
    #[error("invalid response transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ResponseStatus,
        to: ResponseStatus,
    },

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error reports a misuse of a delivery mode.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::DeferredInSync { .. } | Error::NotSynchronous { .. }
        )
    }

    /// Whether the error reports missing or malformed setup.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::ParentNotFound { .. }
                | Error::DuplicateListener { .. }
                | Error::NoProvider { .. }
                | Error::InvalidUri { .. }
                | Error::NoRuntime
                | Error::Config(_)
        )
    }
}
