use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;

use super::interceptor::{Interceptor, InterceptorHook, InterceptorRegistry, Timepoint};
use super::protocol::ResourceProtocol;
use super::request::ResourceRequest;
use super::response::{ResourceResponse, ResponseStatus};
use crate::config::{MessageIdentity, ResourceConfig};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::queue::MessageQueue;

/// How a finished response reaches the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
    /// Returned directly. Nothing may suspend.
    Synchronous,
    /// Returned as a future.
    Deferred,
    /// Published as an asynchronous message; listeners observe it.
    #[default]
    ViaDispatch,
}

/// Result of [`ResourceManager::apply`].
pub enum Applied {
    Response(ResourceResponse),
    Deferred(BoxFuture<'static, Result<ResourceResponse>>),
    Dispatched,
}

impl Applied {
    pub fn into_response(self) -> Option<ResourceResponse> {
        match self {
            Applied::Response(response) => Some(response),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Applied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Applied::Response(response) => f.debug_tuple("Response").field(response).finish(),
            Applied::Deferred(_) => f.write_str("Deferred(..)"),
            Applied::Dispatched => f.write_str("Dispatched"),
        }
    }
}

struct ProtocolEntry {
    name: String,
    provider: Arc<dyn ResourceProtocol>,
}

struct Inner {
    queue: MessageQueue,
    response: MessageIdentity,
    protocols: RwLock<Vec<ProtocolEntry>>,
    interceptors: Arc<InterceptorRegistry>,
}

/// Protocol and interceptor registries plus the request lifecycle.
///
/// Clones share the same registries.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl ResourceManager {
    pub fn new(queue: MessageQueue) -> Self {
        Self::with_config(queue, &ResourceConfig::default())
    }

    pub fn with_config(queue: MessageQueue, config: &ResourceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                response: config.response.clone(),
                protocols: RwLock::new(Vec::new()),
                interceptors: Arc::new(InterceptorRegistry::default()),
            }),
        }
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.inner.queue
    }

    /// Mask and tag of messages published by [`RequestMode::ViaDispatch`].
    pub fn response_identity(&self) -> &MessageIdentity {
        &self.inner.response
    }

    /// Register a provider under every name it claims.
    ///
    /// Returns false, and changes nothing, if this exact provider is
    /// already registered.
    pub fn register_protocol(&self, provider: Arc<dyn ResourceProtocol>) -> bool {
        let mut protocols = self.inner.protocols.write();
        if protocols
            .iter()
            .any(|entry| same_provider(&entry.provider, &provider))
        {
            return false;
        }
        for name in provider.protocols() {
            tracing::debug!(protocol = %name, "protocol registered");
            protocols.push(ProtocolEntry {
                name: name.clone(),
                provider: provider.clone(),
            });
        }
        true
    }

    /// The provider for `name`. The latest registration wins.
    pub fn find_protocol(&self, name: &str) -> Option<Arc<dyn ResourceProtocol>> {
        self.inner
            .protocols
            .read()
            .iter()
            .rev()
            .find(|entry| entry.name == name)
            .map(|entry| entry.provider.clone())
    }

    /// Stop serving `name`. The provider keeps any other names it claims.
    pub fn drop_protocol(&self, name: &str) -> Option<Arc<dyn ResourceProtocol>> {
        let provider = self.find_protocol(name)?;
        self.inner.protocols.write().retain(|entry| entry.name != name);
        Some(provider)
    }

    /// Remove every provider, returning each one once.
    pub fn drop_all_protocols(&self) -> Vec<Arc<dyn ResourceProtocol>> {
        let entries = std::mem::take(&mut *self.inner.protocols.write());
        let mut dropped: Vec<Arc<dyn ResourceProtocol>> = Vec::new();
        for entry in entries {
            if !dropped.iter().any(|p| same_provider(p, &entry.provider)) {
                dropped.push(entry.provider);
            }
        }
        dropped
    }

    /// Register `interceptor` for `timepoints`, or every timepoint when
    /// `None`. Adds to an existing registration of the same interceptor.
    pub fn use_interceptor(&self, interceptor: Arc<dyn Interceptor>, timepoints: Option<Timepoint>) {
        self.inner
            .interceptors
            .add(interceptor, timepoints.unwrap_or_else(Timepoint::all));
    }

    pub fn drop_interceptor(&self, interceptor: &Arc<dyn Interceptor>, timepoints: Option<Timepoint>) {
        self.inner
            .interceptors
            .remove(interceptor, timepoints.unwrap_or_else(Timepoint::all));
    }

    pub fn drop_all_interceptors(&self) {
        self.inner.interceptors.clear();
    }

    pub fn interceptor_count(&self) -> usize {
        self.inner.interceptors.len()
    }

    /// Timepoints `interceptor` is registered for; empty when it is not.
    pub fn interceptor_timepoints(&self, interceptor: &Arc<dyn Interceptor>) -> Timepoint {
        self.inner.interceptors.timepoints(interceptor)
    }

    /// Run `request` through its lifecycle.
    ///
    /// Provider failures end in a `Failed` response, never in an error.
    /// Errors are reserved for a missing provider, a deferred value in
    /// synchronous mode, and dispatch without a runtime.
    pub fn apply(&self, request: ResourceRequest, mode: RequestMode) -> Result<Applied> {
        let provider = provider_of(&request)?;
        match mode {
            RequestMode::Synchronous => self.apply_sync(provider, request).map(Applied::Response),
            RequestMode::Deferred => Ok(Applied::Deferred(
                self.clone().apply_async(provider, request).boxed(),
            )),
            RequestMode::ViaDispatch => {
                self.dispatch(provider, request)?;
                Ok(Applied::Dispatched)
            }
        }
    }

    pub fn require_sync(&self, request: ResourceRequest) -> Result<ResourceResponse> {
        let provider = provider_of(&request)?;
        self.apply_sync(provider, request)
    }

    pub async fn require(&self, request: ResourceRequest) -> Result<ResourceResponse> {
        let provider = provider_of(&request)?;
        self.clone().apply_async(provider, request).await
    }

    pub fn publish(&self, request: ResourceRequest) -> Result<()> {
        let provider = provider_of(&request)?;
        self.dispatch(provider, request)
    }

    fn apply_sync(
        &self,
        provider: Arc<dyn ResourceProtocol>,
        request: ResourceRequest,
    ) -> Result<ResourceResponse> {
        let interceptors = &self.inner.interceptors;
        let mut response = ResourceResponse::new(request);
        let data = interceptors.run_sync(&response, Value::Null, Timepoint::AFTER_PREPARED)?;
        response.set_data(data);
        response.advance(ResponseStatus::Sending)?;

        let hook = InterceptorHook::new(interceptors.clone(), response.clone());
        let outcome = provider.request_sync(response.request(), &hook);
        if let Some(violation) = hook.take_violation() {
            return Err(violation);
        }

        let (status, timepoint, data) = settle(&response, outcome);
        response.advance(status)?;
        let data = interceptors.run_sync(&response, data, timepoint)?;
        response.set_data(data);
        Ok(response)
    }

    async fn apply_async(
        self,
        provider: Arc<dyn ResourceProtocol>,
        request: ResourceRequest,
    ) -> Result<ResourceResponse> {
        let interceptors = &self.inner.interceptors;
        let mut response = ResourceResponse::new(request);
        let data = interceptors
            .run(&response, Value::Null, Timepoint::AFTER_PREPARED)
            .await;
        response.set_data(data);
        response.advance(ResponseStatus::Sending)?;

        let hook = InterceptorHook::new(interceptors.clone(), response.clone());
        let outcome = provider.request(response.request(), &hook).await;

        let (status, timepoint, data) = settle(&response, outcome);
        response.advance(status)?;
        let data = interceptors.run(&response, data, timepoint).await;
        response.set_data(data);
        Ok(response)
    }

    fn dispatch(&self, provider: Arc<dyn ResourceProtocol>, request: ResourceRequest) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let manager = self.clone();
        runtime.spawn(async move {
            let uri = request.uri();
            let response = match manager.clone().apply_async(provider, request).await {
                Ok(response) => response,
                Err(error) => {
                    tracing::error!(%uri, error = %error, "cannot complete dispatched request");
                    return;
                }
            };
            let payload = match serde_json::to_value(response.metadata()) {
                Ok(payload) => payload,
                Err(error) => {
                    tracing::error!(%uri, error = %error, "cannot encode response");
                    return;
                }
            };
            let identity = manager.response_identity();
            let message = Message::from_value(payload).mark(identity.mask, identity.tag.clone());
            manager.queue().send_async(message).await;
        });
        Ok(())
    }
}

fn provider_of(request: &ResourceRequest) -> Result<Arc<dyn ResourceProtocol>> {
    request.provider().cloned().ok_or_else(|| Error::NoProvider {
        protocol: request.protocol().to_string(),
    })
}

fn same_provider(a: &Arc<dyn ResourceProtocol>, b: &Arc<dyn ResourceProtocol>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Terminal status, timepoint and incoming interceptor data for an outcome.
fn settle(
    response: &ResourceResponse,
    outcome: anyhow::Result<Value>,
) -> (ResponseStatus, Timepoint, Value) {
    match outcome {
        Ok(data) => (ResponseStatus::Succeeded, Timepoint::ON_SUCCEED, data),
        Err(error) => {
            tracing::warn!(
                uri = %response.request().uri(),
                error = %format!("{error:#}"),
                "resource request failed"
            );
            (
                ResponseStatus::Failed,
                Timepoint::ON_FAILED,
                Value::String(format!("{error:#}")),
            )
        }
    }
}
