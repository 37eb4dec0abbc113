//! Interceptors and their registry.

use std::future::Future;
use std::sync::Arc;

use bitflags::bitflags;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use super::request::ResourceRequest;
use super::response::ResourceResponse;
use crate::error::{Error, Result};

bitflags! {
    /// Lifecycle moments at which interceptors run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Timepoint: u32 {
        const AFTER_PREPARED = 1;
        /// Triggered by providers.
        const BEFORE_SEND = 1 << 1;
        /// Triggered by providers.
        const AFTER_SENT = 1 << 2;
        const ON_SUCCEED = 1 << 3;
        const ON_FAILED = 1 << 4;
    }
}

/// What an interceptor produced.
pub enum Intercepted {
    Immediate(Value),
    Deferred(BoxFuture<'static, Value>),
}

impl Intercepted {
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Value> + Send + 'static,
    {
        Intercepted::Deferred(future.boxed())
    }
}

impl From<Value> for Intercepted {
    fn from(value: Value) -> Self {
        Intercepted::Immediate(value)
    }
}

/// Rewrites response data at a [`Timepoint`].
///
/// `data` is the output of the previous interceptor of the same timepoint,
/// or the incoming data for the first one.
pub trait Interceptor: Send + Sync {
    fn intercept(
        &self,
        request: &ResourceRequest,
        response: &ResourceResponse,
        data: Value,
        timepoint: Timepoint,
    ) -> Intercepted;
}

impl<F> Interceptor for F
where
    F: Fn(&ResourceRequest, &ResourceResponse, Value, Timepoint) -> Intercepted + Send + Sync,
{
    fn intercept(
        &self,
        request: &ResourceRequest,
        response: &ResourceResponse,
        data: Value,
        timepoint: Timepoint,
    ) -> Intercepted {
        self(request, response, data, timepoint)
    }
}

/// Wrap a closure as a shareable interceptor.
///
/// Keep the returned `Arc`: it is the identity used to add timepoints to,
/// or drop, the registration later.
pub fn interceptor_fn<F>(f: F) -> Arc<dyn Interceptor>
where
    F: Fn(&ResourceRequest, &ResourceResponse, Value, Timepoint) -> Intercepted
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

struct Registration {
    interceptor: Arc<dyn Interceptor>,
    timepoints: Timepoint,
}

impl Registration {
    fn is(&self, interceptor: &Arc<dyn Interceptor>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.interceptor), Arc::as_ptr(interceptor))
    }
}

/// Interceptors in registration order, keyed by identity.
#[derive(Default)]
pub(crate) struct InterceptorRegistry {
    entries: RwLock<Vec<Registration>>,
}

impl InterceptorRegistry {
    /// Add `timepoints` to the interceptor's registration.
    pub(crate) fn add(&self, interceptor: Arc<dyn Interceptor>, timepoints: Timepoint) {
        if timepoints.is_empty() {
            return;
        }
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|entry| entry.is(&interceptor)) {
            Some(entry) => entry.timepoints |= timepoints,
            None => entries.push(Registration {
                interceptor,
                timepoints,
            }),
        }
    }

    /// Clear `timepoints`, dropping the registration once none remain.
    pub(crate) fn remove(&self, interceptor: &Arc<dyn Interceptor>, timepoints: Timepoint) {
        let mut entries = self.entries.write();
        for entry in entries.iter_mut().filter(|entry| entry.is(interceptor)) {
            entry.timepoints.remove(timepoints);
        }
        entries.retain(|entry| !entry.timepoints.is_empty());
    }

    pub(crate) fn clear(&self) {
        self.entries.write().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn timepoints(&self, interceptor: &Arc<dyn Interceptor>) -> Timepoint {
        self.entries
            .read()
            .iter()
            .find(|entry| entry.is(interceptor))
            .map_or(Timepoint::empty(), |entry| entry.timepoints)
    }

    /// Interceptors registered for `timepoint`, in registration order.
    pub(crate) fn chain(&self, timepoint: Timepoint) -> Vec<Arc<dyn Interceptor>> {
        self.entries
            .read()
            .iter()
            .filter(|entry| entry.timepoints.intersects(timepoint))
            .map(|entry| entry.interceptor.clone())
            .collect()
    }

    /// Run the chain for `timepoint` without suspending.
    pub(crate) fn run_sync(
        &self,
        response: &ResourceResponse,
        mut data: Value,
        timepoint: Timepoint,
    ) -> Result<Value> {
        for interceptor in self.chain(timepoint) {
            match interceptor.intercept(response.request(), response, data, timepoint) {
                Intercepted::Immediate(next) => data = next,
                Intercepted::Deferred(_) => {
                    return Err(Error::DeferredInSync {
                        origin: format!("interceptor at {timepoint:?}"),
                    })
                }
            }
        }
        Ok(data)
    }

    /// Run the chain for `timepoint`, awaiting deferred results in turn.
    pub(crate) async fn run(
        &self,
        response: &ResourceResponse,
        mut data: Value,
        timepoint: Timepoint,
    ) -> Value {
        for interceptor in self.chain(timepoint) {
            data = match interceptor.intercept(response.request(), response, data, timepoint) {
                Intercepted::Immediate(next) => next,
                Intercepted::Deferred(future) => future.await,
            };
        }
        data
    }
}

/// Lets a provider trigger the in-flight timepoints it supports.
pub struct InterceptorHook {
    registry: Arc<InterceptorRegistry>,
    response: ResourceResponse,
    violation: Mutex<Option<Error>>,
}

impl InterceptorHook {
    pub(crate) fn new(registry: Arc<InterceptorRegistry>, response: ResourceResponse) -> Self {
        Self {
            registry,
            response,
            violation: Mutex::new(None),
        }
    }

    /// The response as it stood when the provider was called.
    pub fn response(&self) -> &ResourceResponse {
        &self.response
    }

    /// Run interceptors for `timepoint` from a synchronous provider.
    ///
    /// A deferred interceptor result is a misuse; `data` is returned as is
    /// and the request fails once the provider returns.
    pub fn invoke_sync(&self, timepoint: Timepoint, data: Value) -> Value {
        match self.registry.run_sync(&self.response, data.clone(), timepoint) {
            Ok(data) => data,
            Err(error) => {
                self.violation.lock().get_or_insert(error);
                data
            }
        }
    }

    pub async fn invoke(&self, timepoint: Timepoint, data: Value) -> Value {
        self.registry.run(&self.response, data, timepoint).await
    }

    pub(crate) fn take_violation(&self) -> Option<Error> {
        self.violation.lock().take()
    }
}
