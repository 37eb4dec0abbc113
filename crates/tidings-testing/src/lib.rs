//! Test doubles for code built on tidings.
//!
//! - [`MockProtocol`] is a programmable resource provider that records every
//!   request it serves.
//! - [`Recorder`] hands out listeners that record the messages they see.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tidings::{InterceptorHook, Listener, Message, RequestKind, ResourceProtocol, ResourceRequest};
use tokio::sync::Notify;

/// Which provider entry point served a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Sync,
    Async,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub mode: CallMode,
    pub uri: String,
    pub kind: RequestKind,
    pub tags: Vec<String>,
    pub content: Option<Value>,
}

#[derive(Clone)]
enum Outcome {
    Value(Value),
    Failure(String),
}

impl Outcome {
    fn resolve(&self) -> anyhow::Result<Value> {
        match self {
            Outcome::Value(value) => Ok(value.clone()),
            Outcome::Failure(reason) => Err(anyhow::anyhow!("{reason}")),
        }
    }
}

/// A provider answering with programmed values or failures.
///
/// Answers are looked up by address first, then the default outcome is
/// used. Without any programming it answers `null`.
pub struct MockProtocol {
    protocols: Vec<String>,
    default: Mutex<Outcome>,
    by_address: Mutex<HashMap<String, Outcome>>,
    delay: Option<Duration>,
    supports_sync: bool,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockProtocol {
    pub fn new<I, S>(protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protocols: protocols.into_iter().map(Into::into).collect(),
            default: Mutex::new(Outcome::Value(Value::Null)),
            by_address: Mutex::new(HashMap::new()),
            delay: None,
            supports_sync: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn returning(self, value: impl Into<Value>) -> Self {
        *self.default.lock() = Outcome::Value(value.into());
        self
    }

    pub fn failing(self, reason: impl Into<String>) -> Self {
        *self.default.lock() = Outcome::Failure(reason.into());
        self
    }

    /// Answer requests for `address` with `value`.
    pub fn respond(&self, address: impl Into<String>, value: impl Into<Value>) {
        self.by_address
            .lock()
            .insert(address.into(), Outcome::Value(value.into()));
    }

    /// Fail requests for `address`.
    pub fn fail(&self, address: impl Into<String>, reason: impl Into<String>) {
        self.by_address
            .lock()
            .insert(address.into(), Outcome::Failure(reason.into()));
    }

    /// Sleep before answering asynchronous requests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Reject synchronous requests, as providers without a blocking path do.
    pub fn async_only(mut self) -> Self {
        self.supports_sync = false;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn record(&self, mode: CallMode, request: &ResourceRequest) {
        self.calls.lock().push(RecordedCall {
            mode,
            uri: request.uri(),
            kind: request.kind(),
            tags: request.tags().to_vec(),
            content: request.content().cloned(),
        });
    }

    fn answer(&self, request: &ResourceRequest) -> anyhow::Result<Value> {
        let outcome = self
            .by_address
            .lock()
            .get(request.address())
            .cloned()
            .unwrap_or_else(|| self.default.lock().clone());
        outcome.resolve()
    }
}

#[async_trait]
impl ResourceProtocol for MockProtocol {
    fn protocols(&self) -> &[String] {
        &self.protocols
    }

    fn request_sync(&self, request: &ResourceRequest, _hook: &InterceptorHook) -> anyhow::Result<Value> {
        self.record(CallMode::Sync, request);
        if !self.supports_sync {
            anyhow::bail!("mock protocol is async only");
        }
        self.answer(request)
    }

    async fn request(&self, request: &ResourceRequest, _hook: &InterceptorHook) -> anyhow::Result<Value> {
        self.record(CallMode::Async, request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.answer(request)
    }
}

/// Collects the messages seen by the listeners it creates, in order.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<(String, Message)>>>,
    notify: Arc<Notify>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A pass-through listener on `mask` recording under `name`.
    pub fn listener(&self, name: impl Into<String>, mask: u64) -> Listener {
        let name = name.into();
        let seen = self.seen.clone();
        let notify = self.notify.clone();
        Listener::on(mask).inspect(move |message| {
            seen.lock().push((name.clone(), message.clone()));
            notify.notify_waiters();
        })
    }

    pub fn messages(&self) -> Vec<Message> {
        self.seen.lock().iter().map(|(_, m)| m.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.seen.lock().iter().map(|(_, m)| m.value().clone()).collect()
    }

    /// Listener names in the order they were reached.
    pub fn order(&self) -> Vec<String> {
        self.seen.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }

    /// Wait until at least `count` messages were recorded.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}
