use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::interceptor::{InterceptorHook, Timepoint};
use super::protocol::ResourceProtocol;
use super::request::{RequestKind, ResourceRequest};

/// In-process key/value provider, addressed by the request address.
///
/// Serves `memory://` and `storage://` unless given other names. Fetching
/// a missing key yields `null`.
pub struct MemoryProtocol {
    protocols: Vec<String>,
    entries: DashMap<String, Value>,
}

impl Default for MemoryProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProtocol {
    pub fn new() -> Self {
        Self::with_protocols(["memory", "storage"])
    }

    pub fn with_protocols<I, S>(protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protocols: protocols.into_iter().map(Into::into).collect(),
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, address: &str) -> Option<Value> {
        self.entries.get(address).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, address: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(address.into(), value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn perform(&self, request: &ResourceRequest, content: Value) -> Value {
        let address = request.address();
        match request.kind() {
            RequestKind::Fetch => self.get(address).unwrap_or(Value::Null),
            RequestKind::Submit => {
                self.entries.insert(address.to_string(), content.clone());
                content
            }
            RequestKind::Delete => self
                .entries
                .remove(address)
                .map(|(_, old)| old)
                .unwrap_or(Value::Null),
        }
    }
}

#[async_trait]
impl ResourceProtocol for MemoryProtocol {
    fn protocols(&self) -> &[String] {
        &self.protocols
    }

    fn request_sync(&self, request: &ResourceRequest, hook: &InterceptorHook) -> anyhow::Result<Value> {
        let content = request.content().cloned().unwrap_or(Value::Null);
        let content = hook.invoke_sync(Timepoint::BEFORE_SEND, content);
        let result = self.perform(request, content);
        Ok(hook.invoke_sync(Timepoint::AFTER_SENT, result))
    }

    async fn request(&self, request: &ResourceRequest, hook: &InterceptorHook) -> anyhow::Result<Value> {
        let content = request.content().cloned().unwrap_or(Value::Null);
        let content = hook.invoke(Timepoint::BEFORE_SEND, content).await;
        let result = self.perform(request, content);
        Ok(hook.invoke(Timepoint::AFTER_SENT, result).await)
    }
}
