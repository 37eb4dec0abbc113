use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::manager::ResourceManager;
use super::protocol::ResourceProtocol;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    #[default]
    Fetch,
    Submit,
    Delete,
}

/// A request for the resource at `protocol://address`.
///
/// The provider is resolved when the request is built, so a request for an
/// unknown protocol fails at [`ResourceRequest::to`] rather than when it is
/// applied.
#[derive(Clone)]
pub struct ResourceRequest {
    protocol: String,
    address: String,
    provider: Option<Arc<dyn ResourceProtocol>>,
    tags: Vec<String>,
    params: BTreeMap<String, Value>,
    content: Option<Value>,
    kind: RequestKind,
}

impl ResourceRequest {
    pub fn to(manager: &ResourceManager, uri: &str) -> Result<Self> {
        let (protocol, address) = split_uri(uri)?;
        Self::unresolved(protocol, address).resolve(manager)
    }

    pub(crate) fn unresolved(protocol: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            address: address.into(),
            provider: None,
            tags: Vec::new(),
            params: BTreeMap::new(),
            content: None,
            kind: RequestKind::Fetch,
        }
    }

    /// Rebuild a request from its metadata. It has no provider until
    /// [`resolve`](Self::resolve) is called.
    pub fn from_metadata(metadata: RequestMetadata) -> Self {
        Self {
            protocol: metadata.protocol,
            address: metadata.address,
            provider: None,
            tags: metadata.tags,
            params: metadata.params,
            content: metadata.content,
            kind: metadata.kind,
        }
    }

    /// Bind the provider registered for this request's protocol.
    pub fn resolve(mut self, manager: &ResourceManager) -> Result<Self> {
        let provider = manager
            .find_protocol(&self.protocol)
            .ok_or_else(|| Error::NoProvider {
                protocol: self.protocol.clone(),
            })?;
        self.provider = Some(provider);
        Ok(self)
    }

    /// Add a tag. Tags keep insertion order and are never duplicated.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Turn into a submit request carrying `content`.
    pub fn submit(mut self, content: impl Into<Value>) -> Self {
        self.kind = RequestKind::Submit;
        self.content = Some(content.into());
        self
    }

    pub fn delete(mut self) -> Self {
        self.kind = RequestKind::Delete;
        self
    }

    pub fn with_kind(mut self, kind: RequestKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn uri(&self) -> String {
        format!("{}://{}", self.protocol, self.address)
    }

    pub fn provider(&self) -> Option<&Arc<dyn ResourceProtocol>> {
        self.provider.as_ref()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn find_param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn content(&self) -> Option<&Value> {
        self.content.as_ref()
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn metadata(&self) -> RequestMetadata {
        RequestMetadata {
            protocol: self.protocol.clone(),
            address: self.address.clone(),
            tags: self.tags.clone(),
            params: self.params.clone(),
            content: self.content.clone(),
            kind: self.kind,
        }
    }
}

impl fmt::Debug for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRequest")
            .field("protocol", &self.protocol)
            .field("address", &self.address)
            .field("resolved", &self.provider.is_some())
            .field("tags", &self.tags)
            .field("params", &self.params)
            .field("content", &self.content)
            .field("kind", &self.kind)
            .finish()
    }
}

fn split_uri(uri: &str) -> Result<(&str, &str)> {
    match uri.split_once("://") {
        Some((protocol, address)) if !protocol.is_empty() => Ok((protocol, address)),
        _ => Err(Error::InvalidUri {
            uri: uri.to_string(),
        }),
    }
}

/// Serializable form of a request, without its provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub protocol: String,
    pub address: String,
    pub tags: Vec<String>,
    pub params: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    pub kind: RequestKind,
}
