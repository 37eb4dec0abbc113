use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::request::{RequestMetadata, ResourceRequest};
use crate::error::{Error, Result};
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Preparing,
    Sending,
    Succeeded,
    Failed,
}

impl ResponseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ResponseStatus::Succeeded | ResponseStatus::Failed)
    }

    fn can_advance_to(self, next: ResponseStatus) -> bool {
        matches!(
            (self, next),
            (ResponseStatus::Preparing, ResponseStatus::Sending)
                | (ResponseStatus::Sending, ResponseStatus::Succeeded)
                | (ResponseStatus::Sending, ResponseStatus::Failed)
        )
    }
}

/// The outcome of one request. The request itself is read-only.
#[derive(Debug, Clone)]
pub struct ResourceResponse {
    request: ResourceRequest,
    status: ResponseStatus,
    data: Value,
}

impl ResourceResponse {
    pub fn new(request: ResourceRequest) -> Self {
        Self {
            request,
            status: ResponseStatus::Preparing,
            data: Value::Null,
        }
    }

    pub fn request(&self) -> &ResourceRequest {
        &self.request
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Succeeded
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_data(self) -> Value {
        self.data
    }

    pub(crate) fn set_data(&mut self, data: Value) {
        self.data = data;
    }

    /// Move the status forward. Terminal states are final.
    pub fn advance(&mut self, next: ResponseStatus) -> Result<()> {
        if !self.status.can_advance_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        tracing::trace!(
            protocol = %self.request.protocol(),
            address = %self.request.address(),
            from = ?self.status,
            to = ?next,
            "response status changed"
        );
        self.status = next;
        Ok(())
    }

    pub fn metadata(&self) -> ResponseMetadata {
        ResponseMetadata {
            request: self.request.metadata(),
            status: self.status,
            data: self.data.clone(),
        }
    }
}

/// Serializable snapshot of a response, published by dispatched requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub request: RequestMetadata,
    pub status: ResponseStatus,
    pub data: Value,
}

impl ResponseMetadata {
    /// Decode the payload of a dispatched response message.
    pub fn from_message(message: &Message) -> Result<Self> {
        Ok(serde_json::from_value(message.value().clone())?)
    }
}
