//! The boundary to whatever ships a query string and variables to a server.

use async_trait::async_trait;
use serde_json_bytes::Value;

/// One request on the wire.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryPayload {
    pub query: String,
    pub variables: Option<Value>,
}

/// One response off the wire. `error` carries an in-band GraphQL error payload; transport
/// level failures are [`TransportError`] instead.
#[derive(Clone, Debug, Default)]
pub struct ServerResponse {
    pub data: Value,
    pub error: Option<Value>,
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn handle_query(&self, payload: QueryPayload) -> Result<ServerResponse, TransportError>;
}
