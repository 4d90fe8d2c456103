//! Abstract fetch capability consumed by the catalog client and download workers.
//!
//! The engine never talks to sockets itself; a shell supplies a [`Transport`] (the `wselector`
//! binary wraps `reqwest`) and tests supply scripted stubs.

use std::time::Duration;

use thiserror::Error;

use crate::error::CoreError;

/// Raw response from a GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Parsed `Retry-After` header, if the server sent one.
    pub retry_after: Option<Duration>,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self { status: 200, body: body.into(), retry_after: None }
    }

    pub fn status(status: u16) -> Self {
        Self { status, body: Vec::new(), retry_after: None }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body of a 2xx response, or the error classified from the status code.
    pub fn into_body(self) -> Result<Vec<u8>, CoreError> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(CoreError::from_status(self.status, self.retry_after))
        }
    }
}

/// Failure below the HTTP layer. All variants are transient.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transfer failed: {0}")]
    Io(String),
}

impl From<TransportError> for CoreError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(after) => {
                CoreError::Timeout { operation: "http request".to_string(), after }
            }
            other => CoreError::Network { transient: true, status: None, message: other.to_string() },
        }
    }
}

pub trait Transport: Send + Sync + std::fmt::Debug {
    fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;
}

/// GET `url` and return the body of a successful response.
pub fn fetch_bytes(transport: &dyn Transport, url: &str) -> Result<Vec<u8>, CoreError> {
    transport.get(url)?.into_body()
}
