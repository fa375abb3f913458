//! Query transport seam: one encoded request in, one encoded response out.

use std::time::Duration;

use async_trait::async_trait;

use crate::identity::WireCryptoError;
use crate::protocol::{Request, Response};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("session closed")]
    Closed,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("crypto: {0}")]
    Crypto(#[from] WireCryptoError),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("malformed frame: {0}")]
    BadFrame(&'static str),
}

/// A bidirectional query channel to the storage engine.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    async fn query(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

type Handler = dyn Fn(&[u8]) -> Result<Vec<u8>, TransportError> + Send + Sync;

/// In-process transport for embedded engines and tests.
pub struct LocalTransport {
    handler: Box<Handler>,
}

impl LocalTransport {
    /// Raw handler over encoded bytes.
    pub fn new(
        handler: impl Fn(&[u8]) -> Result<Vec<u8>, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }

    /// Typed handler. Requests that fail to decode are answered with a query error,
    /// the way the daemon does.
    pub fn with_engine(engine: impl Fn(Request) -> Response + Send + Sync + 'static) -> Self {
        Self::new(move |raw| {
            let response = match Request::decode(raw) {
                Ok(request) => engine(request),
                Err(e) => Response::Error(format!("failed to parse query: {e}")),
            };
            response.encode().map_err(|_| TransportError::FrameTooLarge)
        })
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl QueryTransport for LocalTransport {
    async fn query(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        (self.handler)(&request)
    }
}
