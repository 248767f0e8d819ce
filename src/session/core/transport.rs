//! Transport seam between the session layer and the network.
//!
//! The session layer owns cookies and redirects, so implementations must send
//! exactly one HTTP exchange per call: no cookie store, no redirect following,
//! no automatic retries.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, redirect::Policy};
use thiserror::Error;

use super::types::{TransportRequest, TransportResponse};

/// Contract for the single-hop HTTP exchange used by the handshake and fetch
/// paths.
#[async_trait]
pub trait PortalTransport: Send + Sync {
    async fn execute(&self, request: TransportRequest)
    -> Result<TransportResponse, TransportError>;
}

/// Transport-level failure. Cloneable so a failed handshake can be reported to
/// every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("http transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Transport(err.to_string())
        }
    }
}

/// Reqwest-backed transport.
pub struct ReqwestPortalTransport {
    client: Client,
}

impl ReqwestPortalTransport {
    /// Creates a client with redirects and reqwest's cookie store disabled.
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .redirect(Policy::none())
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl PortalTransport for ReqwestPortalTransport {
    async fn execute(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, request.url.as_str())
            .headers(request.headers);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        Ok(TransportResponse {
            status,
            headers,
            body,
            url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_default_transport() {
        let transport = ReqwestPortalTransport::new("tenant-portal-test", Duration::from_secs(5));
        assert!(transport.is_ok());
    }
}
