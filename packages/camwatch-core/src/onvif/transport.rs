//! HTTP transport for ONVIF SOAP requests.
//!
//! Polls talk to devices through the [`SoapTransport`] trait so the request
//! sequencing can be exercised without a camera on the network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

use super::state::OnvifAddress;

/// Errors that prevent any HTTP response from being received.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connecting, sending or reading failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The transport gave up without a response.
    #[error("no HTTP response: {0}")]
    NoResponse(String),
}

/// Status and body of one HTTP exchange, whatever the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Posts SOAP envelopes to a device.
#[async_trait]
pub trait SoapTransport: Send + Sync {
    /// POSTs `body` to `http://{address}/{path}`.
    async fn post(
        &self,
        address: &OnvifAddress,
        path: &str,
        content_type: &str,
        body: String,
    ) -> Result<HttpReply, TransportError>;
}

/// Builds the service URL for `path` on `address`.
pub fn service_url(address: &OnvifAddress, path: &str) -> String {
    format!(
        "http://{}:{}/{}",
        address.host,
        address.port,
        path.trim_start_matches('/')
    )
}

/// [`SoapTransport`] backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Creates a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Wraps an existing client, sharing its connection pool.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SoapTransport for ReqwestTransport {
    async fn post(
        &self,
        address: &OnvifAddress,
        path: &str,
        content_type: &str,
        body: String,
    ) -> Result<HttpReply, TransportError> {
        let url = service_url(address, path);
        log::debug!("[ONVIF] POST {} ({} bytes)", url, body.len());

        let start = std::time::Instant::now();
        let res = self
            .client
            .post(&url)
            .header("Content-Type", content_type)
            .body(body)
            .send()
            .await?;

        let status = res.status().as_u16();
        let body = res.text().await?;
        log::debug!(
            "[ONVIF] {} answered {} in {:?}, read {} bytes",
            url,
            status,
            start.elapsed(),
            body.len()
        );
        Ok(HttpReply { status, body })
    }
}
