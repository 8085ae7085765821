//! Forwarding relays to hosted chains.

use super::types::RelayPayload;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Executes relay payloads against the external chains this node hosts.
#[async_trait]
pub trait RelayExecutor: Send + Sync {
    /// Whether `chain` is hosted by this node.
    fn hosts(&self, chain: &str) -> bool;

    /// Forward `payload` to `chain` and return the response body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DownstreamExecution`] if the chain cannot serve the
    /// request.
    async fn execute(&self, chain: &str, payload: &RelayPayload) -> Result<String>;
}

/// Executor that forwards payloads over HTTP to configured chain URLs.
pub struct HttpExecutor {
    client: Client,
    hosted_chains: BTreeMap<String, String>,
}

impl HttpExecutor {
    /// Create an executor for `hosted_chains` (chain id → base URL).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(hosted_chains: BTreeMap<String, String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("servicer-node/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            hosted_chains,
        })
    }

    fn url_for(&self, chain: &str, path: &str) -> Option<String> {
        let base = self.hosted_chains.get(chain)?;
        if path.is_empty() {
            Some(base.clone())
        } else {
            Some(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                path.trim_start_matches('/')
            ))
        }
    }
}

#[async_trait]
impl RelayExecutor for HttpExecutor {
    fn hosts(&self, chain: &str) -> bool {
        self.hosted_chains.contains_key(chain)
    }

    async fn execute(&self, chain: &str, payload: &RelayPayload) -> Result<String> {
        let url = self
            .url_for(chain, &payload.path)
            .ok_or_else(|| Error::DownstreamExecution(format!("chain {chain} has no URL")))?;

        let method = if payload.method.is_empty() {
            Method::POST
        } else {
            Method::from_bytes(payload.method.to_ascii_uppercase().as_bytes()).map_err(|e| {
                Error::DownstreamExecution(format!("invalid method {}: {e}", payload.method))
            })?
        };

        debug!("Relaying {} {} for chain {}", method, url, chain);

        let mut request = self.client.request(method, &url);
        if !payload.headers.contains_key("content-type") {
            request = request.header("content-type", "application/json");
        }
        for (name, value) in &payload.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !payload.data.is_empty() {
            request = request.body(payload.data.clone());
        }

        let response = request.send().await.map_err(|e| {
            warn!("Relay to chain {chain} failed: {e}");
            Error::DownstreamExecution(e.to_string())
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::DownstreamExecution(format!("failed to read body: {e}")))?;

        if status.is_server_error() {
            warn!("Chain {chain} answered {status}");
            return Err(Error::DownstreamExecution(format!("chain answered {status}")));
        }
        Ok(body)
    }
}
