//! Discovery endpoint allocation.
//!
//! Clustered software such as etcd finds its peers at boot through a
//! discovery URL. A fresh one is requested per cluster with
//! `GET {base}/new?size={n}`; the response body is the URL.

use crate::error::{PlatformError, Result};

/// Default public discovery service.
pub const DEFAULT_DISCOVERY_BASE: &str = "https://discovery.etcd.io";

/// Client for an etcd-style discovery service.
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    base_url: String,
    http: reqwest::Client,
}

impl DiscoveryClient {
    /// Client for the service rooted at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// URL requested to allocate an endpoint for `size` members.
    pub fn request_url(&self, size: usize) -> String {
        format!("{}/new?size={}", self.base_url.trim_end_matches('/'), size)
    }

    /// Allocate a new discovery endpoint for `size` members.
    pub async fn new_url(&self, size: usize) -> Result<String> {
        let url = self.request_url(size);
        tracing::debug!("requesting discovery endpoint: {}", url);

        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(PlatformError::DiscoveryStatus {
                status: resp.status().as_u16(),
            });
        }

        Ok(resp.text().await?.trim().to_string())
    }
}

impl Default for DiscoveryClient {
    fn default() -> Self {
        Self::new(DEFAULT_DISCOVERY_BASE)
    }
}
