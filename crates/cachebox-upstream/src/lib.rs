//! # cachebox-upstream
//!
//! HTTP client for talking to upstream registries.
//!
//! One shared pooled client is used for every upstream: connect timeout
//! 5 s, idle connections kept for 60 s with at most 10 per host, proxy
//! configuration from the environment, HTTP/2 via ALPN where offered.
//! The client never interprets status codes; the [`auth`] module layers
//! the single credentialed 401 retry on top.

pub mod auth;
pub mod error;

pub use auth::{request_with_creds, Credentials};
pub use error::{Result, UpstreamError};

use reqwest::header::HeaderMap;
use reqwest::{Method, Response};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// Shared upstream HTTP client.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
}

impl UpstreamClient {
    /// Creates the shared client.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("cachebox/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(UpstreamError::Client)?;
        Ok(Self { http })
    }

    /// Issues a request with the given header set.
    ///
    /// Status codes are returned as-is, never interpreted.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure only.
    pub async fn request(
        &self,
        url: &str,
        method: Method,
        headers: &HeaderMap,
    ) -> Result<Response> {
        let response = self
            .http
            .request(method, url)
            .headers(headers.clone())
            .send()
            .await?;
        Ok(response)
    }
}

/// Copies every header from `src` into `dst`, preserving multi-valued
/// headers verbatim.
pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src {
        dst.append(name.clone(), value.clone());
    }
}
