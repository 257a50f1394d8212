//! Credential substitution for upstream 401 responses.
//!
//! When an anonymous upstream request comes back 401 and the operator has
//! configured default credentials for that host, the challenge in
//! `WWW-Authenticate` is answered once: directly for `Basic`, via the
//! token endpoint for `Bearer`. Any other scheme, or any failure in the
//! exchange, surfaces the original 401 to the caller.

use crate::error::{Result, UpstreamError};
use crate::UpstreamClient;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Method, Response};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// Default credentials for one registry host.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    /// Username.
    pub username: String,
    /// Password or token.
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    // Passwords stay out of logs; only `user@host` may appear.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Issues `GET url` with `headers`, answering a 401 challenge with the
/// given credentials at most once.
///
/// The retry only happens when the original header set carried no
/// `Authorization` (a client bringing its own credentials is passed
/// through untouched) and `creds` is present. On a Bearer retry the
/// substituted `Authorization` header is left in `headers`.
///
/// # Errors
///
/// Returns an error on transport failure or when the Bearer token
/// endpoint yields no usable token.
pub async fn request_with_creds(
    client: &UpstreamClient,
    url: &str,
    headers: &mut HeaderMap,
    creds: Option<&Credentials>,
    host: &str,
) -> Result<Response> {
    let response = client.request(url, Method::GET, headers).await?;

    if response.status() != reqwest::StatusCode::UNAUTHORIZED
        || headers.contains_key(AUTHORIZATION)
    {
        return Ok(response);
    }
    let Some(creds) = creds else {
        return Ok(response);
    };

    let challenge = response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    debug!(
        url,
        creds = format!("{}@{host}", creds.username),
        "received 401, retrying with default credentials"
    );

    if challenge.starts_with("Basic") {
        set_authorization(headers, &basic_value(creds))?;
        return client.request(url, Method::GET, headers).await;
    }

    if let Some(rest) = challenge.strip_prefix("Bearer") {
        let params = parse_challenge_params(rest);
        let token_endpoint = token_url(&params)
            .ok_or_else(|| UpstreamError::Auth("challenge has no realm".to_string()))?;

        let mut token_headers = HeaderMap::new();
        set_authorization(&mut token_headers, &basic_value(creds))?;
        let token_response = client
            .request(&token_endpoint, Method::GET, &token_headers)
            .await?;
        let body = token_response.bytes().await?;
        let token = parse_token(&body)
            .ok_or_else(|| UpstreamError::Auth("token not found in response".to_string()))?;

        set_authorization(headers, &format!("Bearer {token}"))?;
        return client.request(url, Method::GET, headers).await;
    }

    // Unknown scheme: surface the 401 unchanged.
    Ok(response)
}

fn set_authorization(headers: &mut HeaderMap, value: &str) -> Result<()> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| UpstreamError::Auth(format!("invalid authorization header: {e}")))?;
    headers.insert(AUTHORIZATION, value);
    Ok(())
}

fn basic_value(creds: &Credentials) -> String {
    let raw = format!("{}:{}", creds.username, creds.password);
    format!("Basic {}", BASE64.encode(raw))
}

/// Parses the comma-separated `key="value"` parameters of a challenge.
fn parse_challenge_params(rest: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for part in rest.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        params.insert(key.to_string(), value.trim_matches('"').to_string());
    }
    params
}

/// Builds the token endpoint URL: `<realm>?<k1>=<v1>&…` with every
/// challenge parameter forwarded.
fn token_url(params: &HashMap<String, String>) -> Option<String> {
    let realm = params.get("realm").filter(|r| !r.is_empty())?;
    let query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    Some(format!("{realm}?{}", query.join("&")))
}

/// Extracts the `token` string from a token-endpoint response body.
///
/// The body is an untrusted document of mixed types; only the string
/// `token` field matters, everything else (ints, bools, nested values)
/// is ignored.
fn parse_token(body: &[u8]) -> Option<String> {
    let doc: serde_json::Value = serde_json::from_slice(body).ok()?;
    doc.get("token")
        .and_then(serde_json::Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}
