//! Sandboxed fetch shim with a host whitelist.
//!
//! Security model:
//! - Only URLs matching whitelisted origins can be fetched
//! - Redirects only followed if they stay within the same origin
//!
//! When a fetch is issued through a request-scoped capability it carries that
//! request's id; the response payload and status are then recorded into the
//! matching discovery buffer (if one is open) in call order.

use anyhow::anyhow;
use deno_core::{op2, OpState};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use url::Url;

use crate::discovery::{DiscoveryBuffers, DiscoveryEvent};

/// The fixed set of origins guest code may fetch from.
///
/// An origin is scheme + host + port; matching is exact. An empty whitelist
/// disables fetch entirely.
#[derive(Debug, Clone, Default)]
pub struct HostWhitelist {
    pub origins: Vec<String>,
}

impl HostWhitelist {
    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        if self.origins.is_empty() {
            return false;
        }
        let origin = url.origin().ascii_serialization();
        self.origins.iter().any(|allowed| origin == *allowed)
    }
}

/// Request info passed from the guest fetch wrapper
#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<String>,
    /// Set by request-scoped fetch capabilities; attributes the response to
    /// one visit's discovery buffer.
    #[serde(default, rename = "requestId")]
    pub request_id: Option<String>,
}

/// Response info returned to the guest
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub url: String,
    pub body: String,
}

/// The fetch operation - validates the origin, makes the request, and
/// records a discovery event when the call is request-scoped.
#[op2(async)]
#[serde]
pub async fn op_fetch(
    state: Rc<RefCell<OpState>>,
    #[serde] request: FetchRequest,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    // Get the whitelist from state
    let whitelist = {
        let state_ref = state.borrow();
        state_ref.borrow::<HostWhitelist>().clone()
    };

    let request_id = request.request_id.clone();
    let response = do_fetch(request, whitelist).await?;

    if let Some(request_id) = request_id {
        let mut state_ref = state.borrow_mut();
        if let Some(buffers) = state_ref.try_borrow_mut::<DiscoveryBuffers>() {
            buffers.record(
                &request_id,
                DiscoveryEvent {
                    payload: response.body.clone(),
                    status: response.status,
                },
            );
        }
    }

    Ok(response)
}

/// Internal fetch implementation (can be called recursively for redirects)
async fn do_fetch(
    request: FetchRequest,
    whitelist: HostWhitelist,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    // Parse and validate URL
    let url = Url::parse(&request.url)
        .map_err(|e| anyhow!("Invalid URL '{}': {}", request.url, e))?;

    if !whitelist.is_origin_allowed(&url) {
        return Err(anyhow!(
            "Fetch blocked: origin '{}' is not in the host whitelist. Allowed: {:?}",
            url.origin().ascii_serialization(),
            whitelist.origins
        )
        .into());
    }

    // Build the request
    let client = Client::builder()
        // Don't follow redirects automatically - we'll handle them manually
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

    let method = match request
        .method
        .as_deref()
        .unwrap_or("GET")
        .to_uppercase()
        .as_str()
    {
        "GET" => Method::GET,
        "POST" => Method::POST,
        "PUT" => Method::PUT,
        "DELETE" => Method::DELETE,
        "PATCH" => Method::PATCH,
        "HEAD" => Method::HEAD,
        "OPTIONS" => Method::OPTIONS,
        other => return Err(anyhow!("Unsupported HTTP method: {}", other).into()),
    };

    let mut req_builder = client.request(method, url.clone());

    // Add headers
    if let Some(ref headers) = request.headers {
        for (key, value) in headers {
            req_builder = req_builder.header(key, value);
        }
    }

    // Add body
    if let Some(body) = request.body {
        req_builder = req_builder.body(body);
    }

    // Make the request
    let response = req_builder
        .send()
        .await
        .map_err(|e| anyhow!("Fetch failed: {}", e))?;

    let status = response.status();
    let final_url = response.url().clone();

    // Handle redirects manually - only allow same-origin
    if status.is_redirection() {
        if let Some(location) = response.headers().get("location") {
            let location_str = location
                .to_str()
                .map_err(|_| anyhow!("Invalid redirect location"))?;
            let redirect_url = final_url
                .join(location_str)
                .map_err(|e| anyhow!("Invalid redirect URL: {}", e))?;

            // Check if redirect is to same origin
            if redirect_url.origin() != url.origin() {
                return Err(anyhow!(
                    "Fetch blocked: redirect to different origin '{}' (original: '{}')",
                    redirect_url.origin().ascii_serialization(),
                    url.origin().ascii_serialization()
                )
                .into());
            }

            // Check if redirect origin is still allowed
            if !whitelist.is_origin_allowed(&redirect_url) {
                return Err(anyhow!(
                    "Fetch blocked: redirect origin '{}' is not in the host whitelist",
                    redirect_url.origin().ascii_serialization()
                )
                .into());
            }

            // Follow the redirect recursively
            let redirect_request = FetchRequest {
                url: redirect_url.to_string(),
                method: Some("GET".to_string()), // Redirects typically become GET
                headers: request.headers.clone(),
                body: None, // Don't send body on redirect
                request_id: None,
            };

            return Box::pin(do_fetch(redirect_request, whitelist)).await;
        }
    }

    // Collect response headers
    let mut resp_headers = HashMap::new();
    for (key, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            resp_headers.insert(key.to_string(), v.to_string());
        }
    }

    // Read body as text
    let body = response
        .text()
        .await
        .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

    Ok(FetchResponse {
        ok: status.is_success(),
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
        headers: resp_headers,
        url: final_url.to_string(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_matching() {
        let whitelist = HostWhitelist {
            origins: vec![
                "https://api.example.com".to_string(),
                "http://localhost:3000".to_string(),
            ],
        };

        // Allowed
        assert!(whitelist.is_origin_allowed(&Url::parse("https://api.example.com/users").unwrap()));
        assert!(whitelist.is_origin_allowed(&Url::parse("https://api.example.com/").unwrap()));
        assert!(whitelist.is_origin_allowed(&Url::parse("http://localhost:3000/api").unwrap()));

        // Not allowed
        assert!(!whitelist.is_origin_allowed(&Url::parse("https://evil.com/api").unwrap()));
        assert!(!whitelist.is_origin_allowed(&Url::parse("http://api.example.com/users").unwrap())); // http vs https
        assert!(!whitelist.is_origin_allowed(&Url::parse("https://api.example.com:8080/").unwrap())); // different port
    }

    #[test]
    fn test_empty_whitelist_disables_fetch() {
        let whitelist = HostWhitelist { origins: vec![] };

        assert!(!whitelist.is_origin_allowed(&Url::parse("https://anything.com").unwrap()));
    }
}
