//! Dialect adapter trait definition.

use std::fmt::Debug;

use secrecy::SecretString;

use crate::client::messages::{ChatRequest, ChatResponse, DiscoveredModel};
use crate::client::transport::{HttpRequest, HttpResponse};
use crate::types::{Dialect, ProviderEndpoint};
use crate::Result;

/// Translates provider-neutral requests to one dialect's wire format and back.
///
/// Adapters are pure: they build requests and parse responses, while the
/// dispatcher owns all I/O, admission and circuit state.
pub trait DialectAdapter: Send + Sync + Debug {
    fn dialect(&self) -> Dialect;

    fn auth_headers(&self, secret: Option<&SecretString>) -> Vec<(String, String)>;

    fn chat_request(
        &self,
        endpoint: &ProviderEndpoint,
        secret: Option<&SecretString>,
        request: &ChatRequest,
    ) -> Result<HttpRequest>;

    fn parse_chat(
        &self,
        provider: &str,
        request: &ChatRequest,
        response: &HttpResponse,
    ) -> Result<ChatResponse>;

    fn models_request(
        &self,
        endpoint: &ProviderEndpoint,
        secret: Option<&SecretString>,
    ) -> HttpRequest;

    fn parse_models(&self, provider: &str, response: &HttpResponse) -> Result<Vec<DiscoveredModel>>;

    /// Lightweight liveness call: `path` on the base URL, or the model listing.
    fn liveness_request(
        &self,
        endpoint: &ProviderEndpoint,
        secret: Option<&SecretString>,
        path: Option<&str>,
    ) -> HttpRequest {
        match path {
            Some(path) => self
                .auth_headers(secret)
                .into_iter()
                .fold(HttpRequest::get(&endpoint.name, endpoint.url(path)), |req, (k, v)| {
                    req.header(k, v)
                }),
            None => self.models_request(endpoint, secret),
        }
    }
}

/// URL for an API path under `/v1`, tolerating base URLs that already end in `/v1`.
pub(crate) fn versioned_url(endpoint: &ProviderEndpoint, path: &str) -> String {
    let base = endpoint.base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        format!("{base}/{path}")
    } else {
        format!("{base}/v1/{path}")
    }
}

pub(crate) fn parse_json(provider: &str, response: &HttpResponse) -> Result<serde_json::Value> {
    serde_json::from_str(&response.body)
        .map_err(|e| crate::Error::malformed(provider, format!("invalid JSON body: {e}")))
}
