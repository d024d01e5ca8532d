//! Classification of non-success provider responses.

use std::time::Duration;

use super::transport::HttpResponse;
use crate::Error;

const MAX_MESSAGE_LEN: usize = 512;

/// Map a non-2xx response onto the engine's error taxonomy.
pub fn classify_status(provider: &str, response: &HttpResponse) -> Error {
    let message = error_message(&response.body);
    match response.status {
        401 | 403 => Error::AuthenticationInvalid {
            provider: provider.to_string(),
            status: response.status,
        },
        402 | 429 => Error::QuotaExceeded {
            provider: provider.to_string(),
            retry_after: retry_after(response),
        },
        408 => Error::Timeout(Duration::ZERO),
        500..=599 => Error::network(provider, format!("HTTP {}: {}", response.status, message)),
        status => Error::Api {
            provider: provider.to_string(),
            status,
            message,
        },
    }
}

/// `Retry-After` in delta-seconds form.
pub fn retry_after(response: &HttpResponse) -> Option<Duration> {
    response
        .header("retry-after")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Best-effort error text from common provider error envelopes.
fn error_message(body: &str) -> String {
    let extracted = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str().map(str::to_string))
        });
    let text = extracted.unwrap_or_else(|| body.trim().to_string());
    if text.len() > MAX_MESSAGE_LEN {
        let mut end = MAX_MESSAGE_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text
    }
}
