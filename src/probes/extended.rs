//! Optional probes beyond the core battery.

use super::battery::excerpt;
use super::{CapabilityProbe, Verdict};
use crate::client::{ChatRequest, ChatResponse};

/// Streamed response delivery.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamingProbe;

impl CapabilityProbe for StreamingProbe {
    fn name(&self) -> &str {
        "streaming"
    }

    fn request(&self, model: &str) -> ChatRequest {
        ChatRequest::user(model, "Count from 1 to 5, separated by spaces.")
            .with_max_tokens(30)
            .with_stream()
    }

    fn evaluate(&self, response: &ChatResponse) -> Verdict {
        match (response.stream_chunks, response.text.trim().is_empty()) {
            (_, true) => Verdict::fail("empty response"),
            (0, false) => Verdict::pass(0.5, "answered without streaming"),
            (chunks, false) => Verdict::pass(1.0, format!("{chunks} chunks: {}", excerpt(&response.text))),
        }
    }
}

/// Structured JSON output.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonModeProbe;

impl CapabilityProbe for JsonModeProbe {
    fn name(&self) -> &str {
        "json_mode"
    }

    fn request(&self, model: &str) -> ChatRequest {
        ChatRequest::user(
            model,
            "What is 2 + 2? Reply only with a JSON object of the form {\"answer\": <number>}.",
        )
        .with_max_tokens(30)
        .with_json_mode()
    }

    fn evaluate(&self, response: &ChatResponse) -> Verdict {
        let body = strip_fence(response.text.trim());
        match serde_json::from_str::<serde_json::Value>(body) {
            Ok(value) if value.is_object() => {
                if value.get("answer").and_then(|a| a.as_f64()) == Some(4.0) {
                    Verdict::pass(1.0, excerpt(body))
                } else {
                    Verdict::pass(0.7, format!("valid JSON, wrong answer: {}", excerpt(body)))
                }
            }
            Ok(_) => Verdict::fail(format!("JSON is not an object: {}", excerpt(body))),
            Err(e) => Verdict::fail(format!("not JSON ({e}): {}", excerpt(body))),
        }
    }
}

fn strip_fence(text: &str) -> &str {
    text.strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(text)
}

/// Short multi-step arithmetic word problem.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReasoningProbe;

impl CapabilityProbe for ReasoningProbe {
    fn name(&self) -> &str {
        "reasoning"
    }

    fn request(&self, model: &str) -> ChatRequest {
        ChatRequest::user(
            model,
            "A train travels 60 km in 1.5 hours, then 100 km in 2.5 hours. \
             What is its average speed in km/h over the whole trip? \
             Show your steps, then give the final answer.",
        )
    }

    fn evaluate(&self, response: &ChatResponse) -> Verdict {
        let text = response.text.as_str();
        if !text.contains("40") {
            return Verdict::fail(format!("wrong or missing answer: {}", excerpt(text)));
        }
        let shows_steps = text.contains("160") && text.contains('4');
        Verdict::pass(if shows_steps { 1.0 } else { 0.8 }, excerpt(text))
    }
}
