//! The five core probes run against every model.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;

use super::{CapabilityProbe, Verdict};
use crate::client::{ChatMessage, ChatRequest, ChatResponse, ToolChoice, ToolDefinition};

const EVIDENCE_LEN: usize = 160;

/// First characters of a response, for the evidence summary.
pub(crate) fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(EVIDENCE_LEN) {
        Some((end, _)) => format!("{}...", &trimmed[..end]),
        None => trimmed.to_string(),
    }
}

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\bdef |function|\bclass |\bimport |console\.log|\bfunc )").unwrap()
});

/// Basic request/response round trip.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtocolComplianceProbe;

impl CapabilityProbe for ProtocolComplianceProbe {
    fn name(&self) -> &str {
        "protocol_compliance"
    }

    fn request(&self, model: &str) -> ChatRequest {
        ChatRequest::user(model, "Hello, please respond with just the word 'pong'.").with_max_tokens(10)
    }

    fn evaluate(&self, response: &ChatResponse) -> Verdict {
        let text = response.text.trim();
        if text.is_empty() {
            return Verdict::fail("empty response");
        }
        if text.to_lowercase().contains("pong") {
            Verdict::pass(1.0, excerpt(text))
        } else {
            Verdict::pass(0.6, format!("did not follow instruction: {}", excerpt(text)))
        }
    }
}

/// Function calling with a single weather tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct ToolInvocationProbe;

const WEATHER_TOOL: &str = "get_current_weather";

impl CapabilityProbe for ToolInvocationProbe {
    fn name(&self) -> &str {
        "tool_invocation"
    }

    fn request(&self, model: &str) -> ChatRequest {
        ChatRequest::user(model, "What is the weather like in New York?")
            .with_tool(ToolDefinition {
                name: WEATHER_TOOL.into(),
                description: "Get the current weather in a given location".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "location": {
                            "type": "string",
                            "description": "The city and state, e.g. San Francisco, CA"
                        },
                        "unit": {
                            "type": "string",
                            "enum": ["celsius", "fahrenheit"]
                        }
                    },
                    "required": ["location"]
                }),
            })
            .with_tool_choice(ToolChoice::Auto)
    }

    fn evaluate(&self, response: &ChatResponse) -> Verdict {
        let Some(call) = response.tool_calls.iter().find(|c| c.name == WEATHER_TOOL) else {
            return match response.tool_calls.first() {
                Some(other) => Verdict::fail(format!("called unknown tool '{}'", other.name)),
                None => Verdict::fail(format!("no tool call: {}", excerpt(&response.text))),
            };
        };
        match call.arguments.get("location").and_then(|v| v.as_str()) {
            Some(location) if !location.trim().is_empty() => {
                Verdict::pass(1.0, format!("{WEATHER_TOOL}(location={location})"))
            }
            _ => Verdict::pass(0.7, format!("{WEATHER_TOOL} called without location")),
        }
    }
}

/// Recall of a fact from an earlier turn.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextRetentionProbe;

impl CapabilityProbe for ContextRetentionProbe {
    fn name(&self) -> &str {
        "context_retention"
    }

    fn request(&self, model: &str) -> ChatRequest {
        ChatRequest::new(
            model,
            vec![
                ChatMessage::user(
                    "Remember that my favorite color is blue and my name is John. What is my name?",
                ),
                ChatMessage::assistant("Your name is John, and your favorite color is blue."),
                ChatMessage::user("What is my favorite color?"),
            ],
        )
        .with_max_tokens(50)
    }

    fn evaluate(&self, response: &ChatResponse) -> Verdict {
        if response.text.to_lowercase().contains("blue") {
            Verdict::pass(1.0, excerpt(&response.text))
        } else {
            Verdict::fail(format!("fact not recalled: {}", excerpt(&response.text)))
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CodeGenerationProbe;

impl CapabilityProbe for CodeGenerationProbe {
    fn name(&self) -> &str {
        "code_generation"
    }

    fn request(&self, model: &str) -> ChatRequest {
        ChatRequest::user(
            model,
            "Write a simple Python function to calculate the factorial of a number.",
        )
    }

    fn evaluate(&self, response: &ChatResponse) -> Verdict {
        if !CODE_PATTERN.is_match(&response.text) {
            return Verdict::fail(format!("no code found: {}", excerpt(&response.text)));
        }
        let score = if response.text.to_lowercase().contains("factorial") {
            1.0
        } else {
            0.8
        };
        Verdict::pass(score, excerpt(&response.text))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorDiagnosisProbe;

impl CapabilityProbe for ErrorDiagnosisProbe {
    fn name(&self) -> &str {
        "error_diagnosis"
    }

    fn request(&self, model: &str) -> ChatRequest {
        ChatRequest::user(
            model,
            "Resolve this error: NameError: name 'requests' is not defined\n\n\
             Code: import requests\n\
             response = requests.get('https://api.example.com/data')\n\
             print(response.json())",
        )
    }

    fn evaluate(&self, response: &ChatResponse) -> Verdict {
        let text = response.text.to_lowercase();
        if text.contains("install") || text.contains("pip") {
            Verdict::pass(1.0, excerpt(&response.text))
        } else if text.contains("import") || text.contains("module") {
            Verdict::pass(0.7, excerpt(&response.text))
        } else {
            Verdict::fail(format!("no fix suggested: {}", excerpt(&response.text)))
        }
    }
}
