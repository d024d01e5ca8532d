//! OpenAI-compatible chat completions dialect.

use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value, json};

use super::sse;
use super::traits::{DialectAdapter, parse_json, versioned_url};
use crate::client::messages::{
    ChatRequest, ChatResponse, ChatRole, DiscoveredModel, TokenUsage, ToolCall, ToolChoice,
};
use crate::client::transport::{HttpRequest, HttpResponse};
use crate::types::{Dialect, ProviderEndpoint};
use crate::{Error, Result};

#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAiAdapter;

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self
    }

    fn body(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                };
                json!({ "role": role, "content": m.content })
            })
            .collect();

        let mut obj = Map::new();
        obj.insert("model".into(), json!(request.model));
        obj.insert("messages".into(), Value::Array(messages));
        if let Some(max_tokens) = request.max_tokens {
            obj.insert("max_tokens".into(), json!(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            obj.insert("temperature".into(), json!(temperature));
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            obj.insert("tools".into(), Value::Array(tools));
        }
        if let Some(choice) = request.tool_choice {
            let choice = match choice {
                ToolChoice::Auto => "auto",
                ToolChoice::Required => "required",
                ToolChoice::None => "none",
            };
            obj.insert("tool_choice".into(), json!(choice));
        }
        if request.json_mode {
            obj.insert("response_format".into(), json!({ "type": "json_object" }));
        }
        if request.stream {
            obj.insert("stream".into(), json!(true));
        }
        Value::Object(obj)
    }

    fn parse_stream(&self, provider: &str, body: &str) -> Result<ChatResponse> {
        let mut response = ChatResponse::default();
        for data in sse::data_lines(body) {
            let chunk: Value = serde_json::from_str(data)
                .map_err(|e| Error::malformed(provider, format!("invalid stream chunk: {e}")))?;
            response.stream_chunks += 1;
            if response.id.is_none() {
                response.id = chunk.get("id").and_then(Value::as_str).map(str::to_string);
            }
            if response.model.is_none() {
                response.model = chunk.get("model").and_then(Value::as_str).map(str::to_string);
            }
            let Some(choice) = chunk.pointer("/choices/0") else {
                continue;
            };
            if let Some(text) = choice.pointer("/delta/content").and_then(Value::as_str) {
                response.text.push_str(text);
            }
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                response.finish_reason = Some(reason.to_string());
            }
        }
        if response.stream_chunks == 0 {
            return Err(Error::malformed(provider, "empty event stream"));
        }
        Ok(response)
    }
}

fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let arguments = match function.get("arguments") {
                        Some(Value::String(raw)) => {
                            serde_json::from_str(raw).unwrap_or(Value::String(raw.clone()))
                        }
                        Some(other) => other.clone(),
                        None => Value::Null,
                    };
                    Some(ToolCall {
                        id: call.get("id").and_then(Value::as_str).map(str::to_string),
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

impl DialectAdapter for OpenAiAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::OpenAi
    }

    fn auth_headers(&self, secret: Option<&SecretString>) -> Vec<(String, String)> {
        secret
            .map(|s| {
                vec![(
                    "authorization".to_string(),
                    format!("Bearer {}", s.expose_secret()),
                )]
            })
            .unwrap_or_default()
    }

    fn chat_request(
        &self,
        endpoint: &ProviderEndpoint,
        secret: Option<&SecretString>,
        request: &ChatRequest,
    ) -> Result<HttpRequest> {
        let http = HttpRequest::post(
            &endpoint.name,
            versioned_url(endpoint, "chat/completions"),
            self.body(request),
        );
        Ok(self
            .auth_headers(secret)
            .into_iter()
            .fold(http, |req, (k, v)| req.header(k, v)))
    }

    fn parse_chat(
        &self,
        provider: &str,
        request: &ChatRequest,
        response: &HttpResponse,
    ) -> Result<ChatResponse> {
        if request.stream && sse::looks_like_event_stream(&response.body) {
            return self.parse_stream(provider, &response.body);
        }

        let json = parse_json(provider, response)?;
        let choice = json
            .pointer("/choices/0")
            .ok_or_else(|| Error::malformed(provider, "response has no choices"))?;
        let message = choice
            .get("message")
            .ok_or_else(|| Error::malformed(provider, "choice has no message"))?;

        Ok(ChatResponse {
            id: json.get("id").and_then(Value::as_str).map(str::to_string),
            model: json.get("model").and_then(Value::as_str).map(str::to_string),
            text: message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tool_calls: parse_tool_calls(message),
            finish_reason: choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            usage: json.get("usage").map(|u| TokenUsage {
                input_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
                output_tokens: u
                    .get("completion_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            }),
            stream_chunks: 0,
        })
    }

    fn models_request(
        &self,
        endpoint: &ProviderEndpoint,
        secret: Option<&SecretString>,
    ) -> HttpRequest {
        self.auth_headers(secret).into_iter().fold(
            HttpRequest::get(&endpoint.name, versioned_url(endpoint, "models")),
            |req, (k, v)| req.header(k, v),
        )
    }

    fn parse_models(&self, provider: &str, response: &HttpResponse) -> Result<Vec<DiscoveredModel>> {
        let json = parse_json(provider, response)?;
        let data = json
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::malformed(provider, "model list has no data array"))?;

        Ok(data
            .iter()
            .filter_map(|m| {
                let id = m.get("id")?.as_str()?.to_string();
                Some(DiscoveredModel {
                    id,
                    display_name: m.get("name").and_then(Value::as_str).map(str::to_string),
                    context_window: m
                        .get("context_window")
                        .or_else(|| m.get("context_length"))
                        .and_then(Value::as_u64),
                })
            })
            .collect())
    }
}
