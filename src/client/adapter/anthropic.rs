//! Anthropic messages dialect.

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

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    api_version: String,
    default_max_tokens: u32,
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            default_max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    fn body(&self, request: &ChatRequest) -> Value {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
            .collect();
        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| {
                let role = if m.role == ChatRole::Assistant {
                    "assistant"
                } else {
                    "user"
                };
                json!({ "role": role, "content": m.content })
            })
            .collect();

        let mut obj = Map::new();
        obj.insert("model".into(), json!(request.model));
        obj.insert(
            "max_tokens".into(),
            json!(request.max_tokens.unwrap_or(self.default_max_tokens)),
        );
        obj.insert("messages".into(), Value::Array(messages));
        if !system.is_empty() {
            obj.insert("system".into(), json!(system.join("\n\n")));
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
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            obj.insert("tools".into(), Value::Array(tools));
        }
        if let Some(choice) = request.tool_choice {
            let kind = match choice {
                ToolChoice::Auto => "auto",
                ToolChoice::Required => "any",
                ToolChoice::None => "none",
            };
            obj.insert("tool_choice".into(), json!({ "type": kind }));
        }
        if request.stream {
            obj.insert("stream".into(), json!(true));
        }
        Value::Object(obj)
    }

    fn parse_stream(&self, provider: &str, body: &str) -> Result<ChatResponse> {
        let mut response = ChatResponse::default();
        for data in sse::data_lines(body) {
            let event: Value = serde_json::from_str(data)
                .map_err(|e| Error::malformed(provider, format!("invalid stream event: {e}")))?;
            response.stream_chunks += 1;
            match event.get("type").and_then(Value::as_str) {
                Some("message_start") => {
                    response.id = event
                        .pointer("/message/id")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    response.model = event
                        .pointer("/message/model")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
                Some("content_block_delta") => {
                    if let Some(text) = event.pointer("/delta/text").and_then(Value::as_str) {
                        response.text.push_str(text);
                    }
                }
                Some("message_delta") => {
                    response.finish_reason = event
                        .pointer("/delta/stop_reason")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
                Some("error") => {
                    let message = event
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .unwrap_or("stream error");
                    return Err(Error::network(provider, message));
                }
                _ => {}
            }
        }
        if response.stream_chunks == 0 {
            return Err(Error::malformed(provider, "empty event stream"));
        }
        Ok(response)
    }
}

impl DialectAdapter for AnthropicAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Anthropic
    }

    fn auth_headers(&self, secret: Option<&SecretString>) -> Vec<(String, String)> {
        let mut headers = vec![("anthropic-version".to_string(), self.api_version.clone())];
        if let Some(secret) = secret {
            headers.push(("x-api-key".to_string(), secret.expose_secret().to_string()));
        }
        headers
    }

    fn chat_request(
        &self,
        endpoint: &ProviderEndpoint,
        secret: Option<&SecretString>,
        request: &ChatRequest,
    ) -> Result<HttpRequest> {
        if request.messages.iter().all(|m| m.role == ChatRole::System) {
            return Err(Error::Config(
                "Anthropic requests need at least one user message".into(),
            ));
        }
        let http = HttpRequest::post(
            &endpoint.name,
            versioned_url(endpoint, "messages"),
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
        let content = json
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::malformed(provider, "response has no content array"))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in content {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    if let Some(name) = block.get("name").and_then(Value::as_str) {
                        tool_calls.push(ToolCall {
                            id: block.get("id").and_then(Value::as_str).map(str::to_string),
                            name: name.to_string(),
                            arguments: block.get("input").cloned().unwrap_or(Value::Null),
                        });
                    }
                }
                _ => {}
            }
        }

        Ok(ChatResponse {
            id: json.get("id").and_then(Value::as_str).map(str::to_string),
            model: json.get("model").and_then(Value::as_str).map(str::to_string),
            text,
            tool_calls,
            finish_reason: json
                .get("stop_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            usage: json.get("usage").map(|u| TokenUsage {
                input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
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
                Some(DiscoveredModel {
                    id: m.get("id")?.as_str()?.to_string(),
                    display_name: m
                        .get("display_name")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    context_window: None,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::messages::{ChatMessage, ToolDefinition};

    fn endpoint() -> ProviderEndpoint {
        ProviderEndpoint::new("anthropic", "https://api.anthropic.com", Dialect::Anthropic)
    }

    #[test]
    fn test_request_shape() {
        let request = ChatRequest::new(
            "claude-sonnet-4-5",
            vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
        )
        .with_tool(ToolDefinition {
            name: "get_current_weather".into(),
            description: "weather".into(),
            parameters: json!({"type": "object"}),
        })
        .with_tool_choice(ToolChoice::Required);

        let secret = SecretString::from("sk-ant".to_string());
        let http = AnthropicAdapter::new()
            .chat_request(&endpoint(), Some(&secret), &request)
            .unwrap();

        assert_eq!(http.url, "https://api.anthropic.com/v1/messages");
        assert!(http.headers.contains(&("x-api-key".into(), "sk-ant".into())));
        assert!(http
            .headers
            .contains(&("anthropic-version".into(), API_VERSION.into())));
        let body = http.body.unwrap();
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["tool_choice"]["type"], "any");
    }

    #[test]
    fn test_parse_text_and_tool_use() {
        let body = json!({
            "id": "msg_1",
            "model": "claude-sonnet-4-5",
            "stop_reason": "tool_use",
            "content": [
                {"type": "text", "text": "Checking."},
                {"type": "tool_use", "id": "tu_1", "name": "get_current_weather", "input": {"location": "New York, NY"}}
            ],
            "usage": {"input_tokens": 20, "output_tokens": 9}
        });
        let request = ChatRequest::user("claude-sonnet-4-5", "weather?");
        let parsed = AnthropicAdapter::new()
            .parse_chat("anthropic", &request, &HttpResponse::json(200, &body))
            .unwrap();
        assert_eq!(parsed.text, "Checking.");
        assert!(parsed.has_tool_call("get_current_weather"));
        assert_eq!(parsed.finish_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn test_parse_stream() {
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"po\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"ng\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"}}\n\n"
        );
        let request = ChatRequest::user("claude", "ping").with_stream();
        let parsed = AnthropicAdapter::new()
            .parse_chat("anthropic", &request, &HttpResponse::new(200, body))
            .unwrap();
        assert_eq!(parsed.text, "pong");
        assert_eq!(parsed.id.as_deref(), Some("msg_1"));
        assert_eq!(parsed.finish_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn test_system_only_request_rejected() {
        let request = ChatRequest::new("claude", vec![ChatMessage::system("x")]);
        assert!(AnthropicAdapter::new()
            .chat_request(&endpoint(), None, &request)
            .is_err());
    }
}
