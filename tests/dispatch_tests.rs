//! Dispatch layer against a mock HTTP provider.
//!
//! Run: cargo nextest run --test dispatch_tests

use std::sync::Arc;
use std::time::Duration;

use llm_verifier::auth::ExplicitResolver;
use llm_verifier::client::{
    CallContext, ChatRequest, CircuitState, DispatchConfig, Dispatcher, ReqwestTransport,
};
use llm_verifier::{Dialect, Error, ProviderEndpoint, ProviderRegistry};
use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dispatcher(server: &MockServer, dialect: Dialect) -> Dispatcher {
    let registry = ProviderRegistry::new(Arc::new(
        ExplicitResolver::new().with("TEST_KEY", "sk-test"),
    ))
    .with_providers([ProviderEndpoint::new("mock", server.uri(), dialect)
        .with_credential_ref("TEST_KEY")]);
    Dispatcher::new(registry, Arc::new(ReqwestTransport::new().unwrap()))
}

fn ctx() -> CallContext {
    CallContext::new(Duration::from_secs(5))
}

mod adapters {
    use super::*;

    #[tokio::test]
    async fn test_openai_chat_with_tool_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "model": "gpt-4o",
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {
                                "name": "get_current_weather",
                                "arguments": "{\"location\":\"New York, NY\"}"
                            }
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 12, "completion_tokens": 7}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = dispatcher(&server, Dialect::OpenAi)
            .call("mock", &ChatRequest::user("gpt-4o", "weather?"), &ctx())
            .await
            .unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "get_current_weather");
        assert_eq!(response.tool_calls[0].arguments["location"], "New York, NY");
        assert_eq!(response.usage.unwrap().output_tokens, 7);
    }

    #[tokio::test]
    async fn test_anthropic_messages_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-test"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "model": "claude-3-5-haiku-20241022",
                "content": [{"type": "text", "text": "pong"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 9, "output_tokens": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = dispatcher(&server, Dialect::Anthropic)
            .call(
                "mock",
                &ChatRequest::user("claude-3-5-haiku-20241022", "ping"),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(response.text, "pong");
        assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));
    }

    #[tokio::test]
    async fn test_list_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": "gpt-4o", "object": "model"},
                    {"id": "gpt-4o-mini", "object": "model", "context_length": 128000}
                ]
            })))
            .mount(&server)
            .await;

        let models = assert_ok!(
            dispatcher(&server, Dialect::OpenAi)
                .list_models("mock", &ctx())
                .await
        );
        assert_eq!(models.len(), 2);
        assert_eq!(models[1].context_window, Some(128_000));
    }
}

mod classification {
    use super::*;

    #[tokio::test]
    async fn test_unauthorized_disables_provider() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({"error": {"message": "invalid api key"}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = dispatcher(&server, Dialect::OpenAi);
        let request = ChatRequest::user("gpt-4o", "ping");
        assert!(matches!(
            dispatcher.call("mock", &request, &ctx()).await,
            Err(Error::AuthenticationInvalid { status: 401, .. })
        ));
        assert!(matches!(
            dispatcher.call("mock", &request, &ctx()).await,
            Err(Error::ProviderDisabled { .. })
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_honours_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = dispatcher(&server, Dialect::OpenAi);
        let request = ChatRequest::user("gpt-4o", "ping");
        match dispatcher.call("mock", &request, &ctx()).await {
            Err(Error::QuotaExceeded { retry_after, .. }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected quota error, got {other:?}"),
        }

        // Backoff is enforced locally; the server sees one request.
        assert!(matches!(
            dispatcher.call("mock", &request, &ctx()).await,
            Err(Error::QuotaExceeded { .. })
        ));
        assert_eq!(dispatcher.circuit_state("mock"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_server_errors_open_circuit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(5)
            .mount(&server)
            .await;

        let dispatcher = dispatcher(&server, Dialect::OpenAi).with_config(DispatchConfig {
            max_transient_retries: 0,
            ..DispatchConfig::default()
        });
        let request = ChatRequest::user("gpt-4o", "ping");
        for _ in 0..5 {
            assert!(matches!(
                dispatcher.call("mock", &request, &ctx()).await,
                Err(Error::NetworkTransient { .. })
            ));
        }
        assert_eq!(dispatcher.circuit_state("mock"), Some(CircuitState::Open));
        assert!(matches!(
            dispatcher.call("mock", &request, &ctx()).await,
            Err(Error::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"choices": []}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let err = assert_err!(
            dispatcher(&server, Dialect::OpenAi)
                .call(
                    "mock",
                    &ChatRequest::user("gpt-4o", "ping"),
                    &CallContext::new(Duration::from_millis(300)),
                )
                .await
        );
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_truncated_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"choices\": [{"))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(&server, Dialect::OpenAi);
        let err = dispatcher
            .call("mock", &ChatRequest::user("gpt-4o", "ping"), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedResponse { .. }));
        assert_eq!(
            dispatcher.snapshot("mock").unwrap().circuit.consecutive_failures,
            0
        );
    }
}
