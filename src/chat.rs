use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::{Span, Tracer};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{Map, Value};
use std::time::Instant;
use tracing::info;

use crate::audit_log::{self, AuditRecord};
use crate::error::{AppError, ClassifiedError, classify_upstream_error};
use crate::fallback::generate_local_response;
use crate::models::*;
use crate::normalize::*;
use crate::state::{AppState, InflightGuard};

/// Chat-primary chain: one Groq attempt, then the local responder. Always
/// answers 200 once past the pre-flight checks; an upstream failure shows
/// up only in the metadata and the warning field.
pub async fn post_chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> axum::response::Response {
    let request_id = next_request_id();
    let start = Instant::now();
    let ts_start = audit_log::now_ms();

    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            state
                .metrics
                .errors
                .add(1, &[KeyValue::new("type", "invalid_request")]);
            let body = ChatFailure {
                success: false,
                error: "Internal server error".to_string(),
                details: Some(rejection.body_text()),
                request_id,
                processing_time: elapsed_ms(&start),
                service: None,
            };
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
        }
    };

    let Some(message) = payload.message.clone().filter(|m| !m.is_empty()) else {
        state
            .metrics
            .errors
            .add(1, &[KeyValue::new("type", "invalid_request")]);
        info!(request_id = %request_id, status = 400, "chat request rejected: message missing");
        return AppError::invalid_request("Message is required").into_response();
    };

    let _inflight = match state.inflight.clone().try_acquire_owned() {
        Ok(permit) => InflightGuard::new(permit, state.inflight_count.clone()),
        Err(_) => {
            state
                .metrics
                .errors
                .add(1, &[KeyValue::new("type", "rate_limited")]);
            return AppError::rate_limited("too many in-flight requests").into_response();
        }
    };

    let context_payload = build_context_payload(
        payload.context.as_ref(),
        ContextExtras {
            conversation_id: payload.conversation_id.clone(),
            project_id: payload.project_id.clone(),
            request_id: request_id.clone(),
            timestamp: now_timestamp(),
        },
    );

    let Some(api_key) = state
        .config
        .groq
        .api_key
        .clone()
        .filter(|key| !key.trim().is_empty())
    else {
        state
            .metrics
            .errors
            .add(1, &[KeyValue::new("type", "configuration_missing")]);
        info!(request_id = %request_id, status = 500, "chat request failed: groq credential missing");
        let body = ChatFailure {
            success: false,
            error: "groq.api_key is not configured.".to_string(),
            details: None,
            request_id,
            processing_time: elapsed_ms(&start),
            service: None,
        };
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
    };

    let requested = requested_model(payload.model.as_deref());
    let model = resolve_model(
        requested.as_deref(),
        &state.config.groq.model,
        &state.config.groq.model_heavy,
    );
    let temperature = resolve_temperature(payload.temperature.as_ref());
    let max_tokens = resolve_max_tokens(payload.raw_max_tokens());

    state
        .metrics
        .requests
        .add(1, &[KeyValue::new("route", "chat")]);
    info!(request_id = %request_id, model = %model, "chat request accepted");

    let groq_outcome = call_groq(
        &state,
        &api_key,
        &model,
        &message,
        temperature,
        max_tokens,
        &context_payload,
        &start,
    )
    .await;

    let (response, metadata, warning) = match groq_outcome {
        Ok(result) => {
            let ProviderCallResult {
                content,
                model,
                provider,
                tokens_used,
                finish_reason,
                token_usage,
                response_time_ms,
                ..
            } = result;
            let metadata = ChatMetadata {
                model,
                provider,
                tokens_used,
                response_time: response_time_ms,
                request_id: request_id.clone(),
                backend: false,
                groq: Some(true),
                temperature: Some(temperature),
                max_tokens: Some(max_tokens),
                token_usage,
                finish_reason,
                ..Default::default()
            };
            (content, metadata, None)
        }
        Err(err) => {
            state
                .metrics
                .errors
                .add(1, &[KeyValue::new("type", err.error_type)]);
            info!(
                request_id = %request_id,
                model = %model,
                error_type = %err.error_type,
                "primary chat attempt failed, serving local fallback"
            );
            let metadata = ChatMetadata {
                model: "offline-fallback".to_string(),
                provider: "local-fallback".to_string(),
                tokens_used: 0,
                response_time: elapsed_ms(&start),
                request_id: request_id.clone(),
                backend: false,
                fallback: Some(true),
                backend_error: Some(err.message),
                error_type: Some(err.error_type.to_string()),
                status_code: Some(err.status_code),
                ..Default::default()
            };
            (
                generate_local_response(&message),
                metadata,
                Some("Groq unavailable. Returned offline fallback response.".to_string()),
            )
        }
    };

    state.metrics.latency_ms.record(
        elapsed_ms(&start) as f64,
        &[KeyValue::new("route", "chat")],
    );
    record_span(
        &request_id,
        &metadata.model,
        &metadata.provider,
        metadata.fallback.unwrap_or(false),
        metadata.error_type.as_deref(),
    );
    info!(
        request_id = %request_id,
        model = %metadata.model,
        latency_ms = elapsed_ms(&start),
        status = 200,
        "chat request completed"
    );
    if let Some(logger) = &state.audit_logger {
        logger
            .push(AuditRecord {
                ts_start_ms: ts_start,
                ts_end_ms: audit_log::now_ms(),
                request_id: request_id.clone(),
                route: "chat",
                model: Some(metadata.model.clone()),
                provider: Some(metadata.provider.clone()),
                status: 200,
                error_type: metadata.error_type.clone(),
            })
            .await;
    }

    Json(ChatSuccess {
        success: true,
        response,
        metadata,
        warning,
    })
    .into_response()
}

pub async fn get_chat_status(State(state): State<AppState>) -> impl IntoResponse {
    let has_groq_key = state
        .config
        .groq
        .api_key
        .as_deref()
        .map(|key| !key.trim().is_empty())
        .unwrap_or(false);

    Json(PrimaryStatus {
        status: "operational",
        backend: "groq",
        api_key_configured: has_groq_key,
        timestamp: now_timestamp(),
        features: PrimaryFeatures {
            basic_chat: true,
            groq: has_groq_key,
            local_fallback: true,
            backend_integration: false,
        },
    })
}

async fn call_groq(
    state: &AppState,
    api_key: &str,
    model: &str,
    message: &str,
    temperature: f64,
    max_tokens: u32,
    context_payload: &Map<String, Value>,
    start: &Instant,
) -> Result<ProviderCallResult, ClassifiedError> {
    let request = ChatCompletionRequest {
        model: model.to_string(),
        messages: vec![
            ChatCompletionMessage {
                role: "system".to_string(),
                content: system_preamble(context_payload),
            },
            ChatCompletionMessage {
                role: "user".to_string(),
                content: message.to_string(),
            },
        ],
        temperature: Some(temperature),
        max_tokens: Some(max_tokens),
        stream: None,
        extra_body: None,
    };

    let resp = state
        .client
        .post(state.config.groq_chat_url())
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", api_key))
        .json(&request)
        .send()
        .await
        .map_err(|e| classify_upstream_error(format!("Groq request failed: {}", e)))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(classify_upstream_error(format!(
            "Groq API returned {}: {}",
            status.as_u16(),
            body
        )));
    }

    let completion: ChatCompletionResponse = resp
        .json()
        .await
        .map_err(|e| classify_upstream_error(format!("invalid Groq response: {}", e)))?;

    let ChatCompletionResponse {
        model: reported_model,
        choices,
        usage,
    } = completion;
    let choice = choices.into_iter().next();
    let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());
    let content = choice
        .and_then(|c| c.message.content)
        .filter(|content| !content.is_empty())
        .ok_or_else(|| classify_upstream_error("Groq returned an invalid response shape"))?;

    Ok(ProviderCallResult {
        content,
        model: reported_model
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| model.to_string()),
        provider: "Groq".to_string(),
        tokens_used: resolve_tokens_used(usage.as_ref()),
        finish_reason,
        token_usage: usage,
        cached: None,
        response_time_ms: elapsed_ms(start),
    })
}

fn record_span(
    request_id: &str,
    model: &str,
    provider: &str,
    fallback: bool,
    error_type: Option<&str>,
) {
    let tracer = global::tracer("codejoin-gateway");
    let mut span = tracer.start("gateway.chat");
    span.set_attribute(KeyValue::new("request.id", request_id.to_string()));
    span.set_attribute(KeyValue::new("model", model.to_string()));
    span.set_attribute(KeyValue::new("provider", provider.to_string()));
    span.set_attribute(KeyValue::new("fallback", fallback));
    if let Some(error_type) = error_type {
        span.set_attribute(KeyValue::new("error.type", error_type.to_string()));
    }
    span.end();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GroqConfig, ServerConfig};
    use axum::Router;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn test_config(groq_base_url: String, api_key: Option<&str>) -> Config {
        Config {
            server: ServerConfig {
                bind_addr: "127.0.0.1:0".to_string(),
            },
            groq: GroqConfig {
                api_key: api_key.map(str::to_string),
                base_url: groq_base_url,
                model: "llama-3.1-8b-instant".to_string(),
                model_heavy: "llama-3.3-70b-versatile".to_string(),
            },
            openrouter: Default::default(),
            backend: Default::default(),
            limits: Default::default(),
            observability: Default::default(),
        }
    }

    fn test_state(config: Config) -> AppState {
        let inflight_count = Arc::new(AtomicU64::new(0));
        AppState {
            client: reqwest::Client::new(),
            exec_client: reqwest::Client::new(),
            inflight: Arc::new(tokio::sync::Semaphore::new(config.limits.max_inflight)),
            inflight_count: inflight_count.clone(),
            metrics: crate::metrics::init_metrics_noop(inflight_count),
            audit_logger: None,
            _tracer_provider: opentelemetry_sdk::trace::SdkTracerProvider::builder().build(),
            config,
        }
    }

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        addr
    }

    fn chat_app(state: AppState) -> Router {
        Router::new()
            .route(
                "/api/ai/chat",
                axum::routing::post(post_chat).get(get_chat_status),
            )
            .with_state(state)
    }

    fn groq_mock(hits: Arc<AtomicUsize>, reply: Value) -> Router {
        Router::new().route(
            "/v1/chat/completions",
            axum::routing::post(move || {
                let hits = hits.clone();
                let reply = reply.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(reply)
                }
            }),
        )
    }

    #[tokio::test]
    async fn groq_success_reports_provider_metadata() {
        let hits = Arc::new(AtomicUsize::new(0));
        let upstream = serve(groq_mock(
            hits.clone(),
            json!({
                "model": "llama-3.1-8b-instant",
                "choices": [{
                    "message": {"role": "assistant", "content": "Hello from Groq"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 7, "completion_tokens": 5, "total_tokens": 12}
            }),
        ))
        .await;
        let state = test_state(test_config(format!("http://{}", upstream), Some("sk-test")));
        let addr = serve(chat_app(state)).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/ai/chat", addr))
            .json(&json!({"message": "Say something", "temperature": 0.5, "max_tokens": 256}))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["response"], json!("Hello from Groq"));
        assert_eq!(body["metadata"]["provider"], json!("Groq"));
        assert_eq!(body["metadata"]["tokensUsed"], json!(12));
        assert_eq!(body["metadata"]["groq"], json!(true));
        assert_eq!(body["metadata"]["temperature"], json!(0.5));
        assert_eq!(body["metadata"]["max_tokens"], json!(256));
        assert_eq!(body["metadata"]["finishReason"], json!("stop"));
        assert!(
            body["metadata"]["requestId"]
                .as_str()
                .unwrap_or_default()
                .starts_with("req-")
        );
        assert!(body.get("warning").is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn groq_429_still_answers_200_via_local_fallback() {
        let mock = Router::new().route(
            "/v1/chat/completions",
            axum::routing::post(|| async {
                (StatusCode::TOO_MANY_REQUESTS, "Rate limit reached for model")
            }),
        );
        let upstream = serve(mock).await;
        let state = test_state(test_config(format!("http://{}", upstream), Some("sk-test")));
        let addr = serve(chat_app(state)).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/ai/chat", addr))
            .json(&json!({"message": "tell me about rust"}))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["metadata"]["fallback"], json!(true));
        assert_eq!(body["metadata"]["errorType"], json!("rate_limit"));
        assert_eq!(body["metadata"]["statusCode"], json!(429));
        assert_eq!(body["metadata"]["model"], json!("offline-fallback"));
        assert_eq!(body["metadata"]["provider"], json!("local-fallback"));
        assert!(
            body["response"]
                .as_str()
                .unwrap_or_default()
                .contains("tell me about rust")
        );
        assert!(
            body["warning"]
                .as_str()
                .unwrap_or_default()
                .contains("offline fallback")
        );
    }

    #[tokio::test]
    async fn invalid_upstream_shape_falls_back_as_unknown() {
        let hits = Arc::new(AtomicUsize::new(0));
        let upstream = serve(groq_mock(hits, json!({"choices": []}))).await;
        let state = test_state(test_config(format!("http://{}", upstream), Some("sk-test")));
        let addr = serve(chat_app(state)).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/ai/chat", addr))
            .json(&json!({"message": "anything at all"}))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["metadata"]["errorType"], json!("unknown"));
        assert_eq!(body["metadata"]["statusCode"], json!(500));
        assert_eq!(body["metadata"]["fallback"], json!(true));
    }

    #[tokio::test]
    async fn missing_message_is_rejected_without_upstream_call() {
        let hits = Arc::new(AtomicUsize::new(0));
        let upstream = serve(groq_mock(hits.clone(), json!({}))).await;
        let state = test_state(test_config(format!("http://{}", upstream), Some("sk-test")));
        let addr = serve(chat_app(state)).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/ai/chat", addr))
            .json(&json!({"context": "no message here"}))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 400);
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["error"], json!("Message is required"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_credential_short_circuits_with_500() {
        let hits = Arc::new(AtomicUsize::new(0));
        let upstream = serve(groq_mock(hits.clone(), json!({}))).await;
        let state = test_state(test_config(format!("http://{}", upstream), None));
        let addr = serve(chat_app(state)).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/ai/chat", addr))
            .json(&json!({"message": "anything"}))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 500);
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["success"], json!(false));
        assert!(
            body["error"]
                .as_str()
                .unwrap_or_default()
                .contains("not configured")
        );
        assert!(
            body["requestId"]
                .as_str()
                .unwrap_or_default()
                .starts_with("req-")
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn heavy_alias_reaches_upstream_resolved() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let capture = seen.clone();
        let mock = Router::new().route(
            "/v1/chat/completions",
            axum::routing::post(move |Json(body): Json<Value>| {
                let seen = capture.clone();
                async move {
                    *seen.lock().expect("lock") = Some(body);
                    Json(json!({
                        "choices": [{"message": {"content": "ok"}, "finish_reason": "stop"}]
                    }))
                }
            }),
        );
        let upstream = serve(mock).await;
        let state = test_state(test_config(format!("http://{}", upstream), Some("sk-test")));
        let addr = serve(chat_app(state)).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/ai/chat", addr))
            .json(&json!({"message": "anything", "model": "Heavy"}))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 200);
        let sent = seen.lock().expect("lock").clone().expect("captured");
        assert_eq!(sent["model"], json!("llama-3.3-70b-versatile"));
        assert_eq!(sent["messages"][0]["role"], json!("system"));
        assert_eq!(sent["messages"][1]["content"], json!("anything"));
    }

    #[tokio::test]
    async fn status_reports_credential_configuration() {
        let state = test_state(test_config("http://127.0.0.1:1".to_string(), Some("sk-test")));
        let addr = serve(chat_app(state)).await;

        let resp = reqwest::Client::new()
            .get(format!("http://{}/api/ai/chat", addr))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["status"], json!("operational"));
        assert_eq!(body["backend"], json!("groq"));
        assert_eq!(body["apiKeyConfigured"], json!(true));
        assert_eq!(body["features"]["basicChat"], json!(true));
        assert_eq!(body["features"]["localFallback"], json!(true));
        assert_eq!(body["features"]["backendIntegration"], json!(false));
    }
}
