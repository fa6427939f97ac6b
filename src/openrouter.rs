use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::{Span, Tracer};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{Map, Value, json};
use std::time::Instant;
use tracing::info;

use crate::audit_log::{self, AuditRecord};
use crate::error::{AppError, ClassifiedError, classify_upstream_error};
use crate::models::*;
use crate::normalize::*;
use crate::state::{AppState, InflightGuard};

/// Chat-secondary chain: brokered backend call, then a direct OpenRouter
/// call when a local credential exists. Both attempts are genuine upstream
/// calls; when the chain is exhausted the caller gets a 503.
pub async fn post_openrouter_chat(
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
                service: Some("openrouter"),
            };
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
        }
    };

    let Some(message) = payload.message.clone().filter(|m| !m.is_empty()) else {
        state
            .metrics
            .errors
            .add(1, &[KeyValue::new("type", "invalid_request")]);
        info!(request_id = %request_id, status = 400, "openrouter chat request rejected: message missing");
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

    let requested =
        requested_model(payload.model.as_deref()).or_else(|| selected_model(&context_payload));
    let model = resolve_model(
        requested.as_deref(),
        &state.config.openrouter.model,
        &state.config.openrouter.model_heavy,
    );

    state
        .metrics
        .requests
        .add(1, &[KeyValue::new("route", "openrouter")]);
    info!(request_id = %request_id, model = %model, "openrouter chat request accepted");

    let outcome = match call_brokered(&state, &message, &context_payload, &model, &start).await {
        Ok(result) => Ok((result, true, false)),
        Err(broker_err) => {
            state
                .metrics
                .errors
                .add(1, &[KeyValue::new("type", broker_err.error_type)]);
            info!(
                request_id = %request_id,
                error_type = %broker_err.error_type,
                "openrouter backend attempt failed, trying direct call"
            );
            match state
                .config
                .openrouter
                .api_key
                .clone()
                .filter(|key| !key.trim().is_empty())
            {
                None => Err((
                    "Failed to connect to OpenRouter backend and no openrouter.api_key is configured."
                        .to_string(),
                    broker_err,
                )),
                Some(api_key) => {
                    match call_direct(&state, &api_key, &message, &context_payload, &model, &start)
                        .await
                    {
                        Ok(result) => Ok((result, false, true)),
                        Err(direct_err) => {
                            state
                                .metrics
                                .errors
                                .add(1, &[KeyValue::new("type", direct_err.error_type)]);
                            Err((
                                "Failed to connect to OpenRouter AI service".to_string(),
                                direct_err,
                            ))
                        }
                    }
                }
            }
        }
    };

    match outcome {
        Ok((result, backend, direct)) => {
            let ProviderCallResult {
                content,
                model,
                provider,
                tokens_used,
                finish_reason,
                token_usage,
                cached,
                response_time_ms,
            } = result;
            let metadata = ChatMetadata {
                model,
                provider,
                tokens_used,
                response_time: response_time_ms,
                request_id: request_id.clone(),
                backend,
                openrouter: Some(true),
                direct: direct.then_some(true),
                token_usage,
                finish_reason,
                cached,
                ..Default::default()
            };
            state.metrics.latency_ms.record(
                elapsed_ms(&start) as f64,
                &[KeyValue::new("route", "openrouter")],
            );
            record_span(&request_id, &metadata.model, &metadata.provider, None);
            info!(
                request_id = %request_id,
                model = %metadata.model,
                latency_ms = elapsed_ms(&start),
                status = 200,
                "openrouter chat request completed"
            );
            if let Some(logger) = &state.audit_logger {
                logger
                    .push(AuditRecord {
                        ts_start_ms: ts_start,
                        ts_end_ms: audit_log::now_ms(),
                        request_id: request_id.clone(),
                        route: "openrouter",
                        model: Some(metadata.model.clone()),
                        provider: Some(metadata.provider.clone()),
                        status: 200,
                        error_type: None,
                    })
                    .await;
            }
            Json(ChatSuccess {
                success: true,
                response: content,
                metadata,
                warning: None,
            })
            .into_response()
        }
        Err((error, err)) => {
            record_span(&request_id, &model, "OpenRouter", Some(err.error_type));
            info!(
                request_id = %request_id,
                model = %model,
                latency_ms = elapsed_ms(&start),
                status = 503,
                error_type = %err.error_type,
                "openrouter chat request failed"
            );
            if let Some(logger) = &state.audit_logger {
                logger
                    .push(AuditRecord {
                        ts_start_ms: ts_start,
                        ts_end_ms: audit_log::now_ms(),
                        request_id: request_id.clone(),
                        route: "openrouter",
                        model: Some(model.clone()),
                        provider: Some("OpenRouter".to_string()),
                        status: 503,
                        error_type: Some(err.error_type.to_string()),
                    })
                    .await;
            }
            let body = ChatFailure {
                success: false,
                error,
                details: Some(err.message),
                request_id,
                processing_time: elapsed_ms(&start),
                service: Some("openrouter"),
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
    }
}

pub async fn get_openrouter_status(State(state): State<AppState>) -> impl IntoResponse {
    let mut backend_status = "disconnected";
    let mut backend_details = None;

    let probe = tokio::time::timeout(
        state.config.health_timeout(),
        state
            .client
            .get(state.config.brokered_health_url())
            .header("X-API-Key", state.config.backend.api_key.as_str())
            .send(),
    )
    .await;

    match probe {
        Ok(Ok(resp)) if resp.status().is_success() => match resp.json::<Value>().await {
            Ok(data) => {
                backend_status = "connected";
                backend_details = Some(data);
            }
            Err(_) => backend_status = "error",
        },
        Ok(Ok(_)) => backend_status = "error",
        Ok(Err(_)) | Err(_) => backend_status = "disconnected",
    }

    let connected = backend_status == "connected";
    Json(SecondaryStatus {
        status: "operational",
        backend: backend_status,
        backend_details,
        timestamp: now_timestamp(),
        features: SecondaryFeatures {
            openrouter_chat: connected,
            backend_integration: connected,
        },
        service: "openrouter",
    })
}

async fn call_brokered(
    state: &AppState,
    message: &str,
    context_payload: &Map<String, Value>,
    model: &str,
    start: &Instant,
) -> Result<ProviderCallResult, ClassifiedError> {
    let request = BrokeredChatRequest {
        message: message.to_string(),
        context: Value::Object(context_payload.clone()),
        model: model.to_string(),
    };

    let resp = state
        .client
        .post(state.config.brokered_chat_url())
        .header(CONTENT_TYPE, "application/json")
        .header("X-API-Key", state.config.backend.api_key.as_str())
        .json(&request)
        .send()
        .await
        .map_err(|e| classify_upstream_error(format!("OpenRouter backend request failed: {}", e)))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(classify_upstream_error(format!(
            "OpenRouter backend API returned {}: {}",
            status.as_u16(),
            body
        )));
    }

    let reply: BrokeredChatResponse = resp.json().await.map_err(|e| {
        classify_upstream_error(format!("invalid OpenRouter backend response: {}", e))
    })?;

    let BrokeredChatResponse {
        response,
        message: reply_message,
        metadata,
    } = reply;
    let content = response
        .filter(|c| !c.is_empty())
        .or(reply_message.filter(|c| !c.is_empty()))
        .ok_or_else(|| {
            classify_upstream_error("OpenRouter backend returned an invalid response shape")
        })?;

    let metadata = metadata.unwrap_or_default();
    let tokens_used = metadata
        .tokens_used
        .or_else(|| metadata.usage.as_ref().and_then(|u| u.total_tokens))
        .unwrap_or(0);

    Ok(ProviderCallResult {
        content,
        model: metadata
            .model
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| model.to_string()),
        provider: metadata
            .provider
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "OpenRouter".to_string()),
        tokens_used,
        finish_reason: metadata.finish_reason,
        token_usage: metadata.usage,
        cached: metadata.cached,
        response_time_ms: elapsed_ms(start),
    })
}

async fn call_direct(
    state: &AppState,
    api_key: &str,
    message: &str,
    context_payload: &Map<String, Value>,
    model: &str,
    start: &Instant,
) -> Result<ProviderCallResult, ClassifiedError> {
    let request = ChatCompletionRequest {
        model: model.to_string(),
        messages: vec![ChatCompletionMessage {
            role: "user".to_string(),
            content: message.to_string(),
        }],
        temperature: None,
        max_tokens: None,
        stream: Some(false),
        extra_body: Some(json!({ "context": Value::Object(context_payload.clone()) })),
    };

    let resp = state
        .client
        .post(state.config.openrouter_direct_url())
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", api_key))
        .header("HTTP-Referer", state.config.openrouter.site_url.as_str())
        .header("X-Title", state.config.openrouter.app_title.as_str())
        .json(&request)
        .send()
        .await
        .map_err(|e| classify_upstream_error(format!("OpenRouter direct request failed: {}", e)))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(classify_upstream_error(format!(
            "OpenRouter direct call returned {}: {}",
            status.as_u16(),
            body
        )));
    }

    let completion: ChatCompletionResponse = resp.json().await.map_err(|e| {
        classify_upstream_error(format!("invalid OpenRouter direct response: {}", e))
    })?;

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
        .ok_or_else(|| classify_upstream_error("OpenRouter returned an invalid response shape"))?;

    Ok(ProviderCallResult {
        content,
        model: reported_model
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| model.to_string()),
        provider: "OpenRouter".to_string(),
        tokens_used: resolve_tokens_used(usage.as_ref()),
        finish_reason,
        token_usage: usage,
        cached: None,
        response_time_ms: elapsed_ms(start),
    })
}

fn record_span(request_id: &str, model: &str, provider: &str, error_type: Option<&str>) {
    let tracer = global::tracer("codejoin-gateway");
    let mut span = tracer.start("gateway.openrouter");
    span.set_attribute(KeyValue::new("request.id", request_id.to_string()));
    span.set_attribute(KeyValue::new("model", model.to_string()));
    span.set_attribute(KeyValue::new("provider", provider.to_string()));
    if let Some(error_type) = error_type {
        span.set_attribute(KeyValue::new("error.type", error_type.to_string()));
    }
    span.end();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, Config, OpenRouterConfig, ServerConfig};
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    fn test_config(
        backend_base_url: String,
        openrouter_base_url: String,
        api_key: Option<&str>,
    ) -> Config {
        Config {
            server: ServerConfig {
                bind_addr: "127.0.0.1:0".to_string(),
            },
            groq: Default::default(),
            openrouter: OpenRouterConfig {
                api_key: api_key.map(str::to_string),
                base_url: openrouter_base_url,
                ..Default::default()
            },
            backend: BackendConfig {
                base_url: backend_base_url,
                ..Default::default()
            },
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

    fn openrouter_app(state: AppState) -> Router {
        Router::new()
            .route(
                "/api/openrouter-ai/chat",
                axum::routing::post(post_openrouter_chat).get(get_openrouter_status),
            )
            .with_state(state)
    }

    fn capture_mock(
        path: &str,
        seen: Arc<std::sync::Mutex<Option<Value>>>,
        reply: Value,
    ) -> Router {
        Router::new().route(
            path,
            axum::routing::post(move |Json(body): Json<Value>| {
                let seen = seen.clone();
                let reply = reply.clone();
                async move {
                    *seen.lock().expect("lock") = Some(body);
                    Json(reply)
                }
            }),
        )
    }

    #[tokio::test]
    async fn brokered_success_marks_backend_true() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let backend = serve(capture_mock(
            "/api/openrouter-ai/chat",
            seen.clone(),
            json!({
                "response": "from backend",
                "metadata": {
                    "model": "qwen/qwen3-235b-a22b:free",
                    "provider": "OpenRouter",
                    "tokensUsed": 9,
                    "finishReason": "stop",
                    "cached": false
                }
            }),
        ))
        .await;
        let state = test_state(test_config(
            format!("http://{}", backend),
            "http://127.0.0.1:1".to_string(),
            None,
        ));
        let addr = serve(openrouter_app(state)).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/openrouter-ai/chat", addr))
            .json(&json!({"message": "summarize the project", "context": {"a": 1}}))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["response"], json!("from backend"));
        assert_eq!(body["metadata"]["backend"], json!(true));
        assert_eq!(body["metadata"]["openrouter"], json!(true));
        assert_eq!(body["metadata"]["tokensUsed"], json!(9));
        assert_eq!(body["metadata"]["cached"], json!(false));
        assert!(body["metadata"].get("direct").is_none());

        let sent = seen.lock().expect("lock").clone().expect("captured");
        assert_eq!(sent["message"], json!("summarize the project"));
        assert_eq!(sent["model"], json!("qwen/qwen3-235b-a22b:free"));
        assert_eq!(sent["context"]["a"], json!(1));
        assert!(
            sent["context"]["requestId"]
                .as_str()
                .unwrap_or_default()
                .starts_with("req-")
        );
        assert!(sent["context"]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn selected_model_and_alias_resolve_before_dispatch() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let backend = serve(capture_mock(
            "/api/openrouter-ai/chat",
            seen.clone(),
            json!({"response": "ok"}),
        ))
        .await;
        let state = test_state(test_config(
            format!("http://{}", backend),
            "http://127.0.0.1:1".to_string(),
            None,
        ));
        let addr = serve(openrouter_app(state)).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/openrouter-ai/chat", addr))
            .json(&json!({"message": "x", "context": {"selectedModel": "smart"}}))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 200);
        let sent = seen.lock().expect("lock").clone().expect("captured");
        assert_eq!(sent["model"], json!("qwen/qwen3-coder:free"));
    }

    #[tokio::test]
    async fn broker_failure_without_credential_is_terminal_503() {
        let backend = serve(Router::new().route(
            "/api/openrouter-ai/chat",
            axum::routing::post(|| async {
                (StatusCode::INTERNAL_SERVER_ERROR, "broker down")
            }),
        ))
        .await;
        let state = test_state(test_config(
            format!("http://{}", backend),
            "http://127.0.0.1:1".to_string(),
            None,
        ));
        let addr = serve(openrouter_app(state)).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/openrouter-ai/chat", addr))
            .json(&json!({"message": "x"}))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 503);
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["service"], json!("openrouter"));
        assert!(
            body["error"]
                .as_str()
                .unwrap_or_default()
                .contains("no openrouter.api_key")
        );
        assert!(
            body["details"]
                .as_str()
                .unwrap_or_default()
                .contains("broker down")
        );
    }

    #[tokio::test]
    async fn broker_failure_falls_back_to_direct_call() {
        let backend = serve(Router::new().route(
            "/api/openrouter-ai/chat",
            axum::routing::post(|| async {
                (StatusCode::INTERNAL_SERVER_ERROR, "broker down")
            }),
        ))
        .await;
        let seen = Arc::new(std::sync::Mutex::new(None));
        let direct = serve(capture_mock(
            "/v1/chat/completions",
            seen.clone(),
            json!({
                "model": "qwen/qwen3-235b-a22b:free",
                "choices": [{"message": {"content": "direct reply"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 2, "completion_tokens": 2, "total_tokens": 4}
            }),
        ))
        .await;
        let state = test_state(test_config(
            format!("http://{}", backend),
            format!("http://{}", direct),
            Some("sk-or-test"),
        ));
        let addr = serve(openrouter_app(state)).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/openrouter-ai/chat", addr))
            .json(&json!({"message": "try direct"}))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["response"], json!("direct reply"));
        assert_eq!(body["metadata"]["direct"], json!(true));
        assert_eq!(body["metadata"]["backend"], json!(false));
        assert_eq!(body["metadata"]["tokensUsed"], json!(4));

        let sent = seen.lock().expect("lock").clone().expect("captured");
        assert_eq!(sent["stream"], json!(false));
        assert!(sent["extra_body"]["context"]["requestId"].is_string());
    }

    #[tokio::test]
    async fn exhausted_chain_is_503_with_details() {
        let backend = serve(Router::new().route(
            "/api/openrouter-ai/chat",
            axum::routing::post(|| async {
                (StatusCode::INTERNAL_SERVER_ERROR, "broker down")
            }),
        ))
        .await;
        let direct = serve(Router::new().route(
            "/v1/chat/completions",
            axum::routing::post(|| async {
                (StatusCode::UNAUTHORIZED, "invalid key")
            }),
        ))
        .await;
        let state = test_state(test_config(
            format!("http://{}", backend),
            format!("http://{}", direct),
            Some("sk-or-test"),
        ));
        let addr = serve(openrouter_app(state)).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/openrouter-ai/chat", addr))
            .json(&json!({"message": "x"}))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 503);
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["success"], json!(false));
        assert_eq!(
            body["error"],
            json!("Failed to connect to OpenRouter AI service")
        );
        assert!(
            body["details"]
                .as_str()
                .unwrap_or_default()
                .contains("401")
        );
    }

    #[tokio::test]
    async fn status_reports_connected_backend() {
        let backend = serve(Router::new().route(
            "/api/openrouter-ai/health",
            axum::routing::get(|| async { Json(json!({"status": "ok"})) }),
        ))
        .await;
        let state = test_state(test_config(
            format!("http://{}", backend),
            "http://127.0.0.1:1".to_string(),
            None,
        ));
        let addr = serve(openrouter_app(state)).await;

        let resp = reqwest::Client::new()
            .get(format!("http://{}/api/openrouter-ai/chat", addr))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["status"], json!("operational"));
        assert_eq!(body["backend"], json!("connected"));
        assert_eq!(body["backendDetails"]["status"], json!("ok"));
        assert_eq!(body["features"]["openrouterChat"], json!(true));
        assert_eq!(body["service"], json!("openrouter"));
    }

    #[tokio::test]
    async fn status_reports_disconnected_backend() {
        let state = test_state(test_config(
            "http://127.0.0.1:1".to_string(),
            "http://127.0.0.1:1".to_string(),
            None,
        ));
        let addr = serve(openrouter_app(state)).await;

        let resp = reqwest::Client::new()
            .get(format!("http://{}/api/openrouter-ai/chat", addr))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["backend"], json!("disconnected"));
        assert_eq!(body["backendDetails"], Value::Null);
        assert_eq!(body["features"]["openrouterChat"], json!(false));
    }
}
