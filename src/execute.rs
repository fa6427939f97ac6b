use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use opentelemetry::KeyValue;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::info;

use crate::audit_log::{self, AuditRecord};
use crate::error::AppError;
use crate::models::*;
use crate::normalize::{elapsed_ms, next_request_id, now_timestamp};
use crate::state::{AppState, InflightGuard};

const DEFAULT_EXECUTE_TIMEOUT_MS: u64 = 30000;

/// Execution chain: a single attempt against the backend, bounded by the
/// caller's wall-clock budget. Dropping the timed-out future aborts the
/// in-flight connection.
pub async fn post_execute(
    State(state): State<AppState>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> axum::response::Response {
    let request_id = next_request_id();
    let start = Instant::now();
    let ts_start = audit_log::now_ms();

    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(_) => {
            state
                .metrics
                .errors
                .add(1, &[KeyValue::new("type", "invalid_request")]);
            let body = ExecuteFailure {
                success: false,
                language: "unknown".to_string(),
                output: String::new(),
                error: "Invalid request format".to_string(),
                exit_code: 1,
                execution_time: 0,
                timestamp: now_timestamp(),
            };
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };

    let language = payload.language.clone().filter(|l| !l.is_empty());
    let code = payload.code.clone().filter(|c| !c.is_empty());
    let (Some(language), Some(code)) = (language, code) else {
        state
            .metrics
            .errors
            .add(1, &[KeyValue::new("type", "invalid_request")]);
        info!(request_id = %request_id, status = 400, "execute request rejected: parameters missing");
        let body = ExecuteValidationFailure {
            success: false,
            error: "Missing required parameters: language and code".to_string(),
            timestamp: now_timestamp(),
        };
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
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

    let timeout_ms = payload.timeout.unwrap_or(DEFAULT_EXECUTE_TIMEOUT_MS);
    state
        .metrics
        .requests
        .add(1, &[KeyValue::new("route", "execute")]);
    info!(
        request_id = %request_id,
        language = %language,
        timeout_ms = timeout_ms,
        "execute request accepted"
    );

    let request = BackendExecuteRequest {
        language: language.clone(),
        code,
        input: payload.input.clone(),
        timeout: timeout_ms,
    };
    let send = state
        .exec_client
        .post(state.config.execute_url())
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header("X-API-Key", state.config.backend.api_key.as_str())
        .json(&request)
        .send();

    let resp = match tokio::time::timeout(Duration::from_millis(timeout_ms), send).await {
        Err(_) => {
            let body = ExecuteFailure {
                success: false,
                language,
                output: String::new(),
                error: "Execution timeout: The code took too long to run".to_string(),
                exit_code: 124,
                execution_time: timeout_ms,
                timestamp: now_timestamp(),
            };
            return finish_failure(
                &state,
                request_id,
                ts_start,
                &start,
                "timeout",
                StatusCode::REQUEST_TIMEOUT,
                body,
            )
            .await;
        }
        Ok(Err(e)) if e.is_connect() => {
            let body = ExecuteFailure {
                success: false,
                language,
                output: String::new(),
                error: format!(
                    "Connection failed: Cannot connect to backend at {}. Make sure the backend server is running.",
                    state.config.backend.base_url
                ),
                exit_code: 1,
                execution_time: 0,
                timestamp: now_timestamp(),
            };
            return finish_failure(
                &state,
                request_id,
                ts_start,
                &start,
                "connection_failure",
                StatusCode::SERVICE_UNAVAILABLE,
                body,
            )
            .await;
        }
        Ok(Err(e)) => {
            let body = ExecuteFailure {
                success: false,
                language,
                output: String::new(),
                error: e.to_string(),
                exit_code: 1,
                execution_time: 0,
                timestamp: now_timestamp(),
            };
            return finish_failure(
                &state,
                request_id,
                ts_start,
                &start,
                "unknown",
                StatusCode::INTERNAL_SERVER_ERROR,
                body,
            )
            .await;
        }
        Ok(Ok(resp)) => resp,
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let status_text = status.canonical_reason().unwrap_or("Unknown");
        let raw = resp.text().await.unwrap_or_default();
        let error = match serde_json::from_str::<Value>(&raw) {
            Ok(parsed) => parsed
                .get("error")
                .and_then(Value::as_str)
                .or_else(|| parsed.get("message").and_then(Value::as_str))
                .unwrap_or("Backend execution failed")
                .to_string(),
            Err(_) if !raw.is_empty() && raw.len() < 500 => raw.clone(),
            Err(_) => format!("Backend error: {} {}", status.as_u16(), status_text),
        };
        let body = ExecuteFailure {
            success: false,
            language,
            output: String::new(),
            error,
            exit_code: 1,
            execution_time: 0,
            timestamp: now_timestamp(),
        };
        let mirrored =
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        return finish_failure(
            &state,
            request_id,
            ts_start,
            &start,
            "backend_error",
            mirrored,
            body,
        )
        .await;
    }

    let result = match resp.json::<Value>().await {
        Ok(result) => result,
        Err(e) => {
            let body = ExecuteFailure {
                success: false,
                language,
                output: String::new(),
                error: e.to_string(),
                exit_code: 1,
                execution_time: 0,
                timestamp: now_timestamp(),
            };
            return finish_failure(
                &state,
                request_id,
                ts_start,
                &start,
                "unknown",
                StatusCode::INTERNAL_SERVER_ERROR,
                body,
            )
            .await;
        }
    };

    let result = match result {
        Value::Object(mut fields) => {
            fields.insert("timestamp".to_string(), Value::String(now_timestamp()));
            Value::Object(fields)
        }
        _ => json!({ "timestamp": now_timestamp() }),
    };

    state.metrics.latency_ms.record(
        elapsed_ms(&start) as f64,
        &[KeyValue::new("route", "execute")],
    );
    info!(
        request_id = %request_id,
        language = %language,
        latency_ms = elapsed_ms(&start),
        status = 200,
        "execute request completed"
    );
    if let Some(logger) = &state.audit_logger {
        logger
            .push(AuditRecord {
                ts_start_ms: ts_start,
                ts_end_ms: audit_log::now_ms(),
                request_id,
                route: "execute",
                model: None,
                provider: Some("backend".to_string()),
                status: 200,
                error_type: None,
            })
            .await;
    }

    Json(result).into_response()
}

async fn finish_failure(
    state: &AppState,
    request_id: String,
    ts_start: u128,
    start: &Instant,
    error_type: &'static str,
    status: StatusCode,
    body: ExecuteFailure,
) -> axum::response::Response {
    state
        .metrics
        .errors
        .add(1, &[KeyValue::new("type", error_type)]);
    info!(
        request_id = %request_id,
        language = %body.language,
        latency_ms = elapsed_ms(start),
        status = status.as_u16(),
        error_type = error_type,
        "execute request failed"
    );
    if let Some(logger) = &state.audit_logger {
        logger
            .push(AuditRecord {
                ts_start_ms: ts_start,
                ts_end_ms: audit_log::now_ms(),
                request_id,
                route: "execute",
                model: None,
                provider: Some("backend".to_string()),
                status: status.as_u16(),
                error_type: Some(error_type.to_string()),
            })
            .await;
    }
    (status, Json(body)).into_response()
}

/// Availability probe against the backend's language list.
pub async fn get_execute_status(State(state): State<AppState>) -> axum::response::Response {
    let probe = tokio::time::timeout(
        state.config.health_timeout(),
        state
            .client
            .get(state.config.languages_url())
            .header("X-API-Key", state.config.backend.api_key.as_str())
            .send(),
    )
    .await;

    let url = state.config.backend.base_url.clone();
    match probe {
        Ok(Ok(resp)) if resp.status().is_success() => {
            let languages = resp
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("languages").cloned())
                .unwrap_or_else(|| Value::Array(Vec::new()));
            Json(ExecStatus {
                status: "available",
                message: "Code execution service is available",
                backend: BackendProbe {
                    status: "connected",
                    url,
                    ..Default::default()
                },
                languages: Some(languages),
                timestamp: now_timestamp(),
            })
            .into_response()
        }
        Ok(Ok(resp)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ExecStatus {
                status: "unavailable",
                message: "Code execution service is not responding correctly",
                backend: BackendProbe {
                    status: "error",
                    url,
                    status_code: Some(resp.status().as_u16()),
                    ..Default::default()
                },
                languages: None,
                timestamp: now_timestamp(),
            }),
        )
            .into_response(),
        Ok(Err(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ExecStatus {
                status: "unavailable",
                message: "Cannot connect to code execution backend",
                backend: BackendProbe {
                    status: "disconnected",
                    url,
                    error: Some(e.to_string()),
                    ..Default::default()
                },
                languages: None,
                timestamp: now_timestamp(),
            }),
        )
            .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ExecStatus {
                status: "unavailable",
                message: "Cannot connect to code execution backend",
                backend: BackendProbe {
                    status: "disconnected",
                    url,
                    error: Some("health check timed out".to_string()),
                    ..Default::default()
                },
                languages: None,
                timestamp: now_timestamp(),
            }),
        )
            .into_response(),
    }
}

/// Gateway health: probes the backend's own health endpoint under the
/// fixed short budget.
pub async fn get_health(State(state): State<AppState>) -> axum::response::Response {
    let probe = tokio::time::timeout(
        state.config.health_timeout(),
        state
            .client
            .get(state.config.backend_health_url())
            .header("X-API-Key", state.config.backend.api_key.as_str())
            .send(),
    )
    .await;

    let url = state.config.backend.base_url.clone();
    match probe {
        Ok(Ok(resp)) if resp.status().is_success() => {
            let data = resp.json::<Value>().await.unwrap_or(Value::Null);
            Json(HealthStatus {
                status: "healthy",
                message: "Gateway and backend are connected",
                backend: BackendProbe {
                    status: "connected",
                    url,
                    data: Some(data),
                    ..Default::default()
                },
                timestamp: now_timestamp(),
            })
            .into_response()
        }
        Ok(Ok(resp)) => {
            let status = resp.status();
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthStatus {
                    status: "degraded",
                    message: "Backend responded with an error",
                    backend: BackendProbe {
                        status: "error",
                        url,
                        status_code: Some(status.as_u16()),
                        status_text: status.canonical_reason().map(str::to_string),
                        ..Default::default()
                    },
                    timestamp: now_timestamp(),
                }),
            )
                .into_response()
        }
        Ok(Err(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus {
                status: "unhealthy",
                message: "Cannot connect to backend",
                backend: BackendProbe {
                    status: "disconnected",
                    url,
                    error: Some(e.to_string()),
                    ..Default::default()
                },
                timestamp: now_timestamp(),
            }),
        )
            .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus {
                status: "unhealthy",
                message: "Cannot connect to backend",
                backend: BackendProbe {
                    status: "disconnected",
                    url,
                    error: Some("health check timed out".to_string()),
                    ..Default::default()
                },
                timestamp: now_timestamp(),
            }),
        )
            .into_response(),
    }
}
