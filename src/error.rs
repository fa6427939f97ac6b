use axum::{Json, http::StatusCode, response::IntoResponse};
use serde_json::json;

/// Pre-flight rejection surfaced before any upstream attempt.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Raw upstream failure mapped to the closed error taxonomy. The status is
/// advisory metadata; the dispatcher decides what the caller sees.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ClassifiedError {
    pub error_type: &'static str,
    pub status_code: u16,
    pub message: String,
}

/// Ordered (patterns, kind, status) rules; first match on the lowercased
/// text wins. The substring contract is externally observable — keep the
/// order and the patterns as they are.
const CLASSIFY_RULES: &[(&[&str], &str, u16)] = &[
    (&["rate limit", "429"], "rate_limit", 429),
    (&["403"], "quota_exceeded", 403),
    (&["401"], "authentication", 401),
    (&["402"], "credits_insufficient", 402),
    (&["503", "temporarily unavailable"], "service_unavailable", 503),
];

pub fn classify_upstream_error(message: impl Into<String>) -> ClassifiedError {
    let message = message.into();
    let lowered = message.to_lowercase();
    for (patterns, error_type, status_code) in CLASSIFY_RULES {
        if patterns.iter().any(|pattern| lowered.contains(pattern)) {
            return ClassifiedError {
                error_type,
                status_code: *status_code,
                message,
            };
        }
    }
    ClassifiedError {
        error_type: "unknown",
        status_code: 500,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_matches_text_and_status_code() {
        let err = classify_upstream_error("Groq API returned 429: slow down");
        assert_eq!(err.error_type, "rate_limit");
        assert_eq!(err.status_code, 429);

        let err = classify_upstream_error("Rate Limit reached for model");
        assert_eq!(err.error_type, "rate_limit");
    }

    #[test]
    fn numeric_statuses_map_to_their_kinds() {
        assert_eq!(classify_upstream_error("got 403 from upstream").error_type, "quota_exceeded");
        assert_eq!(classify_upstream_error("got 401 from upstream").error_type, "authentication");
        assert_eq!(
            classify_upstream_error("got 402 from upstream").error_type,
            "credits_insufficient"
        );
    }

    #[test]
    fn service_unavailable_matches_either_pattern() {
        assert_eq!(classify_upstream_error("HTTP 503").error_type, "service_unavailable");
        assert_eq!(
            classify_upstream_error("model is Temporarily Unavailable").error_type,
            "service_unavailable"
        );
    }

    #[test]
    fn first_matching_rule_wins() {
        let err = classify_upstream_error("rate limit hit, then 403 on retry");
        assert_eq!(err.error_type, "rate_limit");
        assert_eq!(err.status_code, 429);
    }

    #[test]
    fn unmatched_text_is_unknown_500() {
        let err = classify_upstream_error("connection reset by peer");
        assert_eq!(err.error_type, "unknown");
        assert_eq!(err.status_code, 500);
        assert_eq!(err.message, "connection reset by peer");
    }
}
