use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound chat envelope shared by both chat endpoint families.
///
/// `temperature` and the max-token fields stay raw `Value`s: a non-numeric
/// value normalizes to the default instead of rejecting the whole body.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default, rename = "conversationId")]
    pub conversation_id: Option<Value>,
    #[serde(default, rename = "projectId")]
    pub project_id: Option<Value>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<Value>,
    #[serde(default)]
    pub max_tokens: Option<Value>,
    #[serde(default, rename = "maxTokens")]
    pub max_tokens_camel: Option<Value>,
}

impl ChatRequest {
    /// `max_tokens` wins over `maxTokens` when both are present.
    pub fn raw_max_tokens(&self) -> Option<&Value> {
        self.max_tokens.as_ref().or(self.max_tokens_camel.as_ref())
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ChatSuccess {
    pub success: bool,
    pub response: String,
    pub metadata: ChatMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatFailure {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "processingTime")]
    pub processing_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<&'static str>,
}

/// Unified metadata contract for chat responses. Absent optionals are
/// omitted from the JSON, never serialized as null.
#[derive(Debug, Default, Serialize)]
pub struct ChatMetadata {
    pub model: String,
    pub provider: String,
    #[serde(rename = "tokensUsed")]
    pub tokens_used: u64,
    #[serde(rename = "responseTime")]
    pub response_time: u64,
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub backend: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groq: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openrouter: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<bool>,
    #[serde(rename = "backendError", skip_serializing_if = "Option::is_none")]
    pub backend_error: Option<String>,
    #[serde(rename = "errorType", skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(rename = "statusCode", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(rename = "tokenUsage", skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(rename = "finishReason", skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

/// Normalized outcome of one successful provider attempt.
#[derive(Debug)]
pub struct ProviderCallResult {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub tokens_used: u64,
    pub finish_reason: Option<String>,
    pub token_usage: Option<TokenUsage>,
    pub cached: Option<bool>,
    pub response_time_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatCompletionMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_body: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionChoice {
    pub message: ChatCompletionChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BackendExecuteRequest {
    pub language: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    pub timeout: u64,
}

#[derive(Debug, Serialize)]
pub struct BrokeredChatRequest {
    pub message: String,
    pub context: Value,
    pub model: String,
}

#[derive(Debug, Deserialize)]
pub struct BrokeredChatResponse {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: Option<BrokeredMetadata>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BrokeredMetadata {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default, rename = "tokensUsed")]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default, rename = "finishReason")]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub cached: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct PrimaryStatus {
    pub status: &'static str,
    pub backend: &'static str,
    #[serde(rename = "apiKeyConfigured")]
    pub api_key_configured: bool,
    pub timestamp: String,
    pub features: PrimaryFeatures,
}

#[derive(Debug, Serialize)]
pub struct PrimaryFeatures {
    #[serde(rename = "basicChat")]
    pub basic_chat: bool,
    pub groq: bool,
    #[serde(rename = "localFallback")]
    pub local_fallback: bool,
    #[serde(rename = "backendIntegration")]
    pub backend_integration: bool,
}

#[derive(Debug, Serialize)]
pub struct SecondaryStatus {
    pub status: &'static str,
    pub backend: &'static str,
    #[serde(rename = "backendDetails")]
    pub backend_details: Option<Value>,
    pub timestamp: String,
    pub features: SecondaryFeatures,
    pub service: &'static str,
}

#[derive(Debug, Serialize)]
pub struct SecondaryFeatures {
    #[serde(rename = "openrouterChat")]
    pub openrouter_chat: bool,
    #[serde(rename = "backendIntegration")]
    pub backend_integration: bool,
}

#[derive(Debug, Serialize)]
pub struct ExecuteFailure {
    pub success: bool,
    pub language: String,
    pub output: String,
    pub error: String,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    #[serde(rename = "executionTime")]
    pub execution_time: u64,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ExecuteValidationFailure {
    pub success: bool,
    pub error: String,
    pub timestamp: String,
}

#[derive(Debug, Default, Serialize)]
pub struct BackendProbe {
    pub status: &'static str,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "statusCode", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(rename = "statusText", skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecStatus {
    pub status: &'static str,
    pub message: &'static str,
    pub backend: BackendProbe,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub languages: Option<Value>,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub message: &'static str,
    pub backend: BackendProbe,
    pub timestamp: String,
}
