use serde::Deserialize;
use std::fs;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub groq: GroqConfig,
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

/// Primary chat provider (OpenAI-compatible chat completions).
#[derive(Clone, Debug, Deserialize)]
pub struct GroqConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_groq_base_url")]
    pub base_url: String,
    #[serde(default = "default_groq_model")]
    pub model: String,
    #[serde(default = "default_groq_model_heavy")]
    pub model_heavy: String,
}

impl Default for GroqConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_groq_base_url(),
            model: default_groq_model(),
            model_heavy: default_groq_model_heavy(),
        }
    }
}

/// Secondary chat provider, reached through the backend broker first and
/// directly as a fallback when a local credential is configured.
#[derive(Clone, Debug, Deserialize)]
pub struct OpenRouterConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_openrouter_base_url")]
    pub base_url: String,
    #[serde(default = "default_openrouter_model")]
    pub model: String,
    #[serde(default = "default_openrouter_model_heavy")]
    pub model_heavy: String,
    #[serde(default = "default_site_url")]
    pub site_url: String,
    #[serde(default = "default_app_title")]
    pub app_title: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_openrouter_base_url(),
            model: default_openrouter_model(),
            model_heavy: default_openrouter_model_heavy(),
            site_url: default_site_url(),
            app_title: default_app_title(),
        }
    }
}

/// The CodeJoin execution backend. Also brokers OpenRouter chat.
#[derive(Clone, Debug, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_base_url")]
    pub base_url: String,
    #[serde(default = "default_backend_api_key")]
    pub api_key: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_base_url(),
            api_key: default_backend_api_key(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub otlp_grpc: OtlpGrpcConfig,
    #[serde(default)]
    pub exporters: ExportersConfig,
    #[serde(default)]
    pub audit_log: AuditLogConfig,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            logging: LoggingConfig::default(),
            otlp_grpc: OtlpGrpcConfig::default(),
            exporters: ExportersConfig::default(),
            audit_log: AuditLogConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtlpGrpcConfig {
    #[serde(default = "default_otlp_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_otlp_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for OtlpGrpcConfig {
    fn default() -> Self {
        Self {
            endpoint: default_otlp_endpoint(),
            timeout_ms: default_otlp_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExportersConfig {
    #[serde(default = "default_exporter_kind")]
    pub tracing: String,
    #[serde(default = "default_exporter_kind")]
    pub metrics: String,
}

impl Default for ExportersConfig {
    fn default() -> Self {
        Self {
            tracing: default_exporter_kind(),
            metrics: default_exporter_kind(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_stdout")]
    pub stdout: bool,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            stdout: default_log_stdout(),
            file: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AuditLogConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_audit_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: None,
            max_file_bytes: default_audit_max_file_bytes(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let path = std::env::var("CONFIG_PATH")
            .map_err(|_| "CONFIG_PATH is required (strict YAML)".to_string())?;
        let content =
            fs::read_to_string(&path).map_err(|e| format!("CONFIG_PATH read error: {}", e))?;
        let mut config: Config =
            serde_yaml::from_str(&content).map_err(|e| format!("CONFIG_PATH invalid yaml: {}", e))?;
        config.normalize()?;
        Ok(config)
    }

    pub fn groq_chat_url(&self) -> String {
        chat_completions_url(&self.groq.base_url)
    }

    pub fn openrouter_direct_url(&self) -> String {
        chat_completions_url(&self.openrouter.base_url)
    }

    pub fn brokered_chat_url(&self) -> String {
        format!(
            "{}/api/openrouter-ai/chat",
            self.backend.base_url.trim_end_matches('/')
        )
    }

    pub fn brokered_health_url(&self) -> String {
        format!(
            "{}/api/openrouter-ai/health",
            self.backend.base_url.trim_end_matches('/')
        )
    }

    pub fn execute_url(&self) -> String {
        format!("{}/api/execute", self.backend.base_url.trim_end_matches('/'))
    }

    pub fn languages_url(&self) -> String {
        format!(
            "{}/api/languages",
            self.backend.base_url.trim_end_matches('/')
        )
    }

    pub fn backend_health_url(&self) -> String {
        format!("{}/health", self.backend.base_url.trim_end_matches('/'))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.read_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.health_timeout_ms)
    }

    fn normalize(&mut self) -> Result<(), String> {
        self.observability.logging.format = self.observability.logging.format.to_lowercase();
        self.observability.logging.level = self.observability.logging.level.to_lowercase();
        match self.observability.logging.format.as_str() {
            "text" | "json" => {}
            other => return Err(format!("logging.format invalid: {}", other)),
        }
        match self.observability.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(format!("logging.level invalid: {}", other)),
        }
        if self.backend.base_url.trim().is_empty() {
            return Err("backend.base_url is required".to_string());
        }
        Ok(())
    }
}

fn chat_completions_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{}/chat/completions", base)
    } else {
        format!("{}/v1/chat/completions", base)
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_groq_base_url() -> String {
    "https://api.groq.com/openai".to_string()
}

fn default_groq_model() -> String {
    "llama-3.1-8b-instant".to_string()
}

fn default_groq_model_heavy() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_openrouter_base_url() -> String {
    "https://openrouter.ai/api".to_string()
}

fn default_openrouter_model() -> String {
    "qwen/qwen3-235b-a22b:free".to_string()
}

fn default_openrouter_model_heavy() -> String {
    "qwen/qwen3-coder:free".to_string()
}

fn default_site_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_app_title() -> String {
    "CodeJoin".to_string()
}

fn default_backend_base_url() -> String {
    "https://codejoin-backend.onrender.com".to_string()
}

fn default_backend_api_key() -> String {
    "test123".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    60000
}

fn default_health_timeout_ms() -> u64 {
    5000
}

fn default_pool_max_idle_per_host() -> usize {
    64
}

fn default_max_inflight() -> usize {
    512
}

fn default_service_name() -> String {
    "codejoin-gateway".to_string()
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otlp_timeout_ms() -> u64 {
    3000
}

fn default_exporter_kind() -> String {
    "otlp_grpc".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_stdout() -> bool {
    true
}

fn default_audit_max_file_bytes() -> u64 {
    64 * 1024 * 1024
}
