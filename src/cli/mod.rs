use clap::Parser;
use std::time::Duration;

use crate::llm::LlmConfig;
use crate::models::settings::{ ChatSettings, ThinkingMode };
use crate::rate_limit::RateLimitPolicy;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Gemini Args ---
    /// API key for the Gemini API. Requests are refused until one is set.
    #[arg(long, env = "GEMINI_API_KEY", default_value = "")]
    pub api_key: String,

    /// Base URL of the Gemini REST API.
    #[arg(long, env = "GEMINI_BASE_URL", default_value = crate::llm::DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Model used for the standard tier.
    #[arg(long, env = "STANDARD_MODEL", default_value = "gemini-2.5-flash")]
    pub standard_model: String,

    /// Model used for the pro tier.
    #[arg(long, env = "PRO_MODEL", default_value = "gemini-2.5-pro")]
    pub pro_model: String,

    /// Model used for <generate_image /> requests.
    #[arg(long, env = "IMAGE_MODEL", default_value = "imagen-3.0-generate-002")]
    pub image_model: String,

    /// Seconds to wait for an image before finishing the answer without it.
    #[arg(long, env = "IMAGE_TIMEOUT_SECS", default_value = "60")]
    pub image_timeout_secs: u64,

    // --- Chat Settings Args ---
    /// Sampling temperature (0.0 - 2.0).
    #[arg(long, env = "CHAT_TEMPERATURE", default_value = "0.7")]
    pub temperature: f32,

    /// Personality substituted into the system instruction.
    #[arg(long, env = "CHAT_PERSONALITY", default_value = "professional")]
    pub personality: String,

    /// Thinking budget (light, standard, extended, heavy).
    #[arg(long, env = "THINKING_MODE", default_value = "standard")]
    pub thinking_mode: ThinkingMode,

    /// Persist chat sessions across restarts.
    #[arg(long, env = "SAVE_HISTORY", default_value = "true", action = clap::ArgAction::Set)]
    pub save_history: bool,

    /// Let the model ground answers with web search.
    #[arg(long, env = "WEB_SEARCH", default_value = "true", action = clap::ArgAction::Set)]
    pub web_search: bool,

    /// Path to the prompt configuration file.
    #[arg(long, env = "PROMPTS_PATH", default_value = "json/prompts.json")]
    pub prompts_path: String,

    // --- Pro Tier Quota Args ---
    /// Pro messages allowed per window.
    #[arg(long, env = "PRO_MESSAGE_LIMIT", default_value = "7")]
    pub pro_message_limit: u32,

    /// Length of the pro quota window in hours.
    #[arg(long, env = "PRO_RESET_HOURS", default_value = "7")]
    pub pro_reset_hours: u64,

    // --- Store Args ---
    /// Persistence backend (file, redis, memory).
    #[arg(long, env = "STORE_TYPE", default_value = "file")]
    pub store_type: String,

    /// Directory for the file store.
    #[arg(long, env = "STORE_PATH", default_value = "data")]
    pub store_path: String,

    /// Redis endpoint for the redis store (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "STORE_HOST", default_value = "redis://127.0.0.1:6379")]
    pub store_host: String,

    /// Prefix for Redis keys.
    #[arg(long, env = "STORE_REDIS_PREFIX", default_value = "nexora:")]
    pub store_redis_prefix: String,

    // --- Server Args ---
    /// Host address and port for the WebSocket server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Port for the HTTP session API. Disabled when unset.
    #[arg(long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Optional API Key required for clients to connect. If set, clients must sign a timestamp with it.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    /// New connections accepted per second across all clients.
    #[arg(long, env = "CONNECTIONS_PER_SECOND", default_value = "10")]
    pub connections_per_second: u32,

    /// Optional path to the TLS certificate file (PEM format). Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format). Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}

impl Args {
    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig {
            api_key: Some(self.api_key.clone()).filter(|k| !k.is_empty()),
            standard_model: self.standard_model.clone(),
            pro_model: self.pro_model.clone(),
            image_model: self.image_model.clone(),
            base_url: self.base_url.clone(),
            image_timeout: Duration::from_secs(self.image_timeout_secs.max(1)),
        }
    }

    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            temperature: self.temperature.clamp(0.0, 2.0),
            personality: self.personality.clone(),
            thinking_mode: self.thinking_mode,
            save_history: self.save_history,
            web_search: self.web_search,
        }
    }

    pub fn rate_limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::new(self.pro_message_limit, self.pro_reset_hours)
    }
}
