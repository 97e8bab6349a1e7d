pub mod chat;
pub mod image;
pub mod sse;
use serde::{ Deserialize, Serialize };
use std::str::FromStr;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_IMAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Model strength selected by the user. Each tier keeps its own history; `Pro`
/// is rate limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Standard,
    Pro,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Standard, Tier::Pro];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Standard => "standard",
            Tier::Pro => "pro",
        }
    }

    pub fn is_elevated(&self) -> bool {
        matches!(self, Tier::Pro)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseTierError {
    message: String,
}

impl fmt::Display for ParseTierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseTierError {}

impl FromStr for Tier {
    type Err = ParseTierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" => Ok(Tier::Standard),
            "pro" => Ok(Tier::Pro),
            _ =>
                Err(ParseTierError {
                    message: format!("Invalid tier: '{}'", s),
                }),
        }
    }
}

/// Failures of the upstream model calls. `InvalidCredential` is kept apart
/// from transport failures because it changes application state.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("the configured API key was rejected by the upstream")]
    InvalidCredential,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },
    #[error("failed to decode upstream payload: {0}")]
    Decode(String),
    #[error("stream error: {0}")]
    Stream(String),
}

impl LlmError {
    pub fn is_invalid_credential(&self) -> bool {
        matches!(self, LlmError::InvalidCredential)
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub standard_model: String,
    pub pro_model: String,
    pub image_model: String,
    pub base_url: String,
    /// Upper bound on one image generation call.
    pub image_timeout: Duration,
}

impl LlmConfig {
    pub fn model_for(&self, tier: Tier) -> &str {
        match tier {
            Tier::Standard => &self.standard_model,
            Tier::Pro => &self.pro_model,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            standard_model: "gemini-2.5-flash".to_string(),
            pro_model: "gemini-2.5-pro".to_string(),
            image_model: "imagen-3.0-generate-002".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            image_timeout: DEFAULT_IMAGE_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parses_case_insensitively() {
        assert_eq!("PRO".parse::<Tier>().unwrap(), Tier::Pro);
        assert_eq!(" standard ".parse::<Tier>().unwrap(), Tier::Standard);
        assert!("ultra".parse::<Tier>().is_err());
        assert_eq!(Tier::Pro.to_string(), "pro");
    }

    #[test]
    fn model_selection_follows_tier() {
        let config = LlmConfig::default();
        assert_eq!(config.model_for(Tier::Pro), "gemini-2.5-pro");
        assert_eq!(config.model_for(Tier::Standard), "gemini-2.5-flash");
    }
}
