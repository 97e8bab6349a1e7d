use serde::{ Serialize, Deserialize };
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingMode {
    Light,
    Standard,
    Extended,
    Heavy,
}

impl ThinkingMode {
    /// Token budget handed to the model; `None` lets the model decide.
    pub fn budget(&self) -> Option<i32> {
        match self {
            ThinkingMode::Light => Some(512),
            ThinkingMode::Standard => None,
            ThinkingMode::Extended => Some(8192),
            ThinkingMode::Heavy => Some(24576),
        }
    }
}

impl FromStr for ThinkingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "light" => Ok(ThinkingMode::Light),
            "standard" => Ok(ThinkingMode::Standard),
            "extended" => Ok(ThinkingMode::Extended),
            "heavy" => Ok(ThinkingMode::Heavy),
            _ => Err(format!("Unsupported thinking mode: {}", s)),
        }
    }
}

/// User preferences that shape each model request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatSettings {
    pub temperature: f32,
    pub personality: String,
    pub thinking_mode: ThinkingMode,
    pub save_history: bool,
    pub web_search: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            personality: "professional".to_string(),
            thinking_mode: ThinkingMode::Standard,
            save_history: true,
            web_search: true,
        }
    }
}
