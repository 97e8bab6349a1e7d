use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use log::info;

use crate::llm::Tier;
use crate::models::settings::ChatSettings;

#[derive(Debug)]
pub enum PromptError {
    TemplateNotFound(String),
    IoError(std::io::Error),
    JsonError(serde_json::Error),
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::TemplateNotFound(key) => write!(f, "Prompt template '{}' not found", key),
            PromptError::IoError(e) => write!(f, "Prompt file IO error: {}", e),
            PromptError::JsonError(e) => write!(f, "Prompt JSON parsing error: {}", e),
        }
    }
}

impl Error for PromptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PromptError::IoError(e) => Some(e),
            PromptError::JsonError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PromptError {
    fn from(err: std::io::Error) -> Self {
        PromptError::IoError(err)
    }
}

impl From<serde_json::Error> for PromptError {
    fn from(err: serde_json::Error) -> Self {
        PromptError::JsonError(err)
    }
}

/// User-facing strings. Shipped in English; a prompts file can localize them.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Messages {
    pub generic_error: String,
    pub invalid_key_error: String,
    /// `{reset}` is replaced with the end of the current window.
    pub rate_limited: String,
    pub thinking_started: String,
    pub thinking_final: String,
    pub new_session_title: String,
    pub user_label: String,
    pub model_label: String,
    pub attachment_label: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            generic_error: "Sorry, something went wrong while contacting the model.".to_string(),
            invalid_key_error: "The API key you entered is invalid or has expired. Check it in the settings or clear it to fall back to the shared key.".to_string(),
            rate_limited: "You have reached the current Pro usage limit. It resets at {reset}; you can keep chatting with the standard model meanwhile.".to_string(),
            thinking_started: "Starting to think...".to_string(),
            thinking_final: "Composing the final answer...".to_string(),
            new_session_title: "New chat".to_string(),
            user_label: "You".to_string(),
            model_label: "Nexora".to_string(),
            attachment_label: "[attached file]".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PromptConfig {
    /// Base instruction per tier, keyed by tier name. `{personality}` is
    /// substituted.
    pub system_templates: HashMap<String, String>,
    pub specialist_template: String,
    pub memory_template: String,
    pub recent_template: String,
    pub messages: Messages,
    #[serde(skip)]
    pub last_loaded: Option<SystemTime>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        let mut system_templates = HashMap::new();
        system_templates.insert(
            "standard".to_string(),
            "You are Nexora, a helpful assistant with a {personality} personality.".to_string()
        );
        system_templates.insert(
            "pro".to_string(),
            "You are Nexora Pro, a careful assistant with a {personality} personality. Announce each reasoning stage with <thinking step=\"...\" /> before answering.".to_string()
        );
        Self {
            system_templates,
            specialist_template: "Answer as an expert in: {subject}.".to_string(),
            memory_template: "Facts you remember about the user:\n{memory}".to_string(),
            recent_template: "Recent conversation:\n{recent}".to_string(),
            messages: Messages::default(),
            last_loaded: None,
        }
    }
}

/// Inputs of one system instruction.
pub struct InstructionContext<'a> {
    pub tier: Tier,
    pub specialist_mode: Option<&'a str>,
    pub memory_digest: &'a str,
    pub recent_digest: &'a str,
    pub settings: &'a ChatSettings,
}

impl PromptConfig {
    pub fn validate(&self) -> Result<(), PromptError> {
        for tier in Tier::ALL {
            if !self.system_templates.contains_key(tier.as_str()) {
                return Err(PromptError::TemplateNotFound(format!("system_templates:{}", tier)));
            }
        }
        Ok(())
    }

    pub fn system_instruction(&self, ctx: &InstructionContext<'_>) -> Result<String, PromptError> {
        let base = self.system_templates
            .get(ctx.tier.as_str())
            .ok_or_else(|| PromptError::TemplateNotFound(format!("system_templates:{}", ctx.tier)))?;

        let mut sections = vec![base.replace("{personality}", &ctx.settings.personality)];
        if let Some(subject) = ctx.specialist_mode {
            sections.push(self.specialist_template.replace("{subject}", subject));
        }
        if !ctx.memory_digest.is_empty() {
            sections.push(self.memory_template.replace("{memory}", ctx.memory_digest));
        }
        if !ctx.recent_digest.is_empty() {
            sections.push(self.recent_template.replace("{recent}", ctx.recent_digest));
        }
        Ok(sections.join("\n\n"))
    }
}

pub fn load_prompts(path: &str) -> Result<Arc<PromptConfig>, PromptError> {
    let file_content = fs::read_to_string(path)?;
    let mut config: PromptConfig = serde_json::from_str(&file_content)?;
    config.validate()?;
    config.last_loaded = Some(SystemTime::now());
    Ok(Arc::new(config))
}

/// Loads the prompts file, falling back to the built-in defaults when the
/// file does not exist.
pub fn load_prompts_or_default(path: &str) -> Result<Arc<PromptConfig>, PromptError> {
    if Path::new(path).exists() {
        info!("Loading prompts from {}", path);
        load_prompts(path)
    } else {
        info!("Prompts file {} not found, using built-in prompts", path);
        Ok(Arc::new(PromptConfig::default()))
    }
}

pub fn reload_prompts_if_changed<P: AsRef<Path>>(
    path: P,
    current_config: &Arc<PromptConfig>
) -> Result<Option<Arc<PromptConfig>>, PromptError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let modified = fs::metadata(path)?.modified()?;
    let stale = match current_config.last_loaded {
        Some(last_loaded) => modified > last_loaded,
        None => true,
    };
    if !stale {
        return Ok(None);
    }
    info!("Prompts file changed, reloading...");
    load_prompts(&path.to_string_lossy()).map(Some)
}
