use async_trait::async_trait;
use serde::{ Deserialize, Serialize };
use log::info;

use super::{ ChatClient, ChatChunk, ChatRequest, ChunkStream, Turn, http_stream_generate };
use crate::llm::{ LlmConfig, LlmError, Tier };
use crate::models::chat::{ GroundingChunk, Part };

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamRequest {
    contents: Vec<Turn>,
    system_instruction: GeminiInstruction,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
}

#[derive(Serialize)]
struct GeminiInstruction {
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: i32,
}

#[derive(Deserialize)]
struct GoogleChunk {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    error: Option<GoogleError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleCandidate {
    content: Option<GoogleContent>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Deserialize)]
struct GoogleContent {
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Deserialize)]
struct GooglePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Deserialize)]
struct GoogleError {
    code: Option<u16>,
    message: Option<String>,
    status: Option<String>,
}

/// Decodes one SSE `data` payload of `streamGenerateContent`.
pub(crate) fn parse_gemini_event(data: &str) -> Result<Option<ChatChunk>, LlmError> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }

    let chunk: GoogleChunk = serde_json
        ::from_str(data)
        .map_err(|e| LlmError::Decode(e.to_string()))?;

    if let Some(err) = chunk.error {
        let message = err.message.unwrap_or_default();
        let status = err.status.unwrap_or_default();
        return Err(
            super::classify_status(err.code.unwrap_or(500), &format!("{} {}", status, message))
        );
    }

    let Some(candidate) = chunk.candidates.into_iter().next() else {
        return Ok(None);
    };

    let text = candidate.content
        .map(|c| {
            c.parts
                .into_iter()
                .filter(|p| !p.thought)
                .filter_map(|p| p.text)
                .collect::<String>()
        })
        .unwrap_or_default();
    let grounding_chunks = candidate.grounding_metadata
        .map(|m| m.grounding_chunks)
        .unwrap_or_default();

    Ok(Some(ChatChunk { text, grounding_chunks }))
}

pub struct GeminiChatClient {
    http: reqwest::Client,
    api_key: String,
    config: LlmConfig,
}

impl GeminiChatClient {
    pub fn new(api_key: String, config: LlmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            config,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(LlmError::InvalidCredential)?;
        Ok(Self::new(api_key, config.clone()))
    }

    fn build_payload(&self, request: ChatRequest) -> GeminiStreamRequest {
        let mut contents = request.history;
        contents.push(Turn {
            role: crate::models::chat::Role::User,
            parts: request.user_parts,
        });

        let tools = if request.settings.web_search {
            vec![serde_json::json!({ "googleSearch": {} })]
        } else {
            Vec::new()
        };

        GeminiStreamRequest {
            contents,
            system_instruction: GeminiInstruction {
                parts: vec![Part::text(request.system_instruction)],
            },
            generation_config: GenerationConfig {
                temperature: request.settings.temperature,
                thinking_config: request.settings.thinking_mode
                    .budget()
                    .map(|thinking_budget| ThinkingConfig { thinking_budget }),
            },
            tools,
        }
    }
}

#[async_trait]
impl ChatClient for GeminiChatClient {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, LlmError> {
        let model = self.get_model(request.tier);
        info!(
            "GeminiChatClient::stream_chat() → model={} tier={} history_turns={}",
            model,
            request.tier,
            request.history.len()
        );

        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.config.base_url.trim_end_matches('/'),
            model
        );
        let headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("x-goog-api-key".to_string(), self.api_key.clone())
        ];

        let payload = self.build_payload(request);
        http_stream_generate(&self.http, url, payload, parse_gemini_event, Some(headers)).await
    }

    fn get_model(&self, tier: Tier) -> String {
        self.config.model_for(tier).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::settings::{ ChatSettings, ThinkingMode };

    #[test]
    fn parses_text_and_citations() {
        let data = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"},{"text":"lo"}]},"groundingMetadata":{"groundingChunks":[{"web":{"uri":"https://a.example","title":"A"}}]}}]}"#;
        let chunk = parse_gemini_event(data).unwrap().unwrap();
        assert_eq!(chunk.text, "Hello");
        assert_eq!(chunk.grounding_chunks.len(), 1);
        assert_eq!(
            chunk.grounding_chunks[0].web.as_ref().and_then(|w| w.title.as_deref()),
            Some("A")
        );
    }

    #[test]
    fn skips_thought_parts_and_empty_events() {
        let data = r#"{"candidates":[{"content":{"parts":[{"text":"plan","thought":true},{"text":"answer"}]}}]}"#;
        assert_eq!(parse_gemini_event(data).unwrap().unwrap().text, "answer");
        assert!(parse_gemini_event("").unwrap().is_none());
        assert!(parse_gemini_event(r#"{"candidates":[]}"#).unwrap().is_none());
    }

    #[test]
    fn inline_error_with_bad_key_is_credential_error() {
        let data = r#"{"error":{"code":400,"message":"API key expired. Please renew the API key.","status":"INVALID_ARGUMENT"}}"#;
        assert!(parse_gemini_event(data).unwrap_err().is_invalid_credential());
        assert!(matches!(parse_gemini_event("{oops"), Err(LlmError::Decode(_))));
    }

    #[test]
    fn payload_appends_user_turn_and_settings() {
        let client = GeminiChatClient::new("k".into(), LlmConfig::default());
        let settings = ChatSettings {
            thinking_mode: ThinkingMode::Extended,
            web_search: false,
            ..ChatSettings::default()
        };
        let payload = client.build_payload(ChatRequest {
            tier: Tier::Standard,
            history: vec![Turn { role: crate::models::chat::Role::Model, parts: vec![Part::text("earlier")] }],
            user_parts: vec![Part::text("now")],
            system_instruction: "be brief".into(),
            settings,
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["contents"][1]["role"], "user");
        assert_eq!(json["contents"][1]["parts"][0]["text"], "now");
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(json["generationConfig"]["thinkingConfig"]["thinkingBudget"], 8192);
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn missing_key_is_rejected_up_front() {
        let config = LlmConfig { api_key: Some("  ".into()), ..LlmConfig::default() };
        assert!(matches!(GeminiChatClient::from_config(&config), Err(LlmError::InvalidCredential)));
    }
}
