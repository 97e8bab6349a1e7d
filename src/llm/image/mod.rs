pub mod gemini;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::sync::Arc;

use super::{ LlmConfig, LlmError };
use self::gemini::GeminiImageClient;
use crate::models::chat::InlineData;

pub const DEFAULT_IMAGE_MIME: &str = "image/jpeg";

#[async_trait]
pub trait ImageClient: Send + Sync {
    /// Generates one image and returns it as a `data:` URL.
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ImageClient>, LlmError> {
    let client = GeminiImageClient::from_config(config)?;
    Ok(Arc::new(client))
}

/// Splits `data:<mime>;base64,<payload>` into an inline attachment. The mime
/// type falls back to `fallback_mime` when the header carries none; the payload
/// must be valid base64.
pub fn decode_data_url(url: &str, fallback_mime: &str) -> Result<InlineData, LlmError> {
    let (header, data) = url
        .split_once(',')
        .ok_or_else(|| LlmError::Decode("data url has no payload separator".into()))?;

    let mime_type = header
        .strip_prefix("data:")
        .and_then(|rest| rest.split(';').next())
        .filter(|m| !m.is_empty())
        .unwrap_or(fallback_mime)
        .to_string();

    let data = data.trim();
    if data.is_empty() {
        return Err(LlmError::Decode("data url payload is empty".into()));
    }
    STANDARD.decode(data).map_err(|e| LlmError::Decode(format!("invalid base64 payload: {}", e)))?;

    Ok(InlineData {
        mime_type,
        data: data.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_header_and_payload() {
        let inline = decode_data_url("data:image/png;base64,iVBORw0KGgo=", DEFAULT_IMAGE_MIME).unwrap();
        assert_eq!(inline.mime_type, "image/png");
        assert_eq!(inline.data, "iVBORw0KGgo=");
    }

    #[test]
    fn falls_back_to_default_mime() {
        let inline = decode_data_url("data:;base64,AAAA", DEFAULT_IMAGE_MIME).unwrap();
        assert_eq!(inline.mime_type, "image/jpeg");
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(decode_data_url("not a data url", DEFAULT_IMAGE_MIME).is_err());
        assert!(decode_data_url("data:image/png;base64,", DEFAULT_IMAGE_MIME).is_err());
        assert!(decode_data_url("data:image/png;base64,@@@", DEFAULT_IMAGE_MIME).is_err());
    }
}
