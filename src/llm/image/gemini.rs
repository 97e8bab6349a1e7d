use async_trait::async_trait;
use serde::{ Deserialize, Serialize };
use log::info;

use super::{ ImageClient, DEFAULT_IMAGE_MIME };
use crate::llm::chat::classify_status;
use crate::llm::{ LlmConfig, LlmError };

#[derive(Serialize)]
struct PredictRequest<'a> {
    instances: Vec<PredictInstance<'a>>,
    parameters: PredictParameters,
}

#[derive(Serialize)]
struct PredictInstance<'a> {
    prompt: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictParameters {
    sample_count: u32,
    output_mime_type: &'static str,
}

#[derive(Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: Option<String>,
    mime_type: Option<String>,
}

pub struct GeminiImageClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiImageClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(LlmError::InvalidCredential)?;
        let http = reqwest::Client::builder().timeout(config.image_timeout).build()?;
        Ok(Self {
            http,
            api_key,
            model: config.image_model.clone(),
            base_url: config.base_url.clone(),
        })
    }
}

#[async_trait]
impl ImageClient for GeminiImageClient {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        info!("GeminiImageClient::generate() → model={}", self.model);
        let url = format!("{}/models/{}:predict", self.base_url.trim_end_matches('/'), self.model);
        let payload = PredictRequest {
            instances: vec![PredictInstance { prompt }],
            parameters: PredictParameters {
                sample_count: 1,
                output_mime_type: DEFAULT_IMAGE_MIME,
            },
        };

        let resp = self.http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let body: PredictResponse = resp.json().await?;
        let prediction = body.predictions
            .into_iter()
            .find(|p| p.bytes_base64_encoded.is_some())
            .ok_or_else(|| LlmError::Decode("image generation returned no images".into()))?;
        let mime = prediction.mime_type.unwrap_or_else(|| DEFAULT_IMAGE_MIME.to_string());
        let data = prediction.bytes_base64_encoded.unwrap_or_default();

        Ok(format!("data:{};base64,{}", mime, data))
    }
}
