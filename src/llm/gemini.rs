//! Gemini client for Imagen image generation and Veo video generation.
//!
//! Both capabilities sit behind an allowlist for most API keys. Gated
//! responses map to `LlmError::FeatureUnavailable` so the executor can
//! switch to DALL-E (images) or explain the limitation (video).

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::info;

use crate::error::LlmError;
use crate::llm::error_from_status;
use crate::llm::provider::{GeneratedImage, ImageBackend, ImageSource, VideoBackend, VideoJob};

const PROVIDER: &str = "gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini client configuration.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: SecretString,
    pub image_model: String,
    pub video_model: String,
    pub aspect_ratio: String,
    pub video_aspect_ratio: String,
    pub video_duration_secs: u32,
    pub base_url: String,
}

impl GeminiConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            image_model: "imagen-3.0-generate-002".to_string(),
            video_model: "veo-2.0-generate-001".to_string(),
            aspect_ratio: "1:1".to_string(),
            video_aspect_ratio: "16:9".to_string(),
            video_duration_secs: 5,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// Gemini REST client.
pub struct GeminiClient {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn call(
        &self,
        model: &str,
        method: &str,
        capability: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!(
            "{}/models/{model}:{method}",
            self.config.base_url.trim_end_matches('/')
        );
        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(error_from_status(PROVIDER, capability, status, None, &body))
    }
}

#[async_trait]
impl ImageBackend for GeminiClient {
    fn model_name(&self) -> &str {
        &self.config.image_model
    }

    async fn generate_image(&self, prompt: &str) -> Result<GeneratedImage, LlmError> {
        info!(model = %self.config.image_model, "Imagen image request");
        let body = serde_json::json!({
            "instances": [{ "prompt": prompt }],
            "parameters": {
                "sampleCount": 1,
                "aspectRatio": self.config.aspect_ratio,
                "personGeneration": "allow_adult",
            },
        });

        let resp = self
            .call(&self.config.image_model, "predict", "image generation", body)
            .await?;
        let parsed: PredictResponse = resp.json().await.map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: e.to_string(),
        })?;

        let encoded = parsed
            .predictions
            .into_iter()
            .find_map(|p| p.bytes_base64_encoded)
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER.into(),
                // Imagen drops filtered images silently.
                reason: "no image returned (possibly filtered)".into(),
            })?;
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER.into(),
                reason: format!("invalid base64 image: {e}"),
            })?;

        Ok(GeneratedImage {
            source: ImageSource::Bytes(bytes),
            revised_prompt: None,
        })
    }
}

#[async_trait]
impl VideoBackend for GeminiClient {
    fn model_name(&self) -> &str {
        &self.config.video_model
    }

    async fn generate_video(&self, prompt: &str) -> Result<VideoJob, LlmError> {
        info!(
            model = %self.config.video_model,
            duration = self.config.video_duration_secs,
            "Veo video request"
        );
        let body = serde_json::json!({
            "instances": [{ "prompt": prompt }],
            "parameters": {
                "aspectRatio": self.config.video_aspect_ratio,
                "durationSeconds": self.config.video_duration_secs,
                "sampleCount": 1,
            },
        });

        let resp = self
            .call(
                &self.config.video_model,
                "predictLongRunning",
                "video generation",
                body,
            )
            .await?;
        let parsed: OperationResponse =
            resp.json().await.map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            })?;

        Ok(VideoJob {
            operation: parsed.name,
        })
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    #[serde(default)]
    bytes_base64_encoded: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationResponse {
    name: String,
}
