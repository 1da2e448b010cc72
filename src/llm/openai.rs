//! OpenAI client: text and vision through rig-core's completion model,
//! DALL-E image generation over plain REST.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rig::agent::AgentBuilder;
use rig::client::CompletionClient;
use rig::completion::{Prompt, PromptError};
use rig::message::{AssistantContent, ImageMediaType, Message, MimeType, UserContent};
use rig::one_or_many::OneOrMany;
use rig::providers::openai;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::LlmError;
use crate::llm::error_from_status;
use crate::llm::provider::{
    ChatMessage, GeneratedImage, ImageBackend, ImageSource, Role, TextBackend, VisionBackend,
};

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI client configuration.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: SecretString,
    /// Text and vision model.
    pub model: String,
    pub image_model: String,
    pub image_quality: String,
    pub image_size: String,
    pub image_style: String,
    pub temperature: f32,
    /// Optional organization header on image requests.
    pub organization: Option<String>,
    /// REST base for image generation.
    pub base_url: String,
}

impl OpenAiConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            model: "gpt-4o".to_string(),
            image_model: "dall-e-3".to_string(),
            image_quality: "hd".to_string(),
            image_size: "1024x1024".to_string(),
            image_style: "vivid".to_string(),
            temperature: 0.0,
            organization: None,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// OpenAI client. One instance serves text, vision and images.
pub struct OpenAiClient {
    config: OpenAiConfig,
    rig: rig::client::Client<openai::client::OpenAIResponsesExt>,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        let rig = openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;
        Ok(Self {
            config,
            rig,
            client: reqwest::Client::new(),
        })
    }

    /// Configured DALL-E model.
    pub fn image_model(&self) -> &str {
        &self.config.image_model
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(self.url(path))
            .bearer_auth(self.config.api_key.expose_secret());
        if let Some(ref org) = self.config.organization {
            req = req.header("OpenAI-Organization", org);
        }
        req
    }

    async fn send(
        &self,
        path: &str,
        capability: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, LlmError> {
        let resp = self
            .request(path)
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
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(std::time::Duration::from_secs);
        let body = resp.text().await.unwrap_or_default();
        Err(error_from_status(PROVIDER, capability, status, retry_after, &body))
    }

    /// Run one completion turn against the configured model.
    async fn complete(&self, conversation: RigConversation) -> Result<String, LlmError> {
        let RigConversation {
            preamble,
            mut history,
            prompt,
        } = conversation;

        let model = self.rig.completion_model(&self.config.model);
        let mut builder = AgentBuilder::new(model).temperature(f64::from(self.config.temperature));
        if let Some(ref preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        let agent = builder.build();

        let reply = agent
            .prompt(prompt)
            .with_history(&mut history)
            .await
            .map_err(prompt_error)?;
        debug!(chars = reply.chars().count(), "OpenAI completion received");
        Ok(reply)
    }
}

#[async_trait]
impl TextBackend for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn generate_text(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        info!(
            model = %self.config.model,
            messages = messages.len(),
            "OpenAI chat request"
        );
        let conversation =
            RigConversation::from_messages(messages).ok_or_else(|| LlmError::RequestFailed {
                provider: PROVIDER.into(),
                reason: "conversation has no user or assistant message".into(),
            })?;
        self.complete(conversation).await
    }
}

#[async_trait]
impl VisionBackend for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn analyze_image(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, LlmError> {
        info!(
            model = %self.config.model,
            image_bytes = image.len(),
            mime_type,
            "OpenAI vision request"
        );
        let prompt = vision_message(image, mime_type, prompt)?;
        self.complete(RigConversation {
            preamble: None,
            history: Vec::new(),
            prompt,
        })
        .await
    }
}

/// A chat transcript split the way rig's agent consumes it.
#[derive(Debug)]
struct RigConversation {
    /// System messages joined in order.
    preamble: Option<String>,
    history: Vec<Message>,
    /// Last non-system message.
    prompt: Message,
}

impl RigConversation {
    /// `None` when the transcript holds nothing but system messages.
    fn from_messages(messages: &[ChatMessage]) -> Option<Self> {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let preamble = (!system.is_empty()).then(|| system.join("\n\n"));

        let mut history: Vec<Message> = messages
            .iter()
            .filter_map(|m| match m.role {
                Role::System => None,
                Role::User => Some(Message::User {
                    content: OneOrMany::one(UserContent::text(m.content.clone())),
                }),
                Role::Assistant => Some(Message::Assistant {
                    id: None,
                    content: OneOrMany::one(AssistantContent::text(m.content.clone())),
                }),
            })
            .collect();
        let prompt = history.pop()?;

        Some(Self {
            preamble,
            history,
            prompt,
        })
    }
}

/// A user message carrying the prompt text followed by the inline image.
fn vision_message(image: &[u8], mime_type: &str, prompt: &str) -> Result<Message, LlmError> {
    let media_type = ImageMediaType::from_mime_type(mime_type);
    let content = OneOrMany::many(vec![
        UserContent::text(prompt),
        UserContent::image_base64(BASE64.encode(image), media_type, None),
    ])
    .map_err(|e| LlmError::RequestFailed {
        provider: PROVIDER.into(),
        reason: format!("invalid vision message: {e}"),
    })?;
    Ok(Message::User { content })
}

/// Classify a rig prompt failure into the typed error the retry layer reads.
fn prompt_error(err: PromptError) -> LlmError {
    let reason = err.to_string();
    let lower = reason.to_lowercase();
    if lower.contains("401") || lower.contains("invalid_api_key") || lower.contains("incorrect api key") {
        LlmError::AuthFailed {
            provider: PROVIDER.into(),
        }
    } else if lower.contains("429") || lower.contains("rate limit") {
        LlmError::RateLimited {
            provider: PROVIDER.into(),
            retry_after: None,
        }
    } else {
        LlmError::RequestFailed {
            provider: PROVIDER.into(),
            reason,
        }
    }
}

/// DALL-E image capability over the same client.
pub struct DalleImageBackend {
    client: std::sync::Arc<OpenAiClient>,
}

impl DalleImageBackend {
    pub fn new(client: std::sync::Arc<OpenAiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageBackend for DalleImageBackend {
    fn model_name(&self) -> &str {
        self.client.image_model()
    }

    async fn generate_image(&self, prompt: &str) -> Result<GeneratedImage, LlmError> {
        let config = &self.client.config;
        info!(
            model = %config.image_model,
            prompt = %truncate(prompt, 100),
            size = %config.image_size,
            quality = %config.image_quality,
            "DALL-E image request"
        );

        let mut body = serde_json::json!({
            "model": config.image_model,
            "prompt": prompt,
            "n": 1,
            "size": config.image_size,
            "quality": config.image_quality,
        });
        // Only dall-e-3 accepts a style.
        if config.image_model == "dall-e-3" {
            body["style"] = serde_json::Value::String(config.image_style.clone());
        }

        let resp = self
            .client
            .send("images/generations", "image generation", body)
            .await?;
        let parsed: ImageGenerationResponse =
            resp.json().await.map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            })?;

        let image = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER.into(),
                reason: "image response has no data".into(),
            })?;

        let source = match (image.url, image.b64_json) {
            (Some(url), _) => ImageSource::Url(url),
            (None, Some(b64)) => {
                ImageSource::Bytes(BASE64.decode(b64).map_err(|e| LlmError::InvalidResponse {
                    provider: PROVIDER.into(),
                    reason: format!("invalid base64 image: {e}"),
                })?)
            }
            (None, None) => {
                return Err(LlmError::InvalidResponse {
                    provider: PROVIDER.into(),
                    reason: "image has neither url nor data".into(),
                });
            }
        };

        Ok(GeneratedImage {
            source,
            revised_prompt: image.revised_prompt,
        })
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        let head: String = s.chars().take(max_chars).collect();
        format!("{head}...")
    } else {
        s.to_string()
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ImageGenerationResponse {
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    revised_prompt: Option<String>,
}
