//! Capability-typed backend traits and the shared chat message types.
//!
//! Each generative capability is its own trait so the executor can hold a
//! primary and a fallback handle per capability, and tests can count calls
//! on one capability without stubbing the others.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single role-tagged chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Where a generated image can be read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Hosted by the provider; must be downloaded.
    Url(String),
    /// Returned inline.
    Bytes(Vec<u8>),
}

/// Output of an image generation call.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub source: ImageSource,
    /// Prompt as rewritten by the provider, when it reports one.
    pub revised_prompt: Option<String>,
}

/// A started video generation job.
#[derive(Debug, Clone)]
pub struct VideoJob {
    /// Provider operation name, used to poll for completion.
    pub operation: String,
}

/// Text generation.
#[async_trait]
pub trait TextBackend: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate_text(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;
}

/// Image generation.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate_image(&self, prompt: &str) -> Result<GeneratedImage, LlmError>;
}

/// Image analysis (multimodal prompt + image).
#[async_trait]
pub trait VisionBackend: Send + Sync {
    fn model_name(&self) -> &str;

    async fn analyze_image(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, LlmError>;
}

/// Video generation.
#[async_trait]
pub trait VideoBackend: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate_video(&self, prompt: &str) -> Result<VideoJob, LlmError>;
}
