//! Generative-AI backends.
//!
//! Supports:
//! - **OpenAI**: text and vision through rig-core, DALL-E images over REST
//! - **Gemini**: Imagen images, Veo video (both allowlist-gated)
//!
//! Every capability is a separate trait object. `create_backends` wires the
//! concrete clients, wraps each in the configured `RetryPolicy`, and returns
//! the handles the orchestrator is constructed with.

pub mod gemini;
pub mod openai;
pub mod provider;
pub mod retry;

pub use gemini::{GeminiClient, GeminiConfig};
pub use openai::{DalleImageBackend, OpenAiClient, OpenAiConfig};
pub use provider::*;
pub use retry::{RetryPolicy, Retrying};

use std::sync::Arc;
use std::time::Duration;

use crate::error::LlmError;

/// Configuration for all backend clients.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub openai: OpenAiConfig,
    /// Enables Imagen as the primary image backend and Veo for video.
    pub gemini: Option<GeminiConfig>,
    pub retry: RetryPolicy,
}

/// Capability handles injected into the executor and classifier.
#[derive(Clone)]
pub struct Backends {
    pub text: Arc<dyn TextBackend>,
    pub image: Arc<dyn ImageBackend>,
    /// Used once per task when `image` reports the feature is unavailable.
    pub image_fallback: Option<Arc<dyn ImageBackend>>,
    pub vision: Arc<dyn VisionBackend>,
    pub video: Option<Arc<dyn VideoBackend>>,
}

/// Build every backend handle from configuration.
pub fn create_backends(config: &LlmConfig) -> Result<Backends, LlmError> {
    let policy = config.retry;
    let openai = Arc::new(OpenAiClient::new(config.openai.clone())?);

    let text: Arc<dyn TextBackend> = openai.clone();
    let vision: Arc<dyn VisionBackend> = openai.clone();
    let dalle: Arc<dyn ImageBackend> = Arc::new(DalleImageBackend::new(openai));

    let text: Arc<dyn TextBackend> = Arc::new(Retrying::new(text, policy));
    let vision: Arc<dyn VisionBackend> = Arc::new(Retrying::new(vision, policy));
    let dalle: Arc<dyn ImageBackend> = Arc::new(Retrying::new(dalle, policy));

    match config.gemini {
        Some(ref gemini_config) => {
            let gemini = Arc::new(GeminiClient::new(gemini_config.clone()));
            let imagen: Arc<dyn ImageBackend> = gemini.clone();
            let veo: Arc<dyn VideoBackend> = gemini;
            tracing::info!(
                primary = %gemini_config.image_model,
                fallback = %dalle.model_name(),
                "Using Imagen with DALL-E fallback"
            );
            Ok(Backends {
                text,
                image: Arc::new(Retrying::new(imagen, policy)),
                image_fallback: Some(dalle),
                vision,
                video: Some(Arc::new(Retrying::new(veo, policy))),
            })
        }
        None => {
            tracing::info!(model = %dalle.model_name(), "Using DALL-E for images");
            Ok(Backends {
                text,
                image: dalle,
                image_fallback: None,
                vision,
                video: None,
            })
        }
    }
}

/// Map a non-success HTTP response to a typed backend error.
pub(crate) fn error_from_status(
    provider: &str,
    capability: &str,
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> LlmError {
    let preview: String = body.chars().take(500).collect();
    let reason = format!("HTTP {}: {preview}", status.as_u16());

    if status == reqwest::StatusCode::UNAUTHORIZED || body.contains("API key not valid") {
        return LlmError::AuthFailed {
            provider: provider.to_string(),
        };
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        };
    }

    let err = LlmError::RequestFailed {
        provider: provider.to_string(),
        reason,
    };
    if status == reqwest::StatusCode::FORBIDDEN || err.is_feature_unavailable() {
        let LlmError::RequestFailed { reason, .. } = err else {
            return err;
        };
        return LlmError::FeatureUnavailable {
            provider: provider.to_string(),
            capability: capability.to_string(),
            reason,
        };
    }
    err
}
