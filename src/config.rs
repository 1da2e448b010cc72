//! Configuration types.
//!
//! Everything is read from the process environment once at startup.
//! `BotConfig::from_lookup` takes the variable source as a closure so tests
//! can build configs without touching the real environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{GeminiConfig, LlmConfig, OpenAiConfig, RetryPolicy};

/// Appended to a streaming message while output is still arriving.
pub const DEFAULT_BOT_CURSOR: &str = ":robot_face:";

/// Longest accepted dedup token lifetime.
const MAX_IDEMPOTENCY_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Response streaming settings.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Pending characters that trigger an in-place update.
    pub flush_chars: usize,
    /// Longest single Slack message before spilling into a continuation.
    pub max_message_len: usize,
    /// In-progress marker appended while streaming.
    pub cursor: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_chars: 800,
            max_message_len: 3000,
            cursor: DEFAULT_BOT_CURSOR.to_string(),
        }
    }
}

/// Task executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Hangul share at or above which an image prompt is translated first.
    pub script_ratio: f64,
    /// Retry curve for downloading generated assets.
    pub download_retry: RetryPolicy,
    /// Optional system prompt prepended to text generation.
    pub system_message: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            script_ratio: 0.2,
            download_retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(4),
                jitter: 0.1,
            },
            system_message: None,
        }
    }
}

/// Full bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub slack_bot_token: SecretString,
    pub slack_signing_secret: SecretString,
    pub llm: LlmConfig,
    pub stream: StreamConfig,
    pub executor: ExecutorConfig,
    /// Character budget for conversation context sent to the model.
    pub max_context_chars: usize,
    pub idempotency_ttl: Duration,
    /// libSQL file for the dedup cache; in-memory when unset.
    pub idempotency_db_path: Option<PathBuf>,
    pub port: u16,
}

impl BotConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| var(key).ok_or_else(|| ConfigError::MissingEnvVar(key.into()));

        let slack_bot_token = SecretString::from(required("SLACK_BOT_TOKEN")?);
        let slack_signing_secret = SecretString::from(required("SLACK_SIGNING_SECRET")?);

        let mut openai = OpenAiConfig::new(SecretString::from(required("OPENAI_API_KEY")?));
        if let Some(model) = var("OPENAI_MODEL") {
            openai.model = model;
        }
        if let Some(model) = var("IMAGE_MODEL") {
            openai.image_model = model;
        }
        if let Some(quality) = var("IMAGE_QUALITY") {
            openai.image_quality = quality;
        }
        if let Some(size) = var("IMAGE_SIZE") {
            openai.image_size = size;
        }
        if let Some(style) = var("IMAGE_STYLE") {
            openai.image_style = style;
        }
        openai.organization = var("OPENAI_ORGANIZATION");
        openai.temperature = parse_or(&var, "TEMPERATURE", 0.0f32)?;
        if !(0.0..=2.0).contains(&openai.temperature) {
            return Err(ConfigError::InvalidValue {
                key: "TEMPERATURE".into(),
                message: "must be between 0 and 2".into(),
            });
        }

        let gemini = var("GEMINI_API_KEY")
            .or_else(|| var("GOOGLE_API_KEY"))
            .map(|key| {
                let mut gemini = GeminiConfig::new(SecretString::from(key));
                if let Some(model) = var("GEMINI_IMAGE_MODEL") {
                    gemini.image_model = model;
                }
                if let Some(model) = var("GEMINI_VIDEO_MODEL") {
                    gemini.video_model = model;
                }
                gemini
            });

        let stream_defaults = StreamConfig::default();
        let stream = StreamConfig {
            flush_chars: parse_or(&var, "STREAM_FLUSH_CHARS", stream_defaults.flush_chars)?,
            max_message_len: parse_or(&var, "MAX_LEN_SLACK", stream_defaults.max_message_len)?,
            cursor: var("BOT_CURSOR").unwrap_or(stream_defaults.cursor),
        };
        if stream.flush_chars == 0 || stream.max_message_len == 0 {
            return Err(ConfigError::InvalidValue {
                key: "STREAM_FLUSH_CHARS/MAX_LEN_SLACK".into(),
                message: "must be greater than zero".into(),
            });
        }

        let executor_defaults = ExecutorConfig::default();
        let script_ratio = parse_or(&var, "TRANSLATION_SCRIPT_RATIO", executor_defaults.script_ratio)?;
        if !(0.0..=1.0).contains(&script_ratio) {
            return Err(ConfigError::InvalidValue {
                key: "TRANSLATION_SCRIPT_RATIO".into(),
                message: "must be between 0 and 1".into(),
            });
        }
        let executor = ExecutorConfig {
            script_ratio,
            system_message: var("SYSTEM_MESSAGE"),
            ..executor_defaults
        };

        let idempotency_ttl_secs: u64 = parse_or(&var, "IDEMPOTENCY_TTL_SECS", 3600)?;
        if idempotency_ttl_secs > MAX_IDEMPOTENCY_TTL_SECS {
            return Err(ConfigError::InvalidValue {
                key: "IDEMPOTENCY_TTL_SECS".into(),
                message: format!("must be at most {MAX_IDEMPOTENCY_TTL_SECS} seconds (30 days)"),
            });
        }

        Ok(Self {
            slack_bot_token,
            slack_signing_secret,
            llm: LlmConfig {
                openai,
                gemini,
                retry: RetryPolicy::default(),
            },
            stream,
            executor,
            max_context_chars: parse_or(&var, "MAX_LEN_OPENAI", 4000)?,
            idempotency_ttl: Duration::from_secs(idempotency_ttl_secs),
            idempotency_db_path: var("IDEMPOTENCY_DB_PATH").map(PathBuf::from),
            port: parse_or(&var, "PORT", 3000)?,
        })
    }
}

fn parse_or<T>(var: impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}
