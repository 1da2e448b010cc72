//! Error types for the Slack AI bot.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Markers that backends use when a capability is gated or not offered.
const FEATURE_UNAVAILABLE_MARKERS: &[&str] = &[
    "not enabled",
    "not supported",
    "unsupported",
    "allowlist",
    "permission",
    "403",
];

/// Backend (generative-AI provider) errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} does not offer {capability}: {reason}")]
    FeatureUnavailable {
        provider: String,
        capability: String,
        reason: String,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether the error means the capability itself is gated or unsupported.
    ///
    /// Matches the typed variant and, for errors that crossed a provider
    /// boundary as plain text, the known permission/allowlist markers.
    pub fn is_feature_unavailable(&self) -> bool {
        match self {
            Self::FeatureUnavailable { .. } => true,
            Self::RequestFailed { reason, .. } | Self::InvalidResponse { reason, .. } => {
                let lower = reason.to_lowercase();
                FEATURE_UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m))
            }
            _ => false,
        }
    }

    /// Whether retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestFailed { .. } | Self::RateLimited { .. } => {
                !self.is_feature_unavailable()
            }
            Self::InvalidResponse { .. }
            | Self::FeatureUnavailable { .. }
            | Self::AuthFailed { .. }
            | Self::Json(_) => false,
        }
    }
}

/// Chat platform errors (response sink, context loading, downloads).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to post message on {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Failed to update message {message_id} on {name}: {reason}")]
    UpdateFailed {
        name: String,
        message_id: String,
        reason: String,
    },

    #[error("Failed to upload {filename} on {name}: {reason}")]
    UploadFailed {
        name: String,
        filename: String,
        reason: String,
    },

    #[error("{method} returned error: {error}")]
    Api { method: String, error: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Validation errors for a structured intent response.
#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Intent has no tasks")]
    EmptyTasks,

    #[error("Duplicate task id: {0}")]
    DuplicateTaskId(String),

    #[error("Task {task} depends on unknown task {dependency}")]
    DanglingDependency { task: String, dependency: String },

    #[error("Unknown task kind: {0}")]
    UnknownTaskKind(String),
}

/// Per-task execution errors.
///
/// These never abort a run; the orchestrator turns them into an inline
/// error message for the one task that failed.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Task {task_id}: backend failed: {source}")]
    Backend {
        task_id: String,
        #[source]
        source: LlmError,
    },

    #[error("Task {task_id}: missing input: {what}")]
    MissingInput { task_id: String, what: String },

    #[error("Task {task_id}: download failed after {attempts} attempts: {reason}")]
    Download {
        task_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("Task {task_id} is not pending")]
    NotPending { task_id: String },
}

/// Idempotency cache errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Backend(String),

    #[error("Cache query failed: {0}")]
    Query(String),
}
