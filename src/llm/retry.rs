//! Retry policy for backend calls.
//!
//! The policy is a plain value: attempt cap, exponential backoff curve and a
//! retryable-error predicate. `Retrying<T>` composes it around any backend
//! handle so call sites never retry on their own.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, GeneratedImage, ImageBackend, TextBackend, VideoBackend, VideoJob, VisionBackend,
};

/// Exponential backoff retry policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Random jitter added to each delay, as a fraction of it (0.0 disables).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    /// 3 attempts, exponential 2s..10s.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits (for tests and latency-sensitive paths).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (0-based), or `None` once the
    /// attempt cap is reached.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt + 1 >= self.max_attempts {
            return None;
        }
        let factor = 1u32 << attempt.min(16);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter > 0.0 && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..self.jitter);
            return Some(delay.mul_f64(1.0 + extra));
        }
        Some(delay)
    }

    /// Run `op`, retrying retryable errors per the policy.
    pub async fn run<T, E, F, Fut>(
        &self,
        op_name: &str,
        is_retryable: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !is_retryable(&e) {
                        return Err(e);
                    }
                    let Some(delay) = self.next_delay(attempt) else {
                        return Err(e);
                    };
                    warn!(
                        op = op_name,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Run a backend call with the standard `LlmError` predicate.
    pub async fn run_llm<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        self.run(op_name, LlmError::is_retryable, op).await
    }
}

/// Backend handle wrapped in a retry policy.
pub struct Retrying<T: ?Sized> {
    inner: Arc<T>,
    policy: RetryPolicy,
}

impl<T: ?Sized> Retrying<T> {
    pub fn new(inner: Arc<T>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl TextBackend for Retrying<dyn TextBackend> {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn generate_text(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        self.policy
            .run_llm("generate_text", || self.inner.generate_text(messages))
            .await
    }
}

#[async_trait]
impl ImageBackend for Retrying<dyn ImageBackend> {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn generate_image(&self, prompt: &str) -> Result<GeneratedImage, LlmError> {
        self.policy
            .run_llm("generate_image", || self.inner.generate_image(prompt))
            .await
    }
}

#[async_trait]
impl VisionBackend for Retrying<dyn VisionBackend> {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn analyze_image(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, LlmError> {
        self.policy
            .run_llm("analyze_image", || {
                self.inner.analyze_image(image, mime_type, prompt)
            })
            .await
    }
}

#[async_trait]
impl VideoBackend for Retrying<dyn VideoBackend> {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn generate_video(&self, prompt: &str) -> Result<VideoJob, LlmError> {
        self.policy
            .run_llm("generate_video", || self.inner.generate_video(prompt))
            .await
    }
}
