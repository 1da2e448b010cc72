//! Runs one scheduled task against the backends.
//!
//! Dispatch is an exhaustive match on `TaskKind`. The executor never retries
//! a backend itself (retry lives in `llm::Retrying`); it only re-dispatches
//! an image request to the secondary backend once when the primary reports
//! the capability is unavailable.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::channels::AssetFetcher;
use crate::config::ExecutorConfig;
use crate::context::AttachmentData;
use crate::error::{ChannelError, ExecutionError, LlmError};
use crate::llm::{Backends, ChatMessage, GeneratedImage, ImageBackend, ImageSource};
use crate::pipeline::types::{ImageArtifact, ScheduledTask, TaskContent, TaskKind, TaskResult};

/// Instruction used when an image arrives without a question.
const DESCRIBE_IMAGE_PROMPT: &str = "Describe the image in great detail as if viewing a photo.";

const TRANSLATE_SYSTEM_PROMPT: &str = "You turn user requests written in any language into a \
     concise English prompt for an image or video generation model. Keep every concrete detail \
     (subject, style, colours, composition). Reply with the prompt only, under 1000 characters.";

const SUMMARY_SYSTEM_PROMPT: &str = "당신은 슬랙 스레드를 정리하는 비서입니다. 다음 구조로 \
     요약하세요: 1) 주요 주제 2) 결정 사항과 결론 3) 참여자별 의견. 전체 5문단 이내로, \
     사용자가 쓴 언어로 작성하세요.";

const NOTHING_TO_SUMMARIZE: &str =
    "📭 요약할 스레드 메시지가 없습니다. 요약이 필요한 스레드 안에서 다시 요청해 주세요.";

const VIDEO_UNAVAILABLE: &str = "🎬 영상 생성 기능은 현재 이 계정에서 사용할 수 없습니다. \
     대신 같은 내용을 이미지로 그려 드릴 수 있어요. \"~ 그려줘\"라고 요청해 보세요.";

/// Model name recorded for results produced without a backend call.
const NO_MODEL: &str = "none";

/// Executes scheduled tasks.
pub struct TaskExecutor {
    backends: Backends,
    fetcher: Arc<dyn AssetFetcher>,
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(backends: Backends, fetcher: Arc<dyn AssetFetcher>, config: ExecutorConfig) -> Self {
        Self {
            backends,
            fetcher,
            config,
        }
    }

    /// Run one task to completion and record its terminal status.
    pub async fn execute(&self, task: &mut ScheduledTask) -> Result<TaskResult, ExecutionError> {
        if !task.start() {
            return Err(ExecutionError::NotPending {
                task_id: task.id().to_string(),
            });
        }

        let started = Instant::now();
        info!(
            task_id = %task.id(),
            kind = task.kind().label(),
            order = task.order,
            "Executing task"
        );

        let result = match task.kind() {
            TaskKind::TextGeneration => self.text_generation(task).await,
            TaskKind::ImageGeneration => self.image_generation(task).await,
            TaskKind::ImageAnalysis => self.image_analysis(task).await,
            TaskKind::ThreadSummary => self.thread_summary(task).await,
            TaskKind::VideoGeneration => self.video_generation(task).await,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(ref r) => {
                task.complete();
                info!(
                    task_id = %task.id(),
                    result = ?r.kind(),
                    model = %r.model_used,
                    elapsed_ms,
                    "Task completed"
                );
            }
            Err(ref e) => {
                task.fail();
                warn!(task_id = %task.id(), error = %e, elapsed_ms, "Task failed");
            }
        }
        result
    }

    // ── text_generation ─────────────────────────────────────────────

    async fn text_generation(&self, task: &ScheduledTask) -> Result<TaskResult, ExecutionError> {
        let mut messages = Vec::with_capacity(task.turns.len() + 2);
        if let Some(ref system) = self.config.system_message {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.extend(task.turns.iter().map(|t| t.to_chat_message()));
        messages.push(ChatMessage::user(task.input()));

        let content = self
            .backends
            .text
            .generate_text(&messages)
            .await
            .map_err(|e| backend_error(task, e))?;

        Ok(TaskResult::text(content, self.backends.text.model_name()))
    }

    // ── image_generation ────────────────────────────────────────────

    async fn image_generation(&self, task: &ScheduledTask) -> Result<TaskResult, ExecutionError> {
        let prompt = self.generation_prompt(task).await;
        let primary = &self.backends.image;

        let (generated, model) = match primary.generate_image(&prompt).await {
            Ok(image) => (image, primary.model_name().to_string()),
            Err(e) if e.is_feature_unavailable() => {
                let Some(ref fallback) = self.backends.image_fallback else {
                    warn!(task_id = %task.id(), error = %e, "Image backend unavailable, no fallback configured");
                    return Ok(image_failure(e, primary.as_ref()));
                };
                warn!(
                    task_id = %task.id(),
                    primary = primary.model_name(),
                    fallback = fallback.model_name(),
                    error = %e,
                    "Image backend unavailable, switching to fallback"
                );
                match fallback.generate_image(&prompt).await {
                    Ok(image) => (image, fallback.model_name().to_string()),
                    Err(e) => return Ok(image_failure(e, fallback.as_ref())),
                }
            }
            Err(e) => return Ok(image_failure(e, primary.as_ref())),
        };

        let GeneratedImage {
            source,
            revised_prompt,
        } = generated;
        let (bytes, filename) = match source {
            ImageSource::Bytes(bytes) => (bytes, image_filename(task.id(), None)),
            ImageSource::Url(url) => {
                let bytes = self.download(task, &url).await?;
                (bytes, image_filename(task.id(), Some(&url)))
            }
        };

        debug!(task_id = %task.id(), bytes = bytes.len(), filename = %filename, "Image ready");
        Ok(TaskResult {
            content: TaskContent::Image(ImageArtifact {
                bytes,
                filename,
                caption: Some(revised_prompt.unwrap_or(prompt)),
            }),
            model_used: model,
        })
    }

    /// The task input, translated to English first when it is mostly Hangul.
    ///
    /// A failed translation keeps the original input.
    async fn generation_prompt(&self, task: &ScheduledTask) -> String {
        let input = task.input().to_string();
        let ratio = hangul_ratio(&input);
        if ratio < self.config.script_ratio {
            return input;
        }

        debug!(task_id = %task.id(), ratio, "Translating generation prompt");
        let messages = [
            ChatMessage::system(TRANSLATE_SYSTEM_PROMPT),
            ChatMessage::user(input.clone()),
        ];
        match self.backends.text.generate_text(&messages).await {
            Ok(translated) => {
                let cleaned = translated.trim().trim_matches('"').trim().to_string();
                if cleaned.is_empty() { input } else { cleaned }
            }
            Err(e) => {
                warn!(task_id = %task.id(), error = %e, "Prompt translation failed, using original input");
                input
            }
        }
    }

    /// Fetch an asset with the configured bounded backoff.
    async fn download(&self, task: &ScheduledTask, url: &str) -> Result<Vec<u8>, ExecutionError> {
        let policy = self.config.download_retry;
        policy
            .run("download_asset", |_: &ChannelError| true, || self.fetcher.fetch(url))
            .await
            .map_err(|e| ExecutionError::Download {
                task_id: task.id().to_string(),
                attempts: policy.max_attempts,
                reason: e.to_string(),
            })
    }

    // ── image_analysis ──────────────────────────────────────────────

    async fn image_analysis(&self, task: &ScheduledTask) -> Result<TaskResult, ExecutionError> {
        let attachment = task
            .attachment
            .as_ref()
            .filter(|a| a.is_image())
            .ok_or_else(|| ExecutionError::MissingInput {
                task_id: task.id().to_string(),
                what: "attached image".into(),
            })?;

        let bytes = match attachment.data {
            AttachmentData::Bytes(ref bytes) => bytes.clone(),
            AttachmentData::Url(ref url) => self.download(task, url).await?,
        };

        let prompt = if task.spec.input.trim().is_empty() {
            DESCRIBE_IMAGE_PROMPT
        } else {
            task.spec.input.as_str()
        };

        let content = self
            .backends
            .vision
            .analyze_image(&bytes, &attachment.mime_type, prompt)
            .await
            .map_err(|e| backend_error(task, e))?;

        Ok(TaskResult {
            content: TaskContent::Analysis(content),
            model_used: self.backends.vision.model_name().to_string(),
        })
    }

    // ── thread_summary ──────────────────────────────────────────────

    async fn thread_summary(&self, task: &ScheduledTask) -> Result<TaskResult, ExecutionError> {
        let count = task.turns.len();
        if count == 0 {
            debug!(task_id = %task.id(), "No thread context, skipping summary call");
            return Ok(TaskResult::text(NOTHING_TO_SUMMARIZE, NO_MODEL));
        }

        let transcript = task
            .turns
            .iter()
            .map(|t| t.transcript_line())
            .collect::<Vec<_>>()
            .join("\n");
        let messages = [
            ChatMessage::system(SUMMARY_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "다음은 {count}개 메시지로 이루어진 스레드입니다.\n\n{transcript}\n\n요청: {}",
                task.input()
            )),
        ];

        let summary = self
            .backends
            .text
            .generate_text(&messages)
            .await
            .map_err(|e| backend_error(task, e))?;

        Ok(TaskResult::text(
            format!("📋 *스레드 요약* ({count}개 메시지)\n\n{}", summary.trim()),
            self.backends.text.model_name(),
        ))
    }

    // ── video_generation ────────────────────────────────────────────

    async fn video_generation(&self, task: &ScheduledTask) -> Result<TaskResult, ExecutionError> {
        let Some(ref video) = self.backends.video else {
            return Ok(TaskResult::text(VIDEO_UNAVAILABLE, NO_MODEL));
        };

        let prompt = self.generation_prompt(task).await;
        match video.generate_video(&prompt).await {
            Ok(job) => {
                info!(task_id = %task.id(), operation = %job.operation, "Video generation started");
                Ok(TaskResult::text(
                    format!(
                        "🎬 영상 생성을 시작했습니다. 완료까지 몇 분 걸릴 수 있습니다.\n작업 ID: `{}`",
                        job.operation
                    ),
                    video.model_name(),
                ))
            }
            Err(e) if e.is_feature_unavailable() => {
                warn!(task_id = %task.id(), error = %e, "Video backend unavailable");
                Ok(TaskResult::text(VIDEO_UNAVAILABLE, video.model_name()))
            }
            Err(e) => Err(backend_error(task, e)),
        }
    }
}

fn backend_error(task: &ScheduledTask, source: LlmError) -> ExecutionError {
    ExecutionError::Backend {
        task_id: task.id().to_string(),
        source,
    }
}

/// Textual result for an image request that could not be fulfilled.
fn image_failure(error: LlmError, backend: &dyn ImageBackend) -> TaskResult {
    TaskResult::text(
        format!("⚠️ 이미지를 생성하지 못했습니다: {error}"),
        backend.model_name(),
    )
}

/// Share of characters that are Hangul syllables.
pub fn hangul_ratio(text: &str) -> f64 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let hangul = text.chars().filter(|c| ('가'..='힣').contains(c)).count();
    hangul as f64 / total as f64
}

/// Upload name for a generated image, keeping the URL's extension when it
/// has a plausible one.
fn image_filename(task_id: &str, url: Option<&str>) -> String {
    let ext = url
        .and_then(|u| u.split(['?', '#']).next())
        .and_then(|path| path.rsplit('/').next())
        .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext))
        .filter(|ext| (1..=4).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("png")
        .to_ascii_lowercase();
    let stem: String = task_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("generated_{stem}.{ext}")
}
