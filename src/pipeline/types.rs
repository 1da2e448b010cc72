//! Shared types for the request pipeline.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::context::{MediaAttachment, Turn};
use crate::error::IntentError;

// ── Task kinds ──────────────────────────────────────────────────────

/// Capability a task needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    TextGeneration,
    ImageGeneration,
    ImageAnalysis,
    ThreadSummary,
    VideoGeneration,
}

impl TaskKind {
    /// Wire name, also used for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::TextGeneration => "text_generation",
            Self::ImageGeneration => "image_generation",
            Self::ImageAnalysis => "image_analysis",
            Self::ThreadSummary => "thread_summary",
            Self::VideoGeneration => "video_generation",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TaskKind {
    type Err = IntentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "text_generation" => Ok(Self::TextGeneration),
            "image_generation" => Ok(Self::ImageGeneration),
            "image_analysis" => Ok(Self::ImageAnalysis),
            "thread_summary" => Ok(Self::ThreadSummary),
            "video_generation" => Ok(Self::VideoGeneration),
            other => Err(IntentError::UnknownTaskKind(other.to_string())),
        }
    }
}

// ── Intent ──────────────────────────────────────────────────────────

/// How the model suggested running the tasks. Execution is always
/// sequential; the value is kept for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    #[default]
    Sequential,
    Parallel,
}

/// Where an intent came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentOrigin {
    Model,
    Fallback,
}

/// One unit of work requested by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSpec {
    /// Unique within the intent.
    pub id: String,
    pub kind: TaskKind,
    pub description: String,
    pub input: String,
    /// Run rank: lower runs first.
    pub priority: i32,
    pub depends_on: Vec<String>,
}

/// Structured reading of a user request.
#[derive(Debug, Clone, Serialize)]
pub struct Intent {
    pub summary: String,
    pub tasks: Vec<TaskSpec>,
    pub strategy: ExecutionStrategy,
    pub estimated_seconds: u32,
    pub origin: IntentOrigin,
}

// ── Scheduled task ──────────────────────────────────────────────────

/// Lifecycle of a scheduled task. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A task with its execution slot and the context it runs against.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub spec: TaskSpec,
    /// 0-based position in the schedule.
    pub order: usize,
    /// Thread context shared by every task of the request, oldest first.
    pub turns: Arc<[Turn]>,
    pub attachment: Option<MediaAttachment>,
    status: TaskStatus,
}

impl ScheduledTask {
    pub fn new(
        spec: TaskSpec,
        order: usize,
        turns: Arc<[Turn]>,
        attachment: Option<MediaAttachment>,
    ) -> Self {
        Self {
            spec,
            order,
            turns,
            attachment,
            status: TaskStatus::Pending,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn kind(&self) -> TaskKind {
        self.spec.kind
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Task input, or the description when the model left the input empty.
    pub fn input(&self) -> &str {
        if self.spec.input.trim().is_empty() {
            &self.spec.description
        } else {
            &self.spec.input
        }
    }

    /// `pending → running`. Returns false if the task already ran.
    pub fn start(&mut self) -> bool {
        self.transition(TaskStatus::Pending, TaskStatus::Running)
    }

    /// `running → completed`.
    pub fn complete(&mut self) -> bool {
        self.transition(TaskStatus::Running, TaskStatus::Completed)
    }

    /// `running → failed`.
    pub fn fail(&mut self) -> bool {
        self.transition(TaskStatus::Running, TaskStatus::Failed)
    }

    fn transition(&mut self, from: TaskStatus, to: TaskStatus) -> bool {
        if self.status != from {
            warn!(
                task_id = %self.spec.id,
                current = ?self.status,
                requested = ?to,
                "Ignoring invalid task status transition"
            );
            return false;
        }
        self.status = to;
        true
    }
}

// ── Results ─────────────────────────────────────────────────────────

/// Rendering class of a task result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Text,
    Image,
    Analysis,
}

/// A generated image ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifact {
    pub bytes: Vec<u8>,
    pub filename: String,
    /// Posted after the upload.
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskContent {
    Text(String),
    Image(ImageArtifact),
    Analysis(String),
}

/// Output of one executed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub content: TaskContent,
    pub model_used: String,
}

impl TaskResult {
    pub fn text(content: impl Into<String>, model_used: impl Into<String>) -> Self {
        Self {
            content: TaskContent::Text(content.into()),
            model_used: model_used.into(),
        }
    }

    pub fn kind(&self) -> ResultKind {
        match self.content {
            TaskContent::Text(_) => ResultKind::Text,
            TaskContent::Image(_) => ResultKind::Image,
            TaskContent::Analysis(_) => ResultKind::Analysis,
        }
    }

    /// Text body for text and analysis results.
    pub fn as_text(&self) -> Option<&str> {
        match self.content {
            TaskContent::Text(ref s) | TaskContent::Analysis(ref s) => Some(s),
            TaskContent::Image(_) => None,
        }
    }
}

// ── Run report ──────────────────────────────────────────────────────

/// What happened to one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub result_kind: Option<ResultKind>,
    pub error: Option<String>,
    /// Whether the result reached the conversation.
    pub delivered: bool,
}

/// Summary of one orchestrated request.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub intent_summary: String,
    pub intent_origin: IntentOrigin,
    pub outcomes: Vec<TaskOutcome>,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == TaskStatus::Completed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> TaskSpec {
        TaskSpec {
            id: id.into(),
            kind: TaskKind::TextGeneration,
            description: "설명".into(),
            input: String::new(),
            priority: 1,
            depends_on: Vec::new(),
        }
    }

    #[test]
    fn kind_round_trips_through_label() {
        for kind in [
            TaskKind::TextGeneration,
            TaskKind::ImageGeneration,
            TaskKind::ImageAnalysis,
            TaskKind::ThreadSummary,
            TaskKind::VideoGeneration,
        ] {
            assert_eq!(kind.label().parse::<TaskKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_kind_names_the_value() {
        let err = "music_generation".parse::<TaskKind>().unwrap_err();
        assert!(matches!(err, IntentError::UnknownTaskKind(ref k) if k == "music_generation"));
    }

    #[test]
    fn lifecycle_is_one_way() {
        let mut task = ScheduledTask::new(spec("t1"), 0, Arc::from(Vec::new()), None);
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(!task.complete());
        assert!(task.start());
        assert!(task.complete());
        assert!(task.status().is_terminal());
        assert!(!task.start());
        assert!(!task.fail());
        assert_eq!(task.status(), TaskStatus::Completed);
    }

    #[test]
    fn empty_input_falls_back_to_description() {
        let task = ScheduledTask::new(spec("t1"), 0, Arc::from(Vec::new()), None);
        assert_eq!(task.input(), "설명");
    }

    #[test]
    fn result_kind_matches_content() {
        assert_eq!(TaskResult::text("hi", "gpt-4o").kind(), ResultKind::Text);
        let image = TaskResult {
            content: TaskContent::Image(ImageArtifact {
                bytes: vec![1, 2],
                filename: "a.png".into(),
                caption: None,
            }),
            model_used: "dall-e-3".into(),
        };
        assert_eq!(image.kind(), ResultKind::Image);
        assert!(image.as_text().is_none());
    }
}
