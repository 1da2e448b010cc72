//! Keyword fallback classifier.
//!
//! Used whenever the model's intent response is missing or unusable. It
//! makes no external calls and always produces a single-task intent:
//! - attached image → `image_analysis`
//! - summary keywords → `thread_summary`
//! - drawing keywords → `image_generation`
//! - anything else → `text_generation`

use regex::Regex;
use tracing::debug;

use crate::context::ConversationContext;
use crate::pipeline::types::{ExecutionStrategy, Intent, IntentOrigin, TaskKind, TaskSpec};

/// A keyword class mapped to a task template.
#[derive(Debug, Clone)]
pub struct KeywordRule {
    pub regex: Regex,
    pub kind: TaskKind,
    pub summary: String,
    pub description: String,
    pub estimated_seconds: u32,
}

/// Deterministic intent classifier.
#[derive(Debug, Clone)]
pub struct FallbackClassifier {
    rules: Vec<KeywordRule>,
}

impl Default for FallbackClassifier {
    fn default() -> Self {
        Self::default_rules()
    }
}

impl FallbackClassifier {
    /// Summary and drawing keywords, checked in that order.
    pub fn default_rules() -> Self {
        let rules = vec![
            KeywordRule {
                regex: Regex::new(r"(?i)요약|summari[sz]e|summary").unwrap(),
                kind: TaskKind::ThreadSummary,
                summary: "스레드 요약 요청".into(),
                description: "스레드 메시지 요약".into(),
                estimated_seconds: 8,
            },
            KeywordRule {
                regex: Regex::new(r"(?i)그려|그림|이미지|생성|\bdraw\b").unwrap(),
                kind: TaskKind::ImageGeneration,
                summary: "이미지 생성 요청".into(),
                description: "이미지 생성".into(),
                estimated_seconds: 15,
            },
        ];
        Self { rules }
    }

    /// Add a keyword rule after the defaults.
    pub fn add_rule(&mut self, pattern: &str, kind: TaskKind, description: &str) -> Result<(), regex::Error> {
        self.rules.push(KeywordRule {
            regex: Regex::new(pattern)?,
            kind,
            summary: description.into(),
            description: description.into(),
            estimated_seconds: 10,
        });
        Ok(())
    }

    /// Build a single-task intent for `message`. Never fails.
    pub fn classify(&self, message: &str, context: &ConversationContext) -> Intent {
        if context.has_image() {
            return single_task(
                TaskKind::ImageAnalysis,
                "이미지 분석 요청",
                "업로드된 이미지 분석",
                message,
                10,
            );
        }

        if let Some(rule) = self.rules.iter().find(|r| r.regex.is_match(message)) {
            debug!(kind = rule.kind.label(), "Fallback keyword rule matched");
            return single_task(
                rule.kind,
                &rule.summary,
                &rule.description,
                message,
                rule.estimated_seconds,
            );
        }

        single_task(
            TaskKind::TextGeneration,
            "텍스트 응답 요청",
            "텍스트 응답 생성",
            message,
            8,
        )
    }
}

fn single_task(
    kind: TaskKind,
    summary: &str,
    description: &str,
    message: &str,
    estimated_seconds: u32,
) -> Intent {
    let id = match kind {
        TaskKind::TextGeneration => "fallback_text",
        TaskKind::ImageGeneration => "fallback_image_gen",
        TaskKind::ImageAnalysis => "fallback_image_analysis",
        TaskKind::ThreadSummary => "fallback_thread_summary",
        TaskKind::VideoGeneration => "fallback_video_gen",
    };
    Intent {
        summary: summary.to_string(),
        tasks: vec![TaskSpec {
            id: id.to_string(),
            kind,
            description: description.to_string(),
            input: message.to_string(),
            priority: 1,
            depends_on: Vec::new(),
        }],
        strategy: ExecutionStrategy::Sequential,
        estimated_seconds,
        origin: IntentOrigin::Fallback,
    }
}
