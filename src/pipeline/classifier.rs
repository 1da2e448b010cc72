//! Turns a user message into a structured intent.
//!
//! Flow:
//! 1. Text backend call with the message, capabilities and context metadata
//! 2. Parse and validate the JSON object in the reply
//! 3. Any backend, parse or validation failure → keyword fallback
//!
//! `classify` never returns an error.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::context::ConversationContext;
use crate::error::IntentError;
use crate::llm::{ChatMessage, TextBackend};
use crate::pipeline::rules::FallbackClassifier;
use crate::pipeline::types::{ExecutionStrategy, Intent, IntentOrigin, TaskKind, TaskSpec};

/// Priority assigned when the model omits one.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Longest user message embedded in the prompt.
const MAX_PROMPT_MESSAGE_CHARS: usize = 2000;

/// LLM-backed intent classifier with a keyword safety net.
pub struct IntentClassifier {
    llm: Arc<dyn TextBackend>,
    fallback: FallbackClassifier,
    video_enabled: bool,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn TextBackend>, fallback: FallbackClassifier) -> Self {
        Self {
            llm,
            fallback,
            video_enabled: false,
        }
    }

    /// Advertise video generation in the prompt.
    pub fn with_video(mut self, enabled: bool) -> Self {
        self.video_enabled = enabled;
        self
    }

    /// Classify a message. Falls back to keyword rules on any failure.
    pub async fn classify(&self, user_message: &str, context: &ConversationContext) -> Intent {
        let prompt = build_intent_prompt(user_message, context, self.video_enabled);

        let raw = match self.llm.generate_text(&[ChatMessage::user(prompt)]).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Intent analysis call failed, using fallback classifier");
                return self.fallback.classify(user_message, context);
            }
        };

        match parse_intent_response(&raw) {
            Ok(intent) => {
                info!(
                    summary = %intent.summary,
                    tasks = intent.tasks.len(),
                    strategy = ?intent.strategy,
                    "Intent analysed"
                );
                intent
            }
            Err(e) => {
                let preview: String = raw.chars().take(200).collect();
                warn!(
                    error = %e,
                    raw_response = %preview,
                    "Failed to parse intent response, using fallback classifier"
                );
                self.fallback.classify(user_message, context)
            }
        }
    }
}

fn capabilities(video_enabled: bool) -> String {
    let mut text = String::from(
        "1. text_generation: 질문 답변, 설명, 번역(한국어 ↔ 영어), 코드 생성 및 설명, 창작 글쓰기, 문서 작성\n\
         2. image_generation: 다양한 스타일의 이미지 생성 (로고, 일러스트, 개념 시각화)\n\
         3. image_analysis: 첨부된 이미지 설명, 차트/그래프 분석, 스크린샷 해석, 문서 이미지 읽기\n\
         4. thread_summary: 스레드 메시지 요약, 주요 주제와 결론, 참여자별 의견 정리\n",
    );
    if video_enabled {
        text.push_str("5. video_generation: 짧은 영상 생성 (사용 가능 여부는 계정 권한에 따라 다름)\n");
    }
    text
}

/// Build the classification prompt.
fn build_intent_prompt(
    user_message: &str,
    context: &ConversationContext,
    video_enabled: bool,
) -> String {
    let message: String = user_message.chars().take(MAX_PROMPT_MESSAGE_CHARS).collect();
    let kinds = if video_enabled {
        "text_generation|image_generation|image_analysis|thread_summary|video_generation"
    } else {
        "text_generation|image_generation|image_analysis|thread_summary"
    };

    let mut prompt = String::with_capacity(2048);
    prompt.push_str(&format!("사용자 메시지: \"{message}\"\n\n"));
    prompt.push_str("대화 컨텍스트:\n");
    prompt.push_str(&format!("- 사용자: {}\n", display_or_unknown(&context.user_name)));
    prompt.push_str(&format!("- 스레드 길이: {}개 메시지\n", context.thread_len()));
    prompt.push_str(&format!(
        "- 첨부 이미지: {}\n\n",
        if context.has_image() { "있음" } else { "없음" }
    ));
    prompt.push_str(&format!("봇의 능력:\n{}\n", capabilities(video_enabled)));
    prompt.push_str("사용자 메시지를 분석하여 필요한 작업들을 JSON으로 응답해주세요:\n\n");
    prompt.push_str(&format!(
        "{{\"summary\": \"사용자 의도 요약\", \"tasks\": [{{\"id\": \"unique_id\", \"kind\": \"{kinds}\", \
         \"description\": \"작업 설명\", \"input\": \"작업 입력\", \"priority\": 1, \"depends_on\": []}}], \
         \"strategy\": \"sequential\", \"estimated_seconds\": 10}}\n\n"
    ));
    prompt.push_str(
        "규칙:\n\
         - priority는 1-10, 낮은 값이 먼저 실행됩니다\n\
         - depends_on에는 같은 응답의 id만 넣으세요\n\
         - 이미지가 첨부되지 않았다면 image_analysis를 쓰지 마세요\n\n\
         예시:\n\
         - \"파이썬 설명해줘\" → text_generation 작업 1개\n\
         - \"고양이 그려줘\" → image_generation 작업 1개\n\
         - \"AI 설명하고 로봇 이미지도 그려줘\" → text_generation + image_generation 작업 2개\n\
         - \"스레드 요약해줘\" → thread_summary 작업 1개\n\n\
         JSON만 응답하세요.",
    );
    prompt
}

fn display_or_unknown(name: &str) -> &str {
    if name.trim().is_empty() { "Unknown" } else { name }
}

// ── Response parsing ────────────────────────────────────────────────

/// Raw intent as the model may send it. Field aliases accept the older
/// `user_intent`/`required_tasks` naming.
#[derive(Debug, Deserialize)]
struct IntentResponse {
    #[serde(default, alias = "user_intent")]
    summary: Option<String>,
    #[serde(default, alias = "required_tasks")]
    tasks: Option<Vec<TaskResponse>>,
    #[serde(default, alias = "execution_strategy")]
    strategy: Option<String>,
    #[serde(default, alias = "estimated_time")]
    estimated_seconds: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    #[serde(default, alias = "task_id")]
    id: Option<String>,
    #[serde(default, alias = "task_type", alias = "type")]
    kind: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "input_data")]
    input: Option<String>,
    #[serde(default)]
    priority: Option<serde_json::Value>,
    #[serde(default, alias = "dependencies")]
    depends_on: Vec<String>,
}

/// Parse and validate the model's intent JSON.
pub fn parse_intent_response(raw: &str) -> Result<Intent, IntentError> {
    let json_str = extract_json_object(raw);
    let response: IntentResponse = serde_json::from_str(&json_str)?;

    let summary = non_empty(response.summary).ok_or_else(|| IntentError::MissingField("summary".into()))?;
    let raw_tasks = response
        .tasks
        .ok_or_else(|| IntentError::MissingField("tasks".into()))?;
    if raw_tasks.is_empty() {
        return Err(IntentError::EmptyTasks);
    }

    let mut tasks = Vec::with_capacity(raw_tasks.len());
    let mut seen = HashSet::new();
    for (i, task) in raw_tasks.into_iter().enumerate() {
        let id = non_empty(task.id).ok_or_else(|| IntentError::MissingField(format!("tasks[{i}].id")))?;
        let kind: TaskKind = non_empty(task.kind)
            .ok_or_else(|| IntentError::MissingField(format!("tasks[{i}].kind")))?
            .parse()?;
        let description = non_empty(task.description)
            .ok_or_else(|| IntentError::MissingField(format!("tasks[{i}].description")))?;
        if !seen.insert(id.clone()) {
            return Err(IntentError::DuplicateTaskId(id));
        }

        let mut depends_on: Vec<String> = Vec::with_capacity(task.depends_on.len());
        for dep in task.depends_on {
            if !depends_on.contains(&dep) {
                depends_on.push(dep);
            }
        }

        tasks.push(TaskSpec {
            id,
            kind,
            description,
            input: task.input.unwrap_or_default(),
            priority: task
                .priority
                .as_ref()
                .and_then(json_number)
                .map(|p| p.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
                .unwrap_or(DEFAULT_PRIORITY),
            depends_on,
        });
    }

    for task in &tasks {
        if let Some(dep) = task.depends_on.iter().find(|d| !seen.contains(*d)) {
            return Err(IntentError::DanglingDependency {
                task: task.id.clone(),
                dependency: dep.clone(),
            });
        }
    }

    let strategy = match response.strategy.as_deref().map(str::trim) {
        Some("parallel") => ExecutionStrategy::Parallel,
        _ => ExecutionStrategy::Sequential,
    };
    let estimated_seconds = response
        .estimated_seconds
        .as_ref()
        .and_then(json_number)
        .map(|s| s.clamp(0, i64::from(u32::MAX)) as u32)
        .unwrap_or(0);

    debug!(tasks = tasks.len(), "Parsed intent response");
    Ok(Intent {
        summary,
        tasks,
        strategy,
        estimated_seconds,
        origin: IntentOrigin::Model,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Integer from a JSON number or numeric string (`3`, `3.0`, `"10"`).
fn json_number(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        serde_json::Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.round() as i64))
        }
        _ => None,
    }
}

/// Extract a JSON object from text that may include markdown fences or prose.
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::LlmError;

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn parses_fenced_intent() {
        let raw = "```json\n{\"summary\": \"로봇 그림\", \"tasks\": [{\"id\": \"t1\", \"kind\": \"image_generation\", \"description\": \"로봇 그리기\", \"input\": \"robot\", \"priority\": 2}], \"strategy\": \"sequential\", \"estimated_seconds\": 15}\n```";
        let intent = parse_intent_response(raw).unwrap();
        assert_eq!(intent.summary, "로봇 그림");
        assert_eq!(intent.tasks[0].kind, TaskKind::ImageGeneration);
        assert_eq!(intent.tasks[0].priority, 2);
        assert_eq!(intent.estimated_seconds, 15);
        assert_eq!(intent.origin, IntentOrigin::Model);
    }

    #[test]
    fn accepts_legacy_field_names() {
        let raw = r#"{"user_intent": "설명", "required_tasks": [{"task_id": "a", "task_type": "text_generation", "description": "설명", "input_data": "AI", "depends_on": []}], "execution_strategy": "parallel", "estimated_time": "8"}"#;
        let intent = parse_intent_response(raw).unwrap();
        assert_eq!(intent.tasks[0].id, "a");
        assert_eq!(intent.tasks[0].input, "AI");
        assert_eq!(intent.tasks[0].priority, DEFAULT_PRIORITY);
        assert_eq!(intent.strategy, ExecutionStrategy::Parallel);
        assert_eq!(intent.estimated_seconds, 8);
    }

    #[test]
    fn prose_around_object_is_ignored() {
        let raw = "Here you go: {\"summary\": \"s\", \"tasks\": [{\"id\": \"a\", \"kind\": \"text_generation\", \"description\": \"d\"}]} hope this helps";
        assert!(parse_intent_response(raw).is_ok());
    }

    #[test]
    fn missing_summary_is_rejected() {
        let raw = r#"{"tasks": [{"id": "a", "kind": "text_generation", "description": "d"}]}"#;
        assert!(matches!(
            parse_intent_response(raw),
            Err(IntentError::MissingField(ref f)) if f == "summary"
        ));
    }

    #[test]
    fn empty_tasks_are_rejected() {
        let raw = r#"{"summary": "s", "tasks": []}"#;
        assert!(matches!(parse_intent_response(raw), Err(IntentError::EmptyTasks)));
    }

    #[test]
    fn task_without_description_is_rejected() {
        let raw = r#"{"summary": "s", "tasks": [{"id": "a", "kind": "text_generation"}]}"#;
        assert!(matches!(
            parse_intent_response(raw),
            Err(IntentError::MissingField(ref f)) if f == "tasks[0].description"
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let raw = r#"{"summary": "s", "tasks": [
            {"id": "a", "kind": "text_generation", "description": "d"},
            {"id": "a", "kind": "image_generation", "description": "d"}]}"#;
        assert!(matches!(
            parse_intent_response(raw),
            Err(IntentError::DuplicateTaskId(ref id)) if id == "a"
        ));
    }

    #[test]
    fn dangling_dependency_is_rejected() {
        let raw = r#"{"summary": "s", "tasks": [
            {"id": "a", "kind": "text_generation", "description": "d", "depends_on": ["ghost"]}]}"#;
        assert!(matches!(
            parse_intent_response(raw),
            Err(IntentError::DanglingDependency { ref dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let raw = r#"{"summary": "s", "tasks": [{"id": "a", "kind": "music", "description": "d"}]}"#;
        assert!(matches!(
            parse_intent_response(raw),
            Err(IntentError::UnknownTaskKind(ref k)) if k == "music"
        ));
    }

    #[test]
    fn duplicate_dependencies_collapse() {
        let raw = r#"{"summary": "s", "tasks": [
            {"id": "a", "kind": "text_generation", "description": "d"},
            {"id": "b", "kind": "text_generation", "description": "d", "depends_on": ["a", "a"]}]}"#;
        let intent = parse_intent_response(raw).unwrap();
        assert_eq!(intent.tasks[1].depends_on, vec!["a".to_string()]);
    }

    #[test]
    fn not_json_is_an_error() {
        assert!(matches!(
            parse_intent_response("I think you want a picture."),
            Err(IntentError::Json(_))
        ));
    }

    // ── Prompt ──────────────────────────────────────────────────────

    #[test]
    fn prompt_carries_context_metadata() {
        let ctx = ConversationContext {
            user_name: "Minji".into(),
            turns: vec![crate::context::Turn::user("a", "b"); 3],
            ..ConversationContext::default()
        };
        let prompt = build_intent_prompt("로봇 그려줘", &ctx, false);
        assert!(prompt.contains("로봇 그려줘"));
        assert!(prompt.contains("Minji"));
        assert!(prompt.contains("3개 메시지"));
        assert!(prompt.contains("첨부 이미지: 없음"));
        assert!(!prompt.contains("video_generation"));
    }

    #[test]
    fn prompt_lists_video_only_when_enabled() {
        let prompt = build_intent_prompt("hi", &ConversationContext::default(), true);
        assert!(prompt.contains("video_generation"));
    }

    // ── Classifier with a mock backend ──────────────────────────────

    struct ScriptedLlm {
        reply: Result<String, ()>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TextBackend for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn generate_text(&self, _messages: &[ChatMessage]) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map_err(|_| LlmError::RequestFailed {
                provider: "scripted".into(),
                reason: "timeout".into(),
            })
        }
    }

    fn classifier(reply: Result<String, ()>) -> (IntentClassifier, Arc<ScriptedLlm>) {
        let llm = Arc::new(ScriptedLlm {
            reply,
            calls: AtomicUsize::new(0),
        });
        (
            IntentClassifier::new(llm.clone(), FallbackClassifier::default_rules()),
            llm,
        )
    }

    #[tokio::test]
    async fn invalid_json_routes_to_fallback() {
        let (classifier, llm) = classifier(Ok("not json at all".into()));
        let intent = classifier
            .classify("파이썬 설명해줘", &ConversationContext::default())
            .await;
        assert_eq!(intent.origin, IntentOrigin::Fallback);
        assert_eq!(intent.tasks.len(), 1);
        assert_eq!(intent.tasks[0].kind, TaskKind::TextGeneration);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backend_failure_routes_to_fallback() {
        let (classifier, _) = classifier(Err(()));
        let intent = classifier
            .classify("안녕, 로봇 그려줘", &ConversationContext::default())
            .await;
        assert_eq!(intent.origin, IntentOrigin::Fallback);
        assert_eq!(intent.tasks[0].kind, TaskKind::ImageGeneration);
    }

    #[tokio::test]
    async fn valid_response_is_used() {
        let (classifier, _) = classifier(Ok(r#"{"summary": "AI 설명과 로봇 그림", "tasks": [
            {"id": "explain", "kind": "text_generation", "description": "AI 설명", "input": "AI", "priority": 1},
            {"id": "draw", "kind": "image_generation", "description": "로봇 그리기", "input": "robot", "priority": 2}]}"#
            .into()));
        let intent = classifier
            .classify("AI 설명하고 로봇 이미지도 그려줘", &ConversationContext::default())
            .await;
        assert_eq!(intent.origin, IntentOrigin::Model);
        assert_eq!(intent.tasks.len(), 2);
    }
}
