//! Request orchestration: classify → schedule → execute → deliver.
//!
//! One request runs end to end on the calling task. Tasks execute strictly
//! in scheduled order; a failure in one task (execution or delivery) is
//! reported in the thread and never stops the remaining tasks.

use std::sync::Arc;

use tracing::{info, warn};

use crate::channels::{AssetFetcher, ContextLoader, ResponseSink, ThreadRef};
use crate::config::{ExecutorConfig, StreamConfig};
use crate::context::{ConversationContext, MediaAttachment};
use crate::llm::Backends;
use crate::pipeline::classifier::IntentClassifier;
use crate::pipeline::dispatcher::ResponseDispatcher;
use crate::pipeline::executor::TaskExecutor;
use crate::pipeline::rules::FallbackClassifier;
use crate::pipeline::scheduler::schedule;
use crate::pipeline::types::{RunReport, TaskOutcome};

const STATUS_ANALYZING: &str = "🤖 요청을 분석하고 있습니다...";
const STATUS_DONE: &str = "✅ 모든 작업이 완료되었습니다.";

/// Everything the orchestrator talks to.
pub struct OrchestratorDeps {
    pub backends: Backends,
    pub sink: Arc<dyn ResponseSink>,
    pub context_loader: Arc<dyn ContextLoader>,
    pub fetcher: Arc<dyn AssetFetcher>,
    pub stream: StreamConfig,
    pub executor: ExecutorConfig,
}

/// A user message that passed signature and dedup checks.
#[derive(Debug, Clone)]
pub struct UserRequest {
    pub user_id: String,
    pub channel_id: String,
    /// Thread to answer in; `None` answers at the top level.
    pub thread_ts: Option<String>,
    /// Platform id of the triggering message (Slack `ts`).
    pub message_id: String,
    /// Message text with the bot mention removed.
    pub text: String,
    pub attachment: Option<MediaAttachment>,
}

pub struct Orchestrator {
    classifier: IntentClassifier,
    executor: TaskExecutor,
    dispatcher: ResponseDispatcher,
    context_loader: Arc<dyn ContextLoader>,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        let OrchestratorDeps {
            backends,
            sink,
            context_loader,
            fetcher,
            stream,
            executor,
        } = deps;

        let classifier = IntentClassifier::new(backends.text.clone(), FallbackClassifier::default_rules())
            .with_video(backends.video.is_some());
        Self {
            classifier,
            executor: TaskExecutor::new(backends, fetcher, executor),
            dispatcher: ResponseDispatcher::new(sink, stream),
            context_loader,
        }
    }

    /// Process one request and report what happened to each task.
    pub async fn handle(&self, request: UserRequest) -> RunReport {
        let thread = ThreadRef::new(request.channel_id.clone(), request.thread_ts.clone());
        // The thread is read before anything is posted into it, so the
        // bot's own status message never shows up as a context turn.
        let (text, ctx) = self.load_context(request).await;
        let status = self.dispatcher.post_status(&thread, STATUS_ANALYZING).await;

        let intent = self.classifier.classify(text.trim(), &ctx).await;
        info!(
            channel = %ctx.channel_id,
            summary = %intent.summary,
            origin = ?intent.origin,
            strategy = ?intent.strategy,
            tasks = intent.tasks.len(),
            "Intent classified"
        );

        let mut tasks = schedule(&intent, &ctx);
        let total = tasks.len();
        self.dispatcher
            .update_status(
                status.as_ref(),
                &format!(
                    "📋 {total}개 작업을 처리합니다... (예상 시간: {}초)",
                    intent.estimated_seconds
                ),
            )
            .await;

        let mut outcomes = Vec::with_capacity(total);
        let mut delivery_notice_sent = false;

        for (i, task) in tasks.iter_mut().enumerate() {
            let description = task.spec.description.clone();
            self.dispatcher
                .update_status(
                    status.as_ref(),
                    &format!("⚙️ 작업 {}/{total}: {description} 처리 중...", i + 1),
                )
                .await;

            let mut outcome = TaskOutcome {
                task_id: task.id().to_string(),
                kind: task.kind(),
                status: task.status(),
                result_kind: None,
                error: None,
                delivered: false,
            };

            match self.executor.execute(task).await {
                Ok(result) => {
                    outcome.result_kind = Some(result.kind());
                    match self.dispatcher.deliver(&thread, result).await {
                        Ok(()) => outcome.delivered = true,
                        Err(e) => {
                            warn!(task_id = %outcome.task_id, error = %e, "Failed to deliver task result");
                            outcome.error = Some(e.to_string());
                            if !delivery_notice_sent {
                                delivery_notice_sent = true;
                                self.dispatcher
                                    .notify(&thread, &format!("❌ 작업 결과 전송 중 오류 발생: {e}"))
                                    .await;
                            }
                        }
                    }
                }
                Err(e) => {
                    outcome.error = Some(e.to_string());
                    outcome.delivered = self
                        .dispatcher
                        .notify(&thread, &format!("❌ {description} 처리 중 오류 발생: {e}"))
                        .await;
                }
            }

            outcome.status = task.status();
            outcomes.push(outcome);
        }

        self.dispatcher.update_status(status.as_ref(), STATUS_DONE).await;

        let report = RunReport {
            intent_summary: intent.summary,
            intent_origin: intent.origin,
            outcomes,
        };
        info!(
            channel = %ctx.channel_id,
            completed = report.completed(),
            total,
            "Request finished"
        );
        report
    }

    /// Split a request into its text and the context the pipeline sees.
    async fn load_context(&self, request: UserRequest) -> (String, ConversationContext) {
        let UserRequest {
            user_id,
            channel_id,
            thread_ts,
            message_id,
            text,
            attachment,
        } = request;

        let turns = match thread_ts {
            Some(ref ts) => self.context_loader.load(&channel_id, ts, &message_id).await,
            None => Vec::new(),
        };
        let user_name = self.context_loader.display_name(&user_id).await;

        let ctx = ConversationContext {
            user_id,
            user_name,
            channel_id,
            thread_id: thread_ts,
            message_id,
            turns,
            attachment,
        };
        (text, ctx)
    }
}
