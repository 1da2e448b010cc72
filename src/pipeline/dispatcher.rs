//! Response dispatcher.
//!
//! Text and analysis results are streamed into a placeholder message in
//! character-bounded increments. An update is sent only once `flush_chars`
//! new characters have accumulated, however the text arrived. Content
//! that outgrows one Slack message is sealed and continues in a new
//! message. Images are uploaded, then captioned.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::channels::{MessageRef, ResponseSink, ThreadRef, split_message};
use crate::config::StreamConfig;
use crate::error::ChannelError;
use crate::pipeline::types::{ImageArtifact, TaskContent, TaskResult};

const TEXT_PLACEHOLDER: &str = "💭 응답 생성 중...";
const ANALYSIS_PLACEHOLDER: &str = "🔍 분석 결과 전송 중...";
const CONTINUATION_PLACEHOLDER: &str = "...";
const EMPTY_RESPONSE: &str = "(빈 응답)";

/// Posts task results and progress updates to a conversation.
pub struct ResponseDispatcher {
    sink: Arc<dyn ResponseSink>,
    config: StreamConfig,
}

impl ResponseDispatcher {
    pub fn new(sink: Arc<dyn ResponseSink>, config: StreamConfig) -> Self {
        Self { sink, config }
    }

    /// Render one task result into the thread.
    pub async fn deliver(&self, thread: &ThreadRef, result: TaskResult) -> Result<(), ChannelError> {
        match result.content {
            TaskContent::Text(text) => self.stream_text(thread, TEXT_PLACEHOLDER, &text).await,
            TaskContent::Analysis(text) => {
                self.stream_text(thread, ANALYSIS_PLACEHOLDER, &text).await
            }
            TaskContent::Image(image) => self.deliver_image(thread, image).await,
        }
    }

    async fn stream_text(
        &self,
        thread: &ThreadRef,
        placeholder: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        let text = if text.trim().is_empty() { EMPTY_RESPONSE } else { text };
        let mut writer = StreamWriter::open(self.sink.as_ref(), thread, &self.config, placeholder).await?;

        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(self.config.flush_chars.max(1)) {
            writer.push(&chunk.iter().collect::<String>()).await?;
        }
        writer.finish().await
    }

    async fn deliver_image(&self, thread: &ThreadRef, image: ImageArtifact) -> Result<(), ChannelError> {
        let ImageArtifact {
            bytes,
            filename,
            caption,
        } = image;
        debug!(filename = %filename, bytes = bytes.len(), "Uploading generated image");
        self.sink.upload(thread, bytes, &filename).await?;

        if let Some(caption) = caption.filter(|c| !c.trim().is_empty()) {
            self.sink.post(thread, &format!("🎨 {caption}")).await?;
        }
        Ok(())
    }

    // ── Status message ──────────────────────────────────────────────

    /// Post the shared progress message. A failure is logged and yields
    /// `None`; later status updates are then skipped.
    pub async fn post_status(&self, thread: &ThreadRef, text: &str) -> Option<MessageRef> {
        match self.sink.post(thread, text).await {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(channel = %thread.channel, error = %e, "Failed to post status message");
                None
            }
        }
    }

    /// Edit the progress message in place.
    pub async fn update_status(&self, status: Option<&MessageRef>, text: &str) {
        let Some(message) = status else {
            return;
        };
        if let Err(e) = self.sink.update(message, text).await {
            warn!(ts = %message.ts, error = %e, "Failed to update status message");
        }
    }

    /// Post a standalone notice. Returns whether it reached the thread.
    pub async fn notify(&self, thread: &ThreadRef, text: &str) -> bool {
        match self.sink.post(thread, text).await {
            Ok(_) => true,
            Err(e) => {
                warn!(channel = %thread.channel, error = %e, "Failed to post notice");
                false
            }
        }
    }
}

/// Incremental writer over one or more Slack messages.
pub struct StreamWriter<'a> {
    sink: &'a dyn ResponseSink,
    thread: &'a ThreadRef,
    config: &'a StreamConfig,
    current: MessageRef,
    /// Text of the message being written.
    buffer: String,
    /// Characters added since the last update.
    pending: usize,
    updates: usize,
}

impl<'a> StreamWriter<'a> {
    /// Post the placeholder that the stream will overwrite.
    pub async fn open(
        sink: &'a dyn ResponseSink,
        thread: &'a ThreadRef,
        config: &'a StreamConfig,
        placeholder: &str,
    ) -> Result<Self, ChannelError> {
        let current = sink.post(thread, placeholder).await?;
        Ok(Self {
            sink,
            thread,
            config,
            current,
            buffer: String::new(),
            pending: 0,
            updates: 0,
        })
    }

    /// Append output; flushes once the threshold is crossed.
    pub async fn push(&mut self, chunk: &str) -> Result<(), ChannelError> {
        self.buffer.push_str(chunk);
        self.pending += chunk.chars().count();
        if self.pending >= self.config.flush_chars {
            self.flush(true).await?;
        }
        Ok(())
    }

    /// Write the full content without the cursor.
    pub async fn finish(mut self) -> Result<(), ChannelError> {
        self.flush(false).await?;
        debug!(updates = self.updates, "Stream finished");
        Ok(())
    }

    async fn flush(&mut self, streaming: bool) -> Result<(), ChannelError> {
        // Room for " " + cursor while streaming.
        let cursor_len = self.config.cursor.chars().count() + 1;
        let budget = self.config.max_message_len.saturating_sub(cursor_len).max(1);

        if self.buffer.chars().count() > budget {
            let mut parts = split_message(&self.buffer, budget);
            let last = parts.pop().unwrap_or_default();
            for part in parts {
                self.sink.update(&self.current, &part).await?;
                self.updates += 1;
                self.current = self.sink.post(self.thread, CONTINUATION_PLACEHOLDER).await?;
            }
            self.buffer = last;
        }

        let text = if streaming {
            format!("{} {}", self.buffer, self.config.cursor)
        } else {
            self.buffer.clone()
        };
        self.sink.update(&self.current, &text).await?;
        self.updates += 1;
        self.pending = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Post(String),
        Update(String, String),
        Upload(String, usize),
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<Call>>,
        next_ts: AtomicUsize,
        fail_uploads: bool,
    }

    impl RecordingSink {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResponseSink for RecordingSink {
        async fn post(&self, thread: &ThreadRef, text: &str) -> Result<MessageRef, ChannelError> {
            self.calls.lock().unwrap().push(Call::Post(text.to_string()));
            let ts = self.next_ts.fetch_add(1, Ordering::SeqCst);
            Ok(MessageRef {
                channel: thread.channel.clone(),
                ts: format!("m{ts}"),
            })
        }

        async fn update(&self, message: &MessageRef, text: &str) -> Result<(), ChannelError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Update(message.ts.clone(), text.to_string()));
            Ok(())
        }

        async fn upload(&self, _thread: &ThreadRef, bytes: Vec<u8>, filename: &str) -> Result<(), ChannelError> {
            if self.fail_uploads {
                return Err(ChannelError::UploadFailed {
                    name: "test".into(),
                    filename: filename.into(),
                    reason: "nope".into(),
                });
            }
            self.calls
                .lock()
                .unwrap()
                .push(Call::Upload(filename.to_string(), bytes.len()));
            Ok(())
        }
    }

    fn thread() -> ThreadRef {
        ThreadRef::new("C1", Some("1700000000.000100".into()))
    }

    fn config(flush_chars: usize, max_message_len: usize) -> StreamConfig {
        StreamConfig {
            flush_chars,
            max_message_len,
            cursor: "▌".into(),
        }
    }

    #[tokio::test]
    async fn short_text_is_placeholder_then_final_update() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = ResponseDispatcher::new(sink.clone(), config(800, 3000));
        dispatcher
            .deliver(&thread(), TaskResult::text("안녕하세요!", "gpt-4o"))
            .await
            .unwrap();

        assert_eq!(
            sink.calls(),
            vec![
                Call::Post(TEXT_PLACEHOLDER.into()),
                Call::Update("m0".into(), "안녕하세요!".into()),
            ]
        );
    }

    #[tokio::test]
    async fn updates_are_bounded_by_flush_threshold() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = ResponseDispatcher::new(sink.clone(), config(10, 3000));
        let text = "a".repeat(35);
        dispatcher
            .deliver(&thread(), TaskResult::text(text.clone(), "gpt-4o"))
            .await
            .unwrap();

        let updates: Vec<String> = sink
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Update(_, t) => Some(t),
                _ => None,
            })
            .collect();
        // Three threshold flushes with the cursor, then the final write.
        assert_eq!(updates.len(), 4);
        assert_eq!(updates[0], format!("{} ▌", "a".repeat(10)));
        assert_eq!(updates[2], format!("{} ▌", "a".repeat(30)));
        assert_eq!(updates[3], text);
    }

    #[tokio::test]
    async fn analysis_uses_its_own_placeholder() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = ResponseDispatcher::new(sink.clone(), config(800, 3000));
        let result = TaskResult {
            content: TaskContent::Analysis("고양이가 보입니다.".into()),
            model_used: "gpt-4o".into(),
        };
        dispatcher.deliver(&thread(), result).await.unwrap();
        assert_eq!(sink.calls()[0], Call::Post(ANALYSIS_PLACEHOLDER.into()));
    }

    #[tokio::test]
    async fn long_text_continues_in_new_messages() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = ResponseDispatcher::new(sink.clone(), config(50, 100));
        let text = "word ".repeat(60);
        dispatcher
            .deliver(&thread(), TaskResult::text(text.clone(), "gpt-4o"))
            .await
            .unwrap();

        let calls = sink.calls();
        let posts = calls.iter().filter(|c| matches!(c, Call::Post(_))).count();
        assert!(posts >= 3, "expected continuation posts, got {calls:?}");

        // The last update per message is its final text; none exceed the limit.
        let mut finals: Vec<(String, String)> = Vec::new();
        for call in &calls {
            if let Call::Update(ts, text) = call {
                assert!(text.chars().count() <= 100);
                match finals.iter_mut().find(|(t, _)| t == ts) {
                    Some(entry) => entry.1 = text.clone(),
                    None => finals.push((ts.clone(), text.clone())),
                }
            }
        }
        let words: usize = finals
            .iter()
            .map(|(_, t)| t.split_whitespace().count())
            .sum();
        assert_eq!(words, 60);
        assert!(finals.iter().all(|(_, t)| !t.contains('▌')));
    }

    #[tokio::test]
    async fn empty_text_gets_a_visible_body() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = ResponseDispatcher::new(sink.clone(), config(800, 3000));
        dispatcher
            .deliver(&thread(), TaskResult::text("  ", "gpt-4o"))
            .await
            .unwrap();
        assert_eq!(sink.calls()[1], Call::Update("m0".into(), EMPTY_RESPONSE.into()));
    }

    #[tokio::test]
    async fn image_is_uploaded_then_captioned() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = ResponseDispatcher::new(sink.clone(), config(800, 3000));
        let result = TaskResult {
            content: TaskContent::Image(ImageArtifact {
                bytes: vec![1, 2, 3],
                filename: "generated_t1.png".into(),
                caption: Some("A friendly robot".into()),
            }),
            model_used: "dall-e-3".into(),
        };
        dispatcher.deliver(&thread(), result).await.unwrap();
        assert_eq!(
            sink.calls(),
            vec![
                Call::Upload("generated_t1.png".into(), 3),
                Call::Post("🎨 A friendly robot".into()),
            ]
        );
    }

    #[tokio::test]
    async fn failed_upload_skips_caption() {
        let sink = Arc::new(RecordingSink {
            fail_uploads: true,
            ..RecordingSink::default()
        });
        let dispatcher = ResponseDispatcher::new(sink.clone(), config(800, 3000));
        let result = TaskResult {
            content: TaskContent::Image(ImageArtifact {
                bytes: vec![1],
                filename: "a.png".into(),
                caption: Some("robot".into()),
            }),
            model_used: "dall-e-3".into(),
        };
        assert!(dispatcher.deliver(&thread(), result).await.is_err());
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn status_updates_skip_without_message() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = ResponseDispatcher::new(sink.clone(), config(800, 3000));
        dispatcher.update_status(None, "ignored").await;
        assert!(sink.calls().is_empty());

        let status = dispatcher.post_status(&thread(), "start").await;
        dispatcher.update_status(status.as_ref(), "next").await;
        assert_eq!(
            sink.calls(),
            vec![Call::Post("start".into()), Call::Update("m0".into(), "next".into())]
        );
    }
}
