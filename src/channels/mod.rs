//! Chat platform boundary.
//!
//! The pipeline talks to the platform only through three traits:
//! `ResponseSink` for output, `ContextLoader` for thread history, and
//! `AssetFetcher` for private file downloads. `SlackClient` implements all
//! three; tests use in-process doubles.

pub mod slack;

pub use slack::SlackClient;

use async_trait::async_trait;

use crate::context::Turn;
use crate::error::ChannelError;

/// Where to post: a channel, optionally inside a thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadRef {
    pub channel: String,
    /// Parent message timestamp; `None` posts at the top level.
    pub thread_ts: Option<String>,
}

impl ThreadRef {
    pub fn new(channel: impl Into<String>, thread_ts: Option<String>) -> Self {
        Self {
            channel: channel.into(),
            thread_ts,
        }
    }
}

/// A posted message that can be edited later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub channel: String,
    pub ts: String,
}

/// Outbound side of a conversation.
///
/// `update` on the same `MessageRef` with the same text must be safe to repeat.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// Post a new message and return a handle to it.
    async fn post(&self, thread: &ThreadRef, text: &str) -> Result<MessageRef, ChannelError>;

    /// Replace the text of a posted message.
    async fn update(&self, message: &MessageRef, text: &str) -> Result<(), ChannelError>;

    /// Upload a file into the thread.
    async fn upload(
        &self,
        thread: &ThreadRef,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<(), ChannelError>;
}

/// Reads prior thread messages.
///
/// Implementations degrade to an empty list on failure; loading context
/// never fails a request.
#[async_trait]
pub trait ContextLoader: Send + Sync {
    /// Turns in `thread_ts`, oldest first, without the thread parent and
    /// without `exclude_message_id`.
    async fn load(&self, channel: &str, thread_ts: &str, exclude_message_id: &str) -> Vec<Turn>;

    /// Human-readable name for a user id.
    async fn display_name(&self, user_id: &str) -> String {
        user_id.to_string()
    }
}

/// Downloads files that need platform credentials.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ChannelError>;
}

/// Split text into messages of at most `max_chars` characters.
///
/// Prefers to cut just after a closed code block, then at a paragraph break,
/// a line break, or a space. A cut inside an open code block closes the fence
/// and reopens it in the next part.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut remaining = text.to_string();

    while remaining.chars().count() > max_chars {
        // Leave room for a closing fence when balancing is possible.
        let rebalance = max_chars >= 16;
        let budget = if rebalance { max_chars - 4 } else { max_chars };
        let limit = byte_offset(&remaining, budget);
        let window = &remaining[..limit];

        let (split_at, skip) = closed_fence_end(window)
            .map(|i| (i, 0))
            .or_else(|| window.rfind("\n\n").map(|i| (i, 2)))
            .or_else(|| window.rfind('\n').map(|i| (i, 1)))
            .or_else(|| window.rfind(' ').map(|i| (i, 1)))
            .filter(|&(i, _)| i >= limit / 2)
            .unwrap_or((limit, 0));

        let mut head = remaining[..split_at].trim_end().to_string();
        let mut tail = remaining[split_at + skip..]
            .trim_start_matches('\n')
            .to_string();

        if rebalance && head.matches("```").count() % 2 == 1 {
            head.push_str("\n```");
            tail = format!("```\n{tail}");
        }

        if !head.is_empty() {
            chunks.push(head);
        }
        remaining = tail;
    }

    if !remaining.is_empty() || chunks.is_empty() {
        chunks.push(remaining);
    }
    chunks
}

/// Byte index of the `n`th character (or the end of the string).
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

/// End of the last fence that closes a code block within `window`.
fn closed_fence_end(window: &str) -> Option<usize> {
    window
        .match_indices("```")
        .enumerate()
        .filter(|(n, _)| n % 2 == 1)
        .map(|(_, (i, _))| i + 3)
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_message("hello", 100), vec!["hello".to_string()]);
    }

    #[test]
    fn empty_text_is_one_empty_chunk() {
        assert_eq!(split_message("", 100), vec![String::new()]);
    }

    #[test]
    fn splits_on_paragraph_break() {
        let text = format!("{}\n\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = split_message(&text, 100);
        assert_eq!(chunks, vec!["a".repeat(60), "b".repeat(60)]);
    }

    #[test]
    fn prefers_closed_code_block_boundary() {
        let text = format!("intro\n```\n{}\n```\n{}", "x".repeat(40), "y".repeat(60));
        let chunks = split_message(&text, 80);
        assert!(chunks[0].ends_with("```"));
        assert_eq!(chunks[0].matches("```").count(), 2);
        assert!(chunks[1].starts_with('y'));
    }

    #[test]
    fn open_code_block_is_closed_and_reopened() {
        let code: String = (0..30).map(|i| format!("line {i}\n")).collect();
        let text = format!("```\n{code}```");
        let chunks = split_message(&text, 100);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(chunk.matches("```").count() % 2, 0, "unbalanced: {chunk:?}");
            assert!(chunk.chars().count() <= 100);
        }
    }

    #[test]
    fn hard_cut_without_separators_respects_char_limit() {
        let text = "가".repeat(250);
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn no_chunk_exceeds_limit_for_prose() {
        let text = "word ".repeat(500);
        let chunks = split_message(&text, 120);
        assert!(chunks.iter().all(|c| c.chars().count() <= 120));
        assert_eq!(chunks.join(" ").split_whitespace().count(), 500);
    }
}
