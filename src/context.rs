//! Conversation context handed to the classifier, scheduler and executor.

use serde::Serialize;

use crate::llm::{ChatMessage, Role};

/// One prior message in the hosting thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub role: Role,
    pub author_name: String,
    pub text: String,
    /// Rendered reactions, e.g. `":+1: x2"`.
    pub reactions: Option<String>,
}

impl Turn {
    pub fn user(author_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            author_name: author_name.into(),
            text: text.into(),
            reactions: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            author_name: "assistant".to_string(),
            text: text.into(),
            reactions: None,
        }
    }

    /// Chat message for the text backend. User turns carry the author name.
    pub fn to_chat_message(&self) -> ChatMessage {
        match self.role {
            Role::Assistant => ChatMessage::assistant(self.text.clone()),
            Role::System => ChatMessage::system(self.text.clone()),
            Role::User => ChatMessage::user(format!("{}: {}", self.author_name, self.text)),
        }
    }

    /// One transcript line for summarization.
    pub fn transcript_line(&self) -> String {
        match self.reactions {
            Some(ref reactions) => format!("{}: {} [{}]", self.author_name, self.text, reactions),
            None => format!("{}: {}", self.author_name, self.text),
        }
    }
}

/// Where an attached file's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentData {
    Bytes(Vec<u8>),
    /// Private platform URL; fetched with the bot token.
    Url(String),
}

/// A media file uploaded with the triggering message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAttachment {
    pub mime_type: String,
    pub name: Option<String>,
    pub data: AttachmentData,
}

impl MediaAttachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Everything known about the request besides the message text.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    pub user_id: String,
    pub user_name: String,
    pub channel_id: String,
    /// `None` outside threads (e.g. a top-level DM).
    pub thread_id: Option<String>,
    pub message_id: String,
    /// Prior thread messages, oldest first.
    pub turns: Vec<Turn>,
    pub attachment: Option<MediaAttachment>,
}

impl ConversationContext {
    pub fn has_image(&self) -> bool {
        self.attachment.as_ref().is_some_and(MediaAttachment::is_image)
    }

    pub fn thread_len(&self) -> usize {
        self.turns.len()
    }
}

/// Drop the oldest turns until the total text fits in `max_chars`.
///
/// The newest turn is always kept, even if it alone exceeds the budget.
pub fn trim_to_budget(turns: &mut Vec<Turn>, max_chars: usize) {
    let mut total: usize = turns.iter().map(|t| t.text.chars().count()).sum();
    let mut drop = 0;
    while total > max_chars && drop + 1 < turns.len() {
        total -= turns[drop].text.chars().count();
        drop += 1;
    }
    turns.drain(..drop);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_turn_message_includes_author() {
        let msg = Turn::user("Minji", "hello").to_chat_message();
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Minji: hello");
    }

    #[test]
    fn assistant_turn_message_is_plain() {
        let msg = Turn::assistant("hi there").to_chat_message();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content, "hi there");
    }

    #[test]
    fn transcript_line_renders_reactions() {
        let mut turn = Turn::user("Minji", "ship it");
        turn.reactions = Some(":+1: x3".into());
        assert_eq!(turn.transcript_line(), "Minji: ship it [:+1: x3]");
    }

    #[test]
    fn has_image_checks_mime() {
        let mut ctx = ConversationContext::default();
        assert!(!ctx.has_image());
        ctx.attachment = Some(MediaAttachment {
            mime_type: "application/pdf".into(),
            name: None,
            data: AttachmentData::Bytes(vec![1]),
        });
        assert!(!ctx.has_image());
        ctx.attachment = Some(MediaAttachment {
            mime_type: "image/png".into(),
            name: Some("a.png".into()),
            data: AttachmentData::Url("https://files.example/a.png".into()),
        });
        assert!(ctx.has_image());
    }

    #[test]
    fn trim_drops_oldest_first() {
        let mut turns = vec![
            Turn::user("a", "x".repeat(50)),
            Turn::user("b", "y".repeat(50)),
            Turn::user("c", "z".repeat(50)),
        ];
        trim_to_budget(&mut turns, 100);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].author_name, "b");
    }

    #[test]
    fn trim_keeps_newest_turn_even_if_oversized() {
        let mut turns = vec![Turn::user("a", "short"), Turn::user("b", "x".repeat(500))];
        trim_to_budget(&mut turns, 10);
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].author_name, "b");
    }

    #[test]
    fn trim_is_noop_within_budget() {
        let mut turns = vec![Turn::user("a", "hi")];
        trim_to_budget(&mut turns, 100);
        assert_eq!(turns.len(), 1);
    }
}
