//! Slack Web API client.
//!
//! Implements `ResponseSink`, `ContextLoader` and `AssetFetcher` over plain
//! reqwest calls to `https://slack.com/api`.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::channels::{AssetFetcher, ContextLoader, MessageRef, ResponseSink, ThreadRef};
use crate::context::{Turn, trim_to_budget};
use crate::error::ChannelError;

const CHANNEL_NAME: &str = "slack";
const DEFAULT_BASE_URL: &str = "https://slack.com/api";
const REPLIES_LIMIT: &str = "200";
/// Upper bound on `conversations.replies` pages read for one thread.
const MAX_REPLY_PAGES: usize = 25;

/// Hosts that receive the bot token on downloads.
const SLACK_FILE_HOSTS: &[&str] = &["files.slack.com", "slack.com", "slack-files.com"];

/// Slack Web API client.
pub struct SlackClient {
    token: SecretString,
    client: reqwest::Client,
    base_url: String,
    /// Character budget for loaded thread context.
    max_context_chars: usize,
    user_names: RwLock<HashMap<String, String>>,
}

impl SlackClient {
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_context_chars: 4000,
            user_names: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_context_budget(mut self, max_chars: usize) -> Self {
        self.max_context_chars = max_chars;
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url.trim_end_matches('/'))
    }

    /// POST a JSON body to a Web API method and return the decoded payload.
    async fn call_json(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .bearer_auth(self.token.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;
        check_ok(method, resp).await
    }

    /// GET a Web API method with query arguments.
    async fn call_query(
        &self,
        method: &str,
        query: &[(&str, &str)],
    ) -> Result<serde_json::Value, ChannelError> {
        let resp = self
            .client
            .get(self.api_url(method))
            .bearer_auth(self.token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;
        check_ok(method, resp).await
    }

    /// Resolve a user's display name, caching hits.
    pub async fn user_display_name(&self, user_id: &str) -> String {
        if let Some(name) = self.user_names.read().await.get(user_id) {
            return name.clone();
        }

        let name = match self.call_query("users.info", &[("user", user_id)]).await {
            Ok(payload) => serde_json::from_value::<UserInfoResponse>(payload)
                .ok()
                .and_then(|r| r.user.best_name())
                .unwrap_or_else(|| user_id.to_string()),
            Err(e) => {
                warn!(user_id, error = %e, "users.info failed; using raw id");
                return user_id.to_string();
            }
        };

        self.user_names
            .write()
            .await
            .insert(user_id.to_string(), name.clone());
        name
    }

    /// Read every reply in a thread, following `next_cursor` until Slack
    /// stops returning one or `MAX_REPLY_PAGES` is reached.
    async fn fetch_replies(
        &self,
        channel: &str,
        thread_ts: &str,
    ) -> Result<Vec<SlackMessage>, ChannelError> {
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;

        for page in 1..=MAX_REPLY_PAGES {
            let mut query = vec![("channel", channel), ("ts", thread_ts), ("limit", REPLIES_LIMIT)];
            if let Some(ref cursor) = cursor {
                query.push(("cursor", cursor.as_str()));
            }
            let payload = self.call_query("conversations.replies", &query).await?;
            let parsed: RepliesResponse =
                serde_json::from_value(payload).map_err(|e| ChannelError::Api {
                    method: "conversations.replies".into(),
                    error: e.to_string(),
                })?;

            let next = parsed.next_cursor().map(str::to_string);
            messages.extend(parsed.messages);
            match next {
                Some(next) if page < MAX_REPLY_PAGES => cursor = Some(next),
                Some(_) => {
                    warn!(channel, thread_ts, pages = page, "Thread has more replies than the page cap");
                    break;
                }
                None => break,
            }
        }

        debug!(channel, thread_ts, messages = messages.len(), "Fetched thread replies");
        Ok(messages)
    }

    async fn render_reactions(&self, reactions: &[Reaction]) -> Option<String> {
        let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
        for reaction in reactions {
            let name = normalize_reaction_name(&reaction.name);
            let mut users = Vec::with_capacity(reaction.users.len());
            for user in &reaction.users {
                users.push(self.user_display_name(user).await);
            }
            match grouped.iter_mut().find(|(n, _)| *n == name) {
                Some((_, existing)) => existing.extend(users),
                None => grouped.push((name, users)),
            }
        }
        if grouped.is_empty() {
            return None;
        }
        Some(
            grouped
                .into_iter()
                .map(|(name, users)| format!("{name} {}", users.join(",")))
                .collect::<Vec<_>>()
                .join(" "),
        )
    }
}

async fn check_ok(method: &str, resp: reqwest::Response) -> Result<serde_json::Value, ChannelError> {
    let status = resp.status();
    let payload: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| ChannelError::Http(format!("{method}: HTTP {status}: {e}")))?;
    if payload.get("ok").and_then(|v| v.as_bool()) == Some(true) {
        return Ok(payload);
    }
    let error = payload
        .get("error")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown_error")
        .to_string();
    Err(ChannelError::Api {
        method: method.to_string(),
        error,
    })
}

#[async_trait]
impl ResponseSink for SlackClient {
    async fn post(&self, thread: &ThreadRef, text: &str) -> Result<MessageRef, ChannelError> {
        let mut body = serde_json::json!({
            "channel": thread.channel,
            "text": to_slack_markdown(text),
        });
        if let Some(ref ts) = thread.thread_ts {
            body["thread_ts"] = serde_json::Value::String(ts.clone());
        }

        let payload = self
            .call_json("chat.postMessage", &body)
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: CHANNEL_NAME.into(),
                reason: e.to_string(),
            })?;
        let ts = payload
            .get("ts")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ChannelError::SendFailed {
                name: CHANNEL_NAME.into(),
                reason: "chat.postMessage response has no ts".into(),
            })?;

        Ok(MessageRef {
            channel: thread.channel.clone(),
            ts: ts.to_string(),
        })
    }

    async fn update(&self, message: &MessageRef, text: &str) -> Result<(), ChannelError> {
        let body = serde_json::json!({
            "channel": message.channel,
            "ts": message.ts,
            "text": to_slack_markdown(text),
        });
        self.call_json("chat.update", &body)
            .await
            .map_err(|e| ChannelError::UpdateFailed {
                name: CHANNEL_NAME.into(),
                message_id: message.ts.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn upload(
        &self,
        thread: &ThreadRef,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<(), ChannelError> {
        let upload_err = |reason: String| ChannelError::UploadFailed {
            name: CHANNEL_NAME.into(),
            filename: filename.to_string(),
            reason,
        };

        let length = bytes.len().to_string();
        let ticket: UploadTicket = self
            .call_query(
                "files.getUploadURLExternal",
                &[("filename", filename), ("length", &length)],
            )
            .await
            .and_then(|payload| {
                serde_json::from_value(payload).map_err(|e| ChannelError::Api {
                    method: "files.getUploadURLExternal".into(),
                    error: e.to_string(),
                })
            })
            .map_err(|e| upload_err(e.to_string()))?;

        let part = Part::bytes(bytes).file_name(filename.to_string());
        let resp = self
            .client
            .post(&ticket.upload_url)
            .multipart(Form::new().part("file", part))
            .send()
            .await
            .map_err(|e| upload_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(upload_err(format!("upload URL returned {}", resp.status())));
        }

        let mut body = serde_json::json!({
            "files": [{ "id": ticket.file_id, "title": filename }],
            "channel_id": thread.channel,
        });
        if let Some(ref ts) = thread.thread_ts {
            body["thread_ts"] = serde_json::Value::String(ts.clone());
        }
        self.call_json("files.completeUploadExternal", &body)
            .await
            .map_err(|e| upload_err(e.to_string()))?;

        debug!(filename, file_id = %ticket.file_id, "Uploaded file to Slack");
        Ok(())
    }
}

#[async_trait]
impl ContextLoader for SlackClient {
    async fn load(&self, channel: &str, thread_ts: &str, exclude_message_id: &str) -> Vec<Turn> {
        let messages = match self.fetch_replies(channel, thread_ts).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(channel, thread_ts, error = %e, "Failed to load thread context");
                return Vec::new();
            }
        };

        let selected = select_thread_messages(messages, thread_ts, exclude_message_id);
        let mut turns = Vec::with_capacity(selected.len());
        for (i, message) in selected.iter().enumerate() {
            let mut turn = if message.bot_id.is_some() {
                Turn::assistant(message.text.clone())
            } else {
                let author = match message.user {
                    Some(ref user) => self.user_display_name(user).await,
                    None => "unknown".to_string(),
                };
                Turn::user(author, message.text.clone())
            };
            if i == 0 && !message.reactions.is_empty() {
                turn.reactions = self.render_reactions(&message.reactions).await;
            }
            turns.push(turn);
        }

        trim_to_budget(&mut turns, self.max_context_chars);
        debug!(channel, thread_ts, turns = turns.len(), "Loaded thread context");
        turns
    }

    async fn display_name(&self, user_id: &str) -> String {
        self.user_display_name(user_id).await
    }
}

#[async_trait]
impl AssetFetcher for SlackClient {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ChannelError> {
        let mut req = self.client.get(url);
        if is_slack_file_url(url) {
            req = req.bearer_auth(self.token.expose_secret());
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ChannelError::Http(format!(
                "download returned {}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Slack mrkdwn uses single asterisks for bold.
pub fn to_slack_markdown(text: &str) -> String {
    text.replace("**", "*")
}

/// Drop the thread parent and the triggering message; keep Slack's
/// oldest-first order.
fn select_thread_messages(
    messages: Vec<SlackMessage>,
    thread_ts: &str,
    exclude_message_id: &str,
) -> Vec<SlackMessage> {
    messages
        .into_iter()
        .filter(|m| m.ts != thread_ts)
        .filter(|m| {
            m.ts != exclude_message_id && m.client_msg_id.as_deref() != Some(exclude_message_id)
        })
        .collect()
}

/// `thumbsup::skin-tone-2` → `:thumbsup:`
fn normalize_reaction_name(name: &str) -> String {
    let base = name.split(':').next().unwrap_or(name);
    format!(":{base}:")
}

fn is_slack_file_url(url: &str) -> bool {
    let Some(rest) = url.strip_prefix("https://") else {
        return false;
    };
    let host = rest.split(['/', '?']).next().unwrap_or_default();
    SLACK_FILE_HOSTS
        .iter()
        .any(|h| host == *h || host.ends_with(&format!(".{h}")))
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct SlackMessage {
    ts: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    client_msg_id: Option<String>,
    #[serde(default)]
    reactions: Vec<Reaction>,
}

#[derive(Debug, Clone, Deserialize)]
struct Reaction {
    name: String,
    #[serde(default)]
    users: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RepliesResponse {
    #[serde(default)]
    messages: Vec<SlackMessage>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

impl RepliesResponse {
    /// Cursor for the next page; Slack sends an empty string on the last one.
    fn next_cursor(&self) -> Option<&str> {
        self.response_metadata
            .as_ref()
            .map(|m| m.next_cursor.as_str())
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: String,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    user: SlackUser,
}

#[derive(Debug, Deserialize)]
struct SlackUser {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    real_name: Option<String>,
    #[serde(default)]
    profile: Option<SlackProfile>,
}

#[derive(Debug, Deserialize)]
struct SlackProfile {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    real_name: Option<String>,
}

impl SlackUser {
    fn best_name(self) -> Option<String> {
        let (display, profile_real) = match self.profile {
            Some(p) => (p.display_name, p.real_name),
            None => (None, None),
        };
        [display, profile_real, self.real_name, self.name]
            .into_iter()
            .flatten()
            .find(|n| !n.trim().is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct UploadTicket {
    upload_url: String,
    file_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(ts: &str, text: &str) -> SlackMessage {
        SlackMessage {
            ts: ts.into(),
            user: Some("U1".into()),
            bot_id: None,
            text: text.into(),
            client_msg_id: None,
            reactions: Vec::new(),
        }
    }

    #[test]
    fn bold_is_converted() {
        assert_eq!(to_slack_markdown("**done** and **ok**"), "*done* and *ok*");
    }

    #[test]
    fn api_url_joins_method() {
        let client = SlackClient::new(SecretString::from("xoxb"))
            .with_base_url("http://localhost:9999/api/");
        assert_eq!(
            client.api_url("chat.postMessage"),
            "http://localhost:9999/api/chat.postMessage"
        );
    }

    #[test]
    fn selection_drops_parent_and_trigger() {
        let mut trigger = message("1700000005.000", "요약해줘");
        trigger.client_msg_id = Some("abc-123".into());
        let messages = vec![
            message("1700000000.000", "parent"),
            message("1700000001.000", "first"),
            message("1700000002.000", "second"),
            trigger,
        ];
        let selected = select_thread_messages(messages, "1700000000.000", "abc-123");
        let texts: Vec<_> = selected.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[test]
    fn selection_can_exclude_by_ts() {
        let messages = vec![
            message("1.0", "parent"),
            message("2.0", "keep"),
            message("3.0", "trigger"),
        ];
        let selected = select_thread_messages(messages, "1.0", "3.0");
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].text, "keep");
    }

    #[test]
    fn reaction_names_drop_skin_tone() {
        assert_eq!(normalize_reaction_name("thumbsup::skin-tone-2"), ":thumbsup:");
        assert_eq!(normalize_reaction_name("eyes"), ":eyes:");
    }

    #[test]
    fn token_only_sent_to_slack_hosts() {
        assert!(is_slack_file_url(
            "https://files.slack.com/files-pri/T1-F1/image.png"
        ));
        assert!(!is_slack_file_url(
            "https://oaidalleapiprodscus.blob.core.windows.net/private/img.png"
        ));
        assert!(!is_slack_file_url("https://files.slack.com.evil.example/x"));
        assert!(!is_slack_file_url("http://files.slack.com/x"));
    }

    #[test]
    fn best_name_prefers_display_name() {
        let raw = r#"{"user":{"name":"minji.k","real_name":"Kim Minji","profile":{"display_name":"Minji","real_name":"Kim Minji"}}}"#;
        let parsed: UserInfoResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.user.best_name().as_deref(), Some("Minji"));
    }

    #[test]
    fn best_name_skips_blank_display_name() {
        let raw = r#"{"user":{"name":"minji.k","profile":{"display_name":"","real_name":"Kim Minji"}}}"#;
        let parsed: UserInfoResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.user.best_name().as_deref(), Some("Kim Minji"));
    }

    #[test]
    fn replies_parse_bot_and_reactions() {
        let raw = r#"{"ok":true,"messages":[
            {"ts":"1.0","user":"U1","text":"parent","reactions":[{"name":"eyes","users":["U2"],"count":1}]},
            {"ts":"2.0","bot_id":"B1","text":"answer"}
        ]}"#;
        let parsed: RepliesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.messages.len(), 2);
        assert_eq!(parsed.messages[0].reactions[0].users, vec!["U2".to_string()]);
        assert!(parsed.messages[1].bot_id.is_some());
    }

    #[test]
    fn replies_expose_next_cursor() {
        let raw = r#"{"ok":true,"has_more":true,"messages":[{"ts":"1.0","text":"a"}],
            "response_metadata":{"next_cursor":"bmV4dF90czoxNTEyMDg1ODYxMDAwNTQz"}}"#;
        let parsed: RepliesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.next_cursor(), Some("bmV4dF90czoxNTEyMDg1ODYxMDAwNTQz"));
    }

    #[test]
    fn last_replies_page_has_no_cursor() {
        let last: RepliesResponse = serde_json::from_str(
            r#"{"ok":true,"messages":[],"response_metadata":{"next_cursor":""}}"#,
        )
        .unwrap();
        assert_eq!(last.next_cursor(), None);

        let bare: RepliesResponse = serde_json::from_str(r#"{"ok":true,"messages":[]}"#).unwrap();
        assert_eq!(bare.next_cursor(), None);
    }
}
