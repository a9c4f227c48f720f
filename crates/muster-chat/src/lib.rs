//! Chat-platform collaborator: message/thread shapes, the [`ChatTransport`]
//! seam every consumer depends on, and an HTTP implementation.
//!
//! Muster never interprets presentation content; it only needs message text,
//! authorship, and the interaction actor attached to bot confirmations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use muster_resilience::{classify_status, Classification, ClassifyFn, ErrorClass};

mod http;

pub use http::HttpChatClient;

/// One message as seen by the extractor and recovery scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_display_name: String,
    pub author_is_bot: bool,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Chat id of the user whose interaction produced this bot message, when
    /// the platform still carries that context. Identity recovery refuses to
    /// infer an actor from display text, so this field is the only accepted
    /// source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_actor_id: Option<String>,
}

/// A discussion thread attached to an event announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatThread {
    pub id: String,
    pub name: String,
    pub archived: bool,
}

/// One page of newest-first history plus the cursor for the next page.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub messages: Vec<ChatMessage>,
    pub next_cursor: Option<String>,
}

/// Errors surfaced by chat transports.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat api {operation} failed with status {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
        retry_after_ms: Option<u64>,
    },
    #[error("invalid chat api response: {0}")]
    InvalidResponse(String),
}

/// Maps a [`ChatError`] onto the retry taxonomy.
pub fn chat_error_class(error: &ChatError) -> ErrorClass {
    match error {
        ChatError::Http(inner)
            if inner.is_timeout() || inner.is_connect() || inner.is_request() || inner.is_body() =>
        {
            ErrorClass::TransientNetwork
        }
        ChatError::Http(_) => ErrorClass::Permanent,
        ChatError::Status { status, .. } => classify_status(*status),
        ChatError::InvalidResponse(_) => ErrorClass::Permanent,
    }
}

/// Classifier for executor-wrapped chat calls. Errors that are not
/// [`ChatError`] (for example the executor's own timeout) count as transient.
/// A `retry-after` header parsed off a status error travels along as the
/// delay floor.
pub fn chat_classifier() -> ClassifyFn {
    Arc::new(|error| match error.downcast_ref::<ChatError>() {
        Some(chat_error) => Classification {
            class: chat_error_class(chat_error),
            retry_after_ms: match chat_error {
                ChatError::Status { retry_after_ms, .. } => *retry_after_ms,
                _ => None,
            },
        },
        None => ErrorClass::TransientNetwork.into(),
    })
}

/// Platform seam consumed by the extractor, reconciler, and recovery engine.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Fetches one page of history, newest first. `cursor` is the id of the
    /// oldest message already seen; `None` starts from the newest.
    async fn fetch_history(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage, ChatError>;

    async fn post_message(&self, channel_id: &str, text: &str) -> Result<ChatMessage, ChatError>;

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ChatError>;

    /// Enumerates threads under a channel, optionally including archived ones.
    async fn list_threads(
        &self,
        channel_id: &str,
        include_archived: bool,
    ) -> Result<Vec<ChatThread>, ChatError>;
}
