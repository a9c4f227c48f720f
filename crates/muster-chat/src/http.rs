//! HTTP chat client used by reconciliation and recovery flows.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{ChatError, ChatMessage, ChatThread, ChatTransport, HistoryPage};

#[derive(Debug, Clone, Deserialize)]
struct WireAuthor {
    id: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct WireInteraction {
    actor_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WireMessage {
    id: String,
    channel_id: String,
    author: WireAuthor,
    #[serde(default)]
    content: String,
    timestamp: String,
    #[serde(default)]
    interaction: Option<WireInteraction>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireThread {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    archived: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct WireThreadPage {
    #[serde(default)]
    threads: Vec<WireThread>,
}

/// Thin REST client in the platform's channel/message dialect. Single-attempt
/// by design: retries and circuit breaking live in `muster-resilience`, which
/// wraps every call site.
#[derive(Clone)]
pub struct HttpChatClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl HttpChatClient {
    pub fn new(api_base: String, token: String, request_timeout_ms: u64) -> Result<Self, ChatError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("muster-bot"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
        })
    }

    async fn check_status(
        operation: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ChatError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after_ms = parse_retry_after_ms(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(ChatError::Status {
            operation: operation.to_string(),
            status: status.as_u16(),
            body: truncate_for_error(&body, 800),
            retry_after_ms,
        })
    }
}

#[async_trait::async_trait]
impl ChatTransport for HttpChatClient {
    async fn fetch_history(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage, ChatError> {
        let mut request = self
            .http
            .get(format!("{}/channels/{channel_id}/messages", self.api_base))
            .bearer_auth(&self.token)
            .query(&[("limit", limit.max(1).to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("before", cursor)]);
        }

        let response = Self::check_status("history", request.send().await?).await?;
        let wire_messages = response.json::<Vec<WireMessage>>().await?;
        debug!(
            channel_id,
            count = wire_messages.len(),
            "fetched history page"
        );

        let next_cursor = if wire_messages.len() < limit.max(1) {
            None
        } else {
            wire_messages.last().map(|message| message.id.clone())
        };
        let messages = wire_messages
            .into_iter()
            .map(wire_message_to_chat)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(HistoryPage {
            messages,
            next_cursor,
        })
    }

    async fn post_message(&self, channel_id: &str, text: &str) -> Result<ChatMessage, ChatError> {
        let response = self
            .http
            .post(format!("{}/channels/{channel_id}/messages", self.api_base))
            .bearer_auth(&self.token)
            .json(&json!({ "content": text }))
            .send()
            .await?;
        let response = Self::check_status("post", response).await?;
        let wire = response.json::<WireMessage>().await?;
        wire_message_to_chat(wire)
    }

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ChatError> {
        let response = self
            .http
            .patch(format!(
                "{}/channels/{channel_id}/messages/{message_id}",
                self.api_base
            ))
            .bearer_auth(&self.token)
            .json(&json!({ "content": text }))
            .send()
            .await?;
        Self::check_status("edit", response).await?;
        Ok(())
    }

    async fn list_threads(
        &self,
        channel_id: &str,
        include_archived: bool,
    ) -> Result<Vec<ChatThread>, ChatError> {
        let mut threads = Vec::new();
        let active = self
            .http
            .get(format!(
                "{}/channels/{channel_id}/threads/active",
                self.api_base
            ))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let active = Self::check_status("threads-active", active).await?;
        let page = active.json::<WireThreadPage>().await?;
        threads.extend(page.threads.into_iter().map(wire_thread_to_chat));

        if include_archived {
            let archived = self
                .http
                .get(format!(
                    "{}/channels/{channel_id}/threads/archived",
                    self.api_base
                ))
                .bearer_auth(&self.token)
                .send()
                .await?;
            let archived = Self::check_status("threads-archived", archived).await?;
            let page = archived.json::<WireThreadPage>().await?;
            threads.extend(page.threads.into_iter().map(|thread| ChatThread {
                archived: true,
                ..wire_thread_to_chat(thread)
            }));
        }
        Ok(threads)
    }
}

fn wire_message_to_chat(wire: WireMessage) -> Result<ChatMessage, ChatError> {
    let timestamp = DateTime::parse_from_rfc3339(&wire.timestamp)
        .map_err(|error| {
            ChatError::InvalidResponse(format!(
                "message {} has malformed timestamp '{}': {error}",
                wire.id, wire.timestamp
            ))
        })?
        .with_timezone(&Utc);
    Ok(ChatMessage {
        id: wire.id,
        channel_id: wire.channel_id,
        author_id: wire.author.id,
        author_display_name: wire.author.display_name,
        author_is_bot: wire.author.bot,
        text: wire.content,
        timestamp,
        interaction_actor_id: wire.interaction.map(|interaction| interaction.actor_id),
    })
}

fn wire_thread_to_chat(wire: WireThread) -> ChatThread {
    ChatThread {
        id: wire.id,
        name: wire.name,
        archived: wire.archived,
    }
}

fn parse_retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse::<u64>().ok().map(|seconds| seconds * 1_000)
}

fn truncate_for_error(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let truncated = body.chars().take(max_chars).collect::<String>();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::HttpChatClient;
    use crate::{ChatError, ChatTransport};

    fn message_json(id: &str, text: &str) -> serde_json::Value {
        json!({
            "id": id,
            "channel_id": "thread-7",
            "author": { "id": "bot-1", "display_name": "muster", "bot": true },
            "content": text,
            "timestamp": "2026-03-01T18:00:00Z",
        })
    }

    fn client(base_url: &str) -> HttpChatClient {
        HttpChatClient::new(base_url.to_string(), "token".to_string(), 2_000).expect("client")
    }

    #[tokio::test]
    async fn fetch_history_maps_messages_and_cursor() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/channels/thread-7/messages")
                .query_param("limit", "2");
            then.status(200)
                .json_body(json!([message_json("m2", "newest"), message_json("m1", "older")]));
        });

        let page = client(&server.base_url())
            .fetch_history("thread-7", None, 2)
            .await
            .expect("history");
        mock.assert();

        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.messages[0].id, "m2");
        assert!(page.messages[0].author_is_bot);
        assert_eq!(page.next_cursor.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn short_page_ends_pagination() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/channels/thread-7/messages");
            then.status(200).json_body(json!([message_json("m1", "only")]));
        });

        let page = client(&server.base_url())
            .fetch_history("thread-7", None, 50)
            .await
            .expect("history");
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn rate_limit_surfaces_status_and_retry_after() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/channels/thread-7/messages");
            then.status(429)
                .header("retry-after", "2")
                .body("slow down");
        });

        let error = client(&server.base_url())
            .post_message("thread-7", "status")
            .await
            .expect_err("rate limited");
        match error {
            ChatError::Status {
                status,
                retry_after_ms,
                ..
            } => {
                assert_eq!(status, 429);
                assert_eq!(retry_after_ms, Some(2_000));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_threads_merges_archived_pages() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/channels/guild-1/threads/active");
            then.status(200).json_body(json!({
                "threads": [{ "id": "t-1", "name": "match 101", "archived": false }]
            }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/channels/guild-1/threads/archived");
            then.status(200).json_body(json!({
                "threads": [{ "id": "t-0", "name": "match 100" }]
            }));
        });

        let threads = client(&server.base_url())
            .list_threads("guild-1", true)
            .await
            .expect("threads");
        assert_eq!(threads.len(), 2);
        assert!(!threads[0].archived);
        assert!(threads[1].archived, "archived listing forces the flag");
    }

    #[tokio::test]
    async fn malformed_timestamp_is_invalid_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/channels/thread-7/messages");
            then.status(200).json_body(json!([{
                "id": "m1",
                "channel_id": "thread-7",
                "author": { "id": "u1" },
                "content": "hi",
                "timestamp": "not-a-time",
            }]));
        });

        let error = client(&server.base_url())
            .fetch_history("thread-7", None, 10)
            .await
            .expect_err("bad timestamp");
        assert!(matches!(error, ChatError::InvalidResponse(_)));
    }
}
