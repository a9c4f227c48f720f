//! End-to-end scenario: answers flow through the journal and store, the
//! store is lost, recovery rebuilds it from journal plus chat history, and
//! the reconciler then repairs a stale rendered summary.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use muster_chat::{ChatError, ChatMessage, ChatThread, ChatTransport, HistoryPage};
use muster_core::JsonlRotationPolicy;
use muster_journal::{InteractionJournal, JournalEntry};
use muster_recovery::{RecoveryConfig, RecoveryEngine};
use muster_resilience::{BreakerConfig, RetryExecutor};
use muster_store::{
    BackupManager, Response, ResponseRecord, RosterStore, SqliteRosterStore, UserMapping,
};
use muster_sync::{Reconciler, ReconcilerConfig, StatusRenderer};

struct ScriptedTransport {
    channel: Vec<ChatMessage>,
    threads: Vec<(String, Vec<ChatMessage>)>,
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn fetch_history(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        _limit: usize,
    ) -> Result<HistoryPage, ChatError> {
        if cursor.is_some() {
            return Ok(HistoryPage::default());
        }
        let messages = self
            .threads
            .iter()
            .find(|(id, _)| id == channel_id)
            .map(|(_, messages)| messages.clone())
            .unwrap_or_else(|| self.channel.clone());
        Ok(HistoryPage {
            messages,
            next_cursor: None,
        })
    }

    async fn post_message(&self, _channel_id: &str, _text: &str) -> Result<ChatMessage, ChatError> {
        Err(ChatError::InvalidResponse("unused in tests".to_string()))
    }

    async fn edit_message(
        &self,
        _channel_id: &str,
        _message_id: &str,
        _text: &str,
    ) -> Result<(), ChatError> {
        Ok(())
    }

    async fn list_threads(
        &self,
        _channel_id: &str,
        _include_archived: bool,
    ) -> Result<Vec<ChatThread>, ChatError> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct RecordingRenderer {
    calls: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl StatusRenderer for RecordingRenderer {
    async fn update_status(&self, event_id: &str, thread_id: &str) -> Result<()> {
        self.calls
            .lock()
            .expect("renderer mutex")
            .push((event_id.to_string(), thread_id.to_string()));
        Ok(())
    }
}

fn bot_message(id: &str, channel: &str, text: &str) -> ChatMessage {
    ChatMessage {
        id: id.to_string(),
        channel_id: channel.to_string(),
        author_id: "bot-1".to_string(),
        author_display_name: "muster".to_string(),
        author_is_bot: true,
        text: text.to_string(),
        timestamp: Utc::now(),
        interaction_actor_id: None,
    }
}

fn mapping(chat_id: &str, name: &str, roster_id: &str) -> UserMapping {
    UserMapping {
        chat_id: chat_id.to_string(),
        display_name: name.to_string(),
        roster_id: roster_id.to_string(),
        skill_level: Some(7),
        elo: Some(1450),
        country: Some("de".to_string()),
        linked_at: Utc::now(),
    }
}

fn scripted_transport() -> ScriptedTransport {
    ScriptedTransport {
        channel: vec![ChatMessage {
            interaction_actor_id: Some("u1".to_string()),
            ..bot_message("c1", "channel-1", "Successfully linked **Alpha**.")
        }],
        threads: vec![(
            "thread-1".to_string(),
            vec![bot_message(
                "t1",
                "thread-1",
                "Attendance for event ev-1\nAttending: Alpha\nNot attending: none\nNo response: none",
            )],
        )],
    }
}

#[tokio::test]
async fn store_loss_recovery_and_render_repair() {
    let dir = TempDir::new().expect("tempdir");
    let rotation = JsonlRotationPolicy {
        max_bytes: 1024 * 1024,
        max_files: 3,
    };
    let journal = InteractionJournal::new(dir.path().join("journal.jsonl"), rotation);

    // Normal operation: a linked user answers yes; every mutation also
    // lands in the journal.
    let live_store = Arc::new(
        SqliteRosterStore::new(dir.path().join("live.sqlite")).expect("open live store"),
    );
    live_store
        .upsert_mapping(mapping("u1", "Alpha", "r-alpha"))
        .await
        .expect("link Alpha");
    live_store
        .upsert_response(ResponseRecord {
            event_id: "ev-1".to_string(),
            chat_id: "u1".to_string(),
            response: Response::Yes,
            display_name: "Alpha".to_string(),
            recorded_at: Utc::now(),
        })
        .await
        .expect("record answer");
    journal
        .append(&JournalEntry::response("u1", "Alpha", "ev-1", Response::Yes))
        .expect("journal answer");

    // The live database is lost; a fresh empty store takes its place with
    // only the thread index restored from configuration.
    let recovered_store = Arc::new(
        SqliteRosterStore::new(dir.path().join("recovered.sqlite")).expect("open fresh store"),
    );
    recovered_store
        .set_event_thread("ev-1", "thread-1")
        .await
        .expect("restore thread index");

    let executor = Arc::new(RetryExecutor::new(BreakerConfig::default()));
    let engine = RecoveryEngine::new(
        Arc::clone(&recovered_store) as Arc<dyn RosterStore>,
        Arc::new(scripted_transport()),
        InteractionJournal::new(dir.path().join("journal.jsonl"), rotation),
        Arc::clone(&executor),
        RecoveryConfig::default(),
    );

    let report = engine.run("channel-1", &[]).await;
    assert_eq!(report.errors, 0);
    // Journal restores the answer; the linking confirmation restores the
    // mapping the journal never carried.
    assert_eq!(report.recovered, 2);
    let restored = recovered_store
        .get_response("ev-1", "u1")
        .await
        .expect("lookup")
        .expect("answer restored");
    assert_eq!(restored.response, Response::Yes);
    assert!(recovered_store
        .get_mapping_by_chat_id("u1")
        .await
        .expect("lookup")
        .is_some());

    // Identical history on a second pass recovers nothing.
    let second_engine = RecoveryEngine::new(
        Arc::clone(&recovered_store) as Arc<dyn RosterStore>,
        Arc::new(scripted_transport()),
        InteractionJournal::new(dir.path().join("journal.jsonl"), rotation),
        Arc::clone(&executor),
        RecoveryConfig::default(),
    );
    let second = second_engine.run("channel-1", &[]).await;
    assert_eq!(second.recovered, 0);
    assert_eq!(second.errors, 0);
}

#[tokio::test]
async fn stale_render_after_recovery_is_corrected_once() {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(
        SqliteRosterStore::new(dir.path().join("roster.sqlite")).expect("open store"),
    );
    store
        .upsert_mapping(mapping("u1", "Alpha", "r-alpha"))
        .await
        .expect("link Alpha");
    store
        .upsert_mapping(mapping("u2", "Bravo", "r-bravo"))
        .await
        .expect("link Bravo");
    for (chat_id, name, response) in
        [("u1", "Alpha", Response::Yes), ("u2", "Bravo", Response::No)]
    {
        store
            .upsert_response(ResponseRecord {
                event_id: "ev-1".to_string(),
                chat_id: chat_id.to_string(),
                response,
                display_name: name.to_string(),
                recorded_at: Utc::now(),
            })
            .await
            .expect("record answer");
    }
    store
        .set_event_thread("ev-1", "thread-1")
        .await
        .expect("index thread");

    // The rendered summary predates Bravo's answer.
    let transport = ScriptedTransport {
        channel: Vec::new(),
        threads: vec![(
            "thread-1".to_string(),
            vec![bot_message(
                "t1",
                "thread-1",
                "Attendance\nAttending: Alpha\nNot attending: none\nNo response: Bravo",
            )],
        )],
    };
    let renderer = Arc::new(RecordingRenderer::default());
    let reconciler = Reconciler::new(
        Arc::clone(&store) as Arc<dyn RosterStore>,
        Arc::new(transport),
        Arc::clone(&renderer) as Arc<dyn StatusRenderer>,
        Arc::new(RetryExecutor::new(BreakerConfig::default())),
        ReconcilerConfig {
            batch_delay_ms: 1,
            ..ReconcilerConfig::default()
        },
    );

    let outcome = reconciler.reconcile("ev-1").await.expect("reconcile");
    assert!(outcome.report.had_mismatch);
    assert!(outcome.update_triggered);
    assert_eq!(
        renderer.calls.lock().expect("renderer mutex").as_slice(),
        &[("ev-1".to_string(), "thread-1".to_string())]
    );
}

#[tokio::test]
async fn snapshot_restore_returns_lost_answers() {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(
        SqliteRosterStore::new(dir.path().join("roster.sqlite")).expect("open store"),
    );
    store
        .upsert_mapping(mapping("u1", "Alpha", "r-alpha"))
        .await
        .expect("link Alpha");
    store
        .upsert_response(ResponseRecord {
            event_id: "ev-1".to_string(),
            chat_id: "u1".to_string(),
            response: Response::Yes,
            display_name: "Alpha".to_string(),
            recorded_at: Utc::now(),
        })
        .await
        .expect("record answer");

    let manager = BackupManager::new(
        Arc::clone(&store) as Arc<dyn RosterStore>,
        dir.path().join("backups"),
    );
    let snapshot = manager.create_snapshot("pre-wipe").await.expect("snapshot");

    store
        .clear_responses_for_event("ev-1")
        .await
        .expect("simulated wipe");
    assert!(store
        .get_response("ev-1", "u1")
        .await
        .expect("lookup")
        .is_none());

    manager.restore(&snapshot.path).await.expect("restore");
    let restored = store
        .get_response("ev-1", "u1")
        .await
        .expect("lookup")
        .expect("answer back after restore");
    assert_eq!(restored.display_name, "Alpha");
}
