//! SQLite-backed [`RosterStore`] implementation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{Response, ResponseRecord, RosterStore, StoreError, StoreResult, UserMapping};

/// Persistent store backing the reconciler and recovery engine.
#[derive(Debug)]
pub struct SqliteRosterStore {
    db_path: PathBuf,
}

impl SqliteRosterStore {
    /// Opens (or creates) the store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS user_mappings (
                chat_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                roster_id TEXT NOT NULL UNIQUE,
                skill_level INTEGER NULL,
                elo INTEGER NULL,
                country TEXT NULL,
                linked_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS response_records (
                event_id TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                response TEXT NOT NULL,
                display_name TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (event_id, chat_id)
            );

            CREATE INDEX IF NOT EXISTS idx_responses_event
                ON response_records (event_id);

            CREATE TABLE IF NOT EXISTS event_threads (
                event_id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL UNIQUE
            );
            "#,
        )?;
        Ok(())
    }
}

#[async_trait]
impl RosterStore for SqliteRosterStore {
    async fn upsert_mapping(&self, mapping: UserMapping) -> StoreResult<()> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;

        // Bijection guard: a roster id may move only together with its chat id.
        let holder: Option<String> = transaction
            .query_row(
                "SELECT chat_id FROM user_mappings WHERE roster_id = ?1",
                params![mapping.roster_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(holder) = holder {
            if holder != mapping.chat_id {
                return Err(StoreError::RosterIdTaken(mapping.roster_id));
            }
        }

        transaction.execute(
            r#"
            INSERT INTO user_mappings (
                chat_id, display_name, roster_id, skill_level, elo, country, linked_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(chat_id) DO UPDATE SET
                display_name = excluded.display_name,
                roster_id = excluded.roster_id,
                skill_level = excluded.skill_level,
                elo = excluded.elo,
                country = excluded.country,
                linked_at = excluded.linked_at
            "#,
            params![
                mapping.chat_id,
                mapping.display_name,
                mapping.roster_id,
                mapping.skill_level,
                mapping.elo,
                mapping.country,
                timestamp_to_db(mapping.linked_at),
            ],
        )?;
        transaction.commit()?;
        Ok(())
    }

    async fn insert_mapping_if_absent(&self, mapping: UserMapping) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let inserted = connection.execute(
            r#"
            INSERT OR IGNORE INTO user_mappings (
                chat_id, display_name, roster_id, skill_level, elo, country, linked_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                mapping.chat_id,
                mapping.display_name,
                mapping.roster_id,
                mapping.skill_level,
                mapping.elo,
                mapping.country,
                timestamp_to_db(mapping.linked_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    async fn get_mapping_by_chat_id(&self, chat_id: &str) -> StoreResult<Option<UserMapping>> {
        let connection = self.open_connection()?;
        query_mapping(
            &connection,
            "SELECT chat_id, display_name, roster_id, skill_level, elo, country, linked_at
             FROM user_mappings WHERE chat_id = ?1",
            chat_id,
        )
    }

    async fn get_mapping_by_roster_id(&self, roster_id: &str) -> StoreResult<Option<UserMapping>> {
        let connection = self.open_connection()?;
        query_mapping(
            &connection,
            "SELECT chat_id, display_name, roster_id, skill_level, elo, country, linked_at
             FROM user_mappings WHERE roster_id = ?1",
            roster_id,
        )
    }

    async fn list_mappings(&self) -> StoreResult<Vec<UserMapping>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT chat_id, display_name, roster_id, skill_level, elo, country, linked_at
             FROM user_mappings ORDER BY chat_id ASC",
        )?;
        let mut rows = statement.query([])?;
        let mut mappings = Vec::new();
        while let Some(row) = rows.next()? {
            mappings.push(mapping_from_row(row)?);
        }
        Ok(mappings)
    }

    async fn clear_mappings(&self) -> StoreResult<usize> {
        let connection = self.open_connection()?;
        Ok(connection.execute("DELETE FROM user_mappings", [])?)
    }

    async fn upsert_response(&self, record: ResponseRecord) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO response_records (event_id, chat_id, response, display_name, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(event_id, chat_id) DO UPDATE SET
                response = excluded.response,
                display_name = excluded.display_name,
                recorded_at = excluded.recorded_at
            "#,
            params![
                record.event_id,
                record.chat_id,
                response_to_db(record.response),
                record.display_name,
                timestamp_to_db(record.recorded_at),
            ],
        )?;
        Ok(())
    }

    async fn insert_response_if_absent(&self, record: ResponseRecord) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let inserted = connection.execute(
            r#"
            INSERT OR IGNORE INTO response_records
                (event_id, chat_id, response, display_name, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.event_id,
                record.chat_id,
                response_to_db(record.response),
                record.display_name,
                timestamp_to_db(record.recorded_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    async fn get_response(
        &self,
        event_id: &str,
        chat_id: &str,
    ) -> StoreResult<Option<ResponseRecord>> {
        let connection = self.open_connection()?;
        connection
            .query_row(
                "SELECT event_id, chat_id, response, display_name, recorded_at
                 FROM response_records WHERE event_id = ?1 AND chat_id = ?2",
                params![event_id, chat_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?
            .map(response_from_columns)
            .transpose()
    }

    async fn list_responses_for_event(&self, event_id: &str) -> StoreResult<Vec<ResponseRecord>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT event_id, chat_id, response, display_name, recorded_at
             FROM response_records WHERE event_id = ?1 ORDER BY chat_id ASC",
        )?;
        let mut rows = statement.query(params![event_id])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(response_from_columns((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))?);
        }
        Ok(records)
    }

    async fn clear_responses_for_event(&self, event_id: &str) -> StoreResult<usize> {
        let connection = self.open_connection()?;
        Ok(connection.execute(
            "DELETE FROM response_records WHERE event_id = ?1",
            params![event_id],
        )?)
    }

    async fn set_event_thread(&self, event_id: &str, thread_id: &str) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO event_threads (event_id, thread_id) VALUES (?1, ?2)
            ON CONFLICT(event_id) DO UPDATE SET thread_id = excluded.thread_id
            "#,
            params![event_id, thread_id],
        )?;
        Ok(())
    }

    async fn get_event_thread(&self, event_id: &str) -> StoreResult<Option<String>> {
        let connection = self.open_connection()?;
        Ok(connection
            .query_row(
                "SELECT thread_id FROM event_threads WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    async fn list_event_threads(&self) -> StoreResult<Vec<(String, String)>> {
        let connection = self.open_connection()?;
        let mut statement = connection
            .prepare("SELECT event_id, thread_id FROM event_threads ORDER BY event_id ASC")?;
        let mut rows = statement.query([])?;
        let mut pairs = Vec::new();
        while let Some(row) = rows.next()? {
            pairs.push((row.get(0)?, row.get(1)?));
        }
        Ok(pairs)
    }

    async fn clear_event_threads(&self) -> StoreResult<usize> {
        let connection = self.open_connection()?;
        Ok(connection.execute("DELETE FROM event_threads", [])?)
    }

    async fn export_snapshot(&self, destination: &Path) -> StoreResult<()> {
        let destination_str = destination
            .to_str()
            .ok_or_else(|| StoreError::SnapshotExport("non-utf8 destination path".to_string()))?;
        if destination.exists() {
            return Err(StoreError::SnapshotExport(format!(
                "destination {destination_str} already exists"
            )));
        }
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let connection = self.open_connection()?;
        connection
            .execute("VACUUM INTO ?1", params![destination_str])
            .map_err(|error| StoreError::SnapshotExport(error.to_string()))?;
        Ok(())
    }

    fn backing_file(&self) -> &Path {
        &self.db_path
    }
}

fn query_mapping(
    connection: &Connection,
    sql: &str,
    key: &str,
) -> StoreResult<Option<UserMapping>> {
    let mut statement = connection.prepare(sql)?;
    let mut rows = statement.query(params![key])?;
    match rows.next()? {
        Some(row) => Ok(Some(mapping_from_row(row)?)),
        None => Ok(None),
    }
}

fn mapping_from_row(row: &rusqlite::Row<'_>) -> StoreResult<UserMapping> {
    Ok(UserMapping {
        chat_id: row.get(0)?,
        display_name: row.get(1)?,
        roster_id: row.get(2)?,
        skill_level: row.get(3)?,
        elo: row.get(4)?,
        country: row.get(5)?,
        linked_at: timestamp_from_db(&row.get::<_, String>(6)?)?,
    })
}

fn response_from_columns(
    (event_id, chat_id, response, display_name, recorded_at): (
        String,
        String,
        String,
        String,
        String,
    ),
) -> StoreResult<ResponseRecord> {
    Ok(ResponseRecord {
        event_id,
        chat_id,
        response: response_from_db(&response)?,
        display_name,
        recorded_at: timestamp_from_db(&recorded_at)?,
    })
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn response_to_db(response: Response) -> &'static str {
    match response {
        Response::Yes => "yes",
        Response::No => "no",
    }
}

fn response_from_db(value: &str) -> StoreResult<Response> {
    match value {
        "yes" => Ok(Response::Yes),
        "no" => Ok(Response::No),
        _ => Err(StoreError::InvalidPersistedValue {
            field: "response",
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::tempdir;

    use super::SqliteRosterStore;
    use crate::{Response, ResponseRecord, RosterStore, StoreError, UserMapping};

    fn mapping(chat_id: &str, roster_id: &str) -> UserMapping {
        UserMapping {
            chat_id: chat_id.to_string(),
            display_name: format!("{chat_id}-name"),
            roster_id: roster_id.to_string(),
            skill_level: Some(7),
            elo: Some(1_432),
            country: Some("fi".to_string()),
            linked_at: Utc::now(),
        }
    }

    fn record(event_id: &str, chat_id: &str, response: Response) -> ResponseRecord {
        ResponseRecord {
            event_id: event_id.to_string(),
            chat_id: chat_id.to_string(),
            response,
            display_name: format!("{chat_id}-name"),
            recorded_at: Utc::now(),
        }
    }

    fn test_store() -> (tempfile::TempDir, SqliteRosterStore) {
        let temp = tempdir().expect("tempdir");
        let store = SqliteRosterStore::new(temp.path().join("muster.sqlite")).expect("store");
        (temp, store)
    }

    #[tokio::test]
    async fn mapping_bijection_rejects_reused_roster_id() {
        let (_temp, store) = test_store();
        store.upsert_mapping(mapping("chat-a", "roster-1")).await.expect("first link");

        let error = store
            .upsert_mapping(mapping("chat-b", "roster-1"))
            .await
            .expect_err("roster id already linked");
        assert!(matches!(error, StoreError::RosterIdTaken(id) if id == "roster-1"));

        // Same chat account may refresh its own link.
        store.upsert_mapping(mapping("chat-a", "roster-1")).await.expect("relink");
    }

    #[tokio::test]
    async fn insert_mapping_if_absent_never_overwrites() {
        let (_temp, store) = test_store();
        assert!(store
            .insert_mapping_if_absent(mapping("chat-a", "roster-1"))
            .await
            .expect("insert"));

        let mut changed = mapping("chat-a", "roster-2");
        changed.display_name = "imposter".to_string();
        assert!(!store
            .insert_mapping_if_absent(changed)
            .await
            .expect("ignored"));

        let kept = store
            .get_mapping_by_chat_id("chat-a")
            .await
            .expect("lookup")
            .expect("mapping exists");
        assert_eq!(kept.roster_id, "roster-1");
        assert_eq!(kept.display_name, "chat-a-name");
    }

    #[tokio::test]
    async fn responses_are_last_write_wins_on_the_normal_path() {
        let (_temp, store) = test_store();
        store
            .upsert_response(record("event-1", "chat-a", Response::Yes))
            .await
            .expect("yes");
        store
            .upsert_response(record("event-1", "chat-a", Response::No))
            .await
            .expect("changed to no");

        let stored = store
            .get_response("event-1", "chat-a")
            .await
            .expect("lookup")
            .expect("record exists");
        assert_eq!(stored.response, Response::No);

        assert!(!store
            .insert_response_if_absent(record("event-1", "chat-a", Response::Yes))
            .await
            .expect("recovery path must not overwrite"));
    }

    #[tokio::test]
    async fn event_thread_index_keeps_one_thread_per_event() {
        let (_temp, store) = test_store();
        store.set_event_thread("event-1", "thread-1").await.expect("set");
        store.set_event_thread("event-1", "thread-2").await.expect("replace");

        assert_eq!(
            store.get_event_thread("event-1").await.expect("lookup"),
            Some("thread-2".to_string())
        );
        assert_eq!(store.list_event_threads().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn clear_operations_report_removed_rows() {
        let (_temp, store) = test_store();
        store.upsert_mapping(mapping("chat-a", "roster-1")).await.expect("map");
        store
            .upsert_response(record("event-1", "chat-a", Response::Yes))
            .await
            .expect("respond");
        store
            .upsert_response(record("event-2", "chat-a", Response::Yes))
            .await
            .expect("respond other event");
        store.set_event_thread("event-1", "thread-1").await.expect("thread");

        assert_eq!(store.clear_responses_for_event("event-1").await.expect("clear"), 1);
        assert_eq!(
            store.list_responses_for_event("event-2").await.expect("survivors").len(),
            1
        );
        assert_eq!(store.clear_mappings().await.expect("clear mappings"), 1);
        assert_eq!(store.clear_event_threads().await.expect("clear threads"), 1);
    }

    #[tokio::test]
    async fn store_persists_across_reopen() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("muster.sqlite");
        {
            let store = SqliteRosterStore::new(&db_path).expect("store");
            store.upsert_mapping(mapping("chat-a", "roster-1")).await.expect("map");
            store
                .upsert_response(record("event-1", "chat-a", Response::Yes))
                .await
                .expect("respond");
        }

        let reopened = SqliteRosterStore::new(&db_path).expect("reopen");
        assert_eq!(reopened.list_mappings().await.expect("mappings").len(), 1);
        assert_eq!(
            reopened
                .list_responses_for_event("event-1")
                .await
                .expect("responses")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn export_snapshot_produces_openable_copy() {
        let (_temp, store) = test_store();
        store.upsert_mapping(mapping("chat-a", "roster-1")).await.expect("map");

        let dest_dir = tempdir().expect("dest dir");
        let dest = dest_dir.path().join("snapshot.sqlite");
        store.export_snapshot(&dest).await.expect("export");

        let copy = SqliteRosterStore::new(&dest).expect("open snapshot");
        assert_eq!(copy.list_mappings().await.expect("mappings").len(), 1);

        let error = store.export_snapshot(&dest).await.expect_err("no clobber");
        assert!(matches!(error, StoreError::SnapshotExport(_)));
    }
}
