//! Snapshot/backup manager for the store's backing file.
//!
//! Snapshots go through the storage engine's atomic export primitive; a raw
//! file copy is only an explicit fallback when the export fails. Restore is
//! always preceded by a safety snapshot of the current state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::{RosterStore, StoreError, StoreResult};

const BACKUP_FILE_PREFIX: &str = "muster-backup";
const BACKUP_FILE_SUFFIX: &str = ".sqlite";

/// Metadata for one snapshot on disk.
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

/// Creates, rotates, lists, and restores store snapshots.
pub struct BackupManager {
    store: Arc<dyn RosterStore>,
    backup_dir: PathBuf,
}

impl BackupManager {
    pub fn new(store: Arc<dyn RosterStore>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            backup_dir: backup_dir.into(),
        }
    }

    /// Takes one snapshot. `label` distinguishes operator-initiated,
    /// periodic, and pre-restore snapshots in the file name.
    pub async fn create_snapshot(&self, label: &str) -> StoreResult<BackupInfo> {
        std::fs::create_dir_all(&self.backup_dir)?;
        let destination = self.next_backup_path(label);

        if let Err(error) = self.store.export_snapshot(&destination).await {
            match error {
                StoreError::SnapshotExport(reason) => {
                    // Explicit fallback: a raw copy can observe in-flight
                    // writes, so it is only taken when the engine export is
                    // unavailable, and it is logged loudly.
                    warn!(reason, "atomic export failed, falling back to raw file copy");
                    if destination.exists() {
                        std::fs::remove_file(&destination)?;
                    }
                    std::fs::copy(self.store.backing_file(), &destination)?;
                }
                other => return Err(other),
            }
        }

        let info = backup_info(&destination)?;
        info!(path = %info.path.display(), size_bytes = info.size_bytes, "snapshot created");
        Ok(info)
    }

    /// Lists snapshots, newest first.
    pub fn list_snapshots(&self) -> StoreResult<Vec<BackupInfo>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }
        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(BACKUP_FILE_PREFIX) || !name.ends_with(BACKUP_FILE_SUFFIX) {
                continue;
            }
            snapshots.push(backup_info(&entry.path())?);
        }
        snapshots.sort_by(|left, right| {
            right
                .modified_at
                .cmp(&left.modified_at)
                .then_with(|| right.path.cmp(&left.path))
        });
        Ok(snapshots)
    }

    /// Deletes all but the `keep_count` newest snapshots. Returns the number
    /// removed. A `keep_count` of zero deletes every snapshot.
    pub fn rotate(&self, keep_count: usize) -> StoreResult<usize> {
        let snapshots = self.list_snapshots()?;
        let mut removed = 0_usize;
        for stale in snapshots.iter().skip(keep_count) {
            std::fs::remove_file(&stale.path)?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, keep_count, "rotated old snapshots");
        }
        Ok(removed)
    }

    /// Replaces the live store file with `backup_path`, after first snapping
    /// the current state so a bad restore can itself be undone.
    pub async fn restore(&self, backup_path: &Path) -> StoreResult<BackupInfo> {
        if !backup_path.exists() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("backup {} does not exist", backup_path.display()),
            )));
        }

        let safety = self.create_snapshot("pre-restore").await?;
        std::fs::copy(backup_path, self.store.backing_file())?;
        // Stale WAL/SHM sidecars would shadow the restored content.
        for sidecar in ["-wal", "-shm"] {
            let mut sidecar_path = self.store.backing_file().as_os_str().to_owned();
            sidecar_path.push(sidecar);
            let sidecar_path = PathBuf::from(sidecar_path);
            if sidecar_path.exists() {
                std::fs::remove_file(&sidecar_path)?;
            }
        }
        info!(
            restored_from = %backup_path.display(),
            safety_snapshot = %safety.path.display(),
            "store restored"
        );
        Ok(safety)
    }

    /// Periodic snapshot loop: one snapshot per `interval`, rotating down to
    /// `keep_count` afterwards. Runs until the task is dropped.
    pub async fn run_periodic(&self, interval: Duration, keep_count: usize) -> StoreResult<()> {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.create_snapshot("periodic").await?;
            self.rotate(keep_count)?;
        }
    }

    fn next_backup_path(&self, label: &str) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        self.backup_dir
            .join(format!("{BACKUP_FILE_PREFIX}-{label}-{stamp}{BACKUP_FILE_SUFFIX}"))
    }
}

fn backup_info(path: &Path) -> StoreResult<BackupInfo> {
    let metadata = std::fs::metadata(path)?;
    let modified_at = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok(BackupInfo {
        path: path.to_path_buf(),
        size_bytes: metadata.len(),
        modified_at,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use tempfile::tempdir;

    use super::BackupManager;
    use crate::{Response, ResponseRecord, RosterStore, SqliteRosterStore};

    fn record(event_id: &str, chat_id: &str) -> ResponseRecord {
        ResponseRecord {
            event_id: event_id.to_string(),
            chat_id: chat_id.to_string(),
            response: Response::Yes,
            display_name: chat_id.to_string(),
            recorded_at: Utc::now(),
        }
    }

    fn test_manager() -> (tempfile::TempDir, Arc<SqliteRosterStore>, BackupManager) {
        let temp = tempdir().expect("tempdir");
        let store =
            Arc::new(SqliteRosterStore::new(temp.path().join("muster.sqlite")).expect("store"));
        let manager = BackupManager::new(
            Arc::clone(&store) as Arc<dyn RosterStore>,
            temp.path().join("backups"),
        );
        (temp, store, manager)
    }

    #[tokio::test]
    async fn snapshot_listing_reports_size_and_order() {
        let (_temp, store, manager) = test_manager();
        store.upsert_response(record("event-1", "chat-a")).await.expect("seed");

        manager.create_snapshot("manual").await.expect("first");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let second = manager.create_snapshot("manual").await.expect("second");

        let listed = manager.list_snapshots().expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, second.path, "newest first");
        assert!(listed[0].size_bytes > 0);
    }

    #[tokio::test]
    async fn rotation_keeps_exactly_the_newest_n() {
        let (_temp, _store, manager) = test_manager();
        for _ in 0..15 {
            manager.create_snapshot("periodic").await.expect("snapshot");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let newest = manager.list_snapshots().expect("list")[..10]
            .iter()
            .map(|info| info.path.clone())
            .collect::<Vec<_>>();

        let removed = manager.rotate(10).expect("rotate");
        assert_eq!(removed, 5);

        let remaining = manager.list_snapshots().expect("list after rotate");
        assert_eq!(remaining.len(), 10);
        assert_eq!(
            remaining.iter().map(|info| info.path.clone()).collect::<Vec<_>>(),
            newest,
            "exactly the 10 newest remain"
        );
    }

    #[tokio::test]
    async fn rotation_to_zero_deletes_every_snapshot() {
        let (_temp, _store, manager) = test_manager();
        for _ in 0..3 {
            manager.create_snapshot("periodic").await.expect("snapshot");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let removed = manager.rotate(0).expect("rotate");
        assert_eq!(removed, 3);
        assert!(manager.list_snapshots().expect("list").is_empty());
    }

    #[tokio::test]
    async fn restore_reverts_state_and_takes_safety_snapshot() {
        let (_temp, store, manager) = test_manager();
        store.upsert_response(record("event-1", "chat-a")).await.expect("seed");
        let snapshot = manager.create_snapshot("manual").await.expect("snapshot");

        store.upsert_response(record("event-1", "chat-b")).await.expect("later write");
        assert_eq!(
            store.list_responses_for_event("event-1").await.expect("pre").len(),
            2
        );

        let safety = manager.restore(&snapshot.path).await.expect("restore");
        assert!(safety.path.exists(), "safety snapshot persisted");
        assert_eq!(
            store.list_responses_for_event("event-1").await.expect("post").len(),
            1,
            "state is back to snapshot time"
        );
    }

    #[tokio::test]
    async fn restore_of_missing_backup_fails_without_touching_store() {
        let (temp, store, manager) = test_manager();
        store.upsert_response(record("event-1", "chat-a")).await.expect("seed");

        let missing = temp.path().join("backups").join("nope.sqlite");
        manager.restore(&missing).await.expect_err("missing backup");
        assert_eq!(
            store.list_responses_for_event("event-1").await.expect("unchanged").len(),
            1
        );
    }
}
