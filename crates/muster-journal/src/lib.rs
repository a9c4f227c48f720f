//! Append-only interaction journal and its replay.
//!
//! Every mutating action (a response recorded, an account linked) is appended
//! as one JSONL line before the store write completes. Replay is the fastest
//! and most precise recovery source: entries inside the lookback window are
//! written back through insert-if-absent, so replaying twice never changes
//! the store. Lines that fail to parse are counted but never discarded;
//! compaction drops only well-formed entries that have aged out.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use muster_core::{
    append_jsonl_with_rotation, current_unix_timestamp_ms, write_text_atomic, JsonlRotationPolicy,
};
use muster_store::{Response, ResponseRecord, RosterStore, UserMapping};

/// Version tag carried by every journal line. Lines written by a different
/// version are quarantined like malformed lines: kept on disk, never replayed.
pub const JOURNAL_SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    JOURNAL_SCHEMA_VERSION
}

/// The mutating action a journal entry records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalAction {
    ResponseAction {
        event_id: String,
        response: Response,
    },
    RegistrationAction {
        roster_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skill_level: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        elo: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        country: Option<String>,
    },
}

/// One immutable journal line. Never mutated or reordered once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub recorded_unix_ms: u64,
    pub chat_id: String,
    pub display_name: String,
    #[serde(flatten)]
    pub action: JournalAction,
    /// Free-form origin context (command name, thread id) for forensics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl JournalEntry {
    pub fn response(
        chat_id: impl Into<String>,
        display_name: impl Into<String>,
        event_id: impl Into<String>,
        response: Response,
    ) -> Self {
        Self {
            schema_version: JOURNAL_SCHEMA_VERSION,
            recorded_unix_ms: current_unix_timestamp_ms(),
            chat_id: chat_id.into(),
            display_name: display_name.into(),
            action: JournalAction::ResponseAction {
                event_id: event_id.into(),
                response,
            },
            context: None,
        }
    }

    pub fn registration(
        chat_id: impl Into<String>,
        display_name: impl Into<String>,
        roster_id: impl Into<String>,
    ) -> Self {
        Self {
            schema_version: JOURNAL_SCHEMA_VERSION,
            recorded_unix_ms: current_unix_timestamp_ms(),
            chat_id: chat_id.into(),
            display_name: display_name.into(),
            action: JournalAction::RegistrationAction {
                roster_id: roster_id.into(),
                skill_level: None,
                elo: None,
                country: None,
            },
            context: None,
        }
    }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Entries inside the window that produced a new store row.
    pub recovered: usize,
    /// Entries whose record already existed (idempotent skip).
    pub already_present: usize,
    /// Entries outside the lookback window.
    pub outside_window: usize,
    /// Lines that failed to parse. They stay in the journal.
    pub malformed: usize,
}

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactReport {
    pub kept: usize,
    pub dropped: usize,
    /// Unparseable lines are always kept, whatever their age.
    pub malformed_kept: usize,
}

/// Append-only JSONL journal with size-based rotation.
pub struct InteractionJournal {
    path: PathBuf,
    rotation: JsonlRotationPolicy,
}

impl InteractionJournal {
    pub fn new(path: impl Into<PathBuf>, rotation: JsonlRotationPolicy) -> Self {
        Self {
            path: path.into(),
            rotation,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry synchronously. Called at every mutation site before
    /// the caller reports success.
    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        let line = serde_json::to_string(entry).context("failed to encode journal entry")?;
        append_jsonl_with_rotation(&self.path, &line, self.rotation)
            .with_context(|| format!("failed to append journal {}", self.path.display()))
    }

    /// Replays entries recorded within the last `lookback_secs` into `store`
    /// via insert-if-absent. With `dry_run` the report is computed without
    /// writing anything.
    pub async fn replay(
        &self,
        store: &dyn RosterStore,
        lookback_secs: u64,
        dry_run: bool,
    ) -> Result<ReplayReport> {
        let now_ms = current_unix_timestamp_ms();
        let window_start_ms = now_ms.saturating_sub(lookback_secs.saturating_mul(1_000));
        let mut report = ReplayReport::default();

        for line in self.read_all_lines()? {
            let entry = match serde_json::from_str::<JournalEntry>(&line) {
                Ok(entry) if entry.schema_version == JOURNAL_SCHEMA_VERSION => entry,
                _ => {
                    report.malformed += 1;
                    continue;
                }
            };
            if entry.recorded_unix_ms < window_start_ms {
                report.outside_window += 1;
                continue;
            }

            let written = match &entry.action {
                JournalAction::ResponseAction { event_id, response } => {
                    let record = ResponseRecord {
                        event_id: event_id.clone(),
                        chat_id: entry.chat_id.clone(),
                        response: *response,
                        display_name: entry.display_name.clone(),
                        recorded_at: unix_ms_to_datetime(entry.recorded_unix_ms),
                    };
                    if dry_run {
                        store
                            .get_response(event_id, &entry.chat_id)
                            .await
                            .context("journal replay response lookup failed")?
                            .is_none()
                    } else {
                        store
                            .insert_response_if_absent(record)
                            .await
                            .context("journal replay response insert failed")?
                    }
                }
                JournalAction::RegistrationAction {
                    roster_id,
                    skill_level,
                    elo,
                    country,
                } => {
                    let mapping = UserMapping {
                        chat_id: entry.chat_id.clone(),
                        display_name: entry.display_name.clone(),
                        roster_id: roster_id.clone(),
                        skill_level: *skill_level,
                        elo: *elo,
                        country: country.clone(),
                        linked_at: unix_ms_to_datetime(entry.recorded_unix_ms),
                    };
                    if dry_run {
                        store
                            .get_mapping_by_chat_id(&entry.chat_id)
                            .await
                            .context("journal replay mapping lookup failed")?
                            .is_none()
                    } else {
                        store
                            .insert_mapping_if_absent(mapping)
                            .await
                            .context("journal replay mapping insert failed")?
                    }
                }
            };

            if written {
                report.recovered += 1;
            } else {
                report.already_present += 1;
            }
        }
        Ok(report)
    }

    /// Drops well-formed entries older than `retention_secs`, walking the
    /// live file and every rotated backup. Malformed lines survive every
    /// compaction: data of unknown shape is never silently discarded.
    pub fn compact(&self, retention_secs: u64) -> Result<CompactReport> {
        let now_ms = current_unix_timestamp_ms();
        let cutoff_ms = now_ms.saturating_sub(retention_secs.saturating_mul(1_000));

        let mut report = CompactReport::default();
        for file in self.journal_files() {
            if !file.exists() {
                continue;
            }
            compact_file(&file, cutoff_ms, &mut report)?;
        }
        Ok(report)
    }

    /// All journal lines, oldest first, including rotated backups.
    fn read_all_lines(&self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for source in self.journal_files() {
            if !source.exists() {
                continue;
            }
            let raw = std::fs::read_to_string(&source)
                .with_context(|| format!("failed to read journal {}", source.display()))?;
            lines.extend(
                raw.lines()
                    .filter(|line| !line.trim().is_empty())
                    .map(|line| line.to_string()),
            );
        }
        Ok(lines)
    }

    /// Every file the journal may occupy: oldest rotated backup first, the
    /// live file last. Callers skip the ones that do not exist.
    fn journal_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for index in (1..self.rotation.max_files.max(1)).rev() {
            files.push(PathBuf::from(format!("{}.{index}", self.path.display())));
        }
        files.push(self.path.clone());
        files
    }
}

fn compact_file(file: &Path, cutoff_ms: u64, report: &mut CompactReport) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read journal {}", file.display()))?;
    let mut kept_lines = Vec::new();
    let mut dropped_here = 0_usize;
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(line) {
            Ok(entry) if entry.schema_version != JOURNAL_SCHEMA_VERSION => {
                report.malformed_kept += 1;
                kept_lines.push(line.to_string());
            }
            Ok(entry) if entry.recorded_unix_ms < cutoff_ms => {
                report.dropped += 1;
                dropped_here += 1;
            }
            Ok(_) => {
                report.kept += 1;
                kept_lines.push(line.to_string());
            }
            Err(_) => {
                report.malformed_kept += 1;
                kept_lines.push(line.to_string());
            }
        }
    }

    if dropped_here == 0 {
        return Ok(());
    }
    let mut content = kept_lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    write_text_atomic(file, &content)
        .with_context(|| format!("failed to rewrite journal {}", file.display()))?;
    Ok(())
}

fn unix_ms_to_datetime(unix_ms: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(unix_ms.min(i64::MAX as u64) as i64)
        .unwrap_or_else(Utc::now)
}
