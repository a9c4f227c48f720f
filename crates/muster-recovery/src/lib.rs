//! Multi-strategy reconstruction of store content after data loss.
//!
//! Strategies run in decreasing confidence order: exact journal replay first,
//! then scans over chat history that re-derive mappings and responses from
//! what the bot previously confirmed or rendered. Every strategy writes
//! through the store's insert-if-absent primitive only, so a second pass over
//! identical history recovers nothing, and every strategy honors a dry-run
//! flag that produces the same report without persisting.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use serde::Serialize;

use muster_chat::{chat_classifier, ChatMessage, ChatTransport};
use muster_journal::InteractionJournal;
use muster_resilience::{RetryExecutor, RetryPolicy};
use muster_store::{Response, ResponseRecord, RosterStore, UserMapping};
use muster_sync::{extract_rendered_state, Evidence};

/// Which strategy produced a detail line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    JournalReplay,
    LinkingScan,
    ResponseScan,
    CrossReference,
}

/// Trust tier of a recovered or candidate record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Journal-backed, byte-for-byte what was originally written.
    Exact,
    /// Derived from a bot confirmation or a recurring handle match.
    High,
    /// Single-occurrence heuristic match; surfaced for review, not persisted.
    Medium,
}

/// One recovered record, skipped candidate, or per-record failure.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryDetail {
    pub strategy: Strategy,
    pub confidence: Confidence,
    pub description: String,
    /// False under dry-run, for medium-confidence candidates, and for
    /// records that were already present.
    pub persisted: bool,
}

/// Aggregate partial-success summary. Strategy failures never abort the run.
#[derive(Debug, Default, Serialize)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub errors: usize,
    pub details: Vec<RecoveryDetail>,
}

impl RecoveryReport {
    fn record_error(&mut self, strategy: Strategy, error: &anyhow::Error) {
        self.errors += 1;
        self.details.push(RecoveryDetail {
            strategy,
            confidence: Confidence::Medium,
            description: format!("{error:#}"),
            persisted: false,
        });
    }
}

/// One member of the external roster, input to the cross-reference pass.
/// The roster itself comes from outside; only the chat-id link is rebuilt.
#[derive(Debug, Clone)]
pub struct RosterMember {
    pub roster_id: String,
    pub handle: String,
}

/// Tuning for the history scans.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub dry_run: bool,
    /// Journal replay window.
    pub lookback_secs: u64,
    pub history_page_size: usize,
    pub max_history_pages: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            lookback_secs: 14 * 24 * 3600,
            history_page_size: 100,
            max_history_pages: 10,
        }
    }
}

fn linked_confirmation() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)successfully linked\s+(?:to\s+)?[*_`]*([^*_`,.!\n]+?)[*_`]*\s*(?:[.!]|$)")
            .expect("static regex")
    })
}

/// Keys a dry-run pass would have written. Duplicate evidence for the same
/// record counts once, matching what insert-if-absent does when writes are
/// real.
#[derive(Default)]
struct DryRunLedger {
    mapping_chat_ids: HashSet<String>,
    response_keys: HashSet<(String, String)>,
}

/// Rebuilds store content from the journal and from chat history.
pub struct RecoveryEngine {
    store: Arc<dyn RosterStore>,
    transport: Arc<dyn ChatTransport>,
    journal: InteractionJournal,
    executor: Arc<RetryExecutor>,
    config: RecoveryConfig,
}

impl RecoveryEngine {
    pub fn new(
        store: Arc<dyn RosterStore>,
        transport: Arc<dyn ChatTransport>,
        journal: InteractionJournal,
        executor: Arc<RetryExecutor>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            transport,
            journal,
            executor,
            config,
        }
    }

    /// Runs every strategy against `channel_id` and returns the aggregate
    /// summary. `roster` feeds the cross-reference pass; pass an empty slice
    /// to skip it.
    pub async fn run(&self, channel_id: &str, roster: &[RosterMember]) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        match self
            .journal
            .replay(self.store.as_ref(), self.config.lookback_secs, self.config.dry_run)
            .await
        {
            Ok(replay) => {
                report.recovered += replay.recovered;
                report.details.push(RecoveryDetail {
                    strategy: Strategy::JournalReplay,
                    confidence: Confidence::Exact,
                    description: format!(
                        "journal replay: {} recovered, {} already present, {} outside window, {} malformed",
                        replay.recovered,
                        replay.already_present,
                        replay.outside_window,
                        replay.malformed
                    ),
                    persisted: !self.config.dry_run && replay.recovered > 0,
                });
            }
            Err(error) => report.record_error(Strategy::JournalReplay, &error),
        }

        let channel_history = match self.fetch_history(channel_id).await {
            Ok(history) => history,
            Err(error) => {
                report.record_error(Strategy::LinkingScan, &error);
                tracing::warn!(channel_id, "channel history unavailable; history scans skipped");
                return report;
            }
        };

        let mut ledger = DryRunLedger::default();
        self.linking_scan(&channel_history, &mut report, &mut ledger)
            .await;
        self.response_scan(&mut report, &mut ledger).await;
        self.cross_reference(&channel_history, roster, &mut report, &mut ledger)
            .await;

        tracing::info!(
            recovered = report.recovered,
            errors = report.errors,
            dry_run = self.config.dry_run,
            "recovery pass finished"
        );
        report
    }

    /// Strategy 2: bot-authored "successfully linked" confirmations. The
    /// actor identity must still be attached as interaction context; it is
    /// never parsed out of display text.
    async fn linking_scan(
        &self,
        history: &[ChatMessage],
        report: &mut RecoveryReport,
        ledger: &mut DryRunLedger,
    ) {
        for message in history {
            if !message.author_is_bot {
                continue;
            }
            let Some(captures) = linked_confirmation().captures(&message.text) else {
                continue;
            };
            let Some(roster_handle) = captures.get(1).map(|m| m.as_str().trim()) else {
                continue;
            };
            let Some(actor_id) = message.interaction_actor_id.as_deref() else {
                // Confirmation text alone cannot identify the actor.
                continue;
            };

            let mapping = UserMapping {
                chat_id: actor_id.to_string(),
                display_name: roster_handle.to_string(),
                roster_id: roster_handle.to_string(),
                skill_level: None,
                elo: None,
                country: None,
                linked_at: message.timestamp,
            };
            match self.persist_mapping(mapping, ledger).await {
                Ok(written) => {
                    if written {
                        report.recovered += 1;
                        report.details.push(RecoveryDetail {
                            strategy: Strategy::LinkingScan,
                            confidence: Confidence::High,
                            description: format!(
                                "mapping {actor_id} -> '{roster_handle}' from confirmation {}",
                                message.id
                            ),
                            persisted: !self.config.dry_run,
                        });
                    }
                }
                Err(error) => report.record_error(Strategy::LinkingScan, &error),
            }
        }
    }

    /// Strategy 3: re-read each indexed event thread's rendered summary and
    /// turn displayed names back into responses. Names resolve to chat ids
    /// strictly via mappings that already exist.
    async fn response_scan(&self, report: &mut RecoveryReport, ledger: &mut DryRunLedger) {
        let threads = match self.store.list_event_threads().await {
            Ok(threads) => threads,
            Err(error) => {
                report.record_error(Strategy::ResponseScan, &anyhow::Error::from(error));
                return;
            }
        };
        let name_index = match self.display_name_index().await {
            Ok(index) => index,
            Err(error) => {
                report.record_error(Strategy::ResponseScan, &error);
                return;
            }
        };

        for (event_id, thread_id) in threads {
            let history = match self.fetch_history(&thread_id).await {
                Ok(history) => history,
                Err(error) => {
                    report.record_error(Strategy::ResponseScan, &error);
                    continue;
                }
            };
            let rendered = extract_rendered_state(&history);
            if rendered.evidence != Evidence::Parsed {
                continue;
            }
            let rendered_at = rendered
                .source_message_id
                .as_deref()
                .and_then(|id| history.iter().find(|message| message.id == id))
                .map(|message| message.timestamp)
                .unwrap_or_else(Utc::now);

            let answers = rendered
                .attending
                .iter()
                .map(|name| (name, Response::Yes))
                .chain(rendered.not_attending.iter().map(|name| (name, Response::No)));
            for (name, response) in answers {
                let Some(chat_id) = name_index.get(name.as_str()) else {
                    // A bare display name cannot mint an identity.
                    continue;
                };
                let record = ResponseRecord {
                    event_id: event_id.clone(),
                    chat_id: chat_id.clone(),
                    response,
                    display_name: name.clone(),
                    recorded_at: rendered_at,
                };
                match self.persist_response(record, ledger).await {
                    Ok(written) => {
                        if written {
                            report.recovered += 1;
                            report.details.push(RecoveryDetail {
                                strategy: Strategy::ResponseScan,
                                confidence: Confidence::High,
                                description: format!(
                                    "response '{name}' -> {response:?} for event {event_id}"
                                ),
                                persisted: !self.config.dry_run,
                            });
                        }
                    }
                    Err(error) => report.record_error(Strategy::ResponseScan, &error),
                }
            }
        }
    }

    /// Strategy 4: for each roster member, the newest human author mentioning
    /// the handle becomes a candidate. A handle recurring in more than one
    /// message earns `High` confidence and persists; a single occurrence is
    /// only surfaced for review.
    async fn cross_reference(
        &self,
        history: &[ChatMessage],
        roster: &[RosterMember],
        report: &mut RecoveryReport,
        ledger: &mut DryRunLedger,
    ) {
        for member in roster {
            let handle_lower = member.handle.to_lowercase();
            if handle_lower.is_empty() {
                continue;
            }
            let mentions: Vec<&ChatMessage> = history
                .iter()
                .filter(|message| !message.author_is_bot)
                .filter(|message| message.text.to_lowercase().contains(&handle_lower))
                .collect();
            // History is newest-first, so the first mention is the latest.
            let Some(latest) = mentions.first() else {
                continue;
            };
            let confidence = if mentions.len() > 1 {
                Confidence::High
            } else {
                Confidence::Medium
            };

            if confidence == Confidence::Medium {
                report.details.push(RecoveryDetail {
                    strategy: Strategy::CrossReference,
                    confidence,
                    description: format!(
                        "candidate {} -> '{}' from single mention {}; review required",
                        latest.author_id, member.handle, latest.id
                    ),
                    persisted: false,
                });
                continue;
            }

            let mapping = UserMapping {
                chat_id: latest.author_id.clone(),
                display_name: latest.author_display_name.clone(),
                roster_id: member.roster_id.clone(),
                skill_level: None,
                elo: None,
                country: None,
                linked_at: latest.timestamp,
            };
            match self.persist_mapping(mapping, ledger).await {
                Ok(written) => {
                    if written {
                        report.recovered += 1;
                        report.details.push(RecoveryDetail {
                            strategy: Strategy::CrossReference,
                            confidence,
                            description: format!(
                                "mapping {} -> '{}' from {} mentions",
                                latest.author_id,
                                member.handle,
                                mentions.len()
                            ),
                            persisted: !self.config.dry_run,
                        });
                    }
                }
                Err(error) => report.record_error(Strategy::CrossReference, &error),
            }
        }
    }

    /// Insert-if-absent, or an existence check under dry-run. Returns true
    /// when a record was (or would be) written.
    async fn persist_mapping(
        &self,
        mapping: UserMapping,
        ledger: &mut DryRunLedger,
    ) -> Result<bool> {
        if self.config.dry_run {
            if !ledger.mapping_chat_ids.insert(mapping.chat_id.clone()) {
                return Ok(false);
            }
            let absent = self
                .store
                .get_mapping_by_chat_id(&mapping.chat_id)
                .await
                .context("dry-run mapping lookup failed")?
                .is_none();
            return Ok(absent);
        }
        self.store
            .insert_mapping_if_absent(mapping)
            .await
            .context("mapping insert failed")
    }

    async fn persist_response(
        &self,
        record: ResponseRecord,
        ledger: &mut DryRunLedger,
    ) -> Result<bool> {
        if self.config.dry_run {
            let key = (record.event_id.clone(), record.chat_id.clone());
            if !ledger.response_keys.insert(key) {
                return Ok(false);
            }
            let absent = self
                .store
                .get_response(&record.event_id, &record.chat_id)
                .await
                .context("dry-run response lookup failed")?
                .is_none();
            return Ok(absent);
        }
        self.store
            .insert_response_if_absent(record)
            .await
            .context("response insert failed")
    }

    async fn display_name_index(&self) -> Result<HashMap<String, String>> {
        let mappings = self
            .store
            .list_mappings()
            .await
            .context("listing mappings for name resolution")?;
        Ok(mappings
            .into_iter()
            .map(|mapping| (mapping.display_name, mapping.chat_id))
            .collect())
    }

    async fn fetch_history(&self, channel_id: &str) -> Result<Vec<ChatMessage>> {
        let policy = RetryPolicy::for_circuit("chat");
        let classify = chat_classifier();
        let mut messages: Vec<ChatMessage> = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..self.config.max_history_pages.max(1) {
            let cursor_arg = cursor.clone();
            let page = self
                .executor
                .execute(&policy, &classify, || {
                    let cursor_arg = cursor_arg.clone();
                    async move {
                        self.transport
                            .fetch_history(
                                channel_id,
                                cursor_arg.as_deref(),
                                self.config.history_page_size,
                            )
                            .await
                            .map_err(anyhow::Error::from)
                    }
                })
                .await
                .with_context(|| format!("fetching history for channel '{channel_id}'"))?;
            messages.extend(page.messages);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(messages)
    }
}
