//! Store-vs-rendered comparison and the corrective re-render that follows.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::time::sleep;

use muster_chat::{chat_classifier, ChatMessage, ChatTransport};
use muster_resilience::{RetryExecutor, RetryPolicy};
use muster_store::{store_classifier, Response, RosterStore};

use crate::extract::{extract_rendered_state, Evidence};

/// Tuning for history fetches and batch pacing.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub history_page_size: usize,
    pub max_history_pages: usize,
    /// Mandatory pause between batch items so a sweep over many threads
    /// never bursts the chat API.
    pub batch_delay_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            history_page_size: 100,
            max_history_pages: 5,
            batch_delay_ms: 1_500,
        }
    }
}

/// Seam for re-posting or editing the attendance summary of one thread. The
/// reconciler decides WHEN a re-render is needed; the renderer owns the text.
#[async_trait]
pub trait StatusRenderer: Send + Sync {
    async fn update_status(&self, event_id: &str, thread_id: &str) -> Result<()>;
}

/// Names present on one side of a category but not the other.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CategoryDiff {
    pub only_in_store: Vec<String>,
    pub only_in_render: Vec<String>,
}

impl CategoryDiff {
    pub fn is_empty(&self) -> bool {
        self.only_in_store.is_empty() && self.only_in_render.is_empty()
    }

    fn between(store_side: &BTreeSet<String>, rendered_side: &BTreeSet<String>) -> Self {
        Self {
            only_in_store: store_side.difference(rendered_side).cloned().collect(),
            only_in_render: rendered_side.difference(store_side).cloned().collect(),
        }
    }
}

/// Result of comparing the store against what one thread displays.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonReport {
    pub event_id: String,
    pub thread_id: Option<String>,
    pub evidence: Evidence,
    pub attending: CategoryDiff,
    pub not_attending: CategoryDiff,
    pub no_response: CategoryDiff,
    /// True when the two sides genuinely disagree, or when the thread shows
    /// RSVP activity the extractor could not read.
    pub had_mismatch: bool,
}

/// A comparison plus whether a corrective re-render was issued.
#[derive(Debug, Serialize)]
pub struct ReconcileOutcome {
    pub report: ComparisonReport,
    pub update_triggered: bool,
}

/// One event in a batch sweep.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub event_id: String,
    /// Concluded events are skipped; their final summary must stay frozen.
    pub concluded: bool,
}

/// Aggregate outcome of a batch sweep.
#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub skipped_concluded: usize,
    pub synchronized: usize,
    pub mismatched: usize,
    pub updated: usize,
    pub errors: Vec<String>,
}

/// Diffs the authoritative store against a thread's rendered summary and
/// triggers a re-render when they genuinely diverge.
pub struct Reconciler {
    store: Arc<dyn RosterStore>,
    transport: Arc<dyn ChatTransport>,
    renderer: Arc<dyn StatusRenderer>,
    executor: Arc<RetryExecutor>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RosterStore>,
        transport: Arc<dyn ChatTransport>,
        renderer: Arc<dyn StatusRenderer>,
        executor: Arc<RetryExecutor>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            transport,
            renderer,
            executor,
            config,
        }
    }

    /// Compares store and rendered state for one event without changing
    /// anything on either side.
    pub async fn compare(&self, event_id: &str) -> Result<ComparisonReport> {
        let thread_id = self
            .executor
            .execute(
                &RetryPolicy::for_circuit("storage"),
                &store_classifier(),
                || async move {
                    self.store
                        .get_event_thread(event_id)
                        .await
                        .map_err(anyhow::Error::from)
                },
            )
            .await
            .with_context(|| format!("looking up thread for event '{event_id}'"))?;

        let Some(thread_id) = thread_id else {
            // No thread on record: nothing rendered anywhere, so the store
            // is authoritative by definition.
            return Ok(ComparisonReport {
                event_id: event_id.to_string(),
                thread_id: None,
                evidence: Evidence::None,
                attending: CategoryDiff::default(),
                not_attending: CategoryDiff::default(),
                no_response: CategoryDiff::default(),
                had_mismatch: false,
            });
        };

        let history = self.fetch_thread_history(&thread_id).await?;
        let rendered = extract_rendered_state(&history);
        let (store_attending, store_not_attending, store_no_response) =
            self.store_side(event_id).await?;

        match rendered.evidence {
            Evidence::None => Ok(ComparisonReport {
                event_id: event_id.to_string(),
                thread_id: Some(thread_id),
                evidence: Evidence::None,
                attending: CategoryDiff::default(),
                not_attending: CategoryDiff::default(),
                no_response: CategoryDiff::default(),
                had_mismatch: false,
            }),
            Evidence::Ambiguous => {
                // The thread shows RSVP activity we cannot read back, so
                // agreement cannot be confirmed either way.
                let has_store_state = !store_attending.is_empty()
                    || !store_not_attending.is_empty()
                    || !store_no_response.is_empty();
                Ok(ComparisonReport {
                    event_id: event_id.to_string(),
                    thread_id: Some(thread_id),
                    evidence: Evidence::Ambiguous,
                    attending: CategoryDiff::default(),
                    not_attending: CategoryDiff::default(),
                    no_response: CategoryDiff::default(),
                    had_mismatch: has_store_state,
                })
            }
            Evidence::Parsed => {
                let attending =
                    CategoryDiff::between(&store_attending, &to_set(&rendered.attending));
                let not_attending =
                    CategoryDiff::between(&store_not_attending, &to_set(&rendered.not_attending));
                let no_response =
                    CategoryDiff::between(&store_no_response, &to_set(&rendered.no_response));
                let had_mismatch = !attending.is_empty()
                    || !not_attending.is_empty()
                    || !no_response.is_empty();
                Ok(ComparisonReport {
                    event_id: event_id.to_string(),
                    thread_id: Some(thread_id),
                    evidence: Evidence::Parsed,
                    attending,
                    not_attending,
                    no_response,
                    had_mismatch,
                })
            }
        }
    }

    /// Compares one event and, on a cleanly parsed mismatch, re-renders the
    /// thread summary from the store. Ambiguous extractions are reported but
    /// never corrected.
    pub async fn reconcile(&self, event_id: &str) -> Result<ReconcileOutcome> {
        let report = self.compare(event_id).await?;

        let should_update =
            report.had_mismatch && report.evidence == Evidence::Parsed && report.thread_id.is_some();
        if !should_update {
            if report.had_mismatch {
                tracing::warn!(
                    event_id,
                    "attendance render unreadable; correction suppressed"
                );
            }
            return Ok(ReconcileOutcome {
                report,
                update_triggered: false,
            });
        }

        let thread_id = report
            .thread_id
            .clone()
            .unwrap_or_default();
        tracing::info!(event_id, thread_id, "rendered summary diverged from store; re-rendering");
        self.renderer
            .update_status(event_id, &thread_id)
            .await
            .with_context(|| format!("re-rendering status for event '{event_id}'"))?;
        Ok(ReconcileOutcome {
            report,
            update_triggered: true,
        })
    }

    /// Sweeps many events, pausing between items. Per-item failures are
    /// collected, never fatal to the sweep.
    pub async fn batch(&self, items: &[BatchItem]) -> BatchReport {
        let mut report = BatchReport::default();
        let mut first = true;
        for item in items {
            if item.concluded {
                report.skipped_concluded += 1;
                continue;
            }
            if !first {
                sleep(Duration::from_millis(self.config.batch_delay_ms)).await;
            }
            first = false;

            report.processed += 1;
            match self.reconcile(&item.event_id).await {
                Ok(outcome) => {
                    if outcome.update_triggered {
                        report.updated += 1;
                    }
                    if outcome.report.had_mismatch {
                        report.mismatched += 1;
                    } else {
                        report.synchronized += 1;
                    }
                }
                Err(error) => {
                    tracing::warn!(event_id = %item.event_id, error = %error, "reconcile failed");
                    report.errors.push(format!("{}: {error:#}", item.event_id));
                }
            }
        }
        report
    }

    /// Store-side categories: responders split by answer using the display
    /// name snapshotted with each answer; mapped users with no answer fill
    /// the no-response bucket.
    async fn store_side(
        &self,
        event_id: &str,
    ) -> Result<(BTreeSet<String>, BTreeSet<String>, BTreeSet<String>)> {
        let responses = self
            .store
            .list_responses_for_event(event_id)
            .await
            .with_context(|| format!("listing responses for event '{event_id}'"))?;
        let mappings = self
            .store
            .list_mappings()
            .await
            .context("listing roster mappings")?;

        let mut attending = BTreeSet::new();
        let mut not_attending = BTreeSet::new();
        let mut responded_chat_ids = BTreeSet::new();
        for record in &responses {
            responded_chat_ids.insert(record.chat_id.clone());
            match record.response {
                Response::Yes => attending.insert(record.display_name.clone()),
                Response::No => not_attending.insert(record.display_name.clone()),
            };
        }
        let no_response = mappings
            .into_iter()
            .filter(|mapping| !responded_chat_ids.contains(&mapping.chat_id))
            .map(|mapping| mapping.display_name)
            .collect();
        Ok((attending, not_attending, no_response))
    }

    async fn fetch_thread_history(&self, thread_id: &str) -> Result<Vec<ChatMessage>> {
        let policy = RetryPolicy::for_circuit("chat");
        let classify = chat_classifier();
        let mut messages = Vec::new();
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
                                thread_id,
                                cursor_arg.as_deref(),
                                self.config.history_page_size,
                            )
                            .await
                            .map_err(anyhow::Error::from)
                    }
                })
                .await
                .with_context(|| format!("fetching history for thread '{thread_id}'"))?;
            messages.extend(page.messages);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(messages)
    }
}

fn to_set(names: &[String]) -> BTreeSet<String> {
    names.iter().cloned().collect()
}
