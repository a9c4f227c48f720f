//! Keeping the store and the rendered thread summary in agreement.
//!
//! `extract` parses the status message a thread currently displays into the
//! same three-category shape the store uses; `reconcile` diffs the two sides
//! and triggers a corrective re-render when they genuinely diverge. Parsing
//! rendered chat text is inherently brittle, so every extraction carries an
//! evidence flag and quiet or unparseable threads never cause destructive
//! corrections.

pub mod extract;
pub mod reconcile;

pub use extract::{extract_rendered_state, Evidence, RenderedState};
pub use reconcile::{
    BatchItem, BatchReport, CategoryDiff, ComparisonReport, ReconcileOutcome, Reconciler,
    ReconcilerConfig, StatusRenderer,
};
