//! Rendered-state extractor: recovers the three attendance categories from
//! the status message a thread currently displays.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use muster_chat::ChatMessage;

/// How much trust the extraction deserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Evidence {
    /// No status message and no RSVP-related activity at all. The store is
    /// authoritative for this thread.
    None,
    /// A status message parsed cleanly.
    Parsed,
    /// RSVP activity exists but no pattern matched. Destructive correction
    /// must be suppressed.
    Ambiguous,
}

/// The attendance summary as currently rendered in a thread.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedState {
    pub attending: Vec<String>,
    pub not_attending: Vec<String>,
    pub no_response: Vec<String>,
    pub evidence: Evidence,
    /// Id of the status message the categories came from, when one was found.
    pub source_message_id: Option<String>,
}

impl RenderedState {
    fn without_evidence(evidence: Evidence) -> Self {
        Self {
            attending: Vec::new(),
            not_attending: Vec::new(),
            no_response: Vec::new(),
            evidence,
            source_message_id: None,
        }
    }
}

const STATUS_KEYWORDS: [&str; 4] = ["attendance", "rsvp", "roll call", "attending"];

fn marker_attending() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*✅\s*Attending(?:\s*\(\d+\))?\s*:\s*(.+?)\s*$").expect("static regex")
    })
}

fn marker_not_attending() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*❌\s*Not attending(?:\s*\(\d+\))?\s*:\s*(.+?)\s*$")
            .expect("static regex")
    })
}

fn marker_no_response() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*❔\s*No response(?:\s*\(\d+\))?\s*:\s*(.+?)\s*$")
            .expect("static regex")
    })
}

fn label_attending() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*Attending(?:\s*\(\d+\))?\s*:\s*(.+?)\s*$").expect("static regex")
    })
}

fn label_not_attending() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*Not attending(?:\s*\(\d+\))?\s*:\s*(.+?)\s*$").expect("static regex")
    })
}

fn label_no_response() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*No response(?:\s*\(\d+\))?\s*:\s*(.+?)\s*$").expect("static regex")
    })
}

fn rsvp_activity() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?im)(response (?:was )?recorded|marked you as|successfully linked|^!(?:yes|no)\b)",
        )
        .expect("static regex")
    })
}

/// Extracts the rendered attendance state from one thread's history,
/// newest-first. The most recent bot-authored status message wins; older
/// renders of the same thread are ignored.
pub fn extract_rendered_state(messages_newest_first: &[ChatMessage]) -> RenderedState {
    let status_message = messages_newest_first
        .iter()
        .filter(|message| message.author_is_bot)
        .find(|message| looks_like_status_message(&message.text));

    let Some(status_message) = status_message else {
        let has_activity = messages_newest_first
            .iter()
            .any(|message| rsvp_activity().is_match(&message.text));
        return if has_activity {
            RenderedState::without_evidence(Evidence::Ambiguous)
        } else {
            RenderedState::without_evidence(Evidence::None)
        };
    };

    // Prioritized cascade: exact marker lines, then bare labels, then a
    // generic keyword-guarded colon list. The first tier that matches
    // anything decides; tiers are never mixed within one message.
    let tiers: [(&Regex, &Regex, &Regex); 2] = [
        (marker_attending(), marker_not_attending(), marker_no_response()),
        (label_attending(), label_not_attending(), label_no_response()),
    ];
    for (attending_re, not_attending_re, no_response_re) in tiers {
        let attending = capture_names(attending_re, &status_message.text);
        let not_attending = capture_names(not_attending_re, &status_message.text);
        let no_response = capture_names(no_response_re, &status_message.text);
        if !attending.is_empty() || !not_attending.is_empty() || !no_response.is_empty() {
            return RenderedState {
                attending,
                not_attending,
                no_response,
                evidence: Evidence::Parsed,
                source_message_id: Some(status_message.id.clone()),
            };
        }
    }

    if let Some(state) = generic_fallback(status_message) {
        return state;
    }

    RenderedState {
        source_message_id: Some(status_message.id.clone()),
        ..RenderedState::without_evidence(Evidence::Ambiguous)
    }
}

fn looks_like_status_message(text: &str) -> bool {
    let lowered = text.to_lowercase();
    STATUS_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

/// Last-resort tier: any "label: a, b, c" line, matched per line so that
/// "not attending" is never mistaken for "attending".
fn generic_fallback(message: &ChatMessage) -> Option<RenderedState> {
    let mut attending = Vec::new();
    let mut not_attending = Vec::new();
    let mut no_response = Vec::new();

    for line in message.text.lines() {
        let Some((label, list)) = line.split_once(':') else {
            continue;
        };
        let label = label.trim().to_lowercase();
        if label.ends_with("not attending") || label.ends_with("declined") {
            not_attending = parse_name_list(list);
        } else if label.ends_with("no response") || label.ends_with("pending") {
            no_response = parse_name_list(list);
        } else if label.ends_with("attending") || label.ends_with("going") {
            attending = parse_name_list(list);
        }
    }

    if attending.is_empty() && not_attending.is_empty() && no_response.is_empty() {
        return None;
    }
    Some(RenderedState {
        attending,
        not_attending,
        no_response,
        evidence: Evidence::Parsed,
        source_message_id: Some(message.id.clone()),
    })
}

fn capture_names(pattern: &Regex, text: &str) -> Vec<String> {
    pattern
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|list| parse_name_list(list.as_str()))
        .unwrap_or_default()
}

fn parse_name_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|name| name.trim().trim_matches(['*', '_', '`', '~']).trim().to_string())
        .filter(|name| !name.is_empty())
        .filter(|name| {
            let lowered = name.to_lowercase();
            !matches!(lowered.as_str(), "—" | "-" | "none" | "nobody" | "no one")
        })
        .collect()
}
