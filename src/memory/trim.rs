//! Turn-based conversation trimming.
//!
//! A conversation is WITHIN_LIMIT while it holds at most `max_turns`
//! logical turns (a user message plus the replies that follow it). Past
//! that it is in OVERFLOW and `trim`:
//!   1. Keeps the most recent `max_turns` turns verbatim.
//!   2. Condenses the removed prefix into a `context-summary` session note.
//!   3. Flags the state so the next prompt re-includes session memory.

use super::note::{MemoryNote, Scope, Tag, CONTEXT_SUMMARY_TAG};
use super::state::{AgentState, ConversationTurn, TurnRole};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::info;

/// Approximate bytes per token for context estimation
const APPROX_BYTES_PER_TOKEN: usize = 4;

/// At most this many points go into one summary note.
const MAX_SUMMARY_POINTS: usize = 5;

/// Characters of a user statement quoted in a summary.
const SNIPPET_CHARS: usize = 100;

const CHART_TYPES: [&str; 8] = [
    "bar", "line", "scatter", "pie", "histogram", "box", "violin", "heatmap",
];

const PREFERENCE_MARKERS: [&str; 4] = ["prefer", "like", "want", "always"];

const DATA_MARKERS: [&str; 4] = ["upload", "data", "csv", "column"];

/// Summary used when nothing specific could be extracted.
pub const EMPTY_SUMMARY: &str = "Earlier conversation trimmed (no specific context preserved)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimState {
    WithinLimit,
    Overflow,
}

/// Result of a trim
#[derive(Debug, Clone, PartialEq)]
pub struct TrimOutcome {
    pub kept: Vec<ConversationTurn>,
    /// Logical turns dropped, not messages
    pub removed_count: usize,
}

/// Conversation statistics
#[derive(Debug, Clone, Serialize)]
pub struct ConversationStats {
    pub total_messages: usize,
    pub user_messages: usize,
    pub agent_messages: usize,
    pub estimated_tokens: usize,
    pub needs_trimming: bool,
}

/// Number of logical turns in `turns`.
pub fn logical_turns(turns: &[ConversationTurn]) -> usize {
    turns.iter().filter(|t| t.role == TurnRole::User).count()
}

pub fn evaluate(turns: &[ConversationTurn], max_turns: usize) -> TrimState {
    if logical_turns(turns) > max_turns {
        TrimState::Overflow
    } else {
        TrimState::WithinLimit
    }
}

pub fn should_trim(turns: &[ConversationTurn], max_turns: usize) -> bool {
    evaluate(turns, max_turns) == TrimState::Overflow
}

/// Trim `turns` to the most recent `max_turns` logical turns.
///
/// The removed prefix is summarised into session memory of `state`. A
/// sequence already within the limit is returned untouched with
/// `removed_count == 0`.
pub fn trim(turns: Vec<ConversationTurn>, state: &mut AgentState, max_turns: usize) -> TrimOutcome {
    if !should_trim(&turns, max_turns) {
        return TrimOutcome {
            kept: turns,
            removed_count: 0,
        };
    }

    let user_positions: Vec<usize> = turns
        .iter()
        .enumerate()
        .filter(|(_, t)| t.role == TurnRole::User)
        .map(|(i, _)| i)
        .collect();
    let removed_count = user_positions.len() - max_turns;
    let cutoff = user_positions
        .get(removed_count)
        .copied()
        .unwrap_or(turns.len());

    let mut kept = turns;
    let removed: Vec<ConversationTurn> = kept.drain(..cutoff).collect();

    if let Some(last) = removed.last() {
        let summary = summarize_removed(&removed);
        append_summary(state, summary);
        state.trim_cursor = kept.first().map(|t| t.index).unwrap_or(last.index + 1);
        state.pending_reinjection = true;
    }

    info!(
        "Trimmed {} turns ({} messages), {} kept",
        removed_count,
        removed.len(),
        kept.len()
    );

    TrimOutcome {
        kept,
        removed_count,
    }
}

/// Trim the conversation held by `state` itself. Returns turns removed.
pub fn trim_state(state: &mut AgentState, max_turns: usize) -> usize {
    let turns = std::mem::take(&mut state.conversation_turns);
    let outcome = trim(turns, state, max_turns);
    state.conversation_turns = outcome.kept;
    outcome.removed_count
}

pub fn conversation_stats(turns: &[ConversationTurn], max_turns: usize) -> ConversationStats {
    let user_messages = logical_turns(turns);
    ConversationStats {
        total_messages: turns.len(),
        user_messages,
        agent_messages: turns.len() - user_messages,
        estimated_tokens: turns
            .iter()
            .map(|t| estimate_tokens(&t.content))
            .sum(),
        needs_trimming: user_messages > max_turns,
    }
}

/// Estimate token count for a string
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / APPROX_BYTES_PER_TOKEN
}

fn append_summary(state: &mut AgentState, summary: Summary) {
    let mut tags = BTreeSet::new();
    tags.extend(Tag::parse(CONTEXT_SUMMARY_TAG).ok());
    for chart in &summary.charts {
        tags.extend(Tag::parse(chart).ok());
    }
    let id = state.next_id();
    let note = MemoryNote::new(id, summary.text, tags, Utc::now(), Scope::Session);
    state.store_mut(Scope::Session).push(note);
}

struct Summary {
    text: String,
    charts: Vec<&'static str>,
}

/// Condense removed messages into one line of key points.
fn summarize_removed(messages: &[ConversationTurn]) -> Summary {
    let mut points: Vec<String> = Vec::new();
    let mut charts: Vec<&'static str> = Vec::new();

    for msg in messages {
        let lower = msg.content.to_lowercase();

        if msg.role == TurnRole::User && DATA_MARKERS.iter().any(|m| lower.contains(m)) {
            push_unique(&mut points, "User uploaded or discussed data".to_string());
        }

        if msg.role == TurnRole::User && PREFERENCE_MARKERS.iter().any(|m| lower.contains(m)) {
            push_unique(&mut points, format!("User stated: {}", snippet(&msg.content)));
        }

        if let Some(&chart) = CHART_TYPES.iter().find(|c| contains_word(&lower, c)) {
            push_unique(&mut points, format!("Discussed {} charts", chart));
            if !charts.contains(&chart) {
                charts.push(chart);
            }
        }
    }

    let range = match (messages.first(), messages.last()) {
        (Some(first), Some(last)) => format!(" (messages {}-{})", first.index, last.index),
        _ => String::new(),
    };

    let text = if points.is_empty() {
        format!("{}{}", EMPTY_SUMMARY, range)
    } else {
        points.truncate(MAX_SUMMARY_POINTS);
        format!("Earlier in conversation{}: {}", range, points.join("; "))
    };
    Summary { text, charts }
}

fn push_unique(points: &mut Vec<String>, point: String) {
    if !points.contains(&point) {
        points.push(point);
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| w == word || w.strip_suffix('s') == Some(word))
}

fn snippet(text: &str) -> String {
    let text = text.trim();
    match text.char_indices().nth(SNIPPET_CHARS) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
