//! Deduplication and session-to-global consolidation.
//!
//! Two notes are merge candidates only when their tag sets intersect. Their
//! similarity is then the Jaccard index of normalised content tokens
//! (lower-cased words without stopwords or preference verbs, trailing
//! plural `s` dropped). A negated note ("never", "don't", "avoid") and a
//! plain one are never similar. Grouping repeats until a pass merges nothing, so
//! running `deduplicate` on its own output changes nothing.

use super::note::{MemoryNote, Scope};
use super::state::AgentState;
use crate::DEFAULT_DEDUP_THRESHOLD;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Words that carry no fact of their own.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "the", "of", "for", "to", "in", "on", "with", "is", "are", "be", "it",
    "its", "their", "this", "that", "user", "users", "user's", "they", "them", "i", "me", "my",
    "usually", "generally", "really", "very",
];

/// Words that flip an instruction. Notes differing in polarity never merge.
const NEGATORS: &[&str] = &[
    "not", "no", "never", "don't", "dont", "doesn't", "doesnt", "isn't", "aren't",
    "won't", "can't", "cannot", "shouldn't", "avoid", "avoids", "without", "nor", "none",
    "stop", "exclude",
];

/// Verbs that frame a preference without changing what it is about.
const PREFERENCE_VERBS: &[&str] = &[
    "prefer", "prefers", "preferred", "like", "likes", "liked", "love", "loves", "want",
    "wants", "enjoy", "enjoys", "favor", "favors", "favour", "favours",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationStats {
    /// Notes absorbed into another note during deduplication
    pub merged_count: usize,
    /// Session notes moved into global memory
    pub moved_count: usize,
}

/// Maintenance limits for global memory
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrunePolicy {
    pub max_age_days: i64,
    pub max_notes: usize,
}

impl Default for PrunePolicy {
    fn default() -> Self {
        Self {
            max_age_days: 365,
            max_notes: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneStats {
    pub before_count: usize,
    pub after_count: usize,
    pub removed_count: usize,
}

/// Quality assessment of a single note
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub score: f64,
    pub issues: Vec<String>,
    pub is_quality: bool,
}

fn words(content: &str) -> impl Iterator<Item = String> + '_ {
    content
        .split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '\u{2019}' || c == '_'))
        .map(|w| w.replace('\u{2019}', "'").trim_matches('\'').to_lowercase())
        .filter(|w| !w.is_empty())
}

fn is_negated(content: &str) -> bool {
    words(content).any(|w| NEGATORS.contains(&w.as_str()))
}

fn content_tokens(content: &str) -> BTreeSet<String> {
    words(content)
        .filter(|w| !STOPWORDS.contains(&w.as_str()) && !PREFERENCE_VERBS.contains(&w.as_str()))
        .filter(|w| !NEGATORS.contains(&w.as_str()))
        .map(|w| match w.strip_suffix('s') {
            Some(stem) if stem.len() >= 3 && !stem.ends_with('s') => stem.to_string(),
            _ => w,
        })
        .collect()
}

/// Similarity in `[0, 1]` between two notes.
pub fn similarity(a: &MemoryNote, b: &MemoryNote) -> f64 {
    if a.tags().is_disjoint(b.tags()) || is_negated(a.content()) != is_negated(b.content()) {
        return 0.0;
    }
    let ta = content_tokens(a.content());
    let tb = content_tokens(b.content());
    if ta.is_empty() && tb.is_empty() {
        let same = a.content().trim().eq_ignore_ascii_case(b.content().trim());
        return if same { 1.0 } else { 0.0 };
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f64 / union as f64
}

/// Merge similar notes with the default threshold.
pub fn deduplicate(notes: Vec<MemoryNote>) -> Vec<MemoryNote> {
    deduplicate_with(notes, DEFAULT_DEDUP_THRESHOLD)
}

/// Merge notes whose similarity reaches `threshold`.
///
/// Each group becomes one note: the longest content (earliest on ties),
/// the union of tags and the earliest creation time. Output order follows
/// the first member of each group.
pub fn deduplicate_with(notes: Vec<MemoryNote>, threshold: f64) -> Vec<MemoryNote> {
    let mut current = notes;
    loop {
        let before = current.len();
        current = merge_pass(current, threshold);
        if current.len() == before {
            return current;
        }
    }
}

fn merge_pass(notes: Vec<MemoryNote>, threshold: f64) -> Vec<MemoryNote> {
    let mut groups: Vec<MemoryNote> = Vec::with_capacity(notes.len());
    for note in notes {
        let mut best: Option<(usize, f64)> = None;
        for (i, rep) in groups.iter().enumerate() {
            let sim = similarity(rep, &note);
            // strict comparison keeps the earliest group on ties
            if sim >= threshold && best.map_or(true, |(_, s)| sim > s) {
                best = Some((i, sim));
            }
        }
        match best {
            Some((i, _)) => {
                let merged = merge(&groups[i], &note);
                groups[i] = merged;
            }
            None => groups.push(note),
        }
    }
    groups
}

/// Merge `later` into `earlier`; `earlier` precedes it in insertion order.
fn merge(earlier: &MemoryNote, later: &MemoryNote) -> MemoryNote {
    let rep = if later.content().chars().count() > earlier.content().chars().count() {
        later
    } else {
        earlier
    };
    let tags = earlier.tags().union(later.tags()).cloned().collect();
    let created_at = earlier.created_at().min(later.created_at());
    let touched_at = earlier.touched_at().max(later.touched_at());
    let scope = if earlier.scope() == Scope::Global || later.scope() == Scope::Global {
        Scope::Global
    } else {
        rep.scope()
    };
    debug!("Merged note {} into {}", later.id(), earlier.id());
    MemoryNote::new(
        rep.id().to_string(),
        rep.content().to_string(),
        tags,
        created_at,
        scope,
    )
    .with_updated_at(touched_at)
}

/// Fold session memory into global memory with the default threshold.
pub fn consolidate_session_to_global(state: &mut AgentState) -> ConsolidationStats {
    consolidate_with(state, DEFAULT_DEDUP_THRESHOLD)
}

/// Move every session note into global memory, deduplicate the combined
/// store and clear session memory. A no-op when session memory is empty.
pub fn consolidate_with(state: &mut AgentState, threshold: f64) -> ConsolidationStats {
    if state.session_memory.is_empty() {
        return ConsolidationStats::default();
    }

    let staged: Vec<MemoryNote> = state
        .session_memory
        .take()
        .iter()
        .map(|n| n.rescoped(Scope::Global))
        .collect();
    let moved_count = staged.len();

    let mut combined = state.global_memory.take();
    combined.extend(staged);
    let before = combined.len();

    let deduplicated = deduplicate_with(combined, threshold);
    let merged_count = before - deduplicated.len();
    state.global_memory.replace(deduplicated);
    state.pending_reinjection = false;

    info!(
        "Consolidated {} session notes into global memory ({} merged, {} total)",
        moved_count,
        merged_count,
        state.global_memory.len()
    );

    ConsolidationStats {
        merged_count,
        moved_count,
    }
}

/// Score a note on tags, length and age.
pub fn assess_quality(note: &MemoryNote) -> QualityReport {
    let mut issues = Vec::new();
    let mut score: f64 = 1.0;

    if note.tags().is_empty() {
        issues.push("No tags".to_string());
        score -= 0.3;
    }

    let len = note.content().chars().count();
    if len < 10 {
        issues.push("Content too short".to_string());
        score -= 0.3;
    } else if len > 500 {
        issues.push("Content too long".to_string());
        score -= 0.2;
    }

    if Utc::now() - note.created_at() > Duration::days(365) {
        issues.push("Older than a year".to_string());
        score -= 0.1;
    }

    let score = score.max(0.0);
    QualityReport {
        score,
        issues,
        is_quality: score >= 0.7,
    }
}

/// Drop global notes older than the policy allows, then keep only the most
/// recent `max_notes`. Surviving notes keep their relative order.
pub fn prune_global(state: &mut AgentState, policy: &PrunePolicy) -> PruneStats {
    let notes = state.global_memory.take();
    let before_count = notes.len();
    let cutoff = Utc::now() - Duration::days(policy.max_age_days);

    let mut kept: Vec<MemoryNote> = notes
        .into_iter()
        .filter(|n| n.created_at() >= cutoff)
        .collect();

    if kept.len() > policy.max_notes {
        let mut by_age: Vec<(usize, chrono::DateTime<Utc>)> = kept
            .iter()
            .enumerate()
            .map(|(i, n)| (i, n.created_at()))
            .collect();
        by_age.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
        let survivors: BTreeSet<usize> = by_age
            .into_iter()
            .take(policy.max_notes)
            .map(|(i, _)| i)
            .collect();
        kept = kept
            .into_iter()
            .enumerate()
            .filter(|(i, _)| survivors.contains(i))
            .map(|(_, n)| n)
            .collect();
    }

    let after_count = kept.len();
    state.global_memory.replace(kept);
    if before_count != after_count {
        info!("Pruned {} global notes", before_count - after_count);
    }
    PruneStats {
        before_count,
        after_count,
        removed_count: before_count - after_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::note::Tag;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn note(id: &str, content: &str, tags: &[&str], day: u32) -> MemoryNote {
        MemoryNote::new(
            id.to_string(),
            content.to_string(),
            Tag::parse_all(tags).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            Scope::Global,
        )
    }

    #[test]
    fn test_similar_phrasing_merges() {
        let a = note("note-1", "User prefers bar charts", &["chart_type", "bar"], 1);
        let b = note("note-2", "User likes bar charts", &["chart_type", "preference"], 2);
        assert!((similarity(&a, &b) - 1.0).abs() < f64::EPSILON);

        let out = deduplicate(vec![a, b]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content(), "User prefers bar charts");
        assert_eq!(out[0].id(), "note-1");
        assert_eq!(out[0].tag_list(), "bar, chart_type, preference");
    }

    #[test]
    fn test_longest_content_wins() {
        let a = note("note-1", "Likes bar charts", &["bar"], 3);
        let b = note("note-2", "User really likes bar charts", &["bar"], 1);
        let out = deduplicate(vec![a, b]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content(), "User really likes bar charts");
        assert_eq!(out[0].id(), "note-2");
        assert_eq!(out[0].created_at(), Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_distinct_facts_survive() {
        let a = note("note-1", "User works in finance", &["domain"], 1);
        let b = note("note-2", "User works in healthcare", &["domain"], 2);
        let c = note("note-3", "User prefers bar charts", &["bar"], 3);
        let d = note("note-4", "User prefers bar charts", &["color"], 4);
        let out = deduplicate(vec![a, b, c, d]);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_negated_instruction_kept_apart() {
        let notes = vec![
            note("note-1", "Use pie charts", &["pie"], 1),
            note("note-2", "Don't use pie charts", &["pie"], 2),
            note("note-3", "Never use pie charts", &["pie"], 3),
            note("note-4", "Always use pie charts", &["pie"], 4),
        ];
        assert_eq!(similarity(&notes[0], &notes[1]), 0.0);

        let out = deduplicate(notes);
        let contents: Vec<_> = out.iter().map(|n| n.content()).collect();
        assert_eq!(contents, vec!["Always use pie charts", "Don't use pie charts"]);
    }

    #[test]
    fn test_merge_keeps_latest_touch() {
        let a = note("note-1", "User works in finance", &["domain"], 1);
        let b = note("note-2", "Works in finance", &["domain"], 9);
        let out = deduplicate(vec![a, b]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].created_at(), Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(out[0].touched_at(), Utc.with_ymd_and_hms(2024, 1, 9, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_untagged_notes_never_merge() {
        let a = note("note-1", "Same text", &[], 1);
        let b = note("note-2", "Same text", &[], 2);
        assert_eq!(deduplicate(vec![a, b]).len(), 2);
    }

    #[test]
    fn test_idempotent_and_order_stable() {
        let notes = vec![
            note("note-1", "Dark theme", &["theme"], 1),
            note("note-2", "Executives are the audience", &["audience"], 2),
            note("note-3", "Prefers dark theme", &["theme", "color"], 3),
            note("note-4", "Wants horizontal bar charts", &["bar"], 4),
            note("note-5", "The audience is executives", &["audience"], 5),
            note("note-6", "Likes horizontal bar charts", &["bar", "chart_type"], 6),
        ];
        let once = deduplicate(notes.clone());
        let twice = deduplicate(once.clone());
        assert_eq!(once, twice);
        assert_eq!(deduplicate(notes), once);

        let ids: Vec<_> = once.iter().map(|n| n.id()).collect();
        assert_eq!(ids, vec!["note-3", "note-2", "note-4"]);
    }

    #[test]
    fn test_tie_goes_to_earliest_group() {
        let a = note("note-1", "bar charts", &["bar"], 1);
        let b = note("note-2", "bar charts", &["chart_type"], 2);
        let c = note("note-3", "bar charts", &["bar", "chart_type"], 3);
        // a and b share no tag, so they stay apart; c matches both equally
        let out = merge_pass(vec![a, b, c], 0.75);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].tag_list(), "bar, chart_type");
        assert_eq!(out[1].tag_list(), "chart_type");
    }

    #[test]
    fn test_consolidate_moves_and_clears() {
        let mut state = AgentState::create("u1").unwrap();
        state
            .save_note("User prefers bar charts", &["chart_type", "bar"], Scope::Global)
            .unwrap();
        state
            .save_note("User likes bar charts", &["chart_type"], Scope::Session)
            .unwrap();
        state
            .save_note("Audience is the board", &["audience"], Scope::Session)
            .unwrap();
        state.pending_reinjection = true;

        let stats = consolidate_session_to_global(&mut state);
        assert_eq!(stats, ConsolidationStats { merged_count: 1, moved_count: 2 });
        assert!(state.store(Scope::Session).is_empty());
        assert_eq!(state.store(Scope::Global).len(), 2);
        assert!(state
            .store(Scope::Global)
            .notes()
            .iter()
            .all(|n| n.scope() == Scope::Global));
        assert!(!state.pending_reinjection());
    }

    #[test]
    fn test_consolidate_empty_session_is_noop() {
        let mut state = AgentState::create("u1").unwrap();
        state.save_note("Global fact", &["domain"], Scope::Global).unwrap();
        let before = state.clone();
        assert_eq!(consolidate_session_to_global(&mut state), ConsolidationStats::default());
        assert_eq!(state, before);
    }

    #[test]
    fn test_assess_quality() {
        let good = note("note-1", "User prefers bar charts", &["bar"], 1);
        let report = assess_quality(&good);
        assert!(report.issues.iter().any(|i| i.contains("year")));

        let fresh = MemoryNote::new(
            "note-2".into(),
            "ok".into(),
            BTreeSet::new(),
            Utc::now(),
            Scope::Session,
        );
        let report = assess_quality(&fresh);
        assert!(!report.is_quality);
        assert_eq!(report.issues.len(), 2);
    }

    #[test]
    fn test_prune_global() {
        let mut state = AgentState::create("u1").unwrap();
        state.global_memory.replace(vec![note("note-old", "Ancient", &["a"], 1)]);
        for i in 0..4 {
            state
                .save_note(&format!("Fact {}", i), &["b"], Scope::Global)
                .unwrap();
        }
        let stats = prune_global(
            &mut state,
            &PrunePolicy {
                max_age_days: 365,
                max_notes: 2,
            },
        );
        assert_eq!(stats.before_count, 5);
        assert_eq!(stats.after_count, 2);
        let contents: Vec<_> = state
            .store(Scope::Global)
            .notes()
            .iter()
            .map(|n| n.content())
            .collect();
        assert_eq!(contents, vec!["Fact 2", "Fact 3"]);
    }
}
