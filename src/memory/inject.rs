//! Prompt injection of memory.
//!
//! `render` turns a state into a text block: YAML front-matter with the
//! profile defaults that nothing overrides, then markdown sections. For
//! every overridable profile key the value comes from the nearest layer
//! that defines it (session note, then global note, then profile) and only
//! that value is shown.

use super::note::{MemoryNote, Scope};
use super::profile::{ProfileKey, ProfileValue};
use super::state::{AgentState, VisualizationEntry};
use std::fmt::Write as _;
use tracing::debug;

/// Placed between the rendered memory block and the base prompt.
pub const PROMPT_SEPARATOR: &str = "\n\n=== END OF MEMORY ===\n\n";

const USAGE_INSTRUCTIONS: &str = "\
## Memory Tools
- save_memory_note(content, tags): remember a fact or preference the user states
- search_memories(tags): look up earlier notes before asking the user again
- update_profile(key, value): change preferred_chart_types, color_scheme, domain or audience
- record_visualization(chart_type, columns, feedback): log a chart you produced
Preferences above are already resolved; the latest user message overrides them.";

/// Rendering limits and switches
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    /// Most recent global notes listed
    pub max_global_notes: usize,
    /// Most recent session notes listed
    pub max_session_notes: usize,
    /// Most recent visualizations listed
    pub history_limit: usize,
    /// Omit the session section unless reinjection is pending
    pub brief: bool,
    pub usage_instructions: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            max_global_notes: 20,
            max_session_notes: 10,
            history_limit: 5,
            brief: false,
            usage_instructions: true,
        }
    }
}

/// The value that wins for one profile key.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved<'a> {
    Note(&'a MemoryNote),
    Profile(&'a ProfileValue),
}

/// Winner for `key`: most recent session note carrying its keyword, else
/// most recent global note, else the profile value.
pub fn resolve(state: &AgentState, key: ProfileKey) -> Option<Resolved<'_>> {
    let keyword = key.keyword()?;
    for scope in Scope::ALL {
        if let Some(note) = latest_with_tag(state.store(scope).notes(), keyword) {
            return Some(Resolved::Note(note));
        }
    }
    state.profile().get(key).map(Resolved::Profile)
}

/// Latest note carrying `keyword`, by last write or restatement. A merge
/// keeps the newest restatement time, so a preference repeated recently
/// outranks an older conflicting note. Store order breaks ties.
fn latest_with_tag<'a>(notes: &'a [MemoryNote], keyword: &str) -> Option<&'a MemoryNote> {
    // max_by_key returns the last maximum
    notes
        .iter()
        .filter(|n| n.has_tag(keyword))
        .max_by_key(|n| n.touched_at())
}

fn carries_keyword(note: &MemoryNote) -> bool {
    ProfileKey::overridable().any(|k| k.keyword().is_some_and(|kw| note.has_tag(kw)))
}

/// Render the memory block for `state`. Pure and deterministic.
pub fn render(state: &AgentState, options: &RenderOptions) -> String {
    let mut out = String::new();

    let mut overridden = Vec::new();
    let mut resolved_lines = Vec::new();
    for key in ProfileKey::overridable() {
        if let Some(Resolved::Note(note)) = resolve(state, key) {
            overridden.push(key);
            resolved_lines.push(format!(
                "- {} ({}): {}",
                key.keyword().unwrap_or(key.as_str()),
                note.scope(),
                note.content()
            ));
        }
    }

    out.push_str("---\nuser_profile:\n");
    for (key, value) in state.profile().entries() {
        if overridden.contains(&key) {
            continue;
        }
        let _ = writeln!(out, "  {}: {}", key, value.to_yaml());
    }
    out.push_str("---\n");

    if !resolved_lines.is_empty() {
        out.push_str("\n## Resolved Preferences\n");
        for line in &resolved_lines {
            out.push_str(line);
            out.push('\n');
        }
    }

    let include_session = !options.brief || state.pending_reinjection();
    if include_session {
        let heading = if state.pending_reinjection() {
            "Session Context (Reinjected)"
        } else {
            "Current Session Context"
        };
        push_notes(
            &mut out,
            heading,
            state.store(Scope::Session).notes(),
            options.max_session_notes,
        );
    }

    push_notes(
        &mut out,
        "Long-Term Preferences",
        state.store(Scope::Global).notes(),
        options.max_global_notes,
    );

    let history = state.recent_visualizations(options.history_limit);
    if !history.is_empty() {
        out.push_str("\n## Recent Visualizations\n");
        for entry in history {
            out.push_str(&visualization_line(entry));
            out.push('\n');
        }
    }

    if options.usage_instructions {
        out.push('\n');
        out.push_str(USAGE_INSTRUCTIONS);
        out.push('\n');
    }

    out
}

fn push_notes(out: &mut String, heading: &str, notes: &[MemoryNote], limit: usize) {
    let free: Vec<&MemoryNote> = notes.iter().filter(|n| !carries_keyword(n)).collect();
    if free.is_empty() || limit == 0 {
        return;
    }
    let start = free.len().saturating_sub(limit);
    let _ = writeln!(out, "\n## {}", heading);
    for note in &free[start..] {
        if note.tags().is_empty() {
            let _ = writeln!(out, "- {}", note.content());
        } else {
            let _ = writeln!(out, "- [{}] {}", note.tag_list(), note.content());
        }
    }
}

fn visualization_line(entry: &VisualizationEntry) -> String {
    let mut line = format!("- {}", entry.chart_type);
    if !entry.columns.is_empty() {
        let bindings: Vec<String> = entry
            .columns
            .iter()
            .map(|(role, column)| format!("{}: {}", role, column))
            .collect();
        let _ = write!(line, " ({})", bindings.join(", "));
    }
    if let Some(feedback) = &entry.feedback {
        let _ = write!(line, " feedback: {}", feedback);
    }
    line
}

/// Prepend the memory block to `base_prompt` and clear pending
/// reinjection.
pub fn inject(base_prompt: &str, state: &mut AgentState, options: &RenderOptions) -> String {
    let block = render(state, options);
    if state.pending_reinjection {
        debug!("Reinjected session memory for {}", state.user_id());
        state.pending_reinjection = false;
    }
    format!("{}{}{}", block, PROMPT_SEPARATOR, base_prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn precedence_state() -> AgentState {
        let mut state = AgentState::create("u1").unwrap();
        state.update_profile_str("domain", "retail").unwrap();
        state
            .save_note("User works in finance", &["domain"], Scope::Global)
            .unwrap();
        state
            .save_note("User works in healthcare", &["domain"], Scope::Session)
            .unwrap();
        state
    }

    #[test]
    fn test_session_note_wins_precedence() {
        let state = precedence_state();
        let text = render(&state, &RenderOptions::default());
        assert!(text.contains("- domain (session): User works in healthcare"));
        assert!(!text.contains("finance"));
        assert!(!text.contains("retail"));
    }

    #[test]
    fn test_global_note_beats_profile() {
        let mut state = AgentState::create("u1").unwrap();
        state.update_profile_str("domain", "retail").unwrap();
        state
            .save_note("User works in finance", &["domain"], Scope::Global)
            .unwrap();
        let text = render(&state, &RenderOptions::default());
        assert!(text.contains("- domain (global): User works in finance"));
        assert!(!text.contains("retail"));
    }

    #[test]
    fn test_profile_default_in_front_matter() {
        let mut state = AgentState::create("u1").unwrap();
        state
            .update_profile_str("preferred_chart_types", "bar, line")
            .unwrap();
        let text = render(&state, &RenderOptions::default());
        assert!(text.starts_with(
            "---\nuser_profile:\n  user_id: \"u1\"\n  preferred_chart_types: [\"bar\", \"line\"]\n---\n"
        ));
        assert!(!text.contains("## Resolved Preferences"));
    }

    #[test]
    fn test_restated_preference_wins_after_merge() {
        use crate::memory::deduplicate;
        use crate::memory::note::Tag;
        use chrono::{TimeZone, Utc};

        let at = |day| Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap();
        let domain = || Tag::parse_all(["domain"]).unwrap();
        let notes = vec![
            MemoryNote::new("note-1".into(), "Works in finance".into(), domain(), at(1), Scope::Global),
            MemoryNote::new("note-2".into(), "Works in healthcare".into(), domain(), at(2), Scope::Global),
            MemoryNote::new("note-3".into(), "User works in finance".into(), domain(), at(3), Scope::Global),
        ];
        let mut state = AgentState::create("u1").unwrap();
        state.global_memory.replace(deduplicate(notes));
        assert_eq!(state.store(Scope::Global).len(), 2);

        let text = render(&state, &RenderOptions::default());
        assert!(text.contains("- domain (global): User works in finance"));
        assert!(!text.contains("healthcare"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let mut state = precedence_state();
        state
            .record_visualization("bar", BTreeMap::new(), Some("liked".into()))
            .unwrap();
        let options = RenderOptions::default();
        assert_eq!(render(&state, &options), render(&state, &options));
    }

    #[test]
    fn test_free_notes_sections_and_limits() {
        let mut state = AgentState::create("u1").unwrap();
        for i in 0..3 {
            state
                .save_note(&format!("Global fact {}", i), &["misc"], Scope::Global)
                .unwrap();
        }
        state.save_note("Session fact", &["misc"], Scope::Session).unwrap();
        let options = RenderOptions {
            max_global_notes: 2,
            ..RenderOptions::default()
        };
        let text = render(&state, &options);
        assert!(text.contains("## Current Session Context\n- [misc] Session fact\n"));
        assert!(!text.contains("Global fact 0"));
        assert!(text.contains("Global fact 1"));
        assert!(text.contains("Global fact 2"));
    }

    #[test]
    fn test_brief_mode_and_reinjection() {
        let mut state = AgentState::create("u1").unwrap();
        state.save_note("Session fact", &["misc"], Scope::Session).unwrap();
        let options = RenderOptions {
            brief: true,
            usage_instructions: false,
            ..RenderOptions::default()
        };
        assert!(!render(&state, &options).contains("Session fact"));

        state.pending_reinjection = true;
        let prompt = inject("Plot sales by month", &mut state, &options);
        assert!(prompt.contains("## Session Context (Reinjected)\n- [misc] Session fact"));
        assert!(prompt.ends_with(&format!("{}Plot sales by month", PROMPT_SEPARATOR)));
        assert!(!state.pending_reinjection());
        assert!(!inject("again", &mut state, &options).contains("Session fact"));
    }

    #[test]
    fn test_visualization_lines() {
        let mut state = AgentState::create("u1").unwrap();
        let mut columns = BTreeMap::new();
        columns.insert("x".to_string(), "month".to_string());
        columns.insert("y".to_string(), "sales".to_string());
        state
            .record_visualization("line", columns, Some("liked".into()))
            .unwrap();
        let text = render(&state, &RenderOptions::default());
        assert!(text.contains("## Recent Visualizations\n- line (x: month, y: sales) feedback: liked\n"));
    }
}
