//! Memory module for vizmem
//!
//! Provides the per-user state model, conversation trimming, consolidation
//! of session notes into long-term memory, and prompt injection.

mod consolidate;
mod inject;
mod note;
mod profile;
mod state;
mod storage;
mod trim;

pub use consolidate::{
    assess_quality, consolidate_session_to_global, consolidate_with, deduplicate,
    deduplicate_with, prune_global, similarity, ConsolidationStats, PrunePolicy, PruneStats,
    QualityReport,
};
pub use inject::{inject, render, resolve, RenderOptions, Resolved, PROMPT_SEPARATOR};
pub use note::{MemoryNote, MemoryStore, Scope, Tag, CONTEXT_SUMMARY_TAG, MAX_TAGS_PER_NOTE};
pub use profile::{Profile, ProfileKey, ProfileValue};
pub use state::{
    AgentState, ConversationTurn, MemorySummary, TurnRole, VisualizationEntry,
    MAX_VISUALIZATION_HISTORY,
};
pub use storage::{FileStorage, MemoryStorage, StateStorage};
pub use trim::{
    conversation_stats, estimate_tokens, evaluate, logical_turns, should_trim, trim, trim_state,
    ConversationStats, TrimOutcome, TrimState, EMPTY_SUMMARY,
};
