//! Per-user agent state and the memory operations over it.
//!
//! `AgentState` is the unit of persistence: it is created fresh or loaded
//! whole, mutated in memory during a session, and saved whole at
//! checkpoints. There is no process-wide instance; callers pass it around.

use super::note::{MemoryNote, MemoryStore, Scope, Tag, MAX_TAGS_PER_NOTE};
use super::profile::{Profile, ProfileKey, ProfileValue};
use super::storage::StateStorage;
use crate::{MemoryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Visualization history keeps only this many recent entries.
pub const MAX_VISUALIZATION_HISTORY: usize = 50;

const NOTE_ID_PREFIX: &str = "note-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Agent,
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

/// One message of the dialogue. A logical turn is a user message plus the
/// agent reply that follows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    pub index: u64,
}

/// A chart produced for the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationEntry {
    pub chart_type: String,
    /// Encoding role (x, y, color, ...) to column name
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// Counts reported to callers and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct MemorySummary {
    pub user_id: String,
    pub global_memory_count: usize,
    pub session_memory_count: usize,
    pub conversation_messages: usize,
    pub visualization_count: usize,
    pub pending_reinjection: bool,
    pub profile: Profile,
}

/// Complete memory state for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub(crate) user_id: String,
    pub(crate) profile: Profile,
    pub(crate) global_memory: MemoryStore,
    pub(crate) session_memory: MemoryStore,
    #[serde(default)]
    pub(crate) conversation_turns: Vec<ConversationTurn>,
    #[serde(default)]
    pub(crate) visualization_history: Vec<VisualizationEntry>,
    #[serde(default)]
    pub(crate) pending_reinjection: bool,
    /// Sequence index of the first message not yet summarised into memory
    #[serde(default)]
    pub(crate) trim_cursor: u64,
    #[serde(default)]
    pub(crate) next_note_seq: u64,
}

impl AgentState {
    /// Fresh state with empty stores and a profile holding only the id.
    pub fn create(user_id: &str) -> Result<Self> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(MemoryError::Validation("user id must not be empty".to_string()));
        }
        Ok(Self {
            user_id: user_id.to_string(),
            profile: Profile::for_user(user_id),
            global_memory: MemoryStore::new(),
            session_memory: MemoryStore::new(),
            conversation_turns: Vec::new(),
            visualization_history: Vec::new(),
            pending_reinjection: false,
            trim_cursor: 0,
            next_note_seq: 1,
        })
    }

    /// Load the persisted state for `user_id`.
    pub fn load(storage: &dyn StateStorage, user_id: &str) -> Result<Self> {
        let bytes = storage
            .read(user_id)?
            .ok_or_else(|| MemoryError::NotFound(user_id.to_string()))?;
        let state = Self::from_bytes(&bytes)?;
        if state.user_id != user_id {
            return Err(MemoryError::CorruptState(format!(
                "state for '{}' is keyed as '{}'",
                user_id, state.user_id
            )));
        }
        info!(
            "Loaded state for {} ({} global, {} session notes)",
            user_id,
            state.global_memory.len(),
            state.session_memory.len()
        );
        Ok(state)
    }

    /// Load the persisted state, or create a fresh one if none exists.
    pub fn load_or_create(storage: &dyn StateStorage, user_id: &str) -> Result<Self> {
        match Self::load(storage, user_id) {
            Err(MemoryError::NotFound(_)) => {
                debug!("No state for {}, starting fresh", user_id);
                Self::create(user_id)
            }
            other => other,
        }
    }

    /// Persist the whole aggregate, replacing any prior version.
    pub fn save(&self, storage: &dyn StateStorage) -> Result<()> {
        let bytes = self.to_bytes()?;
        storage.write(&self.user_id, &bytes)?;
        debug!("Saved state for {}", self.user_id);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Deserialize and check every structural invariant.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut state: Self = serde_json::from_slice(bytes)
            .map_err(|e| MemoryError::CorruptState(e.to_string()))?;
        state.validate()?;
        Ok(state)
    }

    fn validate(&mut self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(MemoryError::CorruptState("empty user_id".to_string()));
        }

        match self.profile.get(ProfileKey::UserId).cloned() {
            Some(ProfileValue::Text(id)) if id == self.user_id => {}
            None => {
                self.profile
                    .set(ProfileKey::UserId, ProfileValue::Text(self.user_id.clone()));
            }
            Some(other) => {
                return Err(MemoryError::CorruptState(format!(
                    "profile user_id '{}' does not match '{}'",
                    other, self.user_id
                )));
            }
        }

        let mut seen = HashSet::new();
        let mut max_seq = 0;
        for (scope, store) in [
            (Scope::Session, &self.session_memory),
            (Scope::Global, &self.global_memory),
        ] {
            for note in store.notes() {
                if !seen.insert(note.id().to_string()) {
                    return Err(MemoryError::CorruptState(format!(
                        "duplicate note id {}",
                        note.id()
                    )));
                }
                if note.content().trim().is_empty() {
                    return Err(MemoryError::CorruptState(format!(
                        "note {} has empty content",
                        note.id()
                    )));
                }
                if note.scope() != scope {
                    return Err(MemoryError::CorruptState(format!(
                        "note {} is scoped {} but stored in {} memory",
                        note.id(),
                        note.scope(),
                        scope
                    )));
                }
                if let Some(seq) = note_seq(note.id()) {
                    max_seq = max_seq.max(seq);
                }
            }
        }
        self.next_note_seq = self.next_note_seq.max(max_seq + 1);

        if self
            .conversation_turns
            .windows(2)
            .any(|w| w[0].index >= w[1].index)
        {
            return Err(MemoryError::CorruptState(
                "conversation turn indices are not increasing".to_string(),
            ));
        }

        Ok(())
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn store(&self, scope: Scope) -> &MemoryStore {
        match scope {
            Scope::Session => &self.session_memory,
            Scope::Global => &self.global_memory,
        }
    }

    pub(crate) fn store_mut(&mut self, scope: Scope) -> &mut MemoryStore {
        match scope {
            Scope::Session => &mut self.session_memory,
            Scope::Global => &mut self.global_memory,
        }
    }

    pub fn conversation(&self) -> &[ConversationTurn] {
        &self.conversation_turns
    }

    pub fn visualization_history(&self) -> &[VisualizationEntry] {
        &self.visualization_history
    }

    pub fn pending_reinjection(&self) -> bool {
        self.pending_reinjection
    }

    pub fn trim_cursor(&self) -> u64 {
        self.trim_cursor
    }

    pub(crate) fn next_id(&mut self) -> String {
        let id = format!("{}{}", NOTE_ID_PREFIX, self.next_note_seq);
        self.next_note_seq += 1;
        id
    }

    /// Create a note and append it to the store for `scope`.
    pub fn save_note<S: AsRef<str>>(
        &mut self,
        content: &str,
        tags: &[S],
        scope: Scope,
    ) -> Result<MemoryNote> {
        let content = content.trim();
        if content.is_empty() {
            return Err(MemoryError::Validation("note content must not be empty".to_string()));
        }
        let tags = Tag::parse_all(tags)?;
        if tags.len() > MAX_TAGS_PER_NOTE {
            return Err(MemoryError::Validation(format!(
                "at most {} tags per note, got {}",
                MAX_TAGS_PER_NOTE,
                tags.len()
            )));
        }

        let note = MemoryNote::new(self.next_id(), content.to_string(), tags, Utc::now(), scope);
        self.store_mut(scope).push(note.clone());
        debug!("Saved {} note {} [{}]", scope, note.id(), note.tag_list());
        Ok(note)
    }

    /// Notes whose tags intersect `tags`, session before global, then by
    /// overlap count and recency. An empty query matches nothing.
    pub fn search<S: AsRef<str>>(&self, tags: &[S], scopes: &[Scope]) -> Result<Vec<MemoryNote>> {
        let query = Tag::parse_all(tags)?;
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<(usize, usize, DateTime<Utc>, usize, &MemoryNote)> = Vec::new();
        for (rank, scope) in Scope::ALL.iter().enumerate() {
            if !scopes.contains(scope) {
                continue;
            }
            for (pos, note) in self.store(*scope).notes().iter().enumerate() {
                let overlap = note.tag_overlap(&query);
                if overlap > 0 {
                    hits.push((rank, overlap, note.created_at(), pos, note));
                }
            }
        }

        hits.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(b.1.cmp(&a.1))
                .then(b.2.cmp(&a.2))
                .then(b.3.cmp(&a.3))
        });
        Ok(hits.into_iter().map(|h| h.4.clone()).collect())
    }

    /// All notes of the given scopes, session first, in store order.
    pub fn list_notes(&self, scopes: &[Scope]) -> Vec<&MemoryNote> {
        Scope::ALL
            .iter()
            .filter(|s| scopes.contains(s))
            .flat_map(|s| self.store(*s).notes())
            .collect()
    }

    /// Set a profile attribute. Returns the previous value.
    pub fn update_profile(&mut self, key: ProfileKey, value: ProfileValue) -> Result<Option<ProfileValue>> {
        if key == ProfileKey::UserId && value != ProfileValue::Text(self.user_id.clone()) {
            return Err(MemoryError::Validation(
                "user_id is the state key and cannot be changed".to_string(),
            ));
        }
        if key.is_list() != matches!(value, ProfileValue::List(_)) {
            return Err(MemoryError::Validation(format!(
                "{} expects a {} value",
                key,
                if key.is_list() { "list" } else { "string" }
            )));
        }
        info!("Profile {} = {}", key, value);
        Ok(self.profile.set(key, value))
    }

    /// String form used by the tool layer: resolves the key by name.
    pub fn update_profile_str(&mut self, key: &str, value: &str) -> Result<Option<ProfileValue>> {
        let key: ProfileKey = key.parse()?;
        let value = ProfileValue::from_input(key, value)?;
        self.update_profile(key, value)
    }

    /// Append a chart to the visualization history.
    pub fn record_visualization(
        &mut self,
        chart_type: &str,
        columns: BTreeMap<String, String>,
        feedback: Option<String>,
    ) -> Result<&VisualizationEntry> {
        let chart_type = chart_type.trim().to_lowercase();
        if chart_type.is_empty() {
            return Err(MemoryError::Validation("chart type must not be empty".to_string()));
        }
        let feedback = feedback
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty());

        self.visualization_history.push(VisualizationEntry {
            chart_type,
            columns,
            created_at: Utc::now(),
            feedback,
        });
        if self.visualization_history.len() > MAX_VISUALIZATION_HISTORY {
            let excess = self.visualization_history.len() - MAX_VISUALIZATION_HISTORY;
            self.visualization_history.drain(..excess);
        }
        let entry = &self.visualization_history[self.visualization_history.len() - 1];
        debug!("Recorded {} visualization", entry.chart_type);
        Ok(entry)
    }

    /// The `limit` most recent visualizations, oldest first.
    pub fn recent_visualizations(&self, limit: usize) -> &[VisualizationEntry] {
        let start = self.visualization_history.len().saturating_sub(limit);
        &self.visualization_history[start..]
    }

    /// Append a message to the conversation with the next sequence index.
    pub fn record_turn(&mut self, role: TurnRole, content: &str) -> Result<&ConversationTurn> {
        if content.trim().is_empty() {
            return Err(MemoryError::Validation("message must not be empty".to_string()));
        }
        let index = self
            .conversation_turns
            .last()
            .map(|t| t.index + 1)
            .unwrap_or(self.trim_cursor);
        self.conversation_turns.push(ConversationTurn {
            role,
            content: content.to_string(),
            index,
        });
        Ok(&self.conversation_turns[self.conversation_turns.len() - 1])
    }

    pub fn memory_summary(&self) -> MemorySummary {
        MemorySummary {
            user_id: self.user_id.clone(),
            global_memory_count: self.global_memory.len(),
            session_memory_count: self.session_memory.len(),
            conversation_messages: self.conversation_turns.len(),
            visualization_count: self.visualization_history.len(),
            pending_reinjection: self.pending_reinjection,
            profile: self.profile.clone(),
        }
    }
}

fn note_seq(id: &str) -> Option<u64> {
    id.strip_prefix(NOTE_ID_PREFIX)?.parse().ok()
}
