//! Memory notes and the per-scope stores that hold them.

use crate::{MemoryError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

/// Maximum distinct tags accepted by a single save.
pub const MAX_TAGS_PER_NOTE: usize = 5;

/// Reserved tag carried by notes produced from trimmed conversation.
pub const CONTEXT_SUMMARY_TAG: &str = "context-summary";

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_\-]*$").expect("static tag pattern"))
}

/// A validated keyword attached to a note.
///
/// Input is trimmed and lower-cased before validation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag(String);

impl Tag {
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(MemoryError::Validation("tag must not be empty".to_string()));
        }
        if !tag_pattern().is_match(&normalized) {
            return Err(MemoryError::Validation(format!(
                "malformed tag '{}': use letters, digits, '_' or '-'",
                raw.trim()
            )));
        }
        Ok(Self(normalized))
    }

    /// Parse a batch of tags into a set, rejecting any malformed entry.
    pub fn parse_all<I, S>(raw: I) -> Result<BTreeSet<Tag>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        raw.into_iter().map(|t| Tag::parse(t.as_ref())).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Tag {
    type Error = MemoryError;

    fn try_from(value: String) -> Result<Self> {
        Tag::parse(&value)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a note lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Ephemeral, cleared on consolidation
    Session,
    /// Durable across sessions
    Global,
}

impl Scope {
    pub const ALL: [Scope; 2] = [Scope::Session, Scope::Global];
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::Global => write!(f, "global"),
        }
    }
}

/// A single remembered fact or preference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryNote {
    id: String,
    content: String,
    created_at: DateTime<Utc>,
    /// Set when a merge folds a newer restatement into this note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: BTreeSet<Tag>,
    scope: Scope,
}

impl MemoryNote {
    pub(crate) fn new(
        id: String,
        content: String,
        tags: BTreeSet<Tag>,
        created_at: DateTime<Utc>,
        scope: Scope,
    ) -> Self {
        Self {
            id,
            content,
            created_at,
            updated_at: None,
            tags,
            scope,
        }
    }

    pub(crate) fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = (at > self.created_at).then_some(at);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Most recent time this note was written or restated.
    pub fn touched_at(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }

    pub fn tags(&self) -> &BTreeSet<Tag> {
        &self.tags
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.as_str() == tag)
    }

    /// Number of tags shared with `query`.
    pub fn tag_overlap(&self, query: &BTreeSet<Tag>) -> usize {
        self.tags.intersection(query).count()
    }

    /// Same note moved to another scope.
    pub(crate) fn rescoped(&self, scope: Scope) -> Self {
        Self {
            scope,
            ..self.clone()
        }
    }

    /// Comma-joined tag list for display.
    pub fn tag_list(&self) -> String {
        self.tags
            .iter()
            .map(Tag::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Insertion-ordered notes of one scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStore {
    #[serde(default)]
    notes: Vec<MemoryNote>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notes(&self) -> &[MemoryNote] {
        &self.notes
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&MemoryNote> {
        self.notes.iter().find(|n| n.id == id)
    }

    pub(crate) fn push(&mut self, note: MemoryNote) {
        debug_assert!(self.get(&note.id).is_none(), "duplicate note id {}", note.id);
        self.notes.push(note);
    }

    pub(crate) fn take(&mut self) -> Vec<MemoryNote> {
        std::mem::take(&mut self.notes)
    }

    pub(crate) fn replace(&mut self, notes: Vec<MemoryNote>) {
        self.notes = notes;
    }
}
