//! Memory operations exposed as callable tools.
//!
//! Tool calls arrive as a name plus JSON arguments, either from a host that
//! speaks structured tool calls or from a `TOOL: name({...})` line in a
//! model response. Results are JSON values; errors go back to the caller.

use crate::memory::{AgentState, MemoryNote, Scope, MAX_TAGS_PER_NOTE};
use crate::{MemoryError, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::debug;

pub const SAVE_MEMORY_NOTE: &str = "save_memory_note";
pub const SEARCH_MEMORIES: &str = "search_memories";
pub const UPDATE_PROFILE: &str = "update_profile";
pub const RECORD_VISUALIZATION: &str = "record_visualization";

/// Tag used when nothing in the standard vocabulary matches.
const FALLBACK_TAG: &str = "general";

/// Standard vocabulary: a tag and the words that suggest it. Suggested
/// tags are topics only; the profile keywords (`chart_type`, `color`,
/// `domain`, `audience`) make a note override the profile, so only an
/// explicit caller may attach them.
const VOCABULARY: &[(&str, &[&str])] = &[
    (
        "chart",
        &[
            "chart", "plot", "graph", "bar", "line", "scatter", "pie", "histogram", "heatmap",
            "box", "violin", "area",
        ],
    ),
    ("bar", &["bar"]),
    ("line", &["line"]),
    ("scatter", &["scatter"]),
    ("pie", &["pie"]),
    ("histogram", &["histogram"]),
    ("heatmap", &["heatmap"]),
    (
        "theme",
        &["color", "colour", "colors", "palette", "theme", "dark", "light", "colorblind"],
    ),
    (
        "industry",
        &["finance", "healthcare", "retail", "marketing", "industry", "sales", "education"],
    ),
    (
        "presentation",
        &["audience", "executive", "executives", "technical", "stakeholders", "board", "presentation"],
    ),
    ("preference", &["prefer", "prefers", "like", "likes", "want", "wants", "always", "never"]),
];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SaveNoteArgs {
    content: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    scope: Option<Scope>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchArgs {
    tags: Vec<String>,
    #[serde(default)]
    scopes: Option<Vec<Scope>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateProfileArgs {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecordVisualizationArgs {
    chart_type: String,
    #[serde(default)]
    columns: BTreeMap<String, String>,
    #[serde(default)]
    feedback: Option<String>,
}

/// A tool call recognized in text.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub args: Value,
}

/// Tool dispatcher over one user's state
pub struct MemoryTools<'a> {
    state: &'a mut AgentState,
}

impl<'a> MemoryTools<'a> {
    pub fn new(state: &'a mut AgentState) -> Self {
        Self { state }
    }

    /// Run the tool `name` with JSON `args`.
    pub fn execute(&mut self, name: &str, args: Value) -> Result<Value> {
        debug!("Tool call {}", name);
        match name {
            SAVE_MEMORY_NOTE => {
                let args: SaveNoteArgs = parse_args(name, args)?;
                let tags = match args.tags {
                    Some(tags) if !tags.is_empty() => tags,
                    _ => suggest_tags(&args.content),
                };
                let scope = args.scope.unwrap_or(Scope::Session);
                let note = self.state.save_note(&args.content, &tags, scope)?;
                Ok(json!({
                    "saved": true,
                    "id": note.id(),
                    "scope": note.scope(),
                    "tags": note.tags(),
                }))
            }
            SEARCH_MEMORIES => {
                let args: SearchArgs = parse_args(name, args)?;
                let scopes = args.scopes.unwrap_or_else(|| Scope::ALL.to_vec());
                let hits = self.state.search(&args.tags, &scopes)?;
                Ok(json!({
                    "count": hits.len(),
                    "notes": hits.iter().map(note_json).collect::<Vec<_>>(),
                }))
            }
            UPDATE_PROFILE => {
                let args: UpdateProfileArgs = parse_args(name, args)?;
                let previous = self.state.update_profile_str(&args.key, &args.value)?;
                let key: crate::ProfileKey = args.key.parse()?;
                Ok(json!({
                    "key": key,
                    "value": self.state.profile().get(key),
                    "previous": previous,
                }))
            }
            RECORD_VISUALIZATION => {
                let args: RecordVisualizationArgs = parse_args(name, args)?;
                let entry = self
                    .state
                    .record_visualization(&args.chart_type, args.columns, args.feedback)?
                    .clone();
                Ok(json!({
                    "recorded": true,
                    "chart_type": entry.chart_type,
                    "history_len": self.state.visualization_history().len(),
                }))
            }
            other => Err(MemoryError::Validation(format!("unknown tool '{}'", other))),
        }
    }

    /// Run a parsed `TOOL:` call.
    pub fn execute_call(&mut self, call: ToolCall) -> Result<Value> {
        self.execute(&call.name, call.args)
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, args: Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| MemoryError::Validation(format!("invalid arguments for {}: {}", tool, e)))
}

fn note_json(note: &MemoryNote) -> Value {
    json!({
        "id": note.id(),
        "content": note.content(),
        "tags": note.tags(),
        "scope": note.scope(),
        "created_at": note.created_at(),
    })
}

/// JSON schemas describing the tools and their arguments.
pub fn schemas() -> Value {
    json!([
        {
            "name": SAVE_MEMORY_NOTE,
            "description": "Save a fact or preference the user stated",
            "parameters": {
                "type": "object",
                "properties": {
                    "content": {"type": "string"},
                    "tags": {"type": "array", "items": {"type": "string"}, "maxItems": MAX_TAGS_PER_NOTE},
                    "scope": {"type": "string", "enum": ["session", "global"]}
                },
                "required": ["content"]
            }
        },
        {
            "name": SEARCH_MEMORIES,
            "description": "Find notes sharing any of the given tags",
            "parameters": {
                "type": "object",
                "properties": {
                    "tags": {"type": "array", "items": {"type": "string"}},
                    "scopes": {"type": "array", "items": {"type": "string", "enum": ["session", "global"]}}
                },
                "required": ["tags"]
            }
        },
        {
            "name": UPDATE_PROFILE,
            "description": "Set a profile attribute: preferred_chart_types, color_scheme, domain or audience",
            "parameters": {
                "type": "object",
                "properties": {
                    "key": {"type": "string"},
                    "value": {"type": "string"}
                },
                "required": ["key", "value"]
            }
        },
        {
            "name": RECORD_VISUALIZATION,
            "description": "Log a chart produced for the user",
            "parameters": {
                "type": "object",
                "properties": {
                    "chart_type": {"type": "string"},
                    "columns": {"type": "object", "additionalProperties": {"type": "string"}},
                    "feedback": {"type": "string"}
                },
                "required": ["chart_type"]
            }
        }
    ])
}

/// Propose up to five tags for `content` from the standard vocabulary.
pub fn suggest_tags(content: &str) -> Vec<String> {
    let words: Vec<String> = content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();

    let mut tags: Vec<String> = VOCABULARY
        .iter()
        .filter(|(_, triggers)| {
            words
                .iter()
                .any(|w| triggers.contains(&w.as_str()) || triggers.contains(&w.trim_end_matches('s')))
        })
        .map(|(tag, _)| tag.to_string())
        .take(MAX_TAGS_PER_NOTE)
        .collect();

    if tags.is_empty() {
        tags.push(FALLBACK_TAG.to_string());
    }
    tags
}

fn tool_call_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"TOOL:\s*(\w+)\s*\((.*)\)").expect("static tool pattern"))
}

/// Find a `TOOL: name({json})` call in `text`.
///
/// Returns `Ok(None)` when there is no call and an error when the
/// arguments are not a JSON object.
pub fn parse_tool_call(text: &str) -> Result<Option<ToolCall>> {
    let Some(caps) = tool_call_pattern().captures(text) else {
        return Ok(None);
    };
    let name = caps[1].to_string();
    let raw = caps[2].trim();
    let args = if raw.is_empty() {
        json!({})
    } else {
        serde_json::from_str::<Value>(raw)
            .map_err(|e| MemoryError::Validation(format!("arguments for {} are not JSON: {}", name, e)))?
    };
    if !args.is_object() {
        return Err(MemoryError::Validation(format!(
            "arguments for {} must be a JSON object",
            name
        )));
    }
    Ok(Some(ToolCall { name, args }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ProfileKey;
    use crate::ProfileValue;

    #[test]
    fn test_save_and_search_through_tools() {
        let mut state = AgentState::create("u1").unwrap();
        let mut tools = MemoryTools::new(&mut state);
        let saved = tools
            .execute(
                SAVE_MEMORY_NOTE,
                json!({"content": "User prefers horizontal bar charts", "tags": ["chart_type", "bar"]}),
            )
            .unwrap();
        assert_eq!(saved["scope"], "session");
        assert_eq!(saved["tags"], json!(["bar", "chart_type"]));

        let found = tools
            .execute(SEARCH_MEMORIES, json!({"tags": ["bar"]}))
            .unwrap();
        assert_eq!(found["count"], 1);
        assert_eq!(found["notes"][0]["content"], "User prefers horizontal bar charts");
    }

    #[test]
    fn test_save_without_tags_suggests_them() {
        let mut state = AgentState::create("u1").unwrap();
        let saved = MemoryTools::new(&mut state)
            .execute(SAVE_MEMORY_NOTE, json!({"content": "Presenting to executives"}))
            .unwrap();
        assert_eq!(saved["tags"], json!(["presentation"]));
    }

    #[test]
    fn test_untagged_note_keeps_profile_defaults() {
        use crate::memory::{render, RenderOptions};

        let mut state = AgentState::create("u1").unwrap();
        state.update_profile_str("domain", "retail").unwrap();
        state
            .update_profile_str("preferred_chart_types", "bar, line")
            .unwrap();
        MemoryTools::new(&mut state)
            .execute(
                SAVE_MEMORY_NOTE,
                json!({"content": "Label the axes on every sales chart"}),
            )
            .unwrap();

        let text = render(&state, &RenderOptions::default());
        assert!(text.contains("  domain: \"retail\"\n"));
        assert!(text.contains("  preferred_chart_types: [\"bar\", \"line\"]\n"));
        assert!(!text.contains("## Resolved Preferences"));
        assert!(text.contains("Label the axes on every sales chart"));
    }

    #[test]
    fn test_update_profile_tool() {
        let mut state = AgentState::create("u1").unwrap();
        let out = MemoryTools::new(&mut state)
            .execute(UPDATE_PROFILE, json!({"key": "industry", "value": "finance"}))
            .unwrap();
        assert_eq!(out["key"], "domain");
        assert_eq!(out["value"], "finance");
        assert!(out["previous"].is_null());
        assert_eq!(
            state.profile().get(ProfileKey::Domain),
            Some(&ProfileValue::Text("finance".into()))
        );
    }

    #[test]
    fn test_tool_errors() {
        let mut state = AgentState::create("u1").unwrap();
        let mut tools = MemoryTools::new(&mut state);
        assert!(matches!(
            tools.execute("delete_everything", json!({})),
            Err(MemoryError::Validation(_))
        ));
        assert!(matches!(
            tools.execute(SEARCH_MEMORIES, json!({"tag": "bar"})),
            Err(MemoryError::Validation(_))
        ));
        assert!(matches!(
            tools.execute(UPDATE_PROFILE, json!({"key": "mood", "value": "happy"})),
            Err(MemoryError::UnknownAttribute(_))
        ));
    }

    #[test]
    fn test_record_visualization_tool() {
        let mut state = AgentState::create("u1").unwrap();
        let out = MemoryTools::new(&mut state)
            .execute(
                RECORD_VISUALIZATION,
                json!({"chart_type": "Scatter", "columns": {"x": "age", "y": "income"}, "feedback": "liked"}),
            )
            .unwrap();
        assert_eq!(out["chart_type"], "scatter");
        assert_eq!(state.visualization_history()[0].columns["y"], "income");
    }

    #[test]
    fn test_suggest_tags() {
        assert_eq!(
            suggest_tags("User prefers dark bar charts"),
            vec!["chart", "bar", "theme", "preference"]
        );
        assert_eq!(suggest_tags("Quarterly numbers"), vec![FALLBACK_TAG]);
        assert!(suggest_tags("bar line scatter pie histogram heatmap").len() <= MAX_TAGS_PER_NOTE);

        let keywords: Vec<&str> = ProfileKey::overridable().filter_map(|k| k.keyword()).collect();
        for text in [
            "Dark palette for the finance board presentation",
            "Executives want a line chart of sales",
            "Audience is technical; domain is healthcare; colors matter",
        ] {
            assert!(suggest_tags(text).iter().all(|t| !keywords.contains(&t.as_str())));
        }
    }

    #[test]
    fn test_parse_tool_call() {
        let call = parse_tool_call(r#"Sure. TOOL: search_memories({"tags": ["bar"]})"#)
            .unwrap()
            .unwrap();
        assert_eq!(call.name, SEARCH_MEMORIES);
        assert_eq!(call.args, json!({"tags": ["bar"]}));

        assert!(parse_tool_call("no tools here").unwrap().is_none());
        assert!(parse_tool_call("TOOL: search_memories(bar)").is_err());
        assert!(parse_tool_call("TOOL: search_memories([1])").is_err());
    }

    #[test]
    fn test_schemas_cover_every_tool() {
        let names: Vec<String> = schemas()
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec![SAVE_MEMORY_NOTE, SEARCH_MEMORIES, UPDATE_PROFILE, RECORD_VISUALIZATION]
        );
    }
}
