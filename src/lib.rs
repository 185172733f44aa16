//! vizmem - conversational memory for charting agents
//!
//! Keeps per-user state for an agent that turns natural-language requests
//! into chart code:
//! - Structured profile plus session and global memory notes
//! - Turn-based conversation trimming with overflow kept as session notes
//! - Consolidation of session memory into global memory with deduplication
//! - Prompt injection that resolves conflicting preferences by precedence

pub mod memory;
pub mod session;
pub mod tools;

pub use memory::{AgentState, MemoryNote, ProfileKey, ProfileValue, Scope, Tag};
pub use session::MemorySession;
pub use tools::MemoryTools;

use memory::{PrunePolicy, RenderOptions};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default number of logical turns kept verbatim before trimming.
pub const DEFAULT_MAX_TURNS: usize = 10;

/// Default similarity threshold for merging notes.
pub const DEFAULT_DEDUP_THRESHOLD: f64 = 0.75;

/// Configuration for vizmem
#[derive(Debug, Clone)]
pub struct VizmemConfig {
    /// Directory holding one state file per user
    pub state_dir: PathBuf,

    /// Logical turns kept verbatim in the conversation
    pub max_turns: usize,

    /// Similarity at or above which two notes are merged
    pub dedup_threshold: f64,

    /// Injection rendering options
    pub render: RenderOptions,

    /// Global memory maintenance policy
    pub prune: PrunePolicy,

    /// Whether to log at debug level
    pub verbose: bool,
}

impl VizmemConfig {
    pub fn new(home: PathBuf) -> Self {
        Self {
            state_dir: home.join("states"),
            max_turns: DEFAULT_MAX_TURNS,
            dedup_threshold: DEFAULT_DEDUP_THRESHOLD,
            render: RenderOptions::default(),
            prune: PrunePolicy::default(),
            verbose: false,
        }
    }

    /// Build the config for `home`, merging `home/config.toml` when present.
    pub fn load(home: &Path) -> Result<Self> {
        let mut config = Self::new(home.to_path_buf());
        let config_file = home.join("config.toml");
        if !config_file.exists() {
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_file)?;
        let file: ConfigToml = toml::from_str(&content).map_err(|e| {
            MemoryError::Validation(format!("invalid {}: {}", config_file.display(), e))
        })?;
        debug!("Loaded config from {}", config_file.display());
        config.apply(file);
        Ok(config)
    }

    fn apply(&mut self, file: ConfigToml) {
        if let Some(dir) = file.state_dir {
            self.state_dir = dir;
        }
        if let Some(max_turns) = file.max_turns {
            self.max_turns = max_turns;
        }
        if let Some(threshold) = file.dedup_threshold {
            if (0.0..=1.0).contains(&threshold) && threshold > 0.0 {
                self.dedup_threshold = threshold;
            } else {
                warn!("Ignoring dedup_threshold {} outside (0, 1]", threshold);
            }
        }
        if let Some(render) = file.render {
            if let Some(v) = render.max_global_notes {
                self.render.max_global_notes = v;
            }
            if let Some(v) = render.max_session_notes {
                self.render.max_session_notes = v;
            }
            if let Some(v) = render.history_limit {
                self.render.history_limit = v;
            }
            if let Some(v) = render.brief {
                self.render.brief = v;
            }
            if let Some(v) = render.usage_instructions {
                self.render.usage_instructions = v;
            }
        }
        if let Some(prune) = file.prune {
            if let Some(v) = prune.max_age_days {
                self.prune.max_age_days = v;
            }
            if let Some(v) = prune.max_notes {
                self.prune.max_notes = v;
            }
        }
    }

    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = dir;
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_dedup_threshold(mut self, threshold: f64) -> Self {
        self.dedup_threshold = threshold;
        self
    }

    pub fn with_render(mut self, render: RenderOptions) -> Self {
        self.render = render;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Partial config.toml; every field is optional and overrides a default.
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    state_dir: Option<PathBuf>,
    max_turns: Option<usize>,
    dedup_threshold: Option<f64>,
    render: Option<RenderToml>,
    prune: Option<PruneToml>,
}

#[derive(Debug, Default, Deserialize)]
struct RenderToml {
    max_global_notes: Option<usize>,
    max_session_notes: Option<usize>,
    history_limit: Option<usize>,
    brief: Option<bool>,
    usage_instructions: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct PruneToml {
    max_age_days: Option<i64>,
    max_notes: Option<usize>,
}

/// Resolve the vizmem home directory: `VIZMEM_HOME`, else `~/.vizmem`.
pub fn resolve_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("VIZMEM_HOME") {
        return Ok(PathBuf::from(home));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| MemoryError::Persistence("could not find home directory".to_string()))?;
    Ok(home.join(".vizmem"))
}

/// Result type for vizmem operations
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Errors surfaced by the memory core
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("No persisted state for user '{0}'")]
    NotFound(String),

    #[error("Corrupt state: {0}")]
    CorruptState(String),

    #[error("Unknown profile attribute: {0}")]
    UnknownAttribute(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
