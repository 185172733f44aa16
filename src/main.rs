//! vizmem CLI
//!
//! Inspect and drive the conversational memory of a charting agent.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vizmem::memory::{
    conversation_stats, consolidate_with, inject, prune_global, AgentState, FileStorage,
    PrunePolicy, Scope, StateStorage,
};
use vizmem::{resolve_home, MemorySession, VizmemConfig};

/// vizmem - conversational memory for charting agents
#[derive(Parser, Debug)]
#[command(name = "vizmem")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding per-user state files
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Verbose output: log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Remove a stale write lock left by a crashed process
    #[arg(long, global = true)]
    force: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create empty state for a user
    Init { user: String },

    /// Show a user's profile, notes and history
    Show {
        user: String,
        /// Print the raw state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Save a memory note
    Note {
        user: String,
        content: String,
        /// Tag for the note (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        /// Save to global memory instead of session memory
        #[arg(long)]
        global: bool,
    },

    /// Find notes by tag
    Search {
        user: String,
        #[arg(required = true)]
        tags: Vec<String>,
    },

    /// Show the profile, or set one attribute
    Profile {
        user: String,
        key: Option<String>,
        value: Option<String>,
    },

    /// Record a chart produced for the user
    Viz {
        user: String,
        chart_type: String,
        /// Encoding binding as role=column (repeatable)
        #[arg(short, long = "column", value_parser = parse_binding)]
        columns: Vec<(String, String)>,
        #[arg(long)]
        feedback: Option<String>,
    },

    /// Move session memory into global memory
    Consolidate { user: String },

    /// Drop old global notes and cap their number
    Prune {
        user: String,
        #[arg(long)]
        max_age_days: Option<i64>,
        #[arg(long)]
        max_notes: Option<usize>,
    },

    /// Print the memory block followed by a base prompt
    Inject {
        user: String,
        /// Base prompt; read from stdin when omitted
        base: Option<String>,
        /// Omit the session section unless reinjection is pending
        #[arg(long)]
        brief: bool,
    },

    /// List users with saved state
    Users,

    /// Line-driven session over stdin
    Chat {
        user: String,
        /// Logical turns kept verbatim before trimming
        #[arg(long)]
        max_turns: Option<usize>,
        /// Base prompt used by /prompt
        #[arg(long, default_value = "")]
        base: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let home = resolve_home()?;
    let mut config = VizmemConfig::load(&home)
        .with_context(|| format!("Failed to load config from {}", home.display()))?
        .with_verbose(cli.verbose);
    if let Some(dir) = cli.state_dir {
        config = config.with_state_dir(dir);
    }

    run(cli.command, config, cli.force).await
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn parse_binding(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((role, column)) if !role.trim().is_empty() && !column.trim().is_empty() => {
            Ok((role.trim().to_string(), column.trim().to_string()))
        }
        _ => Err(format!("expected role=column, got '{}'", raw)),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_storage(config: &VizmemConfig, force: bool) -> anyhow::Result<FileStorage> {
    let storage = FileStorage::new(&config.state_dir)
        .with_context(|| format!("Failed to open state directory {}", config.state_dir.display()))?;
    Ok(storage.with_force(force))
}

fn load(storage: &FileStorage, user: &str) -> anyhow::Result<AgentState> {
    AgentState::load(storage, user).with_context(|| format!("Failed to load state for '{}'", user))
}

async fn run(command: Command, config: VizmemConfig, force: bool) -> anyhow::Result<()> {
    let storage = open_storage(&config, force)?;

    match command {
        Command::Init { user } => {
            if storage.exists(&user) {
                anyhow::bail!("State for '{}' already exists", user);
            }
            let state = AgentState::create(&user)?;
            state.save(&storage)?;
            println!("Created {}", storage.state_path(&user).display());
        }

        Command::Show { user, json } => {
            let state = load(&storage, &user)?;
            if json {
                print_json(&state)?;
            } else {
                show(&state, &config);
            }
        }

        Command::Note {
            user,
            content,
            tags,
            global,
        } => {
            let mut state = AgentState::load_or_create(&storage, &user)?;
            let tags = if tags.is_empty() {
                vizmem::tools::suggest_tags(&content)
            } else {
                tags
            };
            let scope = if global { Scope::Global } else { Scope::Session };
            let note = state.save_note(&content, &tags, scope)?;
            state.save(&storage)?;
            println!("Saved {} ({}) [{}]", note.id(), note.scope(), note.tag_list());
        }

        Command::Search { user, tags } => {
            let state = load(&storage, &user)?;
            let hits = state.search(&tags, &Scope::ALL)?;
            if hits.is_empty() {
                println!("No matching notes");
            }
            for note in hits {
                println!("{} ({}) [{}] {}", note.id(), note.scope(), note.tag_list(), note.content());
            }
        }

        Command::Profile { user, key, value } => {
            let mut state = AgentState::load_or_create(&storage, &user)?;
            match (key, value) {
                (Some(key), Some(value)) => {
                    let previous = state.update_profile_str(&key, &value)?;
                    state.save(&storage)?;
                    match previous {
                        Some(prev) => println!("{}: {} -> {}", key, prev, value),
                        None => println!("{}: {}", key, value),
                    }
                }
                (Some(key), None) => {
                    let key: vizmem::ProfileKey = key.parse()?;
                    match state.profile().get(key) {
                        Some(value) => println!("{}", value),
                        None => println!("(unset)"),
                    }
                }
                _ => {
                    for (key, value) in state.profile().entries() {
                        println!("{}: {}", key, value);
                    }
                }
            }
        }

        Command::Viz {
            user,
            chart_type,
            columns,
            feedback,
        } => {
            let mut state = AgentState::load_or_create(&storage, &user)?;
            let columns: BTreeMap<String, String> = columns.into_iter().collect();
            let chart = state
                .record_visualization(&chart_type, columns, feedback)?
                .chart_type
                .clone();
            state.save(&storage)?;
            println!(
                "Recorded {} ({} in history)",
                chart,
                state.visualization_history().len()
            );
        }

        Command::Consolidate { user } => {
            let mut state = load(&storage, &user)?;
            let stats = consolidate_with(&mut state, config.dedup_threshold);
            state.save(&storage)?;
            print_json(&stats)?;
        }

        Command::Prune {
            user,
            max_age_days,
            max_notes,
        } => {
            let mut state = load(&storage, &user)?;
            let policy = PrunePolicy {
                max_age_days: max_age_days.unwrap_or(config.prune.max_age_days),
                max_notes: max_notes.unwrap_or(config.prune.max_notes),
            };
            let stats = prune_global(&mut state, &policy);
            state.save(&storage)?;
            print_json(&stats)?;
        }

        Command::Inject { user, base, brief } => {
            let mut state = load(&storage, &user)?;
            let base = match base {
                Some(base) => base,
                None => io::read_to_string(io::stdin()).context("Failed to read base prompt")?,
            };
            let mut options = config.render.clone();
            options.brief |= brief;
            let was_pending = state.pending_reinjection();
            println!("{}", inject(&base, &mut state, &options));
            if was_pending {
                state.save(&storage)?;
            }
        }

        Command::Users => {
            for user in storage.list_users()? {
                println!("{}", user);
            }
        }

        Command::Chat {
            user,
            max_turns,
            base,
        } => {
            let config = match max_turns {
                Some(max_turns) => config.with_max_turns(max_turns),
                None => config,
            };
            run_chat(storage, config, user, base).await?;
        }
    }

    Ok(())
}

fn show(state: &AgentState, config: &VizmemConfig) {
    let summary = state.memory_summary();
    println!("User: {}", summary.user_id);
    println!("Profile:");
    for (key, value) in state.profile().entries() {
        println!("  {}: {}", key, value);
    }

    for scope in Scope::ALL {
        let notes = state.list_notes(&[scope]);
        println!("{} memory ({}):", scope, notes.len());
        for note in notes {
            println!("  {} [{}] {}", note.id(), note.tag_list(), note.content());
        }
    }

    let stats = conversation_stats(state.conversation(), config.max_turns);
    println!(
        "Conversation: {} messages, ~{} tokens{}",
        stats.total_messages,
        stats.estimated_tokens,
        if stats.needs_trimming { " (needs trimming)" } else { "" }
    );
    println!("Visualizations: {}", summary.visualization_count);
    if summary.pending_reinjection {
        println!("Session memory will be reinjected into the next prompt");
    }
}

async fn run_chat(
    storage: FileStorage,
    config: VizmemConfig,
    user: String,
    base: String,
) -> anyhow::Result<()> {
    let mut session = MemorySession::open(storage, &user, config)?;
    info!("Chat started for {}", user);

    let (line_tx, mut line_rx) = mpsc::channel::<String>(32);

    // Read stdin on a blocking thread
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
    });

    let mut stdout = io::stdout();
    drive_chat(&mut session, &mut line_rx, &base, &mut stdout).await?;

    let (_, stats) = session.finish().context("Failed to save state at end of session")?;
    writeln!(stdout, "{}", serde_json::to_string(&stats)?)?;
    Ok(())
}

/// Handle chat lines until `/end` or the channel closes. Every turn is
/// checkpointed; a failed save is reported to `out`.
async fn drive_chat<S: StateStorage>(
    session: &mut MemorySession<S>,
    lines: &mut mpsc::Receiver<String>,
    base: &str,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    while let Some(line) = lines.recv().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/end" => break,
            "/prompt" => {
                let prompt = session.prompt(base);
                writeln!(out, "{}", prompt)?;
                continue;
            }
            "/stats" => {
                let state = session.state();
                let stats = conversation_stats(state.conversation(), session.config().max_turns);
                writeln!(out, "{}", serde_json::to_string(&stats)?)?;
                continue;
            }
            _ => {}
        }

        if let Some(reply) = line.strip_prefix("agent:") {
            if let Err(e) = session.agent_reply(reply.trim()) {
                writeln!(out, "error: {}", e)?;
                continue;
            }
            report_tool(session, reply, out)?;
        } else if line.starts_with("TOOL:") {
            report_tool(session, line, out)?;
        } else {
            match session.user_message(line) {
                Ok(0) => {}
                Ok(removed) => writeln!(out, "(trimmed {} turns into session memory)", removed)?,
                Err(e) => writeln!(out, "error: {}", e)?,
            }
        }

        if let Err(e) = session.checkpoint() {
            error!("Checkpoint failed: {}", e);
            writeln!(out, "save error: {} (this turn is not persisted)", e)?;
        }
        out.flush()?;
    }
    Ok(())
}

fn report_tool<S: StateStorage>(
    session: &mut MemorySession<S>,
    text: &str,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    match session.call_tool_text(text) {
        Ok(Some(result)) => writeln!(out, "{}", serde_json::to_string(&result)?)?,
        Ok(None) => {}
        Err(e) => writeln!(out, "tool error: {}", e)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vizmem::memory::MemoryStorage;
    use vizmem::MemoryError;

    /// Storage that accepts reads and refuses every write.
    struct ReadOnlyStorage;

    impl StateStorage for ReadOnlyStorage {
        fn read(&self, _user_id: &str) -> vizmem::Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn write(&self, user_id: &str, _bytes: &[u8]) -> vizmem::Result<()> {
            Err(MemoryError::Persistence(format!("'{}' is locked", user_id)))
        }

        fn list_users(&self) -> vizmem::Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    async fn chat_output<S: StateStorage>(session: &mut MemorySession<S>, lines: &[&str]) -> String {
        let (tx, mut rx) = mpsc::channel::<String>(lines.len().max(1));
        for line in lines {
            tx.send(line.to_string()).await.unwrap();
        }
        drop(tx);
        let mut out = Vec::new();
        drive_chat(session, &mut rx, "base", &mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_chat_reports_failed_checkpoint() {
        let config = VizmemConfig::new(PathBuf::from("/unused"));
        let mut session = MemorySession::open(ReadOnlyStorage, "u1", config).unwrap();
        let out = chat_output(&mut session, &["hello"]).await;
        assert!(out.contains("save error"));
        assert!(out.contains("not persisted"));
        assert_eq!(session.state().conversation().len(), 1);
    }

    #[tokio::test]
    async fn test_chat_lines_drive_session() {
        let config = VizmemConfig::new(PathBuf::from("/unused"));
        let mut session = MemorySession::open(MemoryStorage::new(), "u1", config).unwrap();
        let out = chat_output(
            &mut session,
            &[
                "I prefer pie charts",
                r#"agent: ok TOOL: save_memory_note({"content": "Prefers pie charts", "tags": ["pie"]})"#,
                "/end",
                "ignored after end",
            ],
        )
        .await;
        assert!(out.contains("\"saved\":true"));
        assert!(!out.contains("save error"));
        assert_eq!(session.state().conversation().len(), 2);
        assert!(session.storage().read("u1").unwrap().is_some());
    }

    #[test]
    fn test_parse_binding() {
        assert_eq!(
            parse_binding("x = month").unwrap(),
            ("x".to_string(), "month".to_string())
        );
        assert!(parse_binding("month").is_err());
    }
}
