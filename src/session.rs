//! Session driver: one user's state over its storage for the life of a
//! conversation.

use crate::memory::{
    consolidate_with, inject, trim_state, AgentState, ConsolidationStats, StateStorage, TurnRole,
};
use crate::tools::{parse_tool_call, MemoryTools};
use crate::{Result, VizmemConfig};
use serde_json::Value;
use tracing::{debug, info};

pub struct MemorySession<S: StateStorage> {
    storage: S,
    state: AgentState,
    config: VizmemConfig,
}

impl<S: StateStorage> MemorySession<S> {
    /// Load the user's state, or start a fresh one.
    pub fn open(storage: S, user_id: &str, config: VizmemConfig) -> Result<Self> {
        let state = AgentState::load_or_create(&storage, user_id)?;
        info!("Session opened for {}", state.user_id());
        Ok(Self {
            storage,
            state,
            config,
        })
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut AgentState {
        &mut self.state
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn config(&self) -> &VizmemConfig {
        &self.config
    }

    /// Record a user message and trim if the conversation overflows.
    /// Returns the number of turns trimmed.
    pub fn user_message(&mut self, content: &str) -> Result<usize> {
        self.state.record_turn(TurnRole::User, content)?;
        let removed = trim_state(&mut self.state, self.config.max_turns);
        if removed > 0 {
            debug!("Auto-trimmed {} turns", removed);
        }
        Ok(removed)
    }

    pub fn agent_reply(&mut self, content: &str) -> Result<()> {
        self.state.record_turn(TurnRole::Agent, content)?;
        Ok(())
    }

    /// Memory block plus `base`, ready to send to the model.
    pub fn prompt(&mut self, base: &str) -> String {
        inject(base, &mut self.state, &self.config.render)
    }

    pub fn call_tool(&mut self, name: &str, args: Value) -> Result<Value> {
        MemoryTools::new(&mut self.state).execute(name, args)
    }

    /// Run the `TOOL:` call in `text`, if there is one.
    pub fn call_tool_text(&mut self, text: &str) -> Result<Option<Value>> {
        match parse_tool_call(text)? {
            Some(call) => MemoryTools::new(&mut self.state).execute_call(call).map(Some),
            None => Ok(None),
        }
    }

    /// Persist the state as it stands.
    pub fn checkpoint(&self) -> Result<()> {
        self.state.save(&self.storage)
    }

    /// End the session: fold session memory into global memory and save.
    pub fn finish(mut self) -> Result<(AgentState, ConsolidationStats)> {
        let stats = consolidate_with(&mut self.state, self.config.dedup_threshold);
        self.state.save(&self.storage)?;
        info!(
            "Session closed for {} ({} moved, {} merged)",
            self.state.user_id(),
            stats.moved_count,
            stats.merged_count
        );
        Ok((self.state, stats))
    }
}
