//! Session ("subroutine") state — durable per-soul bookkeeping across turns,
//! and the per-session execution lane.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SoulResult;
use crate::memory::WorkingMemory;
use crate::types::{DecisionFnRef, Event};

/// Static attributes the hosting process creates a session with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAttributes {
    pub name: String,
    #[serde(default)]
    pub context: serde_json::Value,
    pub entry_point: String,
}

impl SessionAttributes {
    pub fn new(name: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: serde_json::Value::Null,
            entry_point: entry_point.into(),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// A future perception registered with the timer collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub job_id: String,
    pub not_before: DateTime<Utc>,
    pub payload: Event,
}

/// Durable session state. Created on the first perception for a session,
/// mutated only after a fully completed turn, never deleted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub attributes: SessionAttributes,
    #[serde(default)]
    pub pending_scheduled_events: HashMap<String, ScheduledEvent>,
    #[serde(default)]
    named_slots: HashMap<String, serde_json::Value>,
    pub working_memory: WorkingMemory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_process: Option<DecisionFnRef>,
    #[serde(default)]
    pub completed_turns: u64,
}

impl SessionState {
    pub fn new(attributes: SessionAttributes, soul_name: impl Into<String>) -> Self {
        Self {
            attributes,
            pending_scheduled_events: HashMap::new(),
            named_slots: HashMap::new(),
            working_memory: WorkingMemory::new(soul_name),
            current_process: None,
            completed_turns: 0,
        }
    }

    // ─── Named slots ─────────────────────────────────────────────────────
    // The durable store backing per-session named values a decision function
    // reads/writes across turns. Same persistence as the rest of the state,
    // not a second store.

    /// Read a slot, installing `default` on first access.
    pub fn slot_or(
        &mut self,
        name: impl Into<String>,
        default: serde_json::Value,
    ) -> serde_json::Value {
        self.named_slots.entry(name.into()).or_insert(default).clone()
    }

    pub fn slot(&self, name: &str) -> Option<&serde_json::Value> {
        self.named_slots.get(name)
    }

    pub fn set_slot(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.named_slots.insert(name.into(), value);
    }

    pub fn slot_names(&self) -> Vec<&str> {
        self.named_slots.keys().map(String::as_str).collect()
    }

    pub fn slots(&self) -> &HashMap<String, serde_json::Value> {
        &self.named_slots
    }

    pub(crate) fn replace_slots(&mut self, slots: HashMap<String, serde_json::Value>) {
        self.named_slots = slots;
    }

    // ─── Persistence ─────────────────────────────────────────────────────

    /// Write the state as pretty JSON. Hosts call this after each completed
    /// turn; a crash between turns loses at most the in-flight turn.
    pub fn save(&self, path: impl AsRef<Path>) -> SoulResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> SoulResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Per-session execution lock — at most one of {main turn, background turn}
/// mutates session state at a time. Tokio's semaphore queue is FIFO, so
/// contenders acquire fairly and background turns cannot starve.
pub struct TurnLane {
    semaphore: tokio::sync::Semaphore,
}

impl TurnLane {
    pub fn new() -> Self {
        Self {
            semaphore: tokio::sync::Semaphore::new(1),
        }
    }

    pub async fn acquire(&self) -> tokio::sync::SemaphorePermit<'_> {
        self.semaphore.acquire().await.expect("lane closed")
    }

    pub fn try_acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        self.semaphore.try_acquire().ok()
    }
}

impl Default for TurnLane {
    fn default() -> Self {
        Self::new()
    }
}
