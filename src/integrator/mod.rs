//! Memory integrator — folds each incoming perception into working memory,
//! once, before the decision function runs.

use crate::error::{SoulError, SoulResult};
use crate::memory::WorkingMemory;
use crate::types::{DecisionFnRef, Event, MemoryEntry, Role, SessionIdentity};

/// Region tag holding the always-present identity preamble.
pub const CORE_REGION: &str = "core";

const MAX_DISPLAY_NAME_LEN: usize = 64;

/// Result of integrating one perception.
#[derive(Debug, Clone)]
pub struct Integration {
    pub memory: WorkingMemory,
    pub next_process: Option<DecisionFnRef>,
    pub props: serde_json::Value,
}

/// Hook invoked exactly once per perception, before the decision function.
///
/// Implementations must not drop unrelated existing entries. A malformed
/// input is reported as [`SoulError::IntegratorInput`]; the scheduler logs it
/// and skips the turn instead of crashing the session.
pub trait MemoryIntegrator: Send + Sync {
    fn integrate(
        &self,
        perception: &Event,
        current_process: Option<&DecisionFnRef>,
        memory: Option<WorkingMemory>,
        identity: &SessionIdentity,
    ) -> SoulResult<Integration>;
}

/// Strip characters outside `[A-Za-z0-9_-]` and cap the length.
pub fn sanitize_display_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_DISPLAY_NAME_LEN)
        .collect()
}

/// Default integration rules: identity preamble in the `core` region, role
/// derived from `internal`, sanitized display name, metadata carried forward.
pub struct DefaultIntegrator;

impl MemoryIntegrator for DefaultIntegrator {
    fn integrate(
        &self,
        perception: &Event,
        _current_process: Option<&DecisionFnRef>,
        memory: Option<WorkingMemory>,
        identity: &SessionIdentity,
    ) -> SoulResult<Integration> {
        let memory = memory
            .ok_or_else(|| SoulError::IntegratorInput("working memory absent".into()))?;
        if perception.content.is_pending() {
            return Err(SoulError::IntegratorInput(format!(
                "perception {} has unresolved content",
                perception.id
            )));
        }

        // Refresh rather than duplicate: the region slot holds exactly one
        // preamble entry across all turns.
        let memory = memory.with_region(
            CORE_REGION,
            MemoryEntry::system(format!(
                "You are modeling the mind of {}.",
                identity.soul_name
            )),
        );

        // Self-generated perceptions read as the soul's own voice.
        let role = if perception.internal {
            Role::Assistant
        } else {
            Role::User
        };

        let mut entry = MemoryEntry::new(role, perception.content_text());
        if let Some(name) = &perception.name {
            let sanitized = sanitize_display_name(name);
            if !sanitized.is_empty() {
                entry = entry.with_name(sanitized);
            }
        }
        for (key, value) in &perception.metadata {
            entry = entry.with_metadata(key.clone(), value.clone());
        }
        entry = entry
            .with_metadata("timestamp", serde_json::json!(perception.timestamp_ms()))
            .with_metadata("eventId", serde_json::json!(perception.id));

        let next_process = perception.decision_fn.clone();
        let props = next_process
            .as_ref()
            .map(|f| f.params.clone())
            .unwrap_or(serde_json::Value::Null);

        Ok(Integration {
            memory: memory.with_memory(entry),
            next_process,
            props,
        })
    }
}
