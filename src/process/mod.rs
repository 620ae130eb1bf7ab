//! Mental processes — the decision functions a compiled soul registers, and
//! the per-turn context through which they act on the world.
//!
//! A process receives an owned working-memory snapshot and a [`TurnContext`];
//! everything observable it does (speaking, dispatching perceptions,
//! scheduling, tool calls) goes through the context so the scheduler can tell
//! an acting turn from a deferring one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{SoulError, SoulResult};
use crate::eventlog::EventLog;
use crate::memory::WorkingMemory;
use crate::model::ModelBackend;
use crate::rpc::{JsonRpcRequest, JsonRpcResponse, RpcTransport};
use crate::scheduler::TimerTransport;
use crate::session::ScheduledEvent;
use crate::sink::EphemeralBroadcaster;
use crate::types::Event;

// ─── Decision ────────────────────────────────────────────────────────────────

/// What a decision function hands back to the scheduler.
pub struct Decision {
    pub memory: WorkingMemory,
    pub next_process: Option<Arc<dyn MentalProcess>>,
    pub props: serde_json::Value,
}

impl Decision {
    pub fn new(memory: WorkingMemory) -> Self {
        Self {
            memory,
            next_process: None,
            props: serde_json::Value::Null,
        }
    }

    /// Return the input memory untouched. Combined with taking no actions
    /// through the context, the scheduler reads this as "defer".
    pub fn unchanged(memory: WorkingMemory) -> Self {
        Self::new(memory)
    }

    pub fn with_next_process(mut self, process: Arc<dyn MentalProcess>) -> Self {
        self.next_process = Some(process);
        self
    }

    pub fn with_props(mut self, props: serde_json::Value) -> Self {
        self.props = props;
        self
    }
}

/// A named decision function. One runs per turn; it owns the whole span
/// between integration and persistence.
#[async_trait]
pub trait MentalProcess: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(&self, memory: WorkingMemory, ctx: TurnContext) -> SoulResult<Decision>;
}

// ─── Turn context ────────────────────────────────────────────────────────────

/// Mutations staged during one turn, applied to session state only if the
/// turn completes.
pub(crate) struct TurnEffects {
    pub(crate) slots: HashMap<String, serde_json::Value>,
    pub(crate) scheduled: HashMap<String, ScheduledEvent>,
    pub(crate) acted: bool,
}

/// Per-turn capability surface handed to a decision function.
///
/// Cheap to clone; clones share the same staged effects. Slot writes and
/// scheduled-event registrations land in session state only when the turn
/// persists — an aborted or timed-out turn leaves no trace there.
#[derive(Clone)]
pub struct TurnContext {
    session_id: String,
    turn: u64,
    invoking: Arc<Event>,
    pending: Arc<Vec<Event>>,
    log: Arc<EventLog>,
    model: Arc<dyn ModelBackend>,
    rpc: Arc<dyn RpcTransport>,
    timers: Arc<dyn TimerTransport>,
    ephemeral: EphemeralBroadcaster,
    effects: Arc<Mutex<TurnEffects>>,
}

impl TurnContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: impl Into<String>,
        turn: u64,
        invoking: Event,
        pending: Vec<Event>,
        slots: HashMap<String, serde_json::Value>,
        scheduled: HashMap<String, ScheduledEvent>,
        log: Arc<EventLog>,
        model: Arc<dyn ModelBackend>,
        rpc: Arc<dyn RpcTransport>,
        timers: Arc<dyn TimerTransport>,
        ephemeral: EphemeralBroadcaster,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            turn,
            invoking: Arc::new(invoking),
            pending: Arc::new(pending),
            log,
            model,
            rpc,
            timers,
            ephemeral,
            effects: Arc::new(Mutex::new(TurnEffects {
                slots,
                scheduled,
                acted: false,
            })),
        }
    }

    fn mark_acted(&self) {
        self.effects.lock().unwrap().acted = true;
    }

    // ─── Observation ─────────────────────────────────────────────────────

    /// The perception that triggered this turn.
    pub fn invoking_perception(&self) -> &Event {
        &self.invoking
    }

    /// Perceptions queued behind the invoking one when the turn started.
    /// A debounce policy defers while this is non-empty.
    pub fn pending_perceptions(&self) -> &[Event] {
        &self.pending
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Number of turns completed before this one.
    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn model(&self) -> Arc<dyn ModelBackend> {
        self.model.clone()
    }

    // ─── Speaking ────────────────────────────────────────────────────────

    /// Utter final text: appends a resolved interaction request to the log.
    pub fn speak(&self, text: impl Into<String>) -> Event {
        let event = Event::interaction_request(text);
        self.log.append(event.clone());
        self.mark_acted();
        event
    }

    /// Open a streaming utterance: appends a pending interaction request
    /// whose content the caller later freezes via [`resolve_speech`].
    ///
    /// [`resolve_speech`]: TurnContext::resolve_speech
    pub fn speak_streaming(&self) -> Event {
        let event = Event::pending_interaction_request();
        self.log.append(event.clone());
        self.mark_acted();
        event
    }

    /// Freeze a streaming utterance's content. Valid exactly once per event.
    pub fn resolve_speech(&self, event_id: &str, text: impl Into<String>) -> SoulResult<()> {
        self.log.resolve_content(event_id, text)
    }

    // ─── Self-perception ─────────────────────────────────────────────────

    /// Feed a perception back into the soul's own stream. Internal
    /// perceptions integrate as the soul's voice, external ones as input.
    pub fn dispatch_perception(
        &self,
        action: impl Into<String>,
        content: impl Into<String>,
        internal: bool,
    ) -> Event {
        let event = if internal {
            Event::internal_perception(action, content)
        } else {
            Event::external_perception(action, content)
        };
        self.log.append(event.clone());
        self.mark_acted();
        event
    }

    // ─── Scheduled events ────────────────────────────────────────────────

    /// Register a future perception. The timer collaborator is notified
    /// immediately; the registration itself persists with the turn.
    pub fn schedule_event(&self, payload: Event, not_before: DateTime<Utc>) -> String {
        let job_id = Uuid::new_v4().to_string();
        self.effects.lock().unwrap().scheduled.insert(
            job_id.clone(),
            ScheduledEvent {
                job_id: job_id.clone(),
                not_before,
                payload,
            },
        );
        self.timers.register(&job_id, not_before);
        self.log.append(
            Event::system("schedule", format!("scheduled event {job_id}"))
                .with_metadata("jobId", serde_json::json!(job_id))
                .with_metadata("notBefore", serde_json::json!(not_before.to_rfc3339())),
        );
        self.mark_acted();
        job_id
    }

    /// Withdraw a registration. Unknown ids fail with
    /// [`SoulError::InvalidJobId`] and leave the registrations untouched.
    pub fn cancel_scheduled_event(&self, job_id: &str) -> SoulResult<()> {
        {
            let mut effects = self.effects.lock().unwrap();
            if effects.scheduled.remove(job_id).is_none() {
                return Err(SoulError::InvalidJobId {
                    job_id: job_id.to_string(),
                });
            }
        }
        self.timers.cancel(job_id);
        self.log.append(
            Event::system("unschedule", format!("cancelled event {job_id}"))
                .with_metadata("jobId", serde_json::json!(job_id)),
        );
        self.mark_acted();
        Ok(())
    }

    // ─── Tool calls ──────────────────────────────────────────────────────

    /// Issue a JSON-RPC tool call over the transport. Returns the call id
    /// to await the paired response with.
    pub async fn send_tool_call(
        &self,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> SoulResult<String> {
        let call_id = Uuid::new_v4().to_string();
        let request = JsonRpcRequest::new(call_id.as_str(), method).with_params(params);
        self.log.register_tool_call(request.clone());
        self.rpc.send(request).await?;
        self.mark_acted();
        Ok(call_id)
    }

    /// Suspend this turn until the tool response arrives. Subject to the
    /// turn's overall timeout like everything else in the decision span.
    pub async fn await_tool_result(&self, call_id: &str) -> SoulResult<JsonRpcResponse> {
        self.log.await_tool_response(call_id).await
    }

    // ─── Named slots ─────────────────────────────────────────────────────

    /// Read a slot, staging `default` on first access.
    pub fn slot_or(&self, name: impl Into<String>, default: serde_json::Value) -> serde_json::Value {
        self.effects
            .lock()
            .unwrap()
            .slots
            .entry(name.into())
            .or_insert(default)
            .clone()
    }

    pub fn set_slot(&self, name: impl Into<String>, value: serde_json::Value) {
        self.effects.lock().unwrap().slots.insert(name.into(), value);
        self.mark_acted();
    }

    // ─── Ephemeral & misc ────────────────────────────────────────────────

    /// Broadcast a transient signal the log never records.
    pub fn emit_ephemeral(&self, event: &Event) {
        self.ephemeral.emit(event);
        self.mark_acted();
    }

    /// Suspend the turn. Counts against the turn timeout.
    pub async fn wait(&self, duration: std::time::Duration) {
        tokio::time::sleep(duration).await;
    }

    pub fn log_message(&self, message: &str) {
        tracing::info!(
            session = %self.session_id,
            turn = self.turn,
            "{message}"
        );
    }

    // ─── Scheduler-facing ────────────────────────────────────────────────

    /// Whether any observable action ran through this context.
    pub(crate) fn acted(&self) -> bool {
        self.effects.lock().unwrap().acted
    }

    pub(crate) fn staged_slots(&self) -> HashMap<String, serde_json::Value> {
        self.effects.lock().unwrap().slots.clone()
    }

    pub(crate) fn staged_scheduled(&self) -> HashMap<String, ScheduledEvent> {
        self.effects.lock().unwrap().scheduled.clone()
    }
}
