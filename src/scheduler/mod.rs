//! Turn scheduler — the per-session control loop.
//!
//! The scheduler owns everything between a perception arriving and session
//! state being persisted: it picks the next unconsumed perception, runs the
//! integrator, drives the decision function under a deadline and a
//! cancellation token, and commits the result atomically. Turns that abort,
//! time out or fail leave session state exactly as it was; the session stays
//! resumable on the next perception.
//!
//! A turn whose decision returns the integrated memory untouched and takes no
//! observable action is a "defer": the integrated memory is kept staged for
//! the next invocation instead of being persisted, which is how debounce
//! policies collapse a burst of perceptions into a single turn.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{SoulError, SoulResult};
use crate::eventlog::EventLog;
use crate::integrator::{DefaultIntegrator, MemoryIntegrator};
use crate::memory::WorkingMemory;
use crate::model::ModelBackend;
use crate::process::{Decision, MentalProcess, TurnContext};
use crate::rpc::{JsonRpcRequest, RpcTransport};
use crate::session::{ScheduledEvent, SessionAttributes, SessionState, TurnLane};
use crate::sink::EphemeralBroadcaster;
use crate::types::{DecisionFnRef, Event, SessionIdentity};

const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(300);

// ─── Collaborator seams ──────────────────────────────────────────────────────

/// External timer the scheduler notifies about future perceptions. The timer
/// is expected to call back into [`TurnScheduler::fire_scheduled_event`] at or
/// after `not_before`.
pub trait TimerTransport: Send + Sync {
    fn register(&self, job_id: &str, not_before: DateTime<Utc>);
    fn cancel(&self, job_id: &str);
}

/// Timer that does nothing. For hosts that drive due events themselves via
/// [`TurnScheduler::run`] or [`TurnScheduler::fire_due_scheduled_events`].
pub struct NullTimer;

impl TimerTransport for NullTimer {
    fn register(&self, _job_id: &str, _not_before: DateTime<Utc>) {}
    fn cancel(&self, _job_id: &str) {}
}

/// Tool transport placeholder used until the host wires a real one. Sending
/// through it is an error so a misconfigured session fails loudly.
struct UnconfiguredRpc;

#[async_trait]
impl RpcTransport for UnconfiguredRpc {
    async fn send(&self, request: JsonRpcRequest) -> SoulResult<()> {
        Err(SoulError::Session(format!(
            "no rpc transport configured, dropping call {}",
            request.id
        )))
    }
}

/// A loaded soul: its identity, entry-point decision function, and the named
/// decision functions perceptions and turns may route to.
pub struct CompiledSoul {
    pub identity: SessionIdentity,
    pub entry_point: Arc<dyn MentalProcess>,
    pub processes: HashMap<String, Arc<dyn MentalProcess>>,
    /// Opaque blueprint material (prompt fragments etc.) the host attaches.
    pub static_resources: serde_json::Value,
}

impl CompiledSoul {
    pub fn new(identity: SessionIdentity, entry_point: Arc<dyn MentalProcess>) -> Self {
        let mut processes = HashMap::new();
        processes.insert(entry_point.name().to_string(), entry_point.clone());
        Self {
            identity,
            entry_point,
            processes,
            static_resources: serde_json::Value::Null,
        }
    }

    pub fn with_process(mut self, process: Arc<dyn MentalProcess>) -> Self {
        self.processes.insert(process.name().to_string(), process);
        self
    }

    pub fn with_static_resources(mut self, resources: serde_json::Value) -> Self {
        self.static_resources = resources;
        self
    }

    pub fn process(&self, name: &str) -> Option<Arc<dyn MentalProcess>> {
        self.processes.get(name).cloned()
    }
}

/// Resolves session attributes into a compiled soul. The runtime treats the
/// provider as opaque; hosts back it with whatever blueprint store they have.
#[async_trait]
pub trait SoulProvider: Send + Sync {
    async fn load(&self, attributes: &SessionAttributes) -> SoulResult<CompiledSoul>;
}

// ─── Turn reports ────────────────────────────────────────────────────────────

/// Outcome of one scheduled turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnReport {
    /// Decision ran and its result was persisted.
    Completed,
    /// Decision returned unchanged memory and took no action; nothing
    /// persisted, the integrated memory stays staged.
    Deferred,
    /// The integrator rejected the perception; turn never started.
    Skipped,
    /// Cooperatively cancelled mid-decision; nothing persisted.
    Aborted,
    /// Deadline elapsed mid-decision; nothing persisted.
    TimedOut,
    /// The decision function returned an error; nothing persisted.
    Failed(String),
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

/// Per-session turn loop. One scheduler per session; sessions share nothing.
pub struct TurnScheduler {
    session_id: String,
    soul: CompiledSoul,
    log: Arc<EventLog>,
    state: Mutex<SessionState>,
    lane: TurnLane,
    integrator: Arc<dyn MemoryIntegrator>,
    model: Arc<dyn ModelBackend>,
    rpc: Arc<dyn RpcTransport>,
    timers: Arc<dyn TimerTransport>,
    ephemeral: EphemeralBroadcaster,
    turn_timeout: Duration,
    /// Log index below which perceptions are consumed. Scheduler-local and
    /// never persisted, so replaying a log from a fresh state reconsumes it.
    cursor: AtomicUsize,
    /// Integrated-but-deferred memory carried across a debounce window.
    staged: Mutex<Option<WorkingMemory>>,
    /// Cancels the in-flight turn only; replaced at every turn start.
    turn_cancel: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    wake: Notify,
}

impl TurnScheduler {
    pub fn new(
        attributes: SessionAttributes,
        soul: CompiledSoul,
        log: Arc<EventLog>,
        model: Arc<dyn ModelBackend>,
    ) -> Self {
        let state = SessionState::new(attributes.clone(), soul.identity.soul_name.clone());
        Self {
            session_id: attributes.name,
            soul,
            log,
            state: Mutex::new(state),
            lane: TurnLane::new(),
            integrator: Arc::new(DefaultIntegrator),
            model,
            rpc: Arc::new(UnconfiguredRpc),
            timers: Arc::new(NullTimer),
            ephemeral: EphemeralBroadcaster::new(),
            turn_timeout: DEFAULT_TURN_TIMEOUT,
            cursor: AtomicUsize::new(0),
            staged: Mutex::new(None),
            turn_cancel: Mutex::new(CancellationToken::new()),
            shutdown: CancellationToken::new(),
            wake: Notify::new(),
        }
    }

    pub fn with_integrator(mut self, integrator: Arc<dyn MemoryIntegrator>) -> Self {
        self.integrator = integrator;
        self
    }

    pub fn with_rpc_transport(mut self, rpc: Arc<dyn RpcTransport>) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn with_timer_transport(mut self, timers: Arc<dyn TimerTransport>) -> Self {
        self.timers = timers;
        self
    }

    pub fn with_ephemeral(mut self, ephemeral: EphemeralBroadcaster) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    /// Resume from previously persisted state instead of a blank session.
    pub fn with_state(mut self, state: SessionState) -> Self {
        self.state = Mutex::new(state);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Snapshot of the durable session state.
    pub fn state(&self) -> SessionState {
        self.state.lock().unwrap().clone()
    }

    // ─── Ingress ─────────────────────────────────────────────────────────

    /// Append a perception and wake the loop. Safe to call from any task at
    /// any time, including while a turn is in flight.
    pub fn dispatch_perception(&self, perception: Event) {
        self.log.append(perception);
        self.wake.notify_one();
    }

    /// Timer collaborator callback. Removes the registration and injects the
    /// payload perception as if externally received. Unknown or already
    /// cancelled job ids are a no-op (the timer may fire late).
    pub fn fire_scheduled_event(&self, job_id: &str) {
        let payload = self
            .state
            .lock()
            .unwrap()
            .pending_scheduled_events
            .remove(job_id)
            .map(|scheduled| scheduled.payload);
        match payload {
            Some(payload) => {
                tracing::debug!(session = %self.session_id, job_id, "scheduled event fired");
                self.log.append(payload);
                self.wake.notify_one();
            }
            None => {
                tracing::debug!(session = %self.session_id, job_id, "stale timer fire ignored");
            }
        }
    }

    /// Fire every registration whose `not_before` has passed. Returns how
    /// many fired.
    pub fn fire_due_scheduled_events(&self) -> usize {
        let now = Utc::now();
        let due: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .pending_scheduled_events
            .values()
            .filter(|scheduled| scheduled.not_before <= now)
            .map(|scheduled| scheduled.job_id.clone())
            .collect();
        for job_id in &due {
            self.fire_scheduled_event(job_id);
        }
        due.len()
    }

    // ─── Driving ─────────────────────────────────────────────────────────

    /// Run at most one turn against the next unconsumed perception. `None`
    /// when the queue is drained.
    pub async fn tick(&self) -> Option<TurnReport> {
        let _permit = self.lane.acquire().await;
        let (index, perception) = self.next_unconsumed()?;
        let report = self.run_turn(&perception, index).await;
        // Consumed regardless of outcome; a failed turn does not wedge the
        // queue.
        self.cursor.store(index + 1, Ordering::SeqCst);
        Some(report)
    }

    /// Drain the perception queue.
    pub async fn run_until_idle(&self) -> Vec<TurnReport> {
        let mut reports = Vec::new();
        while !self.shutdown.is_cancelled() {
            match self.tick().await {
                Some(report) => reports.push(report),
                None => break,
            }
        }
        reports
    }

    /// Long-lived loop: drain the queue, fire due scheduled events, then
    /// sleep until woken by a dispatch, the next timer deadline, or shutdown.
    pub async fn run(&self) {
        loop {
            self.run_until_idle().await;
            if self.shutdown.is_cancelled() {
                return;
            }
            if self.fire_due_scheduled_events() > 0 {
                continue;
            }
            let wake = self.wake.notified();
            tokio::pin!(wake);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = &mut wake => {}
                _ = tokio::time::sleep(self.next_due_delay()) => {}
            }
        }
    }

    /// Run up to `expected` independently scheduled decision functions (e.g.
    /// periodic summarization) against the same session state. Serialized
    /// against main turns by the per-session lane; returns how many persisted.
    pub async fn run_background_turns(
        &self,
        expected: usize,
        processes: &[Arc<dyn MentalProcess>],
    ) -> SoulResult<u64> {
        let mut executed = 0;
        for process in processes.iter().take(expected) {
            let _permit = self.lane.acquire().await;

            let (memory, slots, scheduled, turn_no) = self.turn_inputs();
            let invoking = Event::internal_perception("background", process.name());
            let ctx = self.turn_context(
                turn_no,
                invoking,
                self.pending_after(self.cursor.load(Ordering::SeqCst)),
                slots,
                scheduled.clone(),
            );

            match self.drive_decision(process, memory.clone(), ctx.clone()).await {
                Ok(mut decision) => {
                    if decision.memory == memory && !ctx.acted() {
                        continue;
                    }
                    // Background turns never reroute the main decision fn.
                    decision.next_process = None;
                    self.persist_turn(decision, &ctx, &scheduled, None);
                    executed += 1;
                }
                Err(err) => {
                    tracing::warn!(session = %self.session_id, process = process.name(),
                        error = %err, "background turn abandoned");
                }
            }
        }
        Ok(executed)
    }

    /// Cooperatively cancel the in-flight turn. No effect on later turns; the
    /// session resumes on the next perception.
    pub fn abort(&self) {
        self.turn_cancel.lock().unwrap().cancel();
    }

    /// Stop the [`run`](TurnScheduler::run) loop after the current turn.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.wake.notify_waiters();
    }

    // ─── Turn internals ──────────────────────────────────────────────────

    fn next_unconsumed(&self) -> Option<(usize, Event)> {
        let events = self.log.events();
        let mut index = self.cursor.load(Ordering::SeqCst);
        while let Some(event) = events.get(index) {
            if event.is_perception() {
                return Some((index, event.clone()));
            }
            // Interaction requests and system notices never drive turns.
            index += 1;
            self.cursor.store(index, Ordering::SeqCst);
        }
        None
    }

    fn pending_after(&self, index: usize) -> Vec<Event> {
        self.log
            .events_from(index + 1)
            .into_iter()
            .filter(Event::is_perception)
            .collect()
    }

    /// Base inputs for a turn: staged memory from a debounce window if one is
    /// open, the persisted memory otherwise.
    fn turn_inputs(
        &self,
    ) -> (
        WorkingMemory,
        HashMap<String, serde_json::Value>,
        HashMap<String, ScheduledEvent>,
        u64,
    ) {
        let state = self.state.lock().unwrap();
        let staged = self.staged.lock().unwrap();
        (
            staged
                .clone()
                .unwrap_or_else(|| state.working_memory.clone()),
            state.slots().clone(),
            state.pending_scheduled_events.clone(),
            state.completed_turns,
        )
    }

    fn turn_context(
        &self,
        turn: u64,
        invoking: Event,
        pending: Vec<Event>,
        slots: HashMap<String, serde_json::Value>,
        scheduled: HashMap<String, ScheduledEvent>,
    ) -> TurnContext {
        TurnContext::new(
            self.session_id.clone(),
            turn,
            invoking,
            pending,
            slots,
            scheduled,
            self.log.clone(),
            self.model.clone(),
            self.rpc.clone(),
            self.timers.clone(),
            self.ephemeral.clone(),
        )
    }

    async fn run_turn(&self, perception: &Event, index: usize) -> TurnReport {
        let (base_memory, current_process, slots, scheduled, turn_no) = {
            let (memory, slots, scheduled, turn_no) = self.turn_inputs();
            let current = self.state.lock().unwrap().current_process.clone();
            (memory, current, slots, scheduled, turn_no)
        };

        tracing::debug!(session = %self.session_id, turn = turn_no,
            perception = %perception.id, "integrating");
        let integration = match self.integrator.integrate(
            perception,
            current_process.as_ref(),
            Some(base_memory),
            &self.soul.identity,
        ) {
            Ok(integration) => integration,
            Err(err) => {
                tracing::warn!(session = %self.session_id, error = %err,
                    "integrator rejected perception, skipping turn");
                return TurnReport::Skipped;
            }
        };

        let process =
            self.resolve_process(integration.next_process.as_ref(), current_process.as_ref());
        let ctx = self.turn_context(
            turn_no,
            perception.clone(),
            self.pending_after(index),
            slots,
            scheduled.clone(),
        );

        tracing::debug!(session = %self.session_id, turn = turn_no,
            process = process.name(), "deciding");
        let decision = match self
            .drive_decision(&process, integration.memory.clone(), ctx.clone())
            .await
        {
            Ok(decision) => decision,
            Err(SoulError::Aborted) => {
                tracing::warn!(session = %self.session_id, turn = turn_no, "turn aborted");
                return TurnReport::Aborted;
            }
            Err(err @ SoulError::TurnTimeout { .. }) => {
                tracing::warn!(session = %self.session_id, turn = turn_no, error = %err,
                    "turn exceeded its deadline");
                return TurnReport::TimedOut;
            }
            Err(err) => {
                tracing::error!(session = %self.session_id, turn = turn_no,
                    error = %err, "decision function failed");
                return TurnReport::Failed(err.to_string());
            }
        };

        if decision.memory == integration.memory && !ctx.acted() {
            *self.staged.lock().unwrap() = Some(integration.memory);
            tracing::debug!(session = %self.session_id, turn = turn_no, "turn deferred");
            return TurnReport::Deferred;
        }

        tracing::debug!(session = %self.session_id, turn = turn_no, "persisting");
        self.persist_turn(decision, &ctx, &scheduled, integration.next_process);
        TurnReport::Completed
    }

    /// Drive the decision function under the turn deadline and the per-turn
    /// cancellation token.
    async fn drive_decision(
        &self,
        process: &Arc<dyn MentalProcess>,
        memory: WorkingMemory,
        ctx: TurnContext,
    ) -> SoulResult<Decision> {
        let turn_cancel = CancellationToken::new();
        *self.turn_cancel.lock().unwrap() = turn_cancel.clone();

        let decide = process.decide(memory, ctx);
        tokio::select! {
            _ = turn_cancel.cancelled() => Err(SoulError::Aborted),
            outcome = tokio::time::timeout(self.turn_timeout, decide) => match outcome {
                Err(_) => Err(SoulError::TurnTimeout {
                    elapsed_ms: self.turn_timeout.as_millis() as u64,
                }),
                Ok(result) => result,
            }
        }
    }

    fn resolve_process(
        &self,
        routed: Option<&DecisionFnRef>,
        current: Option<&DecisionFnRef>,
    ) -> Arc<dyn MentalProcess> {
        for fn_ref in [routed, current].into_iter().flatten() {
            match self.soul.process(&fn_ref.name) {
                Some(process) => return process,
                None => tracing::warn!(session = %self.session_id, process = %fn_ref.name,
                    "unknown decision function, falling back"),
            }
        }
        self.soul.entry_point.clone()
    }

    /// Commit one completed turn. The whole write happens under the state
    /// lock so observers never see a half-applied turn.
    fn persist_turn(
        &self,
        decision: Decision,
        ctx: &TurnContext,
        scheduled_at_start: &HashMap<String, ScheduledEvent>,
        routed: Option<DecisionFnRef>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.working_memory = decision.memory;
        if let Some(next) = &decision.next_process {
            state.current_process =
                Some(DecisionFnRef::new(next.name()).with_params(decision.props.clone()));
        } else if let Some(routed) = routed {
            state.current_process = Some(routed);
        }
        state.replace_slots(ctx.staged_slots());

        let mut scheduled = ctx.staged_scheduled();
        for job_id in scheduled_at_start.keys() {
            // Fired or cancelled from outside while the turn ran; do not
            // resurrect it from the turn's snapshot.
            if !state.pending_scheduled_events.contains_key(job_id) {
                scheduled.remove(job_id);
            }
        }
        state.pending_scheduled_events = scheduled;
        state.completed_turns += 1;
        *self.staged.lock().unwrap() = None;
    }

    fn next_due_delay(&self) -> Duration {
        let now = Utc::now();
        self.state
            .lock()
            .unwrap()
            .pending_scheduled_events
            .values()
            .map(|scheduled| scheduled.not_before - now)
            .min()
            .map(|delta| {
                delta
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .max(Duration::from_millis(5))
            })
            .unwrap_or(Duration::from_secs(60))
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Live schedulers keyed by session id. Sessions run fully in parallel and
/// share no mutable state; the registry only routes to them.
#[derive(Default)]
pub struct SchedulerRegistry {
    inner: DashMap<String, Arc<TurnScheduler>>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, scheduler: Arc<TurnScheduler>) {
        self.inner
            .insert(scheduler.session_id().to_string(), scheduler);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<TurnScheduler>> {
        self.inner.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<TurnScheduler>> {
        self.inner.remove(session_id).map(|(_, scheduler)| scheduler)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
