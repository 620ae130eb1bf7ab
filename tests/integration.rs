use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use soul_runtime::eventlog::{EventLog, LogMetadata, LogNotice, MemorySubscriber};
use soul_runtime::memory::WorkingMemory;
use soul_runtime::model::ModelBackend;
use soul_runtime::process::{Decision, MentalProcess, TurnContext};
use soul_runtime::rpc::{JsonRpcRequest, JsonRpcResponse, RpcTransport};
use soul_runtime::scheduler::{CompiledSoul, SoulProvider, TurnReport, TurnScheduler};
use soul_runtime::session::SessionAttributes;
use soul_runtime::sink::{EphemeralBroadcaster, MemorySink};
use soul_runtime::step::CognitiveStep;
use soul_runtime::types::*;
use soul_runtime::{SoulError, SoulResult};

// ─── Mock Backend ───────────────────────────────────────────────────────────

struct MockBackend {
    responses: Mutex<Vec<String>>,
}

impl MockBackend {
    fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
        }
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    async fn complete(
        &self,
        _prompt: &[MemoryEntry],
        _schema: Option<&serde_json::Value>,
    ) -> SoulResult<String> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(SoulError::Model("no more responses".into()));
        }
        Ok(responses.remove(0))
    }
}

// ─── Mock Tool Transport ────────────────────────────────────────────────────

/// Answers every call by attaching an uppercased echo of the `q` param to the
/// log, the way a remote tool host would.
struct EchoRpc {
    log: Arc<EventLog>,
}

#[async_trait]
impl RpcTransport for EchoRpc {
    async fn send(&self, request: JsonRpcRequest) -> SoulResult<()> {
        let log = self.log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let answer = request
                .params
                .as_ref()
                .and_then(|p| p.get("q"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_uppercase();
            log.attach_tool_response(JsonRpcResponse::success(request.id, json!(answer)))
                .unwrap();
        });
        Ok(())
    }
}

// ─── Decision Functions ─────────────────────────────────────────────────────

/// Full conversational turn: one cognitive step against the model backend,
/// spoken aloud and folded into memory.
struct Converse;

#[async_trait]
impl MentalProcess for Converse {
    fn name(&self) -> &str {
        "converse"
    }

    async fn decide(&self, memory: WorkingMemory, ctx: TurnContext) -> SoulResult<Decision> {
        let step = CognitiveStep::text("external_dialog", |memory| {
            MemoryEntry::system(format!("{} replies to the conversation.", memory.soul_name()))
        });
        let (memory, reply) = step.run(&memory, &ctx.model()).await?;
        ctx.speak(reply);
        Ok(Decision::new(memory))
    }
}

/// Defers while more perceptions are queued, answers once caught up.
struct Debounce;

#[async_trait]
impl MentalProcess for Debounce {
    fn name(&self) -> &str {
        "debounce"
    }

    async fn decide(&self, memory: WorkingMemory, ctx: TurnContext) -> SoulResult<Decision> {
        if !ctx.pending_perceptions().is_empty() {
            return Ok(Decision::unchanged(memory));
        }
        ctx.speak("caught up");
        Ok(Decision::new(memory.with_memory(MemoryEntry::assistant("caught up"))))
    }
}

/// Schedules and cancels future perceptions based on what it hears.
struct Planner;

#[async_trait]
impl MentalProcess for Planner {
    fn name(&self) -> &str {
        "planner"
    }

    async fn decide(&self, memory: WorkingMemory, ctx: TurnContext) -> SoulResult<Decision> {
        match ctx.invoking_perception().action.as_str() {
            "set" => {
                let job_id = ctx.schedule_event(
                    Event::external_perception("reminded", "water the plants"),
                    Utc::now() + chrono::Duration::milliseconds(50),
                );
                ctx.set_slot("job", json!(job_id));
            }
            "cancel" => {
                let job_id = ctx
                    .slot_or("job", json!(null))
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                ctx.cancel_scheduled_event(&job_id)?;
            }
            "cancel-unknown" => {
                ctx.cancel_scheduled_event("no-such-job")?;
            }
            other => {
                ctx.set_slot("last_heard", json!(other));
            }
        }
        Ok(Decision::new(memory))
    }
}

/// Never resolves within any reasonable deadline.
struct Freeze;

#[async_trait]
impl MentalProcess for Freeze {
    fn name(&self) -> &str {
        "freeze"
    }

    async fn decide(&self, _memory: WorkingMemory, ctx: TurnContext) -> SoulResult<Decision> {
        ctx.wait(Duration::from_secs(3600)).await;
        unreachable!("deadline fires first")
    }
}

/// Issues a tool call mid-turn and speaks the correlated response.
struct ToolUser;

#[async_trait]
impl MentalProcess for ToolUser {
    fn name(&self) -> &str {
        "tool_user"
    }

    async fn decide(&self, memory: WorkingMemory, ctx: TurnContext) -> SoulResult<Decision> {
        let query = ctx.invoking_perception().content_text().to_string();
        let call_id = ctx.send_tool_call("lookup", json!({ "q": query })).await?;
        let response = ctx.await_tool_result(&call_id).await?;
        let answer = response
            .result
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        ctx.speak(&answer);
        Ok(Decision::new(memory.with_memory(MemoryEntry::assistant(answer))))
    }
}

/// Streams an utterance: pending entry first, ephemeral typing signal, then
/// the frozen content.
struct Streamer;

#[async_trait]
impl MentalProcess for Streamer {
    fn name(&self) -> &str {
        "streamer"
    }

    async fn decide(&self, memory: WorkingMemory, ctx: TurnContext) -> SoulResult<Decision> {
        let utterance = ctx.speak_streaming();
        ctx.emit_ephemeral(&Event::system("typing", "…"));
        ctx.resolve_speech(&utterance.id, "finally, the whole sentence")?;
        Ok(Decision::new(memory))
    }
}

// ─── Soul Provider ──────────────────────────────────────────────────────────

/// Loads the same blueprint for every session, entry point chosen by the
/// session attributes.
struct BlueprintProvider;

#[async_trait]
impl SoulProvider for BlueprintProvider {
    async fn load(&self, attributes: &SessionAttributes) -> SoulResult<CompiledSoul> {
        let mut processes: HashMap<String, Arc<dyn MentalProcess>> = HashMap::new();
        for process in [
            Arc::new(Converse) as Arc<dyn MentalProcess>,
            Arc::new(Debounce),
            Arc::new(Planner),
            Arc::new(Freeze),
            Arc::new(ToolUser),
            Arc::new(Streamer),
        ] {
            processes.insert(process.name().to_string(), process);
        }
        let entry_point = processes
            .get(&attributes.entry_point)
            .cloned()
            .ok_or_else(|| {
                SoulError::Session(format!("unknown entry point {}", attributes.entry_point))
            })?;

        let mut soul = CompiledSoul::new(
            SessionIdentity::new("Samantha").with_blueprint("samantha-v1"),
            entry_point,
        )
        .with_static_resources(json!({ "voice": "warm" }));
        for process in processes.into_values() {
            soul = soul.with_process(process);
        }
        Ok(soul)
    }
}

async fn scheduler_for(
    entry_point: &str,
    log: Arc<EventLog>,
    model: Arc<dyn ModelBackend>,
) -> TurnScheduler {
    let attributes = SessionAttributes::new("chat-with-alice", entry_point);
    let soul = BlueprintProvider.load(&attributes).await.unwrap();
    TurnScheduler::new(attributes, soul, log, model)
}

// ─── Scenarios ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn conversation_round_trip() {
    let log = Arc::new(EventLog::new(LogMetadata::default()));
    let subscriber = Arc::new(MemorySubscriber::new());
    log.subscribe(subscriber.clone());

    let model = Arc::new(MockBackend::new(vec!["Lovely to meet you, Alice."]));
    let scheduler = scheduler_for("converse", log.clone(), model).await;

    scheduler.dispatch_perception(
        Event::external_perception("said", "Hi, I'm Alice").with_name("Alice"),
    );
    let reports = scheduler.run_until_idle().await;
    assert_eq!(reports, vec![TurnReport::Completed]);

    // the reply was spoken into the log as an interaction request
    let spoken: Vec<_> = log
        .events()
        .iter()
        .filter(|e| e.kind == EventKind::InteractionRequest)
        .cloned()
        .collect();
    assert_eq!(spoken.len(), 1);
    assert_eq!(spoken[0].content_text(), "Lovely to meet you, Alice.");

    // memory holds preamble, perception, step command, and the model reply
    let state = scheduler.state();
    assert_eq!(state.completed_turns, 1);
    assert_eq!(state.working_memory.len(), 4);
    let last = state.working_memory.entries().last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content, "Lovely to meet you, Alice.");

    // every append fanned out to the subscriber
    assert!(subscriber.len() >= 2);
}

#[tokio::test]
async fn burst_of_seven_is_one_turn() {
    let log = Arc::new(EventLog::new(LogMetadata::default()));
    let model = Arc::new(MockBackend::new(vec![]));
    let scheduler = Arc::new(scheduler_for("debounce", log, model).await);

    let mut dispatchers = Vec::new();
    for i in 1..=7 {
        let scheduler = scheduler.clone();
        dispatchers.push(tokio::spawn(async move {
            scheduler.dispatch_perception(Event::external_perception("said", format!("p{i}")));
        }));
    }
    for handle in dispatchers {
        handle.await.unwrap();
    }

    let reports = scheduler.run_until_idle().await;
    assert_eq!(
        reports.iter().filter(|r| **r == TurnReport::Completed).count(),
        1
    );

    let state = scheduler.state();
    assert_eq!(state.completed_turns, 1);
    // all seven perceptions were integrated into the single persisted turn
    let heard = state
        .working_memory
        .entries()
        .iter()
        .filter(|e| e.role == Role::User)
        .count();
    assert_eq!(heard, 7);
}

#[tokio::test]
async fn concurrent_dispatch_serializes_state_writes() {
    struct Counter {
        concurrent: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MentalProcess for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn decide(&self, memory: WorkingMemory, _ctx: TurnContext) -> SoulResult<Decision> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(Decision::new(memory.with_memory(MemoryEntry::assistant("ack"))))
        }
    }

    let concurrent = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let soul = CompiledSoul::new(
        SessionIdentity::new("Samantha"),
        Arc::new(Counter {
            concurrent: concurrent.clone(),
            max_seen: max_seen.clone(),
        }),
    );
    let scheduler = Arc::new(TurnScheduler::new(
        SessionAttributes::new("chat-with-alice", "counter"),
        soul,
        Arc::new(EventLog::new(LogMetadata::default())),
        Arc::new(MockBackend::new(vec![])),
    ));

    let mut tasks = Vec::new();
    for i in 0..20 {
        let scheduler = scheduler.clone();
        tasks.push(tokio::spawn(async move {
            scheduler.dispatch_perception(Event::external_perception("said", format!("m{i}")));
        }));
    }
    // two drains racing over the same lane
    for _ in 0..2 {
        let scheduler = scheduler.clone();
        tasks.push(tokio::spawn(async move {
            scheduler.run_until_idle().await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    scheduler.run_until_idle().await;

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.state().completed_turns, 20);
}

#[tokio::test]
async fn cancelled_schedule_never_reaches_the_log() {
    let log = Arc::new(EventLog::new(LogMetadata::default()));
    let model = Arc::new(MockBackend::new(vec![]));
    let scheduler = scheduler_for("planner", log.clone(), model).await;

    scheduler.dispatch_perception(Event::external_perception("set", "remind me"));
    assert_eq!(scheduler.tick().await, Some(TurnReport::Completed));
    assert_eq!(scheduler.state().pending_scheduled_events.len(), 1);

    scheduler.dispatch_perception(Event::external_perception("cancel", "never mind"));
    assert_eq!(scheduler.tick().await, Some(TurnReport::Completed));
    assert!(scheduler.state().pending_scheduled_events.is_empty());

    // wait past the original deadline, then sweep: nothing may fire
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(scheduler.fire_due_scheduled_events(), 0);
    assert!(!log
        .events()
        .iter()
        .any(|e| e.content_text() == "water the plants"));
}

#[tokio::test]
async fn cancelling_unknown_job_fails_the_turn_without_mutation() {
    let log = Arc::new(EventLog::new(LogMetadata::default()));
    let model = Arc::new(MockBackend::new(vec![]));
    let scheduler = scheduler_for("planner", log, model).await;

    scheduler.dispatch_perception(Event::external_perception("set", "remind me"));
    assert_eq!(scheduler.tick().await, Some(TurnReport::Completed));
    let registered = scheduler.state().pending_scheduled_events;
    assert_eq!(registered.len(), 1);

    scheduler.dispatch_perception(Event::external_perception("cancel-unknown", "oops"));
    match scheduler.tick().await {
        Some(TurnReport::Failed(detail)) => assert!(detail.contains("no-such-job")),
        other => panic!("unexpected report: {other:?}"),
    }
    // the failed turn persisted nothing: the registration is intact
    assert_eq!(scheduler.state().pending_scheduled_events, registered);
}

#[tokio::test]
async fn scheduled_event_fires_as_a_perception() {
    let log = Arc::new(EventLog::new(LogMetadata::default()));
    let model = Arc::new(MockBackend::new(vec![]));
    let scheduler = scheduler_for("planner", log.clone(), model).await;

    scheduler.dispatch_perception(Event::external_perception("set", "remind me"));
    assert_eq!(scheduler.tick().await, Some(TurnReport::Completed));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(scheduler.fire_due_scheduled_events(), 1);

    // the payload is now an ordinary perception the next turn consumes
    let fired = log
        .events()
        .iter()
        .any(|e| e.is_perception() && e.content_text() == "water the plants");
    assert!(fired);
    assert_eq!(scheduler.tick().await, Some(TurnReport::Completed));
}

#[tokio::test]
async fn deadline_abandons_the_turn_and_keeps_state() {
    let log = Arc::new(EventLog::new(LogMetadata::default()));
    let model = Arc::new(MockBackend::new(vec![]));
    let scheduler = scheduler_for("freeze", log, model)
        .await
        .with_turn_timeout(Duration::from_millis(30));

    let before = scheduler.state();
    scheduler.dispatch_perception(Event::external_perception("said", "hello?"));
    assert_eq!(scheduler.tick().await, Some(TurnReport::TimedOut));

    let after = scheduler.state();
    assert_eq!(after.completed_turns, before.completed_turns);
    assert_eq!(after.working_memory, before.working_memory);
    assert!(after.pending_scheduled_events.is_empty());
}

#[tokio::test]
async fn tool_call_suspends_and_resumes_the_turn() {
    let log = Arc::new(EventLog::new(LogMetadata::default()));
    let model = Arc::new(MockBackend::new(vec![]));
    let scheduler = scheduler_for("tool_user", log.clone(), model)
        .await
        .with_rpc_transport(Arc::new(EchoRpc { log: log.clone() }));

    scheduler.dispatch_perception(Event::external_perception("asked", "weather in lisbon"));
    assert_eq!(scheduler.tick().await, Some(TurnReport::Completed));

    let spoken: Vec<_> = log
        .events()
        .iter()
        .filter(|e| e.kind == EventKind::InteractionRequest)
        .cloned()
        .collect();
    assert_eq!(spoken.len(), 1);
    assert_eq!(spoken[0].content_text(), "WEATHER IN LISBON");
}

#[tokio::test]
async fn streaming_speech_and_ephemeral_signals() {
    let log = Arc::new(EventLog::new(LogMetadata::default()));
    let subscriber = Arc::new(MemorySubscriber::new());
    log.subscribe(subscriber.clone());

    let sink = Arc::new(MemorySink::new());
    let broadcaster = EphemeralBroadcaster::new();
    broadcaster.add_sink(sink.clone());

    let model = Arc::new(MockBackend::new(vec![]));
    let scheduler = scheduler_for("streamer", log.clone(), model)
        .await
        .with_ephemeral(broadcaster);

    scheduler.dispatch_perception(Event::external_perception("said", "talk to me"));
    assert_eq!(scheduler.tick().await, Some(TurnReport::Completed));

    // the utterance resolved exactly once, with the stream-complete marker
    let utterance = log
        .events()
        .iter()
        .find(|e| e.kind == EventKind::InteractionRequest)
        .cloned()
        .unwrap();
    assert!(!utterance.pending);
    assert_eq!(utterance.content_text(), "finally, the whole sentence");
    assert_eq!(utterance.metadata["streamComplete"], json!(true));

    // subscribers saw the resolution notice
    assert!(subscriber
        .notices()
        .iter()
        .any(|n| matches!(n, LogNotice::ContentResolved { .. })));

    // the typing signal went to the ephemeral sink, not the log
    assert_eq!(sink.len(), 1);
    assert!(!log.events().iter().any(|e| e.action == "typing"));
}

#[tokio::test]
async fn replaying_the_log_rebuilds_identical_state() {
    let log = Arc::new(EventLog::new(LogMetadata::default()));
    let model = || Arc::new(MockBackend::new(vec!["First reply.", "Second reply."]));

    let original = scheduler_for("converse", log.clone(), model()).await;
    original.dispatch_perception(Event::external_perception("said", "one").with_name("Alice"));
    original.dispatch_perception(Event::external_perception("said", "two").with_name("Alice"));
    original.run_until_idle().await;
    let final_state = original.state();
    assert_eq!(final_state.completed_turns, 2);

    // fresh session state against the same log, deterministic backend
    let rebuilt = scheduler_for("converse", log, model()).await;
    rebuilt.run_until_idle().await;
    let rebuilt_state = rebuilt.state();

    assert_eq!(rebuilt_state.completed_turns, final_state.completed_turns);
    assert_eq!(rebuilt_state.working_memory, final_state.working_memory);
}
