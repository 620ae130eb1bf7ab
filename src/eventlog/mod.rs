//! Event log — append-only record of perceptions, interaction requests and
//! system events, plus pending tool-call correlation.
//!
//! The log is append-only with exactly two sanctioned mutations: resolving a
//! pending interaction request's content (once), and attaching a response to
//! a pending tool call. Every append/mutation fans out to zero or more
//! subscribers, which is how the hosting process mirrors the log into its UI
//! or replication transport.
//!
//! Interior mutability lets other sources keep appending while a turn is in
//! flight; such events queue up for the next turn's pending snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::{SoulError, SoulResult};
use crate::rpc::{JsonRpcRequest, JsonRpcResponse, RpcPair};
use crate::types::{Event, EventContent};

// ─── Notices & Subscribers ───────────────────────────────────────────────────

/// Notification emitted per appended or mutated event.
#[derive(Debug, Clone)]
pub enum LogNotice {
    Appended(Event),
    ContentResolved { event_id: String, text: String },
    ToolCallCompleted { call_id: String },
}

/// Receives log notices. Delivery is at-least-once and fire-and-forget;
/// implementations should be non-blocking.
pub trait LogSubscriber: Send + Sync {
    fn notify(&self, notice: &LogNotice);
}

/// Subscriber that collects notices in memory (for testing / inspection).
pub struct MemorySubscriber {
    notices: Mutex<Vec<LogNotice>>,
}

impl MemorySubscriber {
    pub fn new() -> Self {
        Self {
            notices: Mutex::new(Vec::new()),
        }
    }

    pub fn notices(&self) -> Vec<LogNotice> {
        self.notices.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.notices.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.notices.lock().unwrap().is_empty()
    }
}

impl Default for MemorySubscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSubscriber for MemorySubscriber {
    fn notify(&self, notice: &LogNotice) {
        self.notices.lock().unwrap().push(notice.clone());
    }
}

// ─── Event Log ───────────────────────────────────────────────────────────────

/// Log identity shared with the synchronization collaborator.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LogMetadata {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

struct LogInner {
    events: Vec<Event>,
    pending_tool_calls: HashMap<String, RpcPair>,
}

/// Append-only store of events with tool-call correlation.
pub struct EventLog {
    metadata: LogMetadata,
    inner: Mutex<LogInner>,
    subscribers: Mutex<Vec<Arc<dyn LogSubscriber>>>,
    /// Wakes turns awaiting a tool response.
    resolution: Notify,
}

impl EventLog {
    pub fn new(metadata: LogMetadata) -> Self {
        Self {
            metadata,
            inner: Mutex::new(LogInner {
                events: Vec::new(),
                pending_tool_calls: HashMap::new(),
            }),
            subscribers: Mutex::new(Vec::new()),
            resolution: Notify::new(),
        }
    }

    pub fn metadata(&self) -> &LogMetadata {
        &self.metadata
    }

    pub fn subscribe(&self, subscriber: Arc<dyn LogSubscriber>) {
        self.subscribers.lock().unwrap().push(subscriber);
    }

    fn broadcast(&self, notice: LogNotice) {
        let subscribers = self.subscribers.lock().unwrap().clone();
        for subscriber in subscribers {
            subscriber.notify(&notice);
        }
    }

    /// Append an event. The log never reorders or deletes.
    pub fn append(&self, event: Event) {
        self.inner.lock().unwrap().events.push(event.clone());
        self.broadcast(LogNotice::Appended(event));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().events.is_empty()
    }

    /// Snapshot of all events in insertion order
    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().unwrap().events.clone()
    }

    /// Snapshot of events from `index` onward
    pub fn events_from(&self, index: usize) -> Vec<Event> {
        let inner = self.inner.lock().unwrap();
        inner.events.get(index..).unwrap_or(&[]).to_vec()
    }

    pub fn event(&self, event_id: &str) -> Option<Event> {
        self.inner
            .lock()
            .unwrap()
            .events
            .iter()
            .find(|e| e.id == event_id)
            .cloned()
    }

    /// Freeze a pending event's content. Flips `Pending -> Resolved` exactly
    /// once and sets the `streamComplete` metadata flag; a second attempt is
    /// an error and the resolved text is immutable thereafter.
    pub fn resolve_content(&self, event_id: &str, text: impl Into<String>) -> SoulResult<()> {
        let text = text.into();
        {
            let mut inner = self.inner.lock().unwrap();
            let event = inner
                .events
                .iter_mut()
                .find(|e| e.id == event_id)
                .ok_or_else(|| SoulError::Log(format!("unknown event id: {event_id}")))?;
            if !event.content.is_pending() {
                return Err(SoulError::Log(format!(
                    "content already resolved for event {event_id}"
                )));
            }
            event.content = EventContent::resolved(text.clone());
            event.pending = false;
            event
                .metadata
                .insert("streamComplete".into(), serde_json::Value::Bool(true));
        }
        self.broadcast(LogNotice::ContentResolved {
            event_id: event_id.to_string(),
            text,
        });
        Ok(())
    }

    // ─── Tool-call correlation ───────────────────────────────────────────

    /// Open a pending pair for an outbound tool call
    pub fn register_tool_call(&self, request: JsonRpcRequest) {
        let call_id = request.id.to_string();
        self.inner
            .lock()
            .unwrap()
            .pending_tool_calls
            .insert(call_id, RpcPair::open(request));
    }

    /// Complete a pending pair with its response and wake any awaiting turn
    pub fn attach_tool_response(&self, response: JsonRpcResponse) -> SoulResult<()> {
        let call_id = response.id.to_string();
        {
            let mut inner = self.inner.lock().unwrap();
            let pair = inner
                .pending_tool_calls
                .get_mut(&call_id)
                .ok_or_else(|| SoulError::Log(format!("unknown tool call id: {call_id}")))?;
            if pair.is_complete() {
                return Err(SoulError::Log(format!(
                    "tool call {call_id} already completed"
                )));
            }
            pair.response = Some(response);
        }
        self.resolution.notify_waiters();
        self.broadcast(LogNotice::ToolCallCompleted { call_id });
        Ok(())
    }

    pub fn pending_tool_call(&self, call_id: &str) -> Option<RpcPair> {
        self.inner
            .lock()
            .unwrap()
            .pending_tool_calls
            .get(call_id)
            .cloned()
    }

    /// Suspend until the pair for `call_id` completes. Only the turn that
    /// issued the call should await it; the scheduler itself never does.
    pub async fn await_tool_response(&self, call_id: &str) -> SoulResult<JsonRpcResponse> {
        loop {
            let notified = self.resolution.notified();
            tokio::pin!(notified);

            match self.pending_tool_call(call_id) {
                Some(pair) => {
                    if let Some(response) = pair.response {
                        return Ok(response);
                    }
                }
                None => {
                    return Err(SoulError::Log(format!("unknown tool call id: {call_id}")))
                }
            }
            notified.await;
        }
    }
}
