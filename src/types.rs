use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Memory Entry Types ──────────────────────────────────────────────────────

/// Role of a working-memory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One entry in working memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl MemoryEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            metadata: serde_json::Map::new(),
            region: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ─── Event Types ─────────────────────────────────────────────────────────────

/// Classification of an event-log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Something the soul senses — external input or a self-generated thought
    Perception,
    /// Developer/agent-issued content addressed outward
    InteractionRequest,
    /// Out-of-band bookkeeping (scheduled-event notices etc.)
    System,
}

/// Event content — streaming values start `Pending` and freeze to `Resolved`
/// exactly once. Never a mutable string in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EventContent {
    Pending,
    Resolved { text: String },
}

impl EventContent {
    pub fn resolved(text: impl Into<String>) -> Self {
        EventContent::Resolved { text: text.into() }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            EventContent::Resolved { text } => Some(text),
            EventContent::Pending => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, EventContent::Pending)
    }
}

/// Reference to a decision function, as persisted between turns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionFnRef {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl DecisionFnRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// An entry in the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub pending: bool,
    pub internal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_fn: Option<DecisionFnRef>,
    pub action: String,
    pub content: EventContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Event {
    fn base(kind: EventKind, action: impl Into<String>, content: EventContent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
            pending: content.is_pending(),
            internal: false,
            decision_fn: None,
            action: action.into(),
            content,
            name: None,
        }
    }

    /// An external perception — something sensed from a user or environment
    pub fn external_perception(action: impl Into<String>, content: impl Into<String>) -> Self {
        Self::base(
            EventKind::Perception,
            action,
            EventContent::resolved(content),
        )
    }

    /// A self-generated perception feeding back into the soul's own stream
    pub fn internal_perception(action: impl Into<String>, content: impl Into<String>) -> Self {
        let mut event = Self::external_perception(action, content);
        event.internal = true;
        event
    }

    /// A resolved interaction request (content already final)
    pub fn interaction_request(content: impl Into<String>) -> Self {
        Self::base(
            EventKind::InteractionRequest,
            "says",
            EventContent::resolved(content),
        )
    }

    /// An interaction request whose content will stream in and resolve later
    pub fn pending_interaction_request() -> Self {
        Self::base(EventKind::InteractionRequest, "says", EventContent::Pending)
    }

    /// Out-of-band system bookkeeping
    pub fn system(action: impl Into<String>, content: impl Into<String>) -> Self {
        Self::base(EventKind::System, action, EventContent::resolved(content))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_decision_fn(mut self, decision_fn: DecisionFnRef) -> Self {
        self.decision_fn = Some(decision_fn);
        self
    }

    pub fn is_perception(&self) -> bool {
        self.kind == EventKind::Perception
    }

    /// Resolved content text, empty while pending
    pub fn content_text(&self) -> &str {
        self.content.text().unwrap_or("")
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

// ─── Session Identity ────────────────────────────────────────────────────────

/// Identity handed to the runtime by the compiled-soul provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub soul_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint: Option<String>,
}

impl SessionIdentity {
    pub fn new(soul_name: impl Into<String>) -> Self {
        Self {
            soul_name: soul_name.into(),
            blueprint: None,
        }
    }

    pub fn with_blueprint(mut self, blueprint: impl Into<String>) -> Self {
        self.blueprint = Some(blueprint.into());
        self
    }
}
