//! # soul-runtime
//!
//! Turn-based reactive runtime for long-lived conversational agents ("souls").
//! Perceptions land in an append-only event log; a per-session scheduler
//! integrates each one into a functional working memory, drives a decision
//! function under a deadline, and persists the outcome atomically.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use soul_runtime::eventlog::{EventLog, LogMetadata};
//! use soul_runtime::memory::WorkingMemory;
//! use soul_runtime::model::ModelBackend;
//! use soul_runtime::process::{Decision, MentalProcess, TurnContext};
//! use soul_runtime::scheduler::{CompiledSoul, TurnScheduler};
//! use soul_runtime::session::SessionAttributes;
//! use soul_runtime::types::{Event, MemoryEntry, SessionIdentity};
//! use soul_runtime::SoulResult;
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl MentalProcess for Greeter {
//!     fn name(&self) -> &str {
//!         "greeter"
//!     }
//!
//!     async fn decide(&self, memory: WorkingMemory, ctx: TurnContext) -> SoulResult<Decision> {
//!         let reply = format!("hello, {}", ctx.invoking_perception().content_text());
//!         ctx.speak(&reply);
//!         Ok(Decision::new(memory.with_memory(MemoryEntry::assistant(reply))))
//!     }
//! }
//!
//! # async fn demo(model: Arc<dyn ModelBackend>) {
//! let soul = CompiledSoul::new(SessionIdentity::new("Samantha"), Arc::new(Greeter));
//! let scheduler = TurnScheduler::new(
//!     SessionAttributes::new("chat-1", "greeter"),
//!     soul,
//!     Arc::new(EventLog::new(LogMetadata::default())),
//!     model,
//! );
//!
//! scheduler.dispatch_perception(Event::external_perception("said", "world"));
//! scheduler.run_until_idle().await;
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`types`] | Core types: `Event`, `EventContent`, `MemoryEntry`, `Role`, `DecisionFnRef` |
//! | [`memory`] | Functional working memory with region slots and serialization order |
//! | [`eventlog`] | Append-only event log, subscriber fan-out, tool-call correlation |
//! | [`rpc`] | JSON-RPC 2.0 request/response pairs and the tool transport seam |
//! | [`model`] | Opaque model-backend seam cognitive steps call |
//! | [`step`] | Cognitive steps: pure model-call builders with typed post-process folds |
//! | [`integrator`] | Per-perception memory integration hook and its default rules |
//! | [`process`] | Mental processes (decision functions) and the per-turn context |
//! | [`session`] | Durable session state, named slots, the per-session lane |
//! | [`scheduler`] | Turn scheduler: debounce, cancellation, timeout, background turns |
//! | [`sink`] | Ephemeral sinks for transient signals the log never records |
//! | [`error`] | Error taxonomy with thiserror |

pub mod error;
pub mod eventlog;
pub mod integrator;
pub mod memory;
pub mod model;
pub mod process;
pub mod rpc;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod step;
pub mod types;

pub use error::{SoulError, SoulResult};
pub use types::{
    DecisionFnRef, Event, EventContent, EventKind, MemoryEntry, Role, SessionIdentity,
};
