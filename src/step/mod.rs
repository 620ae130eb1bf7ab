//! Cognitive steps — reusable builders of a single structured model call plus
//! memory fold.
//!
//! A step is a pure value: `command` only describes the message to send
//! (no side effects, no mutation of its snapshot), and `post_process` folds
//! the raw model output into a new working memory plus a typed result. Any
//! I/O a turn wants to do (speaking, tool dispatch, logging) goes through the
//! turn context hooks, never through a step.

use std::sync::Arc;

use crate::error::{SoulError, SoulResult};
use crate::memory::WorkingMemory;
use crate::model::ModelBackend;
use crate::types::MemoryEntry;

type CommandFn = Box<dyn Fn(&WorkingMemory) -> MemoryEntry + Send + Sync>;
type PostProcessFn<T> =
    Box<dyn Fn(&WorkingMemory, &str) -> SoulResult<(WorkingMemory, T)> + Send + Sync>;

/// A single model-call + memory-fold operation with a typed result.
pub struct CognitiveStep<T = String> {
    name: String,
    schema: Option<serde_json::Value>,
    command: CommandFn,
    post_process: PostProcessFn<T>,
}

impl CognitiveStep<String> {
    /// Free-text step: the raw model output becomes both the appended
    /// assistant entry and the result.
    pub fn text(
        name: impl Into<String>,
        command: impl Fn(&WorkingMemory) -> MemoryEntry + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            schema: None,
            command: Box::new(command),
            post_process: Box::new(|memory, raw| {
                let folded = memory.with_memory(MemoryEntry::assistant(raw));
                Ok((folded, raw.to_string()))
            }),
        }
    }
}

impl<T> CognitiveStep<T> {
    /// Step with an explicit post-process fold (typed result).
    pub fn structured(
        name: impl Into<String>,
        command: impl Fn(&WorkingMemory) -> MemoryEntry + Send + Sync + 'static,
        post_process: impl Fn(&WorkingMemory, &str) -> SoulResult<(WorkingMemory, T)>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            schema: None,
            command: Box::new(command),
            post_process: Box::new(post_process),
        }
    }

    /// Declare the output shape the backend must conform to.
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the step against a memory snapshot.
    ///
    /// The command entry and the folded response both land in the returned
    /// memory; the input snapshot is untouched.
    pub async fn run(
        &self,
        memory: &WorkingMemory,
        backend: &Arc<dyn ModelBackend>,
    ) -> SoulResult<(WorkingMemory, T)> {
        let command_entry = (self.command)(memory);
        let with_command = memory.with_memory(command_entry);

        let prompt = with_command.ordered_entries();
        let raw = backend.complete(&prompt, self.schema.as_ref()).await?;

        if self.schema.is_some() {
            // The backend is contractually bound to the schema; at minimum the
            // output must be JSON. Non-conforming output is surfaced, never
            // coerced.
            serde_json::from_str::<serde_json::Value>(&raw).map_err(|e| {
                SoulError::SchemaViolation {
                    detail: format!("step {}: output is not valid JSON: {e}", self.name),
                }
            })?;
        }

        (self.post_process)(&with_command, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct ScriptedBackend {
        output: String,
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        async fn complete(
            &self,
            _prompt: &[MemoryEntry],
            _schema: Option<&serde_json::Value>,
        ) -> SoulResult<String> {
            Ok(self.output.clone())
        }
    }

    struct RecordingBackend {
        prompts: std::sync::Mutex<Vec<Vec<MemoryEntry>>>,
    }

    #[async_trait]
    impl ModelBackend for RecordingBackend {
        async fn complete(
            &self,
            prompt: &[MemoryEntry],
            _schema: Option<&serde_json::Value>,
        ) -> SoulResult<String> {
            self.prompts.lock().unwrap().push(prompt.to_vec());
            Ok("ok".into())
        }
    }

    fn backend(output: &str) -> Arc<dyn ModelBackend> {
        Arc::new(ScriptedBackend {
            output: output.into(),
        })
    }

    #[tokio::test]
    async fn text_step_folds_raw_output() {
        let step = CognitiveStep::text("external_dialog", |memory| {
            MemoryEntry::system(format!(
                "{} speaks in reply to the conversation.",
                memory.soul_name()
            ))
        });

        let memory = WorkingMemory::new("Samantha").with_memory(MemoryEntry::user("hello"));
        let backend = backend("Hi! Lovely to meet you.");

        let (next, reply) = step.run(&memory, &backend).await.unwrap();

        assert_eq!(reply, "Hi! Lovely to meet you.");
        // command entry + response entry appended after the user entry
        assert_eq!(next.len(), 3);
        assert_eq!(next.entries()[2].content, "Hi! Lovely to meet you.");
        // input snapshot untouched
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn structured_step_produces_typed_result() {
        let step: CognitiveStep<bool> = CognitiveStep::structured(
            "decides_to_wait",
            |_| MemoryEntry::system("Decide whether to keep listening. Answer as JSON."),
            |memory, raw| {
                let value: serde_json::Value = serde_json::from_str(raw)?;
                let wait = value["wait"].as_bool().unwrap_or(false);
                let folded = memory.with_memory(
                    MemoryEntry::assistant(raw).with_metadata("structured", json!(true)),
                );
                Ok((folded, wait))
            },
        )
        .with_schema(json!({
            "type": "object",
            "properties": {"wait": {"type": "boolean"}},
            "required": ["wait"]
        }));

        let memory = WorkingMemory::new("Samantha");
        let backend = backend(r#"{"wait": true}"#);

        let (next, wait) = step.run(&memory, &backend).await.unwrap();
        assert!(wait);
        assert_eq!(next.entries().last().unwrap().metadata["structured"], true);
    }

    #[tokio::test]
    async fn schema_violation_is_surfaced_not_coerced() {
        let step = CognitiveStep::text("broken", |_| MemoryEntry::system("answer in JSON"))
            .with_schema(json!({"type": "object"}));

        let memory = WorkingMemory::new("Samantha");
        let backend = backend("this is not json at all");

        let err = step.run(&memory, &backend).await.unwrap_err();
        assert!(matches!(err, SoulError::SchemaViolation { .. }));
    }

    #[tokio::test]
    async fn command_sees_serialization_order() {
        let recording = Arc::new(RecordingBackend {
            prompts: std::sync::Mutex::new(Vec::new()),
        });
        let backend: Arc<dyn ModelBackend> = recording.clone();

        let step = CognitiveStep::text("probe", |_| MemoryEntry::system("command"));

        let memory = WorkingMemory::new("Samantha")
            .with_memory(MemoryEntry::user("chat line"))
            .with_region("core", MemoryEntry::system("identity preamble"))
            .with_region_order(["core"]);

        step.run(&memory, &backend).await.unwrap();

        let prompts = recording.prompts.lock().unwrap();
        let prompt = &prompts[0];
        // Region entries precede default entries, command comes last
        assert_eq!(prompt[0].content, "identity preamble");
        assert_eq!(prompt[1].content, "chat line");
        assert_eq!(prompt[2].content, "command");
    }

    #[tokio::test]
    async fn model_error_propagates() {
        struct FailingBackend;

        #[async_trait]
        impl ModelBackend for FailingBackend {
            async fn complete(
                &self,
                _prompt: &[MemoryEntry],
                _schema: Option<&serde_json::Value>,
            ) -> SoulResult<String> {
                Err(SoulError::Model("backend unavailable".into()))
            }
        }

        let step = CognitiveStep::text("dialog", |_| MemoryEntry::system("speak"));
        let memory = WorkingMemory::new("Samantha");
        let backend: Arc<dyn ModelBackend> = Arc::new(FailingBackend);

        let err = step.run(&memory, &backend).await.unwrap_err();
        assert!(matches!(err, SoulError::Model(_)));
    }
}
