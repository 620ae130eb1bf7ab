//! Model backend seam — the opaque completion service cognitive steps call.

use async_trait::async_trait;

use crate::error::SoulResult;
use crate::types::MemoryEntry;

/// Abstracts the language-model service.
///
/// When `schema` is given the backend is required to return output conforming
/// to it; conformance failure must surface as [`SoulError::SchemaViolation`],
/// transport or service failure as [`SoulError::Model`]. The runtime performs
/// no retries — a decision function decides whether to try again.
///
/// [`SoulError::SchemaViolation`]: crate::error::SoulError::SchemaViolation
/// [`SoulError::Model`]: crate::error::SoulError::Model
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn complete(
        &self,
        prompt: &[MemoryEntry],
        schema: Option<&serde_json::Value>,
    ) -> SoulResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SoulError;

    struct EchoBackend;

    #[async_trait]
    impl ModelBackend for EchoBackend {
        async fn complete(
            &self,
            prompt: &[MemoryEntry],
            _schema: Option<&serde_json::Value>,
        ) -> SoulResult<String> {
            prompt
                .last()
                .map(|entry| entry.content.clone())
                .ok_or_else(|| SoulError::Model("empty prompt".into()))
        }
    }

    #[test]
    fn backend_is_object_safe() {
        fn _assert_object_safe(_: &dyn ModelBackend) {}
    }

    #[tokio::test]
    async fn echo_backend_returns_last_entry() {
        let backend = EchoBackend;
        let prompt = vec![MemoryEntry::system("be brief"), MemoryEntry::user("hi")];
        let out = backend.complete(&prompt, None).await.unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn empty_prompt_is_a_model_error() {
        let backend = EchoBackend;
        let err = backend.complete(&[], None).await.unwrap_err();
        assert!(matches!(err, SoulError::Model(_)));
    }
}
