//! The LLM provider collaborator: an opaque `complete(request) -> response`
//! capability, trimmed to the one operation this system actually drives a
//! turn with — no streaming, no embeddings, no capability negotiation,
//! since nothing here needs them.

use async_trait::async_trait;
use thiserror::Error;

/// One exchanged line of conversation context handed to the provider.
#[derive(Debug, Clone)]
pub struct CompletionMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<CompletionMessage>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Upstream(String),
    #[error("provider misconfigured: {0}")]
    Config(String),
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    /// A short identifier, surfaced by `doctor` and logged on errors.
    fn provider_id(&self) -> &str;
}

/// Zero-config default: reflects the last user-role message back verbatim
/// (prefixed), so the full turn loop is exercisable end-to-end without a
/// live network call or any credentials.
pub struct EchoProvider;

#[async_trait]
impl LlmProvider for EchoProvider {
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let last = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("");
        Ok(CompletionResponse {
            content: format!("echo: {last}"),
        })
    }

    fn provider_id(&self) -> &str {
        "echo"
    }
}

/// Deterministic canned-reply test double: returns its scripted lines in
/// order, one per call, repeating the last line once exhausted. Used by
/// `cv-executor`'s and `cv-gateway`'s integration tests in place of a real
/// network-backed provider.
pub struct ScriptedProvider {
    replies: Vec<String>,
    next: std::sync::atomic::AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies,
            next: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, _req: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        if self.replies.is_empty() {
            return Err(ProviderError::Config("ScriptedProvider has no replies configured".into()));
        }
        let idx = self.next.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let idx = idx.min(self.replies.len() - 1);
        Ok(CompletionResponse {
            content: self.replies[idx].clone(),
        })
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(text: &str) -> CompletionRequest {
        CompletionRequest {
            messages: vec![CompletionMessage { role: "user".into(), content: text.into() }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn echo_provider_reflects_last_user_message() {
        let resp = EchoProvider.complete(req("hello there")).await.unwrap();
        assert_eq!(resp.content, "echo: hello there");
    }

    #[tokio::test]
    async fn scripted_provider_advances_and_then_holds_last_reply() {
        let provider = ScriptedProvider::new(vec!["one".into(), "two".into()]);
        assert_eq!(provider.complete(req("x")).await.unwrap().content, "one");
        assert_eq!(provider.complete(req("x")).await.unwrap().content, "two");
        assert_eq!(provider.complete(req("x")).await.unwrap().content, "two");
    }

    #[tokio::test]
    async fn scripted_provider_with_no_replies_errors() {
        let provider = ScriptedProvider::new(vec![]);
        let err = provider.complete(req("x")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }
}
