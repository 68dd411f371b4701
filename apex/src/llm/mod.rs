//! LLM client abstraction: a single stateless `complete`/`stream` trait
//! object fed to the workflow engine.

use async_trait::async_trait;
use tokio::sync::mpsc;

mod anthropic;
mod error;
mod types;

pub use anthropic::AnthropicClient;
pub use error::LlmError;
pub use types::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, MessageContent, Role, StopReason, StreamChunk,
    TokenUsage, ToolCall, ToolDefinition,
};

use crate::config::LlmConfig;

/// Each completion request is independent: no conversation state is
/// maintained by the client itself, since callers pass the full message
/// history (including any replayed conversationState) on every call.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    async fn stream(
        &self,
        request: CompletionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<CompletionResponse, LlmError>;
}

pub fn create_client(config: &LlmConfig) -> Result<std::sync::Arc<dyn LlmClient>, LlmError> {
    match config.provider.as_str() {
        "anthropic" => Ok(std::sync::Arc::new(AnthropicClient::from_config(config)?)),
        other => Err(LlmError::InvalidResponse(format!("Unknown LLM provider: '{other}'. Supported: anthropic"))),
    }
}

#[cfg(test)]
pub mod mock {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{CompletionRequest, CompletionResponse, LlmClient, LlmError, StreamChunk};

    /// Replays a fixed script of responses; errors once exhausted.
    pub struct MockLlmClient {
        responses: Vec<CompletionResponse>,
        call_count: AtomicUsize,
    }

    impl MockLlmClient {
        pub fn new(responses: Vec<CompletionResponse>) -> Self {
            Self { responses, call_count: AtomicUsize::new(0) }
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            self.responses.get(idx).cloned().ok_or_else(|| LlmError::InvalidResponse("no more mock responses".into()))
        }

        async fn stream(
            &self,
            request: CompletionRequest,
            _chunk_tx: mpsc::Sender<StreamChunk>,
        ) -> Result<CompletionResponse, LlmError> {
            self.complete(request).await
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::llm::{StopReason, TokenUsage};

        #[tokio::test]
        async fn mock_client_replays_responses_in_order() {
            let responses = vec![
                CompletionResponse {
                    content: Some("one".to_string()),
                    thinking: None,
                    tool_calls: vec![],
                    stop_reason: StopReason::EndTurn,
                    usage: TokenUsage::default(),
                },
                CompletionResponse {
                    content: Some("two".to_string()),
                    thinking: None,
                    tool_calls: vec![],
                    stop_reason: StopReason::EndTurn,
                    usage: TokenUsage::default(),
                },
            ];
            let client = MockLlmClient::new(responses);
            let req = CompletionRequest {
                system_prompt: "test".to_string(),
                messages: vec![],
                tools: vec![],
                max_tokens: 100,
            };
            let first = client.complete(req.clone()).await.unwrap();
            assert_eq!(first.content.as_deref(), Some("one"));
            let second = client.complete(req).await.unwrap();
            assert_eq!(second.content.as_deref(), Some("two"));
            assert_eq!(client.call_count(), 2);
        }

        #[tokio::test]
        async fn mock_client_errors_once_exhausted() {
            let client = MockLlmClient::new(vec![]);
            let req =
                CompletionRequest { system_prompt: "x".to_string(), messages: vec![], tools: vec![], max_tokens: 1 };
            assert!(client.complete(req).await.is_err());
        }
    }
}
