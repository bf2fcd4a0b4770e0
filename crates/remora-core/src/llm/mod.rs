//! Language-model client contract
//!
//! The multiplexer only needs two operations: a streaming completion that
//! hands tokens to a callback as they arrive, and a plain completion that
//! returns the full text. Both carry a cancellation token so in-flight
//! requests can be torn down from the shell state.

mod openai;

pub use openai::OpenAiClient;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::history::HistoryBlock;

/// Receives tokens as a streaming completion produces them.
pub type TokenCallback = Box<dyn FnMut(&str) + Send>;

/// A single completion request.
#[derive(Clone)]
pub struct CompletionRequest {
    /// Cancellation handle; the owner stores a clone in shell state.
    pub cancel: CancellationToken,
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Recent session history, oldest first.
    pub history: Vec<HistoryBlock>,
    pub system_message: Option<String>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("completion canceled")]
    Canceled,
    #[error("completion quota exhausted (HTTP 429): {0}")]
    Quota(String),
    #[error("completion transport error: {0}")]
    Http(String),
    #[error("completion API error: {0}")]
    Api(String),
}

impl LlmError {
    /// Canceled requests are expected and suppressed from the terminal.
    pub fn is_canceled(&self) -> bool {
        matches!(self, LlmError::Canceled)
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, LlmError::Quota(_))
    }
}

/// Shown alongside quota errors so the user knows what to do next.
pub const QUOTA_HELP: &str = "The model provider returned a rate-limit or quota \
error. Check your API plan and billing settings, or configure a different model \
in ~/.config/remora/remora.json.";

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Stream a completion, invoking `on_token` for every token as it
    /// arrives, and return the concatenated output.
    async fn completion_stream(
        &self,
        request: CompletionRequest,
        on_token: TokenCallback,
    ) -> Result<String, LlmError>;

    /// Run a completion and return the full output.
    async fn completion(&self, request: CompletionRequest) -> Result<String, LlmError>;
}
