//! The completion-model seam. The model service itself is an external
//! collaborator; the pipeline only depends on this trait and treats every
//! call as an opaque, cancellable, bounded operation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into(), tool_call_id: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into(), tool_call_id: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into(), tool_call_id: None }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Declared shape of one tool offered to the model.
#[derive(Clone, Debug)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

/// One tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn absorb(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// A single structured-output call decoded against a caller-known schema.
#[derive(Clone, Debug)]
pub struct StructuredRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub input: String,
}

#[derive(Clone, Debug)]
pub struct StructuredResponse {
    pub value: Value,
    pub usage: Usage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolChoice {
    /// Every step must call a tool.
    Required,
    Auto,
}

/// One turn of a tool-calling loop.
#[derive(Clone, Debug)]
pub struct StepRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDescriptor>,
    pub tool_choice: ToolChoice,
    /// Deterministic sampling for the generation loop.
    pub temperature: f32,
}

#[derive(Clone, Debug, Default)]
pub struct StepResponse {
    pub tool_calls: Vec<ToolCallRequest>,
    pub text: Option<String>,
    pub usage: Usage,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("model call exceeded its {0:?} bound")]
    Timeout(Duration),
    #[error("model call was cancelled")]
    Cancelled,
    #[error("model returned no usable output")]
    Empty,
    #[error("model output failed schema decoding: {0}")]
    Malformed(String),
    #[error("model provider failure: {0}")]
    Provider(String),
}

impl ModelError {
    /// Timeouts and bad output are always recoverable via fallback; a
    /// cancelled call is a caller decision and must not be retried.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete_structured(
        &self,
        request: StructuredRequest,
    ) -> Result<StructuredResponse, ModelError>;

    async fn step(&self, request: StepRequest) -> Result<StepResponse, ModelError>;
}

#[async_trait]
impl<T: CompletionClient + ?Sized> CompletionClient for Arc<T> {
    async fn complete_structured(
        &self,
        request: StructuredRequest,
    ) -> Result<StructuredResponse, ModelError> {
        (**self).complete_structured(request).await
    }

    async fn step(&self, request: StepRequest) -> Result<StepResponse, ModelError> {
        (**self).step(request).await
    }
}

/// Race a model call against its own timeout and the run's cancellation
/// token. A token abort short-circuits without waiting for the in-flight
/// call to finish.
pub async fn bounded_call<T, F>(
    timeout: Duration,
    cancel: &CancellationToken,
    call: F,
) -> Result<T, ModelError>
where
    F: Future<Output = Result<T, ModelError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ModelError::Cancelled),
        bounded = tokio::time::timeout(timeout, call) => match bounded {
            Ok(result) => result,
            Err(_) => Err(ModelError::Timeout(timeout)),
        },
    }
}
