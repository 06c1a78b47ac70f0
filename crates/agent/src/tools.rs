//! The fixed tool surface offered to the generation loop, the per-run
//! capability bundle, and the dispatcher that executes one tool call.
//!
//! Tool kinds are a closed enum rather than dynamically registered
//! closures: the engine, not the tools, enforces the exactly-one-terminal
//! contract, and every side effect goes through the `ConversationBackend`
//! collaborator with an explicit idempotency key.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deskpilot_core::{Confidence, ConversationId, Visibility};
use serde_json::{json, Value};
use thiserror::Error;

use crate::capture::{ActionCapture, CapturedAction, EscalationRequest, TerminalAction};
use crate::llm::{ToolCallRequest, ToolDescriptor};
use crate::timeline::ToolTimeline;

const DEFAULT_KNOWLEDGE_LIMIT: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolKind {
    SendPublicMessage,
    SendPrivateMessage,
    UpdateTitle,
    UpdateSentiment,
    SetPriority,
    SearchKnowledge,
    IdentifyVisitor,
    FinishRespond,
    FinishEscalate,
    FinishResolve,
    FinishMarkSpam,
    FinishSkip,
}

/// Which tools a loop invocation exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolSet {
    Full,
    /// Repair sub-loop surface: one send plus the respond finish.
    RepairMinimal,
}

impl ToolKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::SendPublicMessage => "send_public_message",
            Self::SendPrivateMessage => "send_private_message",
            Self::UpdateTitle => "update_title",
            Self::UpdateSentiment => "update_sentiment",
            Self::SetPriority => "set_priority",
            Self::SearchKnowledge => "search_knowledge",
            Self::IdentifyVisitor => "identify_visitor",
            Self::FinishRespond => "finish_respond",
            Self::FinishEscalate => "finish_escalate",
            Self::FinishResolve => "finish_resolve",
            Self::FinishMarkSpam => "finish_mark_spam",
            Self::FinishSkip => "finish_skip",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "send_public_message" => Some(Self::SendPublicMessage),
            "send_private_message" => Some(Self::SendPrivateMessage),
            "update_title" => Some(Self::UpdateTitle),
            "update_sentiment" => Some(Self::UpdateSentiment),
            "set_priority" => Some(Self::SetPriority),
            "search_knowledge" => Some(Self::SearchKnowledge),
            "identify_visitor" => Some(Self::IdentifyVisitor),
            "finish_respond" => Some(Self::FinishRespond),
            "finish_escalate" => Some(Self::FinishEscalate),
            "finish_resolve" => Some(Self::FinishResolve),
            "finish_mark_spam" => Some(Self::FinishMarkSpam),
            "finish_skip" => Some(Self::FinishSkip),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::FinishRespond
                | Self::FinishEscalate
                | Self::FinishResolve
                | Self::FinishMarkSpam
                | Self::FinishSkip
        )
    }

    pub fn terminal_action(self) -> Option<TerminalAction> {
        match self {
            Self::FinishRespond => Some(TerminalAction::Respond),
            Self::FinishEscalate => Some(TerminalAction::Escalate),
            Self::FinishResolve => Some(TerminalAction::Resolve),
            Self::FinishMarkSpam => Some(TerminalAction::MarkSpam),
            Self::FinishSkip => Some(TerminalAction::Skip),
            _ => None,
        }
    }

    pub fn descriptor(self) -> ToolDescriptor {
        match self {
            Self::SendPublicMessage => ToolDescriptor {
                name: self.name(),
                description: "Send a public reply visible to the visitor.",
                parameters: string_params(&[("content", "Message text to send.")]),
            },
            Self::SendPrivateMessage => ToolDescriptor {
                name: self.name(),
                description: "Send an internal note visible only to teammates.",
                parameters: string_params(&[("content", "Note text for the team.")]),
            },
            Self::UpdateTitle => ToolDescriptor {
                name: self.name(),
                description: "Set the conversation title.",
                parameters: string_params(&[("title", "New conversation title.")]),
            },
            Self::UpdateSentiment => ToolDescriptor {
                name: self.name(),
                description: "Record the visitor sentiment (positive, neutral, negative).",
                parameters: string_params(&[("sentiment", "One of positive|neutral|negative.")]),
            },
            Self::SetPriority => ToolDescriptor {
                name: self.name(),
                description: "Set the conversation priority (low, medium, high, urgent).",
                parameters: string_params(&[("priority", "One of low|medium|high|urgent.")]),
            },
            Self::SearchKnowledge => ToolDescriptor {
                name: self.name(),
                description: "Search the knowledge base for relevant articles.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "Search query." },
                        "limit": { "type": "integer", "description": "Max results." },
                    },
                    "required": ["query"],
                }),
            },
            Self::IdentifyVisitor => ToolDescriptor {
                name: self.name(),
                description: "Attach identity details the visitor shared to their profile.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "email": { "type": "string" },
                        "name": { "type": "string" },
                        "phone": { "type": "string" },
                    },
                }),
            },
            Self::FinishRespond => finish_descriptor(
                self.name(),
                "Finish the run: the sent messages answer the visitor.",
            ),
            Self::FinishEscalate => ToolDescriptor {
                name: self.name(),
                description: "Finish the run by escalating to a human teammate.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "reasoning": { "type": "string" },
                        "confidence": { "type": "string", "description": "low|medium|high" },
                        "reason": { "type": "string", "description": "Why escalation is needed." },
                        "summary": { "type": "string", "description": "Context for the teammate." },
                    },
                    "required": ["reason"],
                }),
            },
            Self::FinishResolve => finish_descriptor(
                self.name(),
                "Finish the run and mark the conversation resolved.",
            ),
            Self::FinishMarkSpam => finish_descriptor(
                self.name(),
                "Finish the run and mark the conversation as spam.",
            ),
            Self::FinishSkip => finish_descriptor(
                self.name(),
                "Finish the run without replying; no action is needed.",
            ),
        }
    }

    pub fn toolset(set: ToolSet) -> Vec<ToolDescriptor> {
        let kinds: &[ToolKind] = match set {
            ToolSet::Full => &[
                Self::SendPublicMessage,
                Self::SendPrivateMessage,
                Self::UpdateTitle,
                Self::UpdateSentiment,
                Self::SetPriority,
                Self::SearchKnowledge,
                Self::IdentifyVisitor,
                Self::FinishRespond,
                Self::FinishEscalate,
                Self::FinishResolve,
                Self::FinishMarkSpam,
                Self::FinishSkip,
            ],
            ToolSet::RepairMinimal => &[Self::SendPublicMessage, Self::FinishRespond],
        };
        kinds.iter().map(|kind| kind.descriptor()).collect()
    }
}

fn string_params(fields: &[(&str, &str)]) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for (field, description) in fields {
        properties.insert(
            (*field).to_string(),
            json!({ "type": "string", "description": description }),
        );
        required.push(Value::String((*field).to_string()));
    }
    json!({ "type": "object", "properties": properties, "required": required })
}

fn finish_descriptor(name: &'static str, description: &'static str) -> ToolDescriptor {
    ToolDescriptor {
        name,
        description,
        parameters: json!({
            "type": "object",
            "properties": {
                "reasoning": { "type": "string" },
                "confidence": { "type": "string", "description": "low|medium|high" },
            },
        }),
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: &'static str, message: String },
    #[error("public replies are not allowed for this run")]
    PublicRepliesNotAllowed,
    #[error("backend failure in {tool}: {message}")]
    Backend { tool: &'static str, message: String },
}

#[async_trait]
pub trait TypingIndicator: Send + Sync {
    async fn set_typing(&self, active: bool);
}

#[async_trait]
pub trait MessageSentHook: Send + Sync {
    async fn message_sent(&self, message_id: &str, visibility: Visibility);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendCounters {
    pub public: u32,
    pub private: u32,
}

/// Capability bundle passed to every tool execution for one run. Owned
/// exclusively by the generation engine for the run's lifetime; no locking
/// because no two runs share one instance.
pub struct ToolContext {
    pub conversation_id: ConversationId,
    pub org_id: String,
    pub site_id: String,
    pub visitor_id: Option<String>,
    pub agent_id: String,
    pub public_replies_allowed: bool,
    pub is_escalated: bool,
    pub trigger_id: String,
    pub trigger_ts: DateTime<Utc>,
    pub sends: SendCounters,
    pub typing: Option<Arc<dyn TypingIndicator>>,
    pub on_message_sent: Option<Arc<dyn MessageSentHook>>,
}

impl ToolContext {
    /// Deterministic key for one outbound message: trigger identity plus the
    /// message ordinal, so a repaired or retried run reuses the keys of the
    /// sends it is repeating.
    fn idempotency_key(&self, visibility: Visibility, ordinal: u32) -> String {
        let channel = match visibility {
            Visibility::Public => "public",
            Visibility::Private => "private",
        };
        format!(
            "{}:{}:{}:{}",
            self.trigger_id,
            self.trigger_ts.timestamp_millis(),
            channel,
            ordinal
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateMessageRequest {
    pub conversation_id: ConversationId,
    pub idempotency_key: String,
    pub content: String,
    pub visibility: Visibility,
    pub author_agent_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateMessageOutcome {
    pub message_id: String,
    /// False when the idempotency key already produced a durable message.
    pub created: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct KnowledgeHit {
    pub title: String,
    pub snippet: String,
    pub url: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VisitorIdentity {
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// Side-effecting collaborator behind every tool. Message creation must be
/// idempotent on the request key.
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    async fn create_message(
        &self,
        request: CreateMessageRequest,
    ) -> Result<CreateMessageOutcome, ToolError>;

    async fn update_title(
        &self,
        conversation_id: &ConversationId,
        title: &str,
    ) -> Result<(), ToolError>;

    async fn update_sentiment(
        &self,
        conversation_id: &ConversationId,
        sentiment: &str,
    ) -> Result<(), ToolError>;

    async fn set_priority(
        &self,
        conversation_id: &ConversationId,
        priority: &str,
    ) -> Result<(), ToolError>;

    async fn search_knowledge(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeHit>, ToolError>;

    async fn identify_visitor(
        &self,
        conversation_id: &ConversationId,
        identity: VisitorIdentity,
    ) -> Result<bool, ToolError>;
}

#[async_trait]
impl<T: ConversationBackend + ?Sized> ConversationBackend for Arc<T> {
    async fn create_message(
        &self,
        request: CreateMessageRequest,
    ) -> Result<CreateMessageOutcome, ToolError> {
        (**self).create_message(request).await
    }

    async fn update_title(
        &self,
        conversation_id: &ConversationId,
        title: &str,
    ) -> Result<(), ToolError> {
        (**self).update_title(conversation_id, title).await
    }

    async fn update_sentiment(
        &self,
        conversation_id: &ConversationId,
        sentiment: &str,
    ) -> Result<(), ToolError> {
        (**self).update_sentiment(conversation_id, sentiment).await
    }

    async fn set_priority(
        &self,
        conversation_id: &ConversationId,
        priority: &str,
    ) -> Result<(), ToolError> {
        (**self).set_priority(conversation_id, priority).await
    }

    async fn search_knowledge(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeHit>, ToolError> {
        (**self).search_knowledge(query, limit).await
    }

    async fn identify_visitor(
        &self,
        conversation_id: &ConversationId,
        identity: VisitorIdentity,
    ) -> Result<bool, ToolError> {
        (**self).identify_visitor(conversation_id, identity).await
    }
}

/// Accepts everything and stores nothing. Useful as a stand-in while wiring
/// a caller, mirroring the other Noop collaborators in this workspace.
#[derive(Default)]
pub struct NoopConversationBackend;

#[async_trait]
impl ConversationBackend for NoopConversationBackend {
    async fn create_message(
        &self,
        _request: CreateMessageRequest,
    ) -> Result<CreateMessageOutcome, ToolError> {
        Ok(CreateMessageOutcome { message_id: uuid::Uuid::new_v4().to_string(), created: true })
    }

    async fn update_title(
        &self,
        _conversation_id: &ConversationId,
        _title: &str,
    ) -> Result<(), ToolError> {
        Ok(())
    }

    async fn update_sentiment(
        &self,
        _conversation_id: &ConversationId,
        _sentiment: &str,
    ) -> Result<(), ToolError> {
        Ok(())
    }

    async fn set_priority(
        &self,
        _conversation_id: &ConversationId,
        _priority: &str,
    ) -> Result<(), ToolError> {
        Ok(())
    }

    async fn search_knowledge(
        &self,
        _query: &str,
        _limit: usize,
    ) -> Result<Vec<KnowledgeHit>, ToolError> {
        Ok(Vec::new())
    }

    async fn identify_visitor(
        &self,
        _conversation_id: &ConversationId,
        _identity: VisitorIdentity,
    ) -> Result<bool, ToolError> {
        Ok(true)
    }
}

/// Executes one tool call against the backend, wrapped in timeline records,
/// writing terminal calls into the per-run capture store.
pub struct ToolRuntime<'run> {
    backend: &'run dyn ConversationBackend,
    timeline: &'run ToolTimeline,
    context: &'run mut ToolContext,
    capture: &'run mut ActionCapture,
}

impl<'run> ToolRuntime<'run> {
    pub fn new(
        backend: &'run dyn ConversationBackend,
        timeline: &'run ToolTimeline,
        context: &'run mut ToolContext,
        capture: &'run mut ActionCapture,
    ) -> Self {
        Self { backend, timeline, context, capture }
    }

    pub async fn execute(&mut self, call: &ToolCallRequest) -> Result<Value, ToolError> {
        let kind = ToolKind::from_name(&call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;

        let record_id =
            self.timeline.running(kind.name(), &self.context.conversation_id, &call.arguments).await;

        let result = self.dispatch(kind, &call.arguments).await;

        match &result {
            Ok(output) => {
                self.timeline
                    .completed(&record_id, kind.name(), &self.context.conversation_id, output)
                    .await;
            }
            Err(error) => {
                self.timeline
                    .failed(
                        &record_id,
                        kind.name(),
                        &self.context.conversation_id,
                        &error.to_string(),
                    )
                    .await;
            }
        }

        result
    }

    async fn dispatch(&mut self, kind: ToolKind, args: &Value) -> Result<Value, ToolError> {
        match kind {
            ToolKind::SendPublicMessage => self.send_message(kind, args, Visibility::Public).await,
            ToolKind::SendPrivateMessage => {
                self.send_message(kind, args, Visibility::Private).await
            }
            ToolKind::UpdateTitle => {
                let title = required_str(kind, args, "title")?;
                self.backend.update_title(&self.context.conversation_id, title).await?;
                Ok(json!({ "ok": true }))
            }
            ToolKind::UpdateSentiment => {
                let sentiment = required_str(kind, args, "sentiment")?;
                self.backend.update_sentiment(&self.context.conversation_id, sentiment).await?;
                Ok(json!({ "ok": true }))
            }
            ToolKind::SetPriority => {
                let priority = required_str(kind, args, "priority")?;
                self.backend.set_priority(&self.context.conversation_id, priority).await?;
                Ok(json!({ "ok": true }))
            }
            ToolKind::SearchKnowledge => {
                let query = required_str(kind, args, "query")?;
                let limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|value| value as usize)
                    .unwrap_or(DEFAULT_KNOWLEDGE_LIMIT);
                let hits = self.backend.search_knowledge(query, limit).await?;
                let results: Vec<Value> = hits
                    .iter()
                    .map(|hit| {
                        json!({
                            "title": hit.title,
                            "snippet": hit.snippet,
                            "url": hit.url,
                        })
                    })
                    .collect();
                Ok(json!({ "results": results }))
            }
            ToolKind::IdentifyVisitor => {
                let identity = VisitorIdentity {
                    email: optional_str(args, "email"),
                    name: optional_str(args, "name"),
                    phone: optional_str(args, "phone"),
                };
                let updated = self
                    .backend
                    .identify_visitor(&self.context.conversation_id, identity)
                    .await?;
                Ok(json!({ "updated": updated }))
            }
            ToolKind::FinishRespond
            | ToolKind::FinishEscalate
            | ToolKind::FinishResolve
            | ToolKind::FinishMarkSpam
            | ToolKind::FinishSkip => self.finish(kind, args),
        }
    }

    async fn send_message(
        &mut self,
        kind: ToolKind,
        args: &Value,
        visibility: Visibility,
    ) -> Result<Value, ToolError> {
        if visibility == Visibility::Public && !self.context.public_replies_allowed {
            return Err(ToolError::PublicRepliesNotAllowed);
        }
        let content = required_str(kind, args, "content")?;
        if content.trim().is_empty() {
            return Err(ToolError::InvalidArguments {
                tool: kind.name(),
                message: "content must not be empty".to_string(),
            });
        }

        let ordinal = match visibility {
            Visibility::Public => self.context.sends.public,
            Visibility::Private => self.context.sends.private,
        };
        let request = CreateMessageRequest {
            conversation_id: self.context.conversation_id.clone(),
            idempotency_key: self.context.idempotency_key(visibility, ordinal),
            content: content.to_string(),
            visibility,
            author_agent_id: self.context.agent_id.clone(),
        };

        if let Some(typing) = &self.context.typing {
            typing.set_typing(false).await;
        }

        let outcome = self.backend.create_message(request).await?;

        // The counter tracks durable outbound messages: a deduplicated call
        // still means the message exists, so it counts either way.
        match visibility {
            Visibility::Public => self.context.sends.public += 1,
            Visibility::Private => self.context.sends.private += 1,
        }

        if outcome.created {
            if let Some(hook) = &self.context.on_message_sent {
                hook.message_sent(&outcome.message_id, visibility).await;
            }
        }

        Ok(json!({ "message_id": outcome.message_id, "created": outcome.created }))
    }

    fn finish(&mut self, kind: ToolKind, args: &Value) -> Result<Value, ToolError> {
        let action = kind.terminal_action().ok_or_else(|| ToolError::InvalidArguments {
            tool: kind.name(),
            message: "not a terminal tool".to_string(),
        })?;

        let reasoning = optional_str(args, "reasoning").unwrap_or_default();
        let confidence = args
            .get("confidence")
            .and_then(Value::as_str)
            .and_then(Confidence::parse)
            .unwrap_or(Confidence::Medium);
        let escalation = (kind == ToolKind::FinishEscalate)
            .then(|| {
                required_str(kind, args, "reason").map(|reason| EscalationRequest {
                    reason: reason.to_string(),
                    summary: optional_str(args, "summary"),
                })
            })
            .transpose()?;

        let outcome = self.capture.record(
            CapturedAction { action, reasoning, confidence, escalation },
            self.context.is_escalated,
        );

        Ok(json!({
            "action": self.capture.get().map(|captured| captured.action.as_str()),
            "recorded": outcome.recorded,
            "already_escalated": outcome.already_escalated,
        }))
    }
}

fn required_str<'a>(kind: ToolKind, args: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    args.get(field).and_then(Value::as_str).ok_or_else(|| ToolError::InvalidArguments {
        tool: kind.name(),
        message: format!("missing required string field `{field}`"),
    })
}

fn optional_str(args: &Value, field: &str) -> Option<String> {
    args.get(field).and_then(Value::as_str).map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use chrono::Utc;
    use deskpilot_core::{ConversationId, Visibility};
    use serde_json::json;
    use tokio::sync::Mutex;

    use super::{
        ConversationBackend, CreateMessageOutcome, CreateMessageRequest, KnowledgeHit,
        SendCounters, ToolContext, ToolError, ToolKind, ToolRuntime, ToolSet, VisitorIdentity,
    };
    use crate::capture::{ActionCapture, TerminalAction};
    use crate::llm::ToolCallRequest;
    use crate::timeline::ToolTimeline;

    /// Backend that deduplicates message creation on the idempotency key.
    #[derive(Default)]
    pub(crate) struct InMemoryBackend {
        messages: Mutex<HashMap<String, String>>,
    }

    impl InMemoryBackend {
        async fn message_count(&self) -> usize {
            self.messages.lock().await.len()
        }
    }

    #[async_trait::async_trait]
    impl ConversationBackend for InMemoryBackend {
        async fn create_message(
            &self,
            request: CreateMessageRequest,
        ) -> Result<CreateMessageOutcome, ToolError> {
            let mut messages = self.messages.lock().await;
            if let Some(existing) = messages.get(&request.idempotency_key) {
                return Ok(CreateMessageOutcome { message_id: existing.clone(), created: false });
            }
            let message_id = format!("msg-{}", messages.len() + 1);
            messages.insert(request.idempotency_key, message_id.clone());
            Ok(CreateMessageOutcome { message_id, created: true })
        }

        async fn update_title(
            &self,
            _conversation_id: &ConversationId,
            _title: &str,
        ) -> Result<(), ToolError> {
            Ok(())
        }

        async fn update_sentiment(
            &self,
            _conversation_id: &ConversationId,
            _sentiment: &str,
        ) -> Result<(), ToolError> {
            Ok(())
        }

        async fn set_priority(
            &self,
            _conversation_id: &ConversationId,
            _priority: &str,
        ) -> Result<(), ToolError> {
            Ok(())
        }

        async fn search_knowledge(
            &self,
            query: &str,
            limit: usize,
        ) -> Result<Vec<KnowledgeHit>, ToolError> {
            Ok(vec![KnowledgeHit {
                title: format!("About: {query}"),
                snippet: "snippet".to_string(),
                url: None,
            }]
            .into_iter()
            .take(limit)
            .collect())
        }

        async fn identify_visitor(
            &self,
            _conversation_id: &ConversationId,
            _identity: VisitorIdentity,
        ) -> Result<bool, ToolError> {
            Ok(true)
        }
    }

    fn context(public_allowed: bool, escalated: bool) -> ToolContext {
        ToolContext {
            conversation_id: ConversationId("c-1".to_string()),
            org_id: "org-1".to_string(),
            site_id: "site-1".to_string(),
            visitor_id: Some("v-1".to_string()),
            agent_id: "agent-1".to_string(),
            public_replies_allowed: public_allowed,
            is_escalated: escalated,
            trigger_id: "t-1".to_string(),
            trigger_ts: Utc::now(),
            sends: SendCounters::default(),
            typing: None,
            on_message_sent: None,
        }
    }

    fn call(name: &str, arguments: serde_json::Value) -> ToolCallRequest {
        ToolCallRequest { id: "call-1".to_string(), name: name.to_string(), arguments }
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_creates_one_durable_message() {
        let backend = Arc::new(InMemoryBackend::default());
        let timeline = ToolTimeline::noop();
        let mut ctx = context(true, false);
        let mut capture = ActionCapture::new();
        let mut runtime = ToolRuntime::new(backend.as_ref(), &timeline, &mut ctx, &mut capture);

        let first = runtime
            .execute(&call("send_public_message", json!({ "content": "hello" })))
            .await
            .unwrap();
        assert_eq!(first["created"], true);

        // A retried run repeats the first send: ordinal 0 again, same key.
        ctx.sends = SendCounters::default();
        let mut runtime = ToolRuntime::new(backend.as_ref(), &timeline, &mut ctx, &mut capture);
        let second = runtime
            .execute(&call("send_public_message", json!({ "content": "hello" })))
            .await
            .unwrap();
        assert_eq!(second["created"], false);
        assert_eq!(backend.message_count().await, 1);
    }

    #[tokio::test]
    async fn public_send_is_refused_when_public_replies_are_disallowed() {
        let backend = InMemoryBackend::default();
        let timeline = ToolTimeline::noop();
        let mut ctx = context(false, false);
        let mut capture = ActionCapture::new();
        let mut runtime = ToolRuntime::new(&backend, &timeline, &mut ctx, &mut capture);

        let result =
            runtime.execute(&call("send_public_message", json!({ "content": "hello" }))).await;
        assert!(matches!(result, Err(ToolError::PublicRepliesNotAllowed)));
        assert_eq!(ctx.sends.public, 0);

        // Private notes stay available.
        let mut runtime = ToolRuntime::new(&backend, &timeline, &mut ctx, &mut capture);
        runtime
            .execute(&call("send_private_message", json!({ "content": "internal note" })))
            .await
            .unwrap();
        assert_eq!(ctx.sends.private, 1);
    }

    #[tokio::test]
    async fn escalate_tool_reports_already_escalated_on_flagged_conversation() {
        let backend = InMemoryBackend::default();
        let timeline = ToolTimeline::noop();
        let mut ctx = context(true, true);
        let mut capture = ActionCapture::new();
        let mut runtime = ToolRuntime::new(&backend, &timeline, &mut ctx, &mut capture);

        let output = runtime
            .execute(&call(
                "finish_escalate",
                json!({ "reason": "angry visitor", "reasoning": "needs a human" }),
            ))
            .await
            .unwrap();

        assert_eq!(output["already_escalated"], true);
        assert_eq!(output["action"], "respond");
        assert_eq!(capture.get().unwrap().action, TerminalAction::Respond);
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let backend = InMemoryBackend::default();
        let timeline = ToolTimeline::noop();
        let mut ctx = context(true, false);
        let mut capture = ActionCapture::new();
        let mut runtime = ToolRuntime::new(&backend, &timeline, &mut ctx, &mut capture);

        let result = runtime.execute(&call("launch_rocket", json!({}))).await;
        assert!(matches!(result, Err(ToolError::UnknownTool(_))));
    }

    #[test]
    fn repair_toolset_is_minimal() {
        let descriptors = ToolKind::toolset(ToolSet::RepairMinimal);
        let names: Vec<&str> = descriptors.iter().map(|descriptor| descriptor.name).collect();
        assert_eq!(names, vec!["send_public_message", "finish_respond"]);
    }

    #[test]
    fn terminal_tools_are_exactly_the_finish_family() {
        let descriptors = ToolKind::toolset(ToolSet::Full);
        let terminal: Vec<&str> = descriptors
            .iter()
            .filter(|descriptor| {
                ToolKind::from_name(descriptor.name).is_some_and(ToolKind::is_terminal)
            })
            .map(|descriptor| descriptor.name)
            .collect();
        assert_eq!(
            terminal,
            vec![
                "finish_respond",
                "finish_escalate",
                "finish_resolve",
                "finish_mark_spam",
                "finish_skip"
            ]
        );
    }
}
