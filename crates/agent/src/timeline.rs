//! Paired running/completed/error audit records around every tool
//! invocation. The sink is an external collaborator; any failure in it is
//! swallowed so logging can never change a tool's own outcome.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deskpilot_core::ConversationId;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// Search snippets and other string payloads are truncated near this bound
/// before persisting.
pub const MAX_SNIPPET_CHARS: usize = 260;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimelinePhase {
    Running,
    Completed,
    Error,
}

impl TimelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

#[derive(Clone, Debug)]
pub struct TimelineRecord {
    pub id: String,
    /// Links a terminal record back to its `running` record.
    pub started_id: Option<String>,
    pub tool: &'static str,
    pub phase: TimelinePhase,
    pub conversation_id: ConversationId,
    pub payload: Value,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait TimelineSink: Send + Sync {
    async fn record(&self, record: TimelineRecord) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct NoopTimelineSink;

#[async_trait]
impl TimelineSink for NoopTimelineSink {
    async fn record(&self, _record: TimelineRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct ToolTimeline {
    sink: Arc<dyn TimelineSink>,
}

impl ToolTimeline {
    pub fn new(sink: Arc<dyn TimelineSink>) -> Self {
        Self { sink }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopTimelineSink))
    }

    /// Emit the `running` record and return its id for pairing. Emission
    /// failure still returns an id so the terminal record stays linked.
    pub async fn running(
        &self,
        tool: &'static str,
        conversation_id: &ConversationId,
        payload: &Value,
    ) -> String {
        let record_id = Uuid::new_v4().to_string();
        self.emit(TimelineRecord {
            id: record_id.clone(),
            started_id: None,
            tool,
            phase: TimelinePhase::Running,
            conversation_id: conversation_id.clone(),
            payload: redact_payload(payload),
            error: None,
            at: Utc::now(),
        })
        .await;
        record_id
    }

    pub async fn completed(
        &self,
        started_id: &str,
        tool: &'static str,
        conversation_id: &ConversationId,
        payload: &Value,
    ) {
        self.emit(TimelineRecord {
            id: Uuid::new_v4().to_string(),
            started_id: Some(started_id.to_string()),
            tool,
            phase: TimelinePhase::Completed,
            conversation_id: conversation_id.clone(),
            payload: redact_payload(payload),
            error: None,
            at: Utc::now(),
        })
        .await;
    }

    pub async fn failed(
        &self,
        started_id: &str,
        tool: &'static str,
        conversation_id: &ConversationId,
        error_message: &str,
    ) {
        self.emit(TimelineRecord {
            id: Uuid::new_v4().to_string(),
            started_id: Some(started_id.to_string()),
            tool,
            phase: TimelinePhase::Error,
            conversation_id: conversation_id.clone(),
            payload: Value::Null,
            error: Some(truncate_text(error_message)),
            at: Utc::now(),
        })
        .await;
    }

    // Fail-open: a broken sink never surfaces to the tool's caller.
    async fn emit(&self, record: TimelineRecord) {
        let tool = record.tool;
        let phase = record.phase.as_str();
        if let Err(error) = self.sink.record(record).await {
            debug!(tool, phase, error = %error, "timeline sink failed; record dropped");
        }
    }
}

/// Mask fields that look like contact or credential data and truncate long
/// string values before they reach the sink.
pub fn redact_payload(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::with_capacity(map.len());
            for (key, entry) in map {
                if is_sensitive_field(key) {
                    redacted.insert(key.clone(), Value::String("[redacted]".to_string()));
                } else {
                    redacted.insert(key.clone(), redact_payload(entry));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_payload).collect()),
        Value::String(text) => Value::String(truncate_text(text)),
        other => other.clone(),
    }
}

fn is_sensitive_field(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    ["email", "phone", "password", "passwd", "secret", "token"]
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn truncate_text(text: &str) -> String {
    if text.chars().count() <= MAX_SNIPPET_CHARS {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(MAX_SNIPPET_CHARS).collect();
    truncated.push('…');
    truncated
}
