use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derived per-conversation snapshot, computed once per run by the caller.
/// The pipeline reads it but never mutates it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConversationState {
    pub active_assignee_ids: Vec<String>,
    pub active_participant_ids: Vec<String>,
    pub is_escalated: bool,
    pub escalation_reason: Option<String>,
    /// When set and in the future, the automated agent is paused for this
    /// conversation.
    pub agent_paused_until: Option<DateTime<Utc>>,
}

impl ConversationState {
    pub fn is_paused_at(&self, now: DateTime<Utc>) -> bool {
        self.agent_paused_until.is_some_and(|until| until > now)
    }

    pub fn has_human_assignee(&self) -> bool {
        !self.active_assignee_ids.is_empty()
    }
}

/// Agent configuration and behavior toggles supplied by the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub model: String,
    pub public_replies_allowed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}
