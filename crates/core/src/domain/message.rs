use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Visitor,
    HumanAgent,
    AiAgent,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visitor => "visitor",
            Self::HumanAgent => "human_agent",
            Self::AiAgent => "ai_agent",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

/// The inbound event that starts one pipeline run. Immutable for the run;
/// the caller keeps ownership.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerMessage {
    pub id: String,
    pub sender: SenderRole,
    pub sender_id: String,
    pub visibility: Visibility,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl TriggerMessage {
    pub fn is_public_visitor_message(&self) -> bool {
        self.sender == SenderRole::Visitor && self.visibility == Visibility::Public
    }
}

/// One entry of the ordered conversation history. Read-only input to every
/// pipeline component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationMessage {
    pub id: String,
    pub content: String,
    pub sender: SenderRole,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn has_usable_text(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{ConversationMessage, SenderRole, TriggerMessage, Visibility};

    #[test]
    fn public_visitor_trigger_is_detected() {
        let trigger = TriggerMessage {
            id: "t-1".to_string(),
            sender: SenderRole::Visitor,
            sender_id: "v-1".to_string(),
            visibility: Visibility::Public,
            text: "hello".to_string(),
            created_at: Utc::now(),
        };
        assert!(trigger.is_public_visitor_message());

        let private = TriggerMessage { visibility: Visibility::Private, ..trigger.clone() };
        assert!(!private.is_public_visitor_message());

        let teammate = TriggerMessage { sender: SenderRole::HumanAgent, ..trigger };
        assert!(!teammate.is_public_visitor_message());
    }

    #[test]
    fn whitespace_only_content_is_not_usable() {
        let message = ConversationMessage {
            id: "m-1".to_string(),
            content: "   \n".to_string(),
            sender: SenderRole::AiAgent,
            sender_id: "a-1".to_string(),
            sender_name: None,
            visibility: Visibility::Public,
            created_at: Utc::now(),
        };
        assert!(!message.has_usable_text());
    }
}
