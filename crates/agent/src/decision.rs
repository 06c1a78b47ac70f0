//! Deterministic first-pass act/observe gate. No model calls: the rule
//! order fully determines the outcome, and escalation state is forwarded
//! rather than used as a gate.

use chrono::{DateTime, Utc};
use deskpilot_core::{ConversationState, SenderRole, SignalClassifier, TriggerMessage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseMode {
    RespondToVisitor,
    RespondToCommand,
    BackgroundOnly,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RespondToVisitor => "respond_to_visitor",
            Self::RespondToCommand => "respond_to_command",
            Self::BackgroundOnly => "background_only",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionResult {
    pub should_act: bool,
    pub mode: ResponseMode,
    pub reason: &'static str,
    pub human_command: Option<String>,
    pub is_escalated: bool,
    pub escalation_reason: Option<String>,
}

/// Priority order, first match wins:
/// 1. recognized teammate command (checked before the pause rule)
/// 2. active pause
/// 3. teammate message as implicit command
/// 4. visitor message
/// 5. nothing actionable
pub fn evaluate(
    state: &ConversationState,
    trigger: &TriggerMessage,
    classifier: &SignalClassifier,
    now: DateTime<Utc>,
) -> DecisionResult {
    let is_escalated = state.is_escalated;
    let escalation_reason = state.escalation_reason.clone();

    if trigger.sender == SenderRole::HumanAgent {
        if let Some(command) = classifier.match_command(&trigger.text) {
            return DecisionResult {
                should_act: true,
                mode: ResponseMode::RespondToCommand,
                reason: "human_command",
                human_command: Some(command.text),
                is_escalated,
                escalation_reason,
            };
        }
    }

    if state.is_paused_at(now) {
        return DecisionResult {
            should_act: false,
            mode: ResponseMode::BackgroundOnly,
            reason: "agent_paused",
            human_command: None,
            is_escalated,
            escalation_reason,
        };
    }

    match trigger.sender {
        SenderRole::HumanAgent => DecisionResult {
            should_act: true,
            mode: ResponseMode::RespondToCommand,
            reason: "implicit_human_command",
            human_command: Some(trigger.text.clone()),
            is_escalated,
            escalation_reason,
        },
        SenderRole::Visitor => DecisionResult {
            should_act: true,
            mode: ResponseMode::RespondToVisitor,
            reason: "visitor_message",
            human_command: None,
            is_escalated,
            escalation_reason,
        },
        SenderRole::AiAgent => DecisionResult {
            should_act: false,
            mode: ResponseMode::BackgroundOnly,
            reason: "no_actionable_trigger",
            human_command: None,
            is_escalated,
            escalation_reason,
        },
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use deskpilot_core::{
        ConversationState, SenderRole, SignalClassifier, TriggerMessage, Visibility,
    };

    use super::{evaluate, ResponseMode};

    fn trigger(sender: SenderRole, text: &str) -> TriggerMessage {
        TriggerMessage {
            id: "t-1".to_string(),
            sender,
            sender_id: "s-1".to_string(),
            visibility: Visibility::Public,
            text: text.to_string(),
            created_at: Utc::now(),
        }
    }

    fn paused_state() -> ConversationState {
        ConversationState {
            agent_paused_until: Some(Utc::now() + Duration::minutes(10)),
            ..ConversationState::default()
        }
    }

    #[test]
    fn teammate_command_beats_active_pause() {
        let classifier = SignalClassifier::default();
        let result = evaluate(
            &paused_state(),
            &trigger(SenderRole::HumanAgent, "/ai draft a refund reply"),
            &classifier,
            Utc::now(),
        );
        assert!(result.should_act);
        assert_eq!(result.mode, ResponseMode::RespondToCommand);
        assert_eq!(result.reason, "human_command");
        assert_eq!(result.human_command.as_deref(), Some("draft a refund reply"));
    }

    #[test]
    fn pause_blocks_visitor_triggers() {
        let classifier = SignalClassifier::default();
        let result = evaluate(
            &paused_state(),
            &trigger(SenderRole::Visitor, "where is my order?"),
            &classifier,
            Utc::now(),
        );
        assert!(!result.should_act);
        assert_eq!(result.mode, ResponseMode::BackgroundOnly);
        assert_eq!(result.reason, "agent_paused");
    }

    #[test]
    fn teammate_message_without_prefix_is_implicit_command() {
        let classifier = SignalClassifier::default();
        let result = evaluate(
            &ConversationState::default(),
            &trigger(SenderRole::HumanAgent, "summarize this for me"),
            &classifier,
            Utc::now(),
        );
        assert!(result.should_act);
        assert_eq!(result.mode, ResponseMode::RespondToCommand);
        assert_eq!(result.reason, "implicit_human_command");
        assert_eq!(result.human_command.as_deref(), Some("summarize this for me"));
    }

    #[test]
    fn visitor_message_yields_respond_to_visitor() {
        let classifier = SignalClassifier::default();
        let result = evaluate(
            &ConversationState::default(),
            &trigger(SenderRole::Visitor, "my export is broken"),
            &classifier,
            Utc::now(),
        );
        assert!(result.should_act);
        assert_eq!(result.mode, ResponseMode::RespondToVisitor);
    }

    #[test]
    fn agent_own_message_is_background_only() {
        let classifier = SignalClassifier::default();
        let result = evaluate(
            &ConversationState::default(),
            &trigger(SenderRole::AiAgent, "automated note"),
            &classifier,
            Utc::now(),
        );
        assert!(!result.should_act);
        assert_eq!(result.mode, ResponseMode::BackgroundOnly);
        assert_eq!(result.reason, "no_actionable_trigger");
    }

    #[test]
    fn escalation_state_is_forwarded_not_gating() {
        let classifier = SignalClassifier::default();
        let state = ConversationState {
            is_escalated: true,
            escalation_reason: Some("billing dispute".to_string()),
            ..ConversationState::default()
        };
        let result = evaluate(
            &state,
            &trigger(SenderRole::Visitor, "any update?"),
            &classifier,
            Utc::now(),
        );
        assert!(result.should_act);
        assert!(result.is_escalated);
        assert_eq!(result.escalation_reason.as_deref(), Some("billing dispute"));
    }
}
