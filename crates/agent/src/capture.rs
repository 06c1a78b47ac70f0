//! Per-run capture of the single terminal action signaled by tool
//! invocation. One store per generation run, threaded through the tool
//! runtime; never shared across runs and never global.

use deskpilot_core::Confidence;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalAction {
    Respond,
    Escalate,
    Resolve,
    MarkSpam,
    Skip,
}

impl TerminalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Respond => "respond",
            Self::Escalate => "escalate",
            Self::Resolve => "resolve",
            Self::MarkSpam => "mark_spam",
            Self::Skip => "skip",
        }
    }

    /// Actions that must be accompanied by at least one visitor-visible
    /// message when public replies are allowed.
    pub fn requires_public_message(&self) -> bool {
        matches!(self, Self::Respond | Self::Escalate | Self::Resolve)
    }
}

/// Structured escalation payload carried alongside the terminal action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub reason: String,
    pub summary: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedAction {
    pub action: TerminalAction,
    pub reasoning: String,
    pub confidence: Confidence,
    pub escalation: Option<EscalationRequest>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordOutcome {
    pub recorded: bool,
    pub already_escalated: bool,
}

/// Single-writer, single-reader memory cell scoped to one generation run.
#[derive(Debug, Default)]
pub struct ActionCapture {
    slot: Option<CapturedAction>,
}

impl ActionCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the terminal action. The first write wins; an escalate call on
    /// a conversation that is already escalated is remapped to a respond
    /// action carrying the original escalation payload, and the outcome
    /// reports `already_escalated` so the tool result can surface it.
    pub fn record(
        &mut self,
        mut candidate: CapturedAction,
        conversation_escalated: bool,
    ) -> RecordOutcome {
        let mut already_escalated = false;
        if candidate.action == TerminalAction::Escalate && conversation_escalated {
            already_escalated = true;
            candidate.action = TerminalAction::Respond;
            candidate.reasoning = format!(
                "conversation already escalated; responding instead: {}",
                candidate.reasoning
            );
        }

        if let Some(existing) = &self.slot {
            debug!(
                kept = existing.action.as_str(),
                dropped = candidate.action.as_str(),
                "terminal action already captured for this run; ignoring later call"
            );
            return RecordOutcome { recorded: false, already_escalated };
        }

        self.slot = Some(candidate);
        RecordOutcome { recorded: true, already_escalated }
    }

    pub fn is_set(&self) -> bool {
        self.slot.is_some()
    }

    pub fn get(&self) -> Option<&CapturedAction> {
        self.slot.as_ref()
    }

    pub fn into_inner(self) -> Option<CapturedAction> {
        self.slot
    }
}

#[cfg(test)]
mod tests {
    use deskpilot_core::Confidence;

    use super::{ActionCapture, CapturedAction, EscalationRequest, TerminalAction};

    fn escalate_candidate() -> CapturedAction {
        CapturedAction {
            action: TerminalAction::Escalate,
            reasoning: "visitor demands a manager".to_string(),
            confidence: Confidence::High,
            escalation: Some(EscalationRequest {
                reason: "refund dispute".to_string(),
                summary: Some("third contact about the same refund".to_string()),
            }),
        }
    }

    #[test]
    fn first_terminal_write_wins() {
        let mut capture = ActionCapture::new();
        let first = capture.record(
            CapturedAction {
                action: TerminalAction::Resolve,
                reasoning: "issue solved".to_string(),
                confidence: Confidence::High,
                escalation: None,
            },
            false,
        );
        assert!(first.recorded);

        let second = capture.record(escalate_candidate(), false);
        assert!(!second.recorded);
        assert_eq!(capture.get().unwrap().action, TerminalAction::Resolve);
    }

    #[test]
    fn escalate_on_escalated_conversation_is_remapped_to_respond() {
        let mut capture = ActionCapture::new();
        let outcome = capture.record(escalate_candidate(), true);

        assert!(outcome.recorded);
        assert!(outcome.already_escalated);

        let captured = capture.get().unwrap();
        assert_eq!(captured.action, TerminalAction::Respond);
        assert!(captured.reasoning.contains("already escalated"));
        // The structured payload survives the remap for downstream consumers.
        assert_eq!(captured.escalation.as_ref().unwrap().reason, "refund dispute");
    }

    #[test]
    fn escalate_on_calm_conversation_is_kept() {
        let mut capture = ActionCapture::new();
        let outcome = capture.record(escalate_candidate(), false);
        assert!(outcome.recorded);
        assert!(!outcome.already_escalated);
        assert_eq!(capture.get().unwrap().action, TerminalAction::Escalate);
    }
}
