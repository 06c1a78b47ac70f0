//! Continuation gating for queued triggers: has a newer automated reply
//! already addressed the deferred visitor message, and if not, should the
//! next reply only supplement it?

use std::time::Duration;

use deskpilot_core::{Confidence, ConversationMessage, SignalClassifier, TriggerMessage};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::llm::{bounded_call, CompletionClient, ModelError, StructuredRequest};

const SUPPLEMENT_ONLY_HINT: &str =
    "Only add information missing from the previous reply; do not repeat it.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContinuationDecision {
    /// Continuation logic does not apply; proceed normally.
    None,
    /// The newer reply already covers the trigger; do not respond again.
    Skip,
    /// Respond, but only to add what the newer reply missed.
    Supplement,
}

impl ContinuationDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Skip => "skip",
            Self::Supplement => "supplement",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "skip" => Some(Self::Skip),
            "supplement" => Some(Self::Supplement),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContinuationResult {
    pub decision: ContinuationDecision,
    pub reason: String,
    pub confidence: Confidence,
    pub delta_hint: Option<String>,
    pub latest_ai_message_id: Option<String>,
    pub latest_ai_message_text: Option<String>,
}

impl ContinuationResult {
    fn none(reason: &str) -> Self {
        Self {
            decision: ContinuationDecision::None,
            reason: reason.to_string(),
            confidence: Confidence::High,
            delta_hint: None,
            latest_ai_message_id: None,
            latest_ai_message_text: None,
        }
    }
}

pub struct ContinuationGate<C> {
    client: C,
    model: String,
    timeout: Duration,
    classifier: SignalClassifier,
}

impl<C: CompletionClient> ContinuationGate<C> {
    pub fn new(client: C, model: String, timeout: Duration, classifier: SignalClassifier) -> Self {
        Self { client, model, timeout, classifier }
    }

    /// Never fails: every timeout, abort, or malformed classification
    /// resolves to the deterministic fallback.
    pub async fn evaluate(
        &self,
        trigger: Option<&TriggerMessage>,
        newer_ai_reply: Option<&ConversationMessage>,
        cancel: &CancellationToken,
    ) -> ContinuationResult {
        let Some(trigger) = trigger else {
            return ContinuationResult::none("no_trigger");
        };
        if !trigger.is_public_visitor_message() {
            return ContinuationResult::none("not_a_public_visitor_trigger");
        }
        let Some(reply) = newer_ai_reply else {
            return ContinuationResult::none("no_newer_ai_reply");
        };

        if !reply.has_usable_text() {
            return ContinuationResult {
                decision: ContinuationDecision::Supplement,
                reason: "newer_reply_has_no_text".to_string(),
                confidence: Confidence::Low,
                delta_hint: Some(SUPPLEMENT_ONLY_HINT.to_string()),
                latest_ai_message_id: Some(reply.id.clone()),
                latest_ai_message_text: None,
            };
        }

        let request = StructuredRequest {
            model: self.model.clone(),
            system_prompt: Some(
                "Decide whether a queued visitor message still needs a reply given a newer \
                 automated reply. Answer as JSON: {\"decision\": \"skip|supplement\", \
                 \"reason\": string, \"confidence\": \"low|medium|high\", \"delta_hint\": string?}"
                    .to_string(),
            ),
            input: format!(
                "Queued visitor message:\n{}\n\nNewer automated reply:\n{}",
                trigger.text, reply.content
            ),
        };

        let classified =
            bounded_call(self.timeout, cancel, self.client.complete_structured(request)).await;

        match classified.and_then(|response| parse_result(&response.value, reply)) {
            Ok(result) => result,
            Err(error) => {
                warn!(
                    trigger_id = %trigger.id,
                    error = %error,
                    "continuation classification failed; using deterministic fallback"
                );
                self.fallback(trigger, reply)
            }
        }
    }

    /// Deterministic fallback: skip when the trigger is a bare greeting or
    /// acknowledgement and the newer reply already asks a follow-up
    /// question; otherwise supplement cautiously.
    fn fallback(&self, trigger: &TriggerMessage, reply: &ConversationMessage) -> ContinuationResult {
        let greeting_answered = self.classifier.is_greeting_or_ack(&trigger.text)
            && self.classifier.reads_as_followup_question(&reply.content);

        if greeting_answered {
            ContinuationResult {
                decision: ContinuationDecision::Skip,
                reason: "fallback_skip:greeting_already_answered".to_string(),
                confidence: Confidence::Medium,
                delta_hint: None,
                latest_ai_message_id: Some(reply.id.clone()),
                latest_ai_message_text: Some(reply.content.clone()),
            }
        } else {
            ContinuationResult {
                decision: ContinuationDecision::Supplement,
                reason: "fallback_supplement:classifier_unavailable".to_string(),
                confidence: Confidence::Low,
                delta_hint: Some(SUPPLEMENT_ONLY_HINT.to_string()),
                latest_ai_message_id: Some(reply.id.clone()),
                latest_ai_message_text: Some(reply.content.clone()),
            }
        }
    }
}

fn parse_result(
    value: &Value,
    reply: &ConversationMessage,
) -> Result<ContinuationResult, ModelError> {
    let decision = value
        .get("decision")
        .and_then(Value::as_str)
        .and_then(ContinuationDecision::parse)
        .ok_or_else(|| ModelError::Malformed("missing or invalid `decision`".to_string()))?;
    let reason = value
        .get("reason")
        .and_then(Value::as_str)
        .filter(|reason| !reason.trim().is_empty())
        .ok_or_else(|| ModelError::Malformed("missing `reason`".to_string()))?;
    let confidence = value
        .get("confidence")
        .and_then(Value::as_str)
        .and_then(Confidence::parse)
        .unwrap_or(Confidence::Low);
    let delta_hint =
        value.get("delta_hint").and_then(Value::as_str).map(|hint| hint.to_string());

    Ok(ContinuationResult {
        decision,
        reason: reason.to_string(),
        confidence,
        delta_hint,
        latest_ai_message_id: Some(reply.id.clone()),
        latest_ai_message_text: Some(reply.content.clone()),
    })
}
