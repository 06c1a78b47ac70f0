//! Act/observe classification for non-obvious triggers: deterministic rules
//! first, then a ranked list of fallback models tried strictly
//! sequentially, then a conservative post-hoc clamp. Never errors; the last
//! resort is a static observe decision.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use deskpilot_core::config::FallbackModel;
use deskpilot_core::{
    Confidence, ConversationMessage, ConversationState, SenderRole, SignalClassifier,
    TriggerMessage,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::llm::{bounded_call, CompletionClient, ModelError, StructuredRequest};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionIntent {
    Respond,
    Observe,
    AssistTeam,
}

impl DecisionIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Respond => "respond",
            Self::Observe => "observe",
            Self::AssistTeam => "assist_team",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "respond" => Some(Self::Respond),
            "observe" => Some(Self::Observe),
            "assist_team" => Some(Self::AssistTeam),
            _ => None,
        }
    }
}

/// Where the decision came from. Observability only: generation semantics
/// never branch on this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionSource {
    Rule,
    Model,
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmartDecision {
    pub intent: DecisionIntent,
    pub reasoning: String,
    pub confidence: Confidence,
    pub source: DecisionSource,
    pub rule_id: Option<&'static str>,
}

/// Signals derived once per evaluation from history and state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationSignals {
    pub human_active: bool,
    pub seconds_since_human: Option<i64>,
    pub messages_since_human: usize,
    pub visitor_burst_len: usize,
    pub role_pattern: String,
    pub is_escalated: bool,
    pub has_assignees: bool,
}

impl ConversationSignals {
    pub fn derive(
        history: &[ConversationMessage],
        state: &ConversationState,
        now: DateTime<Utc>,
        human_active_window_secs: i64,
    ) -> Self {
        let last_human_index = history
            .iter()
            .rposition(|message| message.sender == SenderRole::HumanAgent);

        let seconds_since_human = last_human_index
            .map(|index| (now - history[index].created_at).num_seconds().max(0));
        let human_active =
            seconds_since_human.is_some_and(|seconds| seconds <= human_active_window_secs);
        let messages_since_human =
            last_human_index.map_or(history.len(), |index| history.len() - index - 1);

        let visitor_burst_len = history
            .iter()
            .rev()
            .take_while(|message| message.sender == SenderRole::Visitor)
            .count();

        let role_pattern = history
            .iter()
            .rev()
            .take(6)
            .map(|message| match message.sender {
                SenderRole::Visitor => "V",
                SenderRole::HumanAgent => "H",
                SenderRole::AiAgent => "A",
            })
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join(",");

        Self {
            human_active,
            seconds_since_human,
            messages_since_human,
            visitor_burst_len,
            role_pattern,
            is_escalated: state.is_escalated,
            has_assignees: state.has_human_assignee(),
        }
    }
}

pub struct SmartDecisionEngine<C> {
    client: C,
    models: Vec<FallbackModel>,
    classifier: SignalClassifier,
    human_active_window_secs: i64,
    excerpt_max_messages: usize,
}

impl<C: CompletionClient> SmartDecisionEngine<C> {
    pub fn new(
        client: C,
        models: Vec<FallbackModel>,
        classifier: SignalClassifier,
        human_active_window_secs: i64,
        excerpt_max_messages: usize,
    ) -> Self {
        Self { client, models, classifier, human_active_window_secs, excerpt_max_messages }
    }

    pub async fn decide(
        &self,
        trigger: &TriggerMessage,
        history: &[ConversationMessage],
        state: &ConversationState,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> SmartDecision {
        let signals =
            ConversationSignals::derive(history, state, now, self.human_active_window_secs);

        if let Some(rule_decision) = self.apply_rules(trigger, &signals) {
            debug!(
                rule_id = rule_decision.rule_id.unwrap_or(""),
                intent = rule_decision.intent.as_str(),
                "smart decision short-circuited by rule"
            );
            return rule_decision;
        }

        let prompt = self.build_prompt(trigger, history, &signals);
        for attempt in &self.models {
            if cancel.is_cancelled() {
                break;
            }
            let attempt_token = cancel.child_token();
            let request = StructuredRequest {
                model: attempt.model.clone(),
                system_prompt: Some(DECISION_SYSTEM_PROMPT.to_string()),
                input: prompt.clone(),
            };

            let outcome = bounded_call(
                attempt.timeout(),
                &attempt_token,
                self.client.complete_structured(request),
            )
            .await;

            match outcome.and_then(|response| parse_decision(&response.value)) {
                Ok(decision) => return self.clamp(decision, trigger, &signals),
                Err(ModelError::Cancelled) => break,
                Err(error) => {
                    warn!(
                        model = %attempt.model,
                        error = %error,
                        "decision model attempt failed; trying next"
                    );
                }
            }
        }

        SmartDecision {
            intent: DecisionIntent::Observe,
            reasoning: "all decision model attempts failed; observing".to_string(),
            confidence: Confidence::Low,
            source: DecisionSource::Fallback,
            rule_id: None,
        }
    }

    /// Phase A. Checked in order before any model call; a match skips
    /// Phase B entirely.
    fn apply_rules(
        &self,
        trigger: &TriggerMessage,
        signals: &ConversationSignals,
    ) -> Option<SmartDecision> {
        if trigger.sender == SenderRole::HumanAgent
            && self.classifier.match_command(&trigger.text).is_none()
        {
            return Some(SmartDecision {
                intent: DecisionIntent::Observe,
                reasoning: "teammate message without a command; the team is talking".to_string(),
                confidence: Confidence::High,
                source: DecisionSource::Rule,
                rule_id: Some("teammate_non_command"),
            });
        }

        if trigger.sender == SenderRole::Visitor && signals.human_active {
            if self.classifier.is_greeting_or_ack(&trigger.text) {
                return Some(SmartDecision {
                    intent: DecisionIntent::Observe,
                    reasoning: "visitor acknowledgement while a human is active".to_string(),
                    confidence: Confidence::High,
                    source: DecisionSource::Rule,
                    rule_id: Some("ack_during_human_active"),
                });
            }
            if self.classifier.sentence_count(&trigger.text) <= 1
                && !self.classifier.is_question_or_request(&trigger.text)
            {
                return Some(SmartDecision {
                    intent: DecisionIntent::Observe,
                    reasoning: "short visitor statement while a human is active".to_string(),
                    confidence: Confidence::Medium,
                    source: DecisionSource::Rule,
                    rule_id: Some("short_statement_during_human_active"),
                });
            }
        }

        None
    }

    fn build_prompt(
        &self,
        trigger: &TriggerMessage,
        history: &[ConversationMessage],
        signals: &ConversationSignals,
    ) -> String {
        let excerpt = self.select_excerpt(history);
        let mut transcript = String::new();
        for message in &excerpt {
            let speaker = message
                .sender_name
                .clone()
                .unwrap_or_else(|| message.sender.as_str().to_string());
            transcript.push_str(&format!("[{}] {}: {}\n", message.sender.as_str(), speaker, message.content));
        }

        format!(
            "Signals:\n\
             - human_active: {}\n\
             - seconds_since_human: {}\n\
             - messages_since_human: {}\n\
             - visitor_burst_len: {}\n\
             - recent_roles: {}\n\
             - escalated: {}\n\
             - has_assignees: {}\n\n\
             Conversation excerpt:\n{}\n\
             New message from {}:\n{}",
            signals.human_active,
            signals
                .seconds_since_human
                .map_or("never".to_string(), |seconds| seconds.to_string()),
            signals.messages_since_human,
            signals.visitor_burst_len,
            signals.role_pattern,
            signals.is_escalated,
            signals.has_assignees,
            transcript,
            trigger.sender.as_str(),
            trigger.text,
        )
    }

    /// Relevance-selected excerpt, capped at `excerpt_max_messages`,
    /// prioritizing recent human-agent messages, the exchange immediately
    /// preceding the current speaker's burst, and the burst itself.
    fn select_excerpt<'h>(
        &self,
        history: &'h [ConversationMessage],
    ) -> Vec<&'h ConversationMessage> {
        let cap = self.excerpt_max_messages;
        if history.len() <= cap {
            return history.iter().collect();
        }

        let burst_start = history.len()
            - history
                .iter()
                .rev()
                .take_while(|message| message.sender == history[history.len() - 1].sender)
                .count();

        let mut selected: BTreeSet<usize> = BTreeSet::new();

        // Priority 1: the three most recent human-agent messages.
        for index in (0..history.len()).rev() {
            if history[index].sender == SenderRole::HumanAgent {
                selected.insert(index);
                if selected.len() >= 3 || selected.len() >= cap {
                    break;
                }
            }
        }

        // Priority 2: the exchange immediately before the burst.
        for index in burst_start.saturating_sub(2)..burst_start {
            if selected.len() >= cap {
                break;
            }
            selected.insert(index);
        }

        // Priority 3: the burst itself, most recent first.
        for index in (burst_start..history.len()).rev() {
            if selected.len() >= cap {
                break;
            }
            selected.insert(index);
        }

        selected.into_iter().map(|index| &history[index]).collect()
    }

    /// Conservative tie-break favoring human continuity: a below-high
    /// `respond` while a human is active and the trigger is not clearly a
    /// question is downgraded to observe.
    fn clamp(
        &self,
        decision: SmartDecision,
        trigger: &TriggerMessage,
        signals: &ConversationSignals,
    ) -> SmartDecision {
        let should_downgrade = decision.intent == DecisionIntent::Respond
            && decision.confidence < Confidence::High
            && signals.human_active
            && !self.classifier.is_question_or_request(&trigger.text);

        if !should_downgrade {
            return decision;
        }

        debug!(
            original_confidence = decision.confidence.as_str(),
            "downgrading respond to observe while a human is active"
        );
        SmartDecision {
            intent: DecisionIntent::Observe,
            reasoning: format!("downgraded while a human is active: {}", decision.reasoning),
            confidence: Confidence::Medium,
            source: decision.source,
            rule_id: decision.rule_id,
        }
    }
}

const DECISION_SYSTEM_PROMPT: &str =
    "Classify whether the automated support agent should act on the new message. Answer as \
     JSON: {\"intent\": \"respond|observe|assist_team\", \"reasoning\": string, \
     \"confidence\": \"low|medium|high\"}";

fn parse_decision(value: &Value) -> Result<SmartDecision, ModelError> {
    let intent = value
        .get("intent")
        .and_then(Value::as_str)
        .and_then(DecisionIntent::parse)
        .ok_or_else(|| ModelError::Malformed("missing or invalid `intent`".to_string()))?;
    let reasoning = value
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let confidence = value
        .get("confidence")
        .and_then(Value::as_str)
        .and_then(Confidence::parse)
        .unwrap_or(Confidence::Low);

    Ok(SmartDecision {
        intent,
        reasoning,
        confidence,
        source: DecisionSource::Model,
        rule_id: None,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use deskpilot_core::config::FallbackModel;
    use deskpilot_core::{
        Confidence, ConversationMessage, ConversationState, SenderRole, SignalClassifier,
        TriggerMessage, Visibility,
    };
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::{
        ConversationSignals, DecisionIntent, DecisionSource, SmartDecisionEngine,
    };
    use crate::llm::{
        CompletionClient, ModelError, StepRequest, StepResponse, StructuredRequest,
        StructuredResponse, Usage,
    };

    struct CountingClient {
        calls: AtomicUsize,
        responses: Vec<Result<serde_json::Value, ModelError>>,
    }

    impl CountingClient {
        fn new(responses: Vec<Result<serde_json::Value, ModelError>>) -> Self {
            Self { calls: AtomicUsize::new(0), responses }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionClient for CountingClient {
        async fn complete_structured(
            &self,
            _request: StructuredRequest,
        ) -> Result<StructuredResponse, ModelError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.get(index) {
                Some(Ok(value)) => {
                    Ok(StructuredResponse { value: value.clone(), usage: Usage::default() })
                }
                Some(Err(error)) => Err(error.clone()),
                None => Err(ModelError::Empty),
            }
        }

        async fn step(&self, _request: StepRequest) -> Result<StepResponse, ModelError> {
            unreachable!("smart decision engine never runs tool loops")
        }
    }

    fn engine(
        client: Arc<CountingClient>,
        model_count: usize,
    ) -> SmartDecisionEngine<Arc<CountingClient>> {
        let models = (0..model_count)
            .map(|index| FallbackModel { model: format!("model-{index}"), timeout_ms: 200 })
            .collect();
        SmartDecisionEngine::new(client, models, SignalClassifier::default(), 120, 10)
    }

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

    fn message(sender: SenderRole, content: &str, seconds_ago: i64) -> ConversationMessage {
        ConversationMessage {
            id: format!("m-{seconds_ago}"),
            content: content.to_string(),
            sender,
            sender_id: "s-1".to_string(),
            sender_name: None,
            visibility: Visibility::Public,
            created_at: Utc::now() - ChronoDuration::seconds(seconds_ago),
        }
    }

    fn history_with_recent_human() -> Vec<ConversationMessage> {
        vec![
            message(SenderRole::Visitor, "my billing looks wrong", 300),
            message(SenderRole::HumanAgent, "let me check your invoice", 30),
            message(SenderRole::Visitor, "thanks", 5),
        ]
    }

    #[tokio::test]
    async fn teammate_message_is_observed_without_model_calls() {
        let client = Arc::new(CountingClient::new(vec![]));
        let engine = engine(client.clone(), 2);
        let decision = engine
            .decide(
                &trigger(SenderRole::HumanAgent, "I'll take this one"),
                &history_with_recent_human(),
                &ConversationState::default(),
                Utc::now(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(decision.intent, DecisionIntent::Observe);
        assert_eq!(decision.confidence, Confidence::High);
        assert_eq!(decision.source, DecisionSource::Rule);
        assert_eq!(decision.rule_id, Some("teammate_non_command"));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn visitor_ack_during_active_human_is_observed_by_rule() {
        let client = Arc::new(CountingClient::new(vec![]));
        let engine = engine(client.clone(), 2);
        let decision = engine
            .decide(
                &trigger(SenderRole::Visitor, "ok thanks"),
                &history_with_recent_human(),
                &ConversationState::default(),
                Utc::now(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(decision.rule_id, Some("ack_during_human_active"));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn short_statement_rule_requires_active_human() {
        let responses = vec![Ok(json!({
            "intent": "respond",
            "reasoning": "clear question",
            "confidence": "high",
        }))];
        let client = Arc::new(CountingClient::new(responses));
        let engine = engine(client.clone(), 1);

        // Human active: rule fires, no model call.
        let decision = engine
            .decide(
                &trigger(SenderRole::Visitor, "the widget arrived today"),
                &history_with_recent_human(),
                &ConversationState::default(),
                Utc::now(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(decision.rule_id, Some("short_statement_during_human_active"));
        assert_eq!(decision.confidence, Confidence::Medium);
        assert_eq!(client.call_count(), 0);

        // No human activity: the same message reaches the model phase.
        let stale_history = vec![
            message(SenderRole::HumanAgent, "checking", 4_000),
            message(SenderRole::Visitor, "any news?", 60),
        ];
        let decision = engine
            .decide(
                &trigger(SenderRole::Visitor, "the widget arrived today"),
                &stale_history,
                &ConversationState::default(),
                Utc::now(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(decision.source, DecisionSource::Model);
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn model_failures_fall_through_to_secondary_then_static_observe() {
        let client = Arc::new(CountingClient::new(vec![
            Err(ModelError::Provider("down".to_string())),
            Err(ModelError::Empty),
        ]));
        let engine = engine(client.clone(), 2);
        let decision = engine
            .decide(
                &trigger(SenderRole::Visitor, "can you check whether my plan covers this?"),
                &[],
                &ConversationState::default(),
                Utc::now(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(decision.intent, DecisionIntent::Observe);
        assert_eq!(decision.confidence, Confidence::Low);
        assert_eq!(decision.source, DecisionSource::Fallback);
        assert_eq!(client.call_count(), 2, "both models tried sequentially");
    }

    #[tokio::test]
    async fn low_confidence_respond_is_clamped_while_human_active() {
        let client = Arc::new(CountingClient::new(vec![Ok(json!({
            "intent": "respond",
            "reasoning": "might be useful",
            "confidence": "medium",
        }))]));
        let engine = engine(client.clone(), 1);
        // Multi-sentence statement so no Phase A rule matches but the clamp
        // condition (not clearly a question) holds.
        let decision = engine
            .decide(
                &trigger(SenderRole::Visitor, "I spoke to billing earlier. They mentioned a credit."),
                &history_with_recent_human(),
                &ConversationState::default(),
                Utc::now(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(decision.intent, DecisionIntent::Observe);
        assert_eq!(decision.confidence, Confidence::Medium);
        assert_eq!(decision.source, DecisionSource::Model);
        assert!(decision.reasoning.starts_with("downgraded"));
    }

    #[tokio::test]
    async fn high_confidence_respond_is_not_clamped() {
        let client = Arc::new(CountingClient::new(vec![Ok(json!({
            "intent": "respond",
            "reasoning": "direct question to the bot",
            "confidence": "high",
        }))]));
        let engine = engine(client.clone(), 1);
        let decision = engine
            .decide(
                &trigger(SenderRole::Visitor, "I checked the docs already. Nothing worked so far."),
                &history_with_recent_human(),
                &ConversationState::default(),
                Utc::now(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(decision.intent, DecisionIntent::Respond);
    }

    #[test]
    fn signals_derivation_counts_bursts_and_human_recency() {
        let history = vec![
            message(SenderRole::HumanAgent, "on it", 500),
            message(SenderRole::AiAgent, "summary posted", 400),
            message(SenderRole::Visitor, "first", 90),
            message(SenderRole::Visitor, "second", 60),
            message(SenderRole::Visitor, "third", 10),
        ];
        let now = Utc::now();
        let signals =
            ConversationSignals::derive(&history, &ConversationState::default(), now, 120);

        assert!(!signals.human_active);
        assert_eq!(signals.messages_since_human, 4);
        assert_eq!(signals.visitor_burst_len, 3);
        assert_eq!(signals.role_pattern, "H,A,V,V,V");
        assert!(signals.seconds_since_human.unwrap() >= 500);
    }

    #[test]
    fn excerpt_caps_and_prioritizes_human_messages() {
        let mut history = Vec::new();
        for index in 0..30 {
            let sender = if index == 3 || index == 10 {
                SenderRole::HumanAgent
            } else if index % 2 == 0 {
                SenderRole::Visitor
            } else {
                SenderRole::AiAgent
            };
            history.push(message(sender, &format!("message {index}"), (40 - index) as i64));
        }
        // Trailing visitor burst.
        history.push(message(SenderRole::Visitor, "burst 1", 2));
        history.push(message(SenderRole::Visitor, "burst 2", 1));

        let client = Arc::new(CountingClient::new(vec![]));
        let engine = engine(client, 1);
        let excerpt = engine.select_excerpt(&history);

        assert!(excerpt.len() <= 10);
        assert!(excerpt.iter().any(|message| message.content == "message 10"));
        assert!(excerpt.iter().any(|message| message.content == "burst 2"));
        // Chronological order is preserved.
        let times: Vec<_> = excerpt.iter().map(|message| message.created_at).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
    }
}
