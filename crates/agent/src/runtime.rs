//! One entry point per trigger: continuation gating for queued triggers,
//! the deterministic act/observe gate, the model-backed classification for
//! visitor messages, and finally generation. Each stage either ends the run
//! with an explicit outcome or hands a narrower question to the next.

use std::sync::Arc;

use chrono::Utc;
use deskpilot_core::config::AppConfig;
use deskpilot_core::{
    AgentProfile, ConversationId, ConversationMessage, ConversationState, SignalClassifier,
    TriggerMessage,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::continuation::{ContinuationDecision, ContinuationGate, ContinuationResult};
use crate::decision::{self, ResponseMode};
use crate::engine::{EngineConfig, GenerationEngine, GenerationRequest, GenerationResult};
use crate::llm::CompletionClient;
use crate::smart::{DecisionIntent, SmartDecision, SmartDecisionEngine};
use crate::timeline::ToolTimeline;
use crate::tools::{ConversationBackend, MessageSentHook, TypingIndicator};

#[derive(Clone)]
pub struct PipelineRequest {
    pub agent: AgentProfile,
    pub state: ConversationState,
    pub history: Vec<ConversationMessage>,
    pub trigger: TriggerMessage,
    pub system_prompt: String,
    pub conversation_id: ConversationId,
    pub org_id: String,
    pub site_id: String,
    pub visitor_id: Option<String>,
    /// The trigger arrived while an earlier run was in flight and was
    /// deferred until that run finished.
    pub queued: bool,
    /// The newest automated public reply posted after the trigger, if any.
    pub newer_ai_reply: Option<ConversationMessage>,
    pub typing: Option<Arc<dyn TypingIndicator>>,
    pub on_message_sent: Option<Arc<dyn MessageSentHook>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// A newer automated reply already covers the queued trigger.
    ContinuationSkipped(ContinuationResult),
    /// The deterministic gate found nothing to act on.
    NotActionable { reason: &'static str },
    /// Classification chose to stay out of the conversation.
    Observed(SmartDecision),
    Generated(GenerationResult),
}

pub struct PipelineRuntime<B> {
    continuation: ContinuationGate<Arc<dyn CompletionClient>>,
    smart: SmartDecisionEngine<Arc<dyn CompletionClient>>,
    engine: GenerationEngine<Arc<dyn CompletionClient>, B>,
    classifier: SignalClassifier,
}

impl<B: ConversationBackend> PipelineRuntime<B> {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        backend: B,
        timeline: ToolTimeline,
        config: &AppConfig,
    ) -> Self {
        let classifier = SignalClassifier::default();
        let continuation = ContinuationGate::new(
            client.clone(),
            config.llm.continuation_model.clone(),
            config.pipeline.continuation_timeout(),
            classifier.clone(),
        );
        let smart = SmartDecisionEngine::new(
            client.clone(),
            config.llm.decision_models.clone(),
            classifier.clone(),
            config.pipeline.human_active_window_secs,
            config.pipeline.excerpt_max_messages,
        );
        let engine = GenerationEngine::new(
            client,
            backend,
            timeline,
            EngineConfig::new(config.llm.model.clone(), &config.pipeline),
        );
        Self { continuation, smart, engine, classifier }
    }

    pub async fn handle(
        &self,
        request: PipelineRequest,
        cancel: &CancellationToken,
    ) -> PipelineOutcome {
        let mut supplement_hint = None;

        if request.queued {
            let verdict = self
                .continuation
                .evaluate(Some(&request.trigger), request.newer_ai_reply.as_ref(), cancel)
                .await;
            match verdict.decision {
                ContinuationDecision::Skip => {
                    info!(
                        trigger_id = %request.trigger.id,
                        reason = %verdict.reason,
                        "queued trigger already answered; skipping"
                    );
                    return PipelineOutcome::ContinuationSkipped(verdict);
                }
                ContinuationDecision::Supplement => {
                    supplement_hint = verdict.delta_hint.clone();
                }
                ContinuationDecision::None => {}
            }
        }

        let gate = decision::evaluate(&request.state, &request.trigger, &self.classifier, Utc::now());
        if !gate.should_act {
            info!(
                trigger_id = %request.trigger.id,
                reason = gate.reason,
                "trigger is not actionable"
            );
            return PipelineOutcome::NotActionable { reason: gate.reason };
        }

        // Teammate commands are explicit instructions and bypass the
        // act/observe classification.
        if gate.mode == ResponseMode::RespondToVisitor {
            let decision = self
                .smart
                .decide(&request.trigger, &request.history, &request.state, Utc::now(), cancel)
                .await;
            if decision.intent != DecisionIntent::Respond {
                info!(
                    trigger_id = %request.trigger.id,
                    intent = decision.intent.as_str(),
                    source = ?decision.source,
                    "classification chose not to generate"
                );
                return PipelineOutcome::Observed(decision);
            }
        }

        let generation = GenerationRequest {
            mode: gate.mode,
            agent: request.agent,
            trigger: request.trigger,
            history: request.history,
            state: request.state,
            system_prompt: request.system_prompt,
            human_command: gate.human_command,
            supplement_hint,
            conversation_id: request.conversation_id,
            org_id: request.org_id,
            site_id: request.site_id,
            visitor_id: request.visitor_id,
            typing: request.typing,
            on_message_sent: request.on_message_sent,
        };

        PipelineOutcome::Generated(self.engine.run(generation, cancel).await)
    }
}
