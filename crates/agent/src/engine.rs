//! The generation engine: a bounded, forced-tool-choice completion loop
//! that turns an approved trigger into outbound messages and exactly one
//! terminal action, with a constrained repair sub-loop when the main loop
//! leaves its output contract unmet.

use std::sync::Arc;
use std::time::Duration;

use deskpilot_core::{
    AgentProfile, Confidence, ConversationId, ConversationMessage, ConversationState, SenderRole,
    TriggerMessage,
};
use deskpilot_core::config::PipelineConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{ActionCapture, CapturedAction, TerminalAction};
use crate::decision::ResponseMode;
use crate::llm::{
    bounded_call, ChatMessage, CompletionClient, ModelError, StepRequest, ToolChoice, Usage,
};
use crate::timeline::ToolTimeline;
use crate::tools::{
    ConversationBackend, MessageSentHook, SendCounters, ToolContext, ToolKind, ToolRuntime,
    ToolSet, TypingIndicator,
};

const REPAIR_INSTRUCTION: &str =
    "The previous attempt did not produce a reply. Send exactly one public message answering \
     the visitor with send_public_message, then call finish_respond. Do nothing else.";

const FALLBACK_REASONING: &str =
    "generation contract unmet after repair; caller should substitute a fallback message";

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub model: String,
    pub max_steps: u32,
    pub max_repair_steps: u32,
    pub step_timeout: Duration,
}

impl EngineConfig {
    pub fn new(model: impl Into<String>, pipeline: &PipelineConfig) -> Self {
        Self {
            model: model.into(),
            max_steps: pipeline.max_generation_steps,
            max_repair_steps: pipeline.max_repair_steps,
            step_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything one run needs. The trigger, history, and state are owned by
/// the caller conceptually; the engine takes clones so the run is
/// self-contained across suspension points.
#[derive(Clone)]
pub struct GenerationRequest {
    pub mode: ResponseMode,
    pub agent: AgentProfile,
    pub trigger: TriggerMessage,
    pub history: Vec<ConversationMessage>,
    pub state: ConversationState,
    pub system_prompt: String,
    pub human_command: Option<String>,
    /// Continuation delta hint: constrain the reply to missing information.
    pub supplement_hint: Option<String>,
    pub conversation_id: ConversationId,
    pub org_id: String,
    pub site_id: String,
    pub visitor_id: Option<String>,
    pub typing: Option<Arc<dyn TypingIndicator>>,
    pub on_message_sent: Option<Arc<dyn MessageSentHook>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationResult {
    pub action: CapturedAction,
    pub public_sends: u32,
    pub private_sends: u32,
    /// Cancellation token fired mid-run. The send counters tell the caller
    /// whether a retry is safe.
    pub aborted: bool,
    /// Both loops failed the output contract; the caller must substitute a
    /// canned fallback message rather than stay silent.
    pub needs_fallback_message: bool,
    pub repair_used: bool,
    pub usage: Usage,
    pub steps: u32,
}

pub struct GenerationEngine<C, B> {
    client: C,
    backend: B,
    timeline: ToolTimeline,
    config: EngineConfig,
}

impl<C: CompletionClient, B: ConversationBackend> GenerationEngine<C, B> {
    pub fn new(client: C, backend: B, timeline: ToolTimeline, config: EngineConfig) -> Self {
        Self { client, backend, timeline, config }
    }

    pub async fn run(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> GenerationResult {
        let mut context = self.tool_context(&request);
        let mut capture = ActionCapture::new();
        let mut usage = Usage::default();
        let mut steps = 0u32;

        let mut messages = build_transcript(&request);
        let main_outcome = self
            .drive_loop(
                &mut messages,
                ToolSet::Full,
                self.config.max_steps,
                &mut context,
                &mut capture,
                &mut usage,
                &mut steps,
                cancel,
            )
            .await;

        if main_outcome == LoopOutcome::Cancelled {
            return aborted_result(context.sends, usage, steps);
        }

        if contract_satisfied(&capture, &context) {
            return completed_result(capture, context.sends, usage, steps, false);
        }

        if !context.public_replies_allowed {
            warn!(
                trigger_id = %request.trigger.id,
                "generation contract unmet and public replies disallowed; signaling fallback"
            );
            return fallback_result(capture, context.sends, usage, steps, false);
        }

        info!(
            trigger_id = %request.trigger.id,
            captured = capture.is_set(),
            public_sends = context.sends.public,
            "generation contract unmet; entering repair loop"
        );

        let mut repair_messages = build_transcript(&request);
        repair_messages.push(ChatMessage::system(REPAIR_INSTRUCTION));
        let repair_outcome = self
            .drive_loop(
                &mut repair_messages,
                ToolSet::RepairMinimal,
                self.config.max_repair_steps,
                &mut context,
                &mut capture,
                &mut usage,
                &mut steps,
                cancel,
            )
            .await;

        if repair_outcome == LoopOutcome::Cancelled {
            return aborted_result(context.sends, usage, steps);
        }

        if contract_satisfied(&capture, &context) {
            return completed_result(capture, context.sends, usage, steps, true);
        }

        warn!(trigger_id = %request.trigger.id, "repair loop failed; signaling fallback message");
        fallback_result(capture, context.sends, usage, steps, true)
    }

    /// Drive one bounded tool loop. Stops early on the first captured
    /// terminal action; model errors end the loop and leave the contract
    /// check to decide what happens next.
    #[allow(clippy::too_many_arguments)]
    async fn drive_loop(
        &self,
        messages: &mut Vec<ChatMessage>,
        tool_set: ToolSet,
        max_steps: u32,
        context: &mut ToolContext,
        capture: &mut ActionCapture,
        usage: &mut Usage,
        steps: &mut u32,
        cancel: &CancellationToken,
    ) -> LoopOutcome {
        let tools = ToolKind::toolset(tool_set);

        for _ in 0..max_steps {
            if cancel.is_cancelled() {
                return LoopOutcome::Cancelled;
            }
            *steps += 1;

            let request = StepRequest {
                model: self.config.model.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
                tool_choice: ToolChoice::Required,
                temperature: 0.0,
            };

            let response =
                match bounded_call(self.config.step_timeout, cancel, self.client.step(request))
                    .await
                {
                    Ok(response) => response,
                    Err(ModelError::Cancelled) => return LoopOutcome::Cancelled,
                    Err(error) => {
                        warn!(error = %error, "generation step failed; ending loop");
                        return LoopOutcome::ModelFailed;
                    }
                };

            usage.absorb(response.usage);
            if let Some(text) = &response.text {
                messages.push(ChatMessage::assistant(text.clone()));
            }
            if response.tool_calls.is_empty() {
                debug!("step returned no tool calls under forced tool choice");
                continue;
            }

            for call in &response.tool_calls {
                let mut runtime =
                    ToolRuntime::new(&self.backend, &self.timeline, context, capture);
                match runtime.execute(call).await {
                    Ok(output) => {
                        messages.push(ChatMessage::tool(call.id.clone(), output.to_string()));
                    }
                    Err(error) => {
                        // Tool failures are reported back to the model; they
                        // never corrupt the capture store.
                        warn!(tool = %call.name, error = %error, "tool execution failed");
                        messages.push(ChatMessage::tool(
                            call.id.clone(),
                            format!("{{\"error\": \"{error}\"}}"),
                        ));
                    }
                }
                if capture.is_set() {
                    return LoopOutcome::Finished;
                }
            }
        }

        LoopOutcome::StepsExhausted
    }

    fn tool_context(&self, request: &GenerationRequest) -> ToolContext {
        ToolContext {
            conversation_id: request.conversation_id.clone(),
            org_id: request.org_id.clone(),
            site_id: request.site_id.clone(),
            visitor_id: request.visitor_id.clone(),
            agent_id: request.agent.id.clone(),
            public_replies_allowed: request.agent.public_replies_allowed,
            is_escalated: request.state.is_escalated,
            trigger_id: request.trigger.id.clone(),
            trigger_ts: request.trigger.created_at,
            sends: SendCounters::default(),
            typing: request.typing.clone(),
            on_message_sent: request.on_message_sent.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoopOutcome {
    Finished,
    StepsExhausted,
    ModelFailed,
    Cancelled,
}

fn build_transcript(request: &GenerationRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(request.history.len() + 3);
    messages.push(ChatMessage::system(request.system_prompt.clone()));
    if let Some(hint) = &request.supplement_hint {
        messages.push(ChatMessage::system(hint.clone()));
    }

    for entry in &request.history {
        match entry.sender {
            SenderRole::AiAgent => messages.push(ChatMessage::assistant(entry.content.clone())),
            sender => {
                let speaker = entry
                    .sender_name
                    .clone()
                    .unwrap_or_else(|| sender.as_str().to_string());
                messages.push(ChatMessage::user(format!(
                    "[{}] {}: {}",
                    sender.as_str(),
                    speaker,
                    entry.content
                )));
            }
        }
    }

    let final_message = match (&request.mode, &request.human_command) {
        (ResponseMode::RespondToCommand, Some(command)) => {
            format!("Teammate command: {command}")
        }
        _ => format!("[{}] {}", request.trigger.sender.as_str(), request.trigger.text),
    };
    messages.push(ChatMessage::user(final_message));
    messages
}

fn contract_satisfied(capture: &ActionCapture, context: &ToolContext) -> bool {
    match capture.get() {
        None => false,
        Some(captured) => {
            !(captured.action.requires_public_message()
                && context.sends.public == 0
                && context.public_replies_allowed)
        }
    }
}

fn completed_result(
    capture: ActionCapture,
    sends: SendCounters,
    usage: Usage,
    steps: u32,
    repair_used: bool,
) -> GenerationResult {
    let action = capture.into_inner().unwrap_or_else(safe_fallback_action);
    GenerationResult {
        action,
        public_sends: sends.public,
        private_sends: sends.private,
        aborted: false,
        needs_fallback_message: false,
        repair_used,
        usage,
        steps,
    }
}

fn fallback_result(
    capture: ActionCapture,
    sends: SendCounters,
    usage: Usage,
    steps: u32,
    repair_used: bool,
) -> GenerationResult {
    let action = capture.into_inner().unwrap_or_else(safe_fallback_action);
    GenerationResult {
        action,
        public_sends: sends.public,
        private_sends: sends.private,
        aborted: false,
        needs_fallback_message: true,
        repair_used,
        usage,
        steps,
    }
}

fn aborted_result(sends: SendCounters, usage: Usage, steps: u32) -> GenerationResult {
    GenerationResult {
        action: CapturedAction {
            action: TerminalAction::Skip,
            reasoning: "run cancelled".to_string(),
            confidence: Confidence::Low,
            escalation: None,
        },
        public_sends: sends.public,
        private_sends: sends.private,
        aborted: true,
        needs_fallback_message: false,
        repair_used: false,
        usage,
        steps,
    }
}

fn safe_fallback_action() -> CapturedAction {
    CapturedAction {
        action: TerminalAction::Respond,
        reasoning: FALLBACK_REASONING.to_string(),
        confidence: Confidence::Low,
        escalation: None,
    }
}
