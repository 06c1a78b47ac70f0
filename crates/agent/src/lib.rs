//! Decision and response pipeline for the deskpilot support assistant.
//!
//! Every inbound trigger flows through the same staged pipeline:
//!
//! 1. **Continuation gate** (`continuation`) - Queued triggers only: has a
//!    newer automated reply already answered the deferred message?
//! 2. **Decision gate** (`decision`) - Deterministic act/observe rules:
//!    commands, pauses, sender roles. No model calls.
//! 3. **Smart decision** (`smart`) - Act/observe classification for visitor
//!    messages: cheap rules first, then ranked fallback models.
//! 4. **Generation** (`engine`) - Forced-tool-choice completion loop that
//!    produces outbound messages and exactly one terminal action, with a
//!    constrained repair pass when the output contract is unmet.
//!
//! # Key Types
//!
//! - `PipelineRuntime` - One entry point per trigger (see `runtime`)
//! - `CompletionClient` - Pluggable model seam (see `llm`)
//! - `ConversationBackend` - Side-effecting tool collaborator (see `tools`)
//!
//! # Safety Principle
//!
//! Gates never fail a run: every timeout, provider failure, or malformed
//! model output degrades to a deterministic conservative outcome. The only
//! hard stop is the caller's cancellation token.

pub mod capture;
pub mod continuation;
pub mod decision;
pub mod engine;
pub mod llm;
pub mod runtime;
pub mod smart;
pub mod timeline;
pub mod tools;

pub use capture::{ActionCapture, CapturedAction, EscalationRequest, TerminalAction};
pub use continuation::{ContinuationDecision, ContinuationGate, ContinuationResult};
pub use decision::{DecisionResult, ResponseMode};
pub use engine::{EngineConfig, GenerationEngine, GenerationRequest, GenerationResult};
pub use llm::{CompletionClient, ModelError, Usage};
pub use runtime::{PipelineOutcome, PipelineRequest, PipelineRuntime};
pub use smart::{DecisionIntent, DecisionSource, SmartDecision, SmartDecisionEngine};
pub use timeline::{TimelineRecord, TimelineSink, ToolTimeline};
pub use tools::{ConversationBackend, NoopConversationBackend, ToolError, ToolKind, ToolSet};
