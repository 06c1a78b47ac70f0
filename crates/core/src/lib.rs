pub mod config;
pub mod domain;
pub mod signals;

pub use config::{
    AppConfig, ConfigError, FallbackModel, LlmConfig, LoadOptions, LogFormat, LoggingConfig,
    PipelineConfig,
};
pub use domain::message::{ConversationMessage, SenderRole, TriggerMessage, Visibility};
pub use domain::state::{AgentProfile, Confidence, ConversationId, ConversationState};
pub use signals::{HumanCommand, SignalClassifier, SignalClassifierConfig};
