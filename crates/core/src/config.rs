use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    /// Primary generation model.
    pub model: String,
    /// Fast model used by the continuation gate classification call.
    pub continuation_model: String,
    /// Ordered fallback list for the smart decision engine, tried
    /// sequentially with a per-attempt timeout.
    pub decision_models: Vec<FallbackModel>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackModel {
    pub model: String,
    pub timeout_ms: u64,
}

impl FallbackModel {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub continuation_timeout_ms: u64,
    pub decision_timeout_ms: u64,
    pub human_active_window_secs: i64,
    pub excerpt_max_messages: usize,
    pub max_generation_steps: u32,
    pub max_repair_steps: u32,
}

impl PipelineConfig {
    pub fn continuation_timeout(&self) -> Duration {
        Duration::from_millis(self.continuation_timeout_ms)
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig {
                api_key: None,
                base_url: None,
                model: "gpt-4o".to_string(),
                continuation_model: "gpt-4o-mini".to_string(),
                decision_models: vec![
                    FallbackModel { model: "gpt-4o-mini".to_string(), timeout_ms: 4_000 },
                    FallbackModel { model: "claude-3-5-haiku".to_string(), timeout_ms: 4_000 },
                ],
            },
            pipeline: PipelineConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            continuation_timeout_ms: 3_000,
            decision_timeout_ms: 4_000,
            human_active_window_secs: 120,
            excerpt_max_messages: 10,
            max_generation_steps: 10,
            max_repair_steps: 3,
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    llm: Option<LlmPatch>,
    pipeline: Option<PipelinePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    continuation_model: Option<String>,
    decision_models: Option<Vec<FallbackModel>>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelinePatch {
    continuation_timeout_ms: Option<u64>,
    decision_timeout_ms: Option<u64>,
    human_active_window_secs: Option<i64>,
    excerpt_max_messages: Option<usize>,
    max_generation_steps: Option<u32>,
    max_repair_steps: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("deskpilot.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(llm) = patch.llm {
            if let Some(api_key_value) = llm.api_key {
                self.llm.api_key = Some(api_key_value.into());
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(continuation_model) = llm.continuation_model {
                self.llm.continuation_model = continuation_model;
            }
            if let Some(decision_models) = llm.decision_models {
                self.llm.decision_models = decision_models;
            }
        }

        if let Some(pipeline) = patch.pipeline {
            if let Some(value) = pipeline.continuation_timeout_ms {
                self.pipeline.continuation_timeout_ms = value;
            }
            if let Some(value) = pipeline.decision_timeout_ms {
                self.pipeline.decision_timeout_ms = value;
            }
            if let Some(value) = pipeline.human_active_window_secs {
                self.pipeline.human_active_window_secs = value;
            }
            if let Some(value) = pipeline.excerpt_max_messages {
                self.pipeline.excerpt_max_messages = value;
            }
            if let Some(value) = pipeline.max_generation_steps {
                self.pipeline.max_generation_steps = value;
            }
            if let Some(value) = pipeline.max_repair_steps {
                self.pipeline.max_repair_steps = value;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(api_key_value) = env::var("DESKPILOT_LLM_API_KEY") {
            self.llm.api_key = Some(api_key_value.into());
        }
        if let Ok(model) = env::var("DESKPILOT_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(level) = env::var("DESKPILOT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format_value) = env::var("DESKPILOT_LOG_FORMAT") {
            self.logging.format = format_value.parse().map_err(|_| {
                ConfigError::InvalidEnvOverride {
                    key: "DESKPILOT_LOG_FORMAT".to_string(),
                    value: format_value,
                }
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
        }
        if self.llm.decision_models.is_empty() {
            return Err(ConfigError::Validation(
                "llm.decision_models must list at least one fallback model".to_string(),
            ));
        }
        if self.pipeline.max_generation_steps == 0 {
            return Err(ConfigError::Validation(
                "pipeline.max_generation_steps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }
    let default = PathBuf::from("deskpilot.toml");
    default.exists().then_some(default)
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    toml::from_str(&raw)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

/// Install the global tracing subscriber per the logging config. Call once at
/// process start, before any pipeline work.
pub fn init_logging(config: &LoggingConfig) {
    use tracing::Level;

    let log_level = config.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.format {
        LogFormat::Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{AppConfig, ConfigError, LoadOptions, LogFormat};

    #[test]
    fn defaults_carry_documented_pipeline_bounds() {
        let config = AppConfig::default();
        assert_eq!(config.pipeline.continuation_timeout_ms, 3_000);
        assert_eq!(config.pipeline.decision_timeout_ms, 4_000);
        assert_eq!(config.pipeline.human_active_window_secs, 120);
        assert_eq!(config.pipeline.excerpt_max_messages, 10);
        assert_eq!(config.pipeline.max_generation_steps, 10);
        assert_eq!(config.pipeline.max_repair_steps, 3);
    }

    #[test]
    fn toml_patch_overrides_selected_fields_only() {
        let mut file = tempfile::NamedTempFile::new().expect("temp config file");
        writeln!(
            file,
            r#"
[llm]
model = "gpt-4.1"

[pipeline]
max_generation_steps = 6

[logging]
level = "debug"
format = "json"
"#
        )
        .expect("write config");

        let config = AppConfig::load(LoadOptions {
            config_path: Some(file.path().to_path_buf()),
            require_file: true,
        })
        .expect("load config");

        assert_eq!(config.llm.model, "gpt-4.1");
        assert_eq!(config.pipeline.max_generation_steps, 6);
        assert_eq!(config.pipeline.max_repair_steps, 3);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn missing_required_file_is_an_error() {
        let result = AppConfig::load(LoadOptions {
            config_path: Some("does-not-exist.toml".into()),
            require_file: true,
        });
        assert!(matches!(result, Err(ConfigError::MissingConfigFile(_))));
    }

    #[test]
    fn empty_decision_model_list_fails_validation() {
        let mut config = AppConfig::default();
        config.llm.decision_models.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }
}
