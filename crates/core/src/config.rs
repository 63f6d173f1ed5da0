//! Orchestrator configuration loaded from YAML.

use crate::retry::RetryConfig;
use keel_hooks::{HookConfig, HookDispatcher, HookError};
use keel_memory::{ContextConfig, LoopConfig};
use keel_policy::{ApprovalPolicy, PolicyError, SafetyConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
    #[error("Invalid safety config: {0}")]
    Safety(#[from] PolicyError),
    #[error("Invalid hook config: {0}")]
    Hook(#[from] HookError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Save a checkpoint after every turn.
    pub auto: bool,
    pub directory: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            auto: false,
            directory: PathBuf::from(".keel/checkpoints"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub policy: ApprovalPolicy,
    /// Tool-executing round trips allowed per user turn.
    pub max_iterations: usize,
    pub max_concurrent_tools: usize,
    pub tool_timeout_secs: u64,
    pub system_prompt: Option<String>,
    pub working_dir: PathBuf,
    pub context: ContextConfig,
    pub loop_detection: LoopConfig,
    /// Append a corrective note after a batch that triggered loop detection.
    pub loop_breaker: bool,
    pub retry: RetryConfig,
    pub safety: SafetyConfig,
    pub hooks_enabled: bool,
    pub hooks: Vec<HookConfig>,
    pub checkpoint: CheckpointConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            policy: ApprovalPolicy::default(),
            max_iterations: 100,
            max_concurrent_tools: 4,
            tool_timeout_secs: 120,
            system_prompt: None,
            working_dir: PathBuf::from("."),
            context: ContextConfig::default(),
            loop_detection: LoopConfig::default(),
            loop_breaker: true,
            retry: RetryConfig::default(),
            safety: SafetyConfig::default(),
            hooks_enabled: true,
            hooks: Vec::new(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Read and validate a YAML config file. Relative `working_dir` and
    /// checkpoint directories resolve against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        let mut config = if content.trim().is_empty() {
            Self::default()
        } else {
            Self::from_yaml(&content)?
        };

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        if config.working_dir.is_relative() {
            config.working_dir = base.join(&config.working_dir);
        }
        if config.checkpoint.directory.is_relative() {
            config.checkpoint.directory = base.join(&config.checkpoint.directory);
        }
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid("max_iterations must be at least 1".to_string()));
        }
        if self.max_concurrent_tools == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_tools must be at least 1".to_string(),
            ));
        }
        if self.tool_timeout_secs == 0 {
            return Err(ConfigError::Invalid("tool_timeout_secs must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.context.compression_threshold)
            || self.context.compression_threshold == 0.0
        {
            return Err(ConfigError::Invalid(
                "context.compression_threshold must be in (0, 1]".to_string(),
            ));
        }
        if self.context.summary_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "context.summary_timeout_ms must be positive".to_string(),
            ));
        }
        if self.context.context_window == 0 {
            return Err(ConfigError::Invalid("context.context_window must be positive".to_string()));
        }
        if self.loop_detection.enabled && self.loop_detection.threshold < 2 {
            return Err(ConfigError::Invalid(
                "loop_detection.threshold must be at least 2".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        self.safety.validate()?;
        HookDispatcher::new(self.hooks.clone(), self.hooks_enabled)?;
        Ok(())
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}
