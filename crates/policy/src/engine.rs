use crate::approval::{decide, ApprovalDecision, ApprovalPolicy, InvocationAttributes};
use crate::patterns::CommandPatterns;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Invalid command pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("Tool listed as both allowed and denied: {0}")]
    ConflictingTool(String),
}

/// Static safety settings, part of the agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SafetyConfig {
    /// When set, only these tools may run at all.
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
    #[serde(default)]
    pub dangerous_patterns: Vec<String>,
    #[serde(default)]
    pub safe_patterns: Vec<String>,
}

impl SafetyConfig {
    pub fn validate(&self) -> Result<(), PolicyError> {
        for pattern in self.dangerous_patterns.iter().chain(&self.safe_patterns) {
            Regex::new(pattern).map_err(|e| PolicyError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }
        if let Some(allowed) = &self.allowed_tools {
            if let Some(tool) = allowed.iter().find(|t| self.denied_tools.contains(t)) {
                return Err(PolicyError::ConflictingTool(tool.clone()));
            }
        }
        Ok(())
    }
}

/// Whether a tool may be considered at all, before any policy applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolGate {
    Open,
    Closed(String),
}

/// Result of a full safety evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: ApprovalDecision,
    pub reason: Option<String>,
}

pub struct SafetyEngine {
    config: SafetyConfig,
    patterns: Arc<CommandPatterns>,
}

impl SafetyEngine {
    pub fn new(config: SafetyConfig) -> Self {
        let patterns = CommandPatterns::with_extra(
            config.dangerous_patterns.iter().map(String::as_str),
            config.safe_patterns.iter().map(String::as_str),
        );
        Self {
            config,
            patterns: Arc::new(patterns),
        }
    }

    /// Shared command classifier, handed to command-running tools.
    pub fn patterns(&self) -> Arc<CommandPatterns> {
        self.patterns.clone()
    }

    pub fn check_tool(&self, tool_name: &str) -> ToolGate {
        if self.config.denied_tools.iter().any(|t| t == tool_name) {
            return ToolGate::Closed(format!("Tool '{}' is denied by configuration", tool_name));
        }
        if let Some(allowed) = &self.config.allowed_tools {
            if !allowed.iter().any(|t| t == tool_name) {
                return ToolGate::Closed(format!(
                    "Tool '{}' is not in the allowed tool list",
                    tool_name
                ));
            }
        }
        ToolGate::Open
    }

    pub fn evaluate(
        &self,
        policy: ApprovalPolicy,
        tool_name: &str,
        attrs: InvocationAttributes,
        attempt_count: u32,
    ) -> Evaluation {
        if let ToolGate::Closed(reason) = self.check_tool(tool_name) {
            debug!("Tool gate closed for {}: {}", tool_name, reason);
            return Evaluation {
                decision: ApprovalDecision::Denied,
                reason: Some(reason),
            };
        }

        let decision = decide(policy, attrs, attempt_count);
        debug!(
            "Safety decision for {} under {}: {:?} (mutating={}, dangerous={}, attempt={})",
            tool_name, policy, decision, attrs.is_mutating, attrs.is_dangerous, attempt_count
        );
        Evaluation {
            decision,
            reason: None,
        }
    }
}

impl Default for SafetyEngine {
    fn default() -> Self {
        Self::new(SafetyConfig::default())
    }
}
