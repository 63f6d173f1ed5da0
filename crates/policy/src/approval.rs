use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Approval policy selected for a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    Never,
    Yolo,
    Auto,
    AutoEdit,
    #[default]
    OnRequest,
    OnFailure,
}

impl ApprovalPolicy {
    pub const ALL: [ApprovalPolicy; 6] = [
        ApprovalPolicy::Never,
        ApprovalPolicy::Yolo,
        ApprovalPolicy::Auto,
        ApprovalPolicy::AutoEdit,
        ApprovalPolicy::OnRequest,
        ApprovalPolicy::OnFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalPolicy::Never => "never",
            ApprovalPolicy::Yolo => "yolo",
            ApprovalPolicy::Auto => "auto",
            ApprovalPolicy::AutoEdit => "auto-edit",
            ApprovalPolicy::OnRequest => "on-request",
            ApprovalPolicy::OnFailure => "on-failure",
        }
    }
}

impl fmt::Display for ApprovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ApprovalPolicy::ALL
            .into_iter()
            .find(|p| p.as_str() == s.trim())
            .ok_or_else(|| format!("Unknown approval policy: {}", s))
    }
}

/// Outcome of evaluating one invocation against the active policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    AutoApproved,
    RequiresConfirmation,
    Denied,
}

/// Per-invocation attributes reported by the tool that would run it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvocationAttributes {
    pub is_mutating: bool,
    pub is_dangerous: bool,
    /// File edits that `auto-edit` lets through without asking.
    pub is_edit: bool,
}

impl InvocationAttributes {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn mutating() -> Self {
        Self {
            is_mutating: true,
            ..Self::default()
        }
    }

    pub fn edit() -> Self {
        Self {
            is_mutating: true,
            is_edit: true,
            ..Self::default()
        }
    }

    pub fn dangerous(mut self) -> Self {
        self.is_dangerous = true;
        self
    }
}

/// Decide whether an invocation may run without asking.
///
/// `attempt_count` is 1 for the first attempt of a tool in the current turn
/// and grows with each prior failure of that tool.
pub fn decide(
    policy: ApprovalPolicy,
    attrs: InvocationAttributes,
    attempt_count: u32,
) -> ApprovalDecision {
    use ApprovalDecision::{AutoApproved, RequiresConfirmation};

    if !attrs.is_mutating {
        return AutoApproved;
    }

    match policy {
        ApprovalPolicy::Never | ApprovalPolicy::Yolo => AutoApproved,
        _ if attrs.is_dangerous => RequiresConfirmation,
        ApprovalPolicy::Auto => AutoApproved,
        ApprovalPolicy::AutoEdit if attrs.is_edit => AutoApproved,
        ApprovalPolicy::AutoEdit => RequiresConfirmation,
        ApprovalPolicy::OnRequest => RequiresConfirmation,
        ApprovalPolicy::OnFailure if attempt_count > 1 => RequiresConfirmation,
        ApprovalPolicy::OnFailure => AutoApproved,
    }
}

/// What the user is shown when an invocation needs a yes/no answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfirmationRequest {
    pub call_id: String,
    pub tool_name: String,
    pub description: String,
    #[serde(default)]
    pub affected_paths: Vec<PathBuf>,
    pub is_dangerous: bool,
    pub arguments: serde_json::Value,
}

impl ConfirmationRequest {
    pub fn summary(&self) -> String {
        let mut line = format!("{}: {}", self.tool_name, self.description);
        if !self.affected_paths.is_empty() {
            let paths: Vec<String> = self
                .affected_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            line.push_str(&format!(" [{}]", paths.join(", ")));
        }
        if self.is_dangerous {
            line.push_str(" (dangerous)");
        }
        line
    }
}
