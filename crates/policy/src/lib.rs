pub mod approval;
pub mod engine;
pub mod patterns;

pub use approval::{decide, ApprovalDecision, ApprovalPolicy, ConfirmationRequest, InvocationAttributes};
pub use engine::{Evaluation, PolicyError, SafetyConfig, SafetyEngine, ToolGate};
pub use patterns::CommandPatterns;
