use crate::context_manager::{ContextConfig, ContextManager};
use crate::loop_detector::{LoopConfig, LoopDetector};
use crate::types::TokenUsage;
use chrono::{DateTime, Utc};
use keel_policy::ApprovalPolicy;

/// Live state of one conversation. Owned by exactly one orchestrator at a time.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub policy: ApprovalPolicy,
    pub turn: u64,
    pub token_usage: TokenUsage,
    pub created_at: DateTime<Utc>,
    pub context: ContextManager,
    pub loop_detector: LoopDetector,
}

impl SessionState {
    pub fn new(
        session_id: impl Into<String>,
        policy: ApprovalPolicy,
        context: ContextConfig,
        loops: LoopConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            policy,
            turn: 0,
            token_usage: TokenUsage::default(),
            created_at: Utc::now(),
            context: ContextManager::new(context),
            loop_detector: LoopDetector::new(loops),
        }
    }

    /// Fresh session with a random id.
    pub fn create(policy: ApprovalPolicy, context: ContextConfig, loops: LoopConfig) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), policy, context, loops)
    }
}
