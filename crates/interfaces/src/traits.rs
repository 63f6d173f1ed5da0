use async_trait::async_trait;
use keel_policy::ConfirmationRequest;

/// Decides pending confirmations. The orchestrator awaits this while the
/// rest of the batch keeps running; `false` denies the call.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn confirm(&self, request: &ConfirmationRequest) -> bool;
}

/// Approves every request. For non-interactive runs and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalHandler for AutoApprove {
    async fn confirm(&self, request: &ConfirmationRequest) -> bool {
        tracing::debug!(tool = %request.tool_name, "Auto-approving confirmation");
        true
    }
}

/// Denies every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDeny;

#[async_trait]
impl ApprovalHandler for AutoDeny {
    async fn confirm(&self, request: &ConfirmationRequest) -> bool {
        tracing::debug!(tool = %request.tool_name, "Auto-denying confirmation");
        false
    }
}
