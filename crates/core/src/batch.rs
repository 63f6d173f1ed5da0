//! Concurrent execution of one batch of model-requested tool calls.
//!
//! Every call runs the same pipeline: `before_tool` hooks, tool gate and
//! approval decision, optional confirmation, dispatch, then `after_tool` and
//! `on_error` hooks. Calls share a semaphore but never each other's fate;
//! outcomes come back in request order.

use crate::metrics::{MetricTimer, Metrics};
use futures::future::join_all;
use keel_hooks::{HookContext, HookDispatcher, HookTrigger};
use keel_interfaces::ApprovalHandler;
use keel_memory::{MessageDraft, MessageId, ToolStatus};
use keel_policy::{ApprovalDecision, ApprovalPolicy, ConfirmationRequest, InvocationAttributes, SafetyEngine};
use keel_tools::{ToolContext, ToolError, ToolKind, ToolRegistry, ToolResult};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A tool call ready for the safety pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    /// Assistant message that requested the call.
    pub assistant_message_id: MessageId,
    /// 1 plus the failures of this tool earlier in the turn.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub call_id: String,
    pub tool_name: String,
    pub status: ToolStatus,
    pub result: ToolResult,
    pub hook_failures: usize,
}

impl CallOutcome {
    fn finished(call: &PreparedCall, result: ToolResult) -> Self {
        let status = if result.success {
            ToolStatus::Success
        } else {
            ToolStatus::Error
        };
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            status,
            result,
            hook_failures: 0,
        }
    }

    pub(crate) fn denied(call: &PreparedCall, reason: &str) -> Self {
        Self {
            status: ToolStatus::Denied,
            ..Self::finished(call, ToolResult::failure(format!("Tool call denied: {}", reason)))
        }
    }

    pub(crate) fn cancelled(call: &PreparedCall, reason: &str) -> Self {
        Self {
            status: ToolStatus::Cancelled,
            ..Self::finished(call, ToolResult::failure(format!("Tool call cancelled: {}", reason)))
        }
    }

    /// Tool-role message recording this outcome.
    pub fn to_draft(&self) -> MessageDraft {
        let mut metadata = json!({ "tool_name": self.tool_name });
        if let Some(map) = metadata.as_object_mut() {
            if self.result.mutated {
                map.insert("mutated".to_string(), json!(true));
            }
            if self.result.truncated {
                map.insert("truncated".to_string(), json!(true));
            }
            if let Some(diff) = &self.result.diff {
                map.insert("diff".to_string(), json!(diff));
            }
            if let Some(extra) = &self.result.metadata {
                map.insert("tool".to_string(), extra.clone());
            }
        }
        MessageDraft::tool_result(&self.call_id, self.status, self.result.to_model_output())
            .with_metadata(metadata)
    }
}

/// Borrowed view of everything a batch needs. Built per round by the orchestrator.
pub(crate) struct BatchRunner<'a> {
    pub registry: &'a ToolRegistry,
    pub safety: &'a SafetyEngine,
    pub hooks: &'a HookDispatcher,
    pub approvals: &'a dyn ApprovalHandler,
    pub metrics: &'a Metrics,
    pub policy: ApprovalPolicy,
    pub session_id: &'a str,
    pub working_dir: &'a Path,
    pub tool_timeout: Duration,
    pub max_concurrent: usize,
    pub cancel: &'a CancellationToken,
}

impl BatchRunner<'_> {
    pub async fn run(&self, calls: Vec<PreparedCall>) -> Vec<CallOutcome> {
        let semaphore = Semaphore::new(self.max_concurrent.max(1));
        join_all(calls.iter().map(|call| self.run_call(call, &semaphore))).await
    }

    async fn run_call(&self, call: &PreparedCall, semaphore: &Semaphore) -> CallOutcome {
        if self.cancel.is_cancelled() {
            return CallOutcome::cancelled(call, "turn was cancelled");
        }

        let hook_ctx = HookContext::new(self.session_id, self.working_dir)
            .with_tool(&call.tool_name, call.arguments.clone());
        let mut hook_failures = 0;

        let mut outcome = self
            .gate_and_execute(call, &hook_ctx, semaphore, &mut hook_failures)
            .await;

        if outcome.status != ToolStatus::Cancelled {
            let output_ctx = hook_ctx
                .clone()
                .with_tool_output(outcome.result.to_model_output());
            let after = self.hooks.fire(HookTrigger::AfterTool, &output_ctx).await;
            hook_failures += after.failures().count();

            if outcome.status == ToolStatus::Error {
                let error = outcome.result.error.clone().unwrap_or_default();
                let on_error = self
                    .hooks
                    .fire(HookTrigger::OnError, &output_ctx.with_error(error))
                    .await;
                hook_failures += on_error.failures().count();
            }
        }

        outcome.hook_failures = hook_failures;
        outcome
    }

    async fn gate_and_execute(
        &self,
        call: &PreparedCall,
        hook_ctx: &HookContext,
        semaphore: &Semaphore,
        hook_failures: &mut usize,
    ) -> CallOutcome {
        let before = self.hooks.fire(HookTrigger::BeforeTool, hook_ctx).await;
        *hook_failures += before.failures().count();
        if let Some(reason) = before.veto() {
            info!(tool = %call.tool_name, call_id = %call.call_id, reason = %reason, "Tool call vetoed by hook");
            self.metrics.inc_approval_denials();
            return CallOutcome::denied(call, &format!("blocked by hook: {}", reason));
        }

        let Some(tool) = self.registry.get(&call.tool_name) else {
            warn!(tool = %call.tool_name, "Model requested unknown tool");
            return CallOutcome::finished(call, ToolError::NotFound(call.tool_name.clone()).into());
        };
        if let Err(e) = tool.validate(&call.arguments) {
            debug!(tool = %call.tool_name, error = %e, "Invalid tool parameters");
            return CallOutcome::finished(call, e.into());
        }

        let attrs = InvocationAttributes {
            is_mutating: tool.is_mutating(&call.arguments),
            is_dangerous: tool.is_dangerous(&call.arguments),
            is_edit: tool.kind() == ToolKind::Edit,
        };
        let evaluation = self
            .safety
            .evaluate(self.policy, &call.tool_name, attrs, call.attempt);

        match evaluation.decision {
            ApprovalDecision::AutoApproved => {}
            ApprovalDecision::Denied => {
                self.metrics.inc_approval_denials();
                let reason = evaluation
                    .reason
                    .unwrap_or_else(|| "denied by safety policy".to_string());
                return CallOutcome::denied(call, &reason);
            }
            ApprovalDecision::RequiresConfirmation => {
                let details = tool.confirmation(&call.arguments);
                let request = ConfirmationRequest {
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    description: details.description,
                    affected_paths: details.affected_paths,
                    is_dangerous: attrs.is_dangerous,
                    arguments: call.arguments.clone(),
                };
                self.metrics.inc_confirmations();
                let approved = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        return CallOutcome::cancelled(call, "turn was cancelled while awaiting confirmation");
                    }
                    approved = self.approvals.confirm(&request) => approved,
                };
                if !approved {
                    info!(tool = %call.tool_name, call_id = %call.call_id, "User denied tool call");
                    self.metrics.inc_approval_denials();
                    return CallOutcome::denied(call, "user declined");
                }
            }
        }

        // Only execution is bounded; a pending confirmation never holds a slot.
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return CallOutcome::cancelled(call, "turn was cancelled"),
            permit = semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return CallOutcome::cancelled(call, "executor shut down"),
            },
        };

        let ctx = ToolContext::new(self.session_id, &call.call_id)
            .with_working_dir(self.working_dir)
            .with_timeout(self.tool_timeout);
        self.metrics.inc_tool_executions();
        let _timer = MetricTimer::tool_execution();

        let dispatched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return CallOutcome::cancelled(call, "turn was cancelled during execution");
            }
            result = self.registry.dispatch(&call.tool_name, call.arguments.clone(), &ctx) => result,
        };

        let result = dispatched.unwrap_or_else(ToolResult::from);
        if !result.success {
            self.metrics.inc_tool_failures();
            debug!(tool = %call.tool_name, call_id = %call.call_id, error = ?result.error, "Tool call failed");
        }
        CallOutcome::finished(call, result)
    }
}
