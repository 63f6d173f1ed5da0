//! The agent loop.
//!
//! One call to [`Orchestrator::run_turn`] takes a user message through model
//! requests and tool batches until the model answers with plain text, the
//! iteration cap is hit, the transport fails fatally or the turn is cancelled.
//! All history writes happen here, on the caller's task.

use crate::batch::{BatchRunner, PreparedCall};
use crate::config::{AgentConfig, ConfigError};
use crate::metrics::{MetricTimer, Metrics};
use crate::retry::{RetryError, RetryPolicy};
use crate::transport::{ModelOutput, ModelTransport, TransportError, TransportSummarizer};
use crate::types::{AbortReason, LoopState, TurnReport};
use keel_hooks::{HookContext, HookDispatcher, HookTrigger};
use keel_interfaces::ApprovalHandler;
use keel_memory::tokens::{estimate_messages, estimate_text};
use keel_memory::{
    CheckpointStore, LoopWarning, MemoryError, MessageDraft, SessionState, Summarizer, TokenUsage,
    ToolCallRequest, ToolStatus,
};
use keel_policy::SafetyEngine;
use keel_tools::ToolRegistry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ITERATION_LIMIT_REASON: &str = "iteration limit reached";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Model transport failed: {0}")]
    Transport(TransportError),
    #[error("Model transport failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] MemoryError),
}

pub struct Orchestrator {
    config: AgentConfig,
    transport: Arc<dyn ModelTransport>,
    summarizer: Arc<dyn Summarizer>,
    registry: Arc<ToolRegistry>,
    safety: SafetyEngine,
    hooks: HookDispatcher,
    approvals: Arc<dyn ApprovalHandler>,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
    checkpoints: Option<CheckpointStore>,
}

impl Orchestrator {
    /// Validates `config` and builds the safety engine, hook dispatcher and
    /// retry policy from it. Summaries go through `transport` unless
    /// replaced with [`Orchestrator::with_summarizer`].
    pub fn new(
        config: AgentConfig,
        transport: Arc<dyn ModelTransport>,
        registry: Arc<ToolRegistry>,
        approvals: Arc<dyn ApprovalHandler>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let hooks = HookDispatcher::new(config.hooks.clone(), config.hooks_enabled)
            .map_err(ConfigError::from)?;
        let checkpoints = config
            .checkpoint
            .auto
            .then(|| CheckpointStore::new(&config.checkpoint.directory));

        Ok(Self {
            safety: SafetyEngine::new(config.safety.clone()),
            retry: RetryPolicy::new(config.retry.clone()),
            summarizer: Arc::new(TransportSummarizer::new(transport.clone())),
            metrics: Metrics::new(),
            config,
            transport,
            registry,
            hooks,
            approvals,
            checkpoints,
        })
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Store used for the automatic end-of-turn checkpoint.
    pub fn with_checkpoint_store(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn safety(&self) -> &SafetyEngine {
        &self.safety
    }

    /// Fresh session with the configured policy and system prompt.
    pub fn new_session(&self) -> SessionState {
        let mut state = SessionState::create(
            self.config.policy,
            self.config.context.clone(),
            self.config.loop_detection.clone(),
        );
        if let Some(prompt) = &self.config.system_prompt {
            state.context.set_system_prompt(prompt);
        }
        info!(session = %state.session_id, policy = %state.policy, "Created session");
        state
    }

    /// Restore a session from a checkpoint using this orchestrator's limits.
    pub async fn resume(
        &self,
        store: &CheckpointStore,
        checkpoint_id: &str,
    ) -> Result<SessionState, AgentError> {
        let state = store
            .load(
                checkpoint_id,
                self.config.context.clone(),
                self.config.loop_detection.clone(),
            )
            .await?;
        info!(
            session = %state.session_id,
            checkpoint = %checkpoint_id,
            messages = state.context.len(),
            "Resumed session"
        );
        Ok(state)
    }

    /// Run one user turn to completion.
    ///
    /// Cancellation and the iteration cap end the turn with an `Aborted`
    /// report and consistent history; only transport failures return `Err`.
    pub async fn run_turn(
        &self,
        state: &mut SessionState,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnReport, AgentError> {
        let _timer = MetricTimer::turn();
        let mut report = TurnReport::new();
        info!(session = %state.session_id, turn = state.turn, "Starting turn");

        if state.context.is_empty() {
            if let Some(prompt) = &self.config.system_prompt {
                state.context.set_system_prompt(prompt);
            }
        }

        let base_ctx = HookContext::new(&state.session_id, &self.config.working_dir);
        self.fire(
            HookTrigger::BeforeAgent,
            &base_ctx.clone().with_user_message(input),
            &mut report,
        )
        .await;

        report
            .appended
            .push(state.context.append(MessageDraft::user(input)));

        let outcome = self.drive(state, cancel, &mut report).await;

        if let Err(e) = &outcome {
            error!(session = %state.session_id, error = %e, "Turn failed");
            self.fire(
                HookTrigger::OnError,
                &base_ctx.clone().with_error(e.to_string()),
                &mut report,
            )
            .await;
        }

        let mut after_ctx = base_ctx.with_user_message(input);
        if let Some(text) = &report.final_text {
            after_ctx = after_ctx.with_agent_response(text);
        }
        self.fire(HookTrigger::AfterAgent, &after_ctx, &mut report).await;

        state.turn += 1;
        self.checkpoint(state).await;

        match &report.abort {
            Some(reason) => warn!(session = %state.session_id, reason = ?reason, rounds = report.tool_rounds, "Turn aborted"),
            None if outcome.is_ok() => info!(
                session = %state.session_id,
                rounds = report.tool_rounds,
                appended = report.appended.len(),
                "Turn completed"
            ),
            None => {}
        }

        outcome.map(|()| report)
    }

    async fn drive(
        &self,
        state: &mut SessionState,
        cancel: &CancellationToken,
        report: &mut TurnReport,
    ) -> Result<(), AgentError> {
        let schemas = self.registry.schemas();
        let mut failures: HashMap<String, u32> = HashMap::new();

        loop {
            if cancel.is_cancelled() {
                abort(report, AbortReason::Cancelled);
                return Ok(());
            }

            report.state = LoopState::AwaitingModel;
            // The summary is spliced in only after the summarizer returns, so
            // dropping this future never leaves a half-compressed history.
            let snapshot = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    abort(report, AbortReason::Cancelled);
                    return Ok(());
                }
                snapshot = state.context.snapshot_for_model(
                    self.config.context.context_window,
                    self.summarizer.as_ref(),
                ) => snapshot,
            };
            if let Some(compression) = &snapshot.compression {
                self.metrics.inc_compactions();
                info!(
                    session = %state.session_id,
                    replaced = compression.replaced,
                    tokens_before = compression.tokens_before,
                    tokens_after = compression.tokens_after,
                    fallback = compression.used_fallback,
                    "Compressed history"
                );
            }

            debug!(
                session = %state.session_id,
                messages = snapshot.messages.len(),
                round = report.tool_rounds + 1,
                "Requesting model reply"
            );
            self.metrics.inc_model_requests();
            let reply = {
                let _timer = MetricTimer::model_request();
                let transport = &self.transport;
                let messages = &snapshot.messages;
                let tools = &schemas;
                self.retry
                    .run(
                        cancel,
                        move || transport.complete(messages, tools),
                        |_, _, _| self.metrics.inc_model_retries(),
                    )
                    .await
            };

            let reply = match reply {
                Ok(reply) => reply,
                Err(RetryError::Cancelled) => {
                    abort(report, AbortReason::Cancelled);
                    return Ok(());
                }
                Err(RetryError::Fatal(e)) => {
                    self.metrics.inc_model_failures();
                    return Err(AgentError::Transport(e));
                }
                Err(RetryError::Exhausted { attempts, last }) => {
                    self.metrics.inc_model_failures();
                    return Err(AgentError::RetriesExhausted { attempts, last });
                }
            };

            let usage = reply.usage.unwrap_or_else(|| {
                let completion = match &reply.output {
                    ModelOutput::Text(text) => estimate_text(text),
                    ModelOutput::ToolCalls { text, calls } => {
                        estimate_text(text)
                            + calls
                                .iter()
                                .map(|c| estimate_text(&c.name) + estimate_text(&c.arguments.to_string()))
                                .sum::<usize>()
                    }
                };
                TokenUsage::new(estimate_messages(&snapshot.messages) as u64, completion as u64)
            });
            state.token_usage.add(usage);

            report.state = LoopState::ProcessingResponse;
            let (text, calls) = match reply.output {
                ModelOutput::Text(text) => (text, Vec::new()),
                ModelOutput::ToolCalls { text, calls } => (text, calls),
            };

            if calls.is_empty() {
                report
                    .appended
                    .push(state.context.append(MessageDraft::assistant(text.clone())));
                report.final_text = Some(text);
                report.state = LoopState::Done;
                return Ok(());
            }

            let calls = normalize_call_ids(calls, state.context.next_id());
            let assistant_id = state
                .context
                .append(MessageDraft::assistant_with_calls(text, calls.clone()));
            report.appended.push(assistant_id);

            if report.tool_rounds >= self.config.max_iterations {
                warn!(
                    session = %state.session_id,
                    limit = self.config.max_iterations,
                    pending = calls.len(),
                    "Iteration limit reached"
                );
                for call in &calls {
                    let draft = MessageDraft::tool_result(
                        &call.id,
                        ToolStatus::Cancelled,
                        format!("Error: Tool call cancelled: {}", ITERATION_LIMIT_REASON),
                    );
                    report.appended.push(state.context.append(draft));
                }
                abort(
                    report,
                    AbortReason::IterationLimit {
                        limit: self.config.max_iterations,
                    },
                );
                return Ok(());
            }

            report.state = LoopState::ExecutingTools;
            let mut batch_warnings: Vec<LoopWarning> = Vec::new();
            for call in &calls {
                if let Some(warning) = state.loop_detector.record(&call.name, &call.arguments) {
                    self.metrics.inc_loop_warnings();
                    batch_warnings.push(warning);
                }
            }

            let prepared: Vec<PreparedCall> = calls
                .into_iter()
                .map(|call| PreparedCall {
                    attempt: 1 + failures.get(&call.name).copied().unwrap_or(0),
                    call_id: call.id,
                    tool_name: call.name,
                    arguments: call.arguments,
                    assistant_message_id: assistant_id,
                })
                .collect();

            let runner = BatchRunner {
                registry: &self.registry,
                safety: &self.safety,
                hooks: &self.hooks,
                approvals: self.approvals.as_ref(),
                metrics: &self.metrics,
                policy: state.policy,
                session_id: &state.session_id,
                working_dir: &self.config.working_dir,
                tool_timeout: self.config.tool_timeout(),
                max_concurrent: self.config.max_concurrent_tools,
                cancel,
            };
            let outcomes = runner.run(prepared).await;
            report.tool_rounds += 1;

            for outcome in outcomes {
                if outcome.status == ToolStatus::Error {
                    *failures.entry(outcome.tool_name.clone()).or_insert(0) += 1;
                }
                if outcome.hook_failures > 0 {
                    report.hook_failures += outcome.hook_failures;
                    self.metrics.add_hook_failures(outcome.hook_failures as u64);
                }
                report.appended.push(state.context.append(outcome.to_draft()));
            }

            if self.config.loop_breaker && !batch_warnings.is_empty() {
                let note = loop_breaker_note(&batch_warnings);
                report.appended.push(state.context.append(MessageDraft::user(note)));
            }
            report.loop_warnings.extend(batch_warnings);

            if cancel.is_cancelled() {
                abort(report, AbortReason::Cancelled);
                return Ok(());
            }
        }
    }

    async fn fire(&self, trigger: HookTrigger, ctx: &HookContext, report: &mut TurnReport) {
        if !self.hooks.has_hooks_for(trigger) {
            return;
        }
        let failures = self.hooks.fire(trigger, ctx).await.failures().count();
        if failures > 0 {
            report.hook_failures += failures;
            self.metrics.add_hook_failures(failures as u64);
        }
    }

    async fn checkpoint(&self, state: &SessionState) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        match store.save(state).await {
            Ok(id) => debug!(session = %state.session_id, checkpoint = %id, "Saved checkpoint"),
            Err(e) => warn!(session = %state.session_id, error = %e, "Failed to save checkpoint"),
        }
    }
}

fn abort(report: &mut TurnReport, reason: AbortReason) {
    report.state = LoopState::Aborted;
    report.abort = Some(reason);
}

/// Give every call a non-empty id unique within the batch.
fn normalize_call_ids(calls: Vec<ToolCallRequest>, next_message_id: u64) -> Vec<ToolCallRequest> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .enumerate()
        .map(|(idx, mut call)| {
            if call.id.trim().is_empty() || !seen.insert(call.id.clone()) {
                call.id = format!("call_{}_{}", next_message_id, idx);
                seen.insert(call.id.clone());
            }
            call
        })
        .collect()
}

fn loop_breaker_note(warnings: &[LoopWarning]) -> String {
    let details: Vec<String> = warnings.iter().map(LoopWarning::message).collect();
    format!(
        "Loop detected: {}. Repeating the same calls will not produce new information. \
         Use the results you already have, try a different approach, or give your final answer.",
        details.join("; ")
    )
}
