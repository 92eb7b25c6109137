use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use voyage_core::context::ExecutionContext;
use voyage_core::error::{Result, VoyageError};
use voyage_core::event::EventBus;
use voyage_core::traits::ContextStore;
use voyage_core::types::{
    ErrorInfo, ErrorKind, HistoryEntry, HistoryOutcome, RunEvent, RunId, RunStatus,
};

use crate::graph::{NodeFailure, NodeSpec, Outcome, SlotWrite, WorkflowGraph};

const DEFAULT_MAX_STEPS: usize = 50;

/// What a single step left behind.
#[derive(Debug, Clone)]
pub enum Step {
    /// The run is still going; drive it again.
    Continue(ExecutionContext),
    /// The run reached `Completed` or `Failed`.
    Finished(ExecutionContext),
}

/// Caller-facing summary of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub current_node: String,
    /// Final payload; populated for completed runs only.
    pub payload: BTreeMap<String, serde_json::Value>,
    /// Failing node, kind and retry count; populated for failed runs only.
    pub error: Option<ErrorInfo>,
    pub steps: usize,
}

impl RunReport {
    pub fn from_context(ctx: &ExecutionContext) -> Self {
        let payload = if ctx.status() == RunStatus::Completed {
            ctx.payload()
        } else {
            BTreeMap::new()
        };
        Self {
            run_id: ctx.run_id().clone(),
            status: ctx.status(),
            current_node: ctx.current_node().to_string(),
            payload,
            error: ctx.error().cloned(),
            steps: ctx.history().len(),
        }
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "run {}: {}", self.run_id, self.status)?;
        match self.status {
            RunStatus::Completed => {
                for (slot, value) in &self.payload {
                    writeln!(f, "  {}: {}", slot, value)?;
                }
            }
            RunStatus::Failed => {
                if let Some(ref e) = self.error {
                    writeln!(
                        f,
                        "  failed at '{}' ({}, {} retries): {}",
                        e.node_id, e.kind, e.retry_count, e.message
                    )?;
                }
            }
            _ => writeln!(f, "  next node: {}", self.current_node)?,
        }
        write!(f, "  steps: {}", self.steps)
    }
}

/// Drives runs of one workflow graph.
///
/// Every committed step is persisted through the [`ContextStore`] before the
/// next one starts, so the stored snapshot is always the reported state. A
/// runner is shareable; each run it drives is independent and carries its
/// own cancellation token.
pub struct GraphRunner {
    graph: Arc<WorkflowGraph>,
    store: Arc<dyn ContextStore>,
    events: Arc<EventBus>,
    max_steps: usize,
}

impl GraphRunner {
    pub fn new(graph: Arc<WorkflowGraph>, store: Arc<dyn ContextStore>) -> Self {
        Self {
            graph,
            store,
            events: Arc::new(EventBus::default()),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Cap on node executions per run, retries included.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Create and persist a pending run for `input`.
    pub async fn start(&self, input: serde_json::Value) -> Result<ExecutionContext> {
        let ctx = ExecutionContext::new(self.graph.name(), self.graph.entry(), input);
        let ctx = self.persist(ctx).await?;
        info!(run_id = %ctx.run_id(), graph = %self.graph.name(), "Run created");
        Ok(ctx)
    }

    /// Create a run and drive it to the end.
    pub async fn submit(
        &self,
        input: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<ExecutionContext> {
        let ctx = self.start(input).await?;
        self.drive(ctx, cancel).await
    }

    /// Continue a persisted run from its last committed step.
    pub async fn resume(
        &self,
        run_id: &RunId,
        cancel: &CancellationToken,
    ) -> Result<ExecutionContext> {
        let ctx = self.store.load(run_id).await?;
        info!(
            run_id = %run_id,
            node_id = %ctx.current_node(),
            steps = ctx.history().len(),
            "Resuming run"
        );
        self.drive(ctx, cancel).await
    }

    /// Current report for a stored run.
    pub async fn status(&self, run_id: &RunId) -> Result<RunReport> {
        let ctx = self.store.load(run_id).await?;
        Ok(RunReport::from_context(&ctx))
    }

    /// Cancel a run that has not started executing yet.
    pub async fn cancel_pending(&self, run_id: &RunId) -> Result<ExecutionContext> {
        let ctx = self.store.load(run_id).await?;
        if ctx.status() != RunStatus::Pending {
            return Err(VoyageError::InvalidState {
                run_id: run_id.clone(),
                status: ctx.status(),
            });
        }
        self.cancelled(ctx).await
    }

    /// Run steps until the run is terminal.
    pub async fn drive(
        &self,
        ctx: ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionContext> {
        if ctx.status().is_terminal() {
            return Err(VoyageError::InvalidState {
                run_id: ctx.run_id().clone(),
                status: ctx.status(),
            });
        }
        if ctx.graph() != self.graph.name() {
            return Err(VoyageError::GraphConfig(format!(
                "run {} belongs to graph '{}', not '{}'",
                ctx.run_id(),
                ctx.graph(),
                self.graph.name()
            )));
        }

        let mut ctx = ctx;
        if ctx.status() == RunStatus::Pending {
            ctx = self.persist(ctx.with_status(RunStatus::Running)?).await?;
            self.events.publish(RunEvent::RunStarted {
                run_id: ctx.run_id().clone(),
                graph: self.graph.name().to_string(),
            });
        } else {
            self.finish_backoff(&ctx, cancel).await;
        }

        loop {
            match self.step(ctx, cancel).await? {
                Step::Continue(next) => ctx = next,
                Step::Finished(done) => return Ok(done),
            }
        }
    }

    /// Execute the current node once and commit its outcome.
    pub async fn step(&self, ctx: ExecutionContext, cancel: &CancellationToken) -> Result<Step> {
        if ctx.status() != RunStatus::Running {
            return Err(VoyageError::InvalidState {
                run_id: ctx.run_id().clone(),
                status: ctx.status(),
            });
        }

        if cancel.is_cancelled() {
            return self.cancelled(ctx).await.map(Step::Finished);
        }

        let node_id = ctx.current_node().to_string();
        let node = self.graph.node(&node_id).cloned().ok_or_else(|| {
            VoyageError::GraphConfig(format!(
                "node '{}' not found in graph '{}'",
                node_id,
                self.graph.name()
            ))
        })?;

        if ctx.history().len() >= self.max_steps {
            warn!(run_id = %ctx.run_id(), max_steps = self.max_steps, "Step limit reached");
            let retries = ctx.retries(&node_id);
            let failure = NodeFailure {
                kind: ErrorKind::StepLimitExceeded,
                message: format!("run exceeded {} steps", self.max_steps),
            };
            return self
                .finish_failed(ctx, &node_id, None, failure, retries)
                .await
                .map(Step::Finished);
        }

        let attempt = ctx.next_attempt(&node_id);
        info!(run_id = %ctx.run_id(), node_id = %node_id, attempt, "Executing node");
        self.events.publish(RunEvent::NodeStarted {
            run_id: ctx.run_id().clone(),
            node_id: node_id.clone(),
            attempt,
        });

        let outcome = node.execute(&ctx).await;
        debug!(
            run_id = %ctx.run_id(),
            node_id = %node_id,
            outcome = outcome.label(),
            "Node returned"
        );

        match outcome {
            Outcome::Advance { next, slot } => {
                if !self.graph.declares(&node_id, &next) {
                    error!(
                        run_id = %ctx.run_id(),
                        node_id = %node_id,
                        target = %next,
                        "Node advanced to an undeclared successor"
                    );
                    let failure = NodeFailure {
                        kind: ErrorKind::InvalidTransition,
                        message: format!(
                            "'{}' is not a declared successor of '{}'",
                            next, node_id
                        ),
                    };
                    let retries = ctx.retries(&node_id);
                    self.finish_failed(ctx, &node_id, Some(attempt), failure, retries)
                        .await?;
                    return Err(VoyageError::InvalidTransition {
                        node: node_id,
                        target: next,
                    });
                }

                let staged = match commit_slot(&ctx, node.spec(), attempt, slot) {
                    Ok(staged) => staged,
                    Err(e) => return self.reject_slot(ctx, &node_id, attempt, e).await,
                };
                let updated = staged
                    .with_history(HistoryEntry::new(
                        &node_id,
                        attempt,
                        HistoryOutcome::Advanced { to: next.clone() },
                    ))?
                    .with_retries(&node_id, 0)?
                    .with_current(&next)?;
                let saved = self.persist(updated).await?;

                self.events.publish(RunEvent::NodeAdvanced {
                    run_id: saved.run_id().clone(),
                    from: node_id,
                    to: next,
                });
                Ok(Step::Continue(saved))
            }

            Outcome::Retry { kind, reason } => {
                let retry = ctx.retries(&node_id) + 1;
                let policy = &node.spec().retry;

                if !policy.allows(retry) {
                    warn!(
                        run_id = %ctx.run_id(),
                        node_id = %node_id,
                        max_retries = policy.max_retries,
                        last_error = %kind,
                        "Retry budget exhausted"
                    );
                    let failure = NodeFailure {
                        kind: ErrorKind::RetryLimitExceeded,
                        message: format!(
                            "gave up after {} retries: {}",
                            policy.max_retries, reason
                        ),
                    };
                    return self
                        .finish_failed(ctx, &node_id, Some(attempt), failure, retry - 1)
                        .await
                        .map(Step::Finished);
                }

                let delay = policy.delay(retry);
                let backoff_ms = delay.as_millis() as u64;
                warn!(
                    run_id = %ctx.run_id(),
                    node_id = %node_id,
                    retry,
                    max_retries = policy.max_retries,
                    backoff_ms,
                    error = %reason,
                    "Retrying node"
                );

                let updated = ctx
                    .with_history(HistoryEntry::new(
                        &node_id,
                        attempt,
                        HistoryOutcome::Retried {
                            reason: reason.clone(),
                            backoff_ms,
                        },
                    ))?
                    .with_retries(&node_id, retry)?;
                let saved = self.persist(updated).await?;

                self.events.publish(RunEvent::NodeRetrying {
                    run_id: saved.run_id().clone(),
                    node_id,
                    retry,
                    backoff_ms,
                    reason,
                });

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        debug!(run_id = %saved.run_id(), "Backoff interrupted by cancellation");
                    }
                }
                Ok(Step::Continue(saved))
            }

            Outcome::Terminal {
                success: true,
                slot,
                ..
            } => {
                let staged = match commit_slot(&ctx, node.spec(), attempt, slot) {
                    Ok(staged) => staged,
                    Err(e) => return self.reject_slot(ctx, &node_id, attempt, e).await,
                };
                let updated = staged
                    .with_history(HistoryEntry::new(&node_id, attempt, HistoryOutcome::Completed))?
                    .with_retries(&node_id, 0)?
                    .with_status(RunStatus::Completed)?;
                let saved = self.persist(updated).await?;

                info!(run_id = %saved.run_id(), node_id = %node_id, "Run completed");
                self.events.publish(RunEvent::RunCompleted {
                    run_id: saved.run_id().clone(),
                    steps: saved.history().len(),
                });
                Ok(Step::Finished(saved))
            }

            Outcome::Terminal {
                success: false,
                error,
                ..
            } => {
                let failure = error.unwrap_or(NodeFailure {
                    kind: ErrorKind::CapabilityError,
                    message: format!("node '{}' failed", node_id),
                });
                let retries = ctx.retries(&node_id);
                self.finish_failed(ctx, &node_id, Some(attempt), failure, retries)
                    .await
                    .map(Step::Finished)
            }
        }
    }

    /// Fail the run on a slot write the context refused, then surface the error.
    async fn reject_slot(
        &self,
        ctx: ExecutionContext,
        node_id: &str,
        attempt: u32,
        err: VoyageError,
    ) -> Result<Step> {
        error!(
            run_id = %ctx.run_id(),
            node_id = %node_id,
            error = %err,
            "Node wrote a payload slot it does not own"
        );
        let failure = NodeFailure {
            kind: ErrorKind::SlotConflict,
            message: err.to_string(),
        };
        let retries = ctx.retries(node_id);
        self.finish_failed(ctx, node_id, Some(attempt), failure, retries)
            .await?;
        Err(err)
    }

    /// Wait out what is left of a backoff recorded before the run was interrupted.
    async fn finish_backoff(&self, ctx: &ExecutionContext, cancel: &CancellationToken) {
        let Some(last) = ctx.history().last() else {
            return;
        };
        let &HistoryOutcome::Retried { backoff_ms, .. } = &last.outcome else {
            return;
        };
        let elapsed = (Utc::now() - last.timestamp).num_milliseconds().max(0) as u64;
        let remaining = backoff_ms.saturating_sub(elapsed);
        if remaining == 0 {
            return;
        }
        debug!(
            run_id = %ctx.run_id(),
            node_id = %last.node_id,
            remaining_ms = remaining,
            "Finishing interrupted backoff"
        );
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(remaining)) => {}
            _ = cancel.cancelled() => {}
        }
    }

    async fn cancelled(&self, ctx: ExecutionContext) -> Result<ExecutionContext> {
        let node_id = ctx.current_node().to_string();
        info!(run_id = %ctx.run_id(), node_id = %node_id, "Run cancelled");
        let retries = ctx.retries(&node_id);
        let failure = NodeFailure {
            kind: ErrorKind::Cancelled,
            message: "run cancelled".to_string(),
        };
        self.finish_failed(ctx, &node_id, None, failure, retries).await
    }

    /// Mark the run failed at `node_id` and persist it. `attempt` is recorded
    /// in history when the failure came out of a node execution.
    async fn finish_failed(
        &self,
        ctx: ExecutionContext,
        node_id: &str,
        attempt: Option<u32>,
        failure: NodeFailure,
        retry_count: u32,
    ) -> Result<ExecutionContext> {
        let mut updated = ctx;
        if let Some(attempt) = attempt {
            updated = updated.with_history(HistoryEntry::new(
                node_id,
                attempt,
                HistoryOutcome::Failed {
                    kind: failure.kind,
                    message: failure.message.clone(),
                },
            ))?;
        }
        let info = ErrorInfo {
            node_id: node_id.to_string(),
            kind: failure.kind,
            message: failure.message,
            retry_count,
        };
        let saved = self.persist(updated.with_failure(info.clone())?).await?;

        warn!(
            run_id = %saved.run_id(),
            node_id = %node_id,
            kind = %info.kind,
            retry_count,
            "Run failed"
        );
        self.events.publish(RunEvent::RunFailed {
            run_id: saved.run_id().clone(),
            error: info,
        });
        Ok(saved)
    }

    async fn persist(&self, ctx: ExecutionContext) -> Result<ExecutionContext> {
        let committed = ctx.committed();
        self.store.save(&committed).await?;
        Ok(committed)
    }
}

/// Stage a slot write. A node may only write the slot its spec declares.
fn commit_slot(
    ctx: &ExecutionContext,
    spec: &NodeSpec,
    attempt: u32,
    slot: Option<SlotWrite>,
) -> Result<ExecutionContext> {
    let Some(write) = slot else {
        return Ok(ctx.clone());
    };
    if spec.slot.as_deref() != Some(write.slot.as_str()) {
        return Err(VoyageError::UndeclaredSlot {
            node: spec.id.clone(),
            slot: write.slot,
        });
    }
    ctx.with_update(&spec.id, attempt, &write.slot, write.value)
}
