use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a run. Only moves forward; `Completed` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal status move.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Failed) => true,
            (Self::Running, Self::Running) => true,
            (Self::Running, Self::Completed) => true,
            (Self::Running, Self::Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a run failure, as recorded in [`ErrorInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CapabilityTimeout,
    CapabilityError,
    InvalidResult,
    RetryLimitExceeded,
    InvalidTransition,
    /// A node wrote a payload slot it does not own.
    SlotConflict,
    GraphConfig,
    Cancelled,
    PersistenceConflict,
    NotFound,
    /// The agent answered, but the answer ends the booking (no flights, declined).
    Rejected,
    StepLimitExceeded,
}

impl ErrorKind {
    /// Failures that the retry loop absorbs.
    pub fn is_domain_retryable(self) -> bool {
        matches!(
            self,
            Self::CapabilityTimeout | Self::CapabilityError | Self::InvalidResult
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CapabilityTimeout => "capability_timeout",
            Self::CapabilityError => "capability_error",
            Self::InvalidResult => "invalid_result",
            Self::RetryLimitExceeded => "retry_limit_exceeded",
            Self::InvalidTransition => "invalid_transition",
            Self::SlotConflict => "slot_conflict",
            Self::GraphConfig => "graph_config",
            Self::Cancelled => "cancelled",
            Self::PersistenceConflict => "persistence_conflict",
            Self::NotFound => "not_found",
            Self::Rejected => "rejected",
            Self::StepLimitExceeded => "step_limit_exceeded",
        };
        f.write_str(s)
    }
}

/// Why a run failed. Present on a context only when its status is `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Node that was current when the run failed.
    pub node_id: String,
    pub kind: ErrorKind,
    pub message: String,
    /// Retries consumed by the failing node at the time of failure.
    pub retry_count: u32,
}

/// What happened on one node attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryOutcome {
    Advanced { to: String },
    Retried { reason: String, backoff_ms: u64 },
    Completed,
    Failed { kind: ErrorKind, message: String },
}

/// One audited node attempt. `(node_id, attempt)` is unique within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub node_id: String,
    /// 1-based attempt sequence for this node across the whole run.
    pub attempt: u32,
    pub outcome: HistoryOutcome,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(node_id: impl Into<String>, attempt: u32, outcome: HistoryOutcome) -> Self {
        Self {
            node_id: node_id.into(),
            attempt,
            outcome,
            timestamp: Utc::now(),
        }
    }
}

/// A committed payload slot value and the attempt that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotValue {
    pub owner: String,
    pub attempt: u32,
    pub value: serde_json::Value,
}

/// Events published on the [`EventBus`](crate::event::EventBus) while runs progress.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted { run_id: RunId, graph: String },
    NodeStarted { run_id: RunId, node_id: String, attempt: u32 },
    NodeRetrying {
        run_id: RunId,
        node_id: String,
        retry: u32,
        backoff_ms: u64,
        reason: String,
    },
    NodeAdvanced { run_id: RunId, from: String, to: String },
    RunCompleted { run_id: RunId, steps: usize },
    RunFailed { run_id: RunId, error: ErrorInfo },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeRetrying { run_id, .. }
            | Self::NodeAdvanced { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. } => run_id,
        }
    }
}
