use voyage_core::error::CapabilityError;
use voyage_core::types::ErrorKind;

/// A value a node wants committed to one of the run's payload slots.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotWrite {
    pub slot: String,
    pub value: serde_json::Value,
}

impl SlotWrite {
    pub fn new(slot: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            slot: slot.into(),
            value,
        }
    }
}

/// Why a node ended the run unsuccessfully.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of one node execution. The runner decides what to commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Move to `next`, committing `slot` if present.
    Advance {
        next: String,
        slot: Option<SlotWrite>,
    },
    /// Retryable failure; the runner applies the node's retry policy.
    Retry { kind: ErrorKind, reason: String },
    /// End the run.
    Terminal {
        success: bool,
        slot: Option<SlotWrite>,
        error: Option<NodeFailure>,
    },
}

impl Outcome {
    pub fn advance(next: impl Into<String>) -> Self {
        Self::Advance {
            next: next.into(),
            slot: None,
        }
    }

    pub fn advance_with(next: impl Into<String>, slot: SlotWrite) -> Self {
        Self::Advance {
            next: next.into(),
            slot: Some(slot),
        }
    }

    pub fn retry(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self::Retry {
            kind,
            reason: reason.into(),
        }
    }

    pub fn complete(slot: Option<SlotWrite>) -> Self {
        Self::Terminal {
            success: true,
            slot,
            error: None,
        }
    }

    pub fn fail(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Terminal {
            success: false,
            slot: None,
            error: Some(NodeFailure {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Classify a capability failure: retryable ones retry, the rest end the run.
    pub fn from_capability_error(err: &CapabilityError) -> Self {
        let kind = match err {
            CapabilityError::Timeout(_) => ErrorKind::CapabilityTimeout,
            CapabilityError::InvalidResult(_) => ErrorKind::InvalidResult,
            CapabilityError::Failed { .. } => ErrorKind::CapabilityError,
        };
        if err.is_retryable() {
            Self::retry(kind, err.to_string())
        } else {
            Self::fail(kind, err.to_string())
        }
    }

    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Advance { .. } => "advance",
            Self::Retry { .. } => "retry",
            Self::Terminal { success: true, .. } => "complete",
            Self::Terminal { success: false, .. } => "fail",
        }
    }
}
