//! Per-run execution record.
//!
//! An [`ExecutionContext`] is an immutable snapshot. Every mutation goes
//! through a `with_*` method that returns a new snapshot, so a reader holding
//! an older value never observes a half-applied step.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VoyageError};
use crate::types::{ErrorInfo, HistoryEntry, RunId, RunStatus, SlotValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    run_id: RunId,
    graph: String,
    input: serde_json::Value,
    current_node: String,
    #[serde(default)]
    payload: BTreeMap<String, SlotValue>,
    status: RunStatus,
    #[serde(default)]
    error: Option<ErrorInfo>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(default)]
    retries: BTreeMap<String, u32>,
    revision: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// Create a pending context positioned at the graph's entry node.
    pub fn new(
        graph: impl Into<String>,
        entry_node: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            graph: graph.into(),
            input,
            current_node: entry_node.into(),
            payload: BTreeMap::new(),
            status: RunStatus::Pending,
            error: None,
            history: Vec::new(),
            retries: BTreeMap::new(),
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn graph(&self) -> &str {
        &self.graph
    }

    pub fn input(&self) -> &serde_json::Value {
        &self.input
    }

    pub fn current_node(&self) -> &str {
        &self.current_node
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Committed slot value, if any.
    pub fn slot(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload.get(name).map(|s| &s.value)
    }

    pub fn slot_entry(&self, name: &str) -> Option<&SlotValue> {
        self.payload.get(name)
    }

    /// Plain `slot -> value` view of the payload.
    pub fn payload(&self) -> BTreeMap<String, serde_json::Value> {
        self.payload
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    /// Retries consumed by `node_id` during its current visit.
    pub fn retries(&self, node_id: &str) -> u32 {
        self.retries.get(node_id).copied().unwrap_or(0)
    }

    /// Attempts of `node_id` recorded so far across the whole run.
    pub fn attempts(&self, node_id: &str) -> u32 {
        self.history
            .iter()
            .filter(|h| h.node_id == node_id)
            .map(|h| h.attempt)
            .max()
            .unwrap_or(0)
    }

    /// Sequence number the next attempt of `node_id` will carry.
    pub fn next_attempt(&self, node_id: &str) -> u32 {
        self.attempts(node_id) + 1
    }

    fn ensure_open(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(VoyageError::InvalidState {
                run_id: self.run_id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    /// Write `value` into `slot` on behalf of `node_id`'s `attempt`.
    ///
    /// A slot belongs to the first node that writes it. The owner may
    /// replace it from a later attempt; the same attempt may only repeat an
    /// identical write.
    pub fn with_update(
        &self,
        node_id: &str,
        attempt: u32,
        slot: &str,
        value: serde_json::Value,
    ) -> Result<Self> {
        self.ensure_open()?;

        if let Some(existing) = self.payload.get(slot) {
            let conflict = existing.owner != node_id
                || attempt < existing.attempt
                || (attempt == existing.attempt && existing.value != value);
            if conflict {
                return Err(VoyageError::SlotConflict {
                    slot: slot.to_string(),
                    owner: existing.owner.clone(),
                    attempt: existing.attempt,
                });
            }
            if attempt == existing.attempt {
                return Ok(self.clone());
            }
        }

        let mut next = self.clone();
        next.payload.insert(
            slot.to_string(),
            SlotValue {
                owner: node_id.to_string(),
                attempt,
                value,
            },
        );
        Ok(next)
    }

    /// Append a history entry. Re-appending an existing `(node_id, attempt)` is a no-op.
    pub fn with_history(&self, entry: HistoryEntry) -> Result<Self> {
        self.ensure_open()?;
        let duplicate = self
            .history
            .iter()
            .any(|h| h.node_id == entry.node_id && h.attempt == entry.attempt);
        if duplicate {
            return Ok(self.clone());
        }
        let mut next = self.clone();
        next.history.push(entry);
        Ok(next)
    }

    pub fn with_current(&self, node_id: impl Into<String>) -> Result<Self> {
        self.ensure_open()?;
        let mut next = self.clone();
        next.current_node = node_id.into();
        Ok(next)
    }

    pub fn with_retries(&self, node_id: &str, retries: u32) -> Result<Self> {
        self.ensure_open()?;
        let mut next = self.clone();
        if retries == 0 {
            next.retries.remove(node_id);
        } else {
            next.retries.insert(node_id.to_string(), retries);
        }
        Ok(next)
    }

    pub fn with_status(&self, status: RunStatus) -> Result<Self> {
        if !self.status.can_transition_to(status) {
            return Err(VoyageError::InvalidState {
                run_id: self.run_id.clone(),
                status: self.status,
            });
        }
        let mut next = self.clone();
        next.status = status;
        Ok(next)
    }

    /// Move to `Failed` and record why.
    pub fn with_failure(&self, error: ErrorInfo) -> Result<Self> {
        let mut next = self.with_status(RunStatus::Failed)?;
        next.error = Some(error);
        Ok(next)
    }

    /// Stamp the snapshot for persistence: bump the revision and `updated_at`.
    pub fn committed(&self) -> Self {
        let mut next = self.clone();
        next.revision += 1;
        next.updated_at = Utc::now();
        next
    }
}
