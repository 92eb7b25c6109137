use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::ExecutionContext;
use crate::error::{CapabilityError, Result};
use crate::types::RunId;

/// Structured input handed to an agent capability.
#[derive(Debug, Clone, Default)]
pub struct AgentInput {
    /// Task prompt for the agent.
    pub prompt: String,
    /// The request the run was submitted with.
    pub request: serde_json::Value,
    /// Committed payload slots visible to the node.
    pub payload: BTreeMap<String, serde_json::Value>,
}

impl AgentInput {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_request(mut self, request: serde_json::Value) -> Self {
        self.request = request;
        self
    }

    pub fn with_payload(mut self, payload: BTreeMap<String, serde_json::Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Decode the submitted request.
    pub fn request_as<T: DeserializeOwned>(&self) -> std::result::Result<T, CapabilityError> {
        serde_json::from_value(self.request.clone())
            .map_err(|e| CapabilityError::fatal(format!("malformed request: {}", e)))
    }

    /// Decode a committed slot. A missing slot means the graph is wired wrong.
    pub fn slot_as<T: DeserializeOwned>(
        &self,
        slot: &str,
    ) -> std::result::Result<T, CapabilityError> {
        let value = self
            .payload
            .get(slot)
            .ok_or_else(|| CapabilityError::fatal(format!("missing payload slot '{}'", slot)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| CapabilityError::fatal(format!("malformed slot '{}': {}", slot, e)))
    }
}

/// Agent capability: an opaque task performer with a typed result.
pub trait AgentCapability: Send + Sync + 'static {
    /// Result schema produced by this capability.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Capability name (used in logs).
    fn name(&self) -> &str;

    /// Perform the task.
    fn invoke(
        &self,
        input: AgentInput,
    ) -> BoxFuture<'_, std::result::Result<Self::Output, CapabilityError>>;

    /// Check a decoded result before the node accepts it.
    fn validate(&self, output: &Self::Output) -> std::result::Result<(), String> {
        let _ = output;
        Ok(())
    }

    /// Timeout in seconds for one invocation.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Context store: durable home of execution contexts, keyed by run id.
pub trait ContextStore: Send + Sync + 'static {
    /// Load the latest snapshot of a run. Fails with `NotFound` for unknown ids.
    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<ExecutionContext>>;

    /// Persist a snapshot atomically.
    ///
    /// The stored revision must be exactly `ctx.revision() - 1` (or absent
    /// for revision 1); otherwise the write is rejected with
    /// `PersistenceConflict`.
    fn save(&self, ctx: &ExecutionContext) -> BoxFuture<'_, Result<()>>;

    /// All stored runs, newest first.
    fn list(&self) -> BoxFuture<'_, Result<Vec<ExecutionContext>>>;
}
