use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use voyage_core::context::ExecutionContext;
use voyage_core::error::CapabilityError;
use voyage_core::traits::{AgentCapability, AgentInput};
use voyage_core::types::ErrorKind;

use super::outcome::{Outcome, SlotWrite};
use crate::backoff::RetryPolicy;

/// Where an outcome category leads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    /// Continue at another node.
    Goto { node: String },
    /// End the run successfully.
    Complete,
    /// End the run as failed.
    Fail,
}

impl Transition {
    pub fn goto(node: impl Into<String>) -> Self {
        Self::Goto { node: node.into() }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Goto { .. })
    }
}

/// Static description of a graph node.
///
/// The transition table maps outcome categories reported by the node to the
/// next step. The runner only ever advances along `Goto` targets listed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique identifier for this node.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Payload slot this node owns.
    #[serde(default)]
    pub slot: Option<String>,
    /// Outcome category -> transition.
    #[serde(default)]
    pub transitions: BTreeMap<String, Transition>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            slot: None,
            transitions: BTreeMap::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Set the payload slot this node writes.
    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = Some(slot.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Declare a transition for an outcome category.
    pub fn on(mut self, category: impl Into<String>, transition: Transition) -> Self {
        self.transitions.insert(category.into(), transition);
        self
    }

    pub fn goto(self, category: impl Into<String>, node: impl Into<String>) -> Self {
        self.on(category, Transition::goto(node))
    }

    pub fn complete_on(self, category: impl Into<String>) -> Self {
        self.on(category, Transition::Complete)
    }

    pub fn fail_on(self, category: impl Into<String>) -> Self {
        self.on(category, Transition::Fail)
    }

    /// Node ids this node may advance to.
    pub fn successors(&self) -> impl Iterator<Item = &str> {
        self.transitions.values().filter_map(|t| match t {
            Transition::Goto { node } => Some(node.as_str()),
            _ => None,
        })
    }

    pub fn has_terminal(&self) -> bool {
        self.transitions.values().any(Transition::is_terminal)
    }

    /// Map a category to its outcome. Unknown categories are wiring bugs.
    pub fn resolve(
        &self,
        category: &str,
        slot_value: Option<serde_json::Value>,
        reason: Option<String>,
    ) -> Outcome {
        let slot = match (&self.slot, slot_value) {
            (Some(name), Some(value)) => Some(SlotWrite::new(name.clone(), value)),
            _ => None,
        };
        match self.transitions.get(category) {
            Some(Transition::Goto { node }) => Outcome::Advance {
                next: node.clone(),
                slot,
            },
            Some(Transition::Complete) => Outcome::complete(slot),
            Some(Transition::Fail) => Outcome::fail(
                ErrorKind::Rejected,
                reason.unwrap_or_else(|| format!("{} ended with '{}'", self.id, category)),
            ),
            None => Outcome::fail(
                ErrorKind::InvalidTransition,
                format!("node '{}' declares no transition for outcome '{}'", self.id, category),
            ),
        }
    }
}

/// A single step of a workflow graph.
///
/// Wiring bugs surface in two ways. A node that reports an outcome category
/// missing from its own table (see [`NodeSpec::resolve`]) ends the run as a
/// failed context with `InvalidTransition`, returned as `Ok`. Outcomes the
/// runner itself refuses, an `Advance` to an undeclared successor or a write
/// to a slot the spec does not declare, also fail and persist the run, but the
/// runner returns the error to the caller.
pub trait Node: Send + Sync + 'static {
    fn spec(&self) -> &NodeSpec;

    /// Run the step against a snapshot. Must not have effects outside the
    /// returned outcome; the runner commits it.
    fn execute<'a>(&'a self, ctx: &'a ExecutionContext) -> BoxFuture<'a, Outcome>;

    fn id(&self) -> &str {
        &self.spec().id
    }
}

/// Routing decision for a capability result.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// Outcome category looked up in the node's transition table.
    pub category: String,
    /// Value for the node's slot. Defaults to the whole result.
    pub value: Option<serde_json::Value>,
    /// Explanation used when the category leads to `Fail`.
    pub reason: Option<String>,
    /// Set when the slot value could not be produced; the result is treated
    /// as invalid and retried.
    pub invalid: Option<String>,
}

impl Route {
    pub fn to(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            value: None,
            reason: None,
            invalid: None,
        }
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Serialize `value` into the slot value.
    pub fn with_serialized<T: Serialize>(mut self, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => self.value = Some(v),
            Err(e) => self.invalid = Some(e.to_string()),
        }
        self
    }

    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

type Router<O> = Box<dyn Fn(&O) -> Route + Send + Sync>;

/// Node that invokes one agent capability and routes on its typed result.
pub struct AgentNode<C: AgentCapability> {
    spec: NodeSpec,
    capability: Arc<C>,
    prompt: String,
    input_slots: Vec<String>,
    router: Router<C::Output>,
}

impl<C: AgentCapability> AgentNode<C> {
    pub fn new(
        spec: NodeSpec,
        capability: Arc<C>,
        router: impl Fn(&C::Output) -> Route + Send + Sync + 'static,
    ) -> Self {
        Self {
            spec,
            capability,
            prompt: String::from("Complete the task."),
            input_slots: vec![],
            router: Box::new(router),
        }
    }

    /// Set the task prompt.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Payload slots quoted in the prompt.
    pub fn with_inputs(mut self, slots: Vec<String>) -> Self {
        self.input_slots = slots;
        self
    }

    /// Build the prompt for this node by injecting payload data.
    pub fn build_prompt(&self, payload: &BTreeMap<String, serde_json::Value>) -> String {
        let mut prompt = String::new();

        if !self.input_slots.is_empty() {
            prompt.push_str("## Booking Data\n\n");
            for key in &self.input_slots {
                if let Some(value) = payload.get(key) {
                    let display = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    prompt.push_str(&format!("**{}**: {}\n", key, display));
                }
            }
            prompt.push_str("\n---\n\n");
        }

        prompt.push_str(&self.prompt);
        prompt
    }

    async fn run(&self, ctx: &ExecutionContext) -> Outcome {
        let payload = ctx.payload();
        let prompt = self.build_prompt(&payload);
        let input = AgentInput::new(prompt)
            .with_request(ctx.input().clone())
            .with_payload(payload);

        let timeout_secs = self.capability.timeout_secs();
        let result = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.capability.invoke(input),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(CapabilityError::Timeout(timeout_secs)),
        };

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    node_id = %self.spec.id,
                    capability = %self.capability.name(),
                    error = %e,
                    "Capability failed"
                );
                return Outcome::from_capability_error(&e);
            }
        };

        if let Err(reason) = self.capability.validate(&output) {
            return Outcome::from_capability_error(&CapabilityError::InvalidResult(reason));
        }

        let route = (self.router)(&output);
        if let Some(reason) = route.invalid {
            return Outcome::from_capability_error(&CapabilityError::InvalidResult(reason));
        }
        let value = match route.value {
            Some(v) => v,
            None => match serde_json::to_value(&output) {
                Ok(v) => v,
                Err(e) => {
                    return Outcome::from_capability_error(&CapabilityError::InvalidResult(
                        e.to_string(),
                    ))
                }
            },
        };

        debug!(
            node_id = %self.spec.id,
            category = %route.category,
            "Capability result routed"
        );
        self.spec.resolve(&route.category, Some(value), route.reason)
    }
}

impl<C: AgentCapability> Node for AgentNode<C> {
    fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    fn execute<'a>(&'a self, ctx: &'a ExecutionContext) -> BoxFuture<'a, Outcome> {
        Box::pin(self.run(ctx))
    }
}
