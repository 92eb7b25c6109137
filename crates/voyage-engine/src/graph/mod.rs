//! Workflow graphs: explicit, validated transition tables.
//!
//! A workflow is a set of [`Node`]s plus one entry node. Each node reports an
//! [`Outcome`]; where an `Advance` may lead is declared up front in the
//! node's [`NodeSpec`], and the [`WorkflowGraph`] checks the whole table when
//! it is built. Execution lives in [`crate::runner`].

pub mod node;
pub mod outcome;
pub mod workflow;

pub use node::{AgentNode, Node, NodeSpec, Route, Transition};
pub use outcome::{NodeFailure, Outcome, SlotWrite};
pub use workflow::WorkflowGraph;
