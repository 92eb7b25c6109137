//! Execution engine for Voyage workflows.
//!
//! A [`WorkflowGraph`] declares the nodes and their allowed transitions, a
//! [`GraphRunner`] drives runs over it one committed step at a time, and a
//! [`ContextStore`](voyage_core::traits::ContextStore) keeps every step
//! durable so interrupted runs can be resumed.

pub mod backoff;
pub mod graph;
pub mod run_log;
pub mod runner;
pub mod store;

pub use backoff::RetryPolicy;
pub use graph::{
    AgentNode, Node, NodeFailure, NodeSpec, Outcome, Route, SlotWrite, Transition, WorkflowGraph,
};
pub use run_log::RunLogger;
pub use runner::{GraphRunner, RunReport, Step};
pub use store::{MemoryStore, SqliteStore};
