//! Workflow graph model and structural validation.
//!
//! A workflow is an ordered list of `Node`s connected by `Edge`s plus a
//! variable mapping that seeds the run context. Node kinds form a closed
//! tagged union so the engine's dispatch is exhaustive at compile time.
//! The validator performs static analysis over a definition without
//! executing anything.

pub mod edge;
pub mod node;
pub mod validate;
pub mod workflow;

pub use edge::Edge;
pub use node::{
    DatabaseConfig, DbOperation, FailurePolicy, LoopBody, LoopConfig, LoopMode, Node, NodeKind,
    Position, TaskBody,
};
pub use validate::{validate, Finding, Severity};
pub use workflow::Workflow;
