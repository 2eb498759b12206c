//! Workflow engine: typed steps composed into linear and branching stages.
//!
//! A `WorkflowBuilder` collects stages (`then` for a single step, `branch`
//! for predicate-guarded arms) and `commit`s them into an immutable
//! `Workflow`, checking the schema chain on the way. Each `run` validates
//! its input, walks the stages in order, and validates the final output.
//!
//! Branch reduction: every predicate is evaluated. No match is
//! `NoBranchMatched`; one match passes that arm's output on unchanged;
//! several matches run concurrently and produce an object keyed by step id.

pub mod branch;
pub mod builder;
pub mod context;
pub mod executor;
pub mod step;

pub use branch::{field_gt, field_le, field_lt, number_field, when, BranchArm, Predicate};
pub use builder::{Workflow, WorkflowBuilder};
pub use context::RunContext;
pub use executor::{ExecutionResult, RunOptions, StepRecord};
pub use step::{execute_step, StepDefinition, StepHandler};
