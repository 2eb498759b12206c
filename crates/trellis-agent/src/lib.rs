pub mod agent;
pub mod metrics;
pub mod network;
pub mod output;
pub mod workflow;

pub use agent::{Agent, AgentInput, FnAgent, GenerateOptions, Generation, LlmAgent};
pub use metrics::{
    AnswerRelevancyMetric, Measurement, Metric, MetricScore, SummarizationMetric,
    ToneConsistencyMetric,
};
pub use network::{
    KeywordRouter, LlmRouter, Network, RoutableTarget, RouteCandidate, RouteDecision, RouteRequest,
    Router, TargetKind,
};
pub use workflow::{
    execute_step, field_gt, field_le, field_lt, number_field, when, BranchArm, ExecutionResult,
    Predicate, RunContext, RunOptions, StepDefinition, StepHandler, StepRecord, Workflow,
    WorkflowBuilder,
};
