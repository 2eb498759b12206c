use std::time::Instant;

use futures::future::try_join_all;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use trellis_core::error::{Result, TrellisError};
use trellis_core::event::WorkflowEvent;
use trellis_core::types::SessionId;

use super::branch::matching_arms;
use super::builder::{Stage, Workflow};
use super::context::RunContext;
use super::step::{execute_step, StepDefinition};

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Thread used for memory scoping. A fresh one is generated when absent.
    pub thread_id: Option<SessionId>,
    /// Cancelling this token aborts the run with `Cancelled`.
    pub cancel: Option<CancellationToken>,
}

/// Timing for one executed step.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step_id: String,
    pub elapsed_ms: u64,
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: String,
    /// The validated workflow output.
    pub output: Value,
    /// Executed steps in completion order.
    pub steps: Vec<StepRecord>,
    pub total_elapsed_ms: u64,
}

impl Workflow {
    /// Run with a fresh thread and no external cancellation.
    pub async fn run(&self, input: Value) -> Result<Value> {
        self.run_with(input, RunOptions::default()).await
    }

    pub async fn run_with(&self, input: Value, options: RunOptions) -> Result<Value> {
        Ok(self.execute(input, options).await?.output)
    }

    /// Run and return the output with per-step timings.
    pub async fn execute(&self, input: Value, options: RunOptions) -> Result<ExecutionResult> {
        let ctx = self.context(options);
        let start = Instant::now();

        info!(workflow_id = %self.id, run_id = %ctx.run_id(), thread_id = %ctx.thread_id(), "Workflow run started");
        ctx.publish(WorkflowEvent::RunStarted {
            workflow_id: self.id.clone(),
            run_id: ctx.run_id().to_string(),
        });

        match self.drive(input, &ctx).await {
            Ok((output, steps)) => {
                let total_elapsed_ms = start.elapsed().as_millis() as u64;
                info!(
                    workflow_id = %self.id,
                    run_id = %ctx.run_id(),
                    steps = steps.len(),
                    elapsed_ms = total_elapsed_ms,
                    "Workflow run completed"
                );
                ctx.publish(WorkflowEvent::RunCompleted {
                    workflow_id: self.id.clone(),
                    run_id: ctx.run_id().to_string(),
                    elapsed_ms: total_elapsed_ms,
                });
                Ok(ExecutionResult {
                    run_id: ctx.run_id().to_string(),
                    output,
                    steps,
                    total_elapsed_ms,
                })
            }
            Err(e) => {
                warn!(workflow_id = %self.id, run_id = %ctx.run_id(), error = %e, "Workflow run failed");
                ctx.publish(WorkflowEvent::RunFailed {
                    workflow_id: self.id.clone(),
                    run_id: ctx.run_id().to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn context(&self, options: RunOptions) -> RunContext {
        let mut ctx = RunContext::new(self.id.clone()).with_agents(self.agents.clone());
        if let Some(thread) = options.thread_id {
            ctx = ctx.with_thread(thread);
        }
        if let Some(cancel) = options.cancel {
            ctx = ctx.with_cancel(cancel);
        }
        if let Some(memory) = &self.memory {
            ctx = ctx.with_memory(memory.clone());
        }
        if let Some(events) = &self.events {
            ctx = ctx.with_events(events.clone());
        }
        ctx
    }

    async fn drive(&self, input: Value, ctx: &RunContext) -> Result<(Value, Vec<StepRecord>)> {
        self.input_schema
            .validate(&input)
            .map_err(|issues| TrellisError::schema(format!("workflow '{}' input", self.id), issues))?;

        let mut data = input;
        let mut records = Vec::new();
        let last = self.stages.len().saturating_sub(1);

        for (index, stage) in self.stages.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(TrellisError::Cancelled);
            }
            match stage {
                Stage::Step(step) => {
                    let (output, record) = run_step(step, data, ctx).await?;
                    records.push(record);
                    data = output;
                }
                Stage::Branch(arms) => {
                    let matched = matching_arms(arms, &data)?;
                    ctx.publish(WorkflowEvent::BranchEvaluated {
                        run_id: ctx.run_id().to_string(),
                        stage: index,
                        matched: matched.iter().map(|a| a.step.id.clone()).collect(),
                    });

                    match matched.as_slice() {
                        [] => {
                            return Err(TrellisError::NoBranchMatched {
                                workflow: self.id.clone(),
                                stage: index,
                            })
                        }
                        [arm] => {
                            let (output, record) = run_step(&arm.step, data, ctx).await?;
                            records.push(record);
                            data = output;
                        }
                        arms => {
                            let input = &data;
                            let outputs = try_join_all(
                                arms.iter().map(|arm| run_step(&arm.step, input.clone(), ctx)),
                            )
                            .await?;

                            let mut fan_out = Map::new();
                            for (arm, (output, record)) in arms.iter().zip(outputs) {
                                if index == last {
                                    self.validate_output(&output)?;
                                }
                                records.push(record);
                                fan_out.insert(arm.step.id.clone(), output);
                            }
                            if index == last {
                                return Ok((Value::Object(fan_out), records));
                            }
                            data = Value::Object(fan_out);
                        }
                    }
                }
            }
        }

        self.validate_output(&data)?;
        Ok((data, records))
    }

    fn validate_output(&self, output: &Value) -> Result<()> {
        self.output_schema
            .validate(output)
            .map_err(|issues| TrellisError::schema(format!("workflow '{}' output", self.id), issues))
    }
}

async fn run_step(step: &StepDefinition, input: Value, ctx: &RunContext) -> Result<(Value, StepRecord)> {
    ctx.publish(WorkflowEvent::StepStarted {
        run_id: ctx.run_id().to_string(),
        step_id: step.id.clone(),
    });
    let start = Instant::now();
    let output = execute_step(step, input, ctx).await?;
    let elapsed_ms = start.elapsed().as_millis() as u64;
    info!(workflow_id = %ctx.workflow_id(), step_id = %step.id, elapsed_ms, "Step completed");
    ctx.publish(WorkflowEvent::StepCompleted {
        run_id: ctx.run_id().to_string(),
        step_id: step.id.clone(),
        elapsed_ms,
    });
    Ok((
        output,
        StepRecord {
            step_id: step.id.clone(),
            elapsed_ms,
        },
    ))
}
