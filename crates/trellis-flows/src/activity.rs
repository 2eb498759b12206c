//! Weather-driven activity planning: fetch a forecast, then plan indoor
//! activities when rain is likely (chance above 50) or outdoor ones otherwise.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use trellis_agent::{
    field_gt, field_le, Agent, AgentInput, GenerateOptions, LlmAgent, RunContext, StepDefinition,
    WorkflowBuilder,
};
use trellis_core::config::ModelConfig;
use trellis_core::error::Result;
use trellis_core::schema::{FieldType, Schema};
use trellis_core::traits::LlmClient;
use trellis_core::types::ChatMessage;

use crate::weather::{Forecast, ForecastSource};

pub const WORKFLOW_ID: &str = "activity-planning-workflow";
pub const PLANNING_AGENT_ID: &str = "planning-agent";

/// Rain chance (percent) above which only indoor activities are planned.
pub const RAIN_THRESHOLD: f64 = 50.0;

pub const PLANNING_INSTRUCTIONS: &str = "You are a local activities and travel expert who excels at weather-based planning. \
Analyze the weather data and provide practical activity recommendations. \
For each day, list a few activities suited to the conditions with a short reason for each, \
note any weather-specific considerations, and keep the plan concise and easy to follow.";

#[derive(Debug, Deserialize)]
struct CityInput {
    city: String,
}

#[derive(Debug, Serialize)]
struct Activities {
    activities: String,
}

pub fn city_schema() -> Schema {
    Schema::object()
        .field("city", FieldType::String)
        .describe("city", "The city to get the weather for")
}

pub fn forecast_schema() -> Schema {
    Schema::object()
        .field("date", FieldType::String)
        .field("maxTemp", FieldType::Number)
        .field("minTemp", FieldType::Number)
        .field("precipitationChance", FieldType::Number)
        .field("condition", FieldType::String)
        .field("location", FieldType::String)
}

pub fn activities_schema() -> Schema {
    Schema::object().field("activities", FieldType::String)
}

pub fn planning_agent(llm: Arc<dyn LlmClient>, model: ModelConfig) -> LlmAgent {
    LlmAgent::new(PLANNING_AGENT_ID, PLANNING_INSTRUCTIONS, llm, model)
        .with_description("Suggests activities that suit a weather forecast")
}

pub fn fetch_weather_step(source: Arc<dyn ForecastSource>) -> StepDefinition {
    StepDefinition::typed(
        "fetch-weather",
        "Fetches weather forecast for a given city",
        city_schema(),
        forecast_schema(),
        move |input: CityInput, _ctx: RunContext| {
            let source = source.clone();
            async move { source.forecast(&input.city).await }
        },
    )
}

async fn ask_planner(ctx: &RunContext, prompt: String) -> Result<Activities> {
    let agent = ctx.agent(PLANNING_AGENT_ID)?;
    let options = GenerateOptions::default().in_thread(ctx.thread_id().clone());
    let generation = agent
        .generate(AgentInput::Messages(vec![ChatMessage::user(prompt)]), options)
        .await?;
    Ok(Activities {
        activities: generation.text,
    })
}

pub fn plan_activities_step() -> StepDefinition {
    StepDefinition::typed(
        "plan-activities",
        "Suggests activities based on weather conditions",
        forecast_schema(),
        activities_schema(),
        |forecast: Forecast, ctx: RunContext| async move {
            let pretty = serde_json::to_string_pretty(&forecast)?;
            let prompt = format!(
                "Based on the following weather forecast for {}, suggest appropriate activities:\n{}\n",
                forecast.location, pretty
            );
            ask_planner(&ctx, prompt).await
        },
    )
}

pub fn plan_indoor_activities_step() -> StepDefinition {
    StepDefinition::typed(
        "plan-indoor-activities",
        "Suggests indoor activities based on weather conditions",
        forecast_schema(),
        activities_schema(),
        |forecast: Forecast, ctx: RunContext| async move {
            let prompt = format!(
                "In case it rains, plan indoor activities for {} on {}",
                forecast.location, forecast.date
            );
            ask_planner(&ctx, prompt).await
        },
    )
}

/// The uncommitted workflow, so callers can attach memory or events.
pub fn activity_planning_builder(
    source: Arc<dyn ForecastSource>,
    planner: Arc<dyn Agent>,
) -> WorkflowBuilder {
    WorkflowBuilder::new(
        WORKFLOW_ID,
        "Plans activities based on weather conditions",
        city_schema(),
        activities_schema(),
    )
    .then(fetch_weather_step(source))
    .branch(vec![
        (field_gt("precipitationChance", RAIN_THRESHOLD), plan_indoor_activities_step()),
        (field_le("precipitationChance", RAIN_THRESHOLD), plan_activities_step()),
    ])
    .with_agent(planner)
}
