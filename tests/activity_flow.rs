use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;

use trellis_agent::{
    AgentInput, FnAgent, GenerateOptions, Generation, KeywordRouter, Network, RunOptions,
};
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{EventBus, WorkflowEvent};
use trellis_core::traits::MemoryStore;
use trellis_core::types::SessionId;
use trellis_flows::activity::{activity_planning_builder, PLANNING_AGENT_ID};
use trellis_flows::weather::{Forecast, ForecastSource};
use trellis_memory::InMemoryStore;

struct FixedForecast(f64);

impl ForecastSource for FixedForecast {
    fn forecast<'a>(&'a self, city: &'a str) -> BoxFuture<'a, Result<Forecast>> {
        Box::pin(async move {
            Ok(Forecast {
                date: "2024-06-01T09:00:00Z".into(),
                max_temp: 24.0,
                min_temp: 15.5,
                precipitation_chance: self.0,
                condition: "Overcast".into(),
                location: city.to_string(),
            })
        })
    }
}

fn planner() -> Arc<FnAgent> {
    Arc::new(FnAgent::new(
        PLANNING_AGENT_ID,
        "plans activities",
        |input: AgentInput, _o: GenerateOptions| async move {
            let text = if input.as_text().contains("indoor") {
                "museum, cinema"
            } else {
                "hiking, picnic"
            };
            Ok(Generation::text(text))
        },
    ))
}

#[tokio::test]
async fn test_rainy_day_publishes_indoor_run_events() {
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let workflow = activity_planning_builder(Arc::new(FixedForecast(80.0)), planner())
        .with_events(bus.clone())
        .commit()
        .unwrap();

    let output = workflow.run(json!({"city": "Bergen"})).await.unwrap();
    assert_eq!(output, json!({"activities": "museum, cinema"}));

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(WorkflowEvent::RunStarted { .. })));
    assert!(matches!(seen.last(), Some(WorkflowEvent::RunCompleted { .. })));
    let matched: Vec<String> = seen
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::BranchEvaluated { matched, .. } => Some(matched.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(matched, vec!["plan-indoor-activities".to_string()]);
}

#[tokio::test]
async fn test_cancelled_token_aborts_plan() {
    let workflow = activity_planning_builder(Arc::new(FixedForecast(10.0)), planner())
        .commit()
        .unwrap();
    let cancel = tokio_util::sync::CancellationToken::new();
    cancel.cancel();
    let err = workflow
        .run_with(
            json!({"city": "Bergen"}),
            RunOptions {
                thread_id: None,
                cancel: Some(cancel),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TrellisError::Cancelled));
}

#[tokio::test]
async fn test_network_fills_city_from_task_and_remembers() {
    let workflow = Arc::new(
        activity_planning_builder(Arc::new(FixedForecast(20.0)), planner())
            .commit()
            .unwrap(),
    );
    let store = Arc::new(InMemoryStore::new());
    let router = KeywordRouter::new().with_keywords("activity-planning-workflow", &["weekend"]);
    let network = Network::new("planner-net", "Planner", "Plan things", Arc::new(router))
        .workflow(workflow)
        .with_memory(store.clone());

    let thread = SessionId::from_str("weekend");
    let answer = network
        .route_in_thread(&thread, "Oslo", &Default::default())
        .await;
    // "Oslo" shares nothing with any description or keyword.
    assert!(matches!(answer, Err(TrellisError::NoRouteFound(_))));

    let answer = network
        .route_in_thread(&thread, "weekend", &Default::default())
        .await
        .unwrap();
    assert_eq!(answer, "hiking, picnic");

    let history = store.load_history(&thread, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].text(), "weekend");
    assert_eq!(history[1].text(), "hiking, picnic");
}
