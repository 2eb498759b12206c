use std::future::Future;
use std::time::Instant;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::schema::Schema;

use super::context::RunContext;

/// The body of a step. Implemented for any async closure
/// `Fn(Value, RunContext) -> Future<Output = Result<Value>>`.
pub trait StepHandler: Send + Sync + 'static {
    fn call(&self, input: Value, ctx: RunContext) -> BoxFuture<'static, Result<Value>>;
}

impl<F, Fut> StepHandler for F
where
    F: Fn(Value, RunContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn call(&self, input: Value, ctx: RunContext) -> BoxFuture<'static, Result<Value>> {
        Box::pin(self(input, ctx))
    }
}

/// A named unit of work with declared input and output shapes.
pub struct StepDefinition {
    pub id: String,
    pub description: String,
    pub input_schema: Schema,
    pub output_schema: Schema,
    handler: Box<dyn StepHandler>,
}

impl StepDefinition {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        input_schema: Schema,
        output_schema: Schema,
        handler: impl StepHandler,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            input_schema,
            output_schema,
            handler: Box::new(handler),
        }
    }

    /// Like [`StepDefinition::new`], but the handler works on serde types
    /// instead of raw JSON.
    pub fn typed<I, O, F, Fut>(
        id: impl Into<String>,
        description: impl Into<String>,
        input_schema: Schema,
        output_schema: Schema,
        f: F,
    ) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I, RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let handler = move |input: Value, ctx: RunContext| {
            let call = serde_json::from_value::<I>(input).map(|typed| f(typed, ctx));
            async move {
                let output = call?.await?;
                Ok::<Value, TrellisError>(serde_json::to_value(output)?)
            }
        };
        Self::new(id, description, input_schema, output_schema, handler)
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Run one step: validate input, call the handler (abandoning it if the
/// run is cancelled), validate output.
///
/// The handler is never called when the input is rejected.
pub async fn execute_step(step: &StepDefinition, input: Value, ctx: &RunContext) -> Result<Value> {
    step.input_schema
        .validate(&input)
        .map_err(|issues| TrellisError::schema(format!("step '{}' input", step.id), issues))?;

    if ctx.is_cancelled() {
        return Err(TrellisError::Cancelled);
    }

    let start = Instant::now();
    let cancel = ctx.cancel_token().clone();
    let call = step.handler.call(input, ctx.clone());
    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(step_id = %step.id, run_id = %ctx.run_id(), "Step abandoned on cancellation");
            return Err(TrellisError::Cancelled);
        }
        result = call => result?,
    };

    step.output_schema
        .validate(&output)
        .map_err(|issues| TrellisError::schema(format!("step '{}' output", step.id), issues))?;

    debug!(
        step_id = %step.id,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Step executed"
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde::Deserialize;
    use serde_json::json;
    use trellis_core::schema::FieldType;

    use super::*;

    fn counted_echo(calls: Arc<AtomicUsize>) -> StepDefinition {
        StepDefinition::new(
            "echo",
            "returns its input",
            Schema::object().field("city", FieldType::String),
            Schema::object().field("city", FieldType::String),
            move |input: Value, _ctx: RunContext| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, TrellisError>(input) }
            },
        )
    }

    #[tokio::test]
    async fn test_valid_input_passes_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = counted_echo(calls.clone());
        let ctx = RunContext::new("wf");
        for city in ["Paris", "Lagos", "Osaka"] {
            let input = json!({"city": city, "extra": 1});
            let output = execute_step(&step, input.clone(), &ctx).await.unwrap();
            assert_eq!(output, input);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalid_input_never_calls_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = counted_echo(calls.clone());
        let ctx = RunContext::new("wf");
        for bad in [json!({}), json!({"city": 3}), json!("Paris"), json!({"city": null})] {
            let err = execute_step(&step, bad, &ctx).await.unwrap_err();
            match err {
                TrellisError::SchemaValidation { target, issues } => {
                    assert_eq!(target, "step 'echo' input");
                    assert!(!issues.is_empty());
                }
                other => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bad_output_is_schema_error() {
        let step = StepDefinition::new(
            "broken",
            "",
            Schema::object(),
            Schema::object().field("activities", FieldType::String),
            |_input: Value, _ctx: RunContext| async { Ok::<_, TrellisError>(json!({"activities": 5})) },
        );
        let err = execute_step(&step, json!({}), &RunContext::new("wf")).await.unwrap_err();
        match err {
            TrellisError::SchemaValidation { target, issues } => {
                assert_eq!(target, "step 'broken' output");
                assert_eq!(issues[0].path, "activities");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_handler_error_propagates_unchanged() {
        let step = StepDefinition::new(
            "fails",
            "",
            Schema::object(),
            Schema::object(),
            |_input: Value, _ctx: RunContext| async {
                Err::<Value, _>(TrellisError::Collaborator("geocoding down".into()))
            },
        );
        let err = execute_step(&step, json!({}), &RunContext::new("wf")).await.unwrap_err();
        assert!(matches!(err, TrellisError::Collaborator(msg) if msg == "geocoding down"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_abandons_handler() {
        let step = StepDefinition::new(
            "slow",
            "",
            Schema::object(),
            Schema::object(),
            |_input: Value, _ctx: RunContext| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, TrellisError>(json!({}))
            },
        );
        let ctx = RunContext::new("wf");
        let token = ctx.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let err = execute_step(&step, json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, TrellisError::Cancelled));
    }

    #[derive(Deserialize)]
    struct Greeting {
        name: String,
    }

    #[derive(Serialize)]
    struct Reply {
        message: String,
    }

    #[tokio::test]
    async fn test_typed_step() {
        let step = StepDefinition::typed(
            "greet",
            "",
            Schema::object().field("name", FieldType::String),
            Schema::object().field("message", FieldType::String),
            |input: Greeting, _ctx: RunContext| async move {
                Ok::<_, TrellisError>(Reply {
                    message: format!("hello {}", input.name),
                })
            },
        );
        let out = execute_step(&step, json!({"name": "Ada"}), &RunContext::new("wf"))
            .await
            .unwrap();
        assert_eq!(out, json!({"message": "hello Ada"}));
    }
}
