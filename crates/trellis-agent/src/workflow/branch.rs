use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use trellis_core::error::{FieldIssue, Result, TrellisError};

use super::step::StepDefinition;

/// A guard over the current data. An `Err` aborts the run rather than
/// skipping the arm.
pub type Predicate = Arc<dyn Fn(&Value) -> Result<bool> + Send + Sync>;

/// One guarded arm of a branch stage.
#[derive(Clone)]
pub struct BranchArm {
    pub predicate: Predicate,
    pub step: Arc<StepDefinition>,
}

impl std::fmt::Debug for BranchArm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchArm").field("step", &self.step.id).finish()
    }
}

/// Wrap a closure as a [`Predicate`].
pub fn when<F>(f: F) -> Predicate
where
    F: Fn(&Value) -> Result<bool> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Read a numeric field, failing when it is missing or not a number.
pub fn number_field(data: &Value, field: &str) -> Result<f64> {
    data.get(field).and_then(Value::as_f64).ok_or_else(|| {
        TrellisError::schema(
            "branch predicate",
            vec![FieldIssue::new(field, "expected a number")],
        )
    })
}

/// `data[field] > threshold`
pub fn field_gt(field: &str, threshold: f64) -> Predicate {
    let field = field.to_string();
    when(move |data| Ok(number_field(data, &field)? > threshold))
}

/// `data[field] <= threshold`
pub fn field_le(field: &str, threshold: f64) -> Predicate {
    let field = field.to_string();
    when(move |data| Ok(number_field(data, &field)? <= threshold))
}

/// `data[field] < threshold`
pub fn field_lt(field: &str, threshold: f64) -> Predicate {
    let field = field.to_string();
    when(move |data| Ok(number_field(data, &field)? < threshold))
}

/// Evaluate every arm's predicate in registration order and return the
/// arms that matched. Evaluation never short-circuits.
pub(crate) fn matching_arms<'a>(arms: &'a [BranchArm], data: &Value) -> Result<Vec<&'a BranchArm>> {
    let mut matched = Vec::new();
    for arm in arms {
        let hit = (arm.predicate)(data)?;
        debug!(step_id = %arm.step.id, matched = hit, "Branch predicate evaluated");
        if hit {
            matched.push(arm);
        }
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use trellis_core::schema::Schema;

    use super::*;
    use crate::workflow::context::RunContext;

    fn arm(id: &str, predicate: Predicate) -> BranchArm {
        BranchArm {
            predicate,
            step: Arc::new(StepDefinition::new(
                id,
                "",
                Schema::object(),
                Schema::object(),
                |input: Value, _ctx: RunContext| async move { Ok::<_, TrellisError>(input) },
            )),
        }
    }

    fn ids(arms: &[&BranchArm]) -> Vec<String> {
        arms.iter().map(|a| a.step.id.clone()).collect()
    }

    #[test]
    fn test_threshold_boundary() {
        let arms = vec![
            arm("indoor", field_gt("precipitationChance", 50.0)),
            arm("outdoor", field_le("precipitationChance", 50.0)),
        ];
        for (p, expected) in [(30, "outdoor"), (50, "outdoor"), (51, "indoor"), (70, "indoor")] {
            let matched = matching_arms(&arms, &json!({"precipitationChance": p})).unwrap();
            assert_eq!(ids(&matched), vec![expected], "precipitation {}", p);
        }
    }

    #[test]
    fn test_all_predicates_evaluated() {
        let evaluated = Arc::new(AtomicUsize::new(0));
        let counter = |result: bool| {
            let evaluated = evaluated.clone();
            when(move |_| {
                evaluated.fetch_add(1, Ordering::SeqCst);
                Ok(result)
            })
        };
        let arms = vec![arm("a", counter(true)), arm("b", counter(true)), arm("c", counter(false))];
        let matched = matching_arms(&arms, &json!({})).unwrap();
        assert_eq!(ids(&matched), vec!["a", "b"]);
        assert_eq!(evaluated.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_missing_field_is_an_error() {
        let arms = vec![arm("a", field_lt("p", 0.0))];
        let err = matching_arms(&arms, &json!({"q": 1})).unwrap_err();
        assert!(matches!(err, TrellisError::SchemaValidation { .. }));
    }
}
