//! Evaluation metrics scored after an agent generates.
//!
//! Metrics never gate a generation: the agent records whatever scores it
//! gets and logs the failures.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use trellis_core::config::ModelConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::LlmClient;
use trellis_core::types::ChatMessage;

use crate::output::{complete, extract_json};

/// Raw result of one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub score: f64,
    pub reason: Option<String>,
}

/// A measurement labelled with the name it was attached under.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricScore {
    pub metric: String,
    pub score: f64,
    pub reason: Option<String>,
}

/// Scores an (input, output) pair.
pub trait Metric: Send + Sync + 'static {
    fn measure<'a>(&'a self, input: &'a str, output: &'a str) -> BoxFuture<'a, Result<Measurement>>;
}

// ── ToneConsistencyMetric ───────────────────────────────────────

const POSITIVE: &[&str] = &[
    "good", "great", "excellent", "happy", "pleasant", "enjoy", "wonderful", "love", "best",
    "beautiful", "nice", "amazing", "fantastic", "sunny", "delightful", "perfect", "fun",
    "glad", "positive", "success", "helpful", "ideal", "warm", "bright",
];

const NEGATIVE: &[&str] = &[
    "bad", "poor", "terrible", "sad", "unpleasant", "hate", "awful", "worst", "ugly",
    "horrible", "dreadful", "gloomy", "angry", "negative", "failure", "problem", "risk",
    "dangerous", "cold", "wet", "miserable", "boring", "unfortunately", "storm",
];

/// Lexicon sentiment in [-1, 1]; 0 when no sentiment words appear.
fn sentiment(text: &str) -> f64 {
    let mut pos = 0i32;
    let mut neg = 0i32;
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
    {
        if POSITIVE.contains(&word.as_str()) {
            pos += 1;
        } else if NEGATIVE.contains(&word.as_str()) {
            neg += 1;
        }
    }
    let total = pos + neg;
    if total == 0 {
        0.0
    } else {
        f64::from(pos - neg) / f64::from(total)
    }
}

/// Compares the sentiment of output and input. With an empty input it
/// scores how stable the sentiment is across the output's sentences.
#[derive(Debug, Default, Clone, Copy)]
pub struct ToneConsistencyMetric;

impl ToneConsistencyMetric {
    pub fn new() -> Self {
        Self
    }

    pub fn score(&self, input: &str, output: &str) -> Measurement {
        if input.trim().is_empty() {
            let sentences: Vec<f64> = output
                .split(['.', '!', '?'])
                .filter(|s| !s.trim().is_empty())
                .map(sentiment)
                .collect();
            if sentences.is_empty() {
                return Measurement {
                    score: 1.0,
                    reason: Some("no sentences to compare".into()),
                };
            }
            let n = sentences.len() as f64;
            let mean = sentences.iter().sum::<f64>() / n;
            let variance = sentences.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
            Measurement {
                score: (1.0 - variance).max(0.0),
                reason: Some(format!("sentiment variance {:.3} across {} sentences", variance, n)),
            }
        } else {
            let (si, so) = (sentiment(input), sentiment(output));
            let diff = (si - so).abs();
            Measurement {
                score: (1.0 - diff).max(0.0),
                reason: Some(format!("input sentiment {:.2}, output sentiment {:.2}", si, so)),
            }
        }
    }
}

impl Metric for ToneConsistencyMetric {
    fn measure<'a>(&'a self, input: &'a str, output: &'a str) -> BoxFuture<'a, Result<Measurement>> {
        Box::pin(async move { Ok(self.score(input, output)) })
    }
}

// ── AnswerRelevancyMetric ───────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Verdicts {
    #[serde(default)]
    verdicts: Vec<Verdict>,
}

#[derive(Debug, Deserialize)]
struct Verdict {
    verdict: String,
    #[serde(default)]
    reason: Option<String>,
}

/// LLM-as-judge: splits the output into statements and asks a model
/// whether each one addresses the input.
pub struct AnswerRelevancyMetric {
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
    uncertainty_weight: f64,
    scale: f64,
}

impl AnswerRelevancyMetric {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig) -> Self {
        Self {
            llm,
            config,
            uncertainty_weight: 0.3,
            scale: 1.0,
        }
    }

    /// Credit given to an "unsure" verdict (0.0 to 1.0).
    pub fn with_uncertainty_weight(mut self, weight: f64) -> Self {
        self.uncertainty_weight = weight.clamp(0.0, 1.0);
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    fn prompt(input: &str, output: &str) -> String {
        format!(
            r#"You are judging whether an answer is relevant to a question.

Question:
{}

Answer:
{}

Split the answer into individual statements. For each statement decide whether it is
relevant to the question: "yes", "no", or "unsure". Respond with ONLY valid JSON in this format:
{{
  "verdicts": [{{"verdict": "yes", "reason": "brief explanation"}}]
}}"#,
            input, output
        )
    }

    fn score_verdicts(&self, verdicts: &[Verdict]) -> Measurement {
        if verdicts.is_empty() {
            return Measurement {
                score: self.scale,
                reason: Some("no statements to judge".into()),
            };
        }
        let mut credit = 0.0;
        for v in verdicts {
            match v.verdict.trim().to_lowercase().as_str() {
                "yes" => credit += 1.0,
                "unsure" => credit += self.uncertainty_weight,
                _ => {}
            }
        }
        let irrelevant: Vec<&str> = verdicts
            .iter()
            .filter(|v| v.verdict.trim().eq_ignore_ascii_case("no"))
            .filter_map(|v| v.reason.as_deref())
            .collect();
        Measurement {
            score: credit / verdicts.len() as f64 * self.scale,
            reason: if irrelevant.is_empty() {
                None
            } else {
                Some(irrelevant.join("; "))
            },
        }
    }
}

impl Metric for AnswerRelevancyMetric {
    fn measure<'a>(&'a self, input: &'a str, output: &'a str) -> BoxFuture<'a, Result<Measurement>> {
        Box::pin(async move {
            debug!("Running answer relevancy judge");
            let verdicts = judge(self.llm.as_ref(), &self.config, Self::prompt(input, output)).await?;
            Ok(self.score_verdicts(&verdicts))
        })
    }
}

/// Ask the judge model for `{"verdicts": [...]}`.
async fn judge(llm: &dyn LlmClient, config: &ModelConfig, prompt: String) -> Result<Vec<Verdict>> {
    let text = complete(llm, config, vec![ChatMessage::user(prompt)]).await?;
    let value = extract_json(&text).map_err(TrellisError::Generation)?;
    let parsed: Verdicts = serde_json::from_value(value)?;
    Ok(parsed.verdicts)
}

fn is_yes(verdict: &Verdict) -> bool {
    verdict.verdict.trim().eq_ignore_ascii_case("yes")
}

// ── SummarizationMetric ─────────────────────────────────────────

/// LLM-as-judge for summaries. Alignment asks whether each claim of the
/// summary is backed by the original; coverage asks whether the summary
/// answers the key questions the original raises. The score is the lower
/// of the two, times `scale`.
pub struct SummarizationMetric {
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
    scale: f64,
}

impl SummarizationMetric {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig) -> Self {
        Self {
            llm,
            config,
            scale: 1.0,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    fn alignment_prompt(original: &str, summary: &str) -> String {
        format!(
            r#"You are checking a summary against its original text.

Original:
{}

Summary:
{}

Split the summary into individual claims. For each claim decide whether the original
supports it: "yes", "no" (contradicted), or "unsure" (not mentioned). Respond with ONLY valid JSON:
{{
  "verdicts": [{{"verdict": "yes", "reason": "brief explanation"}}]
}}"#,
            original, summary
        )
    }

    fn coverage_prompt(original: &str, summary: &str) -> String {
        format!(
            r#"You are checking whether a summary covers the key information of its original text.

Original:
{}

Summary:
{}

Write the few closed questions a reader of the original should be able to answer. For each,
decide whether the summary alone answers it: "yes" or "no". Respond with ONLY valid JSON:
{{
  "verdicts": [{{"verdict": "yes", "reason": "the question and a brief explanation"}}]
}}"#,
            original, summary
        )
    }

    /// Share of "yes" verdicts; an empty list counts as fully satisfied.
    fn ratio(verdicts: &[Verdict]) -> f64 {
        if verdicts.is_empty() {
            return 1.0;
        }
        verdicts.iter().filter(|v| is_yes(v)).count() as f64 / verdicts.len() as f64
    }

    fn score_verdicts(&self, alignment: &[Verdict], coverage: &[Verdict]) -> Measurement {
        let (a, c) = (Self::ratio(alignment), Self::ratio(coverage));
        let misses: Vec<&str> = alignment
            .iter()
            .chain(coverage)
            .filter(|v| !is_yes(v))
            .filter_map(|v| v.reason.as_deref())
            .collect();
        let mut reason = format!("alignment {:.2}, coverage {:.2}", a, c);
        if !misses.is_empty() {
            reason.push_str(": ");
            reason.push_str(&misses.join("; "));
        }
        Measurement {
            score: a.min(c) * self.scale,
            reason: Some(reason),
        }
    }
}

impl Metric for SummarizationMetric {
    fn measure<'a>(&'a self, input: &'a str, output: &'a str) -> BoxFuture<'a, Result<Measurement>> {
        Box::pin(async move {
            debug!("Running summarization judge");
            let llm = self.llm.as_ref();
            let alignment = judge(llm, &self.config, Self::alignment_prompt(input, output)).await?;
            let coverage = judge(llm, &self.config, Self::coverage_prompt(input, output)).await?;
            Ok(self.score_verdicts(&alignment, &coverage))
        })
    }
}
