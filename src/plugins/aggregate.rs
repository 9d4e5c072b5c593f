//! The `aggregate` plugin: combines per-sub-task percentages into one score.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{FailureCause, PluginFailure};

use super::{parse_args, parse_run_args, Plugin, PluginOutput};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Strategy {
    #[default]
    Mean,
    Sum,
    Min,
    Max,
    Product,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Args {
    scores: Vec<f64>,
    #[serde(default)]
    weights: Option<Vec<f64>>,
    #[serde(default)]
    strategy: Strategy,
}

pub struct AggregatePlugin;

#[async_trait]
impl Plugin for AggregatePlugin {
    fn name(&self) -> &'static str {
        "aggregate"
    }

    fn validate_args(&self, args: &Value) -> Result<(), String> {
        parse_args::<Args>(args).map(|_| ())
    }

    async fn run(&self, args: Value, _verbose: bool) -> Result<PluginOutput, PluginFailure> {
        let args: Args = parse_run_args(&args)?;
        let weights = args
            .weights
            .clone()
            .unwrap_or_else(|| vec![1.0; args.scores.len()]);

        if args.scores.is_empty() {
            let message = "scores must not be empty".to_string();
            return Err(
                PluginFailure::new(FailureCause::BadInput, message.clone()).with_output(message)
            );
        }
        if args.scores.len() != weights.len() {
            let message = format!(
                "length of scores ({}) and weights ({}) does not match",
                args.scores.len(),
                weights.len()
            );
            return Err(
                PluginFailure::new(FailureCause::BadInput, message.clone()).with_output(message)
            );
        }

        let weighted: Vec<f64> = args
            .scores
            .iter()
            .zip(&weights)
            .map(|(score, weight)| score * weight)
            .collect();

        let score = match args.strategy {
            Strategy::Mean => weighted.iter().sum::<f64>() / weighted.len() as f64,
            Strategy::Sum => weighted.iter().sum(),
            Strategy::Min => weighted.iter().copied().fold(f64::INFINITY, f64::min),
            Strategy::Max => weighted.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Strategy::Product => weighted.iter().product(),
        };

        Ok(PluginOutput::new(format!(
            "scores: {:?}\nweights: {:?}\naggregated with {:?}: {score:.2}",
            args.scores, weights, args.strategy
        ))
        .with_percentage(score))
    }
}
