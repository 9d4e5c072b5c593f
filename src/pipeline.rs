//! Linear pipeline execution: an ordered list of stages, each a typed call
//! into a plugin, sharing a `{global, task, parameters, env, outputs}`
//! context through placeholder resolution.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::config::{FailPolicy, ParamMap, PipelineStageConfig};
use crate::error::ConfigError;
use crate::plugins::PluginRegistry;
use crate::resolver::Resolver;

/// Result of a single pipeline stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub name: String,
    pub failed: bool,
    pub skipped: bool,
    pub percentage: Option<f64>,
    /// Elapsed wall time in seconds.
    pub elapsed: Option<f64>,
    pub output: String,
}

impl StageResult {
    fn skipped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failed: false,
            skipped: true,
            percentage: None,
            elapsed: None,
            output: String::new(),
        }
    }

    /// Sentinel stored under `register_output` keys at validation time, so
    /// forward references resolve before anything has run.
    fn sentinel(name: &str) -> Self {
        Self {
            percentage: Some(1.0),
            ..Self::skipped(name)
        }
    }
}

impl fmt::Display for StageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stage '{}': failed={}, skipped={}, percentage={:.2}",
            self.name,
            u8::from(self.failed),
            u8::from(self.skipped),
            self.percentage.unwrap_or(1.0),
        )
    }
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub failed: bool,
    pub stage_results: Vec<StageResult>,
}

impl PipelineResult {
    pub fn ok(&self) -> bool {
        !self.failed
    }
}

impl fmt::Display for PipelineResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pipeline: failed={}", u8::from(self.failed))?;
        for result in &self.stage_results {
            writeln!(f, "  {result}")?;
        }
        Ok(())
    }
}

/// The shared context placeholder expressions are evaluated against. The
/// shape is fixed so expressions can be checked statically at validate time.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    root: Value,
}

impl PipelineContext {
    pub fn new<G: Serialize, T: Serialize>(
        global: &G,
        task: Option<&T>,
        parameters: &ParamMap,
    ) -> Self {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        let root = serde_json::json!({
            "global": serde_json::to_value(global).expect("global variables serialize"),
            "task": task
                .map(|t| serde_json::to_value(t).expect("task variables serialize"))
                .unwrap_or(Value::Null),
            "parameters": parameters,
            "env": env,
            "outputs": {},
        });
        Self { root }
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// The current `outputs` map (cloned), used to seed per-task contexts
    /// from the global pipeline's outputs.
    pub fn outputs(&self) -> serde_json::Map<String, Value> {
        self.root["outputs"]
            .as_object()
            .cloned()
            .unwrap_or_default()
    }

    pub fn seed_outputs(&mut self, outputs: serde_json::Map<String, Value>) {
        self.root["outputs"] = Value::Object(outputs);
    }

    fn register_output(&mut self, key: &str, result: &StageResult) {
        self.root["outputs"][key] =
            serde_json::to_value(result).expect("stage result serializes");
    }
}

/// Executes an ordered list of stages, carrying the shared context through
/// them and honouring each stage's `run_if` gate and fail policy.
pub struct PipelineRunner {
    stages: Vec<PipelineStageConfig>,
    plugins: Arc<PluginRegistry>,
    resolver: Resolver,
    verbose: bool,
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("stages", &self.stages)
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

impl PipelineRunner {
    /// Plugin existence is checked immediately; placeholders are checked
    /// later via [`validate`](Self::validate) once a context exists.
    pub fn new(
        stages: Vec<PipelineStageConfig>,
        plugins: Arc<PluginRegistry>,
        verbose: bool,
    ) -> Result<Self, ConfigError> {
        for stage in &stages {
            if plugins.get(&stage.run).is_none() {
                return Err(ConfigError::UnknownPlugin {
                    plugin: stage.run.clone(),
                    stage: stage.name.clone(),
                });
            }
        }
        Ok(Self {
            stages,
            plugins,
            resolver: Resolver::new(),
            verbose,
        })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Verify every stage's plugin exists, resolved args type-check against
    /// the plugin's schema and `run_if` resolves to a boolean. Registers
    /// sentinel outputs so forward `register_output` references resolve.
    pub fn validate(
        &self,
        context: &mut PipelineContext,
        check_placeholders: bool,
    ) -> Result<(), ConfigError> {
        for stage in &self.stages {
            let plugin = self.plugins.get(&stage.run).ok_or_else(|| {
                ConfigError::UnknownPlugin {
                    plugin: stage.run.clone(),
                    stage: stage.name.clone(),
                }
            })?;

            if check_placeholders {
                let args = self.resolve_args(stage, context)?;
                plugin
                    .validate_args(&args)
                    .map_err(|reason| ConfigError::BadPluginArgs {
                        plugin: stage.run.clone(),
                        stage: stage.name.clone(),
                        reason,
                    })?;
                self.resolve_run_if(stage, context)?;
            }

            if let Some(key) = &stage.register_output {
                context.register_output(key, &StageResult::sentinel(&stage.name));
            }
        }
        Ok(())
    }

    /// Walk the stages in order. Skipped stages (either behind a failed
    /// `fail: fast` stage or gated off by `run_if`) still produce results,
    /// and `register_output` stores the result whether the stage succeeded,
    /// failed or was skipped.
    pub async fn run(
        &self,
        context: &mut PipelineContext,
        dry_run: bool,
    ) -> Result<PipelineResult, ConfigError> {
        let mut stage_results: Vec<StageResult> = Vec::with_capacity(self.stages.len());
        let mut pipeline_failed = false;
        let mut skip_the_rest = false;

        for stage in &self.stages {
            tracing::info!(stage = %stage.name, plugin = %stage.run, "running stage");

            if skip_the_rest {
                tracing::info!(stage = %stage.name, "skipped (earlier stage failed)");
                let result = StageResult::skipped(&stage.name);
                if let Some(key) = &stage.register_output {
                    context.register_output(key, &result);
                }
                stage_results.push(result);
                continue;
            }

            if let Some(run_if) = self.resolve_run_if(stage, context)? {
                if !run_if {
                    tracing::info!(stage = %stage.name, "skipped (run_if=false)");
                    let result = StageResult::skipped(&stage.name);
                    if let Some(key) = &stage.register_output {
                        context.register_output(key, &result);
                    }
                    stage_results.push(result);
                    continue;
                }
            }

            let args = self.resolve_args(stage, context)?;
            if self.verbose {
                tracing::debug!(stage = %stage.name, ?args, "resolved stage arguments");
            }

            if dry_run {
                tracing::info!(stage = %stage.name, "dry run");
                let result = StageResult {
                    name: stage.name.clone(),
                    failed: false,
                    skipped: false,
                    percentage: Some(1.0),
                    elapsed: None,
                    output: String::new(),
                };
                if let Some(key) = &stage.register_output {
                    context.register_output(key, &result);
                }
                stage_results.push(result);
                continue;
            }

            let plugin = self.plugins.get(&stage.run).ok_or_else(|| {
                ConfigError::UnknownPlugin {
                    plugin: stage.run.clone(),
                    stage: stage.name.clone(),
                }
            })?;

            let started = Instant::now();
            let result = match plugin.run(args, self.verbose).await {
                Ok(output) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    tracing::info!(stage = %stage.name, elapsed, "ok");
                    if !output.output.is_empty() {
                        tracing::info!("{}", output.output);
                    }
                    StageResult {
                        name: stage.name.clone(),
                        failed: false,
                        skipped: false,
                        percentage: Some(output.percentage),
                        elapsed: Some(elapsed),
                        output: output.output,
                    }
                }
                Err(failure) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    if !failure.output.is_empty() {
                        tracing::info!("{}", failure.output);
                    }
                    match stage.fail {
                        FailPolicy::Fast => {
                            tracing::error!(stage = %stage.name, "{failure} (fail=fast)");
                            skip_the_rest = true;
                            pipeline_failed = true;
                        }
                        FailPolicy::AfterAll => {
                            tracing::error!(stage = %stage.name, "{failure} (fail=after_all)");
                            pipeline_failed = true;
                        }
                        FailPolicy::Never => {
                            tracing::error!(stage = %stage.name, "{failure} (fail=never, ignored)");
                        }
                    }
                    StageResult {
                        name: stage.name.clone(),
                        failed: true,
                        skipped: false,
                        percentage: Some(failure.percentage),
                        elapsed: Some(elapsed),
                        output: failure.output,
                    }
                }
            };

            if let Some(key) = &stage.register_output {
                context.register_output(key, &result);
            }
            stage_results.push(result);
        }

        Ok(PipelineResult {
            failed: pipeline_failed,
            stage_results,
        })
    }

    fn resolve_args(
        &self,
        stage: &PipelineStageConfig,
        context: &PipelineContext,
    ) -> Result<Value, ConfigError> {
        let raw = serde_json::to_value(&stage.args).expect("stage args serialize");
        self.resolver.resolve(&raw, context.as_value())
    }

    /// `None` when the stage has no `run_if`.
    fn resolve_run_if(
        &self,
        stage: &PipelineStageConfig,
        context: &PipelineContext,
    ) -> Result<Option<bool>, ConfigError> {
        let Some(run_if) = &stage.run_if else {
            return Ok(None);
        };
        let resolved = self.resolver.resolve(run_if, context.as_value())?;
        match resolved {
            Value::Bool(value) => Ok(Some(value)),
            other => Err(ConfigError::BadRunIf {
                stage: stage.name.clone(),
                got: other.to_string(),
            }),
        }
    }
}
