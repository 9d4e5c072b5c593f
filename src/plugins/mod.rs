//! Typed plugins executed by the pipeline runner.
//!
//! Every plugin declares its argument schema by deserializing a typed `Args`
//! struct and implements a single `run` operation. The runner never touches a
//! plugin's internals except through this interface. Plugins are looked up in
//! an explicit registry keyed by name; third-party plugins register during
//! startup.

pub mod aggregate;
pub mod copy_files;
pub mod regex_check;
pub mod report;
pub mod sandbox;
pub mod script;
pub mod test_runner;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{FailureCause, PluginFailure};

/// What a successful plugin invocation produced.
#[derive(Debug, Clone)]
pub struct PluginOutput {
    pub output: String,
    pub percentage: f64,
}

impl PluginOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            percentage: 1.0,
        }
    }

    pub fn with_percentage(mut self, percentage: f64) -> Self {
        self.percentage = percentage;
        self
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    /// Registry key for this plugin.
    fn name(&self) -> &'static str;

    /// Check resolved arguments against the plugin's schema without running.
    fn validate_args(&self, args: &Value) -> Result<(), String>;

    async fn run(&self, args: Value, verbose: bool) -> Result<PluginOutput, PluginFailure>;
}

pub(crate) fn parse_args<T: DeserializeOwned>(args: &Value) -> Result<T, String> {
    serde_json::from_value(args.clone()).map_err(|e| e.to_string())
}

pub(crate) fn parse_run_args<T: DeserializeOwned>(args: &Value) -> Result<T, PluginFailure> {
    parse_args(args).map_err(|reason| {
        PluginFailure::new(FailureCause::BadInput, format!("invalid arguments: {reason}"))
    })
}

/// Explicit plugin registry keyed by plugin name.
#[derive(Clone)]
pub struct PluginRegistry {
    plugins: HashMap<&'static str, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn empty() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Registry with every plugin shipped in this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(script::RunScriptPlugin));
        registry.register(Arc::new(sandbox::SafeRunScriptPlugin));
        registry.register(Arc::new(regex_check::CheckRegexpsPlugin));
        registry.register(Arc::new(copy_files::CopyFilesPlugin));
        registry.register(Arc::new(aggregate::AggregatePlugin));
        registry.register(Arc::new(test_runner::RunPytestPlugin));
        registry.register(Arc::new(report::ReportScorePlugin::new()));
        registry
    }

    /// Later registrations win, so callers can shadow a builtin.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.name(), plugin);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.plugins.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
