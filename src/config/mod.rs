//! YAML configuration documents: the course-local `.checker.yml`, the
//! course-wide `.manytask.yml` and the per-task/per-group marker files.

mod checker;
mod manytask;

pub use checker::{
    ChangesDetection, CheckerConfig, ExportConfig, FailPolicy, ParamMap, PipelineStageConfig,
    StructureConfig, SubConfig, TemplateMode, TestingConfig, CHECKER_CONFIG_NAME,
    GROUP_CONFIG_NAME, SUPPORTED_VERSION, TASK_CONFIG_NAME,
};
pub use manytask::{
    DeadlineBound, DeadlinesConfig, DeadlinesPolicy, GroupConfig, ManytaskConfig, SettingsConfig,
    Steps, TaskConfig, UiConfig, MANYTASK_CONFIG_NAME,
};

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::ConfigError;

pub(crate) fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}
