//! Course-local checker configuration (`.checker.yml`) and the per-task /
//! per-group override files (`.task.yml`, `.group.yml`).

use std::collections::BTreeMap;
use std::path::Path;

use schemars::JsonSchema;
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

pub const CHECKER_CONFIG_NAME: &str = ".checker.yml";
pub const TASK_CONFIG_NAME: &str = ".task.yml";
pub const GROUP_CONFIG_NAME: &str = ".group.yml";

pub const SUPPORTED_VERSION: u32 = 1;

/// Free-form parameter map merged into the pipeline context. Values may be
/// any YAML scalar, list or mapping; string values may carry `${{ }}` regions.
pub type ParamMap = BTreeMap<String, serde_json::Value>;

/// Per-directory structural rules. Each field is inherited independently:
/// a sub-config only overrides the fields it sets.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StructureConfig {
    pub ignore_patterns: Option<Vec<String>>,
    pub private_patterns: Option<Vec<String>>,
    pub public_patterns: Option<Vec<String>>,
}

impl StructureConfig {
    /// Apply `sub` on top of `self`, field by field.
    pub fn overridden_by(&self, sub: &StructureConfig) -> StructureConfig {
        StructureConfig {
            ignore_patterns: sub
                .ignore_patterns
                .clone()
                .or_else(|| self.ignore_patterns.clone()),
            private_patterns: sub
                .private_patterns
                .clone()
                .or_else(|| self.private_patterns.clone()),
            public_patterns: sub
                .public_patterns
                .clone()
                .or_else(|| self.public_patterns.clone()),
        }
    }
}

/// How solutions are cut out of the reference tree during export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TemplateMode {
    /// `X.template` files/folders replace their sibling `X`; an empty
    /// template deletes `X` from the public view.
    #[default]
    Search,
    /// `SOLUTION BEGIN` / `SOLUTION END` marker pairs are replaced with a
    /// placeholder comment.
    Create,
    /// Either mechanism, but not both within one task.
    SearchOrCreate,
}

impl TemplateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateMode::Search => "search",
            TemplateMode::Create => "create",
            TemplateMode::SearchOrCreate => "search_or_create",
        }
    }
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_commit_message() -> String {
    "chore(auto): export new tasks".to_string()
}

/// Export settings: where the public view is pushed and how templates are
/// resolved.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExportConfig {
    pub destination: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
    #[serde(default)]
    pub templates: TemplateMode,
    #[serde(default)]
    pub service_username: Option<String>,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub service_token: Option<SecretString>,
}

impl ExportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.destination.starts_with("http://") && !self.destination.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "export destination must be an http(s) url, got '{}'",
                self.destination
            )));
        }
        Ok(())
    }
}

/// What happens to the rest of the pipeline when a stage fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Mark the pipeline failed and skip every remaining stage.
    #[default]
    Fast,
    /// Mark the pipeline failed but keep executing remaining stages.
    AfterAll,
    /// Ignore the failure entirely.
    Never,
}

/// One stage of a pipeline: a named plugin invocation with templated args,
/// an optional `run_if` gate and a failure policy.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PipelineStageConfig {
    pub name: String,
    /// Plugin name, looked up in the registry.
    pub run: String,
    #[serde(default)]
    pub args: BTreeMap<String, serde_json::Value>,
    /// Boolean or `${{ }}` template; the stage is skipped when it resolves
    /// to false.
    #[serde(default)]
    pub run_if: Option<serde_json::Value>,
    #[serde(default)]
    pub fail: FailPolicy,
    /// Store this stage's result in the context under the given key.
    #[serde(default)]
    pub register_output: Option<String>,
}

/// How changed tasks are discovered when grading a student repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChangesDetection {
    BranchName,
    CommitMessage,
    #[default]
    LastCommitChanges,
    FilesChanged,
}

/// Testing settings: change detection and the three pipelines.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TestingConfig {
    #[serde(default)]
    pub changes_detection: ChangesDetection,
    /// Require exact name equality when matching branch names and commit
    /// messages instead of substring containment.
    #[serde(default)]
    pub exact_changes_match: bool,
    /// Accepted for compatibility; plugins are registered explicitly at
    /// startup, not discovered by walking directories.
    #[serde(default)]
    pub search_plugins: Vec<String>,
    #[serde(default)]
    pub global_pipeline: Vec<PipelineStageConfig>,
    #[serde(default)]
    pub tasks_pipeline: Vec<PipelineStageConfig>,
    #[serde(default)]
    pub report_pipeline: Vec<PipelineStageConfig>,
}

/// Top-level `.checker.yml` document.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CheckerConfig {
    pub version: u32,
    #[serde(default)]
    pub default_parameters: ParamMap,
    pub structure: StructureConfig,
    pub export: ExportConfig,
    pub testing: TestingConfig,
}

impl CheckerConfig {
    pub fn from_yaml(path: &Path) -> Result<Self, ConfigError> {
        let config: CheckerConfig = super::load_yaml(path)?;
        if config.version != SUPPORTED_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: config.version,
            });
        }
        config.export.validate()?;
        Ok(config)
    }
}

fn default_version() -> u32 {
    SUPPORTED_VERSION
}

/// Per-task / per-group override file. An empty marker file is valid and
/// means "all defaults".
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SubConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub structure: Option<StructureConfig>,
    #[serde(default)]
    pub parameters: Option<ParamMap>,
    #[serde(default)]
    pub task_pipeline: Option<Vec<PipelineStageConfig>>,
    #[serde(default)]
    pub report_pipeline: Option<Vec<PipelineStageConfig>>,
}

impl Default for SubConfig {
    fn default() -> Self {
        Self {
            version: SUPPORTED_VERSION,
            structure: None,
            parameters: None,
            task_pipeline: None,
            report_pipeline: None,
        }
    }
}

impl SubConfig {
    /// Load a marker file; empty content yields the default config.
    pub fn from_yaml(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: SubConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })?;
        if config.version != SUPPORTED_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: config.version,
            });
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_checker_config_minimal() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            ".checker.yml",
            r#"
version: 1
structure:
  ignore_patterns: ["*.pyc"]
  private_patterns: [".*", "test_private*"]
  public_patterns: ["README.md"]
export:
  destination: https://gitlab.example.com/course/public
testing:
  changes_detection: branch_name
  tasks_pipeline:
    - name: run tests
      run: run_script
      args:
        origin: "${{ global.temp_dir }}"
        script: echo ok
"#,
        );
        let config = CheckerConfig::from_yaml(&path).unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.export.default_branch, "main");
        assert_eq!(config.export.templates, TemplateMode::Search);
        assert_eq!(config.testing.changes_detection, ChangesDetection::BranchName);
        assert_eq!(config.testing.tasks_pipeline.len(), 1);
        assert_eq!(config.testing.tasks_pipeline[0].fail, FailPolicy::Fast);
    }

    #[test]
    fn test_checker_config_rejects_unknown_version() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            ".checker.yml",
            "version: 2\nstructure: {}\nexport:\n  destination: https://x\ntesting: {}\n",
        );
        let err = CheckerConfig::from_yaml(&path).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion { found: 2 }));
    }

    #[test]
    fn test_export_destination_must_be_http() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            ".checker.yml",
            "version: 1\nstructure: {}\nexport:\n  destination: git@host:repo\ntesting: {}\n",
        );
        assert!(CheckerConfig::from_yaml(&path).is_err());
    }

    #[test]
    fn test_empty_sub_config_is_default() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, ".task.yml", "  \n");
        let config = SubConfig::from_yaml(&path).unwrap();
        assert_eq!(config.version, 1);
        assert!(config.structure.is_none());
        assert!(config.parameters.is_none());
    }

    #[test]
    fn test_structure_override_is_per_field() {
        let base = StructureConfig {
            ignore_patterns: Some(vec!["*.o".into()]),
            private_patterns: Some(vec![".*".into()]),
            public_patterns: None,
        };
        let sub = StructureConfig {
            ignore_patterns: None,
            private_patterns: Some(vec!["secret*".into()]),
            public_patterns: Some(vec!["README.md".into()]),
        };
        let merged = base.overridden_by(&sub);
        assert_eq!(merged.ignore_patterns, Some(vec!["*.o".to_string()]));
        assert_eq!(merged.private_patterns, Some(vec!["secret*".to_string()]));
        assert_eq!(merged.public_patterns, Some(vec!["README.md".to_string()]));
    }
}
