//! JSON schema emission for the three configuration shapes, used by editor
//! integrations to validate course configs.

use std::path::Path;

use schemars::schema_for;

use crate::config::{CheckerConfig, ManytaskConfig, SubConfig};
use crate::error::GraderError;

pub fn write_schemas(output_folder: &Path) -> Result<(), GraderError> {
    std::fs::create_dir_all(output_folder)?;
    let schemas = [
        ("schema-checker.json", serde_json::to_value(schema_for!(CheckerConfig))),
        ("schema-manytask.json", serde_json::to_value(schema_for!(ManytaskConfig))),
        ("schema-task.json", serde_json::to_value(schema_for!(SubConfig))),
    ];
    for (name, schema) in schemas {
        let schema = schema.map_err(|e| anyhow::anyhow!("schema serialization failed: {e}"))?;
        let pretty = serde_json::to_string_pretty(&schema)
            .map_err(|e| anyhow::anyhow!("schema serialization failed: {e}"))?;
        let path = output_folder.join(name);
        std::fs::write(&path, pretty)?;
        tracing::info!(path = %path.display(), "wrote schema");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_schemas_are_written_and_valid_json() {
        let dir = TempDir::new().unwrap();
        write_schemas(dir.path()).unwrap();
        for name in ["schema-checker.json", "schema-manytask.json", "schema-task.json"] {
            let content = std::fs::read_to_string(dir.path().join(name)).unwrap();
            let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
            assert!(parsed.get("$schema").is_some() || parsed.get("title").is_some());
        }
    }

    #[test]
    fn test_checker_schema_mentions_pipelines() {
        let dir = TempDir::new().unwrap();
        write_schemas(dir.path()).unwrap();
        let content = std::fs::read_to_string(dir.path().join("schema-checker.json")).unwrap();
        assert!(content.contains("tasks_pipeline"));
        assert!(content.contains("register_output"));
    }
}
