//! The `copy_files` plugin: copies files matching glob patterns from a
//! source tree into a destination, honouring ignore patterns.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{FailureCause, PluginFailure};

use super::{parse_args, parse_run_args, Plugin, PluginOutput};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Args {
    source_dir: PathBuf,
    target_dir: PathBuf,
    patterns: Vec<String>,
    #[serde(default)]
    ignore_patterns: Vec<String>,
}

pub struct CopyFilesPlugin;

#[async_trait]
impl Plugin for CopyFilesPlugin {
    fn name(&self) -> &'static str {
        "copy_files"
    }

    fn validate_args(&self, args: &Value) -> Result<(), String> {
        let args: Args = parse_args(args)?;
        build_glob_set(&args.patterns).map_err(|e| e.message)?;
        build_glob_set(&args.ignore_patterns).map_err(|e| e.message)?;
        Ok(())
    }

    async fn run(&self, args: Value, verbose: bool) -> Result<PluginOutput, PluginFailure> {
        let args: Args = parse_run_args(&args)?;
        let include = build_glob_set(&args.patterns)?;
        let ignore = build_glob_set(&args.ignore_patterns)?;

        let copied = tokio::task::spawn_blocking(move || {
            copy_tree(&args.source_dir, &args.target_dir, &include, &ignore, verbose)
        })
        .await
        .map_err(|e| PluginFailure::new(FailureCause::Io, format!("copy task failed: {e}")))??;

        Ok(PluginOutput::new(format!("copied {copied} files")))
    }
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet, PluginFailure> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            PluginFailure::new(FailureCause::BadInput, format!("bad glob '{pattern}': {e}"))
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| {
        PluginFailure::new(FailureCause::BadInput, format!("bad glob set: {e}"))
    })
}

fn copy_tree(
    source: &Path,
    target: &Path,
    include: &GlobSet,
    ignore: &GlobSet,
    verbose: bool,
) -> Result<usize, PluginFailure> {
    let mut copied = 0;
    for entry in walkdir::WalkDir::new(source)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        let relative = match entry.path().strip_prefix(source) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        // a file is eligible when it, or a directory above it, matches
        let matched = relative
            .ancestors()
            .any(|prefix| !prefix.as_os_str().is_empty() && include.is_match(prefix));
        let ignored = relative
            .ancestors()
            .any(|prefix| !prefix.as_os_str().is_empty() && ignore.is_match(prefix));
        if !matched || ignored {
            continue;
        }

        let destination = target.join(relative);
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PluginFailure::new(
                    FailureCause::Io,
                    format!("cannot create {}: {e}", parent.display()),
                )
            })?;
        }
        if verbose {
            tracing::debug!(from = %entry.path().display(), to = %destination.display(), "copy");
        }
        std::fs::copy(entry.path(), &destination).map_err(|e| {
            PluginFailure::new(
                FailureCause::Io,
                format!("cannot copy {}: {e}", entry.path().display()),
            )
        })?;
        copied += 1;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(root: &Path, name: &str, content: &str) {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_copies_matching_files() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        write_file(source.path(), "keep.py", "print()");
        write_file(source.path(), "skip.txt", "notes");
        write_file(source.path(), "sub/keep_too.py", "print()");

        let result = CopyFilesPlugin
            .run(
                serde_json::json!({
                    "source_dir": source.path(),
                    "target_dir": target.path(),
                    "patterns": ["*.py", "sub"],
                }),
                false,
            )
            .await
            .unwrap();

        assert_eq!(result.output, "copied 2 files");
        assert!(target.path().join("keep.py").exists());
        assert!(target.path().join("sub/keep_too.py").exists());
        assert!(!target.path().join("skip.txt").exists());
    }

    #[tokio::test]
    async fn test_ignore_patterns_win() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        write_file(source.path(), "a.py", "");
        write_file(source.path(), "a_test.py", "");

        CopyFilesPlugin
            .run(
                serde_json::json!({
                    "source_dir": source.path(),
                    "target_dir": target.path(),
                    "patterns": ["*.py"],
                    "ignore_patterns": ["*_test.py"],
                }),
                false,
            )
            .await
            .unwrap();

        assert!(target.path().join("a.py").exists());
        assert!(!target.path().join("a_test.py").exists());
    }
}
