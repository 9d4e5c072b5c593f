//! The `check_regexps` plugin: fails the stage when any file matching the
//! glob set contains a forbidden regular expression.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{FailureCause, PluginFailure};

use super::{parse_args, parse_run_args, Plugin, PluginOutput};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Args {
    origin: PathBuf,
    patterns: Vec<String>,
    regexps: Vec<String>,
}

pub struct CheckRegexpsPlugin;

#[async_trait]
impl Plugin for CheckRegexpsPlugin {
    fn name(&self) -> &'static str {
        "check_regexps"
    }

    fn validate_args(&self, args: &Value) -> Result<(), String> {
        let args: Args = parse_args(args)?;
        build_glob_set(&args.patterns).map_err(|e| e.message)?;
        compile_regexps(&args.regexps).map_err(|e| e.message)?;
        Ok(())
    }

    async fn run(&self, args: Value, _verbose: bool) -> Result<PluginOutput, PluginFailure> {
        let args: Args = parse_run_args(&args)?;
        if !args.origin.exists() {
            return Err(PluginFailure::new(
                FailureCause::BadInput,
                format!("origin '{}' does not exist", args.origin.display()),
            ));
        }

        let globs = build_glob_set(&args.patterns)?;
        let regexps = compile_regexps(&args.regexps)?;

        tokio::task::spawn_blocking(move || scan(&args.origin, &globs, &regexps))
            .await
            .map_err(|e| {
                PluginFailure::new(FailureCause::Io, format!("scan task failed: {e}"))
            })?
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

fn compile_regexps(regexps: &[String]) -> Result<Vec<Regex>, PluginFailure> {
    regexps
        .iter()
        .map(|pattern| {
            regex::RegexBuilder::new(pattern)
                .multi_line(true)
                .build()
                .map_err(|e| {
                    PluginFailure::new(
                        FailureCause::BadInput,
                        format!("bad regexp '{pattern}': {e}"),
                    )
                })
        })
        .collect()
}

fn scan(origin: &Path, globs: &GlobSet, regexps: &[Regex]) -> Result<PluginOutput, PluginFailure> {
    let files: Vec<PathBuf> = walkdir::WalkDir::new(origin)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .strip_prefix(origin)
                .map(|relative| globs.is_match(relative))
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();

    let hit = files.par_iter().find_map_any(|file| {
        let content = std::fs::read_to_string(file).ok()?;
        regexps
            .iter()
            .find(|regexp| regexp.is_match(&content))
            .map(|regexp| (file.clone(), regexp.as_str().to_string()))
    });

    match hit {
        Some((file, regexp)) => Err(PluginFailure::new(
            FailureCause::ForbiddenPattern,
            format!("file '{}' matches regexp '{regexp}'", file.display()),
        )
        .with_output(format!(
            "file '{}' matches regexp '{regexp}'",
            file.display()
        ))),
        None => Ok(PluginOutput::new("no forbidden regexps found")),
    }
}
