//! The `run_pytest` plugin: spawns the test framework in isolated
//! interpreter mode and collects per-test results over a named pipe.
//!
//! The pipe is created by this plugin before the child starts and read by a
//! background task; producers write a JSON line after every test result and
//! the last valid line is authoritative. The channel deliberately goes
//! through a FIFO rather than a file so untrusted test processes cannot
//! pre-seed or replay a report.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::PathBuf;

use async_trait::async_trait;
use nix::sys::stat::Mode;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::{timeout, Duration};

use crate::error::{FailureCause, PluginFailure};

use super::script::{execute, ExecSpec};
use super::{parse_args, parse_run_args, Plugin, PluginOutput};

const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

fn default_env_whitelist() -> Vec<String> {
    vec!["PATH".to_string()]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum Coverage {
    Enabled(bool),
    FailUnder(u32),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Args {
    origin: PathBuf,
    target: String,
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default = "default_env_whitelist")]
    env_whitelist: Vec<String>,
    #[serde(default)]
    coverage: Option<Coverage>,
    #[serde(default = "default_true")]
    report_percentage: bool,
}

/// Newline-delimited JSON payload written by the test-side reporter.
#[derive(Debug, Clone, Deserialize)]
pub struct TestReport {
    #[serde(default)]
    pub created: f64,
    #[serde(default)]
    pub duration: f64,
    pub summary: TestSummary,
    #[serde(default)]
    pub tests: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestSummary {
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub skipped: u32,
    #[serde(default)]
    pub error: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub collected: u32,
}

impl TestReport {
    pub fn percentage(&self) -> f64 {
        if self.summary.total > 0 {
            f64::from(self.summary.passed) / f64::from(self.summary.total)
        } else {
            0.0
        }
    }
}

/// Read newline-delimited JSON, keeping the most recent valid line.
/// Malformed lines are skipped without invalidating earlier data.
pub fn latest_report<R: BufRead>(reader: R) -> Option<Value> {
    let mut last_valid = None;
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            last_valid = Some(value);
        }
    }
    last_valid
}

pub struct RunPytestPlugin;

#[async_trait]
impl Plugin for RunPytestPlugin {
    fn name(&self) -> &'static str {
        "run_pytest"
    }

    fn validate_args(&self, args: &Value) -> Result<(), String> {
        parse_args::<Args>(args).map(|_| ())
    }

    async fn run(&self, args: Value, verbose: bool) -> Result<PluginOutput, PluginFailure> {
        let args: Args = parse_run_args(&args)?;
        let mut command = build_pytest_command(&args, verbose);

        let pipe = if args.report_percentage {
            let pipe = ReportPipe::create()?;
            command.extend([
                "-p".to_string(),
                "grader_reporter".to_string(),
                "--report-pipe".to_string(),
                pipe.path.display().to_string(),
            ]);
            Some(pipe)
        } else {
            None
        };

        let reader = pipe.as_ref().map(|pipe| {
            let path = pipe.path.clone();
            tokio::task::spawn_blocking(move || {
                // blocks until the writer side opens the pipe
                let file = std::fs::File::open(&path).map_err(|e| e.to_string())?;
                Ok::<_, String>(latest_report(std::io::BufReader::new(file)))
            })
        });

        let script = build_script_line(&command, &args.target, args.report_percentage);
        let exec_result = execute(ExecSpec {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), script],
            cwd: args.origin,
            timeout: args.timeout,
            env_whitelist: Some(args.env_whitelist),
            env_additional: BTreeMap::new(),
            stdin: None,
        })
        .await;
        // wake the reader even on failure, in case the child never opened
        // the pipe
        if let Some(pipe) = &pipe {
            pipe.release_reader();
        }
        let mut result = exec_result?;

        if let (Some(_pipe), Some(reader)) = (pipe, reader) {
            let raw = match timeout(READER_JOIN_TIMEOUT, reader).await {
                Ok(Ok(Ok(raw))) => raw,
                Ok(Ok(Err(e))) => {
                    return Err(PluginFailure::new(
                        FailureCause::Report,
                        format!("failed to read report from pipe: {e}"),
                    ))
                }
                Ok(Err(e)) => {
                    return Err(PluginFailure::new(
                        FailureCause::Report,
                        format!("report reader task failed: {e}"),
                    ))
                }
                Err(_) => {
                    return Err(PluginFailure::new(
                        FailureCause::Report,
                        "timed out waiting for the report pipe",
                    ))
                }
            };

            let raw = raw.ok_or_else(|| {
                PluginFailure::new(FailureCause::Report, "no report data received from the test run")
            })?;
            let report: TestReport = serde_json::from_value(raw).map_err(|e| {
                PluginFailure::new(FailureCause::Report, format!("malformed report payload: {e}"))
            })?;
            result.percentage = report.percentage();
        }

        Ok(result)
    }
}

fn build_pytest_command(args: &Args, verbose: bool) -> Vec<String> {
    // -I blocks sitecustomize.py and user site-packages, which defeats early
    // monkey-patching attempts from student code
    let mut command: Vec<String> = ["python", "-I", "-m", "pytest"]
        .iter()
        .map(ToString::to_string)
        .collect();

    if !verbose {
        command.extend(["--no-header".to_string(), "--tb=no".to_string()]);
    }

    match args.coverage {
        Some(Coverage::Enabled(true)) => {
            command.extend([
                "--cov-report".to_string(),
                "term-missing".to_string(),
                "--cov".to_string(),
                args.target.clone(),
            ]);
        }
        Some(Coverage::FailUnder(threshold)) => {
            command.extend([
                "--cov-report".to_string(),
                "term-missing".to_string(),
                "--cov".to_string(),
                args.target.clone(),
                "--cov-fail-under".to_string(),
                threshold.to_string(),
            ]);
        }
        Some(Coverage::Enabled(false)) | None => {
            command.extend(["-p".to_string(), "no:cov".to_string()]);
        }
    }

    command
}

fn build_script_line(command: &[String], target: &str, allow_failures: bool) -> String {
    let mut line = command.join(" ");
    line.push(' ');
    line.push_str(target);
    if allow_failures {
        // partial credit comes from the report, not the exit code
        line.push_str(" || true");
    }
    line
}

/// A FIFO that is unlinked when dropped.
struct ReportPipe {
    path: PathBuf,
}

impl ReportPipe {
    fn create() -> Result<Self, PluginFailure> {
        let path = std::env::temp_dir().join(format!("grader_pipe_{}", uuid::Uuid::new_v4()));
        nix::unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
            PluginFailure::new(
                FailureCause::Report,
                format!("cannot create report pipe {}: {e}", path.display()),
            )
        })?;
        Ok(Self { path })
    }

    /// Open and close the write end so a reader blocked in `open` observes
    /// EOF instead of waiting forever.
    fn release_reader(&self) {
        use std::os::unix::fs::OpenOptionsExt;
        let _ = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(&self.path);
    }
}

impl Drop for ReportPipe {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
