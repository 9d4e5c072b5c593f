//! Child process execution: the `run_script` plugin and the spawn/timeout
//! machinery shared with the sandbox and test-runner plugins.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use crate::error::{FailureCause, PluginFailure};

use super::{parse_args, parse_run_args, Plugin, PluginOutput};

/// A command: either a shell line or an argv list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScriptCommand {
    Shell(String),
    Argv(Vec<String>),
}

impl ScriptCommand {
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            ScriptCommand::Shell(line) => {
                vec!["/bin/sh".to_string(), "-c".to_string(), line.clone()]
            }
            ScriptCommand::Argv(argv) => argv.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Args {
    origin: PathBuf,
    script: ScriptCommand,
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default)]
    env_additional: BTreeMap<String, String>,
    #[serde(default)]
    env_whitelist: Option<Vec<String>>,
    #[serde(default)]
    input: Option<PathBuf>,
}

/// Runs a child process with an optional environment whitelist, stdin
/// redirection and a wall-clock timeout. Stderr is merged into the captured
/// output.
pub struct RunScriptPlugin;

#[async_trait]
impl Plugin for RunScriptPlugin {
    fn name(&self) -> &'static str {
        "run_script"
    }

    fn validate_args(&self, args: &Value) -> Result<(), String> {
        parse_args::<Args>(args).map(|_| ())
    }

    async fn run(&self, args: Value, _verbose: bool) -> Result<PluginOutput, PluginFailure> {
        let args: Args = parse_run_args(&args)?;
        let spec = ExecSpec {
            argv: args.script.to_argv(),
            cwd: args.origin,
            timeout: args.timeout,
            env_whitelist: args.env_whitelist,
            env_additional: args.env_additional,
            stdin: args.input,
        };
        execute(spec).await
    }
}

/// Everything needed to spawn one child process.
pub(crate) struct ExecSpec {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Option<f64>,
    /// When set, the child sees exactly these variables (missing ones become
    /// empty strings), plus `env_additional`.
    pub env_whitelist: Option<Vec<String>>,
    pub env_additional: BTreeMap<String, String>,
    pub stdin: Option<PathBuf>,
}

pub(crate) async fn execute(spec: ExecSpec) -> Result<PluginOutput, PluginFailure> {
    let (program, rest) = spec
        .argv
        .split_first()
        .ok_or_else(|| PluginFailure::new(FailureCause::BadInput, "empty script"))?;

    let mut command = Command::new(program);
    command
        .args(rest)
        .current_dir(&spec.cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    if let Some(whitelist) = &spec.env_whitelist {
        command.env_clear();
        for variable in whitelist {
            command.env(variable, std::env::var(variable).unwrap_or_default());
        }
    }
    command.envs(&spec.env_additional);

    match &spec.stdin {
        Some(path) => {
            let file = std::fs::File::open(path).map_err(|e| {
                PluginFailure::new(
                    FailureCause::Io,
                    format!("cannot open stdin file {}: {e}", path.display()),
                )
            })?;
            command.stdin(Stdio::from(file));
        }
        None => {
            command.stdin(Stdio::null());
        }
    }

    let mut child = command.spawn().map_err(|e| {
        PluginFailure::new(FailureCause::Io, format!("failed to spawn '{program}': {e}"))
    })?;
    let child_pid = child.id();

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");
    let stdout_reader = tokio::spawn(async move {
        let mut buffer = Vec::new();
        let _ = stdout.read_to_end(&mut buffer).await;
        buffer
    });
    let stderr_reader = tokio::spawn(async move {
        let mut buffer = Vec::new();
        let _ = stderr.read_to_end(&mut buffer).await;
        buffer
    });

    let wait_result = match spec.timeout {
        Some(seconds) => match timeout(Duration::from_secs_f64(seconds), child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                kill_process_group(child_pid);
                let _ = child.wait().await;
                let output = merge_output(stdout_reader.await, stderr_reader.await);
                return Err(PluginFailure::new(
                    FailureCause::Timeout,
                    format!("script timed out after {seconds}s"),
                )
                .with_output(output));
            }
        },
        None => child.wait().await,
    };

    let output = merge_output(stdout_reader.await, stderr_reader.await);

    let status = wait_result.map_err(|e| {
        PluginFailure::new(FailureCause::Io, format!("failed to wait for child: {e}"))
            .with_output(output.clone())
    })?;

    if status.success() {
        Ok(PluginOutput::new(output))
    } else {
        let code = status.code().unwrap_or(-1);
        Err(
            PluginFailure::new(
                FailureCause::ProcessExit(code),
                format!("script failed with exit code {code}"),
            )
            .with_output(output),
        )
    }
}

fn merge_output(
    stdout: Result<Vec<u8>, tokio::task::JoinError>,
    stderr: Result<Vec<u8>, tokio::task::JoinError>,
) -> String {
    let mut merged = stdout.unwrap_or_default();
    merged.extend(stderr.unwrap_or_default());
    String::from_utf8_lossy(&merged).into_owned()
}

fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::warn!(pid, "failed to kill process group: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn run(args: Value) -> Result<PluginOutput, PluginFailure> {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(RunScriptPlugin.run(args, false))
    }

    #[test]
    fn test_shell_script_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let result = run(serde_json::json!({
            "origin": dir.path(),
            "script": "echo hello",
        }))
        .unwrap();
        assert_eq!(result.output.trim(), "hello");
        assert_eq!(result.percentage, 1.0);
    }

    #[test]
    fn test_argv_script() {
        let dir = TempDir::new().unwrap();
        let result = run(serde_json::json!({
            "origin": dir.path(),
            "script": ["echo", "argv", "mode"],
        }))
        .unwrap();
        assert_eq!(result.output.trim(), "argv mode");
    }

    #[test]
    fn test_stderr_merged_into_output() {
        let dir = TempDir::new().unwrap();
        let result = run(serde_json::json!({
            "origin": dir.path(),
            "script": "echo out && echo err >&2",
        }))
        .unwrap();
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
    }

    #[test]
    fn test_nonzero_exit_fails_with_output() {
        let dir = TempDir::new().unwrap();
        let err = run(serde_json::json!({
            "origin": dir.path(),
            "script": "echo before failure && exit 3",
        }))
        .unwrap_err();
        assert_eq!(err.cause, FailureCause::ProcessExit(3));
        assert!(err.message.contains("exit code 3"));
        assert!(err.output.contains("before failure"));
    }

    #[test]
    fn test_timeout_kills_child() {
        let dir = TempDir::new().unwrap();
        let err = run(serde_json::json!({
            "origin": dir.path(),
            "script": "echo started && sleep 30",
            "timeout": 0.5,
        }))
        .unwrap_err();
        assert_eq!(err.cause, FailureCause::Timeout);
        assert!(err.message.contains("timed out"));
    }

    #[test]
    fn test_env_whitelist_hides_variables() {
        let dir = TempDir::new().unwrap();
        std::env::set_var("GRADER_TEST_SECRET", "hunter2");
        let result = run(serde_json::json!({
            "origin": dir.path(),
            "script": "echo \"secret=[$GRADER_TEST_SECRET] path=[$PATH]\"",
            "env_whitelist": ["PATH"],
            "env_additional": {"EXTRA": "42"},
        }))
        .unwrap();
        assert!(result.output.contains("secret=[]"));
        assert!(!result.output.contains("hunter2"));
        std::env::remove_var("GRADER_TEST_SECRET");
    }

    #[test]
    fn test_stdin_redirection() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input.txt");
        let mut file = std::fs::File::create(&input).unwrap();
        writeln!(file, "piped line").unwrap();

        let result = run(serde_json::json!({
            "origin": dir.path(),
            "script": "cat",
            "input": input,
        }))
        .unwrap();
        assert_eq!(result.output.trim(), "piped line");
    }
}
