//! Sandboxed execution: the `safe_run_script` plugin.
//!
//! The isolation contract is delegated to the `firejail` binary: the child
//! observes only allow-listed filesystem paths, sees exactly the whitelisted
//! environment plus explicit additions, and can have network access severed.
//! When the binary is unavailable the plugin either falls back to plain
//! execution (`allow_fallback: true`) or fails with a clear message.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{FailureCause, PluginFailure};

use super::script::{execute, ExecSpec, ScriptCommand};
use super::{parse_args, parse_run_args, Plugin, PluginOutput};

const SANDBOX_BINARY: &str = "firejail";

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Args {
    origin: PathBuf,
    script: ScriptCommand,
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default)]
    input: Option<PathBuf>,
    #[serde(default)]
    env_additional: BTreeMap<String, String>,
    #[serde(default)]
    env_whitelist: Vec<String>,
    #[serde(default)]
    paths_whitelist: Vec<String>,
    #[serde(default)]
    paths_blacklist: Vec<String>,
    #[serde(default = "default_true")]
    lock_network: bool,
    #[serde(default)]
    allow_fallback: bool,
}

/// Filesystem, environment and network restrictions for one sandboxed child.
#[derive(Debug, Clone, Default)]
pub struct SandboxProfile {
    pub origin: PathBuf,
    pub paths_allowed: Vec<String>,
    pub paths_denied: Vec<String>,
    pub env_whitelist: Vec<String>,
    pub env_additional: BTreeMap<String, String>,
    pub lock_network: bool,
}

/// The environment the sandboxed child will observe: the intersection of the
/// whitelist with the parent environment (missing variables become empty),
/// plus the explicit additions.
pub fn sandbox_env(profile: &SandboxProfile) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for variable in &profile.env_whitelist {
        env.insert(
            variable.clone(),
            std::env::var(variable).unwrap_or_default(),
        );
    }
    env.extend(profile.env_additional.clone());
    env
}

/// Build the full sandbox argv wrapping `script`.
pub fn sandbox_command(script: &ScriptCommand, profile: &SandboxProfile, home: &Path) -> Vec<String> {
    let mut command = vec![
        SANDBOX_BINARY.to_string(),
        "--quiet".to_string(),
        "--noprofile".to_string(),
        "--deterministic-exit-code".to_string(),
    ];

    if profile.lock_network {
        command.push("--net=none".to_string());
    }

    let mut allowed: Vec<String> = profile.paths_allowed.clone();
    let origin = profile.origin.to_string_lossy().into_owned();
    if !allowed.contains(&origin) {
        allowed.push(origin);
    }
    // the sandbox rejects a bare /tmp whitelist; widen it to the home tmp dir
    if allowed.iter().all(|path| path == "/tmp") {
        allowed.push("~/tmp".to_string());
    }
    allowed.retain(|path| path != "/tmp");

    for path in &allowed {
        command.push(format!("--whitelist={}", expand_home(path, home)));
    }
    for path in &profile.paths_denied {
        command.push(format!("--blacklist={}", expand_home(path, home)));
    }

    // scrub the environment, then hand the child exactly the computed set
    command.push("env".to_string());
    command.push("-i".to_string());
    for (variable, value) in sandbox_env(profile) {
        command.push(format!("{variable}={value}"));
    }

    command.extend(script.to_argv());
    command
}

fn expand_home(path: &str, home: &Path) -> String {
    match path.strip_prefix('~') {
        Some(rest) => format!("{}{rest}", home.display()),
        None => path.to_string(),
    }
}

async fn sandbox_available() -> bool {
    tokio::process::Command::new(SANDBOX_BINARY)
        .arg("--version")
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Runs a script inside the sandbox contract.
pub struct SafeRunScriptPlugin;

#[async_trait]
impl Plugin for SafeRunScriptPlugin {
    fn name(&self) -> &'static str {
        "safe_run_script"
    }

    fn validate_args(&self, args: &Value) -> Result<(), String> {
        parse_args::<Args>(args).map(|_| ())
    }

    async fn run(&self, args: Value, verbose: bool) -> Result<PluginOutput, PluginFailure> {
        let args: Args = parse_run_args(&args)?;

        if !sandbox_available().await {
            if args.allow_fallback {
                let mut result = execute(ExecSpec {
                    argv: args.script.to_argv(),
                    cwd: args.origin,
                    timeout: args.timeout,
                    env_whitelist: Some(args.env_whitelist),
                    env_additional: args.env_additional,
                    stdin: args.input,
                })
                .await?;
                if verbose {
                    result.output = format!(
                        "{SANDBOX_BINARY} is not installed, falling back to plain execution\n{}",
                        result.output
                    );
                }
                return Ok(result);
            }
            return Err(PluginFailure::new(
                FailureCause::Sandbox,
                format!("{SANDBOX_BINARY} is not installed and fallback is not allowed"),
            ));
        }

        let profile = SandboxProfile {
            origin: args.origin.clone(),
            paths_allowed: args.paths_whitelist,
            paths_denied: args.paths_blacklist,
            env_whitelist: args.env_whitelist,
            env_additional: args.env_additional,
            lock_network: args.lock_network,
        };
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        let argv = sandbox_command(&args.script, &profile, Path::new(&home));

        execute(ExecSpec {
            argv,
            cwd: args.origin,
            timeout: args.timeout,
            // the environment is already scrubbed by the wrapper command
            env_whitelist: None,
            env_additional: BTreeMap::new(),
            stdin: args.input,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> SandboxProfile {
        SandboxProfile {
            origin: PathBuf::from("/work/task"),
            lock_network: true,
            ..SandboxProfile::default()
        }
    }

    fn command_for(profile: &SandboxProfile) -> Vec<String> {
        sandbox_command(
            &ScriptCommand::Shell("make test".to_string()),
            profile,
            Path::new("/home/grader"),
        )
    }

    #[test]
    fn test_origin_is_always_allowed() {
        let command = command_for(&profile());
        assert!(command.contains(&"--whitelist=/work/task".to_string()));
    }

    #[test]
    fn test_extra_allowed_path_is_whitelisted() {
        let mut profile = profile();
        profile.paths_allowed.push("/opt/toolchain".to_string());
        let command = command_for(&profile);
        assert!(command.contains(&"--whitelist=/opt/toolchain".to_string()));

        // a path not on the allow-list never appears
        assert!(!command.iter().any(|arg| arg.contains("/etc")));
    }

    #[test]
    fn test_denied_path_is_blacklisted() {
        let mut profile = profile();
        profile.paths_denied.push("~/secrets".to_string());
        let command = command_for(&profile);
        assert!(command.contains(&"--blacklist=/home/grader/secrets".to_string()));
    }

    #[test]
    fn test_network_lock_is_independent_of_allow_list() {
        let mut locked = profile();
        locked.paths_allowed.push("/anything".to_string());
        assert!(command_for(&locked).contains(&"--net=none".to_string()));

        let mut open = profile();
        open.lock_network = false;
        assert!(!command_for(&open).contains(&"--net=none".to_string()));
    }

    #[test]
    fn test_environment_is_intersection_plus_additions() {
        std::env::set_var("GRADER_SANDBOX_KEEP", "kept");
        let mut profile = profile();
        profile.env_whitelist = vec![
            "GRADER_SANDBOX_KEEP".to_string(),
            "GRADER_SANDBOX_ABSENT".to_string(),
        ];
        profile
            .env_additional
            .insert("EXTRA".to_string(), "1".to_string());

        let env = sandbox_env(&profile);
        assert_eq!(env.get("GRADER_SANDBOX_KEEP").map(String::as_str), Some("kept"));
        // absent parent variables are scrubbed to empty, not leaked
        assert_eq!(env.get("GRADER_SANDBOX_ABSENT").map(String::as_str), Some(""));
        assert_eq!(env.get("EXTRA").map(String::as_str), Some("1"));
        assert_eq!(env.len(), 3);

        let command = command_for(&profile);
        let env_pos = command.iter().position(|arg| arg == "env").unwrap();
        assert_eq!(command[env_pos + 1], "-i");
        std::env::remove_var("GRADER_SANDBOX_KEEP");
    }

    #[test]
    fn test_tmp_whitelist_is_widened() {
        let mut profile = SandboxProfile {
            origin: PathBuf::from("/tmp"),
            ..SandboxProfile::default()
        };
        profile.paths_allowed.push("/tmp".to_string());
        let command = command_for(&profile);
        assert!(!command.contains(&"--whitelist=/tmp".to_string()));
        assert!(command.contains(&"--whitelist=/home/grader/tmp".to_string()));
    }
}
