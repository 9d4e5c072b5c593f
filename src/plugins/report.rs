//! The `report_score` plugin: POSTs a graded score to the course server as a
//! multipart form, with retry and exponential back-off on transient statuses.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::{sleep, Duration};

use crate::error::{FailureCause, PluginFailure};

use super::{parse_args, parse_run_args, Plugin, PluginOutput};

const RETRYABLE_STATUSES: [u16; 5] = [408, 500, 502, 503, 504];
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%z";

fn default_patterns() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Args {
    #[serde(default)]
    origin: Option<PathBuf>,
    #[serde(default = "default_patterns")]
    patterns: Vec<String>,
    username: String,
    task_name: String,
    score: Option<f64>,
    report_url: String,
    report_token: String,
    check_deadline: bool,
    #[serde(default)]
    send_time: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Deserialize)]
struct ReportResponse {
    score: i64,
}

/// Retry knobs for the score POST.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60000,
        }
    }
}

pub struct ReportScorePlugin {
    client: Client,
    retry: RetryConfig,
}

impl Default for ReportScorePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportScorePlugin {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Plugin for ReportScorePlugin {
    fn name(&self) -> &'static str {
        "report_score"
    }

    fn validate_args(&self, args: &Value) -> Result<(), String> {
        let args: Args = parse_args(args)?;
        if !args.report_url.starts_with("http://") && !args.report_url.starts_with("https://") {
            return Err(format!("report_url must be http(s), got '{}'", args.report_url));
        }
        Ok(())
    }

    async fn run(&self, args: Value, verbose: bool) -> Result<PluginOutput, PluginFailure> {
        let args: Args = parse_run_args(&args)?;
        let mut output = Vec::new();

        let send_time = args
            .send_time
            .unwrap_or_else(|| Local::now().fixed_offset());

        let attachments = match &args.origin {
            Some(origin) => collect_attachments(origin, &args.patterns).await?,
            None => Vec::new(),
        };
        if verbose && !attachments.is_empty() {
            output.push(format!(
                "attaching files: {}",
                attachments
                    .iter()
                    .map(|(name, _)| name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }

        let make_form = || {
            let mut form = Form::new()
                .text("token", args.report_token.clone())
                .text("task", args.task_name.clone())
                .text("username", args.username.clone())
                .text(
                    "score",
                    args.score.map(|s| s.to_string()).unwrap_or_default(),
                )
                .text("check_deadline", args.check_deadline.to_string())
                .text("submit_time", send_time.format(TIME_FORMAT).to_string());
            for (name, bytes) in &attachments {
                form = form.part(
                    "files",
                    Part::bytes(bytes.clone()).file_name(name.clone()),
                );
            }
            form
        };

        let response =
            post_with_retries(&self.client, &args.report_url, make_form, &self.retry).await?;

        let parsed: ReportResponse = response.json().await.map_err(|e| {
            PluginFailure::new(FailureCause::Http, format!("unable to decode response: {e}"))
        })?;

        output.push(format!(
            "reported task '{}' for user '{}', requested score: {:?}, result score: {}",
            args.task_name, args.username, args.score, parsed.score
        ));
        Ok(PluginOutput::new(output.join("\n")))
    }
}

/// POST the form, retrying transient statuses and connection errors with
/// exponential back-off, up to `retry.max_attempts` total attempts.
pub async fn post_with_retries<F>(
    client: &Client,
    url: &str,
    make_form: F,
    retry: &RetryConfig,
) -> Result<reqwest::Response, PluginFailure>
where
    F: Fn() -> Form,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = client.post(url).multipart(make_form()).send().await;
        let retryable = match &result {
            Ok(response) => RETRYABLE_STATUSES.contains(&response.status().as_u16()),
            Err(_) => true,
        };

        if retryable && attempt < retry.max_attempts {
            let delay = (retry.base_delay_ms * 2u64.pow(attempt - 1)).min(retry.max_delay_ms);
            tracing::warn!(
                attempt,
                max_attempts = retry.max_attempts,
                delay_ms = delay,
                "score report failed, retrying"
            );
            sleep(Duration::from_millis(delay)).await;
            continue;
        }

        return match result {
            Ok(response) if response.status().is_success() => Ok(response),
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                Err(PluginFailure::new(
                    FailureCause::Http,
                    format!("{status}: {body}"),
                ))
            }
            Err(e) => Err(PluginFailure::new(
                FailureCause::Http,
                format!("report request failed: {e}"),
            )),
        };
    }
}

async fn collect_attachments(
    origin: &std::path::Path,
    patterns: &[String],
) -> Result<Vec<(String, Vec<u8>)>, PluginFailure> {
    let mut builder = globset::GlobSetBuilder::new();
    for pattern in patterns {
        let glob = globset::Glob::new(pattern).map_err(|e| {
            PluginFailure::new(FailureCause::BadInput, format!("bad glob '{pattern}': {e}"))
        })?;
        builder.add(glob);
    }
    let globs = builder.build().map_err(|e| {
        PluginFailure::new(FailureCause::BadInput, format!("bad glob set: {e}"))
    })?;

    let mut attachments = Vec::new();
    for entry in walkdir::WalkDir::new(origin)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        let relative = match entry.path().strip_prefix(origin) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        if !globs.is_match(relative) {
            continue;
        }
        let bytes = tokio::fs::read(entry.path()).await.map_err(|e| {
            PluginFailure::new(
                FailureCause::Io,
                format!("cannot read {}: {e}", entry.path().display()),
            )
        })?;
        attachments.push((relative.display().to_string(), bytes));
    }
    Ok(attachments)
}
