//! Command-line surface.

use std::path::PathBuf;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "grader",
    version,
    about = "Automated grading platform - sandboxed test pipelines and deadline-aware scores",
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output (resolved stage arguments, debug details)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportView {
    Public,
    Private,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Validate configuration files, course structure, templates and
    /// pipeline placeholders
    Validate {
        #[arg(default_value = ".")]
        root: PathBuf,
    },

    /// Check the reference solutions: export a testing tree and run the
    /// task pipelines without reporting
    Check {
        #[arg(default_value = ".")]
        root: PathBuf,
        #[arg(default_value = ".")]
        reference_root: PathBuf,
        /// Task name to check (repeatable)
        #[arg(short, long)]
        task: Vec<String>,
        /// Group name to check (repeatable)
        #[arg(short, long)]
        group: Vec<String>,
        /// Grade independent tasks concurrently
        #[arg(short, long)]
        parallelize: bool,
        /// Number of concurrent workers (defaults to the CPU count)
        #[arg(short = 'n', long)]
        num_processes: Option<usize>,
        /// Keep temporary directories after the run
        #[arg(long)]
        no_clean: bool,
        /// Do not execute anything, only log actions
        #[arg(long)]
        dry_run: bool,
    },

    /// Detect changed tasks in a student repository and grade them
    Grade {
        #[arg(default_value = ".")]
        root: PathBuf,
        #[arg(default_value = ".")]
        reference_root: PathBuf,
        /// Submit resulting scores to the course server
        #[arg(long)]
        submit_score: bool,
        /// Grading timestamp (ISO 8601, e.g. 2025-09-08T13:39:13+03:00)
        #[arg(long, value_parser = parse_timestamp)]
        timestamp: Option<DateTime<FixedOffset>>,
        /// Username to report scores for
        #[arg(long)]
        username: Option<String>,
        /// Branch name to use when HEAD is detached
        #[arg(long)]
        branch: Option<String>,
        /// Keep temporary directories after the run
        #[arg(long)]
        no_clean: bool,
        /// Do not execute anything, only log actions
        #[arg(long)]
        dry_run: bool,
    },

    /// Export the public (or private) view of the reference repository
    Export {
        #[arg(default_value = ".")]
        reference_root: PathBuf,
        #[arg(default_value = "./export")]
        export_root: PathBuf,
        /// Which derived view to materialise
        #[arg(long, value_enum, default_value_t = ExportView::Public)]
        view: ExportView,
        /// Commit and push the result to the configured destination
        #[arg(long)]
        commit: bool,
        /// Do not execute anything, only log actions
        #[arg(long)]
        dry_run: bool,
    },

    /// Emit JSON schemas for the configuration files
    Schema {
        #[arg(default_value = ".")]
        output_folder: PathBuf,
    },
}

fn parse_timestamp(value: &str) -> Result<DateTime<FixedOffset>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed);
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| naive.and_utc().fixed_offset())
        .map_err(|_| {
            format!("'{value}' is not ISO 8601, e.g. 2025-09-08T13:39:13 or 2025-09-08T13:39:13Z")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_accepts_rfc3339() {
        let parsed = parse_timestamp("2025-09-08T13:39:13+03:00").unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), 3 * 3600);
    }

    #[test]
    fn test_parse_timestamp_accepts_naive() {
        let parsed = parse_timestamp("2025-09-08T13:39:13").unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_cli_parses_grade_invocation() {
        let cli = Cli::parse_from([
            "grader",
            "grade",
            "/student",
            "/reference",
            "--submit-score",
            "--username",
            "alice",
            "--timestamp",
            "2025-09-08T13:39:13Z",
        ]);
        match cli.command {
            Commands::Grade {
                submit_score,
                username,
                timestamp,
                ..
            } => {
                assert!(submit_score);
                assert_eq!(username.as_deref(), Some("alice"));
                assert!(timestamp.is_some());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
