use clap::Parser;
use grader::cli::Cli;
use grader::commands;
use grader::error::GraderError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const RED: &str = "\x1b[91m";
const ORANGE: &str = "\x1b[93m";
const RESET: &str = "\x1b[0m";

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "grader=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(error) = commands::run(cli).await {
        let label = match &error {
            GraderError::Config(_) => "CONFIGURATION ERROR",
            GraderError::Structure(_) => "STRUCTURE ERROR",
            GraderError::Testing(_) => "TESTING FAILED",
            GraderError::Store(_) => "STORE ERROR",
            GraderError::Git(_) => "GIT ERROR",
            GraderError::Io(_) => "I/O ERROR",
            GraderError::Unexpected(_) => "UNEXPECTED ERROR",
        };
        let color = match &error {
            GraderError::Testing(_) => ORANGE,
            _ => RED,
        };
        eprintln!("{color}{label}{RESET}");
        eprintln!("{error}");
        std::process::exit(1);
    }
}
