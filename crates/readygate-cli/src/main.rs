//! readygate — block until HTTP endpoints, TCP ports and commands are ready.
//!
//! # Usage
//!
//! ```text
//! readygate --check name=api,kind=http,target=http://localhost:8000/health \
//!           --check name=redis,kind=tcp,target=localhost:6379 \
//!           --overall-timeout 2m
//! readygate --config readygate.toml --format json
//! ```
//!
//! Exit codes: 0 all checks ready, 1 any check not ready, 2 bad configuration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use readygate_core::ConfigError;
use readygate_health::OutputFormat;

mod commands;

const EXIT_NOT_READY: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(
    name = "readygate",
    about = "Wait for HTTP, TCP and command dependencies to become ready",
    version
)]
struct Cli {
    /// TOML file listing checks
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Inline check (repeatable), e.g.
    /// name=api,kind=http,target=http://localhost:8000/health,interval=1s
    #[arg(long = "check", value_name = "SPEC")]
    checks: Vec<String>,

    /// Hard cap on the whole run (e.g. 90s, 2m)
    #[arg(long, value_name = "DURATION", value_parser = parse_overall_timeout)]
    overall_timeout: Option<Duration>,

    /// Output format: human or json
    #[arg(short, long, default_value = "human")]
    format: OutputFormat,

    /// Suppress per-attempt progress lines
    #[arg(short, long)]
    quiet: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    log_format: String,
}

fn parse_overall_timeout(s: &str) -> Result<Duration, String> {
    match readygate_core::parse_duration(s) {
        Some(d) if !d.is_zero() => Ok(d),
        _ => Err(format!("invalid duration `{s}` (expected e.g. 500ms, 30s, 2m)")),
    }
}

fn init_tracing(log_format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match log_format {
        "json" => builder.json().init(),
        _ => builder.init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_format);

    let args = commands::wait::WaitArgs {
        config: cli.config,
        checks: cli.checks,
        overall_timeout: cli.overall_timeout,
        format: cli.format,
        quiet: cli.quiet,
    };

    match commands::wait::wait(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_NOT_READY),
        Err(e) => {
            eprintln!("error: {e:#}");
            if e.downcast_ref::<ConfigError>().is_some() {
                ExitCode::from(EXIT_CONFIG)
            } else {
                ExitCode::from(EXIT_NOT_READY)
            }
        }
    }
}
