//! The readiness wait: load checks, run them, print the report.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use readygate_core::{AttemptResult, CheckOutcome, GateConfig, GatePlan};
use readygate_health::{format_attempt, render, Coordinator, KindProber, OutputFormat, ProgressSink};

pub struct WaitArgs {
    pub config: Option<PathBuf>,
    pub checks: Vec<String>,
    pub overall_timeout: Option<Duration>,
    pub format: OutputFormat,
    pub quiet: bool,
}

/// Prints progress lines to stderr so stdout carries only the report.
struct ConsoleProgress {
    quiet: bool,
}

impl ProgressSink for ConsoleProgress {
    fn on_attempt(&mut self, attempt: &AttemptResult) {
        if !self.quiet {
            eprintln!("{}", format_attempt(attempt));
        }
    }

    fn on_outcome(&mut self, outcome: &CheckOutcome) {
        if !self.quiet {
            eprintln!(
                "[{}] {} after {} attempt(s)",
                outcome.check_name,
                outcome.state,
                outcome.attempts.len()
            );
        }
    }
}

/// Build the validated plan from the config file and inline checks.
///
/// Inline checks are appended after the file's checks.
pub fn load_plan(args: &WaitArgs) -> Result<GatePlan, readygate_core::ConfigError> {
    let mut config = match &args.config {
        Some(path) => GateConfig::from_file(path)?,
        None => GateConfig::default(),
    };
    for check in &args.checks {
        config.push_inline(check)?;
    }
    config.resolve(args.overall_timeout)
}

/// Run the gate. Returns whether every check became ready.
pub async fn wait(args: WaitArgs) -> Result<bool> {
    let plan = load_plan(&args)?;
    info!(
        checks = plan.checks.len(),
        overall_timeout = ?plan.overall_timeout,
        "configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => warn!(error = %e, "failed to install Ctrl-C handler"),
        }
    });

    let coordinator = Coordinator::new(KindProber).with_overall_deadline(plan.overall_timeout);
    let mut progress = ConsoleProgress { quiet: args.quiet };
    let result = coordinator
        .run(plan.checks, &mut progress, shutdown_rx)
        .await;

    let mut stdout = std::io::stdout().lock();
    write!(stdout, "{}", render(&result, args.format))?;
    if args.format == OutputFormat::Json {
        writeln!(stdout)?;
    }
    stdout.flush()?;

    Ok(result.all_ready)
}
