//! Rendering of readiness results and live progress.

use std::fmt;
use std::str::FromStr;

use readygate_core::{AttemptResult, CheckOutcome, CheckState, OverallResult};

/// Output format for the final report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "text" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown format `{other}` (expected human or json)")),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Human => f.write_str("human"),
            Self::Json => f.write_str("json"),
        }
    }
}

/// Receives progress while the gate runs.
///
/// Attempts of one check arrive in order and before that check's
/// outcome. Nothing is guaranteed across checks.
pub trait ProgressSink {
    fn on_attempt(&mut self, attempt: &AttemptResult);

    fn on_outcome(&mut self, _outcome: &CheckOutcome) {}
}

/// Discards all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_attempt(&mut self, _attempt: &AttemptResult) {}
}

/// Render the final result.
pub fn render(result: &OverallResult, format: OutputFormat) -> String {
    match format {
        OutputFormat::Human => format_human(result),
        OutputFormat::Json => format_json(result),
    }
}

/// One progress line for a completed attempt.
pub fn format_attempt(attempt: &AttemptResult) -> String {
    let number = attempt.attempt_index + 1;
    match (&attempt.error_detail, attempt.success) {
        (_, true) => format!(
            "[{}] attempt {number}: ok ({}ms)",
            attempt.check_name, attempt.latency_ms
        ),
        (Some(err), false) => format!(
            "[{}] attempt {number}: {err} ({}ms)",
            attempt.check_name, attempt.latency_ms
        ),
        (None, false) => format!(
            "[{}] attempt {number}: failed ({}ms)",
            attempt.check_name, attempt.latency_ms
        ),
    }
}

fn format_json(result: &OverallResult) -> String {
    serde_json::to_string_pretty(result)
        .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }).to_string())
}

fn format_human(result: &OverallResult) -> String {
    let mut out = String::new();

    let width = result
        .outcomes
        .keys()
        .map(|name| name.chars().count())
        .max()
        .unwrap_or(0);

    for outcome in result.outcomes.values() {
        let icon = match outcome.state {
            CheckState::Ready => "✅",
            CheckState::TimedOut => "⏱️",
            CheckState::Failed => "❌",
        };
        let attempts = outcome.attempts.len();
        let plural = if attempts == 1 { "attempt" } else { "attempts" };

        out.push_str(&format!(
            "{icon} {:<width$}  {:<9}  {attempts} {plural:<8}  {}ms",
            outcome.check_name,
            outcome.state.label(),
            outcome.total_elapsed_ms,
        ));
        if !outcome.is_ready() {
            if let Some(err) = outcome.last_error() {
                out.push_str(&format!("  ({err})"));
            }
        }
        out.push('\n');
    }

    out.push('\n');
    let verdict = if result.all_ready { "READY" } else { "NOT READY" };
    out.push_str(&format!(
        "{verdict}: {}/{} checks ready in {}ms",
        result.ready_count(),
        result.outcomes.len(),
        result.total_elapsed_ms,
    ));
    if result.deadline_exceeded {
        out.push_str(" (overall timeout exceeded)");
    }
    if result.interrupted {
        out.push_str(" (interrupted)");
    }
    out.push('\n');

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;

    fn attempt(name: &str, index: u32, success: bool) -> AttemptResult {
        AttemptResult {
            check_name: name.to_string(),
            attempt_index: index,
            success,
            latency_ms: 2,
            error_detail: (!success).then(|| "connect to 127.0.0.1:1 failed: refused".to_string()),
            timed_out: false,
        }
    }

    fn sample() -> OverallResult {
        OverallResult::from_outcomes(
            [
                CheckOutcome {
                    check_name: "api".to_string(),
                    state: CheckState::Ready,
                    attempts: vec![attempt("api", 0, true)],
                    total_elapsed_ms: 4,
                },
                CheckOutcome {
                    check_name: "database".to_string(),
                    state: CheckState::Failed,
                    attempts: (0..3).map(|i| attempt("database", i, false)).collect(),
                    total_elapsed_ms: 25,
                },
            ],
            26,
            false,
            false,
        )
    }

    #[test]
    fn human_has_one_line_per_check_and_a_verdict() {
        let text = render(&sample(), OutputFormat::Human);
        let lines: Vec<&str> = text.lines().collect();

        assert!(lines[0].contains("api"));
        assert!(lines[0].contains("ready"));
        assert!(lines[0].contains("1 attempt "));
        assert!(lines[1].contains("database"));
        assert!(lines[1].contains("failed"));
        assert!(lines[1].contains("3 attempts"));
        assert!(lines[1].contains("refused"));
        assert!(text.contains("NOT READY: 1/2 checks ready in 26ms"));
    }

    #[test]
    fn human_flags_deadline_and_interrupt() {
        let mut result = sample();
        result.deadline_exceeded = true;
        result.interrupted = true;
        let text = render(&result, OutputFormat::Human);
        assert!(text.contains("overall timeout exceeded"));
        assert!(text.contains("interrupted"));
    }

    #[test]
    fn json_round_trips() {
        let result = sample();
        let json = render(&result, OutputFormat::Json);
        let parsed: OverallResult = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.all_ready, result.all_ready);
        let names = |r: &OverallResult| r.outcomes.keys().cloned().collect::<BTreeSet<_>>();
        assert_eq!(names(&parsed), names(&result));
        assert_eq!(parsed, result);
    }

    #[test]
    fn json_uses_snake_case_states() {
        let json = render(&sample(), OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["outcomes"]["database"]["state"], "failed");
        assert_eq!(value["all_ready"], false);
    }

    #[test]
    fn attempt_lines() {
        assert_eq!(format_attempt(&attempt("api", 0, true)), "[api] attempt 1: ok (2ms)");
        assert_eq!(
            format_attempt(&attempt("db", 2, false)),
            "[db] attempt 3: connect to 127.0.0.1:1 failed: refused (2ms)"
        );
    }

    #[test]
    fn format_parses() {
        assert_eq!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("Human".parse::<OutputFormat>(), Ok(OutputFormat::Human));
        assert!("yaml".parse::<OutputFormat>().is_err());
    }
}
