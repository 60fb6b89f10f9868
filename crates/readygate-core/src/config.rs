//! Check configuration: the TOML file model, inline `--check` parsing, and
//! validation into immutable [`CheckSpec`]s.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Keys accepted in an inline check definition.
const INLINE_KEYS: &[&str] = &[
    "name",
    "kind",
    "target",
    "interval",
    "timeout",
    "max-attempts",
    "backoff",
    "max-interval",
    "deadline",
    "expect-body",
];

/// What a check talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Http,
    Tcp,
    #[serde(rename = "cmd")]
    Command,
}

impl CheckKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Some(Self::Http),
            "tcp" => Some(Self::Tcp),
            "cmd" | "command" => Some(Self::Command),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
            Self::Command => "cmd",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Attempt budget for one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxAttempts {
    Limited(u32),
    /// Keep probing until the check's deadline (or the overall timeout).
    UntilDeadline,
}

impl MaxAttempts {
    pub fn limit(&self) -> Option<u32> {
        match self {
            Self::Limited(n) => Some(*n),
            Self::UntilDeadline => None,
        }
    }
}

/// Delay policy between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Always wait `interval`.
    Fixed,
    /// Double the wait after each failure, capped at `max_interval`.
    Exponential { max_interval: Duration },
}

impl Backoff {
    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn delay(&self, interval: Duration, failures: u32) -> Duration {
        match self {
            Self::Fixed => interval,
            Self::Exponential { max_interval } => {
                let factor = 2u32.saturating_pow(failures.saturating_sub(1));
                interval
                    .saturating_mul(factor)
                    .min((*max_interval).max(interval))
            }
        }
    }
}

/// A validated, immutable readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSpec {
    name: String,
    kind: CheckKind,
    target: String,
    interval: Duration,
    timeout: Duration,
    max_attempts: MaxAttempts,
    backoff: Backoff,
    deadline: Option<Duration>,
    expect_body: Option<String>,
}

impl CheckSpec {
    /// Start building a check with default cadence and budget.
    pub fn builder(
        name: impl Into<String>,
        kind: CheckKind,
        target: impl Into<String>,
    ) -> CheckSpecBuilder {
        CheckSpecBuilder {
            spec: CheckSpec {
                name: name.into(),
                kind,
                target: target.into(),
                interval: DEFAULT_INTERVAL,
                timeout: DEFAULT_TIMEOUT,
                max_attempts: MaxAttempts::Limited(DEFAULT_MAX_ATTEMPTS),
                backoff: Backoff::Fixed,
                deadline: None,
                expect_body: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CheckKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_attempts(&self) -> MaxAttempts {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Explicit per-check deadline, if one was configured.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn expect_body(&self) -> Option<&str> {
        self.expect_body.as_deref()
    }

    /// Total time this check may spend before it is considered timed out.
    ///
    /// An explicit deadline wins. Otherwise the budget is the sum of the
    /// waits the attempt budget would schedule (`max_attempts * interval`
    /// for fixed backoff) plus one per-attempt timeout for every attempt,
    /// so a check whose probes keep failing within their timeout uses up
    /// its attempts before the deadline. `None` means only an outside
    /// deadline bounds it.
    pub fn time_budget(&self) -> Option<Duration> {
        if let Some(deadline) = self.deadline {
            return Some(deadline);
        }
        let attempts = self.max_attempts.limit()?;
        let waits = (1..=attempts)
            .map(|n| self.backoff.delay(self.interval, n))
            .fold(Duration::ZERO, Duration::saturating_add);
        Some(waits.saturating_add(self.timeout.saturating_mul(attempts)))
    }
}

/// Builder for [`CheckSpec`]; [`CheckSpecBuilder::build`] runs validation.
#[derive(Debug, Clone)]
pub struct CheckSpecBuilder {
    spec: CheckSpec,
}

impl CheckSpecBuilder {
    pub fn interval(mut self, interval: Duration) -> Self {
        self.spec.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, max_attempts: MaxAttempts) -> Self {
        self.spec.max_attempts = max_attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.spec.backoff = backoff;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.spec.deadline = Some(deadline);
        self
    }

    pub fn expect_body(mut self, expect: impl Into<String>) -> Self {
        self.spec.expect_body = Some(expect.into());
        self
    }

    pub fn build(self) -> ConfigResult<CheckSpec> {
        let spec = self.spec;
        let check = || spec.name.clone();

        if spec.name.trim().is_empty() {
            return Err(ConfigError::MissingField { field: "name" });
        }
        if spec.interval.is_zero() {
            return Err(ConfigError::NonPositive { check: check(), field: "interval" });
        }
        if spec.timeout.is_zero() {
            return Err(ConfigError::NonPositive { check: check(), field: "timeout" });
        }
        if spec.max_attempts == MaxAttempts::Limited(0) {
            return Err(ConfigError::NonPositive { check: check(), field: "max-attempts" });
        }
        if spec.deadline.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::NonPositive { check: check(), field: "deadline" });
        }
        if let Backoff::Exponential { max_interval } = spec.backoff {
            if max_interval.is_zero() {
                return Err(ConfigError::NonPositive { check: check(), field: "max-interval" });
            }
        }
        if spec.expect_body.is_some() && spec.kind != CheckKind::Http {
            return Err(ConfigError::ExpectBodyNotHttp { check: check() });
        }
        validate_target(&spec)?;

        Ok(spec)
    }
}

fn validate_target(spec: &CheckSpec) -> ConfigResult<()> {
    let invalid = |reason: &str| ConfigError::InvalidTarget {
        check: spec.name.clone(),
        target: spec.target.clone(),
        reason: reason.to_string(),
    };

    match spec.kind {
        CheckKind::Http => {
            let uri: http::Uri = spec
                .target
                .parse()
                .map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
            match uri.scheme_str() {
                Some("http") => {}
                Some("https") => return Err(invalid("https targets are not supported")),
                _ => return Err(invalid("expected an http:// URL")),
            }
            if uri.host().is_none_or(str::is_empty) {
                return Err(invalid("missing host"));
            }
        }
        CheckKind::Tcp => {
            let (host, port) = spec
                .target
                .rsplit_once(':')
                .ok_or_else(|| invalid("expected host:port"))?;
            if host.is_empty() {
                return Err(invalid("missing host"));
            }
            match port.parse::<u16>() {
                Ok(p) if p > 0 => {}
                _ => return Err(invalid("invalid port")),
            }
        }
        CheckKind::Command => {
            if spec.target.trim().is_empty() {
                return Err(invalid("empty command"));
            }
        }
    }
    Ok(())
}

/// `max-attempts` as written: an integer or the `until-deadline` keyword.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttemptsValue {
    Count(i64),
    Keyword(String),
}

/// Cadence defaults shared by every check in a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CheckDefaults {
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub max_attempts: Option<AttemptsValue>,
    pub backoff: Option<String>,
    pub max_interval: Option<String>,
}

/// One check as written in a config file or inline flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CheckEntry {
    pub name: Option<String>,
    pub kind: Option<String>,
    pub target: Option<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub max_attempts: Option<AttemptsValue>,
    pub backoff: Option<String>,
    pub max_interval: Option<String>,
    pub deadline: Option<String>,
    pub expect_body: Option<String>,
}

impl CheckEntry {
    /// Parse `name=api,kind=http,target=http://...,interval=1s`.
    ///
    /// A comma-separated segment that does not start with a known `key=`
    /// is glued back onto the previous value, so command targets may
    /// contain commas.
    pub fn parse_inline(input: &str) -> ConfigResult<Self> {
        let malformed = |reason: String| ConfigError::Inline {
            input: input.to_string(),
            reason,
        };

        let mut pairs: Vec<(String, String)> = Vec::new();
        for segment in input.split(',') {
            let known_key = segment
                .split_once('=')
                .map(|(k, v)| (k.trim(), v))
                .filter(|(k, _)| INLINE_KEYS.contains(k));

            if let Some((key, value)) = known_key {
                if pairs.iter().any(|(k, _)| k == key) {
                    return Err(malformed(format!("`{key}` given twice")));
                }
                pairs.push((key.to_string(), value.to_string()));
            } else if let Some((_, value)) = pairs.last_mut() {
                value.push(',');
                value.push_str(segment);
            } else {
                return Err(malformed(format!("expected key=value, got `{segment}`")));
            }
        }

        let mut entry = CheckEntry::default();
        for (key, value) in pairs {
            let value = value.trim().to_string();
            match key.as_str() {
                "name" => entry.name = Some(value),
                "kind" => entry.kind = Some(value),
                "target" => entry.target = Some(value),
                "interval" => entry.interval = Some(value),
                "timeout" => entry.timeout = Some(value),
                "max-attempts" => entry.max_attempts = Some(AttemptsValue::Keyword(value)),
                "backoff" => entry.backoff = Some(value),
                "max-interval" => entry.max_interval = Some(value),
                "deadline" => entry.deadline = Some(value),
                "expect-body" => entry.expect_body = Some(value),
                _ => unreachable!("key filtered against INLINE_KEYS"),
            }
        }
        Ok(entry)
    }

    /// Merge with `defaults` and validate.
    pub fn resolve(&self, defaults: &CheckDefaults) -> ConfigResult<CheckSpec> {
        let name = self
            .name
            .clone()
            .ok_or(ConfigError::MissingField { field: "name" })?;
        let kind_str = self
            .kind
            .as_deref()
            .ok_or(ConfigError::MissingField { field: "kind" })?;
        let kind = CheckKind::parse(kind_str).ok_or_else(|| ConfigError::UnknownKind {
            check: name.clone(),
            kind: kind_str.to_string(),
        })?;
        let target = self
            .target
            .clone()
            .ok_or(ConfigError::MissingField { field: "target" })?;

        let duration = |field: &'static str, value: Option<&String>| -> ConfigResult<Option<Duration>> {
            value
                .map(|v| {
                    parse_duration(v).ok_or_else(|| ConfigError::InvalidDuration {
                        check: name.clone(),
                        field,
                        value: v.clone(),
                    })
                })
                .transpose()
        };

        let interval = duration("interval", self.interval.as_ref().or(defaults.interval.as_ref()))?
            .unwrap_or(DEFAULT_INTERVAL);
        let timeout = duration("timeout", self.timeout.as_ref().or(defaults.timeout.as_ref()))?
            .unwrap_or(DEFAULT_TIMEOUT);
        let max_interval = duration(
            "max-interval",
            self.max_interval.as_ref().or(defaults.max_interval.as_ref()),
        )?
        .unwrap_or(DEFAULT_MAX_INTERVAL);
        let deadline = duration("deadline", self.deadline.as_ref())?;

        let max_attempts = match self.max_attempts.as_ref().or(defaults.max_attempts.as_ref()) {
            Some(value) => parse_max_attempts(&name, value)?,
            None => MaxAttempts::Limited(DEFAULT_MAX_ATTEMPTS),
        };

        let backoff = match self.backoff.as_ref().or(defaults.backoff.as_ref()) {
            None => Backoff::Fixed,
            Some(b) => match b.trim().to_ascii_lowercase().as_str() {
                "fixed" => Backoff::Fixed,
                "exponential" => Backoff::Exponential { max_interval },
                _ => {
                    return Err(ConfigError::UnknownBackoff {
                        check: name,
                        backoff: b.clone(),
                    })
                }
            },
        };

        let mut builder = CheckSpec::builder(name, kind, target)
            .interval(interval)
            .timeout(timeout)
            .max_attempts(max_attempts)
            .backoff(backoff);
        if let Some(deadline) = deadline {
            builder = builder.deadline(deadline);
        }
        if let Some(expect) = &self.expect_body {
            builder = builder.expect_body(expect.clone());
        }
        builder.build()
    }
}

fn parse_max_attempts(check: &str, value: &AttemptsValue) -> ConfigResult<MaxAttempts> {
    let invalid = |v: String| ConfigError::InvalidMaxAttempts {
        check: check.to_string(),
        value: v,
    };
    let count = match value {
        AttemptsValue::Count(n) => *n,
        AttemptsValue::Keyword(k) => {
            let k = k.trim();
            if k.eq_ignore_ascii_case("until-deadline") {
                return Ok(MaxAttempts::UntilDeadline);
            }
            k.parse::<i64>().map_err(|_| invalid(k.to_string()))?
        }
    };
    if count <= 0 {
        return Err(ConfigError::NonPositive {
            check: check.to_string(),
            field: "max-attempts",
        });
    }
    u32::try_from(count)
        .map(MaxAttempts::Limited)
        .map_err(|_| invalid(count.to_string()))
}

/// A readygate config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GateConfig {
    pub overall_timeout: Option<String>,
    #[serde(default)]
    pub defaults: CheckDefaults,
    #[serde(default, rename = "check")]
    pub checks: Vec<CheckEntry>,
}

/// Everything needed to run the gate, fully validated.
#[derive(Debug, Clone)]
pub struct GatePlan {
    pub checks: Vec<CheckSpec>,
    pub overall_timeout: Option<Duration>,
}

impl GateConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Append a check given as an inline `--check` value.
    pub fn push_inline(&mut self, input: &str) -> ConfigResult<()> {
        self.checks.push(CheckEntry::parse_inline(input)?);
        Ok(())
    }

    /// Validate every check. `overall_override` replaces the file's
    /// `overall-timeout` when given.
    pub fn resolve(&self, overall_override: Option<Duration>) -> ConfigResult<GatePlan> {
        let overall_timeout = match overall_override {
            Some(d) => Some(d),
            None => self
                .overall_timeout
                .as_deref()
                .map(|s| {
                    parse_duration(s)
                        .filter(|d| !d.is_zero())
                        .ok_or_else(|| ConfigError::InvalidOverallTimeout(s.to_string()))
                })
                .transpose()?,
        };
        if overall_timeout.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::InvalidOverallTimeout("0".to_string()));
        }

        if self.checks.is_empty() {
            return Err(ConfigError::NoChecks);
        }

        let mut seen = HashSet::new();
        let mut checks = Vec::with_capacity(self.checks.len());
        for entry in &self.checks {
            let spec = entry.resolve(&self.defaults)?;
            if !seen.insert(spec.name().to_string()) {
                return Err(ConfigError::DuplicateName(spec.name().to_string()));
            }
            if spec.time_budget().is_none() && overall_timeout.is_none() {
                return Err(ConfigError::Unbounded {
                    check: spec.name().to_string(),
                });
            }
            checks.push(spec);
        }

        Ok(GatePlan {
            checks,
            overall_timeout,
        })
    }
}

/// Parse a duration string like "5s", "500ms", "2m", "1h".
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m.saturating_mul(60)))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h.saturating_mul(3600)))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
