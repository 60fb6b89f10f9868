//! Probe logic.
//!
//! A [`Prober`] runs exactly one attempt of a check. The provided
//! [`Prober::attempt`] wraps the kind-specific probe in the check's
//! per-attempt timeout and records latency, so every prober enforces the
//! timeout itself and a timed-out attempt drops (and thereby aborts) the
//! underlying connection or child process.

use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use http_body_util::BodyExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use readygate_core::{AttemptResult, CheckKind, CheckSpec};

/// Why a single attempt failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("http handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("http request failed: {0}")]
    Request(String),

    #[error("unexpected status {0}")]
    Status(http::StatusCode),

    #[error("response body does not contain `{0}`")]
    BodyMismatch(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("failed to start command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("command failed ({0})")]
    Exit(ExitStatus),
}

impl ProbeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Executes single attempts of a check.
pub trait Prober: Send + Sync + 'static {
    /// Probe once. Implementations need not enforce the timeout.
    fn probe(&self, spec: &CheckSpec) -> impl Future<Output = Result<(), ProbeError>> + Send;

    /// Probe once under `spec.timeout()` and record the result.
    fn attempt(
        &self,
        spec: &CheckSpec,
        attempt_index: u32,
    ) -> impl Future<Output = AttemptResult> + Send {
        async move {
            let started = Instant::now();
            let result = match tokio::time::timeout(spec.timeout(), self.probe(spec)).await {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout(spec.timeout())),
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(()) => AttemptResult {
                    check_name: spec.name().to_string(),
                    attempt_index,
                    success: true,
                    latency_ms,
                    error_detail: None,
                    timed_out: false,
                },
                Err(e) => {
                    debug!(check = %spec.name(), attempt = attempt_index, error = %e, "probe failed");
                    AttemptResult {
                        check_name: spec.name().to_string(),
                        attempt_index,
                        success: false,
                        latency_ms,
                        timed_out: e.is_timeout(),
                        error_detail: Some(e.to_string()),
                    }
                }
            }
        }
    }
}

/// The production prober: dispatches on [`CheckKind`].
#[derive(Debug, Clone, Copy, Default)]
pub struct KindProber;

impl Prober for KindProber {
    async fn probe(&self, spec: &CheckSpec) -> Result<(), ProbeError> {
        match spec.kind() {
            CheckKind::Http => http_probe(spec.target(), spec.expect_body()).await,
            CheckKind::Tcp => tcp_probe(spec.target()).await,
            CheckKind::Command => command_probe(spec.target()).await,
        }
    }
}

/// Aborts the connection driver when the probe future is dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// GET `url`; succeeds on a status in [200, 400).
///
/// With `expect_body`, the response body must also contain that text.
pub async fn http_probe(url: &str, expect_body: Option<&str>) -> Result<(), ProbeError> {
    let uri: http::Uri = url
        .parse()
        .map_err(|e: http::uri::InvalidUri| ProbeError::InvalidTarget(e.to_string()))?;
    let host = uri
        .host()
        .ok_or_else(|| ProbeError::InvalidTarget(format!("{url}: missing host")))?;
    let port = uri.port_u16().unwrap_or(80);
    let host_header = match uri.port() {
        Some(p) => format!("{host}:{p}"),
        None => host.to_string(),
    };
    let connect_host = host.trim_start_matches('[').trim_end_matches(']');

    let stream = TcpStream::connect((connect_host, port))
        .await
        .map_err(|source| ProbeError::Connect {
            target: host_header.clone(),
            source,
        })?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(ProbeError::Handshake)?;

    // Drive the connection in the background.
    let _driver = AbortOnDrop(tokio::spawn(async move {
        let _ = conn.await;
    }));

    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let req = http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", &host_header)
        .header("user-agent", concat!("readygate/", env!("CARGO_PKG_VERSION")))
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .map_err(|e| ProbeError::Request(e.to_string()))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| ProbeError::Request(e.to_string()))?;

    let status = resp.status();
    if !(200..400).contains(&status.as_u16()) {
        debug!(%status, %url, "http probe non-success status");
        return Err(ProbeError::Status(status));
    }

    if let Some(expect) = expect_body {
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ProbeError::Request(e.to_string()))?
            .to_bytes();
        if !String::from_utf8_lossy(&body).contains(expect) {
            return Err(ProbeError::BodyMismatch(expect.to_string()));
        }
    }

    Ok(())
}

/// Succeeds once a TCP connection to `target` (host:port) is established.
pub async fn tcp_probe(target: &str) -> Result<(), ProbeError> {
    TcpStream::connect(target)
        .await
        .map(drop)
        .map_err(|source| ProbeError::Connect {
            target: target.to_string(),
            source,
        })
}

/// Run `command_line` through the platform shell; succeeds on exit 0.
///
/// Output is discarded. If the attempt is dropped, the shell and everything
/// it started are killed.
pub async fn command_probe(command_line: &str) -> Result<(), ProbeError> {
    let mut child = shell_command(command_line)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(ProbeError::Spawn)?;

    let mut group = ProcessGroup::new(child.id());
    let status = child.wait().await.map_err(ProbeError::Spawn)?;
    group.disarm();

    if status.success() {
        Ok(())
    } else {
        Err(ProbeError::Exit(status))
    }
}

#[cfg(unix)]
fn shell_command(command_line: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    // The shell leads its own group so a kill reaches its children too.
    cmd.arg("-c").arg(command_line).process_group(0);
    cmd
}

/// SIGKILLs a command's process group on drop unless disarmed.
struct ProcessGroup {
    #[cfg(unix)]
    pgid: Option<libc::pid_t>,
}

impl ProcessGroup {
    #[cfg(unix)]
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| libc::pid_t::try_from(p).ok()),
        }
    }

    #[cfg(not(unix))]
    fn new(_pid: Option<u32>) -> Self {
        Self {}
    }

    fn disarm(&mut self) {
        #[cfg(unix)]
        {
            self.pgid = None;
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.take() {
            // SAFETY: kill(2) has no memory-safety preconditions; a negative
            // pid addresses the group led by the shell we spawned.
            let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
            if rc != 0 {
                debug!(pgid, error = %std::io::Error::last_os_error(), "process group already gone");
            }
        }
    }
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.arg("/C").arg(command_line);
    cmd
}
