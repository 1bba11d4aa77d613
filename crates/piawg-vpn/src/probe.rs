//! Latency Probing
//!
//! Measures round-trip time to a region host by running the system `ping`
//! and reading the average out of its summary.
//!
//! The two report dialects (iputils/BSD on Unix, `ping.exe` on Windows)
//! are separate [`PingDialect`] implementations, picked once at startup by
//! [`detect_dialect`]. Their parsers are plain functions over the captured
//! text so either can be checked on any host.

use regex_lite::Regex;
use std::future::Future;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::region::LATENCY_FAILED;

/// Hard deadline for one probe, independent of the sample count
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Ping report format of a platform
pub trait PingDialect: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Program and arguments for `samples` echo requests to `host`
    fn command(&self, host: &str, samples: u8) -> (String, Vec<String>);

    /// Extract the average round trip (whole milliseconds) from a report
    fn parse_latency(&self, output: &str) -> Result<u16, ProbeError>;
}

/// `ping -c N host`, summary `rtt min/avg/max/mdev = a/b/c/d ms`
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixPing;

/// `ping -n N host`, summary `Minimum = Xms, Maximum = Yms, Average = Zms`
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsPing;

fn unix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"= \d+(?:\.\d+)?/(\d+)(?:\.\d+)?/.+ ms").expect("valid unix ping pattern")
    })
}

fn windows_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Average = (\d+)ms").expect("valid windows ping pattern"))
}

fn capture_ms(pattern: &Regex, output: &str, dialect: &str) -> Result<u16, ProbeError> {
    let value = pattern
        .captures(output)
        .and_then(|c| c.get(1))
        .ok_or_else(|| {
            ProbeError::ParseFailure(format!("unable to find ping timings in output [{}]", dialect))
        })?;

    value
        .as_str()
        .parse::<u16>()
        .map_err(|e| ProbeError::ParseFailure(format!("{}: {}", value.as_str(), e)))
}

impl PingDialect for UnixPing {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn command(&self, host: &str, samples: u8) -> (String, Vec<String>) {
        (
            "ping".to_string(),
            vec!["-c".to_string(), samples.to_string(), host.to_string()],
        )
    }

    fn parse_latency(&self, output: &str) -> Result<u16, ProbeError> {
        capture_ms(unix_pattern(), output, self.name())
    }
}

impl PingDialect for WindowsPing {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn command(&self, host: &str, samples: u8) -> (String, Vec<String>) {
        (
            "ping".to_string(),
            vec!["-n".to_string(), samples.to_string(), host.to_string()],
        )
    }

    fn parse_latency(&self, output: &str) -> Result<u16, ProbeError> {
        capture_ms(windows_pattern(), output, self.name())
    }
}

/// Pick the dialect for the running OS
pub fn detect_dialect() -> Box<dyn PingDialect> {
    let dialect: Box<dyn PingDialect> = if cfg!(windows) {
        Box::new(WindowsPing)
    } else {
        Box::new(UnixPing)
    };
    debug!(
        "Ping dialect: {} [{}]",
        dialect.name(),
        std::env::consts::OS
    );
    dialect
}

/// Raw latency measurement, before normalization
pub trait Pinger: Send + Sync {
    fn ping(&self, host: &str, samples: u8) -> impl Future<Output = Result<u16, ProbeError>> + Send;
}

/// Pinger backed by the system `ping` binary
pub struct SystemPinger {
    dialect: Box<dyn PingDialect>,
    timeout: Duration,
}

impl SystemPinger {
    /// Create a pinger for the given dialect
    pub fn new(dialect: Box<dyn PingDialect>) -> Self {
        Self {
            dialect,
            timeout: PROBE_TIMEOUT,
        }
    }

    /// Create a pinger for the running OS
    pub fn detect() -> Self {
        Self::new(detect_dialect())
    }

    #[cfg(test)]
    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Pinger for SystemPinger {
    async fn ping(&self, host: &str, samples: u8) -> Result<u16, ProbeError> {
        let (program, args) = self.dialect.command(host, samples);
        debug!("Executing command line: {} {}", program, args.join(" "));

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProbeError::Spawn(format!("{}: {}", program, e)))?;

        // Dropping the wait future on timeout kills the child
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
            .map_err(|e| ProbeError::Spawn(e.to_string()))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        trace!("Output:\n{}", text);

        if !output.status.success() {
            return Err(ProbeError::Exit {
                code: output.status.code(),
                output: text.trim().to_string(),
            });
        }

        self.dialect.parse_latency(&text)
    }
}

/// Normalizes raw measurements for storage in a region
///
/// A successful probe always yields at least 1 ms because 0 means
/// "not probed".
pub struct LatencyProber<P> {
    pinger: P,
}

impl<P: Pinger> LatencyProber<P> {
    pub fn new(pinger: P) -> Self {
        Self { pinger }
    }

    /// Probe `host`, returning the normalized latency
    pub async fn probe(&self, host: &str, samples: u8) -> Result<u16, PingFailed> {
        match self.pinger.ping(host, samples).await {
            Ok(0) => {
                debug!("{}: sub ms ping rounded up to 1ms", host);
                Ok(1)
            }
            Ok(ms) => Ok(ms),
            Err(source) => Err(PingFailed {
                host: host.to_string(),
                source,
            }),
        }
    }

    /// Probe `host`; failures are logged and become [`LATENCY_FAILED`]
    pub async fn probe_or_sentinel(&self, host: &str, samples: u8) -> u16 {
        match self.probe(host, samples).await {
            Ok(ms) => ms,
            Err(e) => {
                warn!("{}", e);
                LATENCY_FAILED
            }
        }
    }
}

/// Probe errors
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    ParseFailure(String),

    #[error("could not run ping: {0}")]
    Spawn(String),

    #[error("ping exited with {code:?}: {output}")]
    Exit { code: Option<i32>, output: String },
}

/// A failed probe of one host
#[derive(Debug, thiserror::Error)]
#[error("ping failed: {host}: {source}")]
pub struct PingFailed {
    pub host: String,
    #[source]
    pub source: ProbeError,
}
