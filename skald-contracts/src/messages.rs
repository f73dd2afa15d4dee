/*!
Wire contracts between launchers, clients and the skald daemon

Every message is one JSON document terminated by `\n`:
- `JobRegistration` : launcher -> registration socket
- `QueryRequest` : client -> query socket
- `CpuSnapshot` / `GpuSnapshot` or `QueryError` : daemon -> client
*/

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Process identifier as reported by the OS.
pub type Pid = i32;
/// Process-group identifier; identifies a job root.
pub type Pgid = i32;

/// Name given to jobs registered without one.
pub const FALLBACK_JOB_NAME: &str = "local";

/// Upper bound for a single framed client message (registration or query).
pub const MAX_MESSAGE_BYTES: u64 = 64 * 1024;

/// Upper bound for a query answer. Snapshots grow with every tracked job.
pub const MAX_ANSWER_BYTES: u64 = 256 * 1024 * 1024;

pub const DEFAULT_REGISTRATION_SOCKET: &str = "/tmp/skald.socket";
pub const DEFAULT_QUERY_SOCKET: &str = "/tmp/skald_serve.socket";

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("empty message")]
    Empty,
}

/// Registration event sent once by a launcher after starting a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRegistration {
    /// Process-group id of the launched job (also its root pid)
    #[serde(rename = "pid")]
    pub pgid: Pgid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub log_path: String,
    pub start_time: DateTime<Utc>,
}

impl JobRegistration {
    pub fn new(
        pgid: Pgid,
        name: impl Into<String>,
        command: impl Into<String>,
        log_path: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            pgid,
            name: name.into(),
            command: command.into(),
            log_path: log_path.into(),
            start_time,
        }
    }

    /// Job name, or the fallback label when the launcher sent none
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            FALLBACK_JOB_NAME
        } else {
            &self.name
        }
    }
}

/// Metric families the daemon aggregates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Cpu,
    Gpu,
}

impl MetricKind {
    pub const ALL: [MetricKind; 2] = [MetricKind::Cpu, MetricKind::Gpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Gpu => "gpu",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown metric kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for MetricKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(MetricKind::Cpu),
            "gpu" => Ok(MetricKind::Gpu),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// Query sent on the query socket. The kind stays a raw string so an
/// unsupported value still decodes and can be answered with `QueryError`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(rename = "type")]
    pub kind: String,
}

impl QueryRequest {
    pub fn new(kind: MetricKind) -> Self {
        Self { kind: kind.as_str().to_string() }
    }

    pub fn metric_kind(&self) -> Option<MetricKind> {
        self.kind.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryError {
    pub error: String,
}

impl QueryError {
    pub fn unknown_type() -> Self {
        Self { error: "unknown type".to_string() }
    }
}

/// Running CPU/memory summary of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSummary {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    /// Time-weighted CPU percent
    pub cpu: f64,
    /// Time-weighted memory percent
    pub memory: f64,
}

impl CpuSummary {
    pub fn new(name: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self { name: name.into(), start, end: None, cpu: 0.0, memory: 0.0 }
    }

    pub fn elapsed(&self) -> Duration {
        window_length(self.start, self.end)
    }
}

/// Running GPU summary of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuSummary {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    /// Time-weighted utilization percent
    pub avg_util: f64,
    /// Time-weighted memory in GB
    pub avg_memory: f64,
    /// Accumulated energy in Wh
    pub energy: f64,
    /// Highest temperature seen, in °C
    pub max_temp: f64,
    /// Device indices the job was seen on
    #[serde(default)]
    pub devices: Vec<u32>,
}

impl GpuSummary {
    pub fn new(name: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            start,
            end: None,
            avg_util: 0.0,
            avg_memory: 0.0,
            energy: 0.0,
            max_temp: 0.0,
            devices: Vec::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        window_length(self.start, self.end)
    }
}

fn window_length(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Duration {
    match end {
        Some(end) if end > start => end - start,
        _ => Duration::zero(),
    }
}

pub type CpuSnapshot = BTreeMap<Pgid, CpuSummary>;
pub type GpuSnapshot = BTreeMap<Pgid, GpuSummary>;

/// Serialize a message as one newline-terminated JSON line
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, ContractError> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse one framed message, ignoring surrounding whitespace
pub fn decode_line<T: DeserializeOwned>(raw: &[u8]) -> Result<T, ContractError> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return Err(ContractError::Empty);
    }
    Ok(serde_json::from_str(text)?)
}
