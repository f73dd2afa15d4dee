use serde::{Deserialize, Deserializer, Serialize};
use skald_contracts::messages::{DEFAULT_QUERY_SOCKET, DEFAULT_REGISTRATION_SOCKET};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{section}: interval must be greater than zero")]
    InvalidInterval { section: String },
    #[error("{section}: size must be greater than zero (got {size})")]
    InvalidSize { section: String, size: i64 },
    #[error("no collector configured, add a `cpu` or `nvidia` section under `collectors`")]
    NoCollectors,
}

/// Raw daemon configuration, validated into `KernelConfig`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RawConfig {
    pub state: IntervalConf,
    pub storage: StorageConf,
    #[serde(default)]
    pub sockets: SocketsConf,
    #[serde(default)]
    pub collectors: BTreeMap<String, CollectorConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IntervalConf {
    #[serde(with = "duration_str")]
    pub interval: Duration,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConf {
    #[serde(with = "duration_str")]
    pub interval: Duration,
    pub size: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SocketsConf {
    #[serde(default = "default_registration_socket")]
    pub registration: PathBuf,
    #[serde(default = "default_query_socket")]
    pub query: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CollectorConf {
    #[serde(with = "duration_str")]
    pub interval: Duration,
    pub size: i64,
}

impl Default for SocketsConf {
    fn default() -> Self {
        Self {
            registration: default_registration_socket(),
            query: default_query_socket(),
        }
    }
}

fn default_registration_socket() -> PathBuf {
    DEFAULT_REGISTRATION_SOCKET.into()
}

fn default_query_socket() -> PathBuf {
    DEFAULT_QUERY_SOCKET.into()
}

/// Per-collector settings after validation
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorSettings {
    pub interval: Duration,
    /// Observations buffered before a batch is emitted
    pub size: usize,
}

/// Validated configuration handed to the daemon
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub refresh_interval: Duration,
    pub flush_interval: Duration,
    pub queue_size: usize,
    pub sockets: SocketsConf,
    pub collectors: BTreeMap<String, CollectorSettings>,
}

impl KernelConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text)?;
        raw.validate()
    }
}

impl RawConfig {
    pub fn validate(self) -> Result<KernelConfig, ConfigError> {
        let refresh_interval = positive_interval("state", self.state.interval)?;
        let flush_interval = positive_interval("storage", self.storage.interval)?;
        let queue_size = positive_size("storage", self.storage.size)?;

        if self.collectors.is_empty() {
            return Err(ConfigError::NoCollectors);
        }
        let mut collectors = BTreeMap::new();
        for (name, conf) in self.collectors {
            let section = format!("collectors.{name}");
            let settings = CollectorSettings {
                interval: positive_interval(&section, conf.interval)?,
                size: positive_size(&section, conf.size)?,
            };
            collectors.insert(name, settings);
        }

        Ok(KernelConfig {
            refresh_interval,
            flush_interval,
            queue_size,
            sockets: self.sockets,
            collectors,
        })
    }
}

fn positive_interval(section: &str, interval: Duration) -> Result<Duration, ConfigError> {
    if interval.is_zero() {
        return Err(ConfigError::InvalidInterval { section: section.to_string() });
    }
    Ok(interval)
}

fn positive_size(section: &str, size: i64) -> Result<usize, ConfigError> {
    match usize::try_from(size) {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidSize { section: section.to_string(), size }),
    }
}

/// Path of the config file: `SKALD_CONFIG` or `skald.yaml`
pub fn config_path() -> PathBuf {
    std::env::var("SKALD_CONFIG").unwrap_or_else(|_| "skald.yaml".into()).into()
}

pub async fn load_config(path: &Path) -> Result<KernelConfig, ConfigError> {
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    KernelConfig::from_yaml(&txt)
}

/// Human-readable durations ("500ms", "2s", "1m") through humantime
mod duration_str {
    use super::*;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
state:
  interval: 2s
storage:
  interval: 10s
  size: 100
collectors:
  cpu:
    interval: 1s
    size: 10
  nvidia:
    interval: 500ms
    size: 4
"#;

    #[test]
    fn test_full_config() {
        let cfg = KernelConfig::from_yaml(FULL).unwrap();
        assert_eq!(cfg.refresh_interval, Duration::from_secs(2));
        assert_eq!(cfg.flush_interval, Duration::from_secs(10));
        assert_eq!(cfg.queue_size, 100);
        assert_eq!(cfg.collectors["cpu"].size, 10);
        assert_eq!(cfg.collectors["nvidia"].interval, Duration::from_millis(500));
        assert_eq!(cfg.sockets.registration, PathBuf::from(DEFAULT_REGISTRATION_SOCKET));
        assert_eq!(cfg.sockets.query, PathBuf::from(DEFAULT_QUERY_SOCKET));
    }

    #[test]
    fn test_absent_section_disables_collector() {
        let yaml = FULL.replace("  nvidia:\n    interval: 500ms\n    size: 4\n", "");
        let cfg = KernelConfig::from_yaml(&yaml).unwrap();
        assert!(cfg.collectors.contains_key("cpu"));
        assert!(!cfg.collectors.contains_key("nvidia"));
    }

    #[test]
    fn test_no_collectors_is_fatal() {
        let yaml = "state:\n  interval: 2s\nstorage:\n  interval: 10s\n  size: 100\n";
        assert!(matches!(KernelConfig::from_yaml(yaml), Err(ConfigError::NoCollectors)));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let yaml = FULL.replace("interval: 1s", "interval: 0s");
        match KernelConfig::from_yaml(&yaml) {
            Err(ConfigError::InvalidInterval { section }) => assert_eq!(section, "collectors.cpu"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_negative_size_is_rejected() {
        let yaml = FULL.replace("size: 100", "size: -3");
        match KernelConfig::from_yaml(&yaml) {
            Err(ConfigError::InvalidSize { section, size }) => {
                assert_eq!(section, "storage");
                assert_eq!(size, -3);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_unparsable_duration_is_rejected() {
        let yaml = FULL.replace("interval: 2s", "interval: soon");
        assert!(matches!(KernelConfig::from_yaml(&yaml), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_socket_override() {
        let yaml = format!("{FULL}sockets:\n  registration: /run/skald/reg.sock\n");
        let cfg = KernelConfig::from_yaml(&yaml).unwrap();
        assert_eq!(cfg.sockets.registration, PathBuf::from("/run/skald/reg.sock"));
        assert_eq!(cfg.sockets.query, PathBuf::from(DEFAULT_QUERY_SOCKET));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("nope.yaml")).await.unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
