//! Service configuration loaded from a flat properties file
//!
//! The file uses Java-properties syntax. A logical line holds one `key=value`,
//! `key: value` or `key value` pair and may continue over a trailing
//! backslash; `#` and `!` start comments. Only the identity keys are
//! required; everything else falls back to the defaults below.

use crate::credentials::StaticCredentials;
use crate::error::ConfigError;
use crate::worker::InitialPosition;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable naming the properties file
pub const CONFIG_FILE_ENV: &str = "CONFIG_FILE";

pub const DEFAULT_METRICS_PORT: u16 = 8090;
pub const DEFAULT_IDLE_TIME_BETWEEN_READS: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_RECORDS: i32 = 10_000;

/// Configuration for the whole service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Application name; also the default checkpoint table name
    pub application_name: String,
    /// Name of the Kinesis stream to consume
    pub stream_name: String,
    /// Identity of this worker in logs and checkpoints
    pub worker_id: String,
    /// Explicit credentials, or `None` to use the default provider chain
    pub credentials: Option<StaticCredentials>,
    pub region: Option<String>,
    pub kinesis_endpoint: Option<String>,
    /// Sleep between two GetRecords calls on the same shard
    pub idle_time_between_reads: Duration,
    /// Port of the Prometheus scrape endpoint
    pub metrics_port: u16,
    /// Maximum records requested per GetRecords call
    pub max_records: i32,
    /// Where to start reading shards that have no checkpoint
    pub initial_position: InitialPosition,
    /// Table holding the per-shard checkpoints
    pub checkpoint_table: String,
    /// Deliver batches to processors even when GetRecords returned nothing
    pub call_process_records_even_for_empty_list: bool,
    /// Keep a closed shard's series instead of dropping them at shard end
    pub keep_metrics_on_shard_end: bool,
}

impl ServiceConfig {
    /// Locate the properties file from `CONFIG_FILE` or the first CLI argument and load it
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_FILE_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .or_else(|| std::env::args().nth(1))
            .ok_or(ConfigError::MissingConfigFile)?;

        Self::load(path)
    }

    /// Read and parse a properties file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;

        info!(path = %path.display(), "Loaded configuration file");
        Self::from_properties(&parse_properties(&contents))
    }

    /// Build the configuration from an already-parsed key/value mapping
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let application_name = required(props, "appName")?;
        let stream_name = required(props, "kinesisInputStream")?;
        let worker_id = required(props, "workerId")?;

        let credentials = match (optional(props, "accessKey"), optional(props, "secretKey")) {
            (Some(access_key), Some(secret_key)) => {
                Some(StaticCredentials::new(access_key, secret_key))
            }
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::MissingKey("secretKey")),
            (None, Some(_)) => return Err(ConfigError::MissingKey("accessKey")),
        };

        let idle_millis: u64 = parsed(
            props,
            "idleTimeBetweenReadsInMillis",
            DEFAULT_IDLE_TIME_BETWEEN_READS.as_millis() as u64,
        )?;

        let max_records: i32 = parsed(props, "maxRecords", DEFAULT_MAX_RECORDS)?;
        if !(1..=DEFAULT_MAX_RECORDS).contains(&max_records) {
            return Err(ConfigError::InvalidValue {
                key: "maxRecords",
                value: max_records.to_string(),
                reason: format!("must be between 1 and {}", DEFAULT_MAX_RECORDS),
            });
        }

        let initial_position = match optional(props, "initialPositionInStream") {
            None => InitialPosition::Latest,
            Some(value) => match value.to_ascii_uppercase().as_str() {
                "LATEST" => InitialPosition::Latest,
                "TRIM_HORIZON" => InitialPosition::TrimHorizon,
                "AT_TIMESTAMP" => {
                    InitialPosition::AtTimestamp(timestamp(props, "initialPositionTimestamp")?)
                }
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "initialPositionInStream",
                        value,
                        reason: "expected LATEST, TRIM_HORIZON or AT_TIMESTAMP".to_string(),
                    })
                }
            },
        };

        let checkpoint_table =
            optional(props, "checkpointTable").unwrap_or_else(|| application_name.clone());

        let config = Self {
            application_name,
            stream_name,
            worker_id,
            credentials,
            region: optional(props, "regionName"),
            kinesis_endpoint: optional(props, "kinesisEndpoint"),
            idle_time_between_reads: Duration::from_millis(idle_millis),
            metrics_port: parsed(props, "prometheusPort", DEFAULT_METRICS_PORT)?,
            max_records,
            initial_position,
            checkpoint_table,
            call_process_records_even_for_empty_list: parsed(
                props,
                "callProcessRecordsEvenForEmptyRecordList",
                false,
            )?,
            keep_metrics_on_shard_end: parsed(props, "keepMetricsOnShardEnd", false)?,
        };

        debug!(
            application = %config.application_name,
            stream = %config.stream_name,
            worker_id = %config.worker_id,
            metrics_port = config.metrics_port,
            "Configuration parsed"
        );

        Ok(config)
    }
}

/// Parse Java-properties style text into a flat mapping.
///
/// Later keys override earlier ones. Lines without a key are logged and skipped.
pub fn parse_properties(contents: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    let mut lines = contents.lines();

    while let Some(line) = lines.next() {
        let mut logical = line.trim_start().to_string();
        if logical.is_empty() || logical.starts_with('#') || logical.starts_with('!') {
            continue;
        }
        while continues(&logical) {
            logical.pop();
            match lines.next() {
                Some(next) => logical.push_str(next.trim_start()),
                None => break,
            }
        }

        match split_property(&logical) {
            Some((key, value)) => {
                props.insert(key, value);
            }
            None => warn!(line = %logical, "Skipping properties line without a key"),
        }
    }
    props
}

/// An odd number of trailing backslashes joins the next line
fn continues(line: &str) -> bool {
    line.chars().rev().take_while(|c| *c == '\\').count() % 2 == 1
}

/// Split at the first unescaped `=`, `:` or whitespace
fn split_property(line: &str) -> Option<(String, String)> {
    let mut key = String::new();
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    key.push(unescape_char(escaped));
                }
            }
            '=' | ':' => break,
            c if c.is_whitespace() => {
                while chars.next_if(|c| c.is_whitespace()).is_some() {}
                chars.next_if(|c| *c == '=' || *c == ':');
                break;
            }
            c => key.push(c),
        }
    }

    if key.is_empty() {
        return None;
    }
    let rest: String = chars.collect();
    Some((key, unescape(rest.trim_start())))
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push(unescape_char(escaped));
                }
            }
            c => out.push(c),
        }
    }
    out
}

fn unescape_char(c: char) -> char {
    match c {
        't' => '\t',
        'n' => '\n',
        'r' => '\r',
        'f' => '\u{c}',
        other => other,
    }
}

fn optional(props: &HashMap<String, String>, key: &str) -> Option<String> {
    props
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(props: &HashMap<String, String>, key: &'static str) -> Result<String, ConfigError> {
    optional(props, key).ok_or(ConfigError::MissingKey(key))
}

fn timestamp(props: &HashMap<String, String>, key: &'static str) -> Result<DateTime<Utc>, ConfigError> {
    let value = required(props, key)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ConfigError::InvalidValue {
            key,
            reason: e.to_string(),
            value,
        })
}

fn parsed<T>(props: &HashMap<String, String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(props, key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "
# consumer identity
appName = telemetry-app
kinesisInputStream: clickstream
workerId=worker-1
! credentials
accessKey=AKIDEXAMPLE
secretKey=secret
regionName=eu-west-1
idleTimeBetweenReadsInMillis=250
prometheusPort=9100
";

    #[test]
    fn test_parse_properties() {
        let props = parse_properties(SAMPLE);
        assert_eq!(props.get("appName").map(String::as_str), Some("telemetry-app"));
        assert_eq!(props.get("kinesisInputStream").map(String::as_str), Some("clickstream"));
        assert_eq!(props.get("workerId").map(String::as_str), Some("worker-1"));
        assert!(!props.contains_key("# consumer identity"));
        assert_eq!(props.len(), 8);
    }

    #[test]
    fn test_full_config() {
        let config = ServiceConfig::from_properties(&parse_properties(SAMPLE)).unwrap();
        assert_eq!(config.application_name, "telemetry-app");
        assert_eq!(config.stream_name, "clickstream");
        assert_eq!(config.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.kinesis_endpoint, None);
        assert_eq!(config.idle_time_between_reads, Duration::from_millis(250));
        assert_eq!(config.metrics_port, 9100);
        assert_eq!(config.checkpoint_table, "telemetry-app");
        assert!(config.credentials.is_some());
        assert!(matches!(config.initial_position, InitialPosition::Latest));
    }

    #[test]
    fn test_defaults() {
        let props = parse_properties("appName=a\nkinesisInputStream=s\nworkerId=w\n");
        let config = ServiceConfig::from_properties(&props).unwrap();
        assert_eq!(config.metrics_port, DEFAULT_METRICS_PORT);
        assert_eq!(config.idle_time_between_reads, DEFAULT_IDLE_TIME_BETWEEN_READS);
        assert_eq!(config.max_records, DEFAULT_MAX_RECORDS);
        assert!(config.credentials.is_none());
        assert!(!config.call_process_records_even_for_empty_list);
    }

    #[test]
    fn test_missing_identity_is_fatal() {
        let props = parse_properties("appName=a\nworkerId=w\n");
        let err = ServiceConfig::from_properties(&props).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("kinesisInputStream")));

        let props = parse_properties("appName=a\nkinesisInputStream=s\nworkerId=\n");
        let err = ServiceConfig::from_properties(&props).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("workerId")));
    }

    #[test]
    fn test_invalid_values() {
        let base = "appName=a\nkinesisInputStream=s\nworkerId=w\n";

        let props = parse_properties(&format!("{}prometheusPort=eighty", base));
        let err = ServiceConfig::from_properties(&props).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "prometheusPort", .. }));

        let props = parse_properties(&format!("{}initialPositionInStream=EARLIEST", base));
        let err = ServiceConfig::from_properties(&props).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "initialPositionInStream", .. }));

        let props = parse_properties(&format!("{}initialPositionInStream=AT_TIMESTAMP", base));
        let err = ServiceConfig::from_properties(&props).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("initialPositionTimestamp")));

        let props = parse_properties(&format!(
            "{}initialPositionInStream=AT_TIMESTAMP\ninitialPositionTimestamp=yesterday",
            base
        ));
        let err = ServiceConfig::from_properties(&props).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "initialPositionTimestamp", .. }));

        let props = parse_properties(&format!("{}accessKey=only-half", base));
        let err = ServiceConfig::from_properties(&props).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("secretKey")));
    }

    #[test]
    fn test_java_properties_forms() {
        let props = parse_properties(
            "appName telemetry-app\n\
             kinesisInputStream   :   clickstream\n\
             path\\=with\\:separators=value\n\
             spaced\\ key = spaced value\n\
             shards = a, \\\n\
                      b\n\
             = orphan\n\
             flag\n",
        );

        assert_eq!(props.get("appName").map(String::as_str), Some("telemetry-app"));
        assert_eq!(props.get("kinesisInputStream").map(String::as_str), Some("clickstream"));
        assert_eq!(props.get("path=with:separators").map(String::as_str), Some("value"));
        assert_eq!(props.get("spaced key").map(String::as_str), Some("spaced value"));
        assert_eq!(props.get("shards").map(String::as_str), Some("a, b"));
        assert_eq!(props.get("flag").map(String::as_str), Some(""));
        assert_eq!(props.len(), 6);
    }

    #[test]
    fn test_at_timestamp_and_metrics_retention() {
        let props = parse_properties(
            "appName=a\nkinesisInputStream=s\nworkerId=w\n\
             initialPositionInStream=at_timestamp\n\
             initialPositionTimestamp=2024-03-01T12:00:00Z\n\
             keepMetricsOnShardEnd=true\n",
        );
        let config = ServiceConfig::from_properties(&props).unwrap();

        let expected = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(config.initial_position, InitialPosition::AtTimestamp(expected));
        assert!(config.keep_metrics_on_shard_end);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ServiceConfig::load("/nonexistent/consumer.properties").unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
    }
}
