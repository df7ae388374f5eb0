//! Pipeline configuration.
//!
//! A pipeline is described by one YAML document naming the sources, the
//! embedded workspace, the transformation query and the output sink.
//!
//! # Example
//!
//! ```yaml
//! sources:
//!   - name: users
//!     type: postgres
//!     dsn: "postgres://app@db/main"
//!     query: "SELECT * FROM users"
//!     timeout: 30
//!   - name: orders
//!     type: tdtp
//!     dsn: "./orders_part_1_of_3.xml"
//!     multi_part: true
//! workspace:
//!   type: sqlite
//!   mode: memory
//! transform:
//!   sql: "SELECT u.name, count(*) AS n FROM users u JOIN orders o ON o.user_id = u.id GROUP BY u.name"
//!   result_table: user_orders
//!   timeout: 60
//! output:
//!   type: tdtp
//!   format: xml
//!   compression: true
//!   destination: ./out/user_orders.xml
//! error_handling:
//!   on_source_error: continue
//!   retry_attempts: 2
//!   retry_delay_seconds: 5
//! ```

use serde::{Deserialize, Serialize};

use crate::error::TdtpError;
use crate::wire::PacketFormat;

/// Complete pipeline specification loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub sources: Vec<SourceConfig>,
    pub workspace: WorkspaceConfig,
    pub transform: TransformConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
    /// Optional terminal-state sink (keyed identifier + TTL).
    #[serde(default)]
    pub result_log: Option<ResultLogConfig>,
}

impl PipelineConfig {
    pub fn from_yaml(text: &str) -> Result<Self, TdtpError> {
        let config: PipelineConfig =
            serde_yaml::from_str(text).map_err(|e| TdtpError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks beyond what serde enforces.
    pub fn validate(&self) -> Result<(), TdtpError> {
        if self.sources.is_empty() {
            return Err(TdtpError::Config("at least one source is required".into()));
        }
        let mut names = std::collections::HashSet::new();
        for source in &self.sources {
            if source.name.is_empty() {
                return Err(TdtpError::Config("source name must not be empty".into()));
            }
            if !names.insert(source.name.as_str()) {
                return Err(TdtpError::Config(format!(
                    "duplicate source name {:?}",
                    source.name
                )));
            }
            if source.kind != SourceKind::Tdtp && source.query.is_none() {
                return Err(TdtpError::Config(format!(
                    "source {:?}: query is required for {} sources",
                    source.name,
                    source.kind.as_str()
                )));
            }
            if source.multi_part && source.kind != SourceKind::Tdtp {
                return Err(TdtpError::Config(format!(
                    "source {:?}: multi_part applies only to tdtp sources",
                    source.name
                )));
            }
        }
        if self.transform.sql.trim().is_empty() {
            return Err(TdtpError::Config("transform.sql must not be empty".into()));
        }
        if self.transform.result_table.trim().is_empty() {
            return Err(TdtpError::Config(
                "transform.result_table must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Supported source kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Postgres,
    Mssql,
    Mysql,
    Sqlite,
    /// An on-disk TDTP packet file; bypasses the adapter layer.
    Tdtp,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Postgres => "postgres",
            SourceKind::Mssql => "mssql",
            SourceKind::Mysql => "mysql",
            SourceKind::Sqlite => "sqlite",
            SourceKind::Tdtp => "tdtp",
        }
    }
}

/// One input source. The DSN is passed to the adapter unchanged; each
/// adapter defines its own DSN convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub dsn: String,
    /// Required unless `type = tdtp`.
    #[serde(default)]
    pub query: Option<String>,
    /// Per-source read deadline, seconds.
    #[serde(default = "default_source_timeout", rename = "timeout")]
    pub timeout_seconds: u64,
    /// The file is one part of a `<base>_part_<n>_of_<total>.<ext>` set.
    #[serde(default)]
    pub multi_part: bool,
}

fn default_source_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceKind {
    Sqlite,
}

impl Default for WorkspaceKind {
    fn default() -> Self {
        WorkspaceKind::Sqlite
    }
}

/// Embedded workspace settings. `mode` is either `memory` or a file
/// path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceConfig {
    #[serde(rename = "type", default)]
    pub kind: WorkspaceKind,
    #[serde(default = "default_workspace_mode")]
    pub mode: String,
}

fn default_workspace_mode() -> String {
    "memory".to_string()
}

impl WorkspaceConfig {
    pub fn is_memory(&self) -> bool {
        self.mode == "memory"
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        WorkspaceConfig {
            kind: WorkspaceKind::Sqlite,
            mode: default_workspace_mode(),
        }
    }
}

/// Transformation stage: SQL over the loaded source tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    pub sql: String,
    pub result_table: String,
    #[serde(default = "default_transform_timeout", rename = "timeout")]
    pub timeout_seconds: u64,
}

fn default_transform_timeout() -> u64 {
    300
}

/// Output sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputConfig {
    /// TDTP packet file.
    Tdtp(TdtpOutputConfig),
    Rabbitmq(RabbitmqOutputConfig),
    Kafka(KafkaOutputConfig),
    Xlsx(XlsxOutputConfig),
}

impl OutputConfig {
    /// Broker sinks stream; file sinks buffer.
    pub fn is_broker(&self) -> bool {
        matches!(self, OutputConfig::Rabbitmq(_) | OutputConfig::Kafka(_))
    }
}

// the output structs skip deny_unknown_fields: serde keeps the `type`
// tag in the buffered content of an internally tagged enum
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TdtpOutputConfig {
    #[serde(default = "default_packet_format")]
    pub format: PacketFormat,
    #[serde(default)]
    pub compression: bool,
    pub destination: String,
}

fn default_packet_format() -> PacketFormat {
    PacketFormat::Xml
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RabbitmqOutputConfig {
    pub host: String,
    #[serde(default = "default_amqp_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    pub queue: String,
}

fn default_amqp_port() -> u16 {
    5672
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaOutputConfig {
    pub brokers: Vec<String>,
    pub topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XlsxOutputConfig {
    pub destination: String,
    /// Worksheet name; defaults to the result table.
    #[serde(default)]
    pub sheet: Option<String>,
}

/// Resource tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerformanceConfig {
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_parallel_sources")]
    pub parallel_sources: usize,
}

fn default_max_memory_mb() -> u64 {
    512
}

fn default_batch_size() -> usize {
    500
}

fn default_parallel_sources() -> usize {
    4
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        PerformanceConfig {
            max_memory_mb: default_max_memory_mb(),
            batch_size: default_batch_size(),
            parallel_sources: default_parallel_sources(),
        }
    }
}

/// What to do when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// First failure aborts the pipeline.
    Fail,
    /// Collect failures and keep going with partial data.
    Continue,
    /// Retry with linear backoff, then fail.
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorHandlingConfig {
    #[serde(default = "default_policy")]
    pub on_source_error: ErrorPolicy,
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_policy")]
    pub on_transform_error: ErrorPolicy,
    #[serde(default = "default_policy")]
    pub on_output_error: ErrorPolicy,
}

fn default_policy() -> ErrorPolicy {
    ErrorPolicy::Fail
}

fn default_retry_delay() -> u64 {
    5
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        ErrorHandlingConfig {
            on_source_error: ErrorPolicy::Fail,
            retry_attempts: 0,
            retry_delay_seconds: default_retry_delay(),
            on_transform_error: ErrorPolicy::Fail,
            on_output_error: ErrorPolicy::Fail,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultLogConfig {
    /// Identifier the terminal state is published under.
    pub key: String,
    #[serde(default = "default_result_ttl")]
    pub ttl_seconds: u64,
}

fn default_result_ttl() -> u64 {
    86_400
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
sources:
  - name: users
    type: postgres
    dsn: "postgres://app@db/main"
    query: "SELECT * FROM users"
    timeout: 30
  - name: orders
    type: tdtp
    dsn: "./orders_part_1_of_3.xml"
    multi_part: true
workspace:
  type: sqlite
  mode: memory
transform:
  sql: "SELECT * FROM users"
  result_table: out
  timeout: 60
output:
  type: kafka
  brokers: ["localhost:9092"]
  topic: results
performance:
  batch_size: 250
error_handling:
  on_source_error: continue
  retry_attempts: 2
  retry_delay_seconds: 1
result_log:
  key: nightly-users
"#;

    #[test]
    fn full_document_parses() {
        let config = PipelineConfig::from_yaml(FULL).unwrap();
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].kind, SourceKind::Postgres);
        assert_eq!(config.sources[0].timeout_seconds, 30);
        assert!(config.sources[1].multi_part);
        assert!(config.workspace.is_memory());
        assert!(config.output.is_broker());
        assert_eq!(config.performance.batch_size, 250);
        assert_eq!(config.performance.parallel_sources, 4);
        assert_eq!(config.error_handling.on_source_error, ErrorPolicy::Continue);
        assert_eq!(config.result_log.unwrap().ttl_seconds, 86_400);
    }

    #[test]
    fn query_required_for_database_sources() {
        let bad = FULL.replace("    query: \"SELECT * FROM users\"\n", "");
        let err = PipelineConfig::from_yaml(&bad).unwrap_err();
        assert!(err.to_string().contains("query is required"), "{err}");
    }

    #[test]
    fn multi_part_only_for_tdtp() {
        let bad = FULL.replace("    timeout: 30", "    timeout: 30\n    multi_part: true");
        let err = PipelineConfig::from_yaml(&bad).unwrap_err();
        assert!(err.to_string().contains("multi_part"), "{err}");
    }

    #[test]
    fn duplicate_source_names_rejected() {
        let bad = FULL.replace("name: orders", "name: users");
        let err = PipelineConfig::from_yaml(&bad).unwrap_err();
        assert!(err.to_string().contains("duplicate source name"), "{err}");
    }

    #[test]
    fn unknown_fields_rejected() {
        let bad = FULL.replace("  mode: memory", "  mode: memory\n  flavor: vanilla");
        assert!(PipelineConfig::from_yaml(&bad).is_err());
    }

    #[test]
    fn file_output_variant() {
        let yaml = FULL.replace(
            "output:\n  type: kafka\n  brokers: [\"localhost:9092\"]\n  topic: results",
            "output:\n  type: tdtp\n  format: json\n  compression: true\n  destination: ./out.json",
        );
        let config = PipelineConfig::from_yaml(&yaml).unwrap();
        match config.output {
            OutputConfig::Tdtp(t) => {
                assert_eq!(t.format, PacketFormat::Json);
                assert!(t.compression);
            }
            other => panic!("expected tdtp output, got {other:?}"),
        }
        assert!(!PipelineConfig::from_yaml(&yaml)
            .unwrap()
            .output
            .is_broker());
    }
}
