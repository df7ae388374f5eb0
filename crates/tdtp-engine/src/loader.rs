//! Concurrent source loading.
//!
//! One task per source, bounded by the source's timeout and the
//! configured parallelism. TDTP file sources bypass the adapter layer
//! entirely; database sources connect through the registry and run
//! their configured query. The `on_source_error` policy decides whether
//! the first failure cancels the siblings or partial data flows on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tdtp_core::config::{ErrorHandlingConfig, ErrorPolicy, SourceConfig, SourceKind};
use tdtp_core::packet::Packet;
use tdtp_core::TdtpError;
use tdtp_io::adapter::AdapterRegistry;
use tdtp_io::tdtp_file;

/// One source's outcome. Under `on_source_error = continue` failed
/// sources travel as entries with a populated `error`.
#[derive(Debug)]
pub struct SourceData {
    pub name: String,
    pub packet: Option<Packet>,
    pub error: Option<TdtpError>,
    pub elapsed: Duration,
}

impl SourceData {
    pub fn rows(&self) -> u64 {
        self.packet
            .as_ref()
            .map(|p| p.header.record_count)
            .unwrap_or(0)
    }
}

pub struct Loader {
    registry: Arc<AdapterRegistry>,
    error_handling: ErrorHandlingConfig,
    parallel_sources: usize,
}

impl Loader {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        error_handling: ErrorHandlingConfig,
        parallel_sources: usize,
    ) -> Self {
        Loader {
            registry,
            error_handling,
            parallel_sources: parallel_sources.max(1),
        }
    }

    /// Load every source concurrently. Returns the results in source
    /// order; under the `fail` policy the first error cancels the rest
    /// and is returned directly.
    pub async fn load_all(
        &self,
        sources: &[SourceConfig],
        cancel: &CancellationToken,
    ) -> Result<Vec<SourceData>, TdtpError> {
        let semaphore = Arc::new(Semaphore::new(self.parallel_sources));
        let task_cancel = cancel.child_token();
        let mut join_set: JoinSet<(usize, SourceData)> = JoinSet::new();

        for (index, source) in sources.iter().enumerate() {
            let source = source.clone();
            let registry = Arc::clone(&self.registry);
            let error_handling = self.error_handling.clone();
            let semaphore = Arc::clone(&semaphore);
            let token = task_cancel.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let start = Instant::now();
                let result = load_with_retries(&registry, &source, &error_handling, &token).await;
                let data = match result {
                    Ok(packet) => {
                        info!(source = %source.name, rows = packet.header.record_count,
                              elapsed_ms = start.elapsed().as_millis() as u64, "source loaded");
                        SourceData {
                            name: source.name,
                            packet: Some(packet),
                            error: None,
                            elapsed: start.elapsed(),
                        }
                    }
                    Err(e) => {
                        warn!(source = %source.name, error = %e, "source failed");
                        SourceData {
                            name: source.name,
                            packet: None,
                            error: Some(e),
                            elapsed: start.elapsed(),
                        }
                    }
                };
                (index, data)
            });
        }

        let mut slots: Vec<Option<SourceData>> = (0..sources.len()).map(|_| None).collect();
        let mut first_error: Option<TdtpError> = None;
        while let Some(joined) = join_set.join_next().await {
            let (index, data) = joined
                .map_err(|e| TdtpError::Other(anyhow::anyhow!("loader task panicked: {e}")))?;
            if data.error.is_some()
                && self.error_handling.on_source_error == ErrorPolicy::Fail
                && first_error.is_none()
            {
                // first failure cancels the siblings
                task_cancel.cancel();
                first_error = Some(TdtpError::Source {
                    name: data.name.clone(),
                    message: data
                        .error
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                });
            }
            slots[index] = Some(data);
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(slots.into_iter().flatten().collect())
    }
}

/// One source with its timeout and linear-backoff retries.
async fn load_with_retries(
    registry: &AdapterRegistry,
    source: &SourceConfig,
    error_handling: &ErrorHandlingConfig,
    cancel: &CancellationToken,
) -> Result<Packet, TdtpError> {
    let timeout = Duration::from_secs(source.timeout_seconds.max(1));
    let attempts = 1 + error_handling.retry_attempts as u64;

    let mut last_error = None;
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(TdtpError::Cancelled(format!("source {}", source.name)));
        }
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(TdtpError::Cancelled(format!("source {}", source.name)));
            }
            result = tokio::time::timeout(timeout, load_once(registry, source)) => match result {
                Ok(result) => result,
                Err(_) => Err(TdtpError::Source {
                    name: source.name.clone(),
                    message: format!("timed out after {}s", timeout.as_secs()),
                }),
            },
        };
        match outcome {
            Ok(packet) => return Ok(packet),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                if attempt < attempts {
                    let delay = Duration::from_secs(error_handling.retry_delay_seconds * attempt);
                    warn!(source = %source.name, attempt, error = %e,
                          retry_in_s = delay.as_secs(), "source attempt failed");
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| TdtpError::Source {
        name: source.name.clone(),
        message: "no attempts were made".into(),
    }))
}

async fn load_once(
    registry: &AdapterRegistry,
    source: &SourceConfig,
) -> Result<Packet, TdtpError> {
    if source.kind == SourceKind::Tdtp {
        let dsn = source.dsn.clone();
        let name = source.name.clone();
        let multi_part = source.multi_part;
        return tokio::task::spawn_blocking(move || {
            if multi_part {
                tdtp_file::read_multi_part(&dsn, &name)
            } else {
                tdtp_file::read_single(&dsn, &name)
            }
        })
        .await
        .map_err(|e| TdtpError::Other(anyhow::anyhow!("file read task: {e}")))?
        .map_err(|e| e.with_context(&format!("source {}", source.name)));
    }

    let query = source.query.as_deref().ok_or_else(|| TdtpError::Config(format!(
        "source {}: query is required",
        source.name
    )))?;
    let adapter = registry.connect(source.kind, &source.dsn).await?;
    let result = adapter.execute_raw_query(query, &source.name).await;
    let _ = adapter.close().await;
    result.map_err(|e| e.with_context(&format!("source {}", source.name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdtp_core::config::SourceKind;
    use tdtp_core::generator::generate_reference;
    use tdtp_core::packet::{Field, Row, Schema};
    use tdtp_core::types::FieldType;
    use tdtp_core::wire::PacketFormat;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("v", FieldType::Text),
        ])
    }

    fn file_source(name: &str, dsn: &str, multi_part: bool) -> SourceConfig {
        SourceConfig {
            name: name.into(),
            kind: SourceKind::Tdtp,
            dsn: dsn.into(),
            query: None,
            timeout_seconds: 5,
            multi_part,
        }
    }

    fn loader(policy: ErrorPolicy) -> Loader {
        let error_handling = ErrorHandlingConfig {
            on_source_error: policy,
            ..ErrorHandlingConfig::default()
        };
        Loader::new(Arc::new(AdapterRegistry::new()), error_handling, 4)
    }

    #[tokio::test]
    async fn loads_file_sources_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a.xml");
        let path_b = dir.path().join("b.json");
        let packets = generate_reference("x", &schema(), vec![Row::new("1|a")]);
        tdtp_file::write_packet_files(&path_a, &packets, PacketFormat::Xml).unwrap();
        let packets = generate_reference("y", &schema(), vec![Row::new("2|b"), Row::new("3|c")]);
        tdtp_file::write_packet_files(&path_b, &packets, PacketFormat::Json).unwrap();

        let sources = vec![
            file_source("alpha", path_a.to_str().unwrap(), false),
            file_source("beta", path_b.to_str().unwrap(), false),
        ];
        let cancel = CancellationToken::new();
        let loaded = loader(ErrorPolicy::Fail)
            .load_all(&sources, &cancel)
            .await
            .unwrap();
        assert_eq!(loaded.len(), 2);
        // results come back in source order, renamed to the alias
        assert_eq!(loaded[0].name, "alpha");
        assert_eq!(loaded[0].packet.as_ref().unwrap().header.table, "alpha");
        assert_eq!(loaded[1].rows(), 2);
    }

    #[tokio::test]
    async fn multi_part_source_is_merged() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("set.xml");
        let rows: Vec<Row> = (0..3)
            .map(|i| Row::new(format!("{i}|{}", "x".repeat(tdtp_core::MAX_PART_BYTES / 2))))
            .collect();
        let packets = generate_reference("t", &schema(), rows);
        let written =
            tdtp_file::write_packet_files(&destination, &packets, PacketFormat::Xml).unwrap();

        let sources = vec![file_source("merged", written[0].to_str().unwrap(), true)];
        let cancel = CancellationToken::new();
        let loaded = loader(ErrorPolicy::Fail)
            .load_all(&sources, &cancel)
            .await
            .unwrap();
        assert_eq!(loaded[0].rows(), 3);
        assert_eq!(loaded[0].packet.as_ref().unwrap().header.table, "merged");
    }

    #[tokio::test]
    async fn fail_policy_returns_the_error() {
        let sources = vec![file_source("ghost", "/nonexistent/ghost.xml", false)];
        let cancel = CancellationToken::new();
        let err = loader(ErrorPolicy::Fail)
            .load_all(&sources, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TdtpError::Source { .. }), "{err}");
    }

    #[tokio::test]
    async fn continue_policy_collects_partial_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.xml");
        let packets = generate_reference("x", &schema(), vec![Row::new("1|a")]);
        tdtp_file::write_packet_files(&path, &packets, PacketFormat::Xml).unwrap();

        let sources = vec![
            file_source("good", path.to_str().unwrap(), false),
            file_source("bad", "/nonexistent/ghost.xml", false),
        ];
        let cancel = CancellationToken::new();
        let loaded = loader(ErrorPolicy::Continue)
            .load_all(&sources, &cancel)
            .await
            .unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded[0].error.is_none());
        assert!(loaded[1].error.is_some());
        assert!(loaded[1].packet.is_none());
    }

    #[tokio::test]
    async fn retries_apply_linear_backoff() {
        // a source that always fails, two retries with zero delay
        let error_handling = ErrorHandlingConfig {
            on_source_error: ErrorPolicy::Fail,
            retry_attempts: 2,
            retry_delay_seconds: 0,
            ..ErrorHandlingConfig::default()
        };
        let loader = Loader::new(Arc::new(AdapterRegistry::new()), error_handling, 1);
        let sources = vec![file_source("flaky", "/nonexistent/ghost.xml", false)];
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let err = loader.load_all(&sources, &cancel).await.unwrap_err();
        assert!(matches!(err, TdtpError::Source { .. }), "{err}");
        // three fast attempts, not a hang
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unregistered_adapter_is_a_config_error() {
        let sources = vec![SourceConfig {
            name: "db".into(),
            kind: SourceKind::Postgres,
            dsn: "postgres://nowhere/none".into(),
            query: Some("SELECT 1".into()),
            timeout_seconds: 2,
            multi_part: false,
        }];
        let cancel = CancellationToken::new();
        let err = loader(ErrorPolicy::Fail)
            .load_all(&sources, &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no adapter registered"), "{err}");
    }
}
