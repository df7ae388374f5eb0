//! Pipeline orchestration.
//!
//! One run: open the workspace, load all sources, populate tables, run
//! the transformation SQL and ship the result. Broker sinks stream;
//! file and spreadsheet sinks buffer. Failure policy per stage comes
//! from the `error_handling` section.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tdtp_core::broker::{MessageBroker, ResultLog};
use tdtp_core::config::{ErrorPolicy, OutputConfig, PipelineConfig};
use tdtp_core::packet::Packet;
use tdtp_core::TdtpError;
use tdtp_io::adapter::AdapterRegistry;
use tdtp_io::broker_kafka::KafkaBroker;
use tdtp_io::broker_rabbit::RabbitBroker;

use crate::exporter;
use crate::loader::Loader;
use crate::stream_gen;
use crate::workspace::Workspace;

/// Accounting for one pipeline run.
#[derive(Debug, Clone)]
pub struct ProcessorStats {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,
    pub sources_loaded: usize,
    pub total_rows_loaded: u64,
    pub total_rows_exported: u64,
    pub errors: Vec<String>,
}

impl ProcessorStats {
    fn begin() -> Self {
        ProcessorStats {
            start_time: Utc::now(),
            end_time: Utc::now(),
            duration: Duration::ZERO,
            sources_loaded: 0,
            total_rows_loaded: 0,
            total_rows_exported: 0,
            errors: Vec::new(),
        }
    }

    fn finish(&mut self) {
        self.end_time = Utc::now();
        self.duration = (self.end_time - self.start_time)
            .to_std()
            .unwrap_or(Duration::ZERO);
    }
}

pub struct Processor {
    config: PipelineConfig,
    registry: Arc<AdapterRegistry>,
    result_log: Option<Arc<dyn ResultLog>>,
}

impl Processor {
    pub fn new(config: PipelineConfig) -> Self {
        Processor {
            config,
            registry: Arc::new(AdapterRegistry::with_defaults()),
            result_log: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<AdapterRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_result_log(mut self, result_log: Arc<dyn ResultLog>) -> Self {
        self.result_log = Some(result_log);
        self
    }

    /// Execute the pipeline once.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ProcessorStats, TdtpError> {
        let mut stats = ProcessorStats::begin();
        let result = self.run_inner(cancel, &mut stats).await;
        stats.finish();

        if let Some(log) = &self.result_log {
            if let Some(config) = &self.config.result_log {
                let state = match &result {
                    Ok(()) => format!(
                        "success: {} sources, {} rows in, {} rows out, {} errors",
                        stats.sources_loaded,
                        stats.total_rows_loaded,
                        stats.total_rows_exported,
                        stats.errors.len()
                    ),
                    Err(e) => format!("failed: {e}"),
                };
                if let Err(e) = log
                    .publish(&config.key, &state, Duration::from_secs(config.ttl_seconds))
                    .await
                {
                    warn!(error = %e, "result log publish failed");
                }
            }
        }

        match result {
            Ok(()) => {
                info!(
                    sources = stats.sources_loaded,
                    rows_in = stats.total_rows_loaded,
                    rows_out = stats.total_rows_exported,
                    duration_ms = stats.duration.as_millis() as u64,
                    "pipeline complete"
                );
                Ok(stats)
            }
            Err(e) => {
                error!(error = %e, "pipeline failed");
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        cancel: &CancellationToken,
        stats: &mut ProcessorStats,
    ) -> Result<(), TdtpError> {
        let config = &self.config;
        let workspace = Workspace::open(&config.workspace).await?;

        // ingest
        let loader = Loader::new(
            Arc::clone(&self.registry),
            config.error_handling.clone(),
            config.performance.parallel_sources,
        );
        let loaded = loader.load_all(&config.sources, cancel).await?;
        for data in &loaded {
            match (&data.packet, &data.error) {
                (Some(packet), _) => {
                    workspace.create_table(&data.name, &packet.schema).await?;
                    let rows = workspace.load_data(&data.name, packet).await?;
                    stats.sources_loaded += 1;
                    stats.total_rows_loaded += rows;
                }
                (None, Some(e)) => {
                    stats.errors.push(format!("source {}: {e}", data.name));
                }
                (None, None) => {}
            }
        }
        if stats.sources_loaded == 0 {
            return Err(TdtpError::Source {
                name: "loader".into(),
                message: "no source loaded successfully".into(),
            });
        }

        // transform + export
        let export_result = match &config.output {
            OutputConfig::Tdtp(output) => {
                let packet = self.transform_buffered(&workspace, cancel).await?;
                stats.total_rows_exported = packet.header.record_count;
                exporter::export_file(packet, output).await
            }
            OutputConfig::Xlsx(output) => {
                let packet = self.transform_buffered(&workspace, cancel).await?;
                stats.total_rows_exported = packet.header.record_count;
                exporter::export_xlsx(packet, output).await
            }
            OutputConfig::Kafka(output) => {
                let mut broker = KafkaBroker::new(&output.brokers, &output.topic);
                self.transform_streaming(&workspace, &mut broker, cancel, stats)
                    .await
            }
            OutputConfig::Rabbitmq(output) => {
                let mut broker = RabbitBroker::new(
                    &output.host,
                    output.port,
                    &output.user,
                    &output.password,
                    &output.queue,
                );
                self.transform_streaming(&workspace, &mut broker, cancel, stats)
                    .await
            }
        };
        workspace.close().await?;

        match export_result {
            Ok(report) => {
                stats.errors.extend(report.errors.iter().cloned());
                if let Some(e) = report.into_error() {
                    if config.error_handling.on_output_error == ErrorPolicy::Continue {
                        warn!(error = %e, "export finished with errors");
                    } else {
                        return Err(e);
                    }
                }
                Ok(())
            }
            Err(e) => {
                stats.errors.push(e.to_string());
                if config.error_handling.on_output_error == ErrorPolicy::Continue
                    && !e.is_cancelled()
                {
                    warn!(error = %e, "export failed, continuing per policy");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Buffered transform with timeout and the transform error policy.
    async fn transform_buffered(
        &self,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> Result<Packet, TdtpError> {
        let transform = &self.config.transform;
        let timeout = Duration::from_secs(transform.timeout_seconds.max(1));
        let attempts = match self.config.error_handling.on_transform_error {
            ErrorPolicy::Retry => 1 + self.config.error_handling.retry_attempts as u64,
            _ => 1,
        };

        let mut last = None;
        for attempt in 1..=attempts {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(TdtpError::Cancelled("transform".into())),
                result = tokio::time::timeout(
                    timeout,
                    workspace.execute_sql(&transform.sql, &transform.result_table),
                ) => match result {
                    Ok(result) => result,
                    Err(_) => Err(TdtpError::Transform(format!(
                        "timed out after {}s",
                        timeout.as_secs()
                    ))),
                },
            };
            match outcome {
                Ok(packet) => return Ok(packet),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    if attempt < attempts {
                        let delay = Duration::from_secs(
                            self.config.error_handling.retry_delay_seconds * attempt,
                        );
                        warn!(attempt, error = %e, "transform failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| TdtpError::Transform("no attempts were made".into())))
    }

    /// Streaming transform: workspace row channel → part generator →
    /// broker, all bounded. The transform timeout becomes a derived
    /// cancellation deadline.
    async fn transform_streaming(
        &self,
        workspace: &Workspace,
        broker: &mut dyn MessageBroker,
        cancel: &CancellationToken,
        stats: &mut ProcessorStats,
    ) -> Result<exporter::ExportReport, TdtpError> {
        let transform = &self.config.transform;
        broker.connect().await?;

        let stream_cancel = cancel.child_token();
        let deadline_token = stream_cancel.clone();
        let timeout = Duration::from_secs(transform.timeout_seconds.max(1));
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            deadline_token.cancel();
        });

        let stream = workspace
            .execute_sql_stream(&transform.sql, &transform.result_table, stream_cancel.clone())
            .await?;
        let (parts_rx, summary_rx) = stream_gen::generate(
            &stream.table,
            stream.schema.clone(),
            stream.rows,
            stream_cancel.clone(),
        );
        let report = exporter::export_stream_to_broker(
            broker,
            parts_rx,
            stream.errors,
            &self.config.error_handling,
        )
        .await;
        deadline.abort();
        let _ = broker.close().await;

        if let Ok(summary) = summary_rx.await {
            info!(
                parts = summary.total_parts,
                rows = summary.total_rows,
                "stream summary"
            );
        }
        stats.total_rows_exported = report.rows_sent;
        Ok(report)
    }
}
