//! # TDTP CLI - Declarative ETL Pipeline Runner
//!
//! Loads a YAML pipeline configuration, joins the configured sources in
//! an embedded SQL workspace, applies the transformation query and
//! ships the result to a file, spreadsheet or message broker.
//!
//! ## Usage
//!
//! ```bash
//! # Run a pipeline from a YAML configuration file
//! tdtp-cli --config pipelines/users-to-kafka.yml
//!
//! # Validate a configuration without executing it
//! tdtp-cli --config pipelines/users-to-kafka.yml --validate
//!
//! # Enable debug logging
//! RUST_LOG=debug tdtp-cli --config my-pipeline.yml
//! ```
//!
//! Exit codes: `0` success, `1` configuration error, `2` runtime error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tdtp_core::broker::TracingResultLog;
use tdtp_core::config::PipelineConfig;

#[derive(Parser, Debug)]
#[command(name = "tdtp-cli")]
#[command(about = "Declarative ETL pipeline runner")]
struct Args {
    /// Pipeline YAML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Parse and validate the configuration, then exit
    #[arg(long, default_value_t = false)]
    validate: bool,
}

const EXIT_CONFIG: u8 = 1;
const EXIT_RUNTIME: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = {
        let text = match std::fs::read_to_string(&args.config) {
            Ok(text) => text,
            Err(e) => {
                error!(path = %args.config.display(), error = %e, "cannot read configuration");
                return ExitCode::from(EXIT_CONFIG);
            }
        };
        match PipelineConfig::from_yaml(&text) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %args.config.display(), error = %e, "invalid configuration");
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    };
    if args.validate {
        info!(path = %args.config.display(), sources = config.sources.len(), "configuration is valid");
        return ExitCode::SUCCESS;
    }

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            ctrl_c_token.cancel();
        }
    });

    let processor = tdtp_engine::Processor::new(config).with_result_log(Arc::new(TracingResultLog));
    match processor.run(&cancel).await {
        Ok(stats) => {
            info!(
                sources = stats.sources_loaded,
                rows_in = stats.total_rows_loaded,
                rows_out = stats.total_rows_exported,
                errors = stats.errors.len(),
                duration_ms = stats.duration.as_millis() as u64,
                "done"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "pipeline failed");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}
