//! Error types for TDTP pipeline operations.
//!
//! One variant per error kind, so callers can apply per-kind policy
//! (source errors are retryable, schema mismatches are fatal for the
//! current batch, cancellation is terminal).

/// Error type shared by every TDTP component.
#[derive(Debug, thiserror::Error)]
pub enum TdtpError {
    /// Invalid or inconsistent pipeline configuration.
    ///
    /// Reported at parse/validate time and never recovered.
    #[error("config: {0}")]
    Config(String),

    /// Source connectivity or timeout failure.
    ///
    /// Subject to the `on_source_error` policy and retry settings.
    #[error("source {name}: {message}")]
    Source { name: String, message: String },

    /// Unknown field or cross-part invariant violation.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A value could not be parsed under its declared canonical type.
    #[error("value parse: {0}")]
    ValueParse(String),

    /// Primary-key / unique / check violation reported by a dialect.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Transformation SQL failure, subject to `on_transform_error`.
    #[error("transform: {0}")]
    Transform(String),

    /// Sink delivery failure, subject to `on_output_error`.
    #[error("output: {0}")]
    Output(String),

    /// The surrounding context was cancelled or its deadline expired.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Malformed packet document, checksum mismatch, bad part numbering.
    #[error("packet: {0}")]
    Packet(String),

    /// TDTQL lex/parse/execution failure.
    #[error("query: {0}")]
    Query(String),

    /// Generic error wrapper keeping context and backtraces.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TdtpError {
    /// Attach a `component.operation` prefix while keeping the variant,
    /// so policy dispatch upstream still sees the original kind.
    pub fn with_context(self, prefix: &str) -> Self {
        match self {
            TdtpError::Config(m) => TdtpError::Config(format!("{prefix}: {m}")),
            TdtpError::Source { name, message } => TdtpError::Source {
                name,
                message: format!("{prefix}: {message}"),
            },
            TdtpError::SchemaMismatch(m) => TdtpError::SchemaMismatch(format!("{prefix}: {m}")),
            TdtpError::ValueParse(m) => TdtpError::ValueParse(format!("{prefix}: {m}")),
            TdtpError::Constraint(m) => TdtpError::Constraint(format!("{prefix}: {m}")),
            TdtpError::Transform(m) => TdtpError::Transform(format!("{prefix}: {m}")),
            TdtpError::Output(m) => TdtpError::Output(format!("{prefix}: {m}")),
            TdtpError::Cancelled(m) => TdtpError::Cancelled(format!("{prefix}: {m}")),
            TdtpError::Packet(m) => TdtpError::Packet(format!("{prefix}: {m}")),
            TdtpError::Query(m) => TdtpError::Query(format!("{prefix}: {m}")),
            TdtpError::Other(e) => TdtpError::Other(e.context(prefix.to_string())),
        }
    }

    /// True when the error is a cancellation and must not be retried.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TdtpError::Cancelled(_))
    }
}
