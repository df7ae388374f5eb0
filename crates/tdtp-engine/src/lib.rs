//! # TDTP Engine - Workspace, Loader and Pipeline Processor
//!
//! The execution half of a TDTP pipeline: the embedded SQL workspace
//! the sources are joined in, the concurrent loader that feeds it, the
//! streaming packet generator and broker importer, and the processor
//! that orchestrates one pipeline run end to end.

pub mod exporter;
pub mod importer;
pub mod loader;
pub mod processor;
pub mod stream_gen;
pub mod workspace;

pub use exporter::ExportReport;
pub use importer::{ImportStats, Importer, PacketHandler};
pub use loader::{Loader, SourceData};
pub use processor::{Processor, ProcessorStats};
pub use stream_gen::{PartResult, StreamSummary};
pub use workspace::{SqlStream, Workspace};
