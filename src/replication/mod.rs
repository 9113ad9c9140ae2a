//! Logical replication ingestion (C5, spec.md §4.5).

pub mod decode;
mod error;
pub mod ingester;
pub mod slot;

pub use error::Error;
pub use ingester::{IngestSink, Ingester, IngesterConfig, NullSink};
