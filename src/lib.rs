//! Cask Embedded Analytic Store
//!
//! An embedded columnar store for semi-structured event records.
//! Writers append records to per-table ingestion logs; digestion
//! compacts the logs into immutable columnar blocks; queries scan
//! blocks in parallel and group/aggregate/sample the results.

pub mod config;
pub mod data;
pub mod flags;
pub mod hist;
pub mod query;
pub mod storage;
pub mod table;

// Re-export main types
pub use config::Settings;
pub use data::{ColType, Record, SavedRecord};
pub use flags::QueryFlags;
pub use hist::{Hist, HistKind, HistogramParameters};
pub use query::{LoadSpec, QueryParams, QueryResults, QuerySpec};
pub use table::Table;

/// Number of records written into a single column block.
pub const CHUNK_SIZE: usize = 8192;

/// Attempts made to grab a table lock before giving up.
pub const LOCK_TRIES: usize = 3;

/// Sleep between lock attempts.
pub const LOCK_SLEEP: std::time::Duration = std::time::Duration::from_millis(3);

/// Cap on per-block group map size during aggregation.
pub const INTERNAL_RESULT_LIMIT: usize = 100_000;

/// Default histogram bucket count when no bucket size is supplied.
pub const NUM_BUCKETS: i64 = 100;

/// Sort sentinel: order results by group count instead of a column.
pub const SORT_COUNT: &str = "$COUNT";

/// Storage engine error type
#[derive(Debug, thiserror::Error)]
pub enum CaskError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Lock contended: {0}")]
    LockContended(String),

    #[error("Key table inconsistency: {0}")]
    KeyTableInconsistency(String),

    #[error("Column type conflict on {column}: {existing:?} vs {incoming:?}")]
    TypeConflict {
        column: String,
        existing: data::ColType,
        incoming: data::ColType,
    },

    #[error("Missing column file: {0}")]
    MissingColumn(String),

    #[error("Query plan error: {0}")]
    PlanError(String),
}

pub type Result<T> = std::result::Result<T, CaskError>;
