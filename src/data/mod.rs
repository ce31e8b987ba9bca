//! Record model
//!
//! Records travel in two shapes: [`SavedRecord`] is the fully
//! materialized form written to the ingestion log, and [`Record`] is
//! the dense in-memory form bound to a block's dictionaries.

mod record;

pub use record::{ColType, KeyId, Record, SavedRecord};
