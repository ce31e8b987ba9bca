//! Store configuration
//!
//! Every public operation takes an explicit [`Settings`] value; there is
//! no process-wide flag state. Constants live in the crate root.

use std::env;
use std::path::PathBuf;

use crate::CHUNK_SIZE;

/// Environment variable naming the table root directory.
pub const DIR_ENV_VAR: &str = "CASK_DIR";

/// What to do with an int value that falls outside a column's declared range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlierPolicy {
    /// Clamp the value into range and keep the record.
    Clip,
    /// Drop the whole record.
    Skip,
}

/// Store-wide configuration, threaded explicitly through the call graph.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory holding one subdirectory per table.
    pub dir: PathBuf,
    /// Write `.db.gz` files instead of plain `.db`.
    pub gzip: bool,
    /// Records per column block.
    pub chunk_size: usize,
    /// Flush the under-full final chunk during digestion instead of
    /// returning its records to the ingestion log.
    pub keep_last_chunk: bool,
    /// Default outlier handling; a per-call policy overrides this.
    pub skip_outliers: bool,
    /// Ingest triggers a digest once the segment count passes this.
    pub auto_digest_segments: usize,
    /// Recycle column unpack buffers across blocks.
    pub recycle_mem: bool,
    /// Also scan the ingestion log during queries.
    pub read_ingestion_log: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./db"),
            gzip: false,
            chunk_size: CHUNK_SIZE,
            keep_last_chunk: false,
            skip_outliers: false,
            auto_digest_segments: 128,
            recycle_mem: false,
            read_ingestion_log: false,
        }
    }
}

impl Settings {
    /// Settings with the table root taken from `CASK_DIR`, falling back
    /// to `./db`.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(dir) = env::var(DIR_ENV_VAR) {
            if !dir.is_empty() {
                settings.dir = PathBuf::from(dir);
            }
        }
        settings
    }

    /// The effective outlier policy for a write call.
    pub fn outlier_policy(&self, per_call: Option<OutlierPolicy>) -> OutlierPolicy {
        per_call.unwrap_or(if self.skip_outliers {
            OutlierPolicy::Skip
        } else {
            OutlierPolicy::Clip
        })
    }

    /// Directory of a named table.
    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.dir.join(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outlier_policy_precedence() {
        let mut settings = Settings::default();
        settings.skip_outliers = true;
        assert_eq!(settings.outlier_policy(None), OutlierPolicy::Skip);
        // Per-call policy wins over the column-wide default.
        assert_eq!(
            settings.outlier_policy(Some(OutlierPolicy::Clip)),
            OutlierPolicy::Clip
        );
    }

    #[test]
    fn test_default_chunk_size() {
        assert_eq!(Settings::default().chunk_size, CHUNK_SIZE);
    }
}
