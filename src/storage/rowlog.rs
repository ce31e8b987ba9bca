//! Append-only ingestion log
//!
//! Each ingest call writes one segment `<table>/ingest/<uuid>.db[.gz]`
//! holding a list of fully materialized records. Segment names are
//! opaque and ordering between segments is unspecified.

use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::encoding::{self, GZIP_EXT};
use crate::config::Settings;
use crate::data::SavedRecord;
use crate::Result;

pub const INGEST_DIR: &str = "ingest";

pub fn ingest_dir(table_dir: &Path) -> PathBuf {
    table_dir.join(INGEST_DIR)
}

/// Write one segment holding `records`. Returns the segment path.
pub fn append_segment(
    table_dir: &Path,
    records: &[SavedRecord],
    settings: &Settings,
) -> Result<PathBuf> {
    let ext = if settings.gzip {
        format!(".db{}", GZIP_EXT)
    } else {
        ".db".to_string()
    };
    let path = ingest_dir(table_dir).join(format!("{}{}", Uuid::new_v4().simple(), ext));
    encoding::encode(&path, &records)?;
    Ok(path)
}

fn is_segment(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let name = name.strip_suffix(GZIP_EXT).unwrap_or(name);
    name.ends_with(".db")
}

/// Enumerate segment files. Sorted by name for stable iteration, but
/// callers must not depend on any ordering between segments.
pub fn segment_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(paths),
    };
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_segment(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

pub fn segment_count(table_dir: &Path) -> usize {
    segment_paths(&ingest_dir(table_dir))
        .map(|p| p.len())
        .unwrap_or(0)
}

pub fn load_segment(path: &Path) -> Result<Vec<SavedRecord>> {
    encoding::decode(path)
}

/// Decode every segment in a directory, skipping unreadable ones with a
/// warning.
pub fn load_all(dir: &Path) -> Vec<SavedRecord> {
    let mut records = Vec::new();
    let paths = match segment_paths(dir) {
        Ok(paths) => paths,
        Err(e) => {
            log::warn!("can't enumerate ingestion log {:?}: {}", dir, e);
            return records;
        }
    };
    for path in paths {
        match load_segment(&path) {
            Ok(mut segment) => records.append(&mut segment),
            Err(e) => log::warn!("skipping broken log segment {:?}: {}", path, e),
        }
    }
    records
}
