//! Per-block query result cache
//!
//! A cache entry is a block's partial result, keyed by a stable
//! fingerprint of everything that shapes it: the load spec, the
//! compiled filters, the query parameters, and the block's identity
//! (name, record count, mtime). Entries are written under the block's
//! `cache/<fingerprint>` lock; a contended lock just skips the write.

use std::time::UNIX_EPOCH;

use serde::Serialize;

use super::{Aggregation, BlockPartial, LoadSpec, QuerySpec};
use crate::hist::HistogramParameters;
use crate::storage::encoding;
use crate::table::{BlockSummary, Table, CACHE_DIR};

/// Everything that determines a block's partial result.
#[derive(Serialize)]
struct CacheKey<'a> {
    load: &'a LoadSpec,
    filters: Vec<String>,
    groups: &'a [String],
    distincts: &'a [String],
    aggregations: &'a [Aggregation],
    order_by: &'a Option<String>,
    prune_by: &'a Option<String>,
    limit: usize,
    time_bucket: Option<i64>,
    time_col: &'a str,
    weight_col: &'a Option<String>,
    samples: bool,
    hist: HistogramParameters,
    block_name: &'a str,
    block_records: u32,
    block_mtime: u64,
}

fn block_mtime(table: &Table, summary: &BlockSummary) -> u64 {
    std::fs::metadata(table.dir().join(&summary.name))
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Stable fingerprint for one block under one query. None when the key
/// cannot be serialized.
pub fn fingerprint(
    table: &Table,
    summary: &BlockSummary,
    load: &LoadSpec,
    spec: &QuerySpec,
) -> Option<String> {
    let params = &spec.params;
    let key = CacheKey {
        load,
        filters: spec.filters.iter().map(|f| f.repr()).collect(),
        groups: &params.groups,
        distincts: &params.distincts,
        aggregations: &params.aggregations,
        order_by: &params.order_by,
        prune_by: &params.prune_by,
        limit: params.limit,
        time_bucket: params.time_bucket,
        time_col: &params.time_col,
        weight_col: &params.weight_col,
        samples: params.samples,
        hist: params.hist,
        block_name: &summary.name,
        block_records: summary.info.num_records,
        block_mtime: block_mtime(table, summary),
    };
    let bytes = bincode::serialize(&key).ok()?;
    Some(format!(
        "{:08x}{:08x}",
        crc32fast::hash(&bytes),
        bytes.len() as u32
    ))
}

fn cache_path(table: &Table, fingerprint: &str) -> std::path::PathBuf {
    table
        .dir()
        .join(CACHE_DIR)
        .join(format!("{}.db", fingerprint))
}

pub fn lookup(table: &Table, fingerprint: &str) -> Option<BlockPartial> {
    let path = cache_path(table, fingerprint);
    if !path.exists() {
        return None;
    }
    match encoding::decode(&path) {
        Ok(partial) => Some(partial),
        Err(e) => {
            log::warn!("unreadable cache entry {:?}: {}", path, e);
            None
        }
    }
}

pub fn store(table: &Table, fingerprint: &str, partial: &BlockPartial) {
    let lock = table.lock(&format!("{}/{}", CACHE_DIR, fingerprint));
    if !lock.grab() {
        return;
    }
    let path = cache_path(table, fingerprint);
    if let Err(e) = encoding::encode_atomic(&path, partial) {
        log::warn!("can't write cache entry {:?}: {}", path, e);
    }
    if let Err(e) = lock.release() {
        log::warn!("can't release cache lock {}: {}", fingerprint, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::data::SavedRecord;
    use crate::query::{AggOp, LoadSpec, QueryParams};
    use crate::table::Table;
    use tempfile::tempdir;

    fn cached_query_table(dir: &std::path::Path) -> Table {
        let mut settings = Settings::default();
        settings.dir = dir.to_path_buf();
        settings.chunk_size = 50;
        let mut t = Table::open(settings, "events");
        let records: Vec<SavedRecord> = (0..100)
            .map(|i| SavedRecord::new().int("age", 10 + i % 5).int("id", i))
            .collect();
        t.ingest(&records).unwrap();
        t.digest_records().unwrap();

        let mut nt = Table::open(t.settings.clone(), "events");
        nt.load_info().unwrap();
        nt
    }

    fn avg_spec() -> (LoadSpec, QuerySpec) {
        let mut load = LoadSpec::new();
        load.int("age");
        let mut params = QueryParams::new();
        params.aggregations = vec![Aggregation {
            col: "age".to_string(),
            op: AggOp::Avg,
        }];
        params.cache_queries = true;
        (load, QuerySpec { params, filters: Vec::new() })
    }

    #[test]
    fn test_fingerprint_stability_and_sensitivity() {
        let dir = tempdir().unwrap();
        let t = cached_query_table(dir.path());
        let (load, spec) = avg_spec();
        let summary = &t.blocks[0];

        let fp1 = fingerprint(&t, summary, &load, &spec).unwrap();
        let fp2 = fingerprint(&t, summary, &load, &spec).unwrap();
        assert_eq!(fp1, fp2);

        // A different query shape fingerprints differently.
        let (load2, mut spec2) = avg_spec();
        spec2.params.groups = vec!["id".to_string()];
        let fp3 = fingerprint(&t, summary, &load2, &spec2).unwrap();
        assert_ne!(fp1, fp3);

        // A different block fingerprints differently.
        let fp4 = fingerprint(&t, &t.blocks[1], &load, &spec).unwrap();
        assert_ne!(fp1, fp4);
    }

    #[test]
    fn test_store_and_lookup_roundtrip() {
        let dir = tempdir().unwrap();
        let t = cached_query_table(dir.path());
        let (load, spec) = avg_spec();
        let fp = fingerprint(&t, &t.blocks[0], &load, &spec).unwrap();

        assert!(lookup(&t, &fp).is_none());

        let mut partial = BlockPartial::default();
        partial
            .results
            .insert("total".to_string(), crate::query::GroupResult::new("total"));
        store(&t, &fp, &partial);

        let back = lookup(&t, &fp).unwrap();
        assert!(back.results.contains_key("total"));
    }

    #[test]
    fn test_cached_query_matches_uncached() {
        let dir = tempdir().unwrap();
        let t = cached_query_table(dir.path());
        let (load, spec) = avg_spec();

        // First run populates the cache, second run reads it.
        let first = t.load_and_query(&load, &spec).unwrap();
        let cache_entries = std::fs::read_dir(t.dir().join(CACHE_DIR)).unwrap().count();
        assert!(cache_entries >= t.blocks.len());

        let second = t.load_and_query(&load, &spec).unwrap();
        let g1 = first.results.get("total").unwrap();
        let g2 = second.results.get("total").unwrap();
        assert_eq!(g1.count, g2.count);
        assert!((g1.agg_value("age") - g2.agg_value("age")).abs() < 1e-9);
    }
}
