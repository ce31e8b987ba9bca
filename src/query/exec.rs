//! Parallel scan, aggregation and merge
//!
//! One task per block; each task loads the columns the plan needs,
//! filters and aggregates into a shared-nothing partial map, and the
//! partials are merged once every block is done. Block failures skip
//! the block, record failures skip the record.

use rayon::prelude::*;

use super::cache;
use super::{
    AggOp, BlockPartial, GroupResult, LoadSpec, QueryParams, QueryResults, QuerySpec, ResultMap,
};
use crate::data::{ColType, KeyId};
use crate::hist::Hist;
use crate::storage::column::BufferPool;
use crate::storage::rowlog;
use crate::table::{IntInfo, Table, TableBlock};
use crate::{Result, INTERNAL_RESULT_LIMIT, SORT_COUNT};

/// A query plan: the load spec plus every column resolved to a key id.
pub(crate) struct Plan {
    pub load: LoadSpec,
    pub groups: Vec<(String, Option<KeyId>)>,
    pub aggs: Vec<(String, Option<KeyId>, AggOp, IntInfo)>,
    pub time_key: Option<KeyId>,
    pub weight_key: Option<KeyId>,
    pub distinct_mode: bool,
}

fn build_plan(table: &Table, load: &LoadSpec, spec: &QuerySpec) -> Plan {
    let params = &spec.params;
    let mut load = load.clone();

    // Filters expose the columns they reference.
    for filter in &spec.filters {
        match filter {
            super::Filter::Int { col, .. } => load.int(col),
            super::Filter::Str { col, .. } => load.str(col),
            super::Filter::Set { col, .. } => load.set(col),
        }
    }

    let distinct_mode = !params.distincts.is_empty();
    let group_cols: &[String] = if distinct_mode {
        &params.distincts
    } else {
        &params.groups
    };
    let groups = group_cols
        .iter()
        .map(|col| {
            match table.col_type(col) {
                ColType::Str => load.str(col),
                ColType::Int => load.int(col),
                _ => {}
            }
            (col.clone(), table.get_key_id(col))
        })
        .collect();

    let aggs = params
        .aggregations
        .iter()
        .map(|agg| {
            load.int(&agg.col);
            let range = table
                .int_info_for(&agg.col)
                .unwrap_or(IntInfo { min: 0, max: 0 });
            (agg.col.clone(), table.get_key_id(&agg.col), agg.op, range)
        })
        .collect();

    for col in [&params.order_by, &params.prune_by].into_iter().flatten() {
        if col != SORT_COUNT {
            load.int(col);
        }
    }

    let time_key = if params.time_bucket.is_some() {
        load.int(&params.time_col);
        table.get_key_id(&params.time_col)
    } else {
        None
    };

    let weight_key = match &params.weight_col {
        Some(col) => {
            load.int(col);
            table.get_key_id(col)
        }
        None => None,
    };

    if params.samples {
        load.load_all = true;
    }

    Plan {
        load,
        groups,
        aggs,
        time_key,
        weight_key,
        distinct_mode,
    }
}

fn bump(partial: &mut BlockPartial, reason: &str) {
    *partial.diagnostics.entry(reason.to_string()).or_insert(0) += 1;
}

fn scan_block(table: &Table, block: &TableBlock, spec: &QuerySpec, plan: &Plan) -> BlockPartial {
    let params = &spec.params;
    let mut partial = BlockPartial::default();
    let mut key_buf = String::new();
    let mut group_limit_hits = 0u64;

    'records: for row in 0..block.num_records() {
        for filter in &spec.filters {
            if !filter.matches(block, row) {
                continue 'records;
            }
        }

        // Samples collect whole records instead of aggregating,
        // first-wins up to the limit.
        if params.samples {
            if partial.samples.len() < params.limit {
                partial.samples.push(block.materialize(table, row));
            }
            continue;
        }

        // Group key: colon-joined string forms, empty segment for a
        // missing value.
        key_buf.clear();
        if plan.groups.is_empty() {
            key_buf.push_str("total");
        }
        for (col, key) in &plan.groups {
            if let Some(value) = block.group_str(*key, row) {
                let mut value = value;
                for rep in &params.str_replace {
                    if rep.col == *col {
                        value = rep.find.replace_all(&value, rep.replace.as_str()).to_string();
                    }
                }
                key_buf.push_str(&value);
            }
            key_buf.push(':');
        }

        // Time bucketing selects the per-bucket map and prefixes the
        // group key with the bucket.
        let result_map = match params.time_bucket {
            Some(bucket_size) => {
                let t = match block.int_val(plan.time_key, row) {
                    Some(t) => t,
                    None => {
                        bump(&mut partial, "missing_time_value");
                        continue;
                    }
                };
                let bucket = (t / bucket_size) * bucket_size;
                key_buf = format!("{}:{}", bucket, key_buf);
                partial.time_results.entry(bucket).or_default()
            }
            None => &mut partial.results,
        };

        if !result_map.contains_key(&key_buf) {
            if result_map.len() >= INTERNAL_RESULT_LIMIT {
                group_limit_hits += 1;
                continue;
            }
            result_map.insert(key_buf.clone(), GroupResult::new(&key_buf));
        }
        let result = result_map.get_mut(&key_buf).expect("group just inserted");

        let weight = block.int_val(plan.weight_key, row).unwrap_or(1);
        result.count += weight;

        if plan.distinct_mode {
            continue;
        }

        for (col, key, op, range) in &plan.aggs {
            let value = match block.int_val(*key, row) {
                Some(v) => v,
                None => continue,
            };
            match op {
                AggOp::Avg => {
                    result.avgs.entry(col.clone()).or_default().add(value, weight);
                }
                AggOp::Hist => {
                    result
                        .hists
                        .entry(col.clone())
                        .or_insert_with(|| Hist::new(&params.hist, range.min, range.max))
                        .add_weighted_value(value, weight);
                }
            }
        }
    }

    if group_limit_hits > 0 {
        *partial
            .diagnostics
            .entry("group_limit_reached".to_string())
            .or_insert(0) += group_limit_hits;
    }
    partial
}

/// Trim a per-block partial to the top `limit` groups by the prune
/// column, to bound memory before the merge.
fn prune_partial(map: &mut ResultMap, params: &QueryParams) {
    let prune_by = match &params.prune_by {
        Some(col) if params.order_by.as_deref() != Some(col.as_str()) => col,
        _ => return,
    };
    if map.len() <= params.limit {
        return;
    }

    let mut entries: Vec<(String, GroupResult)> = map.drain().collect();
    if prune_by == SORT_COUNT {
        entries.sort_by(|a, b| b.1.count.cmp(&a.1.count));
    } else {
        entries.sort_by(|a, b| {
            b.1.agg_value(prune_by)
                .partial_cmp(&a.1.agg_value(prune_by))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    entries.truncate(params.limit);
    map.extend(entries);
}

fn merge_into(target: &mut ResultMap, partial: ResultMap) {
    for (key, group) in partial {
        match target.get_mut(&key) {
            Some(existing) => existing.merge(&group),
            None => {
                if target.len() < INTERNAL_RESULT_LIMIT {
                    target.insert(key, group);
                }
            }
        }
    }
}

fn sort_results(results: &ResultMap, params: &QueryParams) -> Vec<GroupResult> {
    let order_by = match &params.order_by {
        Some(col) => col,
        None => return Vec::new(),
    };
    let mut sorted: Vec<GroupResult> = results.values().cloned().collect();
    if order_by == SORT_COUNT {
        sorted.sort_by(|a, b| b.count.cmp(&a.count));
    } else {
        sorted.sort_by(|a, b| {
            b.agg_value(order_by)
                .partial_cmp(&a.agg_value(order_by))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    sorted.truncate(params.limit);
    sorted
}

impl Table {
    /// Run a query: plan, scan blocks in parallel, merge, order, trim.
    pub fn load_and_query(&self, load: &LoadSpec, spec: &QuerySpec) -> Result<QueryResults> {
        self.verify_key_table()?;
        let plan = build_plan(self, load, spec);
        let params = &spec.params;
        let pool = if self.settings.recycle_mem {
            Some(BufferPool::default())
        } else {
            None
        };

        let mut partials: Vec<BlockPartial> = self
            .blocks
            .par_iter()
            .filter_map(|summary| {
                let fingerprint = if params.cache_queries {
                    cache::fingerprint(self, summary, &plan.load, spec)
                } else {
                    None
                };
                if let Some(fp) = &fingerprint {
                    if let Some(partial) = cache::lookup(self, fp) {
                        log::debug!("cache hit for block {}", summary.name);
                        return Some(partial);
                    }
                }

                let block = match TableBlock::load(self, summary, &plan.load, pool.as_ref()) {
                    Ok(block) => block,
                    Err(e) => {
                        log::warn!("skipping block {}: {}", summary.name, e);
                        return None;
                    }
                };
                let mut partial = scan_block(self, &block, spec, &plan);
                if let Some(pool) = pool.as_ref() {
                    block.recycle(pool);
                }
                prune_partial(&mut partial.results, params);

                if let Some(fp) = &fingerprint {
                    cache::store(self, fp, &partial);
                }
                Some(partial)
            })
            .collect();

        // The ingestion log is scanned through the same code path, via
        // an in-memory block.
        if self.settings.read_ingestion_log {
            let records = rowlog::load_all(&rowlog::ingest_dir(&self.dir()));
            if !records.is_empty() {
                let mut scratch = self.clone();
                match TableBlock::from_records(&mut scratch, &records) {
                    Ok(block) => {
                        // Undigested columns get their key ids from the
                        // scratch table; rebind the plan and filters to it.
                        let log_spec = QuerySpec {
                            params: spec.params.clone(),
                            filters: spec.filters.iter().map(|f| f.rebind(&scratch)).collect(),
                        };
                        let log_plan = build_plan(&scratch, load, &log_spec);
                        let mut partial = scan_block(&scratch, &block, &log_spec, &log_plan);
                        prune_partial(&mut partial.results, params);
                        partials.push(partial);
                    }
                    Err(e) => log::warn!("skipping ingestion log: {}", e),
                }
            }
        }

        let mut out = QueryResults::default();
        for partial in partials {
            merge_into(&mut out.results, partial.results);
            for (bucket, map) in partial.time_results {
                merge_into(out.time_results.entry(bucket).or_default(), map);
            }
            out.samples.extend(partial.samples);
            for (reason, count) in partial.diagnostics {
                *out.diagnostics.entry(reason).or_insert(0) += count;
            }
        }
        out.samples.truncate(params.limit);

        if plan.distinct_mode {
            for group in out.results.values_mut() {
                group.count = 1;
            }
        }

        out.sorted = sort_results(&out.results, params);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::data::SavedRecord;
    use crate::hist::{HistKind, HistogramParameters};
    use crate::query::{build_filters, Aggregation, FilterSpec};
    use rand::Rng;
    use std::path::Path;
    use tempfile::tempdir;

    fn test_table(dir: &Path) -> Table {
        let mut settings = Settings::default();
        settings.dir = dir.to_path_buf();
        settings.chunk_size = 100;
        Table::open(settings, "events")
    }

    /// 300 records over 3 blocks: id 0..300, age in [10, 30), age_str,
    /// id_set.
    fn digested_table(dir: &Path) -> Table {
        let mut rng = rand::thread_rng();
        let mut t = test_table(dir);
        let records: Vec<SavedRecord> = (0..300)
            .map(|i| {
                let age: i64 = rng.gen_range(10..30);
                SavedRecord::new()
                    .int("id", i as i64)
                    .int("age", age)
                    .str("age_str", &age.to_string())
                    .set("id_set", vec![i.to_string(), (2 * i).to_string()])
            })
            .collect();
        t.ingest(&records).unwrap();
        t.digest_records().unwrap();

        let mut nt = test_table(dir);
        nt.load_info().unwrap();
        nt
    }

    fn avg_query(t: &Table) -> (LoadSpec, QuerySpec) {
        let mut load = LoadSpec::new();
        load.str("age_str");
        load.int("age");
        let mut params = QueryParams::new();
        params.groups = vec!["age_str".to_string()];
        params.aggregations = vec![Aggregation {
            col: "age".to_string(),
            op: AggOp::Avg,
        }];
        params.order_by = Some(SORT_COUNT.to_string());
        (load, QuerySpec { params, filters: Vec::new() })
    }

    #[test]
    fn test_group_by_avg_correctness() {
        let dir = tempdir().unwrap();
        let t = digested_table(dir.path());
        let (load, spec) = avg_query(&t);

        let results = t.load_and_query(&load, &spec).unwrap();
        assert_eq!(results.results.len(), 20);

        let mut total = 0;
        for (key, group) in &results.results {
            let age: i64 = key.trim_end_matches(':').parse().unwrap();
            assert!((group.agg_value("age") - age as f64).abs() < 0.1);
            total += group.count;
        }
        assert_eq!(total, 300);
    }

    #[test]
    fn test_filter_selectivity_law() {
        let dir = tempdir().unwrap();
        let t = digested_table(dir.path());

        let count_with = |int_filter: &str| -> i64 {
            let mut load = LoadSpec::new();
            load.int("age");
            let mut params = QueryParams::new();
            params.aggregations = vec![Aggregation {
                col: "age".to_string(),
                op: AggOp::Avg,
            }];
            let spec_text = FilterSpec {
                int: int_filter.to_string(),
                ..Default::default()
            };
            let filters = build_filters(&t, &mut load, &spec_text, ',').unwrap();
            let spec = QuerySpec {
                params,
                filters,
            };
            let results = t.load_and_query(&load, &spec).unwrap();
            results.results.values().map(|g| g.count).sum()
        };

        let all = count_with("");
        let lt = count_with("age:lt:20");
        let ge = count_with("age:ge:20");
        assert_eq!(all, 300);
        assert_eq!(lt + ge, all);
    }

    #[test]
    fn test_sampling_bound() {
        let dir = tempdir().unwrap();
        let t = digested_table(dir.path());

        let mut load = LoadSpec::new();
        load.load_all = true;
        let mut params = QueryParams::new();
        params.samples = true;
        params.limit = 7;
        let spec = QuerySpec {
            params,
            filters: Vec::new(),
        };

        let results = t.load_and_query(&load, &spec).unwrap();
        assert!(results.samples.len() <= 7);
        assert!(!results.samples.is_empty());
        for sample in &results.samples {
            let id = sample.get_int("id").unwrap();
            let age = sample.get_int("age").unwrap();
            assert_eq!(sample.get_str("age_str").unwrap(), age.to_string());
            assert_eq!(sample.get_set("id_set").unwrap()[0], id.to_string());
        }
    }

    #[test]
    fn test_hist_aggregation() {
        let dir = tempdir().unwrap();
        let t = digested_table(dir.path());

        let mut load = LoadSpec::new();
        load.int("age");
        let mut params = QueryParams::new();
        params.aggregations = vec![Aggregation {
            col: "age".to_string(),
            op: AggOp::Hist,
        }];
        params.hist = HistogramParameters {
            kind: HistKind::Basic,
            bucket_size: Some(1),
            weighted: false,
        };
        let spec = QuerySpec {
            params,
            filters: Vec::new(),
        };

        let results = t.load_and_query(&load, &spec).unwrap();
        let group = results.results.get("total").unwrap();
        let hist = group.hists.get("age").unwrap();
        assert_eq!(hist.count(), 300);
        assert_eq!(hist.buckets().values().sum::<i64>(), 300);
        // Every bucket lies in the recorded age range.
        for start in hist.buckets().keys() {
            assert!(*start >= 10 && *start < 30);
        }
    }

    #[test]
    fn test_time_bucketing() {
        let dir = tempdir().unwrap();
        let mut t = test_table(dir.path());
        let records: Vec<SavedRecord> = (0..200)
            .map(|i| {
                SavedRecord::new()
                    .int("time", 1000 + i as i64)
                    .str("kind", if i % 2 == 0 { "a" } else { "b" })
            })
            .collect();
        t.ingest(&records).unwrap();
        t.digest_records().unwrap();

        let mut nt = test_table(dir.path());
        nt.load_info().unwrap();

        let mut load = LoadSpec::new();
        load.str("kind");
        let mut params = QueryParams::new();
        params.groups = vec!["kind".to_string()];
        params.time_bucket = Some(100);
        let spec = QuerySpec {
            params,
            filters: Vec::new(),
        };

        let results = nt.load_and_query(&load, &spec).unwrap();
        // time 1000..1200 buckets at 1000 and 1100.
        assert_eq!(
            results.time_results.keys().copied().collect::<Vec<i64>>(),
            vec![1000, 1100]
        );
        for (bucket, map) in &results.time_results {
            let total: i64 = map.values().map(|g| g.count).sum();
            assert_eq!(total, 100, "bucket {}", bucket);
            for key in map.keys() {
                assert!(key.starts_with(&format!("{}:", bucket)));
            }
        }
    }

    #[test]
    fn test_distinct_emits_count_one() {
        let dir = tempdir().unwrap();
        let t = digested_table(dir.path());

        let mut load = LoadSpec::new();
        load.str("age_str");
        let mut params = QueryParams::new();
        params.distincts = vec!["age_str".to_string()];
        let spec = QuerySpec {
            params,
            filters: Vec::new(),
        };

        let results = t.load_and_query(&load, &spec).unwrap();
        assert_eq!(results.results.len(), 20);
        assert!(results.results.values().all(|g| g.count == 1));
    }

    #[test]
    fn test_order_and_limit() {
        let dir = tempdir().unwrap();
        let t = digested_table(dir.path());
        let (load, mut spec) = avg_query(&t);
        spec.params.limit = 5;

        let results = t.load_and_query(&load, &spec).unwrap();
        assert_eq!(results.sorted.len(), 5);
        for pair in results.sorted.windows(2) {
            assert!(pair[0].count >= pair[1].count);
        }
    }

    #[test]
    fn test_order_by_aggregated_column() {
        let dir = tempdir().unwrap();
        let t = digested_table(dir.path());
        let (load, mut spec) = avg_query(&t);
        spec.params.order_by = Some("age".to_string());

        let results = t.load_and_query(&load, &spec).unwrap();
        for pair in results.sorted.windows(2) {
            assert!(pair[0].agg_value("age") >= pair[1].agg_value("age"));
        }
    }

    #[test]
    fn test_prune_bounds_partial_maps() {
        let dir = tempdir().unwrap();
        let t = digested_table(dir.path());
        let (load, mut spec) = avg_query(&t);
        spec.params.limit = 3;
        spec.params.prune_by = Some("age".to_string());

        let results = t.load_and_query(&load, &spec).unwrap();
        // 3 blocks x top 3 pruned groups bounds the merged map.
        assert!(results.results.len() <= 9);
        assert_eq!(results.sorted.len(), 3);
    }

    #[test]
    fn test_weighted_average() {
        let dir = tempdir().unwrap();
        let mut t = test_table(dir.path());
        let records = vec![
            SavedRecord::new().int("v", 10).int("w", 3),
            SavedRecord::new().int("v", 20).int("w", 1),
        ];
        t.settings.keep_last_chunk = true;
        t.ingest(&records).unwrap();
        t.digest_records().unwrap();

        let mut nt = test_table(dir.path());
        nt.load_info().unwrap();

        let mut load = LoadSpec::new();
        load.int("v");
        let mut params = QueryParams::new();
        params.aggregations = vec![Aggregation {
            col: "v".to_string(),
            op: AggOp::Avg,
        }];
        params.weight_col = Some("w".to_string());
        let spec = QuerySpec {
            params,
            filters: Vec::new(),
        };

        let results = nt.load_and_query(&load, &spec).unwrap();
        let group = results.results.get("total").unwrap();
        assert_eq!(group.count, 4);
        assert!((group.agg_value("v") - 12.5).abs() < 1e-9);
    }

    #[test]
    fn test_read_ingestion_log() {
        let dir = tempdir().unwrap();
        let mut t = test_table(dir.path());
        t.ingest(&[SavedRecord::new().int("age", 42)]).unwrap();

        let mut nt = test_table(dir.path());
        nt.settings.read_ingestion_log = true;
        nt.load_info().unwrap();

        let mut load = LoadSpec::new();
        load.int("age");
        let mut params = QueryParams::new();
        params.aggregations = vec![Aggregation {
            col: "age".to_string(),
            op: AggOp::Avg,
        }];
        let spec = QuerySpec {
            params,
            filters: Vec::new(),
        };

        let results = nt.load_and_query(&load, &spec).unwrap();
        let group = results.results.get("total").unwrap();
        assert_eq!(group.count, 1);
        assert!((group.agg_value("age") - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_broken_block_skipped() {
        let dir = tempdir().unwrap();
        let t = digested_table(dir.path());

        // Remove one block's age column; that block drops out of the
        // run instead of failing it.
        let victim = &t.blocks[0].name;
        std::fs::remove_file(t.dir().join(victim).join("int_age.db")).unwrap();

        let (load, spec) = avg_query(&t);
        let results = t.load_and_query(&load, &spec).unwrap();
        let total: i64 = results.results.values().map(|g| g.count).sum();
        assert_eq!(total, 200);
    }

    #[test]
    fn test_recycle_mem_matches_plain_run() {
        let dir = tempdir().unwrap();
        let mut t = digested_table(dir.path());
        let (load, spec) = avg_query(&t);

        let plain = t.load_and_query(&load, &spec).unwrap();
        t.settings.recycle_mem = true;
        let pooled = t.load_and_query(&load, &spec).unwrap();

        assert_eq!(plain.results.len(), pooled.results.len());
        for (key, group) in &plain.results {
            assert_eq!(pooled.results[key].count, group.count);
        }
    }
}
