//! Query specification and execution
//!
//! A query is a load spec (which columns to materialize), a filter
//! list, and the grouping/aggregation parameters. Execution scans
//! blocks in parallel, accumulates shared-nothing per-block partial
//! results, and merges them at the end.

pub mod cache;
pub mod exec;
pub mod filter;

pub use filter::{build_filters, Filter, FilterSpec, IntOp, SetOp, StrOp};

use std::collections::{BTreeMap, BTreeSet, HashMap};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::data::SavedRecord;
use crate::hist::{Hist, HistogramParameters};

/// Which columns a scan materializes. Filters, group-bys, order/prune
/// columns and the time/weight columns are added automatically during
/// planning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadSpec {
    pub ints: BTreeSet<String>,
    pub strs: BTreeSet<String>,
    pub sets: BTreeSet<String>,
    pub load_all: bool,
}

impl LoadSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn int(&mut self, name: &str) {
        self.ints.insert(name.to_string());
    }

    pub fn str(&mut self, name: &str) {
        self.strs.insert(name.to_string());
    }

    pub fn set(&mut self, name: &str) {
        self.sets.insert(name.to_string());
    }

    pub fn wants_int(&self, name: &str) -> bool {
        self.load_all || self.ints.contains(name)
    }

    pub fn wants_str(&self, name: &str) -> bool {
        self.load_all || self.strs.contains(name)
    }

    pub fn wants_set(&self, name: &str) -> bool {
        self.load_all || self.sets.contains(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggOp {
    Avg,
    Hist,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregation {
    pub col: String,
    pub op: AggOp,
}

/// A `col:find:replace` rewrite applied to group-by strings.
#[derive(Debug, Clone)]
pub struct StrReplace {
    pub col: String,
    pub find: Regex,
    pub replace: String,
}

#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub groups: Vec<String>,
    pub distincts: Vec<String>,
    pub aggregations: Vec<Aggregation>,
    /// `$COUNT` orders by group count; otherwise by the aggregated
    /// value of the named column. None skips ordering.
    pub order_by: Option<String>,
    pub prune_by: Option<String>,
    pub limit: usize,
    pub time_bucket: Option<i64>,
    pub time_col: String,
    pub weight_col: Option<String>,
    pub samples: bool,
    pub hist: HistogramParameters,
    pub cache_queries: bool,
    pub str_replace: Vec<StrReplace>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self {
            time_col: "time".to_string(),
            limit: 100,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub params: QueryParams,
    pub filters: Vec<Filter>,
}

/// Rolling weighted mean for one aggregation column within one group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AvgState {
    pub mean: f64,
    pub weight: i64,
}

impl AvgState {
    pub fn add(&mut self, value: i64, weight: i64) {
        self.weight += weight;
        self.mean += (value as f64 - self.mean) * weight as f64 / self.weight as f64;
    }

    /// Count-weighted combination of two partial means.
    pub fn merge(&mut self, other: &AvgState) {
        let total = self.weight + other.weight;
        if total == 0 {
            return;
        }
        self.mean = (self.mean * self.weight as f64 + other.mean * other.weight as f64)
            / total as f64;
        self.weight = total;
    }
}

/// One group's accumulated result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupResult {
    pub group_key: String,
    pub count: i64,
    pub avgs: HashMap<String, AvgState>,
    pub hists: HashMap<String, Hist>,
}

impl GroupResult {
    pub fn new(group_key: &str) -> Self {
        Self {
            group_key: group_key.to_string(),
            ..Default::default()
        }
    }

    /// Aggregated value of a column (the rolling mean).
    pub fn agg_value(&self, col: &str) -> f64 {
        self.avgs.get(col).map(|a| a.mean).unwrap_or(0.0)
    }

    pub fn merge(&mut self, other: &GroupResult) {
        self.count += other.count;
        for (col, theirs) in &other.avgs {
            self.avgs.entry(col.clone()).or_default().merge(theirs);
        }
        for (col, theirs) in &other.hists {
            match self.hists.get_mut(col) {
                Some(mine) => mine.merge(theirs),
                None => {
                    self.hists.insert(col.clone(), theirs.clone());
                }
            }
        }
    }
}

pub type ResultMap = HashMap<String, GroupResult>;

/// Per-block partial result; also the unit stored in the block cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockPartial {
    pub results: ResultMap,
    pub time_results: BTreeMap<i64, ResultMap>,
    pub samples: Vec<SavedRecord>,
    pub diagnostics: HashMap<String, u64>,
}

/// Final merged query output.
#[derive(Debug, Default)]
pub struct QueryResults {
    pub results: ResultMap,
    pub time_results: BTreeMap<i64, ResultMap>,
    /// Results ordered and truncated per the query's order/limit.
    pub sorted: Vec<GroupResult>,
    pub samples: Vec<SavedRecord>,
    /// Per-record skip reasons, e.g. records missing the time column.
    pub diagnostics: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avg_state_rolling_mean() {
        let mut avg = AvgState::default();
        for v in [10, 20, 30] {
            avg.add(v, 1);
        }
        assert!((avg.mean - 20.0).abs() < 1e-9);
        assert_eq!(avg.weight, 3);
    }

    #[test]
    fn test_avg_state_weighted() {
        let mut avg = AvgState::default();
        avg.add(10, 3);
        avg.add(20, 1);
        assert!((avg.mean - 12.5).abs() < 1e-9);
        assert_eq!(avg.weight, 4);
    }

    #[test]
    fn test_avg_merge_is_count_weighted() {
        let mut a = AvgState::default();
        let mut b = AvgState::default();
        for v in [1, 2, 3] {
            a.add(v, 1);
        }
        for v in [10, 20] {
            b.add(v, 1);
        }
        a.merge(&b);
        assert_eq!(a.weight, 5);
        assert!((a.mean - (1.0 + 2.0 + 3.0 + 10.0 + 20.0) / 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_group_result_merge() {
        let mut a = GroupResult::new("k:");
        a.count = 2;
        a.avgs.insert("age".to_string(), AvgState { mean: 10.0, weight: 2 });

        let mut b = GroupResult::new("k:");
        b.count = 3;
        b.avgs.insert("age".to_string(), AvgState { mean: 20.0, weight: 3 });

        a.merge(&b);
        assert_eq!(a.count, 5);
        assert!((a.agg_value("age") - 16.0).abs() < 1e-9);
    }
}
