//! Query flags
//!
//! The full parsed flag struct for the `query` subcommand. It doubles
//! as the wire format for detached planners: `-encode-flags` writes it
//! to stdout in the same binary format used on disk, `-decode-flags`
//! reads it back from stdin.

use std::io::{Read, Write};

use clap::Parser;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::hist::{HistKind, HistogramParameters};
use crate::query::{
    build_filters, AggOp, Aggregation, FilterSpec, LoadSpec, QueryParams, QuerySpec, StrReplace,
};
use crate::storage::encoding;
use crate::table::Table;
use crate::{CaskError, Result, SORT_COUNT};

#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(about = "Run a group-by / aggregation / sample query")]
pub struct QueryFlags {
    /// Table to query
    #[arg(long, default_value = "")]
    pub table: String,

    /// Integer columns to aggregate
    #[arg(long = "int", default_value = "")]
    pub ints: String,

    /// String columns to load
    #[arg(long = "str", default_value = "")]
    pub strs: String,

    /// Set columns to load
    #[arg(long = "set", default_value = "")]
    pub sets: String,

    /// Columns to group by
    #[arg(long = "group", default_value = "")]
    pub groups: String,

    /// Columns to count distinct combinations of
    #[arg(long = "distinct", default_value = "")]
    pub distinct: String,

    /// Metric to calculate: avg, hist or distinct
    #[arg(long, default_value = "avg")]
    pub op: String,

    /// Int filters, format col:op:val
    #[arg(long = "int-filter", default_value = "")]
    pub int_filters: String,

    /// Str filters, format col:op:val
    #[arg(long = "str-filter", default_value = "")]
    pub str_filters: String,

    /// Set filters, format col:op:val
    #[arg(long = "set-filter", default_value = "")]
    pub set_filters: String,

    /// Str replacement, format col:find:replace
    #[arg(long = "str-replace", default_value = "")]
    pub str_replace: String,

    /// Int column to sort by ($COUNT sorts by group count)
    #[arg(long = "sort", default_value = SORT_COUNT)]
    pub sort: String,

    /// Int column to prune intermediate results by
    #[arg(long = "prune-sort", default_value = SORT_COUNT)]
    pub prune_by: String,

    /// Number of results to return
    #[arg(long, default_value_t = 100)]
    pub limit: usize,

    /// Make a time rollup
    #[arg(long, default_value_t = false)]
    pub time: bool,

    /// Which column to treat as a timestamp (use with --time)
    #[arg(long = "time-col", default_value = "time")]
    pub time_col: String,

    /// Time bucket in seconds
    #[arg(long = "time-bucket", default_value_t = 3600)]
    pub time_bucket: i64,

    /// Optional weighting column
    #[arg(long = "weight-col", default_value = "")]
    pub weight_col: String,

    /// Use nested logarithmic histograms
    #[arg(long = "loghist", default_value_t = false)]
    pub log_hist: bool,

    /// Int histogram bucket size
    #[arg(long = "int-bucket", default_value_t = 0)]
    pub hist_bucket: i64,

    /// Grab whole-record samples instead of aggregating
    #[arg(long, default_value_t = false)]
    pub samples: bool,

    /// Also read the ingestion log (can take longer)
    #[arg(long = "read-log", default_value_t = false)]
    pub read_log: bool,

    /// Re-compute cached column metadata
    #[arg(long = "update-info", default_value_t = false)]
    pub update_info: bool,

    /// Cache query results per block
    #[arg(long = "cache-queries", default_value_t = false)]
    pub cache_queries: bool,

    /// Print the query flags in binary format and exit
    #[arg(long = "encode-flags", default_value_t = false)]
    pub encode_flags: bool,

    /// Read the query flags from stdin in binary format
    #[arg(long = "decode-flags", default_value_t = false)]
    pub decode_flags: bool,

    /// Print the results in binary format
    #[arg(long = "encode-results", default_value_t = false)]
    pub encode_results: bool,

    /// Print results as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Print results
    #[arg(long, default_value_t = true)]
    pub print: bool,

    /// Print table info
    #[arg(long = "info", default_value_t = false)]
    pub print_info: bool,

    /// List tables
    #[arg(long = "tables", default_value_t = false)]
    pub list_tables: bool,

    /// Separator for multi-valued flags
    #[arg(long = "field-separator", default_value = ",")]
    pub field_separator: String,
}

impl QueryFlags {
    pub fn separator(&self) -> char {
        self.field_separator.chars().next().unwrap_or(',')
    }

    fn split(&self, s: &str) -> Vec<String> {
        s.split(self.separator())
            .filter(|p| !p.is_empty())
            .map(|p| p.to_string())
            .collect()
    }

    /// Write the flag struct in the on-disk binary format.
    pub fn encode<W: Write>(&self, writer: W) -> Result<()> {
        encoding::encode_to_writer(writer, self)
    }

    /// Read a flag struct in the on-disk binary format.
    pub fn decode<R: Read>(reader: R) -> Result<Self> {
        encoding::decode_from_reader(reader)
    }

    fn parse_str_replace(&self) -> Result<Vec<StrReplace>> {
        let mut replacements = Vec::new();
        for spec in self.split(&self.str_replace) {
            let mut parts = spec.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(col), Some(find), Some(replace)) if !col.is_empty() => {
                    let find = Regex::new(find).map_err(|e| {
                        CaskError::PlanError(format!("bad str-replace regex: {}", e))
                    })?;
                    replacements.push(StrReplace {
                        col: col.to_string(),
                        find,
                        replace: replace.to_string(),
                    });
                }
                _ => {
                    return Err(CaskError::PlanError(format!(
                        "malformed str-replace spec {:?}, want col:find:replace",
                        spec
                    )))
                }
            }
        }
        Ok(replacements)
    }

    /// Compile the flags into a load spec and query spec against a
    /// loaded table.
    pub fn build_query(&self, table: &Table) -> Result<(LoadSpec, QuerySpec)> {
        let mut load = LoadSpec::new();
        let sep = self.separator();

        let ints = self.split(&self.ints);
        let mut groups = self.split(&self.groups);
        let mut distincts = self.split(&self.distinct);

        let agg_op = match self.op.as_str() {
            "hist" => Some(AggOp::Hist),
            "avg" => Some(AggOp::Avg),
            "distinct" => {
                // op=distinct means group_by distinct_cols with
                // count-only aggregation.
                distincts = std::mem::take(&mut groups);
                None
            }
            other => {
                return Err(CaskError::PlanError(format!(
                    "unknown op {:?}, want avg, hist or distinct",
                    other
                )))
            }
        };

        for col in self.split(&self.strs) {
            load.str(&col);
        }
        for col in self.split(&self.sets) {
            load.set(&col);
        }
        for col in &ints {
            load.int(col);
        }

        let filter_spec = FilterSpec {
            int: self.int_filters.clone(),
            str: self.str_filters.clone(),
            set: self.set_filters.clone(),
        };
        let filters = build_filters(table, &mut load, &filter_spec, sep)?;

        let mut params = QueryParams::new();
        params.groups = groups;
        params.distincts = distincts;
        if let Some(op) = agg_op {
            params.aggregations = ints
                .iter()
                .map(|col| Aggregation {
                    col: col.clone(),
                    op,
                })
                .collect();
        }
        params.order_by = if self.sort.is_empty() {
            None
        } else {
            Some(self.sort.clone())
        };
        params.prune_by = if self.prune_by.is_empty() {
            None
        } else {
            Some(self.prune_by.clone())
        };
        params.limit = self.limit;
        params.time_col = self.time_col.clone();
        params.time_bucket = self.time.then_some(self.time_bucket);
        params.weight_col = if self.weight_col.is_empty() {
            None
        } else {
            Some(self.weight_col.clone())
        };
        params.samples = self.samples;
        params.cache_queries = self.cache_queries;
        params.str_replace = self.parse_str_replace()?;
        params.hist = HistogramParameters {
            kind: if self.log_hist {
                HistKind::Multi
            } else {
                HistKind::Basic
            },
            bucket_size: (self.hist_bucket > 0).then_some(self.hist_bucket),
            weighted: !self.weight_col.is_empty(),
        };

        Ok((load, QuerySpec { params, filters }))
    }
}
