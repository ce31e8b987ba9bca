//! Record filters
//!
//! Filters are compiled once per query from comma-separated textual
//! forms `col:op:val`. A filter on a missing or wrong-typed column
//! rejects every record rather than erroring; a malformed spec string
//! is a fatal plan error.

use regex::Regex;

use super::LoadSpec;
use crate::data::{ColType, KeyId};
use crate::table::{Table, TableBlock};
use crate::{CaskError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Neq,
}

impl IntOp {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "lt" => Some(IntOp::Lt),
            "gt" => Some(IntOp::Gt),
            "le" => Some(IntOp::Le),
            "ge" => Some(IntOp::Ge),
            "eq" => Some(IntOp::Eq),
            "neq" => Some(IntOp::Neq),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            IntOp::Lt => "lt",
            IntOp::Gt => "gt",
            IntOp::Le => "le",
            IntOp::Ge => "ge",
            IntOp::Eq => "eq",
            IntOp::Neq => "neq",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrOp {
    Re,
    Nre,
    Eq,
    Neq,
}

impl StrOp {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "re" => Some(StrOp::Re),
            "nre" => Some(StrOp::Nre),
            "eq" => Some(StrOp::Eq),
            "neq" => Some(StrOp::Neq),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            StrOp::Re => "re",
            StrOp::Nre => "nre",
            StrOp::Eq => "eq",
            StrOp::Neq => "neq",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    In,
    Nin,
}

impl SetOp {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "in" => Some(SetOp::In),
            "nin" => Some(SetOp::Nin),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            SetOp::In => "in",
            SetOp::Nin => "nin",
        }
    }
}

/// A compiled filter. `key` is None when the column is missing or
/// wrong-typed, which makes the filter reject everything.
#[derive(Debug, Clone)]
pub enum Filter {
    Int {
        col: String,
        key: Option<KeyId>,
        op: IntOp,
        value: i64,
    },
    Str {
        col: String,
        key: Option<KeyId>,
        op: StrOp,
        value: String,
        re: Option<Regex>,
    },
    Set {
        col: String,
        key: Option<KeyId>,
        op: SetOp,
        value: String,
    },
}

impl Filter {
    /// Column this filter reads, so the planner can extend the load spec.
    pub fn column(&self) -> &str {
        match self {
            Filter::Int { col, .. } | Filter::Str { col, .. } | Filter::Set { col, .. } => col,
        }
    }

    /// Canonical `col:op:val` form, used for cache fingerprints.
    pub fn repr(&self) -> String {
        match self {
            Filter::Int { col, op, value, .. } => format!("{}:{}:{}", col, op.as_str(), value),
            Filter::Str { col, op, value, .. } => format!("{}:{}:{}", col, op.as_str(), value),
            Filter::Set { col, op, value, .. } => format!("{}:{}:{}", col, op.as_str(), value),
        }
    }

    /// Re-resolve the column key against another table's key table.
    /// Used when scanning the ingestion log, whose columns may not be
    /// digested into the main key table yet.
    pub fn rebind(&self, table: &Table) -> Filter {
        let mut filter = self.clone();
        match &mut filter {
            Filter::Int { col, key, .. } => *key = resolve(table, col, ColType::Int),
            Filter::Str { col, key, .. } => *key = resolve(table, col, ColType::Str),
            Filter::Set { col, key, .. } => *key = resolve(table, col, ColType::Set),
        }
        filter
    }

    /// Returns true when the record at `row` passes the filter.
    pub fn matches(&self, block: &TableBlock, row: usize) -> bool {
        match self {
            Filter::Int { key, op, value, .. } => {
                let v = match block.int_val(*key, row) {
                    Some(v) => v,
                    None => return false,
                };
                match op {
                    IntOp::Lt => v < *value,
                    IntOp::Gt => v > *value,
                    IntOp::Le => v <= *value,
                    IntOp::Ge => v >= *value,
                    IntOp::Eq => v == *value,
                    IntOp::Neq => v != *value,
                }
            }
            Filter::Str {
                key, op, value, re, ..
            } => {
                let s = match block.str_val(*key, row) {
                    Some(s) => s,
                    None => return false,
                };
                match op {
                    StrOp::Eq => s == value,
                    StrOp::Neq => s != value,
                    StrOp::Re => re.as_ref().map_or(false, |re| re.is_match(s)),
                    StrOp::Nre => re.as_ref().map_or(false, |re| !re.is_match(s)),
                }
            }
            Filter::Set { key, op, value, .. } => {
                if key.is_none() {
                    return false;
                }
                let populated = block.set_val(*key, row).is_some();
                let contains = block.set_contains(*key, row, value);
                match op {
                    SetOp::In => contains,
                    SetOp::Nin => populated && !contains,
                }
            }
        }
    }
}

/// Raw textual filter specs, straight off the flags.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    pub int: String,
    pub str: String,
    pub set: String,
}

fn split_specs(spec: &str, sep: char) -> Vec<&str> {
    spec.split(sep).filter(|s| !s.is_empty()).collect()
}

fn parse_parts(spec: &str) -> Result<(&str, &str, &str)> {
    let mut parts = spec.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(col), Some(op), Some(val)) if !col.is_empty() => Ok((col, op, val)),
        _ => Err(CaskError::PlanError(format!(
            "malformed filter spec {:?}, want col:op:val",
            spec
        ))),
    }
}

/// Resolve a column against the key table, demanding a type. A missing
/// column or type mismatch yields None (the filter rejects everything).
fn resolve(table: &Table, col: &str, want: ColType) -> Option<KeyId> {
    let id = table.get_key_id(col)?;
    if table.key_types.get(&id).copied() == Some(want) {
        Some(id)
    } else {
        log::debug!("filter column {} is not {:?}; filter matches nothing", col, want);
        None
    }
}

/// Compile the textual filter specs, extending the load spec with every
/// referenced column.
pub fn build_filters(
    table: &Table,
    load: &mut LoadSpec,
    spec: &FilterSpec,
    sep: char,
) -> Result<Vec<Filter>> {
    let mut filters = Vec::new();

    for s in split_specs(&spec.int, sep) {
        let (col, op, val) = parse_parts(s)?;
        let op = IntOp::parse(op)
            .ok_or_else(|| CaskError::PlanError(format!("unknown int filter op {:?}", op)))?;
        let value: i64 = val
            .parse()
            .map_err(|_| CaskError::PlanError(format!("bad int filter value {:?}", val)))?;
        load.int(col);
        filters.push(Filter::Int {
            col: col.to_string(),
            key: resolve(table, col, ColType::Int),
            op,
            value,
        });
    }

    for s in split_specs(&spec.str, sep) {
        let (col, op, val) = parse_parts(s)?;
        let op = StrOp::parse(op)
            .ok_or_else(|| CaskError::PlanError(format!("unknown str filter op {:?}", op)))?;
        let re = match op {
            StrOp::Re | StrOp::Nre => Some(
                Regex::new(val)
                    .map_err(|e| CaskError::PlanError(format!("bad filter regex: {}", e)))?,
            ),
            _ => None,
        };
        load.str(col);
        filters.push(Filter::Str {
            col: col.to_string(),
            key: resolve(table, col, ColType::Str),
            op,
            value: val.to_string(),
            re,
        });
    }

    for s in split_specs(&spec.set, sep) {
        let (col, op, val) = parse_parts(s)?;
        let op = SetOp::parse(op)
            .ok_or_else(|| CaskError::PlanError(format!("unknown set filter op {:?}", op)))?;
        load.set(col);
        filters.push(Filter::Set {
            col: col.to_string(),
            key: resolve(table, col, ColType::Set),
            op,
            value: val.to_string(),
        });
    }

    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::data::SavedRecord;
    use crate::table::block::write_block;
    use tempfile::tempdir;

    fn block_fixture() -> (tempfile::TempDir, Table, TableBlock) {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.dir = dir.path().to_path_buf();
        let mut table = Table::open(settings, "events");
        table.make_dir().unwrap();

        let records = vec![
            SavedRecord::new()
                .int("age", 15)
                .str("name", "alice")
                .set("tags", vec!["a".to_string(), "b".to_string()]),
            SavedRecord::new()
                .int("age", 25)
                .str("name", "bob")
                .set("tags", vec!["b".to_string()]),
            SavedRecord::new().int("age", 35).str("name", "carol"),
        ];
        let summary = write_block(&mut table, "block_0001", &records).unwrap();
        let mut load = LoadSpec::new();
        load.load_all = true;
        let block = TableBlock::load(&table, &summary, &load, None).unwrap();
        (dir, table, block)
    }

    fn count_matches(block: &TableBlock, filter: &Filter) -> usize {
        (0..block.num_records())
            .filter(|row| filter.matches(block, *row))
            .count()
    }

    #[test]
    fn test_int_filter_ops() {
        let (_dir, table, block) = block_fixture();
        let mut load = LoadSpec::new();

        let spec = FilterSpec {
            int: "age:gt:20".to_string(),
            ..Default::default()
        };
        let filters = build_filters(&table, &mut load, &spec, ',').unwrap();
        assert_eq!(count_matches(&block, &filters[0]), 2);
        assert!(load.wants_int("age"));

        let spec = FilterSpec {
            int: "age:eq:25,age:le:15".to_string(),
            ..Default::default()
        };
        let filters = build_filters(&table, &mut load, &spec, ',').unwrap();
        assert_eq!(count_matches(&block, &filters[0]), 1);
        assert_eq!(count_matches(&block, &filters[1]), 1);
    }

    #[test]
    fn test_str_filter_regex_and_eq() {
        let (_dir, table, block) = block_fixture();
        let mut load = LoadSpec::new();

        let spec = FilterSpec {
            str: "name:re:^[ab],name:eq:carol,name:nre:ob$".to_string(),
            ..Default::default()
        };
        let filters = build_filters(&table, &mut load, &spec, ',').unwrap();
        assert_eq!(count_matches(&block, &filters[0]), 2);
        assert_eq!(count_matches(&block, &filters[1]), 1);
        assert_eq!(count_matches(&block, &filters[2]), 2);
    }

    #[test]
    fn test_set_filter_in_nin() {
        let (_dir, table, block) = block_fixture();
        let mut load = LoadSpec::new();

        let spec = FilterSpec {
            set: "tags:in:a,tags:nin:a".to_string(),
            ..Default::default()
        };
        let filters = build_filters(&table, &mut load, &spec, ',').unwrap();
        assert_eq!(count_matches(&block, &filters[0]), 1);
        // nin requires the column populated, so the tag-less record
        // does not count.
        assert_eq!(count_matches(&block, &filters[1]), 1);
    }

    #[test]
    fn test_missing_or_wrong_typed_column_rejects_all() {
        let (_dir, table, block) = block_fixture();
        let mut load = LoadSpec::new();

        let spec = FilterSpec {
            int: "nosuch:gt:0,name:gt:0".to_string(),
            ..Default::default()
        };
        let filters = build_filters(&table, &mut load, &spec, ',').unwrap();
        assert_eq!(count_matches(&block, &filters[0]), 0);
        assert_eq!(count_matches(&block, &filters[1]), 0);
    }

    #[test]
    fn test_malformed_spec_is_fatal() {
        let (_dir, table, _block) = block_fixture();
        let mut load = LoadSpec::new();

        let spec = FilterSpec {
            int: "age:gt".to_string(),
            ..Default::default()
        };
        assert!(build_filters(&table, &mut load, &spec, ',').is_err());

        let spec = FilterSpec {
            int: "age:wat:5".to_string(),
            ..Default::default()
        };
        assert!(build_filters(&table, &mut load, &spec, ',').is_err());
    }

    #[test]
    fn test_filter_repr_roundtrips_spec() {
        let (_dir, table, _block) = block_fixture();
        let mut load = LoadSpec::new();
        let spec = FilterSpec {
            int: "age:gt:20".to_string(),
            str: "name:re:^a".to_string(),
            set: "tags:in:b".to_string(),
        };
        let filters = build_filters(&table, &mut load, &spec, ',').unwrap();
        let reprs: Vec<String> = filters.iter().map(|f| f.repr()).collect();
        assert_eq!(reprs, vec!["age:gt:20", "name:re:^a", "tags:in:b"]);
    }
}
