//! Column blocks
//!
//! A block is an immutable directory holding one file per materialized
//! column plus a local `info.db`. Digestion writes blocks into a
//! `.partial` directory and renames them into place, so a block is
//! either fully present or absent.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use ahash::AHashMap;

use super::{BlockInfo, BlockSummary, Table, INFO_FILE};
use crate::data::{ColType, KeyId, Record, SavedRecord};
use crate::query::LoadSpec;
use crate::storage::column::{
    BufferPool, DictBuilder, IntColumn, SavedIntColumn, SavedSetColumn, SavedStrColumn, SetColumn,
    StrColumn,
};
use crate::storage::encoding::{self, GZIP_EXT};
use crate::{CaskError, Result};

fn column_file(kind: &str, name: &str, gzip: bool) -> String {
    if gzip {
        format!("{}_{}.db{}", kind, name, GZIP_EXT)
    } else {
        format!("{}_{}.db", kind, name)
    }
}

/// Columns of one chunk, keyed by column name, built record-major.
#[derive(Default)]
struct ColumnSet {
    num_records: usize,
    ints: BTreeMap<String, Vec<Option<i64>>>,
    strs: BTreeMap<String, (DictBuilder, Vec<Option<i32>>)>,
    sets: BTreeMap<String, (DictBuilder, Vec<Option<Vec<i32>>>)>,
}

impl ColumnSet {
    /// Reconstitute the chunk as dense in-memory records bound to this
    /// block's dictionaries, then slice it column-major. Allocates key
    /// ids and declares types on the table; a type conflict aborts.
    fn build(table: &mut Table, records: &[SavedRecord]) -> Result<Self> {
        let n = records.len();
        let mut str_dicts: BTreeMap<String, DictBuilder> = BTreeMap::new();
        let mut set_dicts: BTreeMap<String, DictBuilder> = BTreeMap::new();
        let mut int_names: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();

        let mut dense: Vec<Record> = Vec::with_capacity(n);
        for saved in records {
            let mut record = Record::with_fields(table.key_table.len());
            for (name, value) in &saved.ints {
                let id = table.key_id(name);
                table.set_key_type(id, ColType::Int)?;
                record.set_int(id, *value);
                int_names.insert(name.clone());
            }
            for (name, value) in &saved.strs {
                let id = table.key_id(name);
                table.set_key_type(id, ColType::Str)?;
                let dict = str_dicts.entry(name.clone()).or_default();
                record.set_str(id, dict.intern(value));
            }
            for (name, values) in &saved.sets {
                let id = table.key_id(name);
                table.set_key_type(id, ColType::Set)?;
                let dict = set_dicts.entry(name.clone()).or_default();
                record.set_set(id, values.iter().map(|v| dict.intern(v)).collect());
            }
            dense.push(record);
        }

        let mut cols = ColumnSet {
            num_records: n,
            ..Default::default()
        };
        for name in int_names {
            let id = table.key_id(&name);
            let rows = dense.iter().map(|r| r.get_int(id)).collect();
            cols.ints.insert(name, rows);
        }
        for (name, dict) in str_dicts {
            let id = table.key_id(&name);
            let ids = dense.iter().map(|r| r.get_str_id(id)).collect();
            cols.strs.insert(name, (dict, ids));
        }
        for (name, dict) in set_dicts {
            let id = table.key_id(&name);
            let rows = dense
                .iter()
                .map(|r| r.get_set_ids(id).map(|ids| ids.to_vec()))
                .collect();
            cols.sets.insert(name, (dict, rows));
        }
        Ok(cols)
    }
}

/// Write one chunk of records as a new block directory. The block is
/// staged under `<name>.partial` and renamed into place once every
/// column file and the local info file are synced.
pub fn write_block(
    table: &mut Table,
    block_name: &str,
    records: &[SavedRecord],
) -> Result<BlockSummary> {
    let cols = ColumnSet::build(table, records)?;
    let policy = table.settings.outlier_policy(None);
    let gzip = table.settings.gzip;

    let final_dir = table.dir().join(block_name);
    let partial_dir = table.dir().join(format!("{}.partial", block_name));
    fs::create_dir_all(&partial_dir)?;

    let mut info = BlockInfo {
        num_records: cols.num_records as u32,
        ..Default::default()
    };

    for (name, rows) in cols.ints {
        let (saved, _) = SavedIntColumn::pack(&name, &rows, None, policy);
        info.int_cols.insert(
            name.clone(),
            super::IntInfo {
                min: saved.min,
                max: saved.max,
            },
        );
        let id = table.key_id(&name);
        table.update_int_info(id, saved.min);
        table.update_int_info(id, saved.max);
        write_synced(&partial_dir.join(column_file("int", &name, gzip)), &saved)?;
    }
    for (name, (dict, ids)) in cols.strs {
        let saved = SavedStrColumn::pack(&name, dict, &ids);
        info.str_cols.insert(name.clone(), saved.dict.len() as u32);
        write_synced(&partial_dir.join(column_file("str", &name, gzip)), &saved)?;
    }
    for (name, (dict, rows)) in cols.sets {
        let saved = SavedSetColumn::pack(&name, dict, &rows);
        info.set_cols.insert(name.clone(), saved.dict.len() as u32);
        write_synced(&partial_dir.join(column_file("set", &name, gzip)), &saved)?;
    }

    write_synced(&partial_dir.join(INFO_FILE), &info)?;
    fs::rename(&partial_dir, &final_dir)?;

    Ok(BlockSummary {
        name: block_name.to_string(),
        info,
    })
}

fn write_synced<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    encoding::encode(path, value)?;
    File::open(path)?.sync_all()?;
    Ok(())
}

/// A loaded block: only the columns the load spec asked for.
pub struct TableBlock {
    pub name: String,
    pub info: BlockInfo,
    pub int_columns: AHashMap<KeyId, IntColumn>,
    pub str_columns: AHashMap<KeyId, StrColumn>,
    pub set_columns: AHashMap<KeyId, SetColumn>,
}

impl TableBlock {
    pub fn num_records(&self) -> usize {
        self.info.num_records as usize
    }

    /// Load the columns named by the load spec from a block directory.
    /// A column the load spec wants but the block never materialized
    /// is skipped; a column the info promises but whose file is gone is
    /// a broken block.
    pub fn load(
        table: &Table,
        summary: &BlockSummary,
        load: &LoadSpec,
        pool: Option<&BufferPool>,
    ) -> Result<Self> {
        let dir = table.dir().join(&summary.name);
        let mut block = Self {
            name: summary.name.clone(),
            info: summary.info.clone(),
            int_columns: AHashMap::new(),
            str_columns: AHashMap::new(),
            set_columns: AHashMap::new(),
        };

        for name in summary.info.int_cols.keys() {
            if !load.wants_int(name) {
                continue;
            }
            let key = match table.get_key_id(name) {
                Some(key) => key,
                None => continue,
            };
            let saved: SavedIntColumn = decode_column(&dir, "int", name)?;
            let scratch = pool.map(|p| p.get_ints());
            block
                .int_columns
                .insert(key, IntColumn::from_saved(saved, scratch));
        }
        for name in summary.info.str_cols.keys() {
            if !load.wants_str(name) {
                continue;
            }
            let key = match table.get_key_id(name) {
                Some(key) => key,
                None => continue,
            };
            let saved: SavedStrColumn = decode_column(&dir, "str", name)?;
            block.str_columns.insert(key, StrColumn::from_saved(saved));
        }
        for name in summary.info.set_cols.keys() {
            if !load.wants_set(name) {
                continue;
            }
            let key = match table.get_key_id(name) {
                Some(key) => key,
                None => continue,
            };
            let saved: SavedSetColumn = decode_column(&dir, "set", name)?;
            block.set_columns.insert(key, SetColumn::from_saved(saved));
        }

        Ok(block)
    }

    /// Build an in-memory block from row-log records, so the ingestion
    /// log can be scanned with the same code path as column blocks.
    pub fn from_records(table: &mut Table, records: &[SavedRecord]) -> Result<Self> {
        let cols = ColumnSet::build(table, records)?;
        let policy = table.settings.outlier_policy(None);

        let mut info = BlockInfo {
            num_records: cols.num_records as u32,
            ..Default::default()
        };
        let mut block = Self {
            name: "<rowlog>".to_string(),
            info: BlockInfo::default(),
            int_columns: AHashMap::new(),
            str_columns: AHashMap::new(),
            set_columns: AHashMap::new(),
        };

        for (name, rows) in cols.ints {
            let (saved, _) = SavedIntColumn::pack(&name, &rows, None, policy);
            info.int_cols.insert(
                name.clone(),
                super::IntInfo {
                    min: saved.min,
                    max: saved.max,
                },
            );
            let key = table.key_id(&name);
            block.int_columns.insert(key, IntColumn::from_saved(saved, None));
        }
        for (name, (dict, ids)) in cols.strs {
            let saved = SavedStrColumn::pack(&name, dict, &ids);
            info.str_cols.insert(name.clone(), saved.dict.len() as u32);
            let key = table.key_id(&name);
            block.str_columns.insert(key, StrColumn::from_saved(saved));
        }
        for (name, (dict, rows)) in cols.sets {
            let saved = SavedSetColumn::pack(&name, dict, &rows);
            info.set_cols.insert(name.clone(), saved.dict.len() as u32);
            let key = table.key_id(&name);
            block.set_columns.insert(key, SetColumn::from_saved(saved));
        }

        block.info = info;
        Ok(block)
    }

    // ========================================================================
    // Row access
    // ========================================================================

    pub fn int_val(&self, key: Option<KeyId>, row: usize) -> Option<i64> {
        self.int_columns.get(&key?)?.get(row)
    }

    pub fn str_val(&self, key: Option<KeyId>, row: usize) -> Option<&str> {
        self.str_columns.get(&key?)?.get(row)
    }

    pub fn set_val(&self, key: Option<KeyId>, row: usize) -> Option<&[i32]> {
        self.set_columns.get(&key?)?.get(row)
    }

    pub fn set_contains(&self, key: Option<KeyId>, row: usize, member: &str) -> bool {
        let col = match key.and_then(|k| self.set_columns.get(&k)) {
            Some(col) => col,
            None => return false,
        };
        col.contains(row, member)
    }

    /// String form of a column value for group keys.
    pub fn group_str(&self, key: Option<KeyId>, row: usize) -> Option<String> {
        let key = key?;
        if let Some(col) = self.str_columns.get(&key) {
            return col.get(row).map(|s| s.to_string());
        }
        if let Some(col) = self.int_columns.get(&key) {
            return col.get(row).map(|v| v.to_string());
        }
        None
    }

    /// Reassemble a whole record from the loaded columns, fields in key
    /// id order.
    pub fn materialize(&self, table: &Table, row: usize) -> SavedRecord {
        let mut names: Vec<(KeyId, &str)> = table
            .key_table
            .iter()
            .map(|(name, id)| (*id, name.as_str()))
            .collect();
        names.sort();

        let mut record = SavedRecord::new();
        for (id, name) in names {
            if let Some(col) = self.int_columns.get(&id) {
                if let Some(v) = col.get(row) {
                    record.ints.push((name.to_string(), v));
                }
            } else if let Some(col) = self.str_columns.get(&id) {
                if let Some(v) = col.get(row) {
                    record.strs.push((name.to_string(), v.to_string()));
                }
            } else if let Some(col) = self.set_columns.get(&id) {
                if let Some(ids) = col.get(row) {
                    let values = ids
                        .iter()
                        .filter_map(|i| col.dict.get(*i as usize).cloned())
                        .collect();
                    record.sets.push((name.to_string(), values));
                }
            }
        }
        record
    }

    /// Hand unpack buffers back to the pool once a scan is done.
    pub fn recycle(self, pool: &BufferPool) {
        for (_, col) in self.int_columns {
            pool.put_ints(col.values);
        }
    }
}

fn decode_column<T: serde::de::DeserializeOwned>(
    dir: &Path,
    kind: &str,
    name: &str,
) -> Result<T> {
    let plain = dir.join(column_file(kind, name, false));
    let path: PathBuf = encoding::find_variant(&plain)
        .ok_or_else(|| CaskError::MissingColumn(plain.to_string_lossy().to_string()))?;
    encoding::decode(&path)
}
