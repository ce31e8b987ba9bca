//! Table metadata and block management
//!
//! A table is a collection of immutable column blocks plus the mutable
//! cross-block state: the key table (column name -> dense key id), the
//! declared type per key, and global per-int-column min/max. All of it
//! is persisted in the table root's `info.db`, rewritten atomically
//! under the `info` lock.

pub mod block;
pub mod digest;

pub use block::TableBlock;
pub use digest::DigestStats;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::data::{ColType, KeyId};
use crate::storage::encoding;
use crate::storage::lock::{Lock, STOMACHE_DIR};
use crate::storage::rowlog::INGEST_DIR;
use crate::{CaskError, Result};

pub const INFO_FILE: &str = "info.db";
pub const CACHE_DIR: &str = "cache";

/// Global or per-block range of an int column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntInfo {
    pub min: i64,
    pub max: i64,
}

impl IntInfo {
    pub fn of(value: i64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    pub fn update(&mut self, value: i64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn widen(&mut self, other: &IntInfo) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

/// Per-block column metadata stored in the block's local `info.db`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub num_records: u32,
    pub int_cols: BTreeMap<String, IntInfo>,
    /// Column name -> dictionary cardinality.
    pub str_cols: BTreeMap<String, u32>,
    pub set_cols: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSummary {
    /// Block directory name relative to the table root.
    pub name: String,
    pub info: BlockInfo,
}

/// The serialized shape of a table's root `info.db`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TableInfo {
    key_table: HashMap<String, KeyId>,
    key_types: HashMap<KeyId, ColType>,
    int_info: HashMap<KeyId, IntInfo>,
    blocks: Vec<BlockSummary>,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub settings: Settings,
    pub key_table: HashMap<String, KeyId>,
    pub key_types: HashMap<KeyId, ColType>,
    pub int_info: HashMap<KeyId, IntInfo>,
    pub blocks: Vec<BlockSummary>,
    /// Blocks whose local info could not be read during discovery.
    pub broken_blocks: Vec<String>,
}

impl Table {
    pub fn open(settings: Settings, name: &str) -> Self {
        Self {
            name: name.to_string(),
            settings,
            key_table: HashMap::new(),
            key_types: HashMap::new(),
            int_info: HashMap::new(),
            blocks: Vec::new(),
            broken_blocks: Vec::new(),
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.settings.table_dir(&self.name)
    }

    pub fn exists(&self) -> bool {
        self.dir().is_dir()
    }

    pub fn make_dir(&self) -> Result<()> {
        fs::create_dir_all(self.dir().join(INGEST_DIR))?;
        Ok(())
    }

    fn info_path(&self) -> PathBuf {
        self.dir().join(INFO_FILE)
    }

    /// List table names under the settings root.
    pub fn list_tables(settings: &Settings) -> Vec<String> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&settings.dir) {
            Ok(entries) => entries,
            Err(_) => return names,
        };
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        names
    }

    // ========================================================================
    // Key table
    // ========================================================================

    pub fn get_key_id(&self, name: &str) -> Option<KeyId> {
        self.key_table.get(name).copied()
    }

    /// Id for a column name, assigned densely on first sight.
    pub fn key_id(&mut self, name: &str) -> KeyId {
        if let Some(id) = self.key_table.get(name) {
            return *id;
        }
        let id = self.key_table.len() as KeyId;
        self.key_table.insert(name.to_string(), id);
        id
    }

    pub fn key_name(&self, id: KeyId) -> Option<&str> {
        self.key_table
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.as_str())
    }

    /// Declare a key's type. Types are monotone: conflicting declarations
    /// abort the caller.
    pub fn set_key_type(&mut self, id: KeyId, incoming: ColType) -> Result<()> {
        match self.key_types.get(&id) {
            Some(existing) if *existing != incoming => Err(CaskError::TypeConflict {
                column: self.key_name(id).unwrap_or("?").to_string(),
                existing: *existing,
                incoming,
            }),
            Some(_) => Ok(()),
            None => {
                self.key_types.insert(id, incoming);
                Ok(())
            }
        }
    }

    pub fn col_type(&self, name: &str) -> ColType {
        self.get_key_id(name)
            .and_then(|id| self.key_types.get(&id).copied())
            .unwrap_or(ColType::None)
    }

    pub fn update_int_info(&mut self, id: KeyId, value: i64) {
        self.int_info
            .entry(id)
            .and_modify(|info| info.update(value))
            .or_insert_with(|| IntInfo::of(value));
    }

    pub fn int_info_for(&self, name: &str) -> Option<IntInfo> {
        self.get_key_id(name)
            .and_then(|id| self.int_info.get(&id).copied())
    }

    /// A name mapped to two ids (or two names to one id) is fatal.
    pub fn verify_key_table(&self) -> Result<()> {
        let mut seen: HashMap<KeyId, &str> = HashMap::new();
        for (name, id) in &self.key_table {
            if let Some(other) = seen.insert(*id, name) {
                return Err(CaskError::KeyTableInconsistency(format!(
                    "key id {} claimed by both {} and {}",
                    id, other, name
                )));
            }
        }
        Ok(())
    }

    pub fn record_count(&self) -> u64 {
        self.blocks.iter().map(|b| b.info.num_records as u64).sum()
    }

    // ========================================================================
    // Locks
    // ========================================================================

    pub fn lock(&self, name: &str) -> Lock {
        Lock::new(&self.dir(), name)
    }

    pub fn grab_info_lock(&self) -> bool {
        self.lock("info").grab()
    }

    pub fn release_info_lock(&self) -> Result<()> {
        self.lock("info").release()
    }

    pub fn grab_digest_lock(&self) -> bool {
        self.lock("digest").grab()
    }

    pub fn release_digest_lock(&self) -> Result<()> {
        self.lock("digest").release()
    }

    // ========================================================================
    // Info persistence
    // ========================================================================

    fn apply_info(&mut self, info: TableInfo) {
        self.key_table = info.key_table;
        self.key_types = info.key_types;
        self.int_info = info.int_info;
        self.blocks = info.blocks;
    }

    fn to_info(&self) -> TableInfo {
        TableInfo {
            key_table: self.key_table.clone(),
            key_types: self.key_types.clone(),
            int_info: self.int_info.clone(),
            blocks: self.blocks.clone(),
        }
    }

    /// Load `info.db`, falling back to block discovery when it is absent
    /// or unreadable. Also picks up blocks on disk that the info file
    /// does not know about yet.
    pub fn load_info(&mut self) -> Result<()> {
        if !self.exists() {
            return Err(CaskError::TableNotFound(self.name.clone()));
        }
        match encoding::decode::<TableInfo>(&self.info_path()) {
            Ok(info) => self.apply_info(info),
            Err(e) => {
                log::warn!(
                    "table {} info.db unreadable ({}); deducing from blocks",
                    self.name,
                    e
                );
                self.deduce_info_from_blocks();
            }
        }
        self.discover_new_blocks();
        self.verify_key_table()
    }

    /// Rewrite `info.db` under the info lock.
    pub fn save_info(&self) -> Result<()> {
        if !self.grab_info_lock() {
            return Err(CaskError::LockContended("info".to_string()));
        }
        let result = encoding::encode_atomic(&self.info_path(), &self.to_info());
        self.release_info_lock()?;
        result
    }

    // ========================================================================
    // Block discovery / repair
    // ========================================================================

    fn looks_like_block(path: &PathBuf) -> bool {
        if !path.is_dir() {
            return false;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        !matches!(name, INGEST_DIR | STOMACHE_DIR | CACHE_DIR) && !name.ends_with(".partial")
    }

    fn block_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        let entries = match fs::read_dir(self.dir()) {
            Ok(entries) => entries,
            Err(_) => return dirs,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if Self::looks_like_block(&path) {
                dirs.push(path);
            }
        }
        dirs.sort();
        dirs
    }

    fn read_block_info(&self, dir: &PathBuf) -> Option<BlockInfo> {
        let info: BlockInfo = match encoding::decode(&dir.join(INFO_FILE)) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("broken block {:?}: {}", dir, e);
                return None;
            }
        };
        if info.num_records == 0 {
            return None;
        }
        Some(info)
    }

    fn absorb_block_columns(&mut self, info: &BlockInfo) {
        for (col, range) in &info.int_cols {
            let id = self.key_id(col);
            if self.set_key_type(id, ColType::Int).is_err() {
                log::warn!("type conflict on column {} during discovery", col);
                continue;
            }
            self.int_info
                .entry(id)
                .and_modify(|i| i.widen(range))
                .or_insert(*range);
        }
        for col in info.str_cols.keys() {
            let id = self.key_id(col);
            if self.set_key_type(id, ColType::Str).is_err() {
                log::warn!("type conflict on column {} during discovery", col);
            }
        }
        for col in info.set_cols.keys() {
            let id = self.key_id(col);
            if self.set_key_type(id, ColType::Set).is_err() {
                log::warn!("type conflict on column {} during discovery", col);
            }
        }
    }

    /// Rebuild all metadata by scanning block directories. Broken blocks
    /// are collected and reported, not fatal.
    pub fn deduce_info_from_blocks(&mut self) {
        self.blocks.clear();
        self.broken_blocks.clear();

        for dir in self.block_dirs() {
            let name = dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            match self.read_block_info(&dir) {
                Some(info) => {
                    self.absorb_block_columns(&info);
                    self.blocks.push(BlockSummary { name, info });
                }
                None => self.broken_blocks.push(name),
            }
        }
        if !self.broken_blocks.is_empty() {
            log::warn!(
                "table {} has {} broken blocks: {:?}",
                self.name,
                self.broken_blocks.len(),
                self.broken_blocks
            );
        }
    }

    /// Register blocks present on disk but missing from the info file
    /// (a digest that crashed between block rename and info rewrite).
    fn discover_new_blocks(&mut self) {
        let known: std::collections::HashSet<&str> =
            self.blocks.iter().map(|b| b.name.as_str()).collect();
        let unknown: Vec<PathBuf> = self
            .block_dirs()
            .into_iter()
            .filter(|dir| {
                dir.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| !known.contains(n))
            })
            .collect();

        for dir in unknown {
            let name = dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            match self.read_block_info(&dir) {
                Some(info) => {
                    log::debug!("discovered unregistered block {}", name);
                    self.absorb_block_columns(&info);
                    self.blocks.push(BlockSummary { name, info });
                }
                None => self.broken_blocks.push(name),
            }
        }
    }

    /// Recompute metadata from block contents and rewrite the info file.
    pub fn update_info(&mut self) -> Result<()> {
        self.deduce_info_from_blocks();
        self.verify_key_table()?;
        self.save_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_table(dir: &std::path::Path) -> Table {
        let mut settings = Settings::default();
        settings.dir = dir.to_path_buf();
        Table::open(settings, "events")
    }

    #[test]
    fn test_key_ids_dense_from_zero() {
        let dir = tempdir().unwrap();
        let mut t = test_table(dir.path());

        assert_eq!(t.key_id("a"), 0);
        assert_eq!(t.key_id("b"), 1);
        assert_eq!(t.key_id("a"), 0);
        assert_eq!(t.key_name(1), Some("b"));
    }

    #[test]
    fn test_key_type_is_monotone() {
        let dir = tempdir().unwrap();
        let mut t = test_table(dir.path());

        let id = t.key_id("age");
        t.set_key_type(id, ColType::Int).unwrap();
        t.set_key_type(id, ColType::Int).unwrap();
        assert!(matches!(
            t.set_key_type(id, ColType::Str),
            Err(CaskError::TypeConflict { .. })
        ));
    }

    #[test]
    fn test_verify_key_table_catches_duplicate_id() {
        let dir = tempdir().unwrap();
        let mut t = test_table(dir.path());
        t.key_table.insert("a".to_string(), 0);
        t.key_table.insert("b".to_string(), 0);
        assert!(t.verify_key_table().is_err());
    }

    #[test]
    fn test_info_roundtrip() {
        let dir = tempdir().unwrap();
        let mut t = test_table(dir.path());
        t.make_dir().unwrap();

        let id = t.key_id("age");
        t.set_key_type(id, ColType::Int).unwrap();
        t.update_int_info(id, 10);
        t.update_int_info(id, 30);
        t.save_info().unwrap();

        let mut back = test_table(dir.path());
        back.load_info().unwrap();
        assert_eq!(back.get_key_id("age"), Some(id));
        assert_eq!(back.col_type("age"), ColType::Int);
        assert_eq!(
            back.int_info_for("age"),
            Some(IntInfo { min: 10, max: 30 })
        );
    }

    #[test]
    fn test_load_info_missing_table_is_fatal() {
        let dir = tempdir().unwrap();
        let mut t = test_table(dir.path());
        assert!(matches!(
            t.load_info(),
            Err(CaskError::TableNotFound(_))
        ));
    }

    #[test]
    fn test_int_info_widens() {
        let mut info = IntInfo::of(5);
        info.update(3);
        info.update(9);
        assert_eq!(info, IntInfo { min: 3, max: 9 });
        info.widen(&IntInfo { min: -1, max: 4 });
        assert_eq!(info, IntInfo { min: -1, max: 9 });
    }
}
