//! Record representations

use serde::{Deserialize, Serialize};

/// Key id: a small dense integer assigned per table, never reused.
pub type KeyId = u16;

/// Which kind of value a record holds for a given key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColType {
    None = 0,
    Int = 1,
    Str = 2,
    Set = 3,
}

impl Default for ColType {
    fn default() -> Self {
        ColType::None
    }
}

/// A fully materialized record as stored in the ingestion log.
///
/// Field names are carried as strings; key ids are assigned by the
/// table when the record is digested into a column block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedRecord {
    pub ints: Vec<(String, i64)>,
    pub strs: Vec<(String, String)>,
    pub sets: Vec<(String, Vec<String>)>,
}

impl SavedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn int(mut self, name: &str, value: i64) -> Self {
        self.ints.push((name.to_string(), value));
        self
    }

    pub fn str(mut self, name: &str, value: &str) -> Self {
        self.strs.push((name.to_string(), value.to_string()));
        self
    }

    pub fn set(mut self, name: &str, values: Vec<String>) -> Self {
        self.sets.push((name.to_string(), values));
        self
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.ints.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.strs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_set(&self, name: &str) -> Option<&[String]> {
        self.sets
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }
}

/// Dense in-memory record: three parallel arrays indexed by key id plus
/// a populated tag per key. String and set values are ids into the
/// owning block's dictionaries; no per-value boxing.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub populated: Vec<ColType>,
    pub ints: Vec<i64>,
    pub strs: Vec<i32>,
    pub sets: Vec<Vec<i32>>,
}

impl Record {
    pub fn with_fields(num_keys: usize) -> Self {
        let mut r = Self::default();
        r.resize_fields(num_keys);
        r
    }

    /// Grow-only resize triggered by key-id growth.
    pub fn resize_fields(&mut self, num_keys: usize) {
        if num_keys <= self.populated.len() {
            return;
        }
        self.populated.resize(num_keys, ColType::None);
        self.ints.resize(num_keys, 0);
        self.strs.resize(num_keys, 0);
        self.sets.resize(num_keys, Vec::new());
    }

    pub fn get_int(&self, key: KeyId) -> Option<i64> {
        let k = key as usize;
        if k < self.populated.len() && self.populated[k] == ColType::Int {
            Some(self.ints[k])
        } else {
            None
        }
    }

    pub fn get_str_id(&self, key: KeyId) -> Option<i32> {
        let k = key as usize;
        if k < self.populated.len() && self.populated[k] == ColType::Str {
            Some(self.strs[k])
        } else {
            None
        }
    }

    pub fn get_set_ids(&self, key: KeyId) -> Option<&[i32]> {
        let k = key as usize;
        if k < self.populated.len() && self.populated[k] == ColType::Set {
            Some(&self.sets[k])
        } else {
            None
        }
    }

    pub fn set_int(&mut self, key: KeyId, value: i64) {
        self.resize_fields(key as usize + 1);
        self.populated[key as usize] = ColType::Int;
        self.ints[key as usize] = value;
    }

    pub fn set_str(&mut self, key: KeyId, value_id: i32) {
        self.resize_fields(key as usize + 1);
        self.populated[key as usize] = ColType::Str;
        self.strs[key as usize] = value_id;
    }

    pub fn set_set(&mut self, key: KeyId, value_ids: Vec<i32>) {
        self.resize_fields(key as usize + 1);
        self.populated[key as usize] = ColType::Set;
        self.sets[key as usize] = value_ids;
    }
}
