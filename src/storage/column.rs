//! Per-block column files
//!
//! Each materialized column lives in its own file: `int_<name>.db`,
//! `str_<name>.db` or `set_<name>.db` (optionally `.gz`). Columns are
//! dense: every column in a block holds exactly the block's record
//! count of entries, with a presence bitmap marking which records
//! populate the column. Int values are bit-packed as offsets from the
//! column minimum; str and set values go through a block-local
//! dictionary that preserves insertion order.

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::bits;
use crate::config::OutlierPolicy;

/// Opt-in recycling of column unpack buffers, so steady-state memory
/// stays at roughly workers x per-block footprint. When unused, every
/// block allocates freshly. Buffers are cleared on return to the pool.
#[derive(Debug, Default)]
pub struct BufferPool {
    ints: Mutex<Vec<Vec<i64>>>,
}

impl BufferPool {
    pub fn get_ints(&self) -> Vec<i64> {
        self.ints.lock().pop().unwrap_or_default()
    }

    pub fn put_ints(&self, mut buf: Vec<i64>) {
        buf.clear();
        self.ints.lock().push(buf);
    }
}

/// Presence bitmap, one bit per record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bitmap {
    bits: Vec<u8>,
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0u8; (len + 7) / 8],
            len,
        }
    }

    pub fn set(&mut self, i: usize) {
        self.bits[i / 8] |= 1 << (i % 8);
    }

    pub fn get(&self, i: usize) -> bool {
        i < self.len && self.bits[i / 8] & (1 << (i % 8)) != 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn count_set(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }
}

/// Block-local dictionary builder. Ids are assigned in insertion order.
#[derive(Debug, Default)]
pub struct DictBuilder {
    values: Vec<String>,
    lookup: AHashMap<String, i32>,
}

impl DictBuilder {
    pub fn intern(&mut self, value: &str) -> i32 {
        if let Some(id) = self.lookup.get(value) {
            return *id;
        }
        let id = self.values.len() as i32;
        self.values.push(value.to_string());
        self.lookup.insert(value.to_string(), id);
        id
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<String> {
        self.values
    }
}

// ============================================================================
// On-disk column forms
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedIntColumn {
    pub name: String,
    pub min: i64,
    pub max: i64,
    pub bit_width: u8,
    pub count: u32,
    pub packed: Vec<u8>,
    pub present: Bitmap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedStrColumn {
    pub name: String,
    /// value_id -> string, insertion order.
    pub dict: Vec<String>,
    pub bit_width: u8,
    pub count: u32,
    pub packed: Vec<u8>,
    pub present: Bitmap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSetColumn {
    pub name: String,
    pub dict: Vec<String>,
    /// Per-record ordered value id lists.
    pub values: Vec<Vec<i32>>,
    pub present: Bitmap,
}

impl SavedIntColumn {
    /// Pack per-record values. The range is taken from the data unless a
    /// declared range is supplied; values outside a declared range are
    /// clipped, or the record indices are reported for dropping when the
    /// policy says skip.
    pub fn pack(
        name: &str,
        rows: &[Option<i64>],
        declared: Option<(i64, i64)>,
        policy: OutlierPolicy,
    ) -> (Self, Vec<usize>) {
        let (min, max) = match declared {
            Some(range) => range,
            None => {
                let mut min = i64::MAX;
                let mut max = i64::MIN;
                for v in rows.iter().flatten() {
                    min = min.min(*v);
                    max = max.max(*v);
                }
                if min > max {
                    (0, 0)
                } else {
                    (min, max)
                }
            }
        };

        let mut dropped = Vec::new();
        let mut present = Bitmap::new(rows.len());
        let width = bits::width_for_range(min, max);
        let mut offsets = vec![0u64; rows.len()];

        for (i, row) in rows.iter().enumerate() {
            let v = match row {
                Some(v) => *v,
                None => continue,
            };
            let v = if v < min || v > max {
                match policy {
                    OutlierPolicy::Skip => {
                        dropped.push(i);
                        continue;
                    }
                    OutlierPolicy::Clip => {
                        log::warn!("clipping outlier {} in column {} to [{}, {}]", v, name, min, max);
                        v.clamp(min, max)
                    }
                }
            } else {
                v
            };
            present.set(i);
            offsets[i] = v.wrapping_sub(min) as u64;
        }

        let col = Self {
            name: name.to_string(),
            min,
            max,
            bit_width: width,
            count: rows.len() as u32,
            packed: bits::pack(&offsets, width),
            present,
        };
        (col, dropped)
    }
}

impl SavedStrColumn {
    pub fn pack(name: &str, dict: DictBuilder, ids: &[Option<i32>]) -> Self {
        let max_id = dict.len().saturating_sub(1) as i64;
        let width = bits::width_for_range(0, max_id);
        let mut present = Bitmap::new(ids.len());
        let mut offsets = vec![0u64; ids.len()];
        for (i, id) in ids.iter().enumerate() {
            if let Some(id) = id {
                present.set(i);
                offsets[i] = *id as u64;
            }
        }
        Self {
            name: name.to_string(),
            dict: dict.into_values(),
            bit_width: width,
            count: ids.len() as u32,
            packed: bits::pack(&offsets, width),
            present,
        }
    }
}

impl SavedSetColumn {
    pub fn pack(name: &str, dict: DictBuilder, rows: &[Option<Vec<i32>>]) -> Self {
        let mut present = Bitmap::new(rows.len());
        let mut values = vec![Vec::new(); rows.len()];
        for (i, row) in rows.iter().enumerate() {
            if let Some(ids) = row {
                present.set(i);
                values[i] = ids.clone();
            }
        }
        Self {
            name: name.to_string(),
            dict: dict.into_values(),
            values,
            present,
        }
    }
}

// ============================================================================
// Loaded column forms
// ============================================================================

#[derive(Debug)]
pub struct IntColumn {
    pub min: i64,
    pub max: i64,
    pub values: Vec<i64>,
    pub present: Bitmap,
}

impl IntColumn {
    pub fn from_saved(saved: SavedIntColumn, scratch: Option<Vec<i64>>) -> Self {
        let count = saved.count as usize;
        let offsets = bits::unpack(&saved.packed, count, saved.bit_width);
        let mut values = scratch.unwrap_or_default();
        values.clear();
        values.extend(
            offsets
                .iter()
                .map(|off| saved.min.wrapping_add(*off as i64)),
        );
        Self {
            min: saved.min,
            max: saved.max,
            values,
            present: saved.present,
        }
    }

    pub fn get(&self, row: usize) -> Option<i64> {
        if self.present.get(row) {
            Some(self.values[row])
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub struct StrColumn {
    pub ids: Vec<i32>,
    pub dict: Vec<String>,
    /// O(1) lookup by value, built at load time.
    pub lookup: AHashMap<String, i32>,
    pub present: Bitmap,
}

impl StrColumn {
    pub fn from_saved(saved: SavedStrColumn) -> Self {
        let count = saved.count as usize;
        let ids: Vec<i32> = bits::unpack(&saved.packed, count, saved.bit_width)
            .into_iter()
            .map(|v| v as i32)
            .collect();
        let lookup = saved
            .dict
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as i32))
            .collect();
        Self {
            ids,
            dict: saved.dict,
            lookup,
            present: saved.present,
        }
    }

    pub fn get(&self, row: usize) -> Option<&str> {
        if !self.present.get(row) {
            return None;
        }
        self.dict.get(self.ids[row] as usize).map(|s| s.as_str())
    }

    pub fn id_of(&self, value: &str) -> Option<i32> {
        self.lookup.get(value).copied()
    }
}

#[derive(Debug)]
pub struct SetColumn {
    pub sets: Vec<Vec<i32>>,
    pub dict: Vec<String>,
    pub lookup: AHashMap<String, i32>,
    pub present: Bitmap,
}

impl SetColumn {
    pub fn from_saved(saved: SavedSetColumn) -> Self {
        let lookup = saved
            .dict
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as i32))
            .collect();
        Self {
            sets: saved.values,
            dict: saved.dict,
            lookup,
            present: saved.present,
        }
    }

    pub fn get(&self, row: usize) -> Option<&[i32]> {
        if self.present.get(row) {
            Some(&self.sets[row])
        } else {
            None
        }
    }

    pub fn contains(&self, row: usize, member: &str) -> bool {
        let id = match self.lookup.get(member) {
            Some(id) => *id,
            None => return false,
        };
        self.get(row).map_or(false, |ids| ids.contains(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_column_roundtrip_with_gaps() {
        let rows = vec![Some(10), None, Some(30), Some(12), None];
        let (saved, dropped) = SavedIntColumn::pack("age", &rows, None, OutlierPolicy::Clip);
        assert!(dropped.is_empty());
        assert_eq!(saved.min, 10);
        assert_eq!(saved.max, 30);
        assert_eq!(saved.count, 5);

        let col = IntColumn::from_saved(saved, None);
        assert_eq!(col.get(0), Some(10));
        assert_eq!(col.get(1), None);
        assert_eq!(col.get(2), Some(30));
        assert_eq!(col.get(4), None);
    }

    #[test]
    fn test_int_column_clip_and_skip() {
        let rows = vec![Some(5), Some(500), Some(7)];

        let (saved, dropped) =
            SavedIntColumn::pack("v", &rows, Some((0, 10)), OutlierPolicy::Clip);
        assert!(dropped.is_empty());
        let col = IntColumn::from_saved(saved, None);
        assert_eq!(col.get(1), Some(10));

        let (saved, dropped) =
            SavedIntColumn::pack("v", &rows, Some((0, 10)), OutlierPolicy::Skip);
        assert_eq!(dropped, vec![1]);
        let col = IntColumn::from_saved(saved, None);
        assert_eq!(col.get(1), None);
        assert_eq!(col.get(2), Some(7));
    }

    #[test]
    fn test_big_int_packing() {
        let base = 1i64 << 50;
        let rows: Vec<Option<i64>> = (0..100).map(|i| Some(base + i)).collect();
        let (saved, _) = SavedIntColumn::pack("time", &rows, None, OutlierPolicy::Clip);
        assert_eq!(saved.bit_width, 7);

        let col = IntColumn::from_saved(saved, None);
        for (i, v) in col.values.iter().enumerate() {
            assert_eq!(*v, base + i as i64);
            assert!(*v >= base);
        }
    }

    #[test]
    fn test_dict_preserves_insertion_order() {
        let mut dict = DictBuilder::default();
        assert_eq!(dict.intern("zebra"), 0);
        assert_eq!(dict.intern("apple"), 1);
        assert_eq!(dict.intern("zebra"), 0);
        assert_eq!(dict.into_values(), vec!["zebra", "apple"]);
    }

    #[test]
    fn test_str_column_roundtrip() {
        let mut dict = DictBuilder::default();
        let ids = vec![
            Some(dict.intern("a")),
            Some(dict.intern("b")),
            None,
            Some(dict.intern("a")),
        ];
        let saved = SavedStrColumn::pack("name", dict, &ids);
        let col = StrColumn::from_saved(saved);

        assert_eq!(col.get(0), Some("a"));
        assert_eq!(col.get(1), Some("b"));
        assert_eq!(col.get(2), None);
        assert_eq!(col.get(3), Some("a"));
        assert_eq!(col.id_of("b"), Some(1));
        assert_eq!(col.id_of("zzz"), None);
    }

    #[test]
    fn test_set_column_contains() {
        let mut dict = DictBuilder::default();
        let a = dict.intern("x");
        let b = dict.intern("y");
        let rows = vec![Some(vec![a, b]), Some(vec![b]), None];
        let saved = SavedSetColumn::pack("tags", dict, &rows);
        let col = SetColumn::from_saved(saved);

        assert!(col.contains(0, "x"));
        assert!(col.contains(1, "y"));
        assert!(!col.contains(1, "x"));
        assert!(!col.contains(2, "y"));
        assert!(!col.contains(0, "unseen"));
    }
}
