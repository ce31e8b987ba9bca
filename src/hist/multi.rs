//! Nested logarithmic histogram
//!
//! Values land in a bank selected by `floor(log2(|v| + 1))`, mirrored
//! for negatives; each bank is a small flat histogram over the bank's
//! local range. Suited to columns spanning many orders of magnitude.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::basic::BasicHist;
use crate::NUM_BUCKETS;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiHist {
    pub min: i64,
    pub max: i64,
    pub count: i64,
    banks: BTreeMap<i32, BasicHist>,
    sum: f64,
    sum_sq: f64,
}

/// Bank index: 0 for v == 0, `floor(log2(v + 1))` for positives,
/// mirrored negative indices for negatives.
fn bank_for(v: i64) -> i32 {
    let magnitude = v.unsigned_abs();
    let log = (64 - (magnitude + 1).leading_zeros() - 1) as i32;
    if v < 0 {
        -(log + 1)
    } else {
        log
    }
}

/// Inclusive value range covered by a bank.
fn bank_range(bank: i32) -> (i64, i64) {
    let b = if bank < 0 { (-bank - 1) as u32 } else { bank as u32 };
    let lo = ((1i128 << b) - 1).min(i64::MAX as i128) as i64;
    let hi = ((1i128 << (b + 1)) - 2).min(i64::MAX as i128) as i64;
    if bank < 0 {
        (-hi, -lo)
    } else {
        (lo, hi)
    }
}

impl MultiHist {
    pub fn new(min: i64, max: i64) -> Self {
        Self {
            min,
            max,
            count: 0,
            banks: BTreeMap::new(),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub fn add_value(&mut self, v: i64) {
        self.add_weighted_value(v, 1);
    }

    pub fn add_weighted_value(&mut self, v: i64, w: i64) {
        let bank = bank_for(v);
        let hist = self.banks.entry(bank).or_insert_with(|| {
            let (lo, hi) = bank_range(bank);
            let bucket_size = (hi.saturating_sub(lo) / NUM_BUCKETS).max(1);
            BasicHist::new(lo, hi, bucket_size)
        });
        hist.add_weighted_value(v, w);
        self.count += w;
        self.sum += v as f64 * w as f64;
        self.sum_sq += (v as f64) * (v as f64) * w as f64;
    }

    /// Bank-wise merge.
    pub fn merge(&mut self, other: &MultiHist) {
        for (bank, hist) in &other.banks {
            match self.banks.get_mut(bank) {
                Some(mine) => mine.merge(hist),
                None => {
                    self.banks.insert(*bank, hist.clone());
                }
            }
        }
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn range(&self) -> (i64, i64) {
        (self.min, self.max)
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        self.sum_sq / self.count as f64 - mean * mean
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Sparse union of all bank buckets. Bank ranges are disjoint, so
    /// start values never collide across banks.
    pub fn buckets(&self) -> BTreeMap<i64, i64> {
        let mut out = BTreeMap::new();
        for hist in self.banks.values() {
            for (start, count) in hist.buckets() {
                *out.entry(start).or_insert(0) += count;
            }
        }
        out
    }
}
