//! Histogram data structures
//!
//! Two interchangeable implementations behind one capability set: a
//! flat [`BasicHist`] and a nested logarithmic [`MultiHist`] for values
//! spanning many orders of magnitude. The variant is chosen once per
//! query.

mod basic;
mod multi;

pub use basic::BasicHist;
pub use multi::MultiHist;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::NUM_BUCKETS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistKind {
    Basic,
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramParameters {
    pub kind: HistKind,
    pub bucket_size: Option<i64>,
    pub weighted: bool,
}

impl Default for HistogramParameters {
    fn default() -> Self {
        Self {
            kind: HistKind::Basic,
            bucket_size: None,
            weighted: false,
        }
    }
}

/// Bucket size when the caller does not supply one.
pub fn default_bucket_size(min: i64, max: i64) -> i64 {
    let span = max.saturating_sub(min);
    (span / NUM_BUCKETS).max(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Hist {
    Basic(BasicHist),
    Multi(MultiHist),
}

impl Hist {
    /// Build a histogram for a column with the given value range.
    pub fn new(params: &HistogramParameters, min: i64, max: i64) -> Self {
        match params.kind {
            HistKind::Basic => {
                let bucket_size = params
                    .bucket_size
                    .filter(|b| *b > 0)
                    .unwrap_or_else(|| default_bucket_size(min, max));
                Hist::Basic(BasicHist::new(min, max, bucket_size))
            }
            HistKind::Multi => Hist::Multi(MultiHist::new(min, max)),
        }
    }

    pub fn add_value(&mut self, v: i64) {
        self.add_weighted_value(v, 1);
    }

    pub fn add_weighted_value(&mut self, v: i64, w: i64) {
        match self {
            Hist::Basic(h) => h.add_weighted_value(v, w),
            Hist::Multi(h) => h.add_weighted_value(v, w),
        }
    }

    pub fn merge(&mut self, other: &Hist) {
        match (self, other) {
            (Hist::Basic(a), Hist::Basic(b)) => a.merge(b),
            (Hist::Multi(a), Hist::Multi(b)) => a.merge(b),
            // Mixed kinds only happen on a mis-matched cache entry;
            // fold the foreign buckets in by their start values.
            (a, b) => {
                for (start, count) in b.buckets() {
                    a.add_weighted_value(start, count);
                }
            }
        }
    }

    pub fn range(&self) -> (i64, i64) {
        match self {
            Hist::Basic(h) => h.range(),
            Hist::Multi(h) => h.range(),
        }
    }

    pub fn count(&self) -> i64 {
        match self {
            Hist::Basic(h) => h.count,
            Hist::Multi(h) => h.count,
        }
    }

    pub fn mean(&self) -> f64 {
        match self {
            Hist::Basic(h) => h.mean(),
            Hist::Multi(h) => h.mean(),
        }
    }

    pub fn variance(&self) -> f64 {
        match self {
            Hist::Basic(h) => h.variance(),
            Hist::Multi(h) => h.variance(),
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Sparse bucket map: bucket start value -> count.
    pub fn buckets(&self) -> BTreeMap<i64, i64> {
        match self {
            Hist::Basic(h) => h.buckets(),
            Hist::Multi(h) => h.buckets(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bucket_size() {
        assert_eq!(default_bucket_size(0, 1000), 10);
        assert_eq!(default_bucket_size(0, 5), 1);
        assert_eq!(default_bucket_size(7, 7), 1);
    }

    #[test]
    fn test_kind_dispatch() {
        let params = HistogramParameters {
            kind: HistKind::Multi,
            ..Default::default()
        };
        let h = Hist::new(&params, 0, 100);
        assert!(matches!(h, Hist::Multi(_)));
    }

    #[test]
    fn test_merge_is_additive() {
        let params = HistogramParameters::default();
        let mut h1 = Hist::new(&params, 0, 100);
        let mut h2 = Hist::new(&params, 0, 100);

        for v in [1, 5, 50, 99] {
            h1.add_value(v);
        }
        for v in [2, 50, 75] {
            h2.add_value(v);
        }

        let c1 = h1.count();
        let m1 = h1.mean();
        let c2 = h2.count();
        let m2 = h2.mean();
        let b1 = h1.buckets();
        let b2 = h2.buckets();

        h1.merge(&h2);

        assert_eq!(h1.count(), c1 + c2);
        let expected_mean = (m1 * c1 as f64 + m2 * c2 as f64) / (c1 + c2) as f64;
        assert!((h1.mean() - expected_mean).abs() <= 1e-9);

        for (start, count) in h1.buckets() {
            let expect = b1.get(&start).copied().unwrap_or(0) + b2.get(&start).copied().unwrap_or(0);
            assert_eq!(count, expect);
        }
    }
}
