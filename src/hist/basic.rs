//! Flat fixed-bucket histogram

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Flat histogram over `[min, max]` with equal-width buckets. Tracks
/// running count, sum and sum-of-squares for O(1) mean/variance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicHist {
    pub min: i64,
    pub max: i64,
    pub bucket_size: i64,
    pub count: i64,
    buckets: Vec<i64>,
    sum: f64,
    sum_sq: f64,
}

impl BasicHist {
    pub fn new(min: i64, max: i64, bucket_size: i64) -> Self {
        let bucket_size = bucket_size.max(1);
        let span = max.saturating_sub(min).max(0) as i128;
        let num_buckets = (span / bucket_size as i128 + 1).min(1 << 24) as usize;
        Self {
            min,
            max,
            bucket_size,
            count: 0,
            buckets: vec![0; num_buckets],
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    fn bucket_index(&self, v: i64) -> usize {
        let off = (v as i128 - self.min as i128) / self.bucket_size as i128;
        off.clamp(0, self.buckets.len() as i128 - 1) as usize
    }

    pub fn add_value(&mut self, v: i64) {
        self.add_weighted_value(v, 1);
    }

    pub fn add_weighted_value(&mut self, v: i64, w: i64) {
        let idx = self.bucket_index(v);
        self.buckets[idx] += w;
        self.count += w;
        self.sum += v as f64 * w as f64;
        self.sum_sq += (v as f64) * (v as f64) * w as f64;
    }

    pub fn merge(&mut self, other: &BasicHist) {
        if self.min == other.min && self.bucket_size == other.bucket_size
            && self.buckets.len() == other.buckets.len()
        {
            for (b, ob) in self.buckets.iter_mut().zip(other.buckets.iter()) {
                *b += ob;
            }
        } else {
            // Layout mismatch: reroute the other side's buckets.
            for (start, count) in other.buckets() {
                let idx = self.bucket_index(start);
                self.buckets[idx] += count;
            }
        }
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
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

    /// Sparse map of bucket start value -> count.
    pub fn buckets(&self) -> BTreeMap<i64, i64> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, c)| **c != 0)
            .map(|(i, c)| (self.min + i as i64 * self.bucket_size, *c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_routing_and_clipping() {
        let mut h = BasicHist::new(0, 99, 10);
        h.add_value(5);
        h.add_value(15);
        h.add_value(15);
        // Out-of-range values clip to the edge buckets.
        h.add_value(-100);
        h.add_value(1000);

        let buckets = h.buckets();
        assert_eq!(buckets.get(&0), Some(&2));
        assert_eq!(buckets.get(&10), Some(&2));
        assert_eq!(buckets.get(&90), Some(&1));
        assert_eq!(h.count, 5);
    }

    #[test]
    fn test_stats() {
        let mut h = BasicHist::new(0, 10, 1);
        for v in [2, 4, 4, 4, 5, 5, 7, 9] {
            h.add_value(v);
        }
        assert!((h.mean() - 5.0).abs() < 1e-9);
        assert!((h.variance() - 4.0).abs() < 1e-9);
        assert!((h.stddev() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_values() {
        let mut h = BasicHist::new(0, 10, 1);
        h.add_weighted_value(2, 3);
        h.add_weighted_value(8, 1);
        assert_eq!(h.count, 4);
        assert!((h.mean() - 3.5).abs() < 1e-9);
        assert_eq!(h.buckets().get(&2), Some(&3));
    }

    #[test]
    fn test_merge_bucket_by_bucket() {
        let mut h1 = BasicHist::new(0, 99, 10);
        let mut h2 = BasicHist::new(0, 99, 10);
        for v in [1, 11, 21] {
            h1.add_value(v);
        }
        for v in [11, 31] {
            h2.add_value(v);
        }
        let before = h1.buckets();
        h1.merge(&h2);
        assert_eq!(h1.count, 5);
        assert_eq!(h1.buckets().get(&10).copied(), Some(2));
        assert_eq!(
            h1.buckets().get(&0).copied(),
            before.get(&0).copied()
        );
    }
}
