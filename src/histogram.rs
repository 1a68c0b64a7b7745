//! Chunk weight statistics histograms.

use serde::Serialize;

use crate::models::ChunkStatistics;

/// Base bounds of the geometric bucket schedule.
const BASE_BOUNDS: [u64; 10] = [1, 2, 4, 8, 16, 32, 64, 125, 250, 500];
/// The number of bounds which are repeated at a scale of 1000.
const SCALED_BOUND_COUNT: usize = 28;

/// The fixed bucket bounds shared by all histograms.
///
/// The base bounds are followed by the first 28 bounds scaled by 1000, i.e. the scale is
/// applied twice to the base bounds and once more to the first 8 of them.
pub fn bucket_bounds() -> Vec<u64> {
    let mut bounds = BASE_BOUNDS.to_vec();
    for idx in 0..SCALED_BOUND_COUNT {
        bounds.push(bounds[idx] * 1000);
    }
    bounds
}

/// A histogram over the fixed geometric bucket schedule, with a trailing overflow bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Histogram {
    bounds: Vec<u64>,
    counts: Vec<u64>,
}

impl Default for Histogram {
    fn default() -> Self {
        let bounds = bucket_bounds();
        let counts = vec![0; bounds.len() + 1];
        Self { bounds, counts }
    }
}

impl Histogram {
    /// The index of the bucket holding the given value.
    pub fn bucket_of(&self, value: u64) -> usize {
        self.bounds.partition_point(|bound| *bound < value)
    }

    pub fn add(&mut self, value: u64) {
        let idx = self.bucket_of(value);
        self.counts[idx] += 1;
    }

    pub fn remove(&mut self, value: u64) {
        let idx = self.bucket_of(value);
        self.counts[idx] = self.counts[idx].saturating_sub(1);
    }

    pub fn bounds(&self) -> &[u64] {
        &self.bounds
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// The total number of values in this histogram.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// Histograms of the weight statistics of all live chunks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WeightHistograms {
    pub row_count: Histogram,
    pub compressed_data_size: Histogram,
    pub uncompressed_data_size: Histogram,
    pub data_weight: Histogram,
}

impl WeightHistograms {
    pub fn add(&mut self, stats: &ChunkStatistics) {
        self.row_count.add(stats.row_count);
        self.compressed_data_size.add(stats.compressed_data_size);
        self.uncompressed_data_size.add(stats.uncompressed_data_size);
        self.data_weight.add(stats.data_weight);
    }

    pub fn remove(&mut self, stats: &ChunkStatistics) {
        self.row_count.remove(stats.row_count);
        self.compressed_data_size.remove(stats.compressed_data_size);
        self.uncompressed_data_size.remove(stats.uncompressed_data_size);
        self.data_weight.remove(stats.data_weight);
    }
}
