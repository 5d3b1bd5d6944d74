//! Comparison metrics for vector search.
//!
//! The metric decides the comparison direction everywhere results are
//! ranked: inner product treats larger scores as better, squared L2 treats
//! smaller distances as better. Heap orderings and range-search admission
//! both derive from it.

use serde::{Deserialize, Serialize};

/// Distance/similarity metric of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricType {
    /// Squared Euclidean distance; smaller is better.
    L2,
    /// Inner product (MIPS); larger is better.
    InnerProduct,
}

impl MetricType {
    /// Whether larger values rank higher under this metric.
    pub fn is_similarity(self) -> bool {
        matches!(self, MetricType::InnerProduct)
    }
}

/// Squared Euclidean distance between two vectors of equal length.
#[inline]
pub fn l2_sqr(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Inner product of two vectors of equal length.
#[inline]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(&x, &y)| x * y).sum()
}
