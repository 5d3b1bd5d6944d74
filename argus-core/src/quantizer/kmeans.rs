//! Lloyd k-means for training the coarse quantizer.

use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metric::{inner_product, l2_sqr};
use crate::quantizer::CoarseQuantizer;
use crate::Idx;

/// Clustering parameters for coarse-quantizer training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringParams {
    /// Number of Lloyd iterations.
    pub niter: usize,
    /// Random seed for centroid initialization.
    pub seed: u64,
    /// Spherical k-means: centroids are L2-normalized after every update
    /// and assignment maximizes inner product. Default for inner-product
    /// indexes.
    pub spherical: bool,
}

impl Default for ClusteringParams {
    fn default() -> Self {
        Self {
            niter: 25,
            seed: 42,
            spherical: false,
        }
    }
}

fn normalize(v: &mut [f32]) {
    let norm = inner_product(v, v).sqrt();
    if norm > 0.0 {
        for x in v {
            *x /= norm;
        }
    }
}

fn find_best(v: &[f32], centroids: &[f32], d: usize, spherical: bool) -> usize {
    let k = centroids.len() / d;
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for c in 0..k {
        let centroid = &centroids[c * d..(c + 1) * d];
        let score = if spherical {
            inner_product(v, centroid)
        } else {
            -l2_sqr(v, centroid)
        };
        if score > best_score {
            best_score = score;
            best = c;
        }
    }
    best
}

/// Run Lloyd k-means over `x.len() / d` vectors and return `k * d`
/// centroid floats.
///
/// When `assign_index` is supplied, nearest-centroid assignment goes
/// through it each iteration (reset, add the current centroids, assign);
/// otherwise assignment is computed directly. The index is left holding
/// whatever the last iteration put in it; the caller decides where the
/// returned centroids go.
pub fn train_kmeans(
    d: usize,
    k: usize,
    x: &[f32],
    params: &ClusteringParams,
    mut assign_index: Option<&mut dyn CoarseQuantizer>,
) -> Result<Vec<f32>> {
    if d == 0 || x.len() % d != 0 {
        return Err(Error::InvalidArgument(format!(
            "training data length {} is not a multiple of dimension {}",
            x.len(),
            d
        )));
    }
    let n = x.len() / d;
    if n < k {
        return Err(Error::InvalidArgument(format!(
            "need at least {} training vectors for {} centroids, got {}",
            k, k, n
        )));
    }

    log::debug!(
        "k-means: {} vectors in {}D, {} centroids, {} iterations{}",
        n,
        d,
        k,
        params.niter,
        if params.spherical { " (spherical)" } else { "" }
    );

    // seeded random init from distinct input points
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut rng);

    let mut centroids: Vec<f32> = indices[..k]
        .iter()
        .flat_map(|&i| x[i * d..(i + 1) * d].iter().copied())
        .collect();
    if params.spherical {
        for c in 0..k {
            normalize(&mut centroids[c * d..(c + 1) * d]);
        }
    }

    let mut assignments = vec![0usize; n];
    let mut index_out = vec![0 as Idx; n];

    for _ in 0..params.niter {
        // assignment step
        if let Some(index) = assign_index.as_deref_mut() {
            index.reset();
            index.add(&centroids)?;
            index.assign(x, &mut index_out)?;
            for (slot, &a) in assignments.iter_mut().zip(index_out.iter()) {
                *slot = a.max(0) as usize;
            }
        } else {
            for (i, slot) in assignments.iter_mut().enumerate() {
                *slot = find_best(&x[i * d..(i + 1) * d], &centroids, d, params.spherical);
            }
        }

        // update step
        let mut sums = vec![0.0f32; k * d];
        let mut counts = vec![0usize; k];
        for (i, &c) in assignments.iter().enumerate() {
            counts[c] += 1;
            let sum = &mut sums[c * d..(c + 1) * d];
            for (s, &v) in sum.iter_mut().zip(&x[i * d..(i + 1) * d]) {
                *s += v;
            }
        }
        for c in 0..k {
            // empty clusters keep their previous centroid
            if counts[c] == 0 {
                continue;
            }
            let centroid = &mut centroids[c * d..(c + 1) * d];
            for (out, &s) in centroid.iter_mut().zip(&sums[c * d..(c + 1) * d]) {
                *out = s / counts[c] as f32;
            }
            if params.spherical {
                normalize(centroid);
            }
        }
    }

    Ok(centroids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovers_separated_clusters() {
        // four tight pairs far apart: centroids converge to pair means
        let x = vec![
            0.0, 0.0, 0.2, 0.0, //
            10.0, 0.0, 10.2, 0.0, //
            0.0, 10.0, 0.2, 10.0, //
            10.0, 10.0, 10.2, 10.0,
        ];
        let params = ClusteringParams {
            niter: 20,
            ..Default::default()
        };
        let centroids = train_kmeans(2, 4, &x, &params, None).unwrap();
        assert_eq!(centroids.len(), 8);

        for mean in [[0.1, 0.0], [10.1, 0.0], [0.1, 10.0], [10.1, 10.0]] {
            let closest = (0..4)
                .map(|c| l2_sqr(&centroids[c * 2..c * 2 + 2], &mean))
                .fold(f32::INFINITY, f32::min);
            assert!(closest < 0.05, "no centroid near {:?}", mean);
        }
    }

    #[test]
    fn test_deterministic_given_seed() {
        let x: Vec<f32> = (0..64).map(|i| (i * 37 % 19) as f32).collect();
        let params = ClusteringParams::default();
        let a = train_kmeans(4, 3, &x, &params, None).unwrap();
        let b = train_kmeans(4, 3, &x, &params, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_spherical_normalizes() {
        let x: Vec<f32> = (0..40).map(|i| (i % 7) as f32 + 1.0).collect();
        let params = ClusteringParams {
            spherical: true,
            niter: 5,
            ..Default::default()
        };
        let centroids = train_kmeans(4, 2, &x, &params, None).unwrap();
        for c in 0..2 {
            let norm = inner_product(&centroids[c * 4..(c + 1) * 4], &centroids[c * 4..(c + 1) * 4]);
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_too_few_points() {
        assert!(train_kmeans(2, 4, &[0.0, 0.0], &ClusteringParams::default(), None).is_err());
    }
}
