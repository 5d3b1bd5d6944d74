//! Range-search result buffers.
//!
//! Each scanning thread appends matches into per-query
//! [`RangeQueryResult`] buffers; after the parallel region joins, the
//! partials are merged into a single [`RangeSearchResult`] with CSR-style
//! `lims` offsets.

use crate::{Idx, NO_ID};

/// Matches for a single query, filled by a single thread.
#[derive(Debug, Clone, Default)]
pub struct RangeQueryResult {
    pub qno: usize,
    pub labels: Vec<Idx>,
    pub distances: Vec<f32>,
}

impl RangeQueryResult {
    pub fn new(qno: usize) -> Self {
        Self {
            qno,
            labels: Vec::new(),
            distances: Vec::new(),
        }
    }

    #[inline]
    pub fn add(&mut self, dis: f32, id: Idx) {
        self.labels.push(id);
        self.distances.push(dis);
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Aggregated results of a range search over a batch of queries.
///
/// Query `q`'s matches are `labels[lims[q]..lims[q + 1]]` with matching
/// `distances`. Matches are not sorted by distance.
#[derive(Debug, Clone)]
pub struct RangeSearchResult {
    pub nq: usize,
    pub lims: Vec<usize>,
    pub labels: Vec<Idx>,
    pub distances: Vec<f32>,
}

impl RangeSearchResult {
    pub fn new(nq: usize) -> Self {
        Self {
            nq,
            lims: vec![0; nq + 1],
            labels: Vec::new(),
            distances: Vec::new(),
        }
    }

    /// Labels and distances of query `q`.
    pub fn query_results(&self, q: usize) -> (&[Idx], &[f32]) {
        let (lo, hi) = (self.lims[q], self.lims[q + 1]);
        (&self.labels[lo..hi], &self.distances[lo..hi])
    }

    /// Merge per-thread partial buffers. Partials for the same query keep
    /// their relative order in `partials`.
    pub(crate) fn from_partials(nq: usize, partials: &[RangeQueryResult]) -> Self {
        let mut result = Self::new(nq);
        for p in partials {
            result.lims[p.qno + 1] += p.len();
        }
        for q in 0..nq {
            result.lims[q + 1] += result.lims[q];
        }
        let total = result.lims[nq];
        result.labels = vec![NO_ID; total];
        result.distances = vec![0.0; total];

        let mut cursor = result.lims.clone();
        for p in partials {
            let at = cursor[p.qno];
            result.labels[at..at + p.len()].copy_from_slice(&p.labels);
            result.distances[at..at + p.len()].copy_from_slice(&p.distances);
            cursor[p.qno] += p.len();
        }
        result
    }
}
