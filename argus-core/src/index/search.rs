//! IVF search: probe routing, parallel list scanning and heap merging.
//!
//! Two k-NN schedules plus a third for range search:
//!
//! - mode 0 partitions *queries* across workers; each worker owns its
//!   result heap end to end and `max_codes` can short-circuit the probe
//!   sweep per query;
//! - mode 1 runs queries sequentially and partitions each query's
//!   *probes*; workers keep private heaps of size `k` that are merged by
//!   commutative heap addition, so the final top-k matches mode 0;
//! - mode 2 (range search only) partitions the flat (query, probe)
//!   product; each worker opens a new per-query bucket whenever the
//!   query index changes, which rayon's in-order splits keep
//!   non-decreasing.
//!
//! Cancellation is cooperative: every query polls the interrupt probe,
//! the first hit sets a sticky flag, remaining iterations drain, and the
//! whole operation fails after the join. No partial results are
//! returned.

use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::codec::{Codec, ListScanner};
use crate::direct_map::{lo_listno, lo_offset};
use crate::error::{Error, Result};
use crate::metric::MetricType;
use crate::range::{RangeQueryResult, RangeSearchResult};
use crate::structures::bitset::IdBitset;
use crate::structures::heap::{self, IpOrd, L2Ord};
use crate::{Idx, NO_ID};

use super::IvfIndex;

/// Flag bit for `parallel_mode`: skip heap init/reorder, the caller
/// provides a pre-initialized heap (used for index composition).
pub const PARALLEL_MODE_NO_HEAP_INIT: u32 = 1024;

/// Per-call overrides of the index's search configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchParams {
    pub nprobe: Option<usize>,
    pub max_codes: Option<usize>,
}

/// Work counters local to one search, reduced across workers and
/// flushed to the stats sink after the join.
#[derive(Debug, Clone, Copy, Default)]
struct ScanTally {
    nlistv: u64,
    ndis: u64,
    nheap: u64,
}

impl Add for ScanTally {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            nlistv: self.nlistv + rhs.nlistv,
            ndis: self.ndis + rhs.ndis,
            nheap: self.nheap + rhs.nheap,
        }
    }
}

impl AddAssign for ScanTally {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

fn init_heap(metric: MetricType, dis: &mut [f32], ids: &mut [Idx]) {
    match metric {
        MetricType::L2 => heap::heapify::<L2Ord>(dis, ids),
        MetricType::InnerProduct => heap::heapify::<IpOrd>(dis, ids),
    }
}

fn reorder_heap(metric: MetricType, dis: &mut [f32], ids: &mut [Idx]) {
    match metric {
        MetricType::L2 => heap::reorder::<L2Ord>(dis, ids),
        MetricType::InnerProduct => heap::reorder::<IpOrd>(dis, ids),
    }
}

fn addn_heap(metric: MetricType, dis: &mut [f32], ids: &mut [Idx], src_dis: &[f32], src_ids: &[Idx]) {
    match metric {
        MetricType::L2 => heap::addn::<L2Ord>(dis, ids, src_dis, src_ids),
        MetricType::InnerProduct => heap::addn::<IpOrd>(dis, ids, src_dis, src_ids),
    };
}

/// Fold state of the flat (query, probe) range schedule.
struct PairScanState<'a> {
    scanner: Option<Box<dyn ListScanner + 'a>>,
    results: Vec<RangeQueryResult>,
    tally: ScanTally,
}

impl<C: Codec> IvfIndex<C> {
    /// k-nearest-neighbor search. Results land in `distances` and
    /// `labels` (`n * k` each), best first per query; unused slots carry
    /// label `-1` and the metric's worst distance.
    pub fn search(
        &self,
        x: &[f32],
        k: usize,
        distances: &mut [f32],
        labels: &mut [Idx],
        filter: Option<&IdBitset>,
    ) -> Result<()> {
        if !self.is_trained {
            return Err(Error::NotTrained);
        }
        let n = self.check_vectors(x)?;
        if n == 0 {
            return Ok(());
        }

        let nprobe = self.nprobe;
        let mut keys = vec![NO_ID; n * nprobe];
        let mut coarse_dis = vec![0.0f32; n * nprobe];

        let t0 = Instant::now();
        self.level1
            .quantizer()
            .search(x, nprobe, &mut coarse_dis, &mut keys)?;
        self.stats()
            .add_quantization_time_ms(t0.elapsed().as_millis() as u64);

        let t0 = Instant::now();
        self.invlists.prefetch_lists(&keys);
        self.search_preassigned(x, k, &keys, &coarse_dis, distances, labels, false, None, filter)?;
        self.stats().add_search_time_ms(t0.elapsed().as_millis() as u64);
        Ok(())
    }

    /// Search with precomputed probe lists (`keys` / `coarse_dis`, one
    /// row of `nprobe` entries per query). With `store_pairs` the label
    /// slots carry packed (list, offset) handles instead of ids.
    #[allow(clippy::too_many_arguments)]
    pub fn search_preassigned(
        &self,
        x: &[f32],
        k: usize,
        keys: &[Idx],
        coarse_dis: &[f32],
        distances: &mut [f32],
        labels: &mut [Idx],
        store_pairs: bool,
        params: Option<&SearchParams>,
        filter: Option<&IdBitset>,
    ) -> Result<()> {
        let n = self.check_vectors(x)?;
        if n == 0 {
            return Ok(());
        }
        if k == 0 {
            return Err(Error::InvalidArgument("k must be positive".to_string()));
        }
        let nprobe = params.and_then(|p| p.nprobe).unwrap_or(self.nprobe);
        let max_codes = params.and_then(|p| p.max_codes).unwrap_or(self.max_codes);
        if keys.len() != n * nprobe || coarse_dis.len() != n * nprobe {
            return Err(Error::InvalidArgument(format!(
                "probe buffers must hold {} entries",
                n * nprobe
            )));
        }
        if distances.len() != n * k || labels.len() != n * k {
            return Err(Error::InvalidArgument(format!(
                "result buffers must hold {} entries",
                n * k
            )));
        }

        let pmode = self.parallel_mode & !PARALLEL_MODE_NO_HEAP_INIT;
        let do_heap_init = self.parallel_mode & PARALLEL_MODE_NO_HEAP_INIT == 0;
        let interrupted = AtomicBool::new(false);

        let tally = match pmode {
            0 => self.knn_queries_parallel(
                x, k, nprobe, max_codes, keys, coarse_dis, distances, labels, store_pairs,
                do_heap_init, filter, &interrupted,
            )?,
            1 => self.knn_probes_parallel(
                x, k, nprobe, keys, coarse_dis, distances, labels, store_pairs, do_heap_init,
                filter, &interrupted,
            )?,
            _ => {
                return Err(Error::Unsupported(format!(
                    "parallel_mode {} not supported",
                    pmode
                )))
            }
        };

        if interrupted.load(Ordering::Relaxed) {
            return Err(Error::Interrupted);
        }
        self.stats()
            .add_search(n as u64, tally.nlistv, tally.ndis, tally.nheap);
        Ok(())
    }

    /// Scan one posting list into the query's heap. Returns the number
    /// of entries scanned.
    #[allow(clippy::too_many_arguments)]
    fn scan_one_list(
        &self,
        scanner: &mut dyn ListScanner,
        key: Idx,
        coarse_dis: f32,
        heap_dis: &mut [f32],
        heap_ids: &mut [Idx],
        store_pairs: bool,
        filter: Option<&IdBitset>,
        tally: &mut ScanTally,
    ) -> Result<usize> {
        if key < 0 {
            // not enough centroids for this many probes
            return Ok(0);
        }
        if key >= self.nlist() as Idx {
            return Err(Error::InvalidArgument(format!(
                "invalid probe key {} for nlist {}",
                key,
                self.nlist()
            )));
        }
        let list_no = key as usize;
        let list_size = self.invlists.list_size(list_no);
        if list_size == 0 {
            return Ok(0);
        }

        scanner.set_list(key, coarse_dis);
        tally.nlistv += 1;

        let codes = self.invlists.get_codes(list_no);
        let ids = (!store_pairs).then(|| self.invlists.get_ids(list_no));
        tally.nheap += scanner.scan_codes(codes, ids, heap_dis, heap_ids, filter) as u64;

        Ok(list_size)
    }

    /// Parallel mode 0: queries partitioned across workers.
    #[allow(clippy::too_many_arguments)]
    fn knn_queries_parallel(
        &self,
        x: &[f32],
        k: usize,
        nprobe: usize,
        max_codes: usize,
        keys: &[Idx],
        coarse_dis: &[f32],
        distances: &mut [f32],
        labels: &mut [Idx],
        store_pairs: bool,
        do_heap_init: bool,
        filter: Option<&IdBitset>,
        interrupted: &AtomicBool,
    ) -> Result<ScanTally> {
        distances
            .par_chunks_mut(k)
            .zip(labels.par_chunks_mut(k))
            .enumerate()
            .map_init(
                || self.codec.scanner(self.metric, store_pairs),
                |scanner, (i, (simi, idxi))| -> Result<ScanTally> {
                    let mut tally = ScanTally::default();
                    if interrupted.load(Ordering::Relaxed) {
                        return Ok(tally);
                    }

                    scanner.set_query(&x[i * self.d..(i + 1) * self.d]);
                    if do_heap_init {
                        init_heap(self.metric, simi, idxi);
                    }

                    let mut nscan = 0usize;
                    for ik in 0..nprobe {
                        nscan += self.scan_one_list(
                            scanner.as_mut(),
                            keys[i * nprobe + ik],
                            coarse_dis[i * nprobe + ik],
                            simi,
                            idxi,
                            store_pairs,
                            filter,
                            &mut tally,
                        )?;
                        if max_codes != 0 && nscan >= max_codes {
                            break;
                        }
                    }
                    tally.ndis += nscan as u64;

                    if do_heap_init {
                        reorder_heap(self.metric, simi, idxi);
                    }
                    if self.poll_interrupt() {
                        interrupted.store(true, Ordering::Relaxed);
                    }
                    Ok(tally)
                },
            )
            .try_reduce(ScanTally::default, |a, b| Ok(a + b))
    }

    /// Parallel mode 1: sequential queries, probes partitioned across
    /// workers with private heaps merged by heap addition.
    #[allow(clippy::too_many_arguments)]
    fn knn_probes_parallel(
        &self,
        x: &[f32],
        k: usize,
        nprobe: usize,
        keys: &[Idx],
        coarse_dis: &[f32],
        distances: &mut [f32],
        labels: &mut [Idx],
        store_pairs: bool,
        do_heap_init: bool,
        filter: Option<&IdBitset>,
        interrupted: &AtomicBool,
    ) -> Result<ScanTally> {
        let n = x.len() / self.d;
        let mut tally = ScanTally::default();

        for i in 0..n {
            if interrupted.load(Ordering::Relaxed) {
                break;
            }
            let xi = &x[i * self.d..(i + 1) * self.d];

            let (local_dis, local_ids, local_tally) = (0..nprobe)
                .into_par_iter()
                .try_fold(
                    || {
                        let mut scanner = self.codec.scanner(self.metric, store_pairs);
                        scanner.set_query(xi);
                        let mut dis = vec![0.0f32; k];
                        let mut ids = vec![NO_ID; k];
                        init_heap(self.metric, &mut dis, &mut ids);
                        (scanner, dis, ids, ScanTally::default())
                    },
                    |mut state, ik| {
                        let nscan = self.scan_one_list(
                            state.0.as_mut(),
                            keys[i * nprobe + ik],
                            coarse_dis[i * nprobe + ik],
                            &mut state.1,
                            &mut state.2,
                            store_pairs,
                            filter,
                            &mut state.3,
                        )?;
                        state.3.ndis += nscan as u64;
                        Ok(state)
                    },
                )
                .map(|state| state.map(|(_, dis, ids, t)| (dis, ids, t)))
                .try_reduce(
                    || {
                        let mut dis = vec![0.0f32; k];
                        let mut ids = vec![NO_ID; k];
                        init_heap(self.metric, &mut dis, &mut ids);
                        (dis, ids, ScanTally::default())
                    },
                    |mut a, b| {
                        addn_heap(self.metric, &mut a.0, &mut a.1, &b.0, &b.1);
                        a.2 += b.2;
                        Ok(a)
                    },
                )?;

            let simi = &mut distances[i * k..(i + 1) * k];
            let idxi = &mut labels[i * k..(i + 1) * k];
            if do_heap_init {
                init_heap(self.metric, simi, idxi);
            }
            addn_heap(self.metric, simi, idxi, &local_dis, &local_ids);
            if do_heap_init {
                reorder_heap(self.metric, simi, idxi);
            }
            tally += local_tally;

            if self.poll_interrupt() {
                interrupted.store(true, Ordering::Relaxed);
            }
        }
        Ok(tally)
    }

    /// Radius search: every entry scoring within `radius` (≥ for inner
    /// product, ≤ for L2) is returned.
    pub fn range_search(
        &self,
        x: &[f32],
        radius: f32,
        filter: Option<&IdBitset>,
    ) -> Result<RangeSearchResult> {
        if !self.is_trained {
            return Err(Error::NotTrained);
        }
        let n = self.check_vectors(x)?;
        if n == 0 {
            return Ok(RangeSearchResult::new(0));
        }

        let nprobe = self.nprobe;
        let mut keys = vec![NO_ID; n * nprobe];
        let mut coarse_dis = vec![0.0f32; n * nprobe];

        let t0 = Instant::now();
        self.level1
            .quantizer()
            .search(x, nprobe, &mut coarse_dis, &mut keys)?;
        self.stats()
            .add_quantization_time_ms(t0.elapsed().as_millis() as u64);

        let t0 = Instant::now();
        self.invlists.prefetch_lists(&keys);
        let result = self.range_search_preassigned(x, radius, &keys, &coarse_dis, filter)?;
        self.stats().add_search_time_ms(t0.elapsed().as_millis() as u64);
        Ok(result)
    }

    /// Range search with precomputed probe lists.
    pub fn range_search_preassigned(
        &self,
        x: &[f32],
        radius: f32,
        keys: &[Idx],
        coarse_dis: &[f32],
        filter: Option<&IdBitset>,
    ) -> Result<RangeSearchResult> {
        let n = self.check_vectors(x)?;
        if n == 0 {
            return Ok(RangeSearchResult::new(0));
        }
        if keys.len() != coarse_dis.len() || keys.len() % n != 0 {
            return Err(Error::InvalidArgument(
                "probe buffers must hold n * nprobe entries".to_string(),
            ));
        }
        let nprobe = keys.len() / n;

        let pmode = self.parallel_mode & !PARALLEL_MODE_NO_HEAP_INIT;
        let interrupted = AtomicBool::new(false);

        let (partials, tally) = match pmode {
            0 => self.range_queries_parallel(x, radius, nprobe, keys, coarse_dis, filter, &interrupted)?,
            1 => self.range_probes_parallel(x, radius, nprobe, keys, coarse_dis, filter, &interrupted)?,
            2 => self.range_pairs_parallel(x, radius, nprobe, keys, coarse_dis, filter, &interrupted)?,
            _ => {
                return Err(Error::Unsupported(format!(
                    "parallel_mode {} not supported",
                    pmode
                )))
            }
        };

        if interrupted.load(Ordering::Relaxed) {
            return Err(Error::Interrupted);
        }

        let result = RangeSearchResult::from_partials(n, &partials);
        self.stats().add_search(n as u64, tally.nlistv, tally.ndis, 0);
        Ok(result)
    }

    /// Scan one posting list into a range result bucket.
    #[allow(clippy::too_many_arguments)]
    fn scan_one_list_range(
        &self,
        scanner: &mut dyn ListScanner,
        key: Idx,
        coarse_dis: f32,
        radius: f32,
        qres: &mut RangeQueryResult,
        filter: Option<&IdBitset>,
        tally: &mut ScanTally,
    ) -> Result<()> {
        if key < 0 {
            return Ok(());
        }
        if key >= self.nlist() as Idx {
            return Err(Error::InvalidArgument(format!(
                "invalid probe key {} for nlist {}",
                key,
                self.nlist()
            )));
        }
        let list_no = key as usize;
        let list_size = self.invlists.list_size(list_no);
        if list_size == 0 {
            return Ok(());
        }

        scanner.set_list(key, coarse_dis);
        tally.nlistv += 1;
        tally.ndis += list_size as u64;

        let codes = self.invlists.get_codes(list_no);
        let ids = self.invlists.get_ids(list_no);
        scanner.scan_codes_range(codes, Some(ids), radius, qres, filter)
    }

    /// Range mode 0: queries partitioned across workers.
    fn range_queries_parallel(
        &self,
        x: &[f32],
        radius: f32,
        nprobe: usize,
        keys: &[Idx],
        coarse_dis: &[f32],
        filter: Option<&IdBitset>,
        interrupted: &AtomicBool,
    ) -> Result<(Vec<RangeQueryResult>, ScanTally)> {
        let n = x.len() / self.d;
        let results: Vec<(RangeQueryResult, ScanTally)> = (0..n)
            .into_par_iter()
            .map_init(
                || self.codec.scanner(self.metric, false),
                |scanner, i| -> Result<(RangeQueryResult, ScanTally)> {
                    let mut qres = RangeQueryResult::new(i);
                    let mut tally = ScanTally::default();
                    if interrupted.load(Ordering::Relaxed) {
                        return Ok((qres, tally));
                    }
                    scanner.set_query(&x[i * self.d..(i + 1) * self.d]);
                    for ik in 0..nprobe {
                        self.scan_one_list_range(
                            scanner.as_mut(),
                            keys[i * nprobe + ik],
                            coarse_dis[i * nprobe + ik],
                            radius,
                            &mut qres,
                            filter,
                            &mut tally,
                        )?;
                    }
                    if self.poll_interrupt() {
                        interrupted.store(true, Ordering::Relaxed);
                    }
                    Ok((qres, tally))
                },
            )
            .collect::<Result<Vec<_>>>()?;

        let mut tally = ScanTally::default();
        let mut partials = Vec::with_capacity(n);
        for (qres, t) in results {
            tally += t;
            partials.push(qres);
        }
        Ok((partials, tally))
    }

    /// Range mode 1: sequential queries, probes partitioned across
    /// workers.
    fn range_probes_parallel(
        &self,
        x: &[f32],
        radius: f32,
        nprobe: usize,
        keys: &[Idx],
        coarse_dis: &[f32],
        filter: Option<&IdBitset>,
        interrupted: &AtomicBool,
    ) -> Result<(Vec<RangeQueryResult>, ScanTally)> {
        let n = x.len() / self.d;
        let mut partials = Vec::new();
        let mut tally = ScanTally::default();

        for i in 0..n {
            if interrupted.load(Ordering::Relaxed) {
                break;
            }
            let xi = &x[i * self.d..(i + 1) * self.d];

            let states: Vec<(RangeQueryResult, ScanTally)> = (0..nprobe)
                .into_par_iter()
                .try_fold(
                    || {
                        let mut scanner = self.codec.scanner(self.metric, false);
                        scanner.set_query(xi);
                        (scanner, RangeQueryResult::new(i), ScanTally::default())
                    },
                    |mut state, ik| {
                        self.scan_one_list_range(
                            state.0.as_mut(),
                            keys[i * nprobe + ik],
                            coarse_dis[i * nprobe + ik],
                            radius,
                            &mut state.1,
                            filter,
                            &mut state.2,
                        )?;
                        Ok(state)
                    },
                )
                .map(|state| state.map(|(_, qres, t)| (qres, t)))
                .collect::<Result<Vec<_>>>()?;

            for (qres, t) in states {
                tally += t;
                partials.push(qres);
            }
            if self.poll_interrupt() {
                interrupted.store(true, Ordering::Relaxed);
            }
        }
        Ok((partials, tally))
    }

    /// Range mode 2: the flat (query, probe) product partitioned across
    /// workers; each worker opens a new bucket when the query index
    /// changes.
    fn range_pairs_parallel(
        &self,
        x: &[f32],
        radius: f32,
        nprobe: usize,
        keys: &[Idx],
        coarse_dis: &[f32],
        filter: Option<&IdBitset>,
        interrupted: &AtomicBool,
    ) -> Result<(Vec<RangeQueryResult>, ScanTally)> {
        let n = x.len() / self.d;
        let states: Vec<(Vec<RangeQueryResult>, ScanTally)> = (0..n * nprobe)
            .into_par_iter()
            .try_fold(
                || PairScanState {
                    scanner: None,
                    results: Vec::new(),
                    tally: ScanTally::default(),
                },
                |mut state, iik| {
                    if interrupted.load(Ordering::Relaxed) {
                        return Ok(state);
                    }
                    let i = iik / nprobe;
                    let ik = iik % nprobe;

                    let scanner = state
                        .scanner
                        .get_or_insert_with(|| self.codec.scanner(self.metric, false));

                    if state.results.last().map_or(true, |q| q.qno != i) {
                        // splits visit the flat product in order, so query
                        // indices are non-decreasing per accumulator
                        debug_assert!(state.results.last().map_or(true, |q| i > q.qno));
                        scanner.set_query(&x[i * self.d..(i + 1) * self.d]);
                        state.results.push(RangeQueryResult::new(i));
                        if self.poll_interrupt() {
                            interrupted.store(true, Ordering::Relaxed);
                            return Ok(state);
                        }
                    }
                    if let Some(qres) = state.results.last_mut() {
                        self.scan_one_list_range(
                            scanner.as_mut(),
                            keys[iik],
                            coarse_dis[iik],
                            radius,
                            qres,
                            filter,
                            &mut state.tally,
                        )?;
                    }
                    Ok(state)
                },
            )
            .map(|state| state.map(|s| (s.results, s.tally)))
            .collect::<Result<Vec<_>>>()?;

        let mut tally = ScanTally::default();
        let mut partials = Vec::new();
        for (results, t) in states {
            tally += t;
            partials.extend(results);
        }
        Ok((partials, tally))
    }

    /// Search and decode the result vectors in one pass.
    ///
    /// Runs the search in store-pairs mode, then resolves each packed
    /// (list, offset) label to the real id and reconstructs the entry.
    /// Missing results get NaN-filled vectors.
    pub fn search_and_reconstruct(
        &self,
        x: &[f32],
        k: usize,
        distances: &mut [f32],
        labels: &mut [Idx],
        recons: &mut [f32],
    ) -> Result<()> {
        if !self.is_trained {
            return Err(Error::NotTrained);
        }
        let n = self.check_vectors(x)?;
        if n == 0 {
            return Ok(());
        }
        if recons.len() != n * k * self.d {
            return Err(Error::InvalidArgument(format!(
                "reconstruction buffer must hold {} floats",
                n * k * self.d
            )));
        }

        let nprobe = self.nprobe;
        let mut keys = vec![NO_ID; n * nprobe];
        let mut coarse_dis = vec![0.0f32; n * nprobe];
        self.level1
            .quantizer()
            .search(x, nprobe, &mut coarse_dis, &mut keys)?;
        self.invlists.prefetch_lists(&keys);

        self.search_preassigned(
            x, k, &keys, &coarse_dis, distances, labels, true, None, None,
        )?;

        for ij in 0..n * k {
            let key = labels[ij];
            let out = &mut recons[ij * self.d..(ij + 1) * self.d];
            if key < 0 {
                out.fill(f32::NAN);
            } else {
                let list_no = lo_listno(key) as usize;
                let offset = lo_offset(key);
                // resolve the packed handle to the real external id
                labels[ij] = self.invlists.get_single_id(list_no, offset);
                self.reconstruct_from_offset(list_no, offset, out)?;
            }
        }
        Ok(())
    }
}
