//! The IVF index core.
//!
//! [`IvfIndex`] ties the pieces together: the level-1 quantizer routes
//! vectors to lists, the codec encodes them, the inverted lists store
//! them, and the direct map tracks where each id lives. The index is
//! generic over its codec; [`IvfIndex::new_flat`] builds the
//! uncompressed IVF-Flat variant.

pub mod search;


use std::sync::Arc;

use crate::codec::{Codec, FlatCodec};
use crate::direct_map::{lo_listno, lo_offset, DirectMap, DirectMapAdd, DirectMapKind};
use crate::error::{Error, Result};
use crate::interrupt;
use crate::invlists::{ArrayInvertedLists, InvertedLists};
use crate::metric::MetricType;
use crate::quantizer::{CoarseQuantizer, Level1Quantizer};
use crate::selector::{IdSelector, IdSelectorBatch};
use crate::stats::{IvfStats, IVF_STATS};
use crate::{Idx, NO_ID};

pub use search::{SearchParams, PARALLEL_MODE_NO_HEAP_INIT};

/// Vectors are added in blocks of this many to bound peak allocation.
const ADD_BLOCK_SIZE: usize = 65536;

/// Entry selection for [`IvfIndex::copy_subset_to`].
#[derive(Debug, Clone, Copy)]
pub enum Subset {
    /// Entries whose id lies in `[min, max)`.
    IdRange { min: Idx, max: Idx },
    /// Entries with `id % modulus == remainder`.
    IdMod { modulus: Idx, remainder: Idx },
    /// A contiguous slice per list, sized so the copied totals across
    /// the whole index tend to the fractions `a1 / ntotal` and
    /// `a2 / ntotal`.
    Fraction { a1: Idx, a2: Idx },
}

/// Inverted-file index over a pluggable vector codec.
pub struct IvfIndex<C: Codec> {
    d: usize,
    metric: MetricType,
    level1: Level1Quantizer,
    codec: C,
    invlists: Box<dyn InvertedLists>,
    direct_map: DirectMap,
    ntotal: Idx,
    is_trained: bool,
    /// Lists probed per query.
    pub nprobe: usize,
    /// Per-query cap on scanned entries, 0 for unlimited. Enforced in
    /// per-query parallel mode only.
    pub max_codes: usize,
    /// Parallel schedule (0, 1 or 2) plus optional
    /// [`PARALLEL_MODE_NO_HEAP_INIT`].
    pub parallel_mode: u32,
    stats: Option<Arc<IvfStats>>,
    interrupt_probe: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

impl IvfIndex<FlatCodec> {
    /// IVF-Flat: vectors stored verbatim inside the lists.
    pub fn new_flat(
        quantizer: Box<dyn CoarseQuantizer>,
        d: usize,
        nlist: usize,
        metric: MetricType,
    ) -> Result<Self> {
        Self::new(quantizer, d, nlist, FlatCodec::new(d), metric)
    }
}

impl<C: Codec> IvfIndex<C> {
    pub fn new(
        quantizer: Box<dyn CoarseQuantizer>,
        d: usize,
        nlist: usize,
        codec: C,
        metric: MetricType,
    ) -> Result<Self> {
        if nlist == 0 {
            return Err(Error::InvalidArgument("nlist must be positive".to_string()));
        }
        if quantizer.d() != d {
            return Err(Error::DimensionMismatch {
                expected: d,
                got: quantizer.d(),
            });
        }
        if codec.d() != d {
            return Err(Error::DimensionMismatch {
                expected: d,
                got: codec.d(),
            });
        }

        let is_trained =
            quantizer.is_trained() && quantizer.ntotal() == nlist && codec.is_trained();
        let mut level1 = Level1Quantizer::new(quantizer, nlist);
        // spherical clustering by default for inner-product indexes
        if metric == MetricType::InnerProduct {
            level1.cp.spherical = true;
        }
        let invlists: Box<dyn InvertedLists> =
            Box::new(ArrayInvertedLists::new(nlist, codec.code_size()));

        Ok(Self {
            d,
            metric,
            level1,
            codec,
            invlists,
            direct_map: DirectMap::default(),
            ntotal: 0,
            is_trained,
            nprobe: 1,
            max_codes: 0,
            parallel_mode: 0,
            stats: None,
            interrupt_probe: None,
        })
    }

    pub fn d(&self) -> usize {
        self.d
    }

    pub fn metric(&self) -> MetricType {
        self.metric
    }

    pub fn nlist(&self) -> usize {
        self.level1.nlist()
    }

    pub fn ntotal(&self) -> Idx {
        self.ntotal
    }

    pub fn is_trained(&self) -> bool {
        self.is_trained
    }

    pub fn code_size(&self) -> usize {
        self.codec.code_size()
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn level1(&self) -> &Level1Quantizer {
        &self.level1
    }

    pub fn level1_mut(&mut self) -> &mut Level1Quantizer {
        &mut self.level1
    }

    pub fn quantizer(&self) -> &dyn CoarseQuantizer {
        self.level1.quantizer()
    }

    pub fn invlists(&self) -> &dyn InvertedLists {
        self.invlists.as_ref()
    }

    pub fn direct_map_kind(&self) -> DirectMapKind {
        self.direct_map.kind()
    }

    /// Route search statistics to `sink` instead of the process-wide
    /// [`IVF_STATS`].
    pub fn set_stats_sink(&mut self, sink: Option<Arc<IvfStats>>) {
        self.stats = sink;
    }

    pub fn stats(&self) -> &IvfStats {
        self.stats.as_deref().unwrap_or(&IVF_STATS)
    }

    /// Override the process-wide interrupt hook for this index.
    pub fn set_interrupt_probe(&mut self, probe: Option<Arc<dyn Fn() -> bool + Send + Sync>>) {
        self.interrupt_probe = probe;
    }

    pub(crate) fn poll_interrupt(&self) -> bool {
        match &self.interrupt_probe {
            Some(probe) => probe(),
            None => interrupt::is_interrupted(),
        }
    }

    pub(crate) fn check_vectors(&self, x: &[f32]) -> Result<usize> {
        if x.len() % self.d != 0 {
            return Err(Error::InvalidArgument(format!(
                "vector data length {} is not a multiple of dimension {}",
                x.len(),
                self.d
            )));
        }
        Ok(x.len() / self.d)
    }

    /// Train the coarse quantizer and the codec.
    pub fn train(&mut self, x: &[f32]) -> Result<()> {
        self.check_vectors(x)?;
        log::debug!("training level-1 quantizer");
        self.level1.train(x, self.metric)?;
        log::debug!("training residual encoder");
        self.codec.train(x)?;
        self.is_trained = true;
        Ok(())
    }

    /// Add vectors with auto-assigned sequential ids.
    pub fn add(&mut self, x: &[f32]) -> Result<()> {
        self.add_with_ids(x, None)
    }

    /// Add vectors, optionally with caller-chosen external ids.
    pub fn add_with_ids(&mut self, x: &[f32], xids: Option<&[Idx]>) -> Result<()> {
        let n = self.check_vectors(x)?;
        if let Some(ids) = xids {
            if ids.len() != n {
                return Err(Error::InvalidArgument(format!(
                    "got {} ids for {} vectors",
                    ids.len(),
                    n
                )));
            }
        }
        if n == 0 {
            return Ok(());
        }
        if n > ADD_BLOCK_SIZE {
            for start in (0..n).step_by(ADD_BLOCK_SIZE) {
                let end = (start + ADD_BLOCK_SIZE).min(n);
                log::debug!("add_with_ids block {}:{}", start, end);
                self.add_with_ids(
                    &x[start * self.d..end * self.d],
                    xids.map(|ids| &ids[start..end]),
                )?;
            }
            return Ok(());
        }

        if !self.is_trained {
            return Err(Error::NotTrained);
        }
        self.direct_map.check_can_add(xids)?;

        let mut assign = vec![NO_ID; n];
        self.level1.quantizer().assign(x, &mut assign)?;
        let nminus1 = assign.iter().filter(|&&a| a < 0).count();

        let cs = self.codec.code_size();
        let mut codes = vec![0u8; n * cs];
        self.codec.encode_vectors(x, &assign, &mut codes)?;

        let ids_vec: Vec<Idx>;
        let entry_ids: &[Idx] = match xids {
            Some(ids) => ids,
            None => {
                ids_vec = (self.ntotal..self.ntotal + n as Idx).collect();
                &ids_vec
            }
        };

        let offsets = self.invlists.add_entries(&assign, entry_ids, &codes)?;

        let mut adder = DirectMapAdd::new(&mut self.direct_map, n, self.ntotal, xids)?;
        for (i, (&list_no, &offset)) in assign.iter().zip(offsets.iter()).enumerate() {
            if list_no >= 0 {
                adder.add(i, list_no, offset);
            } else {
                adder.add(i, -1, 0);
            }
        }

        log::debug!("added {} / {} vectors ({} discarded)", n - nminus1, n, nminus1);
        // discarded vectors still count toward id auto-assignment
        self.ntotal += n as Idx;
        Ok(())
    }

    /// Drop every entry and clear the direct map.
    pub fn reset(&mut self) -> Result<()> {
        self.invlists.reset()?;
        self.direct_map.clear();
        self.ntotal = 0;
        Ok(())
    }

    /// Remove every entry selected by `sel`; returns how many were
    /// removed.
    pub fn remove_ids(&mut self, sel: &dyn IdSelector) -> Result<usize> {
        let nremove = self.direct_map.remove_ids(sel, self.invlists.as_mut())?;
        self.ntotal -= nremove as Idx;
        Ok(nremove)
    }

    /// Re-encode and relocate existing vectors. The strategy depends on
    /// the direct-map representation: hash maps delete-then-readd, the
    /// dense array updates in place.
    pub fn update_vectors(&mut self, ids: &[Idx], x: &[f32]) -> Result<()> {
        let n = self.check_vectors(x)?;
        if ids.len() != n {
            return Err(Error::InvalidArgument(format!(
                "got {} ids for {} vectors",
                ids.len(),
                n
            )));
        }
        match self.direct_map.kind() {
            DirectMapKind::Hashtable => {
                let sel = IdSelectorBatch::new(ids.iter().copied());
                let nremove = self.remove_ids(&sel)?;
                if nremove != n {
                    return Err(Error::InvalidArgument(
                        "did not find all entries to remove".to_string(),
                    ));
                }
                self.add_with_ids(x, Some(ids))
            }
            DirectMapKind::Array => {
                if !self.is_trained {
                    return Err(Error::NotTrained);
                }
                let mut assign = vec![NO_ID; n];
                self.level1.quantizer().assign(x, &mut assign)?;
                let mut codes = vec![0u8; n * self.codec.code_size()];
                self.codec.encode_vectors(x, &assign, &mut codes)?;
                self.direct_map
                    .update_codes(self.invlists.as_mut(), ids, &assign, &codes)
            }
            DirectMapKind::NoMap => Err(Error::Unsupported(
                "update_vectors requires a direct map".to_string(),
            )),
        }
    }

    /// Enable (dense array) or disable the direct map.
    pub fn make_direct_map(&mut self, enable: bool) -> Result<()> {
        let kind = if enable {
            DirectMapKind::Array
        } else {
            DirectMapKind::NoMap
        };
        self.set_direct_map_kind(kind)
    }

    /// Switch the direct-map representation, rebuilding it from the
    /// current lists.
    pub fn set_direct_map_kind(&mut self, kind: DirectMapKind) -> Result<()> {
        self.direct_map
            .set_kind(kind, self.invlists.as_ref(), self.ntotal as usize)
    }

    /// Decode the vector with external id `key`. Requires a direct map.
    pub fn reconstruct(&self, key: Idx, out: &mut [f32]) -> Result<()> {
        if out.len() != self.d {
            return Err(Error::DimensionMismatch {
                expected: self.d,
                got: out.len(),
            });
        }
        let lo = self.direct_map.get(key)?;
        self.reconstruct_from_offset(lo_listno(lo) as usize, lo_offset(lo), out)
    }

    /// Decode every stored vector whose id falls in `[i0, i0 + ni)` into
    /// `out`, ordered by id. Scans all lists; works without a direct
    /// map.
    pub fn reconstruct_n(&self, i0: Idx, ni: usize, out: &mut [f32]) -> Result<()> {
        if ni == 0 {
            return Ok(());
        }
        if i0 < 0 || i0 + ni as Idx > self.ntotal {
            return Err(Error::InvalidArgument(format!(
                "id range [{}, {}) out of bounds for ntotal {}",
                i0,
                i0 + ni as Idx,
                self.ntotal
            )));
        }
        if out.len() != ni * self.d {
            return Err(Error::InvalidArgument(format!(
                "output buffer must hold {} floats",
                ni * self.d
            )));
        }
        for list_no in 0..self.nlist() {
            let ids = self.invlists.get_ids(list_no);
            for (offset, &id) in ids.iter().enumerate() {
                if id >= i0 && id < i0 + ni as Idx {
                    let at = (id - i0) as usize * self.d;
                    self.reconstruct_from_offset(list_no, offset, &mut out[at..at + self.d])?;
                }
            }
        }
        Ok(())
    }

    /// Decode the entry at `(list_no, offset)`.
    pub fn reconstruct_from_offset(
        &self,
        list_no: usize,
        offset: usize,
        out: &mut [f32],
    ) -> Result<()> {
        let code = self.invlists.get_single_code(list_no, offset);
        self.codec.reconstruct_from_code(list_no as Idx, code, out)
    }

    /// Swap in a different list container, returning the displaced one
    /// to the caller.
    pub fn replace_invlists(
        &mut self,
        invlists: Box<dyn InvertedLists>,
    ) -> Result<Box<dyn InvertedLists>> {
        if invlists.nlist() != self.nlist() || invlists.code_size() != self.code_size() {
            return Err(Error::Incompatible(format!(
                "replacement lists have nlist {} / code_size {}, index needs {} / {}",
                invlists.nlist(),
                invlists.code_size(),
                self.nlist(),
                self.code_size()
            )));
        }
        Ok(std::mem::replace(&mut self.invlists, invlists))
    }

    /// Freeze the list container. A no-op when already frozen or when
    /// the container has no read-only form.
    pub fn to_readonly(&mut self) -> Result<()> {
        if self.is_readonly() {
            return Ok(());
        }
        if let Some(frozen) = self.invlists.to_readonly() {
            self.replace_invlists(frozen)?;
        }
        Ok(())
    }

    pub fn is_readonly(&self) -> bool {
        self.invlists.is_readonly()
    }

    /// Swap in a different coarse quantizer, keeping the displaced one
    /// in the backup slot.
    pub fn replace_quantizer(&mut self, quantizer: Box<dyn CoarseQuantizer>) -> Result<()> {
        if quantizer.d() != self.d {
            return Err(Error::DimensionMismatch {
                expected: self.d,
                got: quantizer.d(),
            });
        }
        self.level1.replace_quantizer(quantizer);
        Ok(())
    }

    /// Reinstate the backed-up coarse quantizer.
    pub fn restore_quantizer(&mut self) -> Result<()> {
        self.level1.restore_quantizer()
    }

    pub fn check_compatible_for_merge(&self, other: &Self) -> Result<()> {
        if other.d != self.d || other.nlist() != self.nlist() || other.code_size() != self.code_size()
        {
            return Err(Error::Incompatible(
                "indexes differ in dimension, nlist or code size".to_string(),
            ));
        }
        if self.direct_map.kind() != DirectMapKind::NoMap
            || other.direct_map.kind() != DirectMapKind::NoMap
        {
            return Err(Error::Incompatible(
                "merge with direct maps enabled is not implemented".to_string(),
            ));
        }
        Ok(())
    }

    /// Move every entry of `other` into this index, shifting its
    /// external ids by `add_id`. Leaves `other` empty.
    pub fn merge_from(&mut self, other: &mut Self, add_id: Idx) -> Result<()> {
        self.check_compatible_for_merge(other)?;
        self.invlists.merge_from(other.invlists.as_mut(), add_id)?;
        self.ntotal += other.ntotal;
        other.ntotal = 0;
        Ok(())
    }

    /// Copy the selected entries into `other`, which must share the list
    /// layout and have no direct map.
    pub fn copy_subset_to(&self, other: &mut Self, subset: Subset) -> Result<()> {
        if self.nlist() != other.nlist() || self.code_size() != other.code_size() {
            return Err(Error::Incompatible(
                "indexes differ in nlist or code size".to_string(),
            ));
        }
        if other.direct_map.kind() != DirectMapKind::NoMap {
            return Err(Error::Incompatible(
                "destination must not have a direct map".to_string(),
            ));
        }
        let ntotal = self.ntotal as usize;
        if ntotal == 0 {
            return Ok(());
        }

        let mut accu_n: usize = 0;
        let mut accu_a1: usize = 0;
        let mut accu_a2: usize = 0;

        for list_no in 0..self.nlist() {
            let n = self.invlists.list_size(list_no);
            match subset {
                Subset::IdRange { min, max } => {
                    for i in 0..n {
                        let id = self.invlists.get_single_id(list_no, i);
                        if min <= id && id < max {
                            other.invlists.add_entry(
                                list_no,
                                id,
                                self.invlists.get_single_code(list_no, i),
                            )?;
                            other.ntotal += 1;
                        }
                    }
                }
                Subset::IdMod { modulus, remainder } => {
                    for i in 0..n {
                        let id = self.invlists.get_single_id(list_no, i);
                        if id % modulus == remainder {
                            other.invlists.add_entry(
                                list_no,
                                id,
                                self.invlists.get_single_code(list_no, i),
                            )?;
                            other.ntotal += 1;
                        }
                    }
                }
                Subset::Fraction { a1, a2 } => {
                    // running cumulative counts with exact integer
                    // arithmetic, so shard boundaries never drift
                    let next_accu_n = accu_n + n;
                    let next_accu_a1 = (next_accu_n as u128 * a1 as u128 / ntotal as u128) as usize;
                    let i1 = next_accu_a1 - accu_a1;
                    let next_accu_a2 = (next_accu_n as u128 * a2 as u128 / ntotal as u128) as usize;
                    let i2 = next_accu_a2 - accu_a2;
                    for i in i1..i2 {
                        other.invlists.add_entry(
                            list_no,
                            self.invlists.get_single_id(list_no, i),
                            self.invlists.get_single_code(list_no, i),
                        )?;
                    }
                    other.ntotal += (i2 - i1) as Idx;
                    accu_a1 = next_accu_a1;
                    accu_a2 = next_accu_a2;
                }
            }
            accu_n += n;
        }
        assert!(
            accu_n == ntotal,
            "inverted list sizes inconsistent with ntotal"
        );
        Ok(())
    }

    /// Byte width of one standalone-encoded entry:
    /// `[list-id little-endian | code bytes]`.
    pub fn sa_code_size(&self) -> usize {
        self.level1.coarse_code_size() + self.codec.code_size()
    }

    /// Standalone-encode vectors into self-contained
    /// `[list-id | code]` slots.
    pub fn sa_encode(&self, x: &[f32], out: &mut [u8]) -> Result<()> {
        if !self.is_trained {
            return Err(Error::NotTrained);
        }
        let n = self.check_vectors(x)?;
        let sa = self.sa_code_size();
        if out.len() != n * sa {
            return Err(Error::InvalidArgument(format!(
                "output buffer must hold {} bytes",
                n * sa
            )));
        }

        let mut assign = vec![NO_ID; n];
        self.level1.quantizer().assign(x, &mut assign)?;
        let cs = self.codec.code_size();
        let mut codes = vec![0u8; n * cs];
        self.codec.encode_vectors(x, &assign, &mut codes)?;

        let coarse = self.level1.coarse_code_size();
        for i in 0..n {
            let slot = &mut out[i * sa..(i + 1) * sa];
            if assign[i] >= 0 {
                self.level1.encode_listno(assign[i], &mut slot[..coarse]);
                slot[coarse..].copy_from_slice(&codes[i * cs..(i + 1) * cs]);
            } else {
                // discarded vector: poison the slot so decoding fails
                slot.fill(0xff);
            }
        }
        Ok(())
    }

    /// Decode standalone-encoded entries back into vectors.
    pub fn sa_decode(&self, bytes: &[u8], x: &mut [f32]) -> Result<()> {
        let sa = self.sa_code_size();
        if sa == 0 || bytes.len() % sa != 0 {
            return Err(Error::InvalidArgument(format!(
                "input length {} is not a multiple of sa_code_size {}",
                bytes.len(),
                sa
            )));
        }
        let n = bytes.len() / sa;
        if x.len() != n * self.d {
            return Err(Error::InvalidArgument(format!(
                "output buffer must hold {} floats",
                n * self.d
            )));
        }
        let coarse = self.level1.coarse_code_size();
        for i in 0..n {
            let slot = &bytes[i * sa..(i + 1) * sa];
            let list_no = self.level1.decode_listno(&slot[..coarse])?;
            self.codec
                .reconstruct_from_code(list_no, &slot[coarse..], &mut x[i * self.d..(i + 1) * self.d])?;
        }
        Ok(())
    }
}
