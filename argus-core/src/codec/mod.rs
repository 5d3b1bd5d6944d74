//! Vector codecs and list scanners.
//!
//! A [`Codec`] turns vectors into fixed-width per-entry byte codes at add
//! time; its [`ListScanner`] scores one posting list at a time against a
//! query at search time. The IVF core is generic over the codec, so the
//! same routing, heap and maintenance machinery serves flat storage and
//! compressed encodings alike.

pub mod flat;

use crate::error::{Error, Result};
use crate::metric::MetricType;
use crate::range::RangeQueryResult;
use crate::structures::bitset::IdBitset;
use crate::Idx;

pub use flat::FlatCodec;

/// Per-entry vector encoder of an IVF index.
pub trait Codec: Send + Sync {
    fn d(&self) -> usize;

    /// Encoded size of one vector in bytes.
    fn code_size(&self) -> usize;

    fn is_trained(&self) -> bool {
        true
    }

    /// Train the encoder (e.g. on residuals). Default: nothing to train.
    fn train(&mut self, _x: &[f32]) -> Result<()> {
        Ok(())
    }

    /// Encode `list_nos.len()` vectors into `codes` (`n * code_size`
    /// bytes), given their list assignments.
    fn encode_vectors(&self, x: &[f32], list_nos: &[Idx], codes: &mut [u8]) -> Result<()>;

    /// Decode one entry back into a vector. Codecs that cannot invert
    /// their encoding report unsupported.
    fn reconstruct_from_code(&self, _list_no: Idx, _code: &[u8], _out: &mut [f32]) -> Result<()> {
        Err(Error::Unsupported(
            "reconstruct_from_code not implemented for this codec".to_string(),
        ))
    }

    /// A scanner for this codec's codes. In store-pairs mode result
    /// labels carry packed (list, offset) handles instead of external
    /// ids.
    fn scanner(&self, metric: MetricType, store_pairs: bool) -> Box<dyn ListScanner + '_>;
}

/// Scores one posting list at a time against the current query.
///
/// A scanner is created once per worker thread and reconfigured with
/// `set_query` / `set_list` as the search proceeds.
pub trait ListScanner: Send {
    fn set_query(&mut self, x: &[f32]);

    /// Position the scanner on a list before scanning it.
    fn set_list(&mut self, list_no: Idx, coarse_dis: f32);

    /// Score `codes.len() / code_size` entries into the bounded result
    /// heap. `ids` is absent in store-pairs mode. Entries whose id bit
    /// is set in `filter` are skipped. Returns the number of heap
    /// updates.
    fn scan_codes(
        &mut self,
        codes: &[u8],
        ids: Option<&[Idx]>,
        heap_dis: &mut [f32],
        heap_ids: &mut [Idx],
        filter: Option<&IdBitset>,
    ) -> usize;

    /// Append every entry within `radius` to `out`: score ≥ radius for
    /// inner product, distance ≤ radius for L2.
    fn scan_codes_range(
        &mut self,
        _codes: &[u8],
        _ids: Option<&[Idx]>,
        _radius: f32,
        _out: &mut RangeQueryResult,
        _filter: Option<&IdBitset>,
    ) -> Result<()> {
        Err(Error::Unsupported(
            "scan_codes_range not implemented for this scanner".to_string(),
        ))
    }
}
