//! Argus - an inverted-file (IVF) vector similarity search core
//!
//! Given a query vector, an [`IvfIndex`] returns the `k` nearest stored
//! vectors under squared L2 or inner product, or every vector within a
//! radius. The library provides:
//!
//! - A coarse-quantizer routing layer: vectors are assigned to one of
//!   `nlist` Voronoi cells, queries probe the `nprobe` nearest cells
//! - Inverted-list storage with uniform per-entry byte codes and a
//!   one-way read-only transition
//! - Parallel scan/heap-merge search with per-query or per-probe work
//!   partitioning, exclusion filters and cooperative cancellation
//! - An optional direct map (dense or hashed) enabling single-vector
//!   reconstruction, targeted removal and in-place update
//! - Index maintenance: merge, subset copy, container replacement
//!
//! The index is generic over its vector [`Codec`]; [`FlatCodec`] stores
//! vectors verbatim (IVF-Flat). The coarse quantizer is pluggable behind
//! [`CoarseQuantizer`]; [`FlatQuantizer`] is the exact flat
//! implementation.

pub mod codec;
pub mod direct_map;
pub mod error;
pub mod index;
pub mod interrupt;
pub mod invlists;
pub mod metric;
pub mod quantizer;
pub mod range;
pub mod selector;
pub mod stats;
pub mod structures;

// Re-exports
pub use codec::{Codec, FlatCodec, ListScanner};
pub use direct_map::{lo_build, lo_listno, lo_offset, DirectMap, DirectMapKind};
pub use error::{Error, Result};
pub use index::{IvfIndex, SearchParams, Subset, PARALLEL_MODE_NO_HEAP_INIT};
pub use invlists::{ArrayInvertedLists, InvertedLists, ReadOnlyArrayInvertedLists};
pub use metric::MetricType;
pub use quantizer::{
    ClusteringParams, CoarseQuantizer, FlatQuantizer, Level1Quantizer, TrainStrategy,
};
pub use range::{RangeQueryResult, RangeSearchResult};
pub use selector::{IdSelector, IdSelectorBatch, IdSelectorRange};
pub use stats::{IvfStats, IVF_STATS};
pub use structures::IdBitset;

/// External vector identifier chosen by the caller or auto-assigned at
/// insert time.
pub type Idx = i64;

/// Reserved id marking "unassigned": discarded coarse assignments and
/// unused result slots.
pub const NO_ID: Idx = -1;
