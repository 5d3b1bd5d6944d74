//! Search statistics counters.
//!
//! Counters are additive across concurrent searches. Parallel regions
//! tally locally and flush once after the join, so the global values are
//! eventually consistent rather than per-search isolated.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters describing IVF search work.
///
/// A process-wide default sink lives in [`IVF_STATS`]; an index can be
/// pointed at its own sink with `IvfIndex::set_stats_sink`.
#[derive(Debug, Default)]
pub struct IvfStats {
    nq: AtomicU64,
    nlist: AtomicU64,
    ndis: AtomicU64,
    nheap_updates: AtomicU64,
    quantization_time_ms: AtomicU64,
    search_time_ms: AtomicU64,
}

impl IvfStats {
    pub const fn new() -> Self {
        Self {
            nq: AtomicU64::new(0),
            nlist: AtomicU64::new(0),
            ndis: AtomicU64::new(0),
            nheap_updates: AtomicU64::new(0),
            quantization_time_ms: AtomicU64::new(0),
            search_time_ms: AtomicU64::new(0),
        }
    }

    pub fn add_search(&self, nq: u64, nlist: u64, ndis: u64, nheap_updates: u64) {
        self.nq.fetch_add(nq, Ordering::Relaxed);
        self.nlist.fetch_add(nlist, Ordering::Relaxed);
        self.ndis.fetch_add(ndis, Ordering::Relaxed);
        self.nheap_updates.fetch_add(nheap_updates, Ordering::Relaxed);
    }

    pub fn add_quantization_time_ms(&self, ms: u64) {
        self.quantization_time_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn add_search_time_ms(&self, ms: u64) {
        self.search_time_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Queries processed.
    pub fn nq(&self) -> u64 {
        self.nq.load(Ordering::Relaxed)
    }

    /// Non-empty inverted lists scanned.
    pub fn nlist(&self) -> u64 {
        self.nlist.load(Ordering::Relaxed)
    }

    /// Distances computed.
    pub fn ndis(&self) -> u64 {
        self.ndis.load(Ordering::Relaxed)
    }

    /// Result-heap updates.
    pub fn nheap_updates(&self) -> u64 {
        self.nheap_updates.load(Ordering::Relaxed)
    }

    pub fn quantization_time_ms(&self) -> u64 {
        self.quantization_time_ms.load(Ordering::Relaxed)
    }

    pub fn search_time_ms(&self) -> u64 {
        self.search_time_ms.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.nq.store(0, Ordering::Relaxed);
        self.nlist.store(0, Ordering::Relaxed);
        self.ndis.store(0, Ordering::Relaxed);
        self.nheap_updates.store(0, Ordering::Relaxed);
        self.quantization_time_ms.store(0, Ordering::Relaxed);
        self.search_time_ms.store(0, Ordering::Relaxed);
    }
}

/// Process-wide default stats sink.
pub static IVF_STATS: IvfStats = IvfStats::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_and_reset() {
        let stats = IvfStats::new();
        stats.add_search(2, 5, 100, 7);
        stats.add_search(1, 3, 50, 2);
        stats.add_quantization_time_ms(4);

        assert_eq!(stats.nq(), 3);
        assert_eq!(stats.nlist(), 8);
        assert_eq!(stats.ndis(), 150);
        assert_eq!(stats.nheap_updates(), 9);
        assert_eq!(stats.quantization_time_ms(), 4);

        stats.reset();
        assert_eq!(stats.nq(), 0);
        assert_eq!(stats.ndis(), 0);
    }
}
