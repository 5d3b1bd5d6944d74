//! Flat (uncompressed) codec: codes are the raw little-endian f32 bytes.
//!
//! An index built over this codec is an IVF-Flat: exact distances inside
//! each probed list, no quantization error beyond the coarse routing.

use byteorder::{ByteOrder, LittleEndian};

use super::{Codec, ListScanner};
use crate::direct_map::lo_build;
use crate::error::{Error, Result};
use crate::metric::{inner_product, l2_sqr, MetricType};
use crate::range::RangeQueryResult;
use crate::structures::bitset::IdBitset;
use crate::structures::heap::{self, HeapOrd, IpOrd, L2Ord};
use crate::Idx;

/// Codec storing vectors verbatim, `4 * d` bytes per entry.
#[derive(Debug, Clone)]
pub struct FlatCodec {
    d: usize,
}

impl FlatCodec {
    pub fn new(d: usize) -> Self {
        Self { d }
    }
}

impl Codec for FlatCodec {
    fn d(&self) -> usize {
        self.d
    }

    fn code_size(&self) -> usize {
        self.d * 4
    }

    fn encode_vectors(&self, x: &[f32], list_nos: &[Idx], codes: &mut [u8]) -> Result<()> {
        let n = list_nos.len();
        if x.len() != n * self.d || codes.len() != n * self.code_size() {
            return Err(Error::InvalidArgument(
                "encode buffer sizes do not match input".to_string(),
            ));
        }
        // vectors are stored verbatim, discarded ones included
        LittleEndian::write_f32_into(x, codes);
        Ok(())
    }

    fn reconstruct_from_code(&self, _list_no: Idx, code: &[u8], out: &mut [f32]) -> Result<()> {
        if code.len() != self.code_size() || out.len() != self.d {
            return Err(Error::InvalidArgument(
                "reconstruct buffer sizes do not match the code".to_string(),
            ));
        }
        LittleEndian::read_f32_into(code, out);
        Ok(())
    }

    fn scanner(&self, metric: MetricType, store_pairs: bool) -> Box<dyn ListScanner + '_> {
        Box::new(FlatScanner {
            d: self.d,
            metric,
            store_pairs,
            query: vec![0.0; self.d],
            scratch: vec![0.0; self.d],
            list_no: -1,
        })
    }
}

struct FlatScanner {
    d: usize,
    metric: MetricType,
    store_pairs: bool,
    query: Vec<f32>,
    scratch: Vec<f32>,
    list_no: Idx,
}

impl FlatScanner {
    fn scan_impl<O: HeapOrd>(
        &mut self,
        dist: fn(&[f32], &[f32]) -> f32,
        codes: &[u8],
        ids: Option<&[Idx]>,
        heap_dis: &mut [f32],
        heap_ids: &mut [Idx],
        filter: Option<&IdBitset>,
    ) -> usize {
        let cs = self.d * 4;
        let mut nup = 0;
        for (j, code) in codes.chunks_exact(cs).enumerate() {
            let id = match ids {
                Some(ids) => {
                    if filter.is_some_and(|f| f.test(ids[j])) {
                        continue;
                    }
                    ids[j]
                }
                None => lo_build(self.list_no, j),
            };
            LittleEndian::read_f32_into(code, &mut self.scratch);
            let dis = dist(&self.query, &self.scratch);
            if heap::push::<O>(heap_dis, heap_ids, dis, id) {
                nup += 1;
            }
        }
        nup
    }
}

impl ListScanner for FlatScanner {
    fn set_query(&mut self, x: &[f32]) {
        self.query.clear();
        self.query.extend_from_slice(x);
    }

    fn set_list(&mut self, list_no: Idx, _coarse_dis: f32) {
        self.list_no = list_no;
    }

    fn scan_codes(
        &mut self,
        codes: &[u8],
        ids: Option<&[Idx]>,
        heap_dis: &mut [f32],
        heap_ids: &mut [Idx],
        filter: Option<&IdBitset>,
    ) -> usize {
        debug_assert!(ids.is_some() != self.store_pairs);
        match self.metric {
            MetricType::L2 => self.scan_impl::<L2Ord>(l2_sqr, codes, ids, heap_dis, heap_ids, filter),
            MetricType::InnerProduct => {
                self.scan_impl::<IpOrd>(inner_product, codes, ids, heap_dis, heap_ids, filter)
            }
        }
    }

    fn scan_codes_range(
        &mut self,
        codes: &[u8],
        ids: Option<&[Idx]>,
        radius: f32,
        out: &mut RangeQueryResult,
        filter: Option<&IdBitset>,
    ) -> Result<()> {
        let cs = self.d * 4;
        for (j, code) in codes.chunks_exact(cs).enumerate() {
            let id = match ids {
                Some(ids) => {
                    if filter.is_some_and(|f| f.test(ids[j])) {
                        continue;
                    }
                    ids[j]
                }
                None => lo_build(self.list_no, j),
            };
            LittleEndian::read_f32_into(code, &mut self.scratch);
            let (dis, within) = match self.metric {
                MetricType::L2 => {
                    let dis = l2_sqr(&self.query, &self.scratch);
                    (dis, dis <= radius)
                }
                MetricType::InnerProduct => {
                    let dis = inner_product(&self.query, &self.scratch);
                    (dis, dis >= radius)
                }
            };
            if within {
                out.add(dis, id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direct_map::{lo_listno, lo_offset};
    use crate::NO_ID;

    fn encode(codec: &FlatCodec, x: &[f32]) -> Vec<u8> {
        let n = x.len() / codec.d();
        let list_nos = vec![0 as Idx; n];
        let mut codes = vec![0u8; n * codec.code_size()];
        codec.encode_vectors(x, &list_nos, &mut codes).unwrap();
        codes
    }

    #[test]
    fn test_encode_reconstruct_roundtrip() {
        let codec = FlatCodec::new(3);
        let x = [1.0f32, -2.5, 0.25];
        let codes = encode(&codec, &x);
        assert_eq!(codes.len(), 12);

        let mut out = [0.0f32; 3];
        codec.reconstruct_from_code(0, &codes, &mut out).unwrap();
        assert_eq!(out, x);
    }

    #[test]
    fn test_scan_codes_l2() {
        let codec = FlatCodec::new(2);
        let codes = encode(&codec, &[0.0, 0.0, 3.0, 0.0, 1.0, 1.0]);
        let ids = [10, 11, 12];

        let mut scanner = codec.scanner(MetricType::L2, false);
        scanner.set_query(&[0.0, 0.0]);
        scanner.set_list(0, 0.0);

        let mut dis = vec![0.0; 2];
        let mut labels = vec![0; 2];
        heap::heapify::<L2Ord>(&mut dis, &mut labels);
        let nup = scanner.scan_codes(&codes, Some(&ids), &mut dis, &mut labels, None);
        heap::reorder::<L2Ord>(&mut dis, &mut labels);

        assert_eq!(labels, vec![10, 12]);
        assert_eq!(dis, vec![0.0, 2.0]);
        assert!(nup >= 2);
    }

    #[test]
    fn test_scan_codes_ip() {
        let codec = FlatCodec::new(2);
        let codes = encode(&codec, &[1.0, 0.0, 0.0, 2.0]);
        let ids = [5, 6];

        let mut scanner = codec.scanner(MetricType::InnerProduct, false);
        scanner.set_query(&[0.0, 1.0]);
        scanner.set_list(0, 0.0);

        let mut dis = vec![0.0; 1];
        let mut labels = vec![0; 1];
        heap::heapify::<IpOrd>(&mut dis, &mut labels);
        scanner.scan_codes(&codes, Some(&ids), &mut dis, &mut labels, None);

        assert_eq!(labels, vec![6]);
        assert_eq!(dis, vec![2.0]);
    }

    #[test]
    fn test_scan_codes_store_pairs() {
        let codec = FlatCodec::new(1);
        let codes = encode(&codec, &[1.0, 5.0]);

        let mut scanner = codec.scanner(MetricType::L2, true);
        scanner.set_query(&[1.0]);
        scanner.set_list(7, 0.0);

        let mut dis = vec![0.0; 1];
        let mut labels = vec![0; 1];
        heap::heapify::<L2Ord>(&mut dis, &mut labels);
        scanner.scan_codes(&codes, None, &mut dis, &mut labels, None);

        assert_eq!(lo_listno(labels[0]), 7);
        assert_eq!(lo_offset(labels[0]), 0);
    }

    #[test]
    fn test_scan_codes_filter() {
        let codec = FlatCodec::new(1);
        let codes = encode(&codec, &[0.0, 0.1]);
        let ids = [3, 4];
        let filter = IdBitset::from_ids(8, [3]);

        let mut scanner = codec.scanner(MetricType::L2, false);
        scanner.set_query(&[0.0]);
        scanner.set_list(0, 0.0);

        let mut dis = vec![0.0; 2];
        let mut labels = vec![0; 2];
        heap::heapify::<L2Ord>(&mut dis, &mut labels);
        scanner.scan_codes(&codes, Some(&ids), &mut dis, &mut labels, Some(&filter));
        heap::reorder::<L2Ord>(&mut dis, &mut labels);

        assert_eq!(labels, vec![4, NO_ID]);
    }

    #[test]
    fn test_scan_codes_range_boundary() {
        let codec = FlatCodec::new(1);
        let codes = encode(&codec, &[0.0, 0.5, 1.0, 2.0]);
        let ids = [0, 1, 2, 3];

        let mut scanner = codec.scanner(MetricType::L2, false);
        scanner.set_query(&[0.0]);
        scanner.set_list(0, 0.0);

        let mut out = RangeQueryResult::new(0);
        scanner
            .scan_codes_range(&codes, Some(&ids), 1.0, &mut out, None)
            .unwrap();

        // L2 admission is inclusive: the entry at exactly the radius is kept
        assert_eq!(out.labels, vec![0, 1, 2]);
        assert_eq!(out.distances, vec![0.0, 0.25, 1.0]);
    }
}
