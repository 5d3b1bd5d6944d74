//! Inverted-list storage: `nlist` growable posting lists of
//! `(id, code)` entries.
//!
//! Entries in a list keep a stable offset for the direct map until they
//! are removed or swapped out. Reads on distinct lists are concurrent and
//! lock-free; mutation goes through `&mut self`, and the batched append
//! path keeps a single writer per list.

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::Idx;

/// Storage contract for the posting lists of an IVF index.
pub trait InvertedLists: Send + Sync {
    fn nlist(&self) -> usize;

    /// Uniform per-entry code width in bytes.
    fn code_size(&self) -> usize;

    fn list_size(&self, list_no: usize) -> usize;

    /// Ids of list `list_no`; valid until the next mutation of that list.
    fn get_ids(&self, list_no: usize) -> &[Idx];

    /// Codes of list `list_no` (`list_size * code_size` bytes).
    fn get_codes(&self, list_no: usize) -> &[u8];

    fn get_single_id(&self, list_no: usize, offset: usize) -> Idx {
        self.get_ids(list_no)[offset]
    }

    fn get_single_code(&self, list_no: usize, offset: usize) -> &[u8] {
        let cs = self.code_size();
        &self.get_codes(list_no)[offset * cs..(offset + 1) * cs]
    }

    /// Append one entry, returning its offset in the list.
    fn add_entry(&mut self, list_no: usize, id: Idx, code: &[u8]) -> Result<usize>;

    /// Append a batch of entries. `list_nos[i] < 0` entries are skipped.
    /// Returns the in-list offset of each appended entry (`usize::MAX`
    /// for skipped ones). Within a list, entries land in input order.
    fn add_entries(&mut self, list_nos: &[Idx], ids: &[Idx], codes: &[u8]) -> Result<Vec<usize>> {
        let cs = self.code_size();
        let mut offsets = vec![usize::MAX; list_nos.len()];
        for (i, &list_no) in list_nos.iter().enumerate() {
            if list_no < 0 {
                continue;
            }
            offsets[i] = self.add_entry(list_no as usize, ids[i], &codes[i * cs..(i + 1) * cs])?;
        }
        Ok(offsets)
    }

    /// Overwrite the entry at `offset`.
    fn update_entry(&mut self, list_no: usize, offset: usize, id: Idx, code: &[u8]) -> Result<()>;

    /// Shrink a list to `new_size` entries.
    fn resize_list(&mut self, list_no: usize, new_size: usize) -> Result<()>;

    /// Drop all entries from all lists.
    fn reset(&mut self) -> Result<()>;

    /// Move every entry of `other` onto the end of the matching list in
    /// `self`, shifting external ids by `id_offset`. Leaves `other` empty.
    fn merge_from(&mut self, other: &mut dyn InvertedLists, id_offset: Idx) -> Result<()> {
        check_compatible(self.nlist(), self.code_size(), other)?;
        for l in 0..self.nlist() {
            for i in 0..other.list_size(l) {
                let id = other.get_single_id(l, i);
                self.add_entry(l, id + id_offset, other.get_single_code(l, i))?;
            }
        }
        other.reset()
    }

    /// Advisory hint that the given lists are about to be scanned.
    fn prefetch_lists(&self, _list_nos: &[Idx]) {}

    /// Frozen copy of this container, or `None` when unsupported.
    fn to_readonly(&self) -> Option<Box<dyn InvertedLists>> {
        None
    }

    fn is_readonly(&self) -> bool {
        false
    }

    /// Total entries across all lists.
    fn compute_ntotal(&self) -> usize {
        (0..self.nlist()).map(|l| self.list_size(l)).sum()
    }
}

fn check_compatible(nlist: usize, code_size: usize, other: &dyn InvertedLists) -> Result<()> {
    if other.nlist() != nlist || other.code_size() != code_size {
        return Err(Error::Incompatible(format!(
            "inverted lists mismatch: nlist {} vs {}, code_size {} vs {}",
            nlist,
            other.nlist(),
            code_size,
            other.code_size()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
struct List {
    ids: Vec<Idx>,
    codes: Vec<u8>,
}

/// In-memory inverted lists backed by per-list growable vectors.
#[derive(Debug, Clone)]
pub struct ArrayInvertedLists {
    nlist: usize,
    code_size: usize,
    lists: Vec<List>,
}

impl ArrayInvertedLists {
    pub fn new(nlist: usize, code_size: usize) -> Self {
        Self {
            nlist,
            code_size,
            lists: vec![List::default(); nlist],
        }
    }

    fn check_list(&self, list_no: usize) -> Result<()> {
        if list_no >= self.nlist {
            return Err(Error::InvalidArgument(format!(
                "list id {} out of range [0, {})",
                list_no, self.nlist
            )));
        }
        Ok(())
    }
}

impl InvertedLists for ArrayInvertedLists {
    fn nlist(&self) -> usize {
        self.nlist
    }

    fn code_size(&self) -> usize {
        self.code_size
    }

    fn list_size(&self, list_no: usize) -> usize {
        self.lists[list_no].ids.len()
    }

    fn get_ids(&self, list_no: usize) -> &[Idx] {
        &self.lists[list_no].ids
    }

    fn get_codes(&self, list_no: usize) -> &[u8] {
        &self.lists[list_no].codes
    }

    fn add_entry(&mut self, list_no: usize, id: Idx, code: &[u8]) -> Result<usize> {
        self.check_list(list_no)?;
        if code.len() != self.code_size {
            return Err(Error::InvalidArgument(format!(
                "code length {} does not match code_size {}",
                code.len(),
                self.code_size
            )));
        }
        let list = &mut self.lists[list_no];
        list.ids.push(id);
        list.codes.extend_from_slice(code);
        Ok(list.ids.len() - 1)
    }

    /// Parallel batched append: entries are bucketed by list and each
    /// list is written by exactly one worker, so per-list order equals
    /// input order without locks.
    fn add_entries(&mut self, list_nos: &[Idx], ids: &[Idx], codes: &[u8]) -> Result<Vec<usize>> {
        let n = list_nos.len();
        let cs = self.code_size;
        if ids.len() != n || codes.len() != n * cs {
            return Err(Error::InvalidArgument(
                "batch length mismatch between assignments, ids and codes".to_string(),
            ));
        }

        let mut buckets: FxHashMap<usize, Vec<u32>> = FxHashMap::default();
        let mut offsets = vec![usize::MAX; n];
        for (i, &list_no) in list_nos.iter().enumerate() {
            if list_no < 0 {
                continue;
            }
            self.check_list(list_no as usize)?;
            buckets.entry(list_no as usize).or_default().push(i as u32);
        }
        for (&l, entries) in &buckets {
            let base = self.lists[l].ids.len();
            for (rank, &i) in entries.iter().enumerate() {
                offsets[i as usize] = base + rank;
            }
        }

        self.lists.par_iter_mut().enumerate().for_each(|(l, list)| {
            if let Some(entries) = buckets.get(&l) {
                list.ids.reserve(entries.len());
                list.codes.reserve(entries.len() * cs);
                for &i in entries {
                    let i = i as usize;
                    list.ids.push(ids[i]);
                    list.codes.extend_from_slice(&codes[i * cs..(i + 1) * cs]);
                }
            }
        });

        Ok(offsets)
    }

    fn update_entry(&mut self, list_no: usize, offset: usize, id: Idx, code: &[u8]) -> Result<()> {
        self.check_list(list_no)?;
        let cs = self.code_size;
        let list = &mut self.lists[list_no];
        if offset >= list.ids.len() {
            return Err(Error::InvalidArgument(format!(
                "offset {} out of range for list {} of size {}",
                offset,
                list_no,
                list.ids.len()
            )));
        }
        list.ids[offset] = id;
        list.codes[offset * cs..(offset + 1) * cs].copy_from_slice(code);
        Ok(())
    }

    fn resize_list(&mut self, list_no: usize, new_size: usize) -> Result<()> {
        self.check_list(list_no)?;
        let list = &mut self.lists[list_no];
        if new_size > list.ids.len() {
            return Err(Error::InvalidArgument(format!(
                "cannot grow list {} from {} to {}",
                list_no,
                list.ids.len(),
                new_size
            )));
        }
        list.ids.truncate(new_size);
        list.codes.truncate(new_size * self.code_size);
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        for list in &mut self.lists {
            list.ids.clear();
            list.codes.clear();
        }
        Ok(())
    }

    fn merge_from(&mut self, other: &mut dyn InvertedLists, id_offset: Idx) -> Result<()> {
        check_compatible(self.nlist, self.code_size, other)?;
        for (l, list) in self.lists.iter_mut().enumerate() {
            list.ids.extend(other.get_ids(l).iter().map(|&id| id + id_offset));
            list.codes.extend_from_slice(other.get_codes(l));
        }
        other.reset()
    }

    fn to_readonly(&self) -> Option<Box<dyn InvertedLists>> {
        let mut offsets = Vec::with_capacity(self.nlist + 1);
        offsets.push(0);
        let mut ids = Vec::new();
        let mut codes = Vec::new();
        for list in &self.lists {
            ids.extend_from_slice(&list.ids);
            codes.extend_from_slice(&list.codes);
            offsets.push(ids.len());
        }
        Some(Box::new(ReadOnlyArrayInvertedLists {
            nlist: self.nlist,
            code_size: self.code_size,
            offsets,
            ids,
            codes,
        }))
    }
}

/// Frozen inverted lists: one contiguous id buffer and one contiguous
/// code buffer with per-list offsets. Every mutating call fails.
#[derive(Debug, Clone)]
pub struct ReadOnlyArrayInvertedLists {
    nlist: usize,
    code_size: usize,
    offsets: Vec<usize>,
    ids: Vec<Idx>,
    codes: Vec<u8>,
}

impl InvertedLists for ReadOnlyArrayInvertedLists {
    fn nlist(&self) -> usize {
        self.nlist
    }

    fn code_size(&self) -> usize {
        self.code_size
    }

    fn list_size(&self, list_no: usize) -> usize {
        self.offsets[list_no + 1] - self.offsets[list_no]
    }

    fn get_ids(&self, list_no: usize) -> &[Idx] {
        &self.ids[self.offsets[list_no]..self.offsets[list_no + 1]]
    }

    fn get_codes(&self, list_no: usize) -> &[u8] {
        &self.codes[self.offsets[list_no] * self.code_size..self.offsets[list_no + 1] * self.code_size]
    }

    fn add_entry(&mut self, _list_no: usize, _id: Idx, _code: &[u8]) -> Result<usize> {
        Err(Error::ReadOnly)
    }

    fn update_entry(&mut self, _list_no: usize, _offset: usize, _id: Idx, _code: &[u8]) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn resize_list(&mut self, _list_no: usize, _new_size: usize) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn reset(&mut self) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn is_readonly(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(byte: u8, cs: usize) -> Vec<u8> {
        vec![byte; cs]
    }

    #[test]
    fn test_add_and_get() {
        let mut il = ArrayInvertedLists::new(4, 2);
        assert_eq!(il.add_entry(1, 10, &code(0xaa, 2)).unwrap(), 0);
        assert_eq!(il.add_entry(1, 11, &code(0xbb, 2)).unwrap(), 1);
        assert_eq!(il.add_entry(3, 12, &code(0xcc, 2)).unwrap(), 0);

        assert_eq!(il.list_size(1), 2);
        assert_eq!(il.get_ids(1), &[10, 11]);
        assert_eq!(il.get_single_id(1, 1), 11);
        assert_eq!(il.get_single_code(1, 1), &[0xbb, 0xbb]);
        assert_eq!(il.compute_ntotal(), 3);
    }

    #[test]
    fn test_add_entry_validates() {
        let mut il = ArrayInvertedLists::new(2, 2);
        assert!(il.add_entry(2, 0, &code(0, 2)).is_err());
        assert!(il.add_entry(0, 0, &code(0, 3)).is_err());
    }

    #[test]
    fn test_add_entries_batch() {
        let mut il = ArrayInvertedLists::new(4, 1);
        let list_nos = [1, -1, 1, 0, 1];
        let ids = [100, 101, 102, 103, 104];
        let codes = [10u8, 11, 12, 13, 14];

        let offsets = il.add_entries(&list_nos, &ids, &codes).unwrap();
        assert_eq!(offsets, vec![0, usize::MAX, 1, 0, 2]);

        // per-list order equals input order
        assert_eq!(il.get_ids(1), &[100, 102, 104]);
        assert_eq!(il.get_codes(1), &[10, 12, 14]);
        assert_eq!(il.get_ids(0), &[103]);
        assert_eq!(il.compute_ntotal(), 4);
    }

    #[test]
    fn test_update_and_resize() {
        let mut il = ArrayInvertedLists::new(2, 1);
        il.add_entry(0, 1, &[1]).unwrap();
        il.add_entry(0, 2, &[2]).unwrap();
        il.add_entry(0, 3, &[3]).unwrap();

        // swap-with-tail then truncate, the removal idiom
        il.update_entry(0, 0, 3, &[3]).unwrap();
        il.resize_list(0, 2).unwrap();
        assert_eq!(il.get_ids(0), &[3, 2]);
        assert_eq!(il.get_codes(0), &[3, 2]);

        assert!(il.resize_list(0, 5).is_err());
    }

    #[test]
    fn test_merge_from_moves_and_offsets() {
        let mut a = ArrayInvertedLists::new(2, 1);
        a.add_entry(0, 0, &[1]).unwrap();
        let mut b = ArrayInvertedLists::new(2, 1);
        b.add_entry(0, 0, &[2]).unwrap();
        b.add_entry(1, 1, &[3]).unwrap();

        a.merge_from(&mut b, 100).unwrap();

        assert_eq!(a.get_ids(0), &[0, 100]);
        assert_eq!(a.get_ids(1), &[101]);
        assert_eq!(a.compute_ntotal(), 3);
        assert_eq!(b.compute_ntotal(), 0);
    }

    #[test]
    fn test_merge_from_incompatible() {
        let mut a = ArrayInvertedLists::new(2, 1);
        let mut b = ArrayInvertedLists::new(3, 1);
        assert!(a.merge_from(&mut b, 0).is_err());
    }

    #[test]
    fn test_readonly_transition() {
        let mut il = ArrayInvertedLists::new(3, 2);
        il.add_entry(0, 5, &code(1, 2)).unwrap();
        il.add_entry(2, 6, &code(2, 2)).unwrap();
        il.add_entry(2, 7, &code(3, 2)).unwrap();

        let mut ro = il.to_readonly().unwrap();
        assert!(ro.is_readonly());
        assert_eq!(ro.list_size(0), 1);
        assert_eq!(ro.list_size(1), 0);
        assert_eq!(ro.get_ids(2), &[6, 7]);
        assert_eq!(ro.get_single_code(2, 1), &[3, 3]);
        assert_eq!(ro.compute_ntotal(), 3);

        assert!(matches!(ro.add_entry(0, 9, &code(0, 2)), Err(Error::ReadOnly)));
        assert!(matches!(ro.resize_list(2, 0), Err(Error::ReadOnly)));
        assert!(ro.to_readonly().is_none());
    }
}
