//! Direct map: external id → (list, offset) bookkeeping.
//!
//! Enables single-vector reconstruction, targeted removal and in-place
//! update. The payload is a 64-bit handle packing the list id in the
//! high 32 bits and the in-list offset in the low 32. The invariant is
//! bidirectional: every live entry at `(list, offset)` with id `x` has
//! `map[x] = lo(list, offset)` and no map entry dangles.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::invlists::InvertedLists;
use crate::selector::IdSelector;
use crate::Idx;

/// Pack `(list_no, offset)` into one 64-bit handle (32:32 split).
/// `list_no == -1` yields a negative handle marking a discarded vector.
#[inline]
pub fn lo_build(list_no: Idx, offset: usize) -> Idx {
    assert!(
        list_no >= -1 && list_no < (1 << 31) && offset <= u32::MAX as usize,
        "(list {}, offset {}) overflows the packed handle",
        list_no,
        offset
    );
    (list_no << 32) | offset as Idx
}

#[inline]
pub fn lo_listno(lo: Idx) -> Idx {
    lo >> 32
}

#[inline]
pub fn lo_offset(lo: Idx) -> usize {
    (lo & 0xffff_ffff) as usize
}

/// Representation of the id → location index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DirectMapKind {
    /// No index; reconstruction and targeted update are unavailable.
    #[default]
    NoMap,
    /// Dense array indexed by id; requires sequential ids in `[0, ntotal)`.
    Array,
    /// Sparse hash map, any ids.
    Hashtable,
}

/// Optional mapping from external id to packed list location.
#[derive(Debug, Clone, Default)]
pub struct DirectMap {
    kind: DirectMapKind,
    array: Vec<Idx>,
    hashtable: FxHashMap<Idx, Idx>,
}

impl DirectMap {
    pub fn kind(&self) -> DirectMapKind {
        self.kind
    }

    /// Drop all entries, keeping the kind.
    pub fn clear(&mut self) {
        self.array.clear();
        self.hashtable.clear();
    }

    /// Location of `id` as a packed handle.
    pub fn get(&self, id: Idx) -> Result<Idx> {
        let lo = match self.kind {
            DirectMapKind::NoMap => {
                return Err(Error::Unsupported(
                    "direct map is not enabled".to_string(),
                ))
            }
            DirectMapKind::Array => {
                if id < 0 || id as usize >= self.array.len() {
                    return Err(Error::IdNotFound(id));
                }
                self.array[id as usize]
            }
            DirectMapKind::Hashtable => {
                *self.hashtable.get(&id).ok_or(Error::IdNotFound(id))?
            }
        };
        // discarded vectors carry a negative handle
        if lo < 0 {
            return Err(Error::IdNotFound(id));
        }
        Ok(lo)
    }

    /// Reject insertions incompatible with the current kind.
    pub fn check_can_add(&self, ids: Option<&[Idx]>) -> Result<()> {
        if self.kind == DirectMapKind::Array && ids.is_some() {
            return Err(Error::InvalidArgument(
                "cannot add vectors with explicit ids to an index with an array direct map"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Switch representation, rebuilding the map from current list
    /// contents.
    pub fn set_kind(
        &mut self,
        kind: DirectMapKind,
        invlists: &dyn InvertedLists,
        ntotal: usize,
    ) -> Result<()> {
        if kind == self.kind {
            return Ok(());
        }
        self.clear();
        self.kind = kind;

        match kind {
            DirectMapKind::NoMap => return Ok(()),
            DirectMapKind::Array => self.array.resize(ntotal, -1),
            DirectMapKind::Hashtable => self.hashtable.reserve(ntotal),
        }

        for l in 0..invlists.nlist() {
            for (offset, &id) in invlists.get_ids(l).iter().enumerate() {
                match kind {
                    DirectMapKind::Array => {
                        if id < 0 || id as usize >= ntotal {
                            return Err(Error::InvalidArgument(format!(
                                "array direct map requires sequential ids, got {}",
                                id
                            )));
                        }
                        self.array[id as usize] = lo_build(l as Idx, offset);
                    }
                    DirectMapKind::Hashtable => {
                        self.hashtable.insert(id, lo_build(l as Idx, offset));
                    }
                    DirectMapKind::NoMap => unreachable!(),
                }
            }
        }
        Ok(())
    }

    /// Remove every entry selected by `sel`, swapping list tails into the
    /// holes and keeping the map consistent for moved entries. Returns
    /// the number of removed ids.
    pub fn remove_ids(
        &mut self,
        sel: &dyn IdSelector,
        invlists: &mut dyn InvertedLists,
    ) -> Result<usize> {
        match self.kind {
            DirectMapKind::NoMap => {
                // exhaustive sweep of every list
                let mut nremove = 0;
                for l in 0..invlists.nlist() {
                    let mut size = invlists.list_size(l);
                    let mut j = 0;
                    while j < size {
                        if sel.is_member(invlists.get_single_id(l, j)) {
                            size -= 1;
                            let tail_id = invlists.get_single_id(l, size);
                            let tail_code = invlists.get_single_code(l, size).to_vec();
                            invlists.update_entry(l, j, tail_id, &tail_code)?;
                        } else {
                            j += 1;
                        }
                    }
                    let removed = invlists.list_size(l) - size;
                    if removed > 0 {
                        invlists.resize_list(l, size)?;
                        nremove += removed;
                    }
                }
                Ok(nremove)
            }
            DirectMapKind::Hashtable => {
                let mut victims: Vec<Idx> = self
                    .hashtable
                    .keys()
                    .copied()
                    .filter(|&id| sel.is_member(id))
                    .collect();
                victims.sort_unstable();

                let mut nremove = 0;
                for id in victims {
                    let Some(lo) = self.hashtable.remove(&id) else {
                        continue;
                    };
                    nremove += 1;
                    if lo < 0 {
                        // discarded vector, occupies no list
                        continue;
                    }
                    let list_no = lo_listno(lo) as usize;
                    let offset = lo_offset(lo);
                    let tail = invlists.list_size(list_no) - 1;
                    if offset < tail {
                        let tail_id = invlists.get_single_id(list_no, tail);
                        let tail_code = invlists.get_single_code(list_no, tail).to_vec();
                        invlists.update_entry(list_no, offset, tail_id, &tail_code)?;
                        self.hashtable
                            .insert(tail_id, lo_build(list_no as Idx, offset));
                    }
                    invlists.resize_list(list_no, tail)?;
                }
                Ok(nremove)
            }
            DirectMapKind::Array => Err(Error::Unsupported(
                "remove_ids not supported with an array direct map".to_string(),
            )),
        }
    }

    /// Relocate `ids` to their new lists with new codes, in place.
    ///
    /// Array mode only: the moved entry's old slot is filled by swapping
    /// in the list tail (whose map entry is repointed), so ids stay a
    /// gap-free range.
    pub fn update_codes(
        &mut self,
        invlists: &mut dyn InvertedLists,
        ids: &[Idx],
        new_list_nos: &[Idx],
        codes: &[u8],
    ) -> Result<()> {
        if self.kind != DirectMapKind::Array {
            return Err(Error::Unsupported(
                "update_codes requires an array direct map".to_string(),
            ));
        }
        let cs = invlists.code_size();

        for (i, &id) in ids.iter().enumerate() {
            if id < 0 || id as usize >= self.array.len() {
                return Err(Error::IdNotFound(id));
            }

            // detach from the old list, swapping the tail into the hole
            let lo = self.array[id as usize];
            if lo >= 0 {
                let list_no = lo_listno(lo) as usize;
                let offset = lo_offset(lo);
                let tail = invlists.list_size(list_no) - 1;
                if offset != tail {
                    let tail_id = invlists.get_single_id(list_no, tail);
                    let tail_code = invlists.get_single_code(list_no, tail).to_vec();
                    self.array[tail_id as usize] = lo_build(list_no as Idx, offset);
                    invlists.update_entry(list_no, offset, tail_id, &tail_code)?;
                }
                invlists.resize_list(list_no, tail)?;
            }

            // append into the new list
            let list_no = new_list_nos[i];
            if list_no >= 0 {
                let offset =
                    invlists.add_entry(list_no as usize, id, &codes[i * cs..(i + 1) * cs])?;
                self.array[id as usize] = lo_build(list_no, offset);
            } else {
                self.array[id as usize] = lo_build(-1, 0);
            }
        }
        Ok(())
    }
}

/// Batch recorder used during `add_with_ids`: reserves the id range up
/// front, then each appended entry reports its location.
pub struct DirectMapAdd<'a> {
    map: &'a mut DirectMap,
    ntotal: Idx,
    xids: Option<&'a [Idx]>,
}

impl<'a> DirectMapAdd<'a> {
    pub fn new(
        map: &'a mut DirectMap,
        n: usize,
        ntotal: Idx,
        xids: Option<&'a [Idx]>,
    ) -> Result<Self> {
        if map.kind == DirectMapKind::Array {
            if xids.is_some() {
                return Err(Error::InvalidArgument(
                    "array direct map requires auto-assigned ids".to_string(),
                ));
            }
            map.array.resize(ntotal as usize + n, -1);
        }
        Ok(Self { map, ntotal, xids })
    }

    /// Record that input vector `i` landed at `(list_no, offset)`.
    /// `list_no == -1` records a discarded vector.
    pub fn add(&mut self, i: usize, list_no: Idx, offset: usize) {
        match self.map.kind {
            DirectMapKind::NoMap => {}
            DirectMapKind::Array => {
                self.map.array[self.ntotal as usize + i] = lo_build(list_no, offset);
            }
            DirectMapKind::Hashtable => {
                let id = self.xids.map_or(self.ntotal + i as Idx, |x| x[i]);
                self.map.hashtable.insert(id, lo_build(list_no, offset));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invlists::ArrayInvertedLists;
    use crate::selector::IdSelectorBatch;

    #[test]
    fn test_lo_pack_unpack() {
        let lo = lo_build(7, 42);
        assert_eq!(lo_listno(lo), 7);
        assert_eq!(lo_offset(lo), 42);

        let discarded = lo_build(-1, 0);
        assert!(discarded < 0);
        assert_eq!(lo_listno(discarded), -1);
    }

    #[test]
    #[should_panic]
    fn test_lo_overflow_asserts() {
        lo_build(0, u32::MAX as usize + 1);
    }

    fn lists_with(entries: &[(usize, Idx)]) -> ArrayInvertedLists {
        let mut il = ArrayInvertedLists::new(4, 1);
        for &(l, id) in entries {
            il.add_entry(l, id, &[id as u8]).unwrap();
        }
        il
    }

    #[test]
    fn test_set_kind_array() {
        let il = lists_with(&[(0, 0), (1, 1), (1, 2)]);
        let mut dm = DirectMap::default();
        dm.set_kind(DirectMapKind::Array, &il, 3).unwrap();

        assert_eq!(dm.get(0).unwrap(), lo_build(0, 0));
        assert_eq!(dm.get(2).unwrap(), lo_build(1, 1));
        assert!(dm.get(3).is_err());
    }

    #[test]
    fn test_set_kind_array_rejects_sparse_ids() {
        let il = lists_with(&[(0, 100)]);
        let mut dm = DirectMap::default();
        assert!(dm.set_kind(DirectMapKind::Array, &il, 1).is_err());
    }

    #[test]
    fn test_check_can_add() {
        let il = lists_with(&[]);
        let mut dm = DirectMap::default();
        dm.set_kind(DirectMapKind::Array, &il, 0).unwrap();
        assert!(dm.check_can_add(Some(&[5])).is_err());
        assert!(dm.check_can_add(None).is_ok());

        dm.set_kind(DirectMapKind::Hashtable, &il, 0).unwrap();
        assert!(dm.check_can_add(Some(&[5])).is_ok());
    }

    #[test]
    fn test_get_requires_map() {
        let dm = DirectMap::default();
        assert!(matches!(dm.get(0), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_remove_ids_hashtable_swaps_tail() {
        let mut il = lists_with(&[(1, 10), (1, 11), (1, 12)]);
        let mut dm = DirectMap::default();
        dm.set_kind(DirectMapKind::Hashtable, &il, 3).unwrap();

        let sel = IdSelectorBatch::new([10]);
        let removed = dm.remove_ids(&sel, &mut il).unwrap();
        assert_eq!(removed, 1);

        // the tail entry 12 moved into offset 0 and its map entry followed
        assert_eq!(il.get_ids(1), &[12, 11]);
        assert_eq!(dm.get(12).unwrap(), lo_build(1, 0));
        assert_eq!(dm.get(11).unwrap(), lo_build(1, 1));
        assert!(dm.get(10).is_err());
    }

    #[test]
    fn test_remove_ids_no_map_sweeps() {
        let mut il = lists_with(&[(0, 0), (1, 1), (1, 2), (2, 3)]);
        let mut dm = DirectMap::default();

        let sel = IdSelectorBatch::new([1, 3, 99]);
        let removed = dm.remove_ids(&sel, &mut il).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(il.get_ids(1), &[2]);
        assert_eq!(il.list_size(2), 0);
        assert_eq!(il.compute_ntotal(), 2);
    }

    #[test]
    fn test_remove_ids_array_unsupported() {
        let mut il = lists_with(&[(0, 0)]);
        let mut dm = DirectMap::default();
        dm.set_kind(DirectMapKind::Array, &il, 1).unwrap();
        let sel = IdSelectorBatch::new([0]);
        assert!(matches!(
            dm.remove_ids(&sel, &mut il),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_update_codes_keeps_lists_gap_free() {
        // ids 0..3: list 0 holds [0, 1, 2], list 2 holds [3]
        let mut il = lists_with(&[(0, 0), (0, 1), (0, 2), (2, 3)]);
        let mut dm = DirectMap::default();
        dm.set_kind(DirectMapKind::Array, &il, 4).unwrap();

        // move id 0 (not the tail of list 0) into list 2
        dm.update_codes(&mut il, &[0], &[2], &[0xff]).unwrap();

        // tail entry 2 filled the vacated slot
        assert_eq!(il.get_ids(0), &[2, 1]);
        assert_eq!(dm.get(2).unwrap(), lo_build(0, 0));
        assert_eq!(il.get_ids(2), &[3, 0]);
        assert_eq!(dm.get(0).unwrap(), lo_build(2, 1));
        assert_eq!(il.get_single_code(2, 1), &[0xff]);
    }

    #[test]
    fn test_direct_map_add_array() {
        let mut dm = DirectMap::default();
        let il = lists_with(&[]);
        dm.set_kind(DirectMapKind::Array, &il, 0).unwrap();

        let mut adder = DirectMapAdd::new(&mut dm, 3, 0, None).unwrap();
        adder.add(0, 1, 0);
        adder.add(1, -1, 0);
        adder.add(2, 1, 1);

        assert_eq!(dm.get(0).unwrap(), lo_build(1, 0));
        assert!(dm.get(1).is_err());
        assert_eq!(dm.get(2).unwrap(), lo_build(1, 1));
    }

    #[test]
    fn test_direct_map_add_hashtable_with_ids() {
        let mut dm = DirectMap::default();
        let il = lists_with(&[]);
        dm.set_kind(DirectMapKind::Hashtable, &il, 0).unwrap();

        let xids = [100, 200];
        let mut adder = DirectMapAdd::new(&mut dm, 2, 0, Some(&xids)).unwrap();
        adder.add(0, 0, 0);
        adder.add(1, 3, 5);

        assert_eq!(dm.get(100).unwrap(), lo_build(0, 0));
        assert_eq!(dm.get(200).unwrap(), lo_build(3, 5));
    }
}
