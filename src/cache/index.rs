/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The shared seqno→buffer index.
//!
//! One instance is handed to every store at construction. Its lock is held only across
//! index mutations, never across allocator calls. In steady state the index is
//! contiguous over `[first, last]`; during recovery at most one gap segment may exist,
//! which [`SeqnoIndex::gap`] reports.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::basic::Seqno;

/// Opaque handle to a cached buffer, resolved through the owning-store registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

pub struct SeqnoIndex {
    map: Mutex<BTreeMap<Seqno, BufferId>>,
}

impl SeqnoIndex {
    pub fn new() -> Arc<SeqnoIndex> {
        Arc::new(SeqnoIndex {
            map: Mutex::new(BTreeMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Seqno, BufferId>> {
        self.map.lock().expect("seqno index lock poisoned")
    }

    pub fn insert(&self, seqno: Seqno, id: BufferId) {
        assert!(!seqno.is_none(), "cannot index an unassigned buffer");
        let previous = self.lock().insert(seqno, id);
        assert!(
            previous.is_none(),
            "seqno {} indexed twice: the total order regressed",
            seqno
        );
    }

    pub fn remove(&self, seqno: Seqno) -> Option<BufferId> {
        self.lock().remove(&seqno)
    }

    pub fn get(&self, seqno: Seqno) -> Option<BufferId> {
        self.lock().get(&seqno).copied()
    }

    /// Lowest indexed seqno.
    pub fn first(&self) -> Option<Seqno> {
        self.lock().keys().next().copied()
    }

    /// Highest indexed seqno.
    pub fn last(&self) -> Option<Seqno> {
        self.lock().keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Buffers in `[from, to]`, in seqno order.
    pub fn range(&self, from: Seqno, to: Seqno) -> Vec<(Seqno, BufferId)> {
        self.lock()
            .range(from..=to)
            .map(|(seqno, id)| (*seqno, *id))
            .collect()
    }

    /// The single missing segment `[lo, hi]` if the index is not contiguous, `None` if
    /// it is. More than one gap means the cache is corrupt; recovery treats that as
    /// fatal.
    pub fn gap(&self) -> Result<Option<(Seqno, Seqno)>, ()> {
        let map = self.lock();
        let mut gap: Option<(Seqno, Seqno)> = None;
        let mut previous: Option<Seqno> = None;
        for seqno in map.keys() {
            if let Some(previous) = previous {
                if *seqno - previous > 1 {
                    if gap.is_some() {
                        return Err(());
                    }
                    gap = Some((previous.next(), *seqno - 1));
                }
            }
            previous = Some(*seqno);
        }
        Ok(gap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_and_lookup() {
        let index = SeqnoIndex::new();
        for int in 5..10 {
            index.insert(Seqno::new(int), BufferId(int as u64));
        }
        assert_eq!(index.first(), Some(Seqno::new(5)));
        assert_eq!(index.last(), Some(Seqno::new(9)));
        assert_eq!(index.get(Seqno::new(7)), Some(BufferId(7)));
        assert_eq!(index.get(Seqno::new(11)), None);
        assert_eq!(index.gap(), Ok(None));
    }

    #[test]
    fn single_gap_is_reported() {
        let index = SeqnoIndex::new();
        index.insert(Seqno::new(1), BufferId(1));
        index.insert(Seqno::new(2), BufferId(2));
        index.insert(Seqno::new(6), BufferId(6));
        assert_eq!(index.gap(), Ok(Some((Seqno::new(3), Seqno::new(5)))));
    }

    #[test]
    fn two_gaps_are_an_error() {
        let index = SeqnoIndex::new();
        index.insert(Seqno::new(1), BufferId(1));
        index.insert(Seqno::new(3), BufferId(3));
        index.insert(Seqno::new(5), BufferId(5));
        assert_eq!(index.gap(), Err(()));
    }

    #[test]
    #[should_panic(expected = "indexed twice")]
    fn double_insert_panics() {
        let index = SeqnoIndex::new();
        index.insert(Seqno::new(1), BufferId(1));
        index.insert(Seqno::new(1), BufferId(2));
    }
}
