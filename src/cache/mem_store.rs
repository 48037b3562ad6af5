/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The RAM store: buffers held on the heap, bounded by `mem_max` bytes of payload.

use std::collections::HashMap;
use std::sync::Arc;

use crate::types::basic::Seqno;

use super::header::{BufferFlags, BufferHeader, StoreId};
use super::index::{BufferId, SeqnoIndex};
use super::CacheError;

pub(crate) struct MemBuffer {
    pub(crate) header: BufferHeader,
    pub(crate) data: Vec<u8>,
}

pub(crate) struct MemStore {
    max_size: usize,
    size: usize,
    allocd: HashMap<BufferId, MemBuffer>,
    index: Arc<SeqnoIndex>,
}

impl MemStore {
    pub(crate) fn new(max_size: usize, index: Arc<SeqnoIndex>) -> MemStore {
        MemStore {
            max_size,
            size: 0,
            allocd: HashMap::new(),
            index,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    fn have_free_space(&self, size: usize) -> bool {
        self.size + size <= self.max_size
    }

    pub(crate) fn malloc(&mut self, id: BufferId, size: usize) -> Result<(), CacheError> {
        if size > self.max_size || !self.have_free_space(size) {
            return Err(CacheError::NoSpace);
        }
        self.allocd.insert(
            id,
            MemBuffer {
                header: BufferHeader::new(size as u32, StoreId::Mem),
                data: vec![0u8; size],
            },
        );
        self.size += size;
        Ok(())
    }

    /// Grow or shrink an unassigned buffer. On failure the original allocation is left
    /// registered and untouched; the caller keeps using it.
    pub(crate) fn realloc(&mut self, id: BufferId, new_size: usize) -> Result<(), CacheError> {
        let buffer = self.allocd.get_mut(&id).ok_or(CacheError::NotFound)?;
        assert!(
            buffer.header.seqno.is_none(),
            "realloc of a seqno-assigned buffer"
        );
        let old_size = buffer.data.len();
        if new_size > old_size {
            let growth = new_size - old_size;
            if new_size > self.max_size || self.size + growth > self.max_size {
                return Err(CacheError::NoSpace);
            }
        }
        buffer.data.resize(new_size, 0);
        buffer.header.size = new_size as u32;
        self.size = self.size - old_size + new_size;
        Ok(())
    }

    pub(crate) fn contains(&self, id: BufferId) -> bool {
        self.allocd.contains_key(&id)
    }

    pub(crate) fn header(&self, id: BufferId) -> Option<BufferHeader> {
        self.allocd.get(&id).map(|buffer| buffer.header)
    }

    pub(crate) fn fill(&mut self, id: BufferId, data: &[u8]) -> Result<(), CacheError> {
        let buffer = self.allocd.get_mut(&id).ok_or(CacheError::NotFound)?;
        if data.len() > buffer.data.len() {
            return Err(CacheError::SizeExceeded);
        }
        buffer.data[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn read(&self, id: BufferId) -> Option<Vec<u8>> {
        self.allocd.get(&id).map(|buffer| buffer.data.clone())
    }

    pub(crate) fn seqno_assign(&mut self, id: BufferId, seqno: Seqno) -> Result<(), CacheError> {
        let buffer = self.allocd.get_mut(&id).ok_or(CacheError::NotFound)?;
        buffer.header.seqno = seqno;
        self.index.insert(seqno, id);
        Ok(())
    }

    pub(crate) fn set_flags(&mut self, id: BufferId, flags: BufferFlags) -> Result<(), CacheError> {
        let buffer = self.allocd.get_mut(&id).ok_or(CacheError::NotFound)?;
        buffer.header.flags.set(flags);
        Ok(())
    }

    /// Mark released. A buffer that never got a seqno is reclaimed immediately.
    pub(crate) fn free(&mut self, id: BufferId) -> Result<(), CacheError> {
        let buffer = self.allocd.get_mut(&id).ok_or(CacheError::NotFound)?;
        if buffer.header.seqno.is_none() {
            return self.discard(id, Seqno::MAX);
        }
        buffer.header.flags.set(BufferFlags::RELEASED);
        Ok(())
    }

    /// Re-claim a released buffer that is still inside the seqno window. The payload is
    /// untouched by release, so repossession is bitwise exact.
    pub(crate) fn repossess(&mut self, id: BufferId) -> Result<(), CacheError> {
        let buffer = self.allocd.get_mut(&id).ok_or(CacheError::NotFound)?;
        assert!(!buffer.header.seqno.is_none(), "repossess of an unassigned buffer");
        buffer.header.flags.clear(BufferFlags::RELEASED);
        Ok(())
    }

    /// Physically reclaim. Refused for buffers at or above the seqno lock.
    pub(crate) fn discard(&mut self, id: BufferId, seqno_locked: Seqno) -> Result<(), CacheError> {
        let seqno = match self.allocd.get(&id) {
            Some(buffer) => buffer.header.seqno,
            None => return Err(CacheError::NotFound),
        };
        if !seqno.is_none() && seqno >= seqno_locked {
            return Err(CacheError::SeqnoLocked);
        }
        let buffer = self.allocd.remove(&id).expect("buffer present");
        self.size -= buffer.data.len();
        if !seqno.is_none() {
            self.index.remove(seqno);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max: usize) -> MemStore {
        MemStore::new(max, SeqnoIndex::new())
    }

    #[test]
    fn malloc_respects_mem_max() {
        let mut mem = store(100);
        mem.malloc(BufferId(1), 60).unwrap();
        assert!(matches!(
            mem.malloc(BufferId(2), 60),
            Err(CacheError::NoSpace)
        ));
        mem.malloc(BufferId(3), 40).unwrap();
        assert_eq!(mem.size(), 100);
    }

    #[test]
    fn realloc_failure_leaves_original_registered_and_intact() {
        let mut mem = store(100);
        mem.malloc(BufferId(1), 50).unwrap();
        mem.fill(BufferId(1), b"payload").unwrap();

        assert!(matches!(
            mem.realloc(BufferId(1), 200),
            Err(CacheError::NoSpace)
        ));
        assert!(mem.contains(BufferId(1)));
        assert_eq!(&mem.read(BufferId(1)).unwrap()[..7], b"payload");
        assert_eq!(mem.size(), 50);

        mem.realloc(BufferId(1), 80).unwrap();
        assert_eq!(&mem.read(BufferId(1)).unwrap()[..7], b"payload");
        assert_eq!(mem.size(), 80);
    }

    #[test]
    fn free_of_unassigned_buffer_discards_immediately() {
        let mut mem = store(100);
        mem.malloc(BufferId(1), 30).unwrap();
        mem.free(BufferId(1)).unwrap();
        assert!(!mem.contains(BufferId(1)));
        assert_eq!(mem.size(), 0);
    }

    #[test]
    fn discard_respects_seqno_lock() {
        let mut mem = store(100);
        mem.malloc(BufferId(1), 10).unwrap();
        mem.seqno_assign(BufferId(1), Seqno::new(5)).unwrap();
        mem.free(BufferId(1)).unwrap();

        assert!(matches!(
            mem.discard(BufferId(1), Seqno::new(3)),
            Err(CacheError::SeqnoLocked)
        ));
        assert!(mem.contains(BufferId(1)));
        mem.discard(BufferId(1), Seqno::new(6)).unwrap();
        assert!(!mem.contains(BufferId(1)));
    }

    #[test]
    fn repossess_restores_contents_bitwise() {
        let mut mem = store(100);
        mem.malloc(BufferId(1), 20).unwrap();
        mem.fill(BufferId(1), b"unchanged-contents").unwrap();
        mem.seqno_assign(BufferId(1), Seqno::new(1)).unwrap();
        let before = mem.read(BufferId(1)).unwrap();

        mem.free(BufferId(1)).unwrap();
        assert!(mem.header(BufferId(1)).unwrap().is_released());
        mem.repossess(BufferId(1)).unwrap();
        assert!(!mem.header(BufferId(1)).unwrap().is_released());
        assert_eq!(mem.read(BufferId(1)).unwrap(), before);
    }
}
