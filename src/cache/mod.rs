/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The write-set cache ("gcache"): an append-only, seqno-indexed store of replicated
//! write-sets, backing incremental state transfer and recovery.
//!
//! Two storage backends sit behind one facade: a RAM store bounded by `gcache.mem_max`
//! and a ring of memory-mapped page files bounded by `gcache.size`. Allocation tries
//! RAM first and overflows to pages. Buffers are indexed by global seqno once assigned;
//! `free` marks a buffer reclaimable without destroying it (so `repossess` can take it
//! back bitwise-intact), while `discard` reclaims it for real. A seqno lock pins the
//! window `[lock, ∞)` against discard while state transfer reads from it.
//!
//! The cache exclusively owns buffer bytes. Certification borrows by seqno and keys;
//! appliers and state transfer read through [`WriteSetCache::read`].

pub mod header;

pub mod index;

mod mem_store;

mod page_store;

use std::fmt::{self, Display, Formatter};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::basic::Seqno;

use self::header::{BufferFlags, BufferHeader, StoreId};
use self::index::{BufferId, SeqnoIndex};
use self::mem_store::MemStore;
use self::page_store::PageStore;

#[derive(Debug)]
pub enum CacheError {
    /// The allocation cannot fit the store right now.
    NoSpace,
    /// The request exceeds a configured size bound.
    SizeExceeded,
    /// The buffer is protected by the seqno lock.
    SeqnoLocked,
    NotFound,
    /// Cache persistence failed; the node cannot trust its state.
    Io(io::Error),
    /// The rebuilt index has more than one gap: the ring is corrupt.
    Corrupt,
}

impl CacheError {
    fn io(err: io::Error) -> CacheError {
        CacheError::Io(err)
    }
}

impl Display for CacheError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::NoSpace => write!(f, "no space in cache"),
            CacheError::SizeExceeded => write!(f, "allocation exceeds configured bound"),
            CacheError::SeqnoLocked => write!(f, "buffer is inside the locked seqno window"),
            CacheError::NotFound => write!(f, "no such buffer"),
            CacheError::Io(err) => write!(f, "cache i/o failure: {}", err),
            CacheError::Corrupt => write!(f, "cache ring is corrupt"),
        }
    }
}

/// Sizing and placement of the cache.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Directory holding the page ring (`gcache.dir`).
    pub dir: PathBuf,
    /// Base name of page files (`gcache.name`).
    pub name: String,
    /// RAM store bound in bytes.
    pub mem_max: usize,
    /// Size of one page file (`gcache.page_size`).
    pub page_size: usize,
    /// Total bound across both stores (`gcache.size`).
    pub total_size: usize,
    /// Reopen surviving page files and rebuild the index instead of starting clean.
    pub recover: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            dir: PathBuf::from("."),
            name: "tandem.cache".to_string(),
            mem_max: 16 * 1024 * 1024,
            page_size: 16 * 1024 * 1024,
            total_size: 256 * 1024 * 1024,
            recover: false,
        }
    }
}

struct CacheInner {
    mem: MemStore,
    page: PageStore,
    next_id: u64,
    seqno_locked: Seqno,
    total_size: usize,
}

impl CacheInner {
    fn store_of(&self, id: BufferId) -> Option<StoreId> {
        if self.mem.contains(id) {
            Some(StoreId::Mem)
        } else if self.page.contains(id) {
            Some(StoreId::Page)
        } else {
            None
        }
    }
}

/// The write-set cache. All methods are safe to call from any thread.
pub struct WriteSetCache {
    inner: Mutex<CacheInner>,
    index: Arc<SeqnoIndex>,
}

impl WriteSetCache {
    pub fn open(config: CacheConfig) -> Result<WriteSetCache, CacheError> {
        let index = SeqnoIndex::new();
        let mut next_id = 1u64;
        let page = if config.recover {
            let (page, _recovered) = PageStore::recover(
                config.dir.clone(),
                config.name.clone(),
                config.page_size,
                Arc::clone(&index),
                &mut next_id,
            )?;
            if index.gap().is_err() {
                return Err(CacheError::Corrupt);
            }
            page
        } else {
            PageStore::new(
                config.dir.clone(),
                config.name.clone(),
                config.page_size,
                Arc::clone(&index),
            )?
        };
        Ok(WriteSetCache {
            inner: Mutex::new(CacheInner {
                mem: MemStore::new(config.mem_max, Arc::clone(&index)),
                page,
                next_id,
                seqno_locked: Seqno::MAX,
                total_size: config.total_size,
            }),
            index,
        })
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().expect("cache lock poisoned")
    }

    pub fn index(&self) -> &Arc<SeqnoIndex> {
        &self.index
    }

    /// Allocate a buffer for `size` payload bytes: RAM first, page overflow second.
    /// Ring pressure discards released buffers below the seqno lock to make room.
    pub fn alloc(&self, size: usize) -> Result<BufferId, CacheError> {
        let mut inner = self.lock();
        let id = BufferId(inner.next_id);
        inner.next_id += 1;

        if inner.mem.malloc(id, size).is_ok() {
            return Ok(id);
        }
        if inner.mem.size() + inner.page.total_size() + size > inner.total_size {
            self.make_space(&mut inner, size)?;
        }
        inner.page.alloc(id, size)?;
        Ok(id)
    }

    /// Discard old released buffers (below the lock) until `size` more bytes fit under
    /// the total bound.
    fn make_space(&self, inner: &mut CacheInner, size: usize) -> Result<(), CacheError> {
        let locked = inner.seqno_locked;
        loop {
            if inner.mem.size() + inner.page.total_size() + size <= inner.total_size {
                return Ok(());
            }
            let oldest = match self.index.first() {
                Some(seqno) if seqno < locked => seqno,
                _ => return Err(CacheError::NoSpace),
            };
            let id = self.index.get(oldest).expect("first seqno is indexed");
            let released = match inner.store_of(id) {
                Some(StoreId::Mem) => inner
                    .mem
                    .header(id)
                    .map(|header| header.is_released())
                    .unwrap_or(false),
                Some(StoreId::Page) => inner
                    .page
                    .header(id)
                    .map(|header| header.is_released())
                    .unwrap_or(false),
                None => return Err(CacheError::NoSpace),
            };
            if !released {
                // The window's tail is still in use; the ring cannot advance.
                return Err(CacheError::NoSpace);
            }
            self.discard_locked(inner, id)?;
            inner.page.sweep(locked);
        }
    }

    /// Copy `data` into a fresh buffer. The common path for storing a write-set.
    pub fn insert(&self, data: &[u8]) -> Result<BufferId, CacheError> {
        let id = self.alloc(data.len())?;
        self.fill(id, data)?;
        Ok(id)
    }

    pub fn fill(&self, id: BufferId, data: &[u8]) -> Result<(), CacheError> {
        let mut inner = self.lock();
        match inner.store_of(id) {
            Some(StoreId::Mem) => inner.mem.fill(id, data),
            Some(StoreId::Page) => inner.page.fill(id, data),
            None => Err(CacheError::NotFound),
        }
    }

    /// Grow or shrink a not-yet-assigned buffer. RAM buffers that can no longer fit in
    /// the RAM store migrate to the page store; on failure the original buffer
    /// survives untouched.
    pub fn realloc(&self, id: BufferId, new_size: usize) -> Result<(), CacheError> {
        let mut inner = self.lock();
        match inner.store_of(id) {
            Some(StoreId::Mem) => {
                if inner.mem.realloc(id, new_size).is_ok() {
                    return Ok(());
                }
                // Migrate: allocate in the page store, copy, free the original.
                let data = inner.mem.read(id).ok_or(CacheError::NotFound)?;
                inner.page.alloc(id, new_size)?;
                let copy_len = data.len().min(new_size);
                inner.page.fill(id, &data[..copy_len])?;
                inner.mem.discard(id, Seqno::MAX)?;
                Ok(())
            }
            Some(StoreId::Page) => Err(CacheError::SizeExceeded),
            None => Err(CacheError::NotFound),
        }
    }

    /// Stamp the buffer with its global seqno and index it.
    pub fn seqno_assign(&self, id: BufferId, seqno: Seqno) -> Result<(), CacheError> {
        let mut inner = self.lock();
        match inner.store_of(id) {
            Some(StoreId::Mem) => inner.mem.seqno_assign(id, seqno),
            Some(StoreId::Page) => inner.page.seqno_assign(id, seqno),
            None => Err(CacheError::NotFound),
        }
    }

    pub fn set_flags(&self, id: BufferId, flags: BufferFlags) -> Result<(), CacheError> {
        let mut inner = self.lock();
        match inner.store_of(id) {
            Some(StoreId::Mem) => inner.mem.set_flags(id, flags),
            Some(StoreId::Page) => inner.page.set_flags(id, flags),
            None => Err(CacheError::NotFound),
        }
    }

    pub fn header(&self, id: BufferId) -> Option<BufferHeader> {
        let inner = self.lock();
        match inner.store_of(id)? {
            StoreId::Mem => inner.mem.header(id),
            StoreId::Page => inner.page.header(id),
        }
    }

    /// Mark released: reclaimable, but addressable until ring pressure takes it.
    pub fn free(&self, id: BufferId) -> Result<(), CacheError> {
        let mut inner = self.lock();
        match inner.store_of(id) {
            Some(StoreId::Mem) => inner.mem.free(id),
            Some(StoreId::Page) => inner.page.free(id),
            None => Err(CacheError::NotFound),
        }
    }

    /// Physically reclaim a buffer. Respects the seqno lock.
    pub fn discard(&self, id: BufferId) -> Result<(), CacheError> {
        let mut inner = self.lock();
        self.discard_locked(&mut inner, id)?;
        let locked = inner.seqno_locked;
        inner.page.sweep(locked);
        Ok(())
    }

    fn discard_locked(&self, inner: &mut CacheInner, id: BufferId) -> Result<(), CacheError> {
        let locked = inner.seqno_locked;
        match inner.store_of(id) {
            Some(StoreId::Mem) => inner.mem.discard(id, locked),
            Some(StoreId::Page) => inner.page.discard(id, locked),
            None => Err(CacheError::NotFound),
        }
    }

    /// Take back a released buffer that is still indexed. Contents are bitwise
    /// unchanged from before the release.
    pub fn repossess(&self, seqno: Seqno) -> Result<BufferId, CacheError> {
        let id = self.index.get(seqno).ok_or(CacheError::NotFound)?;
        let mut inner = self.lock();
        match inner.store_of(id) {
            Some(StoreId::Mem) => inner.mem.repossess(id)?,
            Some(StoreId::Page) => inner.page.repossess(id)?,
            None => return Err(CacheError::NotFound),
        }
        Ok(id)
    }

    /// Read a buffer's payload by seqno.
    pub fn read(&self, seqno: Seqno) -> Option<Vec<u8>> {
        let id = self.index.get(seqno)?;
        self.read_buffer(id)
    }

    pub fn read_buffer(&self, id: BufferId) -> Option<Vec<u8>> {
        let inner = self.lock();
        match inner.store_of(id)? {
            StoreId::Mem => inner.mem.read(id),
            StoreId::Page => inner.page.read(id),
        }
    }

    /// Forbid discarding of buffers with seqno ≥ `seqno` while state transfer reads
    /// them.
    pub fn seqno_lock(&self, seqno: Seqno) {
        self.lock().seqno_locked = seqno;
    }

    pub fn seqno_unlock(&self) {
        let mut inner = self.lock();
        inner.seqno_locked = Seqno::MAX;
        let locked = inner.seqno_locked;
        inner.page.sweep(locked);
    }

    pub fn seqno_locked(&self) -> Seqno {
        self.lock().seqno_locked
    }

    pub fn first_seqno(&self) -> Option<Seqno> {
        self.index.first()
    }

    pub fn last_seqno(&self) -> Option<Seqno> {
        self.index.last()
    }

    /// Bytes currently held, RAM + pages.
    pub fn size(&self) -> usize {
        let inner = self.lock();
        inner.mem.size() + inner.page.total_size()
    }

    /// Clean shutdown: the page ring is deleted; nothing survives but what state
    /// transfer already copied out.
    pub fn close(&self) {
        self.lock().page.purge_files();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_cache(dir: &TempDir, mem_max: usize, page_size: usize) -> WriteSetCache {
        WriteSetCache::open(CacheConfig {
            dir: dir.path().to_path_buf(),
            name: "test.cache".to_string(),
            mem_max,
            page_size,
            total_size: 1024 * 1024,
            recover: false,
        })
        .unwrap()
    }

    #[test]
    fn alloc_overflows_to_page_store_when_ram_is_full() {
        let dir = TempDir::new().unwrap();
        let cache = small_cache(&dir, 64, 256);

        let in_ram = cache.insert(&[1u8; 48]).unwrap();
        assert_eq!(cache.header(in_ram).unwrap().store, StoreId::Mem);

        let overflow = cache.insert(&[2u8; 48]).unwrap();
        assert_eq!(cache.header(overflow).unwrap().store, StoreId::Page);
    }

    #[test]
    fn index_stays_contiguous_above_the_lock() {
        let dir = TempDir::new().unwrap();
        let cache = small_cache(&dir, 1024, 1024);

        let ids: Vec<BufferId> = (0..10)
            .map(|int| {
                let id = cache.insert(&[int as u8; 16]).unwrap();
                cache.seqno_assign(id, Seqno::new(int)).unwrap();
                cache.free(id).unwrap();
                id
            })
            .collect();

        cache.seqno_lock(Seqno::new(4));
        for id in &ids {
            let _ = cache.discard(*id);
        }
        // Everything from the lock upward survived.
        for int in 4..10 {
            assert!(cache.read(Seqno::new(int)).is_some(), "seqno {} present", int);
        }
        for int in 0..4 {
            assert!(cache.read(Seqno::new(int)).is_none(), "seqno {} discarded", int);
        }
        assert_eq!(cache.first_seqno(), Some(Seqno::new(4)));
        assert_eq!(cache.last_seqno(), Some(Seqno::new(9)));
        assert_eq!(cache.index().gap(), Ok(None));
    }

    #[test]
    fn repossess_after_free_is_bitwise_exact() {
        let dir = TempDir::new().unwrap();
        let cache = small_cache(&dir, 1024, 1024);

        let id = cache.insert(b"certified write-set payload").unwrap();
        cache.seqno_assign(id, Seqno::new(1)).unwrap();
        let before = cache.read(Seqno::new(1)).unwrap();

        cache.free(id).unwrap();
        let again = cache.repossess(Seqno::new(1)).unwrap();
        assert_eq!(again, id);
        assert!(!cache.header(id).unwrap().is_released());
        assert_eq!(cache.read(Seqno::new(1)).unwrap(), before);
    }

    #[test]
    fn page_files_are_removed_once_the_lock_passes_them() {
        let dir = TempDir::new().unwrap();
        // Tiny RAM store: everything goes to pages; page fits two records.
        let cache = small_cache(&dir, 8, 128);

        for int in 0..12 {
            let id = cache.insert(&[int as u8; 32]).unwrap();
            cache.seqno_assign(id, Seqno::new(int)).unwrap();
            cache.free(id).unwrap();
        }
        let files_before = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(files_before > 1, "multiple pages created");

        cache.seqno_lock(Seqno::new(10));
        for int in 0..12 {
            if let Some(id) = cache.index().get(Seqno::new(int)) {
                let _ = cache.discard(id);
            }
        }
        let files_after = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(
            files_after < files_before,
            "old pages removed ({} -> {})",
            files_before,
            files_after
        );
        assert!(cache.read(Seqno::new(10)).is_some());
        assert!(cache.read(Seqno::new(11)).is_some());
    }

    #[test]
    fn recovery_rebuilds_the_index_from_page_headers() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig {
            dir: dir.path().to_path_buf(),
            name: "test.cache".to_string(),
            mem_max: 8, // force everything onto pages so it survives
            page_size: 256,
            total_size: 1024 * 1024,
            recover: false,
        };
        {
            let cache = WriteSetCache::open(config.clone()).unwrap();
            for int in 0..6 {
                let id = cache.insert(&[0x40 + int as u8; 24]).unwrap();
                cache.seqno_assign(id, Seqno::new(int)).unwrap();
            }
            // No clean close: the ring stays on disk.
        }

        let recovered = WriteSetCache::open(CacheConfig {
            recover: true,
            ..config
        })
        .unwrap();
        assert_eq!(recovered.first_seqno(), Some(Seqno::new(0)));
        assert_eq!(recovered.last_seqno(), Some(Seqno::new(5)));
        assert_eq!(recovered.read(Seqno::new(3)).unwrap(), vec![0x43; 24]);
        assert_eq!(recovered.index().gap(), Ok(None));
    }

    #[test]
    fn clean_close_removes_the_ring() {
        let dir = TempDir::new().unwrap();
        let cache = small_cache(&dir, 8, 128);
        for int in 0..4 {
            let id = cache.insert(&[int as u8; 32]).unwrap();
            cache.seqno_assign(id, Seqno::new(int)).unwrap();
        }
        cache.close();
        let remaining = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn realloc_migrates_ram_buffer_to_pages_when_it_outgrows_ram() {
        let dir = TempDir::new().unwrap();
        let cache = small_cache(&dir, 64, 256);

        let id = cache.insert(&[7u8; 32]).unwrap();
        assert_eq!(cache.header(id).unwrap().store, StoreId::Mem);

        cache.realloc(id, 128).unwrap();
        assert_eq!(cache.header(id).unwrap().store, StoreId::Page);
        assert_eq!(&cache.read_buffer(id).unwrap()[..32], &[7u8; 32]);
    }
}
