/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The file-backed store: a ring of memory-mapped page files under `gcache.dir`.
//!
//! A page is a sequence of `[header][payload]` records. New pages are created lazily
//! when the current one cannot fit an allocation; the oldest page is deleted once every
//! record in it has been discarded and its highest seqno is below the seqno lock. On
//! recovery, surviving page files are reopened and walked front to back to rebuild the
//! seqno index.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::MmapMut;

use crate::types::basic::Seqno;

use super::header::{BufferFlags, BufferHeader, StoreId, BUFFER_HEADER_LEN};
use super::index::{BufferId, SeqnoIndex};
use super::CacheError;

fn page_file_name(base: &str, ordinal: u64) -> String {
    format!("{}.{:06}", base, ordinal)
}

struct Page {
    ordinal: u64,
    path: PathBuf,
    mmap: MmapMut,
    /// Next write offset.
    used: usize,
    /// Records not yet discarded.
    live: usize,
    /// Highest seqno ever assigned to a record in this page.
    max_seqno: Seqno,
}

impl Page {
    fn create(dir: &Path, base: &str, ordinal: u64, size: usize) -> Result<Page, CacheError> {
        let path = dir.join(page_file_name(base, ordinal));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(CacheError::io)?;
        file.set_len(size as u64).map_err(CacheError::io)?;
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(CacheError::io)?;
        log::debug!("gcache: created page {}", path.display());
        Ok(Page {
            ordinal,
            path,
            mmap,
            used: 0,
            live: 0,
            max_seqno: Seqno::NONE,
        })
    }

    fn open(path: PathBuf, ordinal: u64) -> Result<Page, CacheError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(CacheError::io)?;
        let len = file.metadata().map_err(CacheError::io)?.len() as usize;
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(CacheError::io)?;
        Ok(Page {
            ordinal,
            path,
            mmap,
            used: len,
            live: 0,
            max_seqno: Seqno::NONE,
        })
    }

    fn capacity(&self) -> usize {
        self.mmap.len()
    }

    fn fits(&self, record: usize) -> bool {
        self.used + record <= self.capacity()
    }

    fn header_at(&self, offset: usize) -> Option<BufferHeader> {
        BufferHeader::decode(&self.mmap[offset..])
    }

    fn write_header(&mut self, offset: usize, header: &BufferHeader) {
        self.mmap[offset..offset + BUFFER_HEADER_LEN].copy_from_slice(&header.encode());
    }
}

pub(crate) struct PageStore {
    dir: PathBuf,
    base_name: String,
    page_size: usize,
    pages: VecDeque<Page>,
    next_ordinal: u64,
    /// BufferId → (page ordinal, record offset).
    locations: HashMap<BufferId, (u64, usize)>,
    total_size: usize,
    index: Arc<SeqnoIndex>,
}

impl PageStore {
    pub(crate) fn new(
        dir: PathBuf,
        base_name: String,
        page_size: usize,
        index: Arc<SeqnoIndex>,
    ) -> Result<PageStore, CacheError> {
        fs::create_dir_all(&dir).map_err(CacheError::io)?;
        Ok(PageStore {
            dir,
            base_name,
            page_size,
            pages: VecDeque::new(),
            next_ordinal: 0,
            locations: HashMap::new(),
            total_size: 0,
            index,
        })
    }

    /// Reopen surviving page files and rebuild record locations and the seqno index.
    /// `next_id` allocates fresh buffer ids for recovered records.
    pub(crate) fn recover(
        dir: PathBuf,
        base_name: String,
        page_size: usize,
        index: Arc<SeqnoIndex>,
        next_id: &mut u64,
    ) -> Result<(PageStore, Vec<BufferId>), CacheError> {
        let mut store = PageStore::new(dir, base_name, page_size, index)?;
        let mut ordinals: Vec<u64> = Vec::new();
        let prefix = format!("{}.", store.base_name);
        for entry in fs::read_dir(&store.dir).map_err(CacheError::io)? {
            let entry = entry.map_err(CacheError::io)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(ordinal) = name.strip_prefix(&prefix) {
                if let Ok(ordinal) = ordinal.parse::<u64>() {
                    ordinals.push(ordinal);
                }
            }
        }
        ordinals.sort();

        let mut recovered = Vec::new();
        for ordinal in &ordinals {
            let path = store.dir.join(page_file_name(&store.base_name, *ordinal));
            let mut page = Page::open(path, *ordinal)?;
            let mut offset = 0;
            let capacity = page.capacity();
            while offset + BUFFER_HEADER_LEN <= capacity {
                let header = match page.header_at(offset) {
                    Some(header) => header,
                    None => break,
                };
                let record = BUFFER_HEADER_LEN + header.size as usize;
                if offset + record > capacity {
                    log::warn!(
                        "gcache: truncated record in page {} at offset {}",
                        page.ordinal,
                        offset
                    );
                    break;
                }
                if !header.seqno.is_none() {
                    let id = BufferId(*next_id);
                    *next_id += 1;
                    store.locations.insert(id, (*ordinal, offset));
                    store.index.insert(header.seqno, id);
                    page.live += 1;
                    page.max_seqno = page.max_seqno.max(header.seqno);
                    recovered.push(id);
                }
                offset += record;
            }
            page.used = offset;
            store.total_size += page.capacity();
            store.next_ordinal = store.next_ordinal.max(*ordinal + 1);
            store.pages.push_back(page);
        }
        log::info!(
            "gcache: recovered {} buffers from {} pages",
            recovered.len(),
            ordinals.len()
        );
        Ok((store, recovered))
    }

    pub(crate) fn total_size(&self) -> usize {
        self.total_size
    }

    pub(crate) fn contains(&self, id: BufferId) -> bool {
        self.locations.contains_key(&id)
    }

    fn page_mut(&mut self, ordinal: u64) -> Option<&mut Page> {
        self.pages.iter_mut().find(|page| page.ordinal == ordinal)
    }

    fn page(&self, ordinal: u64) -> Option<&Page> {
        self.pages.iter().find(|page| page.ordinal == ordinal)
    }

    pub(crate) fn alloc(&mut self, id: BufferId, size: usize) -> Result<(), CacheError> {
        let record = BUFFER_HEADER_LEN + size;
        let need_new_page = match self.pages.back() {
            Some(page) => !page.fits(record),
            None => true,
        };
        if need_new_page {
            let page_size = self.page_size.max(record);
            let page = Page::create(&self.dir, &self.base_name, self.next_ordinal, page_size)?;
            self.next_ordinal += 1;
            self.total_size += page.capacity();
            self.pages.push_back(page);
        }
        let page = self.pages.back_mut().expect("page just ensured");
        let offset = page.used;
        let header = BufferHeader::new(size as u32, StoreId::Page);
        page.write_header(offset, &header);
        page.used += record;
        page.live += 1;
        self.locations.insert(id, (page.ordinal, offset));
        Ok(())
    }

    pub(crate) fn header(&self, id: BufferId) -> Option<BufferHeader> {
        let (ordinal, offset) = self.locations.get(&id)?;
        self.page(*ordinal)?.header_at(*offset)
    }

    fn update_header(
        &mut self,
        id: BufferId,
        update: impl FnOnce(&mut BufferHeader),
    ) -> Result<BufferHeader, CacheError> {
        let (ordinal, offset) = *self.locations.get(&id).ok_or(CacheError::NotFound)?;
        let page = self.page_mut(ordinal).ok_or(CacheError::NotFound)?;
        let mut header = page.header_at(offset).ok_or(CacheError::NotFound)?;
        update(&mut header);
        page.write_header(offset, &header);
        Ok(header)
    }

    pub(crate) fn fill(&mut self, id: BufferId, data: &[u8]) -> Result<(), CacheError> {
        let (ordinal, offset) = *self.locations.get(&id).ok_or(CacheError::NotFound)?;
        let page = self.page_mut(ordinal).ok_or(CacheError::NotFound)?;
        let header = page.header_at(offset).ok_or(CacheError::NotFound)?;
        if data.len() > header.size as usize {
            return Err(CacheError::SizeExceeded);
        }
        let start = offset + BUFFER_HEADER_LEN;
        page.mmap[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn read(&self, id: BufferId) -> Option<Vec<u8>> {
        let (ordinal, offset) = self.locations.get(&id)?;
        let page = self.page(*ordinal)?;
        let header = page.header_at(*offset)?;
        let start = offset + BUFFER_HEADER_LEN;
        Some(page.mmap[start..start + header.size as usize].to_vec())
    }

    pub(crate) fn seqno_assign(&mut self, id: BufferId, seqno: Seqno) -> Result<(), CacheError> {
        let (ordinal, _) = *self.locations.get(&id).ok_or(CacheError::NotFound)?;
        self.update_header(id, |header| header.seqno = seqno)?;
        let page = self.page_mut(ordinal).expect("page present");
        page.max_seqno = page.max_seqno.max(seqno);
        self.index.insert(seqno, id);
        Ok(())
    }

    pub(crate) fn set_flags(&mut self, id: BufferId, flags: BufferFlags) -> Result<(), CacheError> {
        self.update_header(id, |header| header.flags.set(flags))?;
        Ok(())
    }

    pub(crate) fn free(&mut self, id: BufferId) -> Result<(), CacheError> {
        let header = self.update_header(id, |header| header.flags.set(BufferFlags::RELEASED))?;
        if header.seqno.is_none() {
            return self.discard(id, Seqno::MAX);
        }
        Ok(())
    }

    pub(crate) fn repossess(&mut self, id: BufferId) -> Result<(), CacheError> {
        let header = self.update_header(id, |header| header.flags.clear(BufferFlags::RELEASED))?;
        assert!(!header.seqno.is_none(), "repossess of an unassigned buffer");
        Ok(())
    }

    pub(crate) fn discard(&mut self, id: BufferId, seqno_locked: Seqno) -> Result<(), CacheError> {
        let (ordinal, offset) = *self.locations.get(&id).ok_or(CacheError::NotFound)?;
        let page = self.page_mut(ordinal).ok_or(CacheError::NotFound)?;
        let header = page.header_at(offset).ok_or(CacheError::NotFound)?;
        if !header.seqno.is_none() && header.seqno >= seqno_locked {
            return Err(CacheError::SeqnoLocked);
        }
        // Tombstone, not erasure: the record keeps its size so a recovery scan can walk
        // past it, but its seqno is gone so it is never re-indexed.
        let mut tombstone = header;
        tombstone.seqno = Seqno::NONE;
        tombstone.flags.set(BufferFlags::RELEASED);
        page.write_header(offset, &tombstone);
        page.live -= 1;
        self.locations.remove(&id);
        if !header.seqno.is_none() {
            self.index.remove(header.seqno);
        }
        Ok(())
    }

    /// Delete leading pages whose records are all discarded and whose seqnos have
    /// passed out of the lock window.
    pub(crate) fn sweep(&mut self, seqno_locked: Seqno) {
        while let Some(page) = self.pages.front() {
            let reclaimable = page.live == 0
                && (page.max_seqno.is_none() || page.max_seqno < seqno_locked)
                && self.pages.len() > 0;
            // Never reclaim the page still being filled.
            let is_current = self.pages.len() == 1;
            if !reclaimable || is_current {
                return;
            }
            let page = self.pages.pop_front().expect("front page present");
            self.total_size -= page.capacity();
            let path = page.path.clone();
            drop(page);
            if let Err(err) = fs::remove_file(&path) {
                log::warn!("gcache: cannot remove page {}: {}", path.display(), err);
            } else {
                log::debug!("gcache: removed page {}", path.display());
            }
        }
    }

    /// Remove every page file. Clean shutdown leaves no ring behind.
    pub(crate) fn purge_files(&mut self) {
        while let Some(page) = self.pages.pop_front() {
            self.total_size -= page.capacity();
            let path = page.path.clone();
            drop(page);
            let _ = fs::remove_file(&path);
        }
        self.locations.clear();
    }
}
