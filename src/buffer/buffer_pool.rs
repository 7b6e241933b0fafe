//! Fixed arena of page-sized chunks plus the table of resident pages.

use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::buffer::page::{MixedPage, PageId};
use crate::config::BufferPoolConfig;
use crate::error::{QuillStoreError, QuillStoreResult};

/// Index of a chunk inside the arena.
pub type ChunkToken = usize;

/// One contiguous allocation split into equally sized chunks, each guarded by
/// its own latch.
pub struct Arena {
    bytes: Box<[UnsafeCell<u8>]>,
    latches: Vec<RwLock<()>>,
    chunk_size: usize,
}

// Every access to a chunk's bytes goes through its latch.
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new(chunk_count: usize, chunk_size: usize) -> Self {
        let mut bytes: Vec<UnsafeCell<u8>> = Vec::with_capacity(chunk_count * chunk_size);
        bytes.resize_with(chunk_count * chunk_size, || UnsafeCell::new(0u8));
        let latches = (0..chunk_count).map(|_| RwLock::new(())).collect();
        Self {
            bytes: bytes.into_boxed_slice(),
            latches,
            chunk_size,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.latches.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn read_chunk<R>(&self, token: ChunkToken, f: impl FnOnce(&[u8]) -> R) -> R {
        let _latch = self.latches[token].read();
        f(unsafe { self.chunk_slice(token) })
    }

    pub fn write_chunk<R>(&self, token: ChunkToken, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let _latch = self.latches[token].write();
        f(unsafe { self.chunk_slice_mut(token) })
    }

    /// Latches `first` then `second` for write.
    ///
    /// # Panics
    /// If both tokens name the same chunk.
    pub fn write_two_chunks<R>(
        &self,
        first: ChunkToken,
        second: ChunkToken,
        f: impl FnOnce(&mut [u8], &mut [u8]) -> R,
    ) -> R {
        assert_ne!(first, second, "a chunk can't be latched twice");
        let _first = self.latches[first].write();
        let _second = self.latches[second].write();
        unsafe { f(self.chunk_slice_mut(first), self.chunk_slice_mut(second)) }
    }

    /// # Safety
    /// Caller must hold the chunk latch for read or write while the slice lives.
    unsafe fn chunk_slice(&self, token: ChunkToken) -> &[u8] {
        std::slice::from_raw_parts(self.chunk_ptr(token) as *const u8, self.chunk_size)
    }

    /// # Safety
    /// Caller must hold the chunk latch for write while the slice lives.
    #[allow(clippy::mut_from_ref)]
    unsafe fn chunk_slice_mut(&self, token: ChunkToken) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.chunk_ptr(token), self.chunk_size)
    }

    unsafe fn chunk_ptr(&self, token: ChunkToken) -> *mut u8 {
        assert!(token < self.latches.len(), "chunk {token} out of range");
        UnsafeCell::raw_get(self.bytes.as_ptr().add(token * self.chunk_size))
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("chunk_count", &self.chunk_count())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

#[derive(Debug, Default)]
struct ChunkSets {
    free: HashSet<ChunkToken>,
    taken: HashSet<ChunkToken>,
}

/// Owns the arena and tracks which page lives in which chunk.
///
/// A chunk token is always in exactly one of the free and taken sets.
#[derive(Debug)]
pub struct BufferPool {
    arena: Arc<Arena>,
    pages: DashMap<PageId, Arc<MixedPage>>,
    chunks: Mutex<ChunkSets>,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Self {
        let chunk_count = config.eviction_limit + 1;
        let arena = Arc::new(Arena::new(chunk_count, config.page_size));
        let chunks = ChunkSets {
            free: (0..chunk_count).collect(),
            taken: HashSet::with_capacity(chunk_count),
        };
        debug!(
            "buffer pool with {} chunks of {} bytes",
            chunk_count, config.page_size
        );
        Self {
            arena,
            pages: DashMap::new(),
            chunks: Mutex::new(chunks),
        }
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub fn page_size(&self) -> usize {
        self.arena.chunk_size()
    }

    /// Takes a free chunk out of the arena.
    pub fn get_memory(&self) -> QuillStoreResult<ChunkToken> {
        let mut chunks = self.chunks.lock();
        let token = chunks
            .free
            .iter()
            .next()
            .copied()
            .ok_or(QuillStoreError::BufferPoolExhausted)?;
        chunks.free.remove(&token);
        chunks.taken.insert(token);
        Ok(token)
    }

    /// Hands a taken chunk back to the free set.
    pub fn release_memory(&self, token: ChunkToken) -> QuillStoreResult<()> {
        let mut chunks = self.chunks.lock();
        if !chunks.taken.remove(&token) {
            return Err(QuillStoreError::Internal(format!(
                "chunk {token} released while not taken"
            )));
        }
        chunks.free.insert(token);
        Ok(())
    }

    pub fn has_free_chunk(&self) -> bool {
        !self.chunks.lock().free.is_empty()
    }

    pub fn free_chunk_count(&self) -> usize {
        self.chunks.lock().free.len()
    }

    pub fn taken_chunk_count(&self) -> usize {
        self.chunks.lock().taken.len()
    }

    pub fn is_free(&self, token: ChunkToken) -> bool {
        self.chunks.lock().free.contains(&token)
    }

    /// Registers a resident page and returns the page now mapped to its id.
    ///
    /// When the id is already resident the existing page stays and the chunk of
    /// the rejected one goes back to the free set.
    pub fn add_page(&self, page: Arc<MixedPage>) -> QuillStoreResult<Arc<MixedPage>> {
        match self.pages.entry(page.page_id()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                let existing = entry.get().clone();
                drop(entry);
                self.release_memory(page.token())?;
                Ok(existing)
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(page.clone());
                Ok(page)
            }
        }
    }

    pub fn get_page(&self, page_id: PageId) -> Option<Arc<MixedPage>> {
        self.pages.get(&page_id).map(|entry| entry.value().clone())
    }

    /// Drops the page mapping and frees its chunk.
    pub fn evict_page(&self, page_id: PageId, token: ChunkToken) -> QuillStoreResult<()> {
        self.pages.remove_if(&page_id, |_, page| page.token() == token);
        self.release_memory(token)
    }

    /// Unmaps the page only when the pool holds the last reference to it.
    ///
    /// The chunk stays taken; the caller releases it once the bytes are saved.
    pub fn remove_page_if_unpinned(&self, page_id: PageId) -> Option<Arc<MixedPage>> {
        self.pages
            .remove_if(&page_id, |_, page| Arc::strong_count(page) == 1)
            .map(|(_, page)| page)
    }

    pub fn pages_in_pool(&self) -> usize {
        self.pages.len()
    }

    pub fn get_all_dirty_pages(&self) -> Vec<Arc<MixedPage>> {
        self.pages
            .iter()
            .filter(|entry| entry.value().is_dirty())
            .map(|entry| entry.value().clone())
            .collect()
    }
}
