// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Bump-pointer chunk allocation for the node-sized objects of the engine
//! (list nodes, bucket nodes, versions, graph nodes).
//!
//! Memory is carved out of 1 MiB chunks. Each thread owns a private cursor
//! into its current chunk, so the fast path is wait-free; taking a fresh
//! chunk serializes on a short mutex. Every slot is prefixed with an 8-byte
//! back-pointer to its chunk header; the header packs a live-slot count and
//! a sealed bit into one word, and the chunk is returned to the OS when it
//! is sealed (the owning thread moved on) and its count drains to zero.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    alloc::{alloc, dealloc, Layout},
    cell::RefCell,
    collections::{HashMap, HashSet},
    mem,
    sync::atomic::{AtomicU64, Ordering},
};

const CHUNK_BITS: u32 = 20;
pub const CHUNK_SIZE: usize = 1 << CHUNK_BITS;
const ALIGNMENT: usize = 8;
/// First slot offset; the header occupies the front of the chunk.
const DATA_OFFSET: usize = mem::size_of::<ChunkHeader>();

const SEALED: u64 = 1 << 63;
const COUNT_MASK: u64 = SEALED - 1;

static NEXT_ALLOCATOR_ID: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(1));

thread_local! {
    /// Per-(thread, allocator) bump cursors, keyed by allocator id so
    /// engines in the same process never share bump state.
    static CURSORS: RefCell<HashMap<u64, Cursor>> = RefCell::new(HashMap::new());
}

#[repr(C)]
struct ChunkHeader {
    /// Bit 63: sealed. Low bits: number of live slots.
    state: AtomicU64,
}

#[derive(Clone, Copy)]
struct Cursor {
    header: *mut ChunkHeader,
    bump: usize,
}

/// Source of fixed-alignment slots for one object at a time.
///
/// The trait exists so structures that bootstrap the allocator itself (its
/// internal bookkeeping) can run on plain heap allocation instead.
pub trait SlotAlloc: Send + Sync + 'static {
    /// Returns uninitialized, 8-byte-aligned storage for one `T`.
    fn allocate<T>(&self) -> *mut T;

    /// Drops `*ptr` in place and releases its slot.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate::<T>` on this allocator, must have
    /// been initialized, and must not be released twice.
    unsafe fn deallocate<T>(&self, ptr: *mut T);
}

/// Plain-heap implementation of [`SlotAlloc`].
pub struct StdSlotAlloc;

impl SlotAlloc for StdSlotAlloc {
    fn allocate<T>(&self) -> *mut T {
        assert!(mem::size_of::<T>() > 0, "zero-sized slots unsupported");
        unsafe { alloc(Layout::new::<T>()) as *mut T }
    }

    unsafe fn deallocate<T>(&self, ptr: *mut T) {
        ptr.drop_in_place();
        dealloc(ptr as *mut u8, Layout::new::<T>());
    }
}

/// Counters observable by embedders and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStats {
    /// Chunks ever requested from the OS.
    pub allocated: u64,
    /// Chunks currently held.
    pub live: u64,
}

pub struct ChunkAllocator {
    id: u64,
    /// Addresses of chunks currently held; touched only on chunk birth and
    /// death.
    registry: Mutex<HashSet<usize>>,
    allocated_chunks: AtomicU64,
}

// Raw chunk pointers are shared across threads behind atomics and the
// registry mutex.
unsafe impl Send for ChunkAllocator {}
unsafe impl Sync for ChunkAllocator {}

impl ChunkAllocator {
    pub fn new() -> Self {
        Self {
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            registry: Mutex::new(HashSet::new()),
            allocated_chunks: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> ChunkStats {
        ChunkStats {
            allocated: self.allocated_chunks.load(Ordering::Relaxed),
            live: self.registry.lock().len() as u64,
        }
    }

    fn chunk_layout() -> Layout {
        Layout::from_size_align(CHUNK_SIZE, ALIGNMENT).unwrap()
    }

    fn new_chunk(&self) -> *mut ChunkHeader {
        let chunk = unsafe { alloc(Self::chunk_layout()) } as *mut ChunkHeader;
        assert!(!chunk.is_null(), "chunk allocation failed");
        unsafe {
            std::ptr::write(
                chunk,
                ChunkHeader {
                    state: AtomicU64::new(0),
                },
            )
        };
        self.registry.lock().insert(chunk as usize);
        self.allocated_chunks.fetch_add(1, Ordering::Relaxed);
        chunk
    }

    fn free_chunk(&self, header: *mut ChunkHeader) {
        let removed = self.registry.lock().remove(&(header as usize));
        debug_assert!(removed, "freeing a chunk not in the registry");
        unsafe { dealloc(header as *mut u8, Self::chunk_layout()) };
    }

    /// Seals a chunk the owning thread is abandoning; frees it if every
    /// slot was already released.
    fn seal(&self, header: *mut ChunkHeader) {
        let prev = unsafe { (*header).state.fetch_or(SEALED, Ordering::AcqRel) };
        if prev & COUNT_MASK == 0 {
            self.free_chunk(header);
        }
    }

    fn release(&self, slot: *mut u8) {
        let header = unsafe { *(slot.sub(8) as *const usize) } as *mut ChunkHeader;
        let prev = unsafe { (*header).state.fetch_sub(1, Ordering::AcqRel) };
        debug_assert!(prev & COUNT_MASK > 0, "slot released twice");
        if prev & COUNT_MASK == 1 && prev & SEALED != 0 {
            self.free_chunk(header);
        }
    }
}

impl SlotAlloc for ChunkAllocator {
    fn allocate<T>(&self) -> *mut T {
        assert!(mem::align_of::<T>() <= ALIGNMENT, "alignment above 8 unsupported");
        // 8-byte back-pointer plus the padded payload.
        let size = 8 + ((mem::size_of::<T>() + ALIGNMENT - 1) & !(ALIGNMENT - 1));
        assert!(size <= CHUNK_SIZE - DATA_OFFSET, "object larger than chunk");

        CURSORS.with(|cursors| {
            let mut cursors = cursors.borrow_mut();
            let cursor = cursors.entry(self.id).or_insert(Cursor {
                header: std::ptr::null_mut(),
                bump: 0,
            });

            if cursor.header.is_null() || cursor.bump + size > CHUNK_SIZE {
                if !cursor.header.is_null() {
                    self.seal(cursor.header);
                }
                cursor.header = self.new_chunk();
                cursor.bump = DATA_OFFSET;
            }

            let slot = unsafe { (cursor.header as *mut u8).add(cursor.bump) };
            cursor.bump += size;
            unsafe {
                (*cursor.header).state.fetch_add(1, Ordering::AcqRel);
                *(slot as *mut usize) = cursor.header as usize;
                slot.add(8) as *mut T
            }
        })
    }

    unsafe fn deallocate<T>(&self, ptr: *mut T) {
        ptr.drop_in_place();
        self.release(ptr as *mut u8);
    }
}

impl Default for ChunkAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ChunkAllocator {
    fn drop(&mut self) {
        // Unsealed chunks of threads that never came back, plus anything
        // still holding live slots at teardown.
        let remaining: Vec<usize> = self.registry.lock().drain().collect();
        if !remaining.is_empty() {
            log::debug!(
                "chunk allocator {} releasing {} chunk(s) at teardown",
                self.id,
                remaining.len()
            );
        }
        for addr in remaining {
            unsafe { dealloc(addr as *mut u8, Self::chunk_layout()) };
        }
    }
}
