// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Append-only segmented vectors with stable element addresses.
//!
//! Slots live in uniformly sized segments behind a preallocated directory,
//! so an element's address never moves once assigned. `push_back` reserves
//! an index with a fetch-add and publishes the slot with a per-slot state
//! byte; a reader that races an in-flight append observes the slot as not
//! yet alive and must retry on [`ExtentVec::is_alive`] before trusting the
//! value.

use crate::error::CapacityExhausted;
use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering},
};

const SEGMENT_BITS: usize = 12;
const SEGMENT_LEN: usize = 1 << SEGMENT_BITS;

const EMPTY: u8 = 0;
const ALIVE: u8 = 1;
const ERASED: u8 = 2;

struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

struct Segment<T> {
    slots: Box<[Slot<T>]>,
}

impl<T> Segment<T> {
    fn new() -> Box<Self> {
        let slots = (0..SEGMENT_LEN)
            .map(|_| Slot {
                state: AtomicU8::new(EMPTY),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Box::new(Self { slots })
    }
}

fn directory_len(capacity: u64) -> usize {
    ((capacity as usize) + SEGMENT_LEN - 1) / SEGMENT_LEN
}

/// Append-only segmented vector for externally serialized cells.
///
/// `read` and `replace` are unsafe: the engine's per-row ordering protocol
/// guarantees that no two threads touch the same slot at the same time, and
/// that guarantee cannot be expressed in the type system here.
pub struct ExtentVec<T> {
    directory: Box<[AtomicPtr<Segment<T>>]>,
    len: AtomicU64,
    capacity: u64,
}

unsafe impl<T: Send> Send for ExtentVec<T> {}
unsafe impl<T: Send + Sync> Sync for ExtentVec<T> {}

impl<T> ExtentVec<T> {
    pub fn new(capacity: u64) -> Self {
        let directory = (0..directory_len(capacity))
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        Self {
            directory,
            len: AtomicU64::new(0),
            capacity,
        }
    }

    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn segment(&self, index: u64) -> *mut Segment<T> {
        let seg_index = (index >> SEGMENT_BITS) as usize;
        let existing = self.directory[seg_index].load(Ordering::Acquire);
        if !existing.is_null() {
            return existing;
        }
        let fresh = Box::into_raw(Segment::new());
        match self.directory[seg_index].compare_exchange(
            std::ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => fresh,
            Err(winner) => {
                drop(unsafe { Box::from_raw(fresh) });
                winner
            }
        }
    }

    fn slot(&self, index: u64) -> &Slot<T> {
        let segment = self.segment(index);
        unsafe { &(*segment).slots[(index as usize) & (SEGMENT_LEN - 1)] }
    }

    /// Appends a value; concurrent callers receive distinct contiguous
    /// indices.
    pub fn push_back(&self, value: T) -> Result<u64, CapacityExhausted> {
        let index = self.len.fetch_add(1, Ordering::AcqRel);
        if index >= self.capacity {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return Err(CapacityExhausted {
                structure: "extent vector",
                limit: self.capacity,
            });
        }
        let slot = self.slot(index);
        unsafe { (*slot.value.get()).write(value) };
        slot.state.store(ALIVE, Ordering::Release);
        Ok(index)
    }

    /// True once the appender of `index` has finished publishing the slot.
    pub fn is_alive(&self, index: u64) -> bool {
        index < self.len() && self.slot(index).state.load(Ordering::Acquire) == ALIVE
    }

    /// Tombstones a slot. The value stays allocated for epoch-bounded
    /// readers; nothing is compacted.
    pub fn erase(&self, index: u64) {
        debug_assert!(index < self.len());
        self.slot(index).state.store(ERASED, Ordering::Release);
    }

    /// Reads the value at `index` by copy.
    ///
    /// # Safety
    ///
    /// The slot must be alive, and the caller must guarantee no concurrent
    /// `replace` of the same slot (the engine's lsn protocol).
    pub unsafe fn read(&self, index: u64) -> T
    where
        T: Copy,
    {
        debug_assert!(self.is_alive(index));
        (*self.slot(index).value.get()).assume_init()
    }

    /// Swaps the value at `index`, returning the previous one.
    ///
    /// # Safety
    ///
    /// The slot must be alive, and the caller must guarantee no concurrent
    /// `read` or `replace` of the same slot (the engine's lsn protocol).
    pub unsafe fn replace(&self, index: u64, value: T) -> T {
        debug_assert!(self.is_alive(index));
        let cell = self.slot(index).value.get();
        std::mem::replace((*cell).assume_init_mut(), value)
    }

    /// Borrows the value at `index`.
    ///
    /// # Safety
    ///
    /// The slot must be alive and must never be target of `replace` while
    /// the borrow lives (write-once slots such as per-row lists).
    pub unsafe fn get(&self, index: u64) -> &T {
        debug_assert!(self.is_alive(index));
        (*self.slot(index).value.get()).assume_init_ref()
    }

    /// Iterates alive slots by copy in index order.
    ///
    /// # Safety
    ///
    /// As for `read`: no concurrent `replace` of any yielded slot.
    pub unsafe fn iter(&self) -> impl Iterator<Item = (u64, T)> + '_
    where
        T: Copy,
    {
        (0..self.len())
            .filter(move |index| self.is_alive(*index))
            .map(move |index| (index, unsafe { self.read(index) }))
    }
}

impl<T> Drop for ExtentVec<T> {
    fn drop(&mut self) {
        let len = self.len();
        for index in 0..len {
            let slot = self.slot(index);
            if slot.state.load(Ordering::Acquire) != EMPTY {
                unsafe { (*slot.value.get()).assume_init_drop() };
            }
        }
        for entry in self.directory.iter() {
            let segment = entry.load(Ordering::Acquire);
            if !segment.is_null() {
                drop(unsafe { Box::from_raw(segment) });
            }
        }
    }
}

struct AtomicSlot {
    state: AtomicU8,
    value: AtomicU64,
}

struct AtomicSegment {
    slots: Box<[AtomicSlot]>,
}

/// Append-only segmented vector of atomic 64-bit words (lsn words, latch
/// words, tagged chain heads).
pub struct AtomicExtentVec {
    directory: Box<[AtomicPtr<AtomicSegment>]>,
    len: AtomicU64,
    capacity: u64,
}

unsafe impl Send for AtomicExtentVec {}
unsafe impl Sync for AtomicExtentVec {}

impl AtomicExtentVec {
    pub fn new(capacity: u64) -> Self {
        let directory = (0..directory_len(capacity))
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        Self {
            directory,
            len: AtomicU64::new(0),
            capacity,
        }
    }

    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn segment(&self, index: u64) -> *mut AtomicSegment {
        let seg_index = (index >> SEGMENT_BITS) as usize;
        let existing = self.directory[seg_index].load(Ordering::Acquire);
        if !existing.is_null() {
            return existing;
        }
        let slots = (0..SEGMENT_LEN)
            .map(|_| AtomicSlot {
                state: AtomicU8::new(EMPTY),
                value: AtomicU64::new(0),
            })
            .collect();
        let fresh = Box::into_raw(Box::new(AtomicSegment { slots }));
        match self.directory[seg_index].compare_exchange(
            std::ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => fresh,
            Err(winner) => {
                drop(unsafe { Box::from_raw(fresh) });
                winner
            }
        }
    }

    fn slot(&self, index: u64) -> &AtomicSlot {
        let segment = self.segment(index);
        unsafe { &(*segment).slots[(index as usize) & (SEGMENT_LEN - 1)] }
    }

    pub fn push_back(&self, value: u64) -> Result<u64, CapacityExhausted> {
        let index = self.len.fetch_add(1, Ordering::AcqRel);
        if index >= self.capacity {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return Err(CapacityExhausted {
                structure: "atomic extent vector",
                limit: self.capacity,
            });
        }
        let slot = self.slot(index);
        slot.value.store(value, Ordering::Release);
        slot.state.store(ALIVE, Ordering::Release);
        Ok(index)
    }

    pub fn is_alive(&self, index: u64) -> bool {
        index < self.len() && self.slot(index).state.load(Ordering::Acquire) == ALIVE
    }

    pub fn erase(&self, index: u64) {
        debug_assert!(index < self.len());
        self.slot(index).state.store(ERASED, Ordering::Release);
    }

    pub fn load(&self, index: u64) -> u64 {
        self.slot(index).value.load(Ordering::Acquire)
    }

    pub fn store(&self, index: u64, value: u64) {
        self.slot(index).value.store(value, Ordering::Release);
    }

    /// Atomic swap; the replace primitive of the slot.
    pub fn replace(&self, index: u64, value: u64) -> u64 {
        self.slot(index).value.swap(value, Ordering::AcqRel)
    }

    pub fn compare_exchange(&self, index: u64, current: u64, new: u64) -> Result<u64, u64> {
        self.slot(index)
            .value
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    pub fn fetch_or(&self, index: u64, bits: u64) -> u64 {
        self.slot(index).value.fetch_or(bits, Ordering::AcqRel)
    }

    pub fn fetch_and(&self, index: u64, bits: u64) -> u64 {
        self.slot(index).value.fetch_and(bits, Ordering::AcqRel)
    }

    /// Iterates alive slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        (0..self.len())
            .filter(move |index| self.is_alive(*index))
            .map(move |index| (index, self.load(index)))
    }
}

impl Drop for AtomicExtentVec {
    fn drop(&mut self) {
        for entry in self.directory.iter() {
            let segment = entry.load(Ordering::Acquire);
            if !segment.is_null() {
                drop(unsafe { Box::from_raw(segment) });
            }
        }
    }
}
