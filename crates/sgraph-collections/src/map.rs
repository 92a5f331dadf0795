// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Bucket-chain hash structures over chunk-allocated nodes.
//!
//! The bucket array is sized at construction and never rehashed. Writers
//! serialize per bucket on a spin bit; lookups and iteration are lock-free
//! under an epoch guard, and unlinked nodes are epoch-retired so readers
//! never touch freed memory. An optional element capacity turns overflow
//! into an explicit [`CapacityExhausted`] instead of undefined growth.

use crate::{alloc::SlotAlloc, error::CapacityExhausted, hash::hash_key};
use crossbeam::{epoch::Guard, utils::Backoff};
use sgraph_epoch::EpochManager;
use std::{
    cell::UnsafeCell,
    hash::Hash,
    marker::PhantomData,
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering},
        Arc,
    },
};

struct MapNode<K, V> {
    key: K,
    value: UnsafeCell<V>,
    next: AtomicPtr<MapNode<K, V>>,
}

struct Bucket<K, V> {
    head: AtomicPtr<MapNode<K, V>>,
    write_lock: AtomicBool,
}

impl<K, V> Bucket<K, V> {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            write_lock: AtomicBool::new(false),
        }
    }
}

struct BucketLockGuard<'b, K, V> {
    bucket: &'b Bucket<K, V>,
}

impl<'b, K, V> BucketLockGuard<'b, K, V> {
    fn lock(bucket: &'b Bucket<K, V>) -> Self {
        let backoff = Backoff::new();
        while bucket
            .write_lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        Self { bucket }
    }
}

impl<K, V> Drop for BucketLockGuard<'_, K, V> {
    fn drop(&mut self) {
        self.bucket.write_lock.store(false, Ordering::Release);
    }
}

struct RawTable<K, V, A: SlotAlloc> {
    buckets: Box<[Bucket<K, V>]>,
    len: AtomicU64,
    capacity: Option<u64>,
    alloc: Arc<A>,
    em: Arc<EpochManager>,
}

unsafe impl<K: Send + Sync, V: Send + Sync, A: SlotAlloc> Send for RawTable<K, V, A> {}
unsafe impl<K: Send + Sync, V: Send + Sync, A: SlotAlloc> Sync for RawTable<K, V, A> {}

impl<K: Copy + Eq + Hash, V: Copy, A: SlotAlloc> RawTable<K, V, A> {
    fn new(buckets: usize, capacity: Option<u64>, alloc: Arc<A>, em: Arc<EpochManager>) -> Self {
        let buckets = (0..buckets.max(1)).map(|_| Bucket::new()).collect();
        Self {
            buckets,
            len: AtomicU64::new(0),
            capacity,
            alloc,
            em,
        }
    }

    fn bucket(&self, key: &K) -> &Bucket<K, V> {
        let index = (hash_key(key) % self.buckets.len() as u64) as usize;
        &self.buckets[index]
    }

    fn reserve(&self, structure: &'static str) -> Result<(), CapacityExhausted> {
        let n = self.len.fetch_add(1, Ordering::AcqRel);
        if let Some(limit) = self.capacity {
            if n >= limit {
                self.len.fetch_sub(1, Ordering::AcqRel);
                return Err(CapacityExhausted { structure, limit });
            }
        }
        Ok(())
    }

    fn unreserve(&self) {
        self.len.fetch_sub(1, Ordering::AcqRel);
    }

    fn new_node(&self, key: K, value: V, next: *mut MapNode<K, V>) -> *mut MapNode<K, V> {
        let node = self.alloc.allocate::<MapNode<K, V>>();
        unsafe {
            ptr::write(
                node,
                MapNode {
                    key,
                    value: UnsafeCell::new(value),
                    next: AtomicPtr::new(next),
                },
            );
        }
        node
    }

    unsafe fn retire_node(&self, node: *mut MapNode<K, V>) {
        let guard = self.em.pin();
        let alloc = Arc::clone(&self.alloc);
        let addr = node as usize;
        self.em.retire(&guard, move || {
            alloc.deallocate(addr as *mut MapNode<K, V>);
        });
    }

    fn find(&self, key: &K) -> Option<*mut MapNode<K, V>> {
        let mut current = self.bucket(key).head.load(Ordering::Acquire);
        while !current.is_null() {
            let node = unsafe { &*current };
            if node.key == *key {
                return Some(current);
            }
            current = node.next.load(Ordering::Acquire);
        }
        None
    }

    /// Unlinks `node` from its bucket chain. Caller holds the bucket lock.
    fn unlink(&self, bucket: &Bucket<K, V>, node: *mut MapNode<K, V>) {
        let successor = unsafe { (*node).next.load(Ordering::Acquire) };
        let mut prev_link = &bucket.head;
        loop {
            let current = prev_link.load(Ordering::Acquire);
            debug_assert!(!current.is_null(), "node to unlink not on its chain");
            if current == node {
                prev_link.store(successor, Ordering::Release);
                return;
            }
            prev_link = unsafe { &(*current).next };
        }
    }

}

impl<K, V, A: SlotAlloc> RawTable<K, V, A> {
    fn drop_all(&mut self) {
        for bucket in self.buckets.iter() {
            let mut current = bucket.head.load(Ordering::Relaxed);
            while !current.is_null() {
                let next = unsafe { (*current).next.load(Ordering::Relaxed) };
                unsafe { self.alloc.deallocate(current) };
                current = next;
            }
        }
    }
}

/// Lock-free unique-key hash map.
pub struct AtomicHashMap<K, V, A: SlotAlloc> {
    table: RawTable<K, V, A>,
}

impl<K: Copy + Eq + Hash, V: Copy, A: SlotAlloc> AtomicHashMap<K, V, A> {
    /// `buckets` fixes the bucket array; `capacity` optionally bounds the
    /// element count.
    pub fn new(buckets: usize, capacity: Option<u64>, alloc: Arc<A>, em: Arc<EpochManager>) -> Self {
        Self {
            table: RawTable::new(buckets, capacity, alloc, em),
        }
    }

    pub fn len(&self) -> u64 {
        self.table.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts `key -> value`; `Ok(false)` when the key is already present.
    pub fn insert(&self, key: K, value: V) -> Result<bool, CapacityExhausted> {
        self.table.reserve("hash map")?;
        let bucket = self.table.bucket(&key);
        let _lock = BucketLockGuard::lock(bucket);
        if self.table.find(&key).is_some() {
            self.table.unreserve();
            return Ok(false);
        }
        let head = bucket.head.load(Ordering::Acquire);
        let node = self.table.new_node(key, value, head);
        bucket.head.store(node, Ordering::Release);
        Ok(true)
    }

    pub fn lookup(&self, key: &K) -> Option<V> {
        let _guard = self.table.em.pin();
        self.table
            .find(key)
            .map(|node| unsafe { *(*node).value.get() })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lookup(key).is_some()
    }

    pub fn erase(&self, key: &K) -> bool {
        let bucket = self.table.bucket(key);
        let _lock = BucketLockGuard::lock(bucket);
        let Some(node) = self.table.find(key) else {
            return false;
        };
        self.table.unlink(bucket, node);
        self.table.unreserve();
        unsafe { self.table.retire_node(node) };
        true
    }

    /// Iterates `(key, value)` pairs live at traversal time.
    pub fn iter<'g>(&'g self, guard: &'g Guard) -> MapIter<'g, K, V> {
        MapIter::new(&self.table.buckets, guard)
    }
}

impl<K: Copy + Eq + Hash, A: SlotAlloc> AtomicHashMap<K, u64, A> {
    /// Atomically replaces `expected` with `desired` for `key`. Values of
    /// maps used with this method should be read with [`Self::fetch`].
    pub fn compare_and_swap(&self, key: &K, expected: u64, desired: u64) -> bool {
        let _guard = self.table.em.pin();
        let Some(node) = self.table.find(key) else {
            return false;
        };
        let cell = unsafe { &*((*node).value.get() as *const AtomicU64) };
        cell.compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Value load through the same atomic view `compare_and_swap` uses.
    pub fn fetch(&self, key: &K) -> Option<u64> {
        let _guard = self.table.em.pin();
        self.table.find(key).map(|node| {
            let cell = unsafe { &*((*node).value.get() as *const AtomicU64) };
            cell.load(Ordering::Acquire)
        })
    }
}

impl<K, V, A: SlotAlloc> Drop for AtomicHashMap<K, V, A> {
    fn drop(&mut self) {
        self.table.drop_all();
    }
}

/// Duplicate-free element set; a thin view over the map machinery.
pub struct AtomicHashSet<T, A: SlotAlloc> {
    map: AtomicHashMap<T, (), A>,
}

impl<T: Copy + Eq + Hash, A: SlotAlloc> AtomicHashSet<T, A> {
    pub fn new(buckets: usize, alloc: Arc<A>, em: Arc<EpochManager>) -> Self {
        Self {
            map: AtomicHashMap::new(buckets, None, alloc, em),
        }
    }

    /// Returns false when the element was already present.
    pub fn insert(&self, element: T) -> bool {
        self.map
            .insert(element, ())
            .expect("unbounded set cannot exhaust capacity")
    }

    pub fn contains(&self, element: &T) -> bool {
        self.map.contains(element)
    }

    pub fn erase(&self, element: &T) -> bool {
        self.map.erase(element)
    }

    pub fn len(&self) -> u64 {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter<'g>(&'g self, guard: &'g Guard) -> impl Iterator<Item = T> + 'g {
        self.map.iter(guard).map(|(element, ())| element)
    }
}

/// Hash map admitting multiple values per key.
pub struct AtomicHashMultiMap<K, V, A: SlotAlloc> {
    table: RawTable<K, V, A>,
}

impl<K: Copy + Eq + Hash, V: Copy + Eq, A: SlotAlloc> AtomicHashMultiMap<K, V, A> {
    pub fn new(buckets: usize, capacity: Option<u64>, alloc: Arc<A>, em: Arc<EpochManager>) -> Self {
        Self {
            table: RawTable::new(buckets, capacity, alloc, em),
        }
    }

    pub fn len(&self) -> u64 {
        self.table.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts unconditionally; duplicates of both key and value are kept.
    pub fn insert(&self, key: K, value: V) -> Result<(), CapacityExhausted> {
        self.table.reserve("hash multimap")?;
        let bucket = self.table.bucket(&key);
        let _lock = BucketLockGuard::lock(bucket);
        let head = bucket.head.load(Ordering::Acquire);
        let node = self.table.new_node(key, value, head);
        bucket.head.store(node, Ordering::Release);
        Ok(())
    }

    /// Appends every value stored under `key` to `out`; returns whether any
    /// was found.
    pub fn lookup_all(&self, key: &K, out: &mut Vec<V>) -> bool {
        let _guard = self.table.em.pin();
        let before = out.len();
        let mut current = self.table.bucket(key).head.load(Ordering::Acquire);
        while !current.is_null() {
            let node = unsafe { &*current };
            if node.key == *key {
                out.push(unsafe { *node.value.get() });
            }
            current = node.next.load(Ordering::Acquire);
        }
        out.len() > before
    }

    /// Removes one `(key, value)` pair.
    pub fn erase(&self, key: &K, value: &V) -> bool {
        let bucket = self.table.bucket(key);
        let _lock = BucketLockGuard::lock(bucket);
        let mut current = bucket.head.load(Ordering::Acquire);
        while !current.is_null() {
            let node = unsafe { &*current };
            if node.key == *key && unsafe { *node.value.get() } == *value {
                self.table.unlink(bucket, current);
                self.table.unreserve();
                unsafe { self.table.retire_node(current) };
                return true;
            }
            current = node.next.load(Ordering::Acquire);
        }
        false
    }

    pub fn iter<'g>(&'g self, guard: &'g Guard) -> MapIter<'g, K, V> {
        MapIter::new(&self.table.buckets, guard)
    }
}

impl<K, V, A: SlotAlloc> Drop for AtomicHashMultiMap<K, V, A> {
    fn drop(&mut self) {
        self.table.drop_all();
    }
}

pub struct MapIter<'g, K, V> {
    buckets: &'g [Bucket<K, V>],
    bucket_index: usize,
    current: *const MapNode<K, V>,
    _guard: PhantomData<&'g Guard>,
}

impl<'g, K, V> MapIter<'g, K, V> {
    fn new(buckets: &'g [Bucket<K, V>], guard: &'g Guard) -> Self {
        let _ = guard;
        Self {
            buckets,
            bucket_index: 0,
            current: ptr::null(),
            _guard: PhantomData,
        }
    }
}

impl<K: Copy, V: Copy> Iterator for MapIter<'_, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_null() {
                if self.bucket_index >= self.buckets.len() {
                    return None;
                }
                self.current = self.buckets[self.bucket_index].head.load(Ordering::Acquire);
                self.bucket_index += 1;
                continue;
            }
            let node = unsafe { &*self.current };
            self.current = node.next.load(Ordering::Acquire);
            return Some((node.key, unsafe { *node.value.get() }));
        }
    }
}
