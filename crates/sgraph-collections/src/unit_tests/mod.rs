// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    alloc::{ChunkAllocator, SlotAlloc, StdSlotAlloc},
    extent::{AtomicExtentVec, ExtentVec},
    list::AtomicOrderedList,
    map::{AtomicHashMap, AtomicHashMultiMap, AtomicHashSet},
};
use claims::{assert_err, assert_none, assert_ok, assert_ok_eq, assert_some_eq};
use rayon::prelude::*;
use sgraph_epoch::EpochManager;
use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc,
};


fn harness() -> (Arc<ChunkAllocator>, Arc<EpochManager>) {
    (Arc::new(ChunkAllocator::new()), Arc::new(EpochManager::new()))
}

fn list(alloc: &Arc<ChunkAllocator>, em: &Arc<EpochManager>) -> AtomicOrderedList<u64, ChunkAllocator> {
    AtomicOrderedList::new(Arc::clone(alloc), Arc::clone(em))
}

#[test]
fn list_insert() {
    let (alloc, em) = harness();
    let list = list(&alloc, &em);
    for i in 0..100u64 {
        assert_eq!(list.push_front(i), i);
    }
    let guard = em.pin();
    let mut expected = 99i64;
    for (position, value) in list.iter(&guard) {
        assert_eq!(position, expected as u64);
        assert_eq!(value, expected as u64);
        expected -= 1;
    }
    assert_eq!(expected, -1);
}

#[test]
fn list_insert_multithread() {
    let (alloc, em) = harness();
    let list = list(&alloc, &em);
    (0..1000u64).into_par_iter().for_each(|i| {
        list.push_front(i);
    });

    let guard = em.pin();
    let sum: u64 = list.iter(&guard).map(|(_, value)| value).sum();
    assert_eq!(sum, (1000 * 999) / 2);
    assert_eq!(list.len(), 1000);
}

#[test]
fn list_insert_delete() {
    let (alloc, em) = harness();
    let list = list(&alloc, &em);
    let mut total = 0i64;
    let mut count = 0i64;
    for i in 0..10_000u64 {
        if i % 2 == 0 && i > 0 {
            // Positions equal the pushed values here, as in list_insert.
            if list.erase(i - 2) {
                total -= (i - 2) as i64;
                count -= 1;
            }
        }
        list.push_front(i);
        total += i as i64;
        count += 1;
    }
    let guard = em.pin();
    let sum: i64 = list.iter(&guard).map(|(_, value)| value as i64).sum();
    assert_eq!(sum, total);
    assert_eq!(list.len(), count as u64);
}

#[test]
fn list_insert_delete_multithread_count() {
    let (alloc, em) = harness();
    let list = list(&alloc, &em);
    let total = AtomicI64::new(0);
    (0..100_000u64).into_par_iter().for_each(|i| {
        let guard = em.pin();
        if i >= 2 {
            if let Some(found) = list.find(i - 2, &guard) {
                if list.erase(i - 2) {
                    total.fetch_sub(found as i64, Ordering::SeqCst);
                }
            }
        }
        list.push_front(i);
        total.fetch_add(i as i64, Ordering::SeqCst);
    });

    let guard = em.pin();
    let sum: i64 = list.iter(&guard).map(|(_, value)| value as i64).sum();
    assert_eq!(sum, total.load(Ordering::SeqCst));
}

#[test]
fn list_insert_read_multithread() {
    let (alloc, em) = harness();
    let list = list(&alloc, &em);
    (0..10_000u64).into_par_iter().for_each(|i| {
        let guard = em.pin();
        // Wander a prefix of the list while other threads push.
        let mut seen = 0;
        for (_, value) in list.iter(&guard) {
            if value > 0 {
                seen += 1;
            }
            if seen > 100 {
                break;
            }
        }
        list.push_front(i);
    });

    let guard = em.pin();
    let sum: u64 = list.iter(&guard).map(|(_, value)| value).sum();
    assert_eq!(sum, (10_000 * 9_999) / 2);
}

#[test]
fn list_runs_on_plain_heap_allocation() {
    let em = Arc::new(EpochManager::new());
    let list: AtomicOrderedList<u64, StdSlotAlloc> =
        AtomicOrderedList::new(Arc::new(StdSlotAlloc), Arc::clone(&em));
    for i in 0..64u64 {
        assert_eq!(list.push_front(i), i);
    }
    assert!(list.erase(10));
    assert_eq!(list.len(), 63);
}

#[test]
fn list_erase_missing_position() {
    let (alloc, em) = harness();
    let list = list(&alloc, &em);
    list.push_front(7);
    assert!(!list.erase(99));
    assert!(list.erase(0));
    assert!(!list.erase(0));
    assert!(list.is_empty());
}

#[test]
fn map_insert_lookup_erase() {
    let (alloc, em) = harness();
    let map: AtomicHashMap<u64, u64, _> = AtomicHashMap::new(64, None, alloc, em);

    assert_ok_eq!(map.insert(1, 100), true);
    assert_ok_eq!(map.insert(1, 200), false);
    assert_some_eq!(map.lookup(&1), 100);
    assert_none!(map.lookup(&2));
    assert_eq!(map.len(), 1);

    assert!(map.erase(&1));
    assert!(!map.erase(&1));
    assert_none!(map.lookup(&1));
    assert!(map.is_empty());
}

#[test]
fn map_capacity_exhausted() {
    let (alloc, em) = harness();
    let map: AtomicHashMap<u64, u64, _> = AtomicHashMap::new(16, Some(4), alloc, em);
    for key in 0..4 {
        assert_ok!(map.insert(key, key));
    }
    assert_err!(map.insert(4, 4));
    // Erasing makes room again.
    assert!(map.erase(&0));
    assert_ok_eq!(map.insert(4, 4), true);
}

#[test]
fn map_insert_lookup_multithread() {
    let (alloc, em) = harness();
    let map: AtomicHashMap<u64, u64, _> = AtomicHashMap::new(1024, None, alloc, em);
    (0..50_000u64).into_par_iter().for_each(|i| {
        assert_ok_eq!(map.insert(i, i * 2), true);
        assert_some_eq!(map.lookup(&i), i * 2);
    });
    assert_eq!(map.len(), 50_000);
}

#[test]
fn map_erase_under_concurrent_lookup() {
    let (alloc, em) = harness();
    let map: Arc<AtomicHashMap<u64, u64, _>> = Arc::new(AtomicHashMap::new(256, None, alloc, em));
    for key in 0..1024u64 {
        assert_ok!(map.insert(key, key));
    }
    (0..1024u64).into_par_iter().for_each(|key| {
        // Lookups racing erasure must see the value or nothing, never junk.
        if key % 2 == 0 {
            assert!(map.erase(&key));
        } else if let Some(value) = map.lookup(&key) {
            assert_eq!(value, key);
        }
    });
    assert_eq!(map.len(), 512);
}

#[test]
fn map_compare_and_swap() {
    let (alloc, em) = harness();
    let map: AtomicHashMap<u64, u64, _> = AtomicHashMap::new(16, None, alloc, em);
    assert_ok!(map.insert(9, 1));
    assert!(map.compare_and_swap(&9, 1, 2));
    assert!(!map.compare_and_swap(&9, 1, 3));
    assert!(!map.compare_and_swap(&8, 0, 1));
    assert_some_eq!(map.fetch(&9), 2);
}

#[test]
fn multimap_keeps_duplicates() {
    let (alloc, em) = harness();
    let map: AtomicHashMultiMap<u64, u64, _> = AtomicHashMultiMap::new(16, None, alloc, em);
    assert_ok!(map.insert(5, 50));
    assert_ok!(map.insert(5, 51));
    assert_ok!(map.insert(6, 60));

    let mut values = Vec::new();
    assert!(map.lookup_all(&5, &mut values));
    values.sort_unstable();
    assert_eq!(values, vec![50, 51]);

    assert!(map.erase(&5, &50));
    assert!(!map.erase(&5, &50));
    values.clear();
    assert!(map.lookup_all(&5, &mut values));
    assert_eq!(values, vec![51]);
    assert_eq!(map.len(), 2);
}

#[test]
fn set_deduplicates() {
    let (alloc, em) = harness();
    let set: AtomicHashSet<u64, _> = AtomicHashSet::new(16, alloc, em);
    assert!(set.insert(3));
    assert!(!set.insert(3));
    assert!(set.contains(&3));
    assert_eq!(set.len(), 1);
    assert!(set.erase(&3));
    assert!(set.is_empty());
}

#[test]
fn set_iteration_sees_all_elements() {
    let (alloc, em) = harness();
    let set: AtomicHashSet<u64, _> = AtomicHashSet::new(8, alloc, Arc::clone(&em));
    for element in 0..100u64 {
        assert!(set.insert(element));
    }
    let guard = em.pin();
    let mut elements: Vec<u64> = set.iter(&guard).collect();
    elements.sort_unstable();
    assert_eq!(elements, (0..100).collect::<Vec<_>>());
}

#[test]
fn extent_push_and_read() {
    let vec: ExtentVec<u64> = ExtentVec::new(1 << 16);
    for i in 0..10_000u64 {
        assert_ok_eq!(vec.push_back(i * 3), i);
    }
    assert_eq!(vec.len(), 10_000);
    for i in 0..10_000u64 {
        assert!(vec.is_alive(i));
        assert_eq!(unsafe { vec.read(i) }, i * 3);
    }
}

#[test]
fn extent_concurrent_push_distinct_offsets() {
    let vec: ExtentVec<u64> = ExtentVec::new(1 << 17);
    let offsets: Vec<u64> = (0..100_000u64)
        .into_par_iter()
        .map(|i| vec.push_back(i).unwrap())
        .collect();
    let mut sorted = offsets.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 100_000);
    assert_eq!(*sorted.last().unwrap(), 99_999);
    let total: u64 = (0..100_000u64).map(|i| unsafe { vec.read(i) }).sum();
    assert_eq!(total, 100_000 * 99_999 / 2);
}

#[test]
fn extent_capacity_exhausted() {
    let vec: ExtentVec<u64> = ExtentVec::new(4);
    for i in 0..4u64 {
        assert_ok_eq!(vec.push_back(i), i);
    }
    assert_err!(vec.push_back(4));
    assert_eq!(vec.len(), 4);
}

#[test]
fn extent_replace_and_erase() {
    let vec: ExtentVec<u64> = ExtentVec::new(16);
    assert_ok!(vec.push_back(1));
    assert_eq!(unsafe { vec.replace(0, 2) }, 1);
    assert_eq!(unsafe { vec.read(0) }, 2);
    vec.erase(0);
    assert!(!vec.is_alive(0));
}

#[test]
fn extent_iteration_skips_tombstones() {
    let vec: ExtentVec<u64> = ExtentVec::new(16);
    for i in 0..6u64 {
        assert_ok!(vec.push_back(i * 10));
    }
    vec.erase(2);
    vec.erase(4);
    let seen: Vec<(u64, u64)> = unsafe { vec.iter() }.collect();
    assert_eq!(seen, vec![(0, 0), (1, 10), (3, 30), (5, 50)]);

    let avec = AtomicExtentVec::new(16);
    for i in 0..4u64 {
        assert_ok!(avec.push_back(i));
    }
    avec.erase(1);
    let seen: Vec<(u64, u64)> = avec.iter().collect();
    assert_eq!(seen, vec![(0, 0), (2, 2), (3, 3)]);
}

#[test]
fn atomic_extent_replace_and_cas() {
    let vec = AtomicExtentVec::new(16);
    assert_ok_eq!(vec.push_back(10), 0);
    assert_eq!(vec.load(0), 10);
    assert_eq!(vec.replace(0, 20), 10);
    assert_ok!(vec.compare_exchange(0, 20, 30));
    assert_err!(vec.compare_exchange(0, 20, 40));
    assert_eq!(vec.fetch_or(0, 1 << 63), 30);
    assert_eq!(vec.fetch_and(0, !(1 << 63)), 30 | 1 << 63);
    assert_eq!(vec.load(0), 30);
}

#[test]
fn atomic_extent_concurrent_counters() {
    let vec = AtomicExtentVec::new(64);
    for _ in 0..64 {
        assert_ok!(vec.push_back(0));
    }
    (0..64u64).into_par_iter().for_each(|slot| {
        for _ in 0..1000 {
            let old = vec.load(slot);
            let mut value = old;
            loop {
                match vec.compare_exchange(slot, value, value + 1) {
                    Ok(_) => break,
                    Err(actual) => value = actual,
                }
            }
            let _ = old;
        }
    });
    for slot in 0..64u64 {
        assert_eq!(vec.load(slot), 1000);
    }
}

#[test]
fn allocator_roundtrip() {
    let alloc = ChunkAllocator::new();
    let ptr = alloc.allocate::<[u64; 4]>();
    unsafe {
        std::ptr::write(ptr, [1, 2, 3, 4]);
        assert_eq!((*ptr)[3], 4);
        alloc.deallocate(ptr);
    }
    assert_eq!(alloc.stats().allocated, 1);
}

#[test]
fn allocator_recycles_sealed_chunks() {
    let alloc = ChunkAllocator::new();
    // Fill several chunks with large slots, freeing everything as we go;
    // sealed chunks must be handed back.
    let mut slots = Vec::new();
    for _ in 0..4096 {
        let ptr = alloc.allocate::<[u8; 4000]>();
        unsafe { std::ptr::write(ptr, [0u8; 4000]) };
        slots.push(ptr as usize);
    }
    let stats = alloc.stats();
    assert!(stats.allocated > 8, "expected multiple chunks, got {:?}", stats);
    for addr in slots {
        unsafe { alloc.deallocate(addr as *mut [u8; 4000]) };
    }
    // All chunks except the still-open one are sealed and drained.
    assert_eq!(alloc.stats().live, 1);
}

#[test]
fn allocator_multithread_churn() {
    let alloc = Arc::new(ChunkAllocator::new());
    (0..8u64).into_par_iter().for_each(|_| {
        let mut live = Vec::new();
        for round in 0..10_000u64 {
            let ptr = alloc.allocate::<u64>();
            unsafe { std::ptr::write(ptr, round) };
            live.push(ptr as usize);
            if round % 3 == 0 {
                let addr = live.swap_remove((round % live.len() as u64) as usize);
                unsafe { alloc.deallocate(addr as *mut u64) };
            }
        }
        for addr in live {
            unsafe { alloc.deallocate(addr as *mut u64) };
        }
    });
    // Every slot was released; only per-thread open chunks may linger.
    assert!(alloc.stats().live <= 8 + 1);
}

#[test]
fn list_nodes_reclaimed_after_guards_drop() {
    let (alloc, em) = harness();
    let list = list(&alloc, &em);
    let position = list.push_front(1);

    let reader = em.pin();
    assert!(list.erase(position));
    assert_none!(list.find(position, &reader));
    // The reader pinned before the erase may still walk the node safely.
    drop(reader);
    for _ in 0..64 {
        drop(em.pin());
    }
    assert!(list.is_empty());
}

const CONTENTION_KEYS: u64 = 512;

#[test]
fn map_mixed_workload_multithread() {
    let (alloc, em) = harness();
    let map: AtomicHashMap<u64, u64, _> = AtomicHashMap::new(256, None, alloc, em);
    let inserted = AtomicU64::new(0);
    let erased = AtomicU64::new(0);
    (0..100_000u64).into_par_iter().for_each(|i| {
        let key = i % CONTENTION_KEYS;
        match i % 3 {
            0 => {
                if map.insert(key, i).unwrap() {
                    inserted.fetch_add(1, Ordering::SeqCst);
                }
            }
            1 => {
                if map.erase(&key) {
                    erased.fetch_add(1, Ordering::SeqCst);
                }
            }
            _ => {
                let _ = map.lookup(&key);
            }
        }
    });
    assert_eq!(
        map.len(),
        inserted.load(Ordering::SeqCst) - erased.load(Ordering::SeqCst)
    );
}
