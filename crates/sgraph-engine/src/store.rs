// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Column storage and per-row concurrency state shared by both
//! coordinators.
//!
//! A table is a set of uniformly typed columns plus parallel per-row
//! vectors: the ordering list, the published lsn, and the row latch word
//! kept for alternate protocols. Offsets are assigned once at row append
//! and are identical across all vectors of the table.

use crate::error::Error;
use parking_lot::Mutex;
use sgraph_collections::{
    AtomicExtentVec, AtomicHashMap, AtomicOrderedList, ChunkAllocator, ExtentVec,
};
use sgraph_epoch::EpochManager;
use std::sync::Arc;

/// Cell type stored in columns. Values move by copy through tokens, undo
/// records and version images.
pub trait Value: Copy + Send + Sync + 'static {}
impl<T: Copy + Send + Sync + 'static> Value for T {}

/// Index of a registered table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableId(pub usize);

pub(crate) type RwList = AtomicOrderedList<u64, ChunkAllocator>;
pub(crate) type KeyMap = AtomicHashMap<u64, u64, ChunkAllocator>;

pub(crate) struct ColumnSet<V> {
    columns: Box<[ExtentVec<V>]>,
}

impl<V: Value> ColumnSet<V> {
    pub(crate) fn new(columns: usize, capacity: u64) -> Self {
        let columns = (0..columns).map(|_| ExtentVec::new(capacity)).collect();
        Self { columns }
    }

    pub(crate) fn width(&self) -> usize {
        self.columns.len()
    }

    /// # Safety: per the lsn protocol, no concurrent replace of the slot.
    pub(crate) unsafe fn read(&self, column: usize, offset: u64) -> V {
        self.columns[column].read(offset)
    }

    /// # Safety: per the lsn protocol, exclusive access to the slot.
    pub(crate) unsafe fn replace(&self, column: usize, offset: u64, value: V) -> V {
        self.columns[column].replace(offset, value)
    }

    /// # Safety: as for `read`, across all columns of the row.
    pub(crate) unsafe fn read_row(&self, offset: u64) -> Vec<V> {
        self.columns
            .iter()
            .map(|column| column.read(offset))
            .collect()
    }

    /// # Safety: as for `replace`, across all columns of the row.
    pub(crate) unsafe fn write_row(&self, offset: u64, row: &[V]) {
        debug_assert_eq!(row.len(), self.columns.len());
        for (column, value) in self.columns.iter().zip(row) {
            column.replace(offset, *value);
        }
    }

    fn push_row(&self, row: &[V]) -> Result<u64, Error> {
        debug_assert_eq!(row.len(), self.columns.len());
        let mut offset = 0;
        for (column, value) in self.columns.iter().zip(row) {
            offset = column.push_back(*value)?;
        }
        Ok(offset)
    }
}

/// Everything both table flavors share: key index, columns, ordering
/// lists, lsn words and the row latch word used by alternate protocols.
pub(crate) struct RowStore<V> {
    pub(crate) name: String,
    pub(crate) key_map: KeyMap,
    pub(crate) data: ColumnSet<V>,
    pub(crate) lsn: AtomicExtentVec,
    pub(crate) locked: AtomicExtentVec,
    pub(crate) rw: ExtentVec<RwList>,
    append_lock: Mutex<()>,
    alloc: Arc<ChunkAllocator>,
    em: Arc<EpochManager>,
}

impl<V: Value> RowStore<V> {
    pub(crate) fn new(
        name: String,
        columns: usize,
        capacity: u64,
        alloc: Arc<ChunkAllocator>,
        em: Arc<EpochManager>,
    ) -> Self {
        Self {
            name,
            key_map: KeyMap::new(
                (capacity as usize).saturating_mul(2).max(16),
                Some(capacity),
                Arc::clone(&alloc),
                Arc::clone(&em),
            ),
            data: ColumnSet::new(columns, capacity),
            lsn: AtomicExtentVec::new(capacity),
            locked: AtomicExtentVec::new(capacity),
            rw: ExtentVec::new(capacity),
            append_lock: Mutex::new(()),
            alloc,
            em,
        }
    }

    pub(crate) fn lookup(&self, key: u64) -> Result<u64, Error> {
        self.key_map.lookup(&key).ok_or(Error::NotFound)
    }

    /// Appends a row and initializes its concurrency state. Returns the
    /// existing offset unchanged if the key is already mapped.
    ///
    /// Appends are serialized so a row's offset is identical across every
    /// per-row vector; they are not transactional.
    pub(crate) fn append_row(&self, key: u64, row: &[V]) -> Result<u64, Error> {
        self.append_row_with(key, row, |_| Ok(()))
    }

    /// As `append_row`, running `extra` under the append lock before the
    /// key becomes visible, for sibling per-row state (version chains).
    pub(crate) fn append_row_with(
        &self,
        key: u64,
        row: &[V],
        extra: impl FnOnce(u64) -> Result<(), Error>,
    ) -> Result<u64, Error> {
        assert_eq!(row.len(), self.data.width(), "row width mismatch");
        let _serialize = self.append_lock.lock();
        if let Some(existing) = self.key_map.lookup(&key) {
            return Ok(existing);
        }
        let offset = self.data.push_row(row)?;
        self.lsn.push_back(0)?;
        self.locked.push_back(0)?;
        self.rw.push_back(AtomicOrderedList::new(
            Arc::clone(&self.alloc),
            Arc::clone(&self.em),
        ))?;
        extra(offset)?;
        self.key_map.insert(key, offset)?;
        Ok(offset)
    }

    pub(crate) fn row_count(&self) -> u64 {
        self.rw.len()
    }

    /// The row's ordering list. Lists are write-once per offset, so the
    /// borrow is stable.
    pub(crate) fn rw_list(&self, offset: u64) -> &RwList {
        unsafe { self.rw.get(offset) }
    }

    /// Publishes the row's last-serialized position.
    pub(crate) fn publish_lsn(&self, offset: u64, value: u64) {
        self.lsn.store(offset, value);
    }

    pub(crate) fn lsn_reached(&self, offset: u64, position: u64) -> bool {
        self.lsn.load(offset) == position
    }
}

/// Undo/token bookkeeping one transaction keeps per touched row.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TokenEntry {
    pub(crate) table: TableId,
    pub(crate) offset: u64,
    pub(crate) position: u64,
}
