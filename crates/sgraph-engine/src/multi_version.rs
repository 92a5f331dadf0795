// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Multi-version coordinator: the live column slots always hold the newest
//! (possibly uncommitted) data, and each row carries a chain of
//! before-images so read-only snapshots can reconstruct the row as of
//! their epoch without touching the ordering list.
//!
//! The chain head word's top bit is a latch: splices, unsplices and
//! snapshot reads all hold it, which is what makes immediate reclamation
//! of an aborted head version safe. Committed before-images are unlinked
//! through the commit-epoch tier only once every snapshot that could still
//! need them has drained.

use crate::{
    access::{spin_until, AccessKind, Token},
    config::{EngineConfig, TableSchema},
    coordinator::{AbortInfo, Coordinator, Transaction},
    error::{Error, TxnId, Verdict},
    graph::{EdgeKind, SerializationGraph},
    store::{RowStore, TableId, TokenEntry, Value},
};
use rand::Rng;
use sgraph_collections::{CapacityExhausted, ChunkAllocator, SlotAlloc};
use sgraph_epoch::{CommitEpochs, EpochManager, SnapshotGuard};
use std::{
    collections::HashSet,
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering},
        Arc,
    },
};

const CHAIN_TAG: u64 = 1 << 63;

/// A before-image: the row as it looked when its writer replaced it.
/// `epoch` is the writer's commit epoch, `u64::MAX` while uncommitted.
pub(crate) struct Version<V> {
    row: Vec<V>,
    txn: TxnId,
    epoch: AtomicU64,
    committed: AtomicBool,
    /// Toward the newer neighbor; null at the head.
    prev: AtomicPtr<Version<V>>,
    /// Toward the older neighbor; null at the tail.
    next: AtomicPtr<Version<V>>,
}

pub(crate) struct MvTable<V: Value> {
    pub(crate) rows: RowStore<V>,
    /// Tagged head addresses of the per-row version chains.
    chain: sgraph_collections::AtomicExtentVec,
    alloc: Arc<ChunkAllocator>,
}

impl<V: Value> MvTable<V> {
    fn new(
        name: String,
        columns: usize,
        capacity: u64,
        alloc: Arc<ChunkAllocator>,
        em: Arc<EpochManager>,
    ) -> Self {
        Self {
            rows: RowStore::new(name, columns, capacity, Arc::clone(&alloc), em),
            chain: sgraph_collections::AtomicExtentVec::new(capacity),
            alloc,
        }
    }

    fn append_row(&self, key: u64, row: &[V]) -> Result<u64, Error> {
        self.rows.append_row_with(key, row, |_| {
            self.chain.push_back(0)?;
            Ok(())
        })
    }

    /// Acquires the row's chain latch, returning the untagged head address.
    /// `cooperative` waiters back off a randomized bounded spin, owners
    /// spin tight.
    fn latch(&self, offset: u64, cooperative: bool) -> u64 {
        loop {
            let word = self.chain.load(offset);
            if word & CHAIN_TAG != 0 {
                if cooperative {
                    let spins = rand::thread_rng().gen_range(0, 0x400);
                    for _ in 0..spins {
                        std::hint::spin_loop();
                    }
                } else {
                    std::hint::spin_loop();
                }
                continue;
            }
            if self
                .chain
                .compare_exchange(offset, word, word | CHAIN_TAG)
                .is_ok()
            {
                return word;
            }
        }
    }

    /// Releases the latch, publishing `head` as the new chain head.
    fn unlatch(&self, offset: u64, head: u64) {
        debug_assert_eq!(head & CHAIN_TAG, 0);
        self.chain.store(offset, head);
    }

    /// Copies the row as of `epoch` under the chain latch: the live slots
    /// when the head image is absent or already superseded at the epoch,
    /// otherwise the oldest image still newer than the epoch.
    fn snapshot_row(&self, offset: u64, epoch: u64) -> Vec<V> {
        let head_addr = self.latch(offset, true);
        let row = unsafe {
            if head_addr == 0 {
                self.rows.data.read_row(offset)
            } else {
                let head = &*(head_addr as *const Version<V>);
                if head.epoch.load(Ordering::Acquire) <= epoch {
                    self.rows.data.read_row(offset)
                } else {
                    let mut element = head_addr as *const Version<V>;
                    loop {
                        let next = (*element).next.load(Ordering::Acquire);
                        if next.is_null() || (*next).epoch.load(Ordering::Acquire) <= epoch {
                            break;
                        }
                        element = next;
                    }
                    (*element).row.clone()
                }
            }
        };
        self.unlatch(offset, head_addr);
        row
    }

    /// Deferred unlink of a committed before-image; runs behind the
    /// safe-read horizon.
    fn unlink_version(table: &Arc<MvTable<V>>, offset: u64, version: *mut Version<V>) {
        let head = table.latch(offset, false);
        unsafe {
            debug_assert!((*version).committed.load(Ordering::Acquire));
            let newer = (*version).prev.load(Ordering::Acquire);
            let older = (*version).next.load(Ordering::Acquire);
            if newer.is_null() {
                debug_assert_eq!(head, version as u64);
                if !older.is_null() {
                    (*older).prev.store(ptr::null_mut(), Ordering::Release);
                }
                table.unlatch(offset, older as u64);
            } else {
                (*newer).next.store(older, Ordering::Release);
                if !older.is_null() {
                    (*older).prev.store(newer, Ordering::Release);
                }
                table.unlatch(offset, head);
            }
            table.alloc.deallocate(version);
        }
    }
}

impl<V: Value> Drop for MvTable<V> {
    fn drop(&mut self) {
        for offset in 0..self.chain.len() {
            let mut current = self.chain.load(offset) & !CHAIN_TAG;
            while current != 0 {
                let version = current as *mut Version<V>;
                current = unsafe { (*version).next.load(Ordering::Relaxed) } as u64;
                unsafe { self.alloc.deallocate(version) };
            }
        }
    }
}

#[derive(Clone, Copy)]
pub enum MvAccess<V> {
    Token(TokenEntry),
    Write {
        entry: TokenEntry,
        version: *mut Version<V>,
    },
}

impl<V> MvAccess<V> {
    fn entry(&self) -> TokenEntry {
        match self {
            MvAccess::Token(entry) => *entry,
            MvAccess::Write { entry, .. } => *entry,
        }
    }
}

pub type MvTransaction<V> = Transaction<MvAccess<V>>;

/// Serializable engine over multi-versioned rows, with read-only snapshot
/// queries on the side.
pub struct MvEngine<V: Value> {
    config: EngineConfig,
    graph: SerializationGraph,
    pub(crate) tables: Box<[Arc<MvTable<V>>]>,
    epochs: Arc<CommitEpochs>,
    em: Arc<EpochManager>,
    alloc: Arc<ChunkAllocator>,
}

impl<V: Value> MvEngine<V> {
    pub fn new(config: EngineConfig, schemas: &[TableSchema]) -> Self {
        let alloc = Arc::new(ChunkAllocator::new());
        let em = Arc::new(EpochManager::new());
        let tables = schemas
            .iter()
            .map(|schema| {
                Arc::new(MvTable::new(
                    schema.name.clone(),
                    schema.columns,
                    config.table_capacity,
                    Arc::clone(&alloc),
                    Arc::clone(&em),
                ))
            })
            .collect();
        let graph = SerializationGraph::new(Arc::clone(&alloc), Arc::clone(&em));
        let epochs = Arc::new(CommitEpochs::new(config.snapshot_slots));
        log::info!(
            "multi-version engine up: {} table(s), capacity {}, {} snapshot slot(s)",
            schemas.len(),
            config.table_capacity,
            config.snapshot_slots
        );
        Self {
            config,
            graph,
            tables,
            epochs,
            em,
            alloc,
        }
    }

    fn table(&self, table: TableId) -> Result<&Arc<MvTable<V>>, Error> {
        self.tables.get(table.0).ok_or(Error::NotFound)
    }

    /// Current safe-read epoch; snapshots taken now observe every commit up
    /// to it.
    pub fn safe_read_epoch(&self) -> u64 {
        self.epochs.safe_read_epoch()
    }

    /// Claims a read-only snapshot at the current safe-read epoch.
    pub fn snapshot(&self) -> Result<Snapshot<'_, V>, Error> {
        match self.epochs.snapshot() {
            Some(guard) => Ok(Snapshot {
                engine: self,
                guard,
            }),
            None => Err(Error::CapacityExhausted(CapacityExhausted {
                structure: "snapshot slots",
                limit: self.config.snapshot_slots as u64,
            })),
        }
    }

    fn wait_for_turn(&self, rows: &RowStore<V>, offset: u64, position: u64) {
        if position > 0 {
            spin_until(self.config.spin_yield, || rows.lsn_reached(offset, position));
        }
    }

    fn abort_internal(&self, txn: &mut MvTransaction<V>) -> Error {
        let error = if self.graph.is_cascading(txn.node) {
            Error::CascadingAbort {
                through: self.graph.abort_through(txn.node),
            }
        } else {
            Error::CycleDetected
        };
        let peers = self.run_abort(txn);
        txn.outcome = Some(AbortInfo {
            error: error.clone(),
            peers,
        });
        error
    }

    /// Unsplices this transaction's head versions (restoring the live rows
    /// from their before-images), unlinks the graph node, detaches tokens.
    fn run_abort(&self, txn: &mut MvTransaction<V>) -> HashSet<TxnId> {
        for index in (0..txn.accesses.len()).rev() {
            let MvAccess::Write { entry, version } = txn.accesses[index] else {
                continue;
            };
            let table = &self.tables[entry.table.0];
            let head = table.latch(entry.offset, false);
            unsafe {
                assert!(
                    (*version).prev.load(Ordering::Acquire).is_null(),
                    "aborting write must still head its version chain"
                );
                debug_assert_eq!(head, version as u64);
                debug_assert_eq!((*version).txn, txn.id());
                debug_assert!(!(*version).committed.load(Ordering::Acquire));
                table.rows.data.write_row(entry.offset, &(*version).row);
                let older = (*version).next.load(Ordering::Acquire);
                if !older.is_null() {
                    (*older).prev.store(ptr::null_mut(), Ordering::Release);
                }
                table.unlatch(entry.offset, older as u64);
                table.alloc.deallocate(version);
            }
        }

        let peers = self.graph.abort(txn.node);

        for access in &txn.accesses {
            let entry = access.entry();
            self.tables[entry.table.0]
                .rows
                .rw_list(entry.offset)
                .erase(entry.position);
        }
        // Only now, with every token naming it gone, may the node be
        // retired.
        self.graph.retire_node(txn.node, &txn.guard);
        peers
    }

    fn detach_tokens(&self, txn: &MvTransaction<V>) {
        for access in &txn.accesses {
            let entry = access.entry();
            self.tables[entry.table.0]
                .rows
                .rw_list(entry.offset)
                .erase(entry.position);
        }
    }

    fn read_inner(
        &self,
        txn: &mut MvTransaction<V>,
        table: TableId,
        key: u64,
        column: Option<usize>,
    ) -> Result<Vec<V>, Error> {
        txn.check_active()?;
        if self.graph.needs_abort(txn.node) {
            return Err(self.abort_internal(txn));
        }
        let table_ref = self.table(table)?;
        let rows = &table_ref.rows;
        if let Some(column) = column {
            if column >= rows.data.width() {
                return Err(Error::NotFound);
            }
        }
        let offset = rows.lookup(key)?;

        let position = rows
            .rw_list(offset)
            .push_front(Token::encode(txn.id(), AccessKind::Read).raw());
        self.wait_for_turn(rows, offset, position);

        let mut cyclic = false;
        for (token_position, raw) in rows.rw_list(offset).iter(&txn.guard) {
            if token_position < position {
                let token = Token::from_raw(raw);
                if token.is_write()
                    && !self
                        .graph
                        .insert_and_check(txn.node, token.txn(), EdgeKind::Write)
                {
                    cyclic = true;
                }
            }
        }

        if cyclic {
            rows.rw_list(offset).erase(position);
            rows.publish_lsn(offset, position + 1);
            return Err(self.abort_internal(txn));
        }

        // Serializable transactions always read the live slots; the chain
        // only serves snapshot readers.
        let values = unsafe {
            match column {
                Some(column) => vec![rows.data.read(column, offset)],
                None => rows.data.read_row(offset),
            }
        };
        rows.publish_lsn(offset, position + 1);
        txn.accesses.push(MvAccess::Token(TokenEntry {
            table,
            offset,
            position,
        }));
        Ok(values)
    }
}

impl<V: Value> Coordinator<V> for MvEngine<V> {
    type Transaction = MvTransaction<V>;

    fn begin(&self) -> MvTransaction<V> {
        let guard = self.em.pin();
        let node = self.graph.create_node();
        Transaction::new(node, guard)
    }

    fn read(
        &self,
        txn: &mut MvTransaction<V>,
        table: TableId,
        key: u64,
        column: usize,
    ) -> Result<V, Error> {
        Ok(self.read_inner(txn, table, key, Some(column))?[0])
    }

    fn read_row(
        &self,
        txn: &mut MvTransaction<V>,
        table: TableId,
        key: u64,
    ) -> Result<Vec<V>, Error> {
        self.read_inner(txn, table, key, None)
    }

    fn write(
        &self,
        txn: &mut MvTransaction<V>,
        table: TableId,
        key: u64,
        column: usize,
        value: V,
    ) -> Result<(), Error> {
        txn.check_active()?;
        let table_ref = self.table(table)?;
        let rows = &table_ref.rows;
        if column >= rows.data.width() {
            return Err(Error::NotFound);
        }
        let offset = rows.lookup(key)?;

        loop {
            if self.graph.needs_abort(txn.node) {
                return Err(self.abort_internal(txn));
            }

            let position = rows
                .rw_list(offset)
                .push_front(Token::encode(txn.id(), AccessKind::Write).raw());
            self.wait_for_turn(rows, offset, position);

            // An earlier writer's token still on the list means its fate is
            // unresolved; induce the edge, then step back and retry until
            // the token disappears.
            let mut cyclic = false;
            let mut must_wait = false;
            let mut already_writing = false;
            for (token_position, raw) in rows.rw_list(offset).iter(&txn.guard) {
                if token_position >= position {
                    continue;
                }
                let token = Token::from_raw(raw);
                if token.is_write() {
                    if token.txn() != txn.id() {
                        if !self
                            .graph
                            .insert_and_check(txn.node, token.txn(), EdgeKind::Write)
                        {
                            cyclic = true;
                        }
                        must_wait = true;
                    } else {
                        already_writing = true;
                    }
                }
            }

            if cyclic {
                rows.rw_list(offset).erase(position);
                rows.publish_lsn(offset, position + 1);
                return Err(self.abort_internal(txn));
            }
            if must_wait {
                rows.rw_list(offset).erase(position);
                rows.publish_lsn(offset, position + 1);
                continue;
            }

            for (token_position, raw) in rows.rw_list(offset).iter(&txn.guard) {
                if token_position < position {
                    let token = Token::from_raw(raw);
                    let kind = match token.kind() {
                        AccessKind::Write => EdgeKind::Write,
                        AccessKind::Read => EdgeKind::Read,
                    };
                    if !self.graph.insert_and_check(txn.node, token.txn(), kind) {
                        cyclic = true;
                    }
                }
            }

            if cyclic {
                rows.rw_list(offset).erase(position);
                rows.publish_lsn(offset, position + 1);
                return Err(self.abort_internal(txn));
            }

            if !already_writing {
                // Splice the before-image at the head, uncommitted.
                let head = table_ref.latch(offset, false);
                let version = self.alloc.allocate::<Version<V>>();
                unsafe {
                    let image = rows.data.read_row(offset);
                    ptr::write(
                        version,
                        Version {
                            row: image,
                            txn: txn.id(),
                            epoch: AtomicU64::new(u64::MAX),
                            committed: AtomicBool::new(false),
                            prev: AtomicPtr::new(ptr::null_mut()),
                            next: AtomicPtr::new(head as *mut Version<V>),
                        },
                    );
                    if head != 0 {
                        (*(head as *mut Version<V>)).prev.store(version, Ordering::Release);
                    }
                }
                table_ref.unlatch(offset, version as u64);
                txn.accesses.push(MvAccess::Write {
                    entry: TokenEntry {
                        table,
                        offset,
                        position,
                    },
                    version,
                });
            } else {
                txn.accesses.push(MvAccess::Token(TokenEntry {
                    table,
                    offset,
                    position,
                }));
            }

            unsafe { rows.data.replace(column, offset, value) };
            rows.publish_lsn(offset, position + 1);
            return Ok(());
        }
    }

    fn commit(&self, mut txn: MvTransaction<V>) -> Verdict {
        if let Some(info) = txn.outcome.take() {
            return Verdict::Aborted { peers: info.peers };
        }
        let mut iterations: u32 = 0;
        loop {
            if self.graph.needs_abort(txn.node) {
                let peers = self.run_abort(&mut txn);
                return Verdict::Aborted { peers };
            }
            if self.graph.check_committed(txn.node) {
                break;
            }
            iterations = iterations.saturating_add(1);
            if iterations >= self.config.spin_yield {
                std::thread::yield_now();
            }
        }

        let writes: Vec<(usize, u64, *mut Version<V>)> = txn
            .accesses
            .iter()
            .filter_map(|access| match access {
                MvAccess::Write { entry, version } => {
                    Some((entry.table.0, entry.offset, *version))
                }
                MvAccess::Token(_) => None,
            })
            .collect();

        // Stamp every shadowed image before the epoch becomes readable, so
        // snapshots see all of this transaction's writes or none.
        let epoch = self.epochs.commit_with(|epoch| {
            for &(table_index, offset, version) in &writes {
                let table = &self.tables[table_index];
                let head = table.latch(offset, false);
                unsafe {
                    debug_assert_eq!(head, version as u64);
                    (*version).epoch.store(epoch, Ordering::Release);
                    (*version).committed.store(true, Ordering::Release);
                }
                table.unlatch(offset, head);
            }
        });

        for (table_index, offset, version) in writes {
            let table = Arc::clone(&self.tables[table_index]);
            let version_addr = version as usize;
            self.epochs.defer_unlink(
                epoch,
                Box::new(move || {
                    MvTable::unlink_version(&table, offset, version_addr as *mut Version<V>);
                }),
            );
        }

        self.detach_tokens(&txn);
        self.graph.retire_node(txn.node, &txn.guard);
        Verdict::Committed
    }

    fn abort(&self, mut txn: MvTransaction<V>) -> Verdict {
        if let Some(info) = txn.outcome.take() {
            return Verdict::Aborted { peers: info.peers };
        }
        let peers = self.run_abort(&mut txn);
        Verdict::Aborted { peers }
    }

    fn insert_row(&self, table: TableId, key: u64, row: &[V]) -> Result<u64, Error> {
        self.table(table)?.append_row(key, row)
    }

    fn table_id(&self, name: &str) -> Option<TableId> {
        self.tables
            .iter()
            .position(|table| table.rows.name == name)
            .map(TableId)
    }
}

/// Read-only snapshot pinned at a safe-read epoch. Holding it pins the
/// reclamation horizon: no before-image it may still need is unlinked
/// while it lives.
pub struct Snapshot<'e, V: Value> {
    engine: &'e MvEngine<V>,
    guard: SnapshotGuard<'e>,
}

impl<'e, V: Value> Snapshot<'e, V> {
    pub fn epoch(&self) -> u64 {
        self.guard.epoch()
    }

    pub fn read(&self, table: TableId, key: u64, column: usize) -> Result<V, Error> {
        let row = self.read_row(table, key)?;
        row.get(column).copied().ok_or(Error::NotFound)
    }

    pub fn read_row(&self, table: TableId, key: u64) -> Result<Vec<V>, Error> {
        let table = self.engine.table(table)?;
        let offset = table.rows.lookup(key)?;
        Ok(table.snapshot_row(offset, self.guard.epoch()))
    }

    /// Iterates `(offset, row)` for every row whose snapshot image passes
    /// the predicate. Rows still mid-append are skipped.
    pub fn scan<P>(&self, table: TableId, predicate: P) -> Result<ScanIter<'_, V, P>, Error>
    where
        P: FnMut(&[V]) -> bool,
    {
        let table = self.engine.table(table)?;
        Ok(ScanIter {
            table,
            epoch: self.guard.epoch(),
            offset: 0,
            predicate,
        })
    }
}

pub struct ScanIter<'s, V: Value, P> {
    table: &'s Arc<MvTable<V>>,
    epoch: u64,
    offset: u64,
    predicate: P,
}

impl<V: Value, P: FnMut(&[V]) -> bool> Iterator for ScanIter<'_, V, P> {
    type Item = (u64, Vec<V>);

    fn next(&mut self) -> Option<Self::Item> {
        while self.offset < self.table.rows.row_count() {
            let offset = self.offset;
            self.offset += 1;
            if !self.table.rows.rw.is_alive(offset) {
                continue;
            }
            let row = self.table.snapshot_row(offset, self.epoch);
            if (self.predicate)(&row) {
                return Some((offset, row));
            }
        }
        None
    }
}
