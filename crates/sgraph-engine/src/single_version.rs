// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Single-version coordinator: rows live only in their column slots, undo
//! is a per-write old-value log, and every access is serialized through
//! the row's ordering list before it induces graph edges.

use crate::{
    access::{spin_until, AccessKind, Token},
    config::{EngineConfig, TableSchema},
    coordinator::{AbortInfo, Coordinator, Transaction},
    error::{Error, Verdict},
    graph::{EdgeKind, SerializationGraph},
    store::{RowStore, TableId, TokenEntry, Value},
};
use sgraph_collections::ChunkAllocator;
use sgraph_epoch::EpochManager;
use std::{collections::HashSet, sync::Arc};

pub enum SvAccess<V> {
    /// A token to detach at the end: reads, and restore-writes issued
    /// during abort.
    Token(TokenEntry),
    Write {
        entry: TokenEntry,
        column: usize,
        old: V,
    },
}

impl<V> SvAccess<V> {
    fn entry(&self) -> TokenEntry {
        match self {
            SvAccess::Token(entry) => *entry,
            SvAccess::Write { entry, .. } => *entry,
        }
    }
}

pub type SvTransaction<V> = Transaction<SvAccess<V>>;

/// Serializable engine over single-version rows.
pub struct SvEngine<V: Value> {
    config: EngineConfig,
    graph: SerializationGraph,
    pub(crate) tables: Box<[RowStore<V>]>,
    em: Arc<EpochManager>,
    alloc: Arc<ChunkAllocator>,
}

impl<V: Value> SvEngine<V> {
    pub fn new(config: EngineConfig, schemas: &[TableSchema]) -> Self {
        let alloc = Arc::new(ChunkAllocator::new());
        let em = Arc::new(EpochManager::new());
        let tables = schemas
            .iter()
            .map(|schema| {
                RowStore::new(
                    schema.name.clone(),
                    schema.columns,
                    config.table_capacity,
                    Arc::clone(&alloc),
                    Arc::clone(&em),
                )
            })
            .collect();
        let graph = SerializationGraph::new(Arc::clone(&alloc), Arc::clone(&em));
        log::info!(
            "single-version engine up: {} table(s), capacity {}",
            schemas.len(),
            config.table_capacity
        );
        Self {
            config,
            graph,
            tables,
            em,
            alloc,
        }
    }

    fn store(&self, table: TableId) -> Result<&RowStore<V>, Error> {
        self.tables.get(table.0).ok_or(Error::NotFound)
    }

    fn wait_for_turn(&self, store: &RowStore<V>, offset: u64, position: u64) {
        if position > 0 {
            spin_until(self.config.spin_yield, || store.lsn_reached(offset, position));
        }
    }

    /// Runs the internal abort path and returns the error to surface.
    fn abort_internal(&self, txn: &mut SvTransaction<V>) -> Error {
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

    /// Restores written slots newest-first through the write protocol (so
    /// slot access stays serialized), unlinks the graph node, detaches
    /// tokens.
    fn run_abort(&self, txn: &mut SvTransaction<V>) -> HashSet<u64> {
        let restores: Vec<(TokenEntry, usize, V)> = txn
            .accesses
            .iter()
            .rev()
            .filter_map(|access| match access {
                SvAccess::Write { entry, column, old } => Some((*entry, *column, *old)),
                SvAccess::Token(_) => None,
            })
            .collect();
        for (entry, column, old) in restores {
            let store = &self.tables[entry.table.0];
            let position = self.restore_write(store, entry.offset, column, old, txn.id());
            txn.accesses.push(SvAccess::Token(TokenEntry {
                table: entry.table,
                offset: entry.offset,
                position,
            }));
        }

        let peers = self.graph.abort(txn.node);

        for access in &txn.accesses {
            let entry = access.entry();
            self.tables[entry.table.0]
                .rw_list(entry.offset)
                .erase(entry.position);
        }
        // Only now, with every token naming it gone, may the node be
        // retired.
        self.graph.retire_node(txn.node, &txn.guard);
        peers
    }

    /// Undo write: token append and lsn publication without edge
    /// induction.
    fn restore_write(
        &self,
        store: &RowStore<V>,
        offset: u64,
        column: usize,
        old: V,
        txn_id: u64,
    ) -> u64 {
        let position = store
            .rw_list(offset)
            .push_front(Token::encode(txn_id, AccessKind::Write).raw());
        self.wait_for_turn(store, offset, position);
        unsafe { store.data.replace(column, offset, old) };
        store.publish_lsn(offset, position + 1);
        position
    }

    fn detach_tokens(&self, txn: &SvTransaction<V>) {
        for access in &txn.accesses {
            let entry = access.entry();
            self.tables[entry.table.0]
                .rw_list(entry.offset)
                .erase(entry.position);
        }
    }

    fn read_inner(
        &self,
        txn: &mut SvTransaction<V>,
        table: TableId,
        key: u64,
        column: Option<usize>,
    ) -> Result<Vec<V>, Error> {
        txn.check_active()?;
        let store = self.store(table)?;
        if let Some(column) = column {
            if column >= store.data.width() {
                return Err(Error::NotFound);
            }
        }
        let offset = store.lookup(key)?;

        let position = store
            .rw_list(offset)
            .push_front(Token::encode(txn.id(), AccessKind::Read).raw());
        self.wait_for_turn(store, offset, position);

        let mut cyclic = false;
        for (token_position, raw) in store.rw_list(offset).iter(&txn.guard) {
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
            store.rw_list(offset).erase(position);
            store.publish_lsn(offset, position + 1);
            return Err(self.abort_internal(txn));
        }

        let values = unsafe {
            match column {
                Some(column) => vec![store.data.read(column, offset)],
                None => store.data.read_row(offset),
            }
        };
        store.publish_lsn(offset, position + 1);
        txn.accesses.push(SvAccess::Token(TokenEntry {
            table,
            offset,
            position,
        }));
        Ok(values)
    }
}

impl<V: Value> Coordinator<V> for SvEngine<V> {
    type Transaction = SvTransaction<V>;

    fn begin(&self) -> SvTransaction<V> {
        let guard = self.em.pin();
        let node = self.graph.create_node();
        Transaction::new(node, guard)
    }

    fn read(
        &self,
        txn: &mut SvTransaction<V>,
        table: TableId,
        key: u64,
        column: usize,
    ) -> Result<V, Error> {
        Ok(self.read_inner(txn, table, key, Some(column))?[0])
    }

    fn read_row(
        &self,
        txn: &mut SvTransaction<V>,
        table: TableId,
        key: u64,
    ) -> Result<Vec<V>, Error> {
        self.read_inner(txn, table, key, None)
    }

    fn write(
        &self,
        txn: &mut SvTransaction<V>,
        table: TableId,
        key: u64,
        column: usize,
        value: V,
    ) -> Result<(), Error> {
        txn.check_active()?;
        let store = self.store(table)?;
        if column >= store.data.width() {
            return Err(Error::NotFound);
        }
        let offset = store.lookup(key)?;

        loop {
            if self.graph.needs_abort(txn.node) {
                return Err(self.abort_internal(txn));
            }

            let position = store
                .rw_list(offset)
                .push_front(Token::encode(txn.id(), AccessKind::Write).raw());
            self.wait_for_turn(store, offset, position);

            // Delay behind earlier uncommitted writers so write-write
            // conflicts stay serializable in the graph.
            let mut cyclic = false;
            let mut must_wait = false;
            for (token_position, raw) in store.rw_list(offset).iter(&txn.guard) {
                if token_position >= position {
                    continue;
                }
                let token = Token::from_raw(raw);
                if token.is_write()
                    && token.txn() != txn.id()
                    && !self.graph.is_committed(token.txn())
                {
                    if !self
                        .graph
                        .insert_and_check(txn.node, token.txn(), EdgeKind::Write)
                    {
                        cyclic = true;
                    }
                    must_wait = true;
                }
            }

            if cyclic {
                store.rw_list(offset).erase(position);
                store.publish_lsn(offset, position + 1);
                return Err(self.abort_internal(txn));
            }
            if must_wait {
                store.rw_list(offset).erase(position);
                store.publish_lsn(offset, position + 1);
                continue;
            }

            for (token_position, raw) in store.rw_list(offset).iter(&txn.guard) {
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
                store.rw_list(offset).erase(position);
                store.publish_lsn(offset, position + 1);
                return Err(self.abort_internal(txn));
            }

            let old = unsafe { store.data.replace(column, offset, value) };
            store.publish_lsn(offset, position + 1);
            txn.accesses.push(SvAccess::Write {
                entry: TokenEntry {
                    table,
                    offset,
                    position,
                },
                column,
                old,
            });
            return Ok(());
        }
    }

    fn commit(&self, mut txn: SvTransaction<V>) -> Verdict {
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
        self.detach_tokens(&txn);
        self.graph.retire_node(txn.node, &txn.guard);
        Verdict::Committed
    }

    fn abort(&self, mut txn: SvTransaction<V>) -> Verdict {
        if let Some(info) = txn.outcome.take() {
            return Verdict::Aborted { peers: info.peers };
        }
        let peers = self.run_abort(&mut txn);
        Verdict::Aborted { peers }
    }

    fn insert_row(&self, table: TableId, key: u64, row: &[V]) -> Result<u64, Error> {
        self.store(table)?.append_row(key, row)
    }

    fn table_id(&self, name: &str) -> Option<TableId> {
        self.tables
            .iter()
            .position(|store| store.name == name)
            .map(TableId)
    }
}
