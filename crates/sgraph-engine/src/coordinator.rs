// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The uniform data-plane contract both concurrency-control protocols
//! implement, and the per-transaction state they thread through it.

use crate::{
    error::{Error, TxnId, Verdict},
    graph::NodeRef,
    store::{TableId, Value},
};
use crossbeam::epoch::Guard;
use std::collections::HashSet;

pub(crate) struct AbortInfo {
    pub(crate) error: Error,
    pub(crate) peers: HashSet<TxnId>,
}

/// In-flight transaction state: the graph node, the epoch guard covering
/// every pointer the transaction may dereference, the access log used for
/// undo and token detach, and the abort outcome once one exists.
///
/// One transaction at a time per thread; the handle is not `Send`.
pub struct Transaction<Acc> {
    pub(crate) node: NodeRef,
    pub(crate) guard: Guard,
    pub(crate) accesses: Vec<Acc>,
    pub(crate) outcome: Option<AbortInfo>,
}

impl<Acc> Transaction<Acc> {
    pub(crate) fn new(node: NodeRef, guard: Guard) -> Self {
        Self {
            node,
            guard,
            accesses: Vec::new(),
            outcome: None,
        }
    }

    pub fn id(&self) -> TxnId {
        self.node.id()
    }

    /// Fails with the recorded abort error once the transaction is dead.
    pub(crate) fn check_active(&self) -> Result<(), Error> {
        match &self.outcome {
            None => Ok(()),
            Some(info) => Err(info.error.clone()),
        }
    }
}

/// Operations shared by the single- and multi-version coordinators.
///
/// `read`/`write` abort the transaction internally on a conflict and
/// surface the cause; `commit` and `abort` consume the handle and report
/// the final verdict with any cascaded peer ids.
pub trait Coordinator<V: Value> {
    type Transaction;

    fn begin(&self) -> Self::Transaction;

    fn read(
        &self,
        txn: &mut Self::Transaction,
        table: TableId,
        key: u64,
        column: usize,
    ) -> Result<V, Error>;

    /// All columns of a row under a single access token.
    fn read_row(&self, txn: &mut Self::Transaction, table: TableId, key: u64)
        -> Result<Vec<V>, Error>;

    fn write(
        &self,
        txn: &mut Self::Transaction,
        table: TableId,
        key: u64,
        column: usize,
        value: V,
    ) -> Result<(), Error>;

    fn commit(&self, txn: Self::Transaction) -> Verdict;

    fn abort(&self, txn: Self::Transaction) -> Verdict;

    /// Non-transactional row append (load phase or externally serialized).
    fn insert_row(&self, table: TableId, key: u64, row: &[V]) -> Result<u64, Error>;

    fn table_id(&self, name: &str) -> Option<TableId>;
}
