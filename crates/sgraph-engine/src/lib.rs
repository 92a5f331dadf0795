// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Main-memory, column-oriented transactional engine certified by an
//! online serialization graph.
//!
//! Two interchangeable coordinators share one data plane: per-row
//! ordering lists assigning monotonic position ids, and a conflict graph
//! with cycle detection on every edge admission:
//!
//! - [`SvEngine`]: single-version rows with old-value undo logs.
//! - [`MvEngine`]: the same protocol plus per-row before-image chains,
//!   which buy read-only snapshot queries ([`MvEngine::snapshot`]) and
//!   write-write decoupling from snapshot readers.
//!
//! A commit aborts a transaction only when a real cycle (or a cascading
//! abort through a write dependency) exists, never speculatively.
//!
//! ```
//! use sgraph_engine::{Coordinator, EngineConfig, SvEngine, TableSchema};
//!
//! let config = EngineConfig {
//!     table_capacity: 1 << 10,
//!     ..EngineConfig::default()
//! };
//! let engine: SvEngine<u64> = SvEngine::new(config, &[TableSchema::new("accounts", 2)]);
//! let accounts = engine.table_id("accounts").unwrap();
//! engine.insert_row(accounts, 7, &[100, 0]).unwrap();
//!
//! let mut txn = engine.begin();
//! let balance = engine.read(&mut txn, accounts, 7, 0).unwrap();
//! engine.write(&mut txn, accounts, 7, 0, balance + 1).unwrap();
//! assert!(engine.commit(txn).is_committed());
//! ```

mod access;
mod config;
mod coordinator;
mod error;
mod graph;
mod multi_version;
mod single_version;
mod store;


pub use access::{AccessKind, Token};
pub use config::{EngineConfig, TableSchema};
pub use coordinator::{Coordinator, Transaction};
pub use error::{Error, TxnId, Verdict};
pub use graph::EdgeKind;
pub use multi_version::{MvEngine, MvTransaction, ScanIter, Snapshot};
pub use single_version::{SvEngine, SvTransaction};
pub use store::{TableId, Value};
