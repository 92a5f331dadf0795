// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Engine-wide limits, fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum rows per table; bounds the column vectors and the key map.
    pub table_capacity: u64,
    /// Concurrently live read-only snapshots (multi-version engine).
    pub snapshot_slots: usize,
    /// Spin iterations before a bounded wait yields to the OS.
    pub spin_yield: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            table_capacity: 1 << 20,
            snapshot_slots: num_cpus::get(),
            spin_yield: 10_000,
        }
    }
}

/// Shape of one table: a name and a number of uniformly typed columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: usize,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: usize) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }
}
