// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use sgraph_collections::CapacityExhausted;
use std::collections::HashSet;
use thiserror::Error;

/// Transaction ids are the addresses of live serialization-graph nodes;
/// outside the engine they are opaque.
pub type TxnId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Admitting the access would close a cycle in the serialization graph.
    /// The transaction has already been aborted when this is returned.
    #[error("access would close a serialization cycle")]
    CycleDetected,

    /// A predecessor this transaction depends on through a write edge has
    /// aborted; this transaction has been aborted as well.
    #[error("cascading abort through transaction {through:#x}")]
    CascadingAbort { through: TxnId },

    /// Key or column not present; the transaction stays active.
    #[error("key not found")]
    NotFound,

    /// A structure with configured capacity is full. Fatal: engine state is
    /// undefined afterwards.
    #[error("{0}")]
    CapacityExhausted(#[from] CapacityExhausted),
}

/// Outcome of [`commit`](crate::coordinator::Coordinator::commit) /
/// [`abort`](crate::coordinator::Coordinator::abort).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Committed,
    /// Aborted, with the ids of peer transactions linked into the abort
    /// (write-dependency sources and the abort-through id, if any), for
    /// caller-side backoff.
    Aborted { peers: HashSet<TxnId> },
}

impl Verdict {
    pub fn is_committed(&self) -> bool {
        matches!(self, Verdict::Committed)
    }
}
