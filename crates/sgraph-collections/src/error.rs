// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// A structure with a capacity fixed at construction is full.
///
/// The engine treats this as fatal: the structure itself stays usable for
/// readers, but the caller must assume the enclosing engine can no longer
/// make progress.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("capacity exhausted: {structure} is full at {limit} entries")]
pub struct CapacityExhausted {
    pub structure: &'static str,
    pub limit: u64,
}
